use crate::db::connection::DbPool;
use rusqlite::Connection;
use std::fs;
use std::path::Path;

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS change_records (
  id TEXT PRIMARY KEY,
  vm TEXT NOT NULL,
  disk TEXT NOT NULL,
  job_id TEXT NOT NULL,
  backup_kind TEXT NOT NULL CHECK(backup_kind IN ('full','incremental','differential','synthetic_full')),
  change_id TEXT NOT NULL,
  consumed TEXT,
  recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_links (
  child_job_id TEXT PRIMARY KEY,
  parent_job_id TEXT NOT NULL,
  linked_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_change_records_vm ON change_records(vm, recorded_at);
CREATE INDEX IF NOT EXISTS idx_job_links_parent ON job_links(parent_job_id);
"#;

fn has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(columns.iter().any(|c| c == column))
}

pub fn migrate(pool: &DbPool, data_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    fs::create_dir_all(data_dir)?;

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // job_links rows written before link times were kept
    if !has_column(&conn, "job_links", "linked_at")? {
        conn.execute_batch("ALTER TABLE job_links ADD COLUMN linked_at TEXT NOT NULL DEFAULT ''")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
