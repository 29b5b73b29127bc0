use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;
use vsa_orchestrator::cbt::ChangeRecord;
use vsa_orchestrator::model::BackupKind;

fn conversion_error(column: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn row_to_record(row: &Row) -> rusqlite::Result<ChangeRecord> {
    let kind: String = row.get("backup_kind")?;
    let recorded_at: String = row.get("recorded_at")?;
    Ok(ChangeRecord {
        vm: row.get("vm")?,
        disk: row.get("disk")?,
        job_id: row.get("job_id")?,
        backup_kind: kind.parse::<BackupKind>().map_err(|e| conversion_error(4, e))?,
        change_id: row.get("change_id")?,
        consumed: row.get("consumed")?,
        recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(7, e))?,
    })
}

/// Records for one VM in the order they were taken.
pub fn find_by_vm(conn: &Connection, vm: &str) -> anyhow::Result<Vec<ChangeRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM change_records WHERE vm = ? ORDER BY recorded_at, rowid")?;
    let rows = stmt.query_map(params![vm], |row| row_to_record(row))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_last_job(conn: &Connection, vm: &str, kind: BackupKind) -> anyhow::Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT job_id FROM change_records WHERE vm = ? AND backup_kind = ? ORDER BY recorded_at DESC, rowid DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![vm, kind.as_str()], |row| row.get::<_, String>(0))?;
    Ok(rows.next().transpose()?)
}

pub fn insert(conn: &Connection, record: &ChangeRecord) -> anyhow::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO change_records (id, vm, disk, job_id, backup_kind, change_id, consumed, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            record.vm,
            record.disk,
            record.job_id,
            record.backup_kind.as_str(),
            record.change_id,
            record.consumed,
            record.recorded_at.to_rfc3339(),
        ],
    )?;
    Ok(id)
}
