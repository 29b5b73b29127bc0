use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

/// Link from a per-VM child job to its synthetic-full parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLink {
    pub child_job_id: String,
    pub parent_job_id: String,
    pub linked_at: String,
}

fn row_to_link(row: &Row) -> rusqlite::Result<JobLink> {
    Ok(JobLink {
        child_job_id: row.get("child_job_id")?,
        parent_job_id: row.get("parent_job_id")?,
        linked_at: row.get("linked_at")?,
    })
}

pub fn find_by_child(conn: &Connection, child_job_id: &str) -> anyhow::Result<Option<JobLink>> {
    let mut stmt = conn.prepare("SELECT * FROM job_links WHERE child_job_id = ?")?;
    let mut rows = stmt.query_map(params![child_job_id], |row| row_to_link(row))?;
    Ok(rows.next().transpose()?)
}

/// Insert or re-point a link. A child belongs to exactly one parent.
pub fn upsert(conn: &Connection, child_job_id: &str, parent_job_id: &str) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO job_links (child_job_id, parent_job_id, linked_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(child_job_id) DO UPDATE SET parent_job_id = excluded.parent_job_id, linked_at = excluded.linked_at",
        params![child_job_id, parent_job_id, now],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::SCHEMA;

    #[test]
    fn test_upsert_repoints_child() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();

        upsert(&conn, "101", "100").unwrap();
        upsert(&conn, "102", "100").unwrap();
        assert_eq!(find_by_child(&conn, "102").unwrap().unwrap().parent_job_id, "100");

        upsert(&conn, "102", "200").unwrap();
        assert_eq!(find_by_child(&conn, "102").unwrap().unwrap().parent_job_id, "200");
        assert_eq!(find_by_child(&conn, "101").unwrap().unwrap().parent_job_id, "100");
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM job_links", [], |r| r.get(0)).unwrap();
        assert_eq!(rows, 2);
        assert!(find_by_child(&conn, "999").unwrap().is_none());
    }
}
