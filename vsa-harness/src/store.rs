//! SQLite-backed metadata store.

use async_trait::async_trait;
use rusqlite::Connection;
use vsa_orchestrator::cbt::ChangeRecord;
use vsa_orchestrator::model::BackupKind;
use vsa_orchestrator::sdk::MetadataStore;
use vsa_orchestrator::{EngineError, Result};

use crate::db::connection::DbPool;
use crate::models::{change_record, job_link};

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Run a blocking query on a pooled connection.
    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| EngineError::Metadata(format!("{op}: {e}")))?
        .map_err(|e| {
            tracing::warn!(op, error = %e, "Metadata query failed");
            EngineError::Metadata(format!("{op}: {e:#}"))
        })
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn append_change_record(&self, record: &ChangeRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn("append change record", move |conn| {
            change_record::insert(conn, &record)?;
            Ok(())
        })
        .await
    }

    async fn change_records(&self, vm: &str) -> Result<Vec<ChangeRecord>> {
        let vm = vm.to_string();
        self.with_conn("load change records", move |conn| change_record::find_by_vm(conn, &vm))
            .await
    }

    async fn last_job(&self, vm: &str, kind: BackupKind) -> Result<Option<String>> {
        let vm = vm.to_string();
        self.with_conn("find last job", move |conn| change_record::find_last_job(conn, &vm, kind))
            .await
    }

    async fn link_job(&self, child_job_id: &str, parent_job_id: &str) -> Result<()> {
        let child = child_job_id.to_string();
        let parent = parent_job_id.to_string();
        self.with_conn("link job", move |conn| job_link::upsert(conn, &child, &parent))
            .await
    }

    async fn parent_of(&self, child_job_id: &str) -> Result<Option<String>> {
        let child = child_job_id.to_string();
        self.with_conn("find parent job", move |conn| {
            Ok(job_link::find_by_child(conn, &child)?.map(|link| link.parent_job_id))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;

    #[tokio::test]
    async fn test_records_survive_new_store() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("vsa.db");
        let pool = create_pool(&db_path.to_string_lossy()).unwrap();
        migrate(&pool, dir.path()).unwrap();

        let store = SqliteStore::new(pool.clone());
        store
            .append_change_record(&ChangeRecord::new("vm1", "d1", BackupKind::Full, "10", "A"))
            .await
            .unwrap();
        store.link_job("11", "20").await.unwrap();

        let reopened = SqliteStore::new(create_pool(&db_path.to_string_lossy()).unwrap());
        assert_eq!(reopened.change_records("vm1").await.unwrap().len(), 1);
        assert_eq!(reopened.last_job("vm1", BackupKind::Full).await.unwrap().as_deref(), Some("10"));
        assert_eq!(reopened.parent_of("11").await.unwrap().as_deref(), Some("20"));
        assert_eq!(reopened.parent_of("12").await.unwrap(), None);
    }
}
