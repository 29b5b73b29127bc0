//! In-memory metadata store.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cbt::ChangeRecord;
use crate::model::BackupKind;
use crate::sdk::MetadataStore;
use crate::utils::errors::Result;

/// Metadata kept in process memory. Used by the simulator and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<String, Vec<ChangeRecord>>,
    links: DashMap<String, String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn append_change_record(&self, record: &ChangeRecord) -> Result<()> {
        self.records.entry(record.vm.clone()).or_default().push(record.clone());
        Ok(())
    }

    async fn change_records(&self, vm: &str) -> Result<Vec<ChangeRecord>> {
        Ok(self.records.get(vm).map(|r| r.value().clone()).unwrap_or_default())
    }

    async fn last_job(&self, vm: &str, kind: BackupKind) -> Result<Option<String>> {
        Ok(self.records.get(vm).and_then(|records| {
            records
                .iter()
                .rev()
                .find(|r| r.backup_kind == kind)
                .map(|r| r.job_id.clone())
        }))
    }

    async fn link_job(&self, child_job_id: &str, parent_job_id: &str) -> Result<()> {
        self.links.insert(child_job_id.to_string(), parent_job_id.to_string());
        Ok(())
    }

    async fn parent_of(&self, child_job_id: &str) -> Result<Option<String>> {
        Ok(self.links.get(child_job_id).map(|p| p.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_last_job_by_kind() {
        let store = InMemoryStore::new();
        store
            .append_change_record(&ChangeRecord::new("vm1", "d1", BackupKind::Full, "10", "A"))
            .await
            .unwrap();
        store
            .append_change_record(&ChangeRecord::new("vm1", "d1", BackupKind::Incremental, "11", "B").consuming("A"))
            .await
            .unwrap();
        store
            .append_change_record(&ChangeRecord::new("vm1", "d1", BackupKind::Incremental, "12", "C").consuming("B"))
            .await
            .unwrap();

        assert_eq!(store.last_job("vm1", BackupKind::Full).await.unwrap().as_deref(), Some("10"));
        assert_eq!(store.last_job("vm1", BackupKind::Incremental).await.unwrap().as_deref(), Some("12"));
        assert_eq!(store.last_job("vm2", BackupKind::Full).await.unwrap(), None);
        assert_eq!(store.change_records("vm1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_job_links() {
        let store = InMemoryStore::new();
        assert_eq!(store.parent_of("21").await.unwrap(), None);
        store.link_job("21", "20").await.unwrap();
        assert_eq!(store.parent_of("21").await.unwrap().as_deref(), Some("20"));
    }
}
