//! Changed-block-tracking validation.
//!
//! Every backup records, per disk, the change identifier it produced and the
//! one it consumed. A chain starts at a FULL backup. For each later job the
//! consumed identifier must equal the one produced by its baseline:
//!
//! * INCREMENTAL: the most recent prior FULL/INCREMENTAL/DIFFERENTIAL record
//! * DIFFERENTIAL: the chain's FULL
//!
//! Synthetic fulls are recorded but never act as a baseline since they do not
//! read the source VM.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::model::BackupKind;
use crate::sdk::{CbtStatus, HypervisorSdk};
use crate::utils::errors::{EngineError, Result};
use crate::utils::poll::poll_until;

/// Controller-slot prefix some platforms put in front of disk names.
#[allow(clippy::expect_used)]
static SLOT_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(scsi|ide|sata|nvme)\d+-\d+-").expect("constant regex pattern is valid"));

/// Placeholder used in errors when no baseline exists.
pub const NO_BASELINE: &str = "<no baseline>";

/// Placeholder used in errors when a job consumed nothing.
pub const NOTHING_CONSUMED: &str = "<none>";

/// Strip a controller-slot prefix (`scsi0-1-`, `ide1-0-`, `nvme0-0-`) so
/// disk keys compare equal across platform naming schemes.
pub fn normalize_disk_key(disk: &str) -> String {
    SLOT_PREFIX.replace(disk, "").into_owned()
}

/// One disk's change identifiers for one backup job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub vm: String,
    /// Normalized disk key
    pub disk: String,
    pub job_id: String,
    pub backup_kind: BackupKind,
    /// Identifier produced by this job
    pub change_id: String,
    /// Identifier this job read changes from
    #[serde(default)]
    pub consumed: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(
        vm: impl Into<String>,
        disk: &str,
        backup_kind: BackupKind,
        job_id: impl Into<String>,
        change_id: impl Into<String>,
    ) -> Self {
        Self {
            vm: vm.into(),
            disk: normalize_disk_key(disk),
            job_id: job_id.into(),
            backup_kind,
            change_id: change_id.into(),
            consumed: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn consuming(mut self, consumed: impl Into<String>) -> Self {
        self.consumed = Some(consumed.into());
        self
    }
}

/// Baseline state of one disk chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainState {
    NoBaseline,
    HasBaseline(String),
}

#[derive(Debug, Default)]
struct Chain {
    records: Vec<ChangeRecord>,
    /// Identifiers produced by chains that a FULL has since replaced
    superseded: HashSet<String>,
}

impl Chain {
    fn baseline_for(&self, index: usize) -> Option<&ChangeRecord> {
        let record = &self.records[index];
        let prior = &self.records[..index];
        match record.backup_kind {
            BackupKind::Incremental => prior
                .iter()
                .rev()
                .find(|r| r.backup_kind != BackupKind::SyntheticFull),
            BackupKind::Differential => prior.iter().find(|r| r.backup_kind == BackupKind::Full),
            BackupKind::Full | BackupKind::SyntheticFull => None,
        }
    }
}

/// In-memory per-disk chain state.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    chains: HashMap<(String, String), Chain>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the chains of `vms` with persisted records, in recording
    /// order. Chains of other VMs are left as they are.
    pub fn reload<I>(&mut self, vms: &[String], records: I) -> usize
    where
        I: IntoIterator<Item = ChangeRecord>,
    {
        self.chains.retain(|(vm, _), _| !vms.contains(vm));
        let mut count = 0usize;
        for record in records.into_iter().filter(|r| vms.contains(&r.vm)) {
            self.record(record);
            count += 1;
        }
        debug!(vms = vms.len(), records = count, "Reloaded change records");
        count
    }

    /// Append a record. A FULL starts a new chain and supersedes every
    /// identifier the old chain produced.
    pub fn record(&mut self, mut record: ChangeRecord) {
        record.disk = normalize_disk_key(&record.disk);
        let chain = self.chains.entry((record.vm.clone(), record.disk.clone())).or_default();

        if record.backup_kind == BackupKind::Full {
            let old = std::mem::take(&mut chain.records);
            if !old.is_empty() {
                debug!(vm = %record.vm, disk = %record.disk, superseded = old.len(), "Resetting CBT chain");
            }
            chain.superseded.extend(old.into_iter().map(|r| r.change_id));
        }

        chain.records.push(record);
    }

    pub fn state(&self, vm: &str, disk: &str) -> ChainState {
        self.chains
            .get(&(vm.to_string(), normalize_disk_key(disk)))
            .and_then(|chain| {
                chain
                    .records
                    .iter()
                    .rev()
                    .find(|r| r.backup_kind != BackupKind::SyntheticFull)
            })
            .map(|r| ChainState::HasBaseline(r.change_id.clone()))
            .unwrap_or(ChainState::NoBaseline)
    }

    pub fn records(&self, vm: &str, disk: &str) -> &[ChangeRecord] {
        self.chains
            .get(&(vm.to_string(), normalize_disk_key(disk)))
            .map(|chain| chain.records.as_slice())
            .unwrap_or(&[])
    }

    /// Check the most recent `backup_kind` record on a disk against its
    /// baseline. FULL and SYNTHETIC_FULL records always pass.
    pub fn verify(&self, vm: &str, disk: &str, backup_kind: BackupKind) -> Result<()> {
        if !backup_kind.consumes_change_id() {
            return Ok(());
        }

        let key = normalize_disk_key(disk);
        let chain = self
            .chains
            .get(&(vm.to_string(), key.clone()))
            .ok_or_else(|| EngineError::CbtValidation {
                vm: vm.to_string(),
                disk: key.clone(),
                expected: NO_BASELINE.to_string(),
                actual: NOTHING_CONSUMED.to_string(),
                stale: false,
            })?;

        let index = chain
            .records
            .iter()
            .rposition(|r| r.backup_kind == backup_kind)
            .ok_or_else(|| EngineError::InvalidRequest(format!("no {backup_kind} record for VM {vm} disk {key}")))?;

        let record = &chain.records[index];
        let baseline = chain.baseline_for(index);
        let consumed = record.consumed.as_deref();

        match (baseline, consumed) {
            (Some(base), Some(actual)) if base.change_id == actual => {
                debug!(vm, disk = %key, job_id = %record.job_id, change_id = actual, "CBT baseline matched");
                Ok(())
            }
            _ => {
                let expected = baseline.map_or(NO_BASELINE, |b| b.change_id.as_str());
                let actual = consumed.unwrap_or(NOTHING_CONSUMED);
                let stale = consumed.is_some_and(|c| chain.superseded.contains(c));
                warn!(
                    vm,
                    disk = %key,
                    job_id = %record.job_id,
                    expected,
                    actual,
                    stale,
                    "CBT change identifier mismatch"
                );
                Err(EngineError::CbtValidation {
                    vm: vm.to_string(),
                    disk: key,
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                    stale,
                })
            }
        }
    }
}

/// Expected CBT status after a backup of the given kind.
pub fn expected_cbt_status(kind: BackupKind) -> Option<CbtStatus> {
    match kind {
        BackupKind::Full => Some(CbtStatus::Enabled),
        BackupKind::Incremental | BackupKind::Differential => Some(CbtStatus::Used),
        BackupKind::SyntheticFull => None,
    }
}

/// Check the CBT status the SDK reports for a VM after a backup job.
pub async fn check_cbt_status(sdk: &dyn HypervisorSdk, job_id: &str, vm: &str, kind: BackupKind) -> Result<()> {
    let Some(expected) = expected_cbt_status(kind) else {
        return Ok(());
    };

    let actual = sdk.cbt_status(job_id, vm).await?;
    if actual != expected {
        return Err(EngineError::CbtValidation {
            vm: vm.to_string(),
            disk: "*".to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
            stale: false,
        });
    }

    debug!(job_id, vm, status = %actual, "CBT status verified");
    Ok(())
}

/// Confirm no delta artifacts remain on a VM after an in-place restore.
pub async fn verify_pruned(sdk: &dyn HypervisorSdk, vm: &str, timeout: Duration, interval: Duration) -> Result<()> {
    let entity = format!("CBT artifact cleanup on VM {vm}");
    let waited = poll_until(&entity, timeout, interval, move || async move {
        let artifacts = sdk.delta_artifacts(vm).await?;
        Ok(artifacts.is_empty().then_some(()))
    })
    .await;

    match waited {
        Ok(()) => {
            info!(vm, "No CBT artifacts left after restore");
            Ok(())
        }
        Err(EngineError::Timeout { .. }) => {
            let artifacts = sdk.delta_artifacts(vm).await?;
            if artifacts.is_empty() {
                return Ok(());
            }
            Err(EngineError::CbtResidue {
                vm: vm.to_string(),
                artifacts,
            })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(disk: &str, job: &str, produced: &str) -> ChangeRecord {
        ChangeRecord::new("vm1", disk, BackupKind::Full, job, produced)
    }

    fn incr(disk: &str, job: &str, produced: &str, consumed: &str) -> ChangeRecord {
        ChangeRecord::new("vm1", disk, BackupKind::Incremental, job, produced).consuming(consumed)
    }

    fn diff(disk: &str, job: &str, produced: &str, consumed: &str) -> ChangeRecord {
        ChangeRecord::new("vm1", disk, BackupKind::Differential, job, produced).consuming(consumed)
    }

    #[test]
    fn test_normalize_disk_key() {
        assert_eq!(normalize_disk_key("scsi0-1-vm1.vmdk"), "vm1.vmdk");
        assert_eq!(normalize_disk_key("ide1-0-data.vhdx"), "data.vhdx");
        assert_eq!(normalize_disk_key("NVMe0-2-os.qcow2"), "os.qcow2");
        assert_eq!(normalize_disk_key("scsi-disk.vmdk"), "scsi-disk.vmdk");
        assert_eq!(normalize_disk_key("plain.vmdk"), "plain.vmdk");
    }

    #[test]
    fn test_incremental_chain() {
        let mut tracker = ChangeTracker::new();
        tracker.record(full("d1", "1", "A"));
        tracker.record(incr("d1", "2", "B", "A"));
        tracker.verify("vm1", "d1", BackupKind::Incremental).unwrap();
        assert_eq!(tracker.state("vm1", "d1"), ChainState::HasBaseline("B".into()));

        tracker.record(incr("d1", "3", "C", "X"));
        match tracker.verify("vm1", "d1", BackupKind::Incremental).unwrap_err() {
            EngineError::CbtValidation {
                expected,
                actual,
                disk,
                stale,
                ..
            } => {
                assert_eq!(expected, "B");
                assert_eq!(actual, "X");
                assert_eq!(disk, "d1");
                assert!(!stale);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_differential_uses_new_full_after_reset() {
        let mut tracker = ChangeTracker::new();
        tracker.record(full("d1", "1", "A"));
        tracker.record(incr("d1", "2", "B", "A"));
        tracker.record(full("d1", "3", "F2"));
        assert_eq!(tracker.records("vm1", "d1").len(), 1);

        tracker.record(incr("d1", "4", "C", "F2"));
        tracker.record(diff("d1", "5", "D", "F2"));
        tracker.verify("vm1", "d1", BackupKind::Differential).unwrap();

        // A differential reading the pre-reset incremental is stale
        tracker.record(diff("d1", "6", "E", "B"));
        match tracker.verify("vm1", "d1", BackupKind::Differential).unwrap_err() {
            EngineError::CbtValidation {
                expected, actual, stale, ..
            } => {
                assert_eq!(expected, "F2");
                assert_eq!(actual, "B");
                assert!(stale);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_synthetic_full_is_not_a_baseline() {
        let mut tracker = ChangeTracker::new();
        tracker.record(full("d1", "1", "A"));
        tracker.record(ChangeRecord::new("vm1", "d1", BackupKind::SyntheticFull, "2", "S"));
        tracker.record(incr("d1", "3", "B", "A"));
        tracker.verify("vm1", "d1", BackupKind::Incremental).unwrap();
        tracker.verify("vm1", "d1", BackupKind::SyntheticFull).unwrap();
    }

    #[test]
    fn test_keys_normalized_across_naming() {
        let mut tracker = ChangeTracker::new();
        tracker.record(full("scsi0-0-disk.vmdk", "1", "A"));
        tracker.record(incr("disk.vmdk", "2", "B", "A"));
        tracker.verify("vm1", "ide0-1-disk.vmdk", BackupKind::Incremental).unwrap();
    }

    #[test]
    fn test_no_baseline() {
        let mut tracker = ChangeTracker::new();
        assert_eq!(tracker.state("vm1", "d1"), ChainState::NoBaseline);
        assert!(tracker.verify("vm1", "d1", BackupKind::Incremental).is_err());

        tracker.record(incr("d1", "2", "B", "A"));
        match tracker.verify("vm1", "d1", BackupKind::Incremental).unwrap_err() {
            EngineError::CbtValidation { expected, .. } => assert_eq!(expected, NO_BASELINE),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_replay_restores_chain() {
        let records = vec![
            full("d1", "1", "A"),
            incr("d1", "2", "B", "A"),
            full("d2", "1", "P"),
        ];
        let mut tracker = ChangeTracker::new();
        assert_eq!(tracker.reload(&["vm1".to_string()], records), 3);
        assert_eq!(tracker.state("vm1", "d1"), ChainState::HasBaseline("B".into()));
        assert_eq!(tracker.state("vm1", "d2"), ChainState::HasBaseline("P".into()));

        tracker.record(incr("d1", "3", "C", "B"));
        tracker.verify("vm1", "d1", BackupKind::Incremental).unwrap();
    }

    #[test]
    fn test_reload_keeps_other_vms() {
        let mut tracker = ChangeTracker::new();
        tracker.record(full("d1", "1", "A"));
        let mut other = full("d1", "1", "X");
        other.vm = "vm2".into();
        tracker.record(other);

        let count = tracker.reload(&["vm1".to_string()], vec![full("d1", "5", "Q"), incr("d1", "6", "R", "Q")]);

        assert_eq!(count, 2);
        assert_eq!(tracker.state("vm1", "d1"), ChainState::HasBaseline("R".into()));
        assert_eq!(tracker.state("vm2", "d1"), ChainState::HasBaseline("X".into()));
    }

    #[test]
    fn test_expected_cbt_status() {
        assert_eq!(expected_cbt_status(BackupKind::Full), Some(CbtStatus::Enabled));
        assert_eq!(expected_cbt_status(BackupKind::Differential), Some(CbtStatus::Used));
        assert_eq!(expected_cbt_status(BackupKind::SyntheticFull), None);
    }
}
