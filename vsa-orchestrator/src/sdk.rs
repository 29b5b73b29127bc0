//! Boundary collaborators.
//!
//! The engine never talks to a hypervisor, database or checksum tool
//! directly. Everything external goes through these traits so the harness
//! can plug in real backends and tests can plug in the simulator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::cbt::ChangeRecord;
use crate::model::{
    BackupKind, ConsistencyMode, Disk, JobStatus, OverwritePolicy, PowerOnPolicy, RestoreKind, SnapshotRef,
};
use crate::utils::errors::Result;

/// Options sent with a backup submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupOptions {
    pub consistency: ConsistencyMode,
    /// Disks excluded by filter rules, keyed by VM name
    pub excluded_disks: BTreeMap<String, Vec<String>>,
    pub advanced: BTreeMap<String, String>,
}

/// Destination resources for a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub proxy: String,
    pub host: String,
    pub datastore: String,
    pub network: String,
    #[serde(default)]
    pub resource_group: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

/// Inputs handed to the placement oracle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConstraints {
    pub platform: String,
    /// Required free space on the datastore
    pub min_free_bytes: u64,
    #[serde(default)]
    pub preferred_host: Option<String>,
    #[serde(default)]
    pub preferred_datastore: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

/// Fully built, platform-specific restore parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreParams {
    pub platform: String,
    pub kind: RestoreKind,
    pub source: SnapshotRef,
    pub vms: Vec<String>,
    pub placement: Placement,
    pub overwrite: OverwritePolicy,
    pub power_on: PowerOnPolicy,
    pub in_place: bool,
    #[serde(default)]
    pub disks: Vec<String>,
    #[serde(default)]
    pub restore_path: String,
    /// Platform-specific keys (vCenter, storage account, availability zone, ...)
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Change identifiers a backup job consumed and produced on one disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskChange {
    pub disk: String,
    #[serde(default)]
    pub consumed: Option<String>,
    pub produced: String,
}

/// CBT state reported for a VM after a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CbtStatus {
    Disabled,
    Enabled,
    Used,
}

impl fmt::Display for CbtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CbtStatus::Disabled => "Disabled",
            CbtStatus::Enabled => "Enabled",
            CbtStatus::Used => "Used",
        })
    }
}

/// Vendor SDK performing the actual snapshot, backup and restore work.
///
/// Status queries must be safe to repeat.
#[async_trait]
pub trait HypervisorSdk: Send + Sync {
    /// Submit a backup and return the job id.
    async fn submit_backup(&self, vms: &[String], kind: BackupKind, options: &BackupOptions) -> Result<String>;

    /// Submit a restore and return the job id.
    async fn submit_restore(&self, params: &RestoreParams) -> Result<String>;

    async fn get_status(&self, job_id: &str) -> Result<JobStatus>;

    async fn kill(&self, job_id: &str) -> Result<()>;

    async fn pause(&self, job_id: &str) -> Result<()>;

    async fn resume(&self, job_id: &str) -> Result<()>;

    async fn list_disks(&self, vm: &str) -> Result<Vec<Disk>>;

    async fn power_off(&self, vm: &str) -> Result<()>;

    async fn power_on(&self, vm: &str) -> Result<()>;

    /// Per-disk change identifiers for one VM of a finished backup job.
    async fn change_identifiers(&self, job_id: &str, vm: &str) -> Result<Vec<DiskChange>>;

    async fn cbt_status(&self, job_id: &str, vm: &str) -> Result<CbtStatus>;

    /// Disks actually captured for one VM by a finished backup job.
    async fn backed_up_disks(&self, job_id: &str, vm: &str) -> Result<Vec<String>>;

    /// Residual "delta since backup" artifacts present on a VM.
    async fn delta_artifacts(&self, vm: &str) -> Result<Vec<String>>;
}

/// Job metadata lookups. The only write the engine performs is appending
/// change records; job links are written by the product side.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn append_change_record(&self, record: &ChangeRecord) -> Result<()>;

    /// All change records for a VM in recording order.
    async fn change_records(&self, vm: &str) -> Result<Vec<ChangeRecord>>;

    /// Most recent job of the given kind that backed up `vm`.
    async fn last_job(&self, vm: &str, kind: BackupKind) -> Result<Option<String>>;

    async fn link_job(&self, child_job_id: &str, parent_job_id: &str) -> Result<()>;

    async fn parent_of(&self, child_job_id: &str) -> Result<Option<String>>;
}

/// Checksum based content comparison.
#[async_trait]
pub trait ContentOracle: Send + Sync {
    /// Differences between source and restored content, empty when equal.
    async fn compare(&self, source_path: &str, dest_path: &str) -> Result<BTreeSet<String>>;

    /// Remove restored content under `path`.
    async fn remove(&self, path: &str) -> Result<()>;
}

#[async_trait]
pub trait PlacementOracle: Send + Sync {
    /// `None` when no destination satisfies the constraints.
    async fn compute_free_resources(
        &self,
        vms: &[String],
        constraints: &PlacementConstraints,
    ) -> Result<Option<Placement>>;
}
