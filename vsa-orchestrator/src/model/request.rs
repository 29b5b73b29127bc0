//! Backup and restore requests.
//!
//! Requests are assembled with builder methods and are immutable once handed
//! to the engine. Restore requests go through an explicit two-phase build:
//! [`RestoreRequestBuilder`] collects inputs without side effects and
//! [`RestoreRequestBuilder::resolve`] derives everything that depends on them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::utils::errors::{EngineError, Result};

/// Backup level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    Incremental,
    Differential,
    SyntheticFull,
}

impl BackupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
            BackupKind::Differential => "differential",
            BackupKind::SyntheticFull => "synthetic_full",
        }
    }

    /// Whether the job reads changed blocks from the source VM.
    pub fn consumes_change_id(self) -> bool {
        matches!(self, BackupKind::Incremental | BackupKind::Differential)
    }

    /// Whether the job reads the source VM at all (synthetic fulls do not).
    pub fn reads_source(self) -> bool {
        !matches!(self, BackupKind::SyntheticFull)
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(BackupKind::Full),
            "incremental" | "incr" => Ok(BackupKind::Incremental),
            "differential" | "diff" => Ok(BackupKind::Differential),
            "synthetic_full" | "synth_full" | "synthfull" => Ok(BackupKind::SyntheticFull),
            other => Err(EngineError::InvalidRequest(format!("unknown backup kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    AppConsistent,
    #[default]
    CrashConsistent,
}

/// Where an auxiliary incremental runs relative to a synthetic full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrLevel {
    Before,
    After,
    Both,
}

/// A request to back up a set of VMs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRequest {
    platform: String,
    kind: BackupKind,
    #[serde(default)]
    consistency: ConsistencyMode,
    target_vms: Vec<String>,
    #[serde(default)]
    advanced_options: BTreeMap<String, String>,
    #[serde(default)]
    incr_level: Option<IncrLevel>,
    #[serde(default)]
    cbt_enabled: bool,
    #[serde(default)]
    retry_failed_vms: bool,
}

impl BackupRequest {
    pub fn new<I, S>(platform: impl Into<String>, kind: BackupKind, vms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            platform: platform.into(),
            kind,
            consistency: ConsistencyMode::default(),
            target_vms: vms.into_iter().map(Into::into).collect(),
            advanced_options: BTreeMap::new(),
            incr_level: None,
            cbt_enabled: false,
            retry_failed_vms: false,
        }
    }

    pub fn with_consistency(mut self, mode: ConsistencyMode) -> Self {
        self.consistency = mode;
        self
    }

    pub fn with_incr_level(mut self, level: IncrLevel) -> Self {
        self.incr_level = Some(level);
        self
    }

    pub fn with_cbt(mut self, enabled: bool) -> Self {
        self.cbt_enabled = enabled;
        self
    }

    /// Resubmit only the failed VMs once when a step partially fails.
    pub fn with_retry_failed_vms(mut self, enabled: bool) -> Self {
        self.retry_failed_vms = enabled;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.advanced_options.insert(key.into(), value.into());
        self
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn kind(&self) -> BackupKind {
        self.kind
    }

    pub fn consistency(&self) -> ConsistencyMode {
        self.consistency
    }

    pub fn target_vms(&self) -> &[String] {
        &self.target_vms
    }

    pub fn advanced_options(&self) -> &BTreeMap<String, String> {
        &self.advanced_options
    }

    pub fn incr_level(&self) -> Option<IncrLevel> {
        self.incr_level
    }

    pub fn cbt_enabled(&self) -> bool {
        self.cbt_enabled
    }

    pub fn retry_failed_vms(&self) -> bool {
        self.retry_failed_vms
    }

    /// Same request narrowed to a subset of its VMs.
    pub(crate) fn for_vms(&self, vms: Vec<String>) -> Self {
        Self {
            target_vms: vms,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreKind {
    GuestFile,
    Disk,
    AttachDisk,
    FullVm,
}

impl RestoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RestoreKind::GuestFile => "guest_file",
            RestoreKind::Disk => "disk",
            RestoreKind::AttachDisk => "attach_disk",
            RestoreKind::FullVm => "full_vm",
        }
    }

    /// Restores that land content on a filesystem path of the destination.
    pub fn writes_files(self) -> bool {
        matches!(self, RestoreKind::GuestFile | RestoreKind::Disk)
    }
}

impl fmt::Display for RestoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    #[default]
    Unconditional,
    IfNewer,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerOnPolicy {
    #[default]
    PowerOn,
    LeaveOff,
}

/// The backup a restore reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub job_id: String,
    #[serde(default)]
    pub copy_precedence: Option<u32>,
}

impl SnapshotRef {
    pub fn job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            copy_precedence: None,
        }
    }
}

/// Destination inputs as given by the caller. Any field left empty is
/// filled by the platform adapter, usually through the placement oracle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationDescriptor {
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub resource_group: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Collects restore inputs. Nothing is derived until [`resolve`](Self::resolve).
#[derive(Debug, Clone)]
pub struct RestoreRequestBuilder {
    platform: String,
    kind: RestoreKind,
    source: Option<SnapshotRef>,
    vms: Vec<String>,
    destination: DestinationDescriptor,
    overwrite: OverwritePolicy,
    power_on: PowerOnPolicy,
    in_place: bool,
    disks: Vec<String>,
    source_paths: Vec<String>,
    restore_path: Option<String>,
}

impl RestoreRequestBuilder {
    pub fn new(platform: impl Into<String>, kind: RestoreKind) -> Self {
        Self {
            platform: platform.into(),
            kind,
            source: None,
            vms: Vec::new(),
            destination: DestinationDescriptor::default(),
            overwrite: OverwritePolicy::default(),
            power_on: PowerOnPolicy::default(),
            in_place: false,
            disks: Vec::new(),
            source_paths: Vec::new(),
            restore_path: None,
        }
    }

    pub fn from_snapshot(mut self, source: SnapshotRef) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_vms<I, S>(mut self, vms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vms = vms.into_iter().map(Into::into).collect();
        self
    }

    /// Name the destination client. Hostname and restore path are derived
    /// from it in [`resolve`](Self::resolve), not here.
    pub fn with_destination(mut self, client: impl Into<String>) -> Self {
        self.destination.client = Some(client.into());
        self
    }

    pub fn with_descriptor(mut self, descriptor: DestinationDescriptor) -> Self {
        let client = self.destination.client.take();
        self.destination = descriptor;
        if self.destination.client.is_none() {
            self.destination.client = client;
        }
        self
    }

    pub fn with_overwrite(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite = policy;
        self
    }

    pub fn with_power_on(mut self, policy: PowerOnPolicy) -> Self {
        self.power_on = policy;
        self
    }

    pub fn in_place(mut self, in_place: bool) -> Self {
        self.in_place = in_place;
        self
    }

    pub fn with_disks<I, S>(mut self, disks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disks = disks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_restore_path(mut self, path: impl Into<String>) -> Self {
        self.restore_path = Some(path.into());
        self
    }

    /// Validate the inputs and derive destination host and restore path.
    pub fn resolve(self) -> Result<RestoreRequest> {
        let source = self
            .source
            .ok_or_else(|| EngineError::InvalidRequest(format!("{} restore has no source snapshot", self.kind)))?;

        if self.vms.is_empty() {
            return Err(EngineError::InvalidRequest(format!(
                "{} restore from job {} names no VMs",
                self.kind, source.job_id
            )));
        }

        if self.in_place && self.kind != RestoreKind::FullVm {
            return Err(EngineError::InvalidRequest(format!(
                "in-place restore is only supported for full VM restores, not {}",
                self.kind
            )));
        }

        if matches!(self.kind, RestoreKind::Disk | RestoreKind::AttachDisk) && self.disks.is_empty() {
            return Err(EngineError::InvalidRequest(format!(
                "{} restore from job {} names no disks",
                self.kind, source.job_id
            )));
        }

        let mut destination = self.destination;
        if !self.in_place && destination.client.is_none() && self.kind != RestoreKind::FullVm {
            return Err(EngineError::InvalidRequest(format!(
                "{} restore from job {} has no destination client",
                self.kind, source.job_id
            )));
        }

        if destination.host.is_none() {
            destination.host = destination.client.as_ref().map(|c| c.to_ascii_lowercase());
        }

        let restore_path = match self.restore_path {
            Some(path) => path,
            None if self.kind.writes_files() => format!("/vsa_restore/{}/{}", self.kind, source.job_id),
            None => String::new(),
        };

        Ok(RestoreRequest {
            platform: self.platform,
            kind: self.kind,
            source,
            vms: self.vms,
            destination,
            overwrite: self.overwrite,
            power_on: self.power_on,
            in_place: self.in_place,
            disks: self.disks,
            source_paths: self.source_paths,
            restore_path,
            part_of_thread: false,
        })
    }
}

/// A validated restore request.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreRequest {
    platform: String,
    kind: RestoreKind,
    source: SnapshotRef,
    vms: Vec<String>,
    destination: DestinationDescriptor,
    overwrite: OverwritePolicy,
    power_on: PowerOnPolicy,
    in_place: bool,
    disks: Vec<String>,
    source_paths: Vec<String>,
    restore_path: String,
    part_of_thread: bool,
}

impl RestoreRequest {
    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn kind(&self) -> RestoreKind {
        self.kind
    }

    pub fn source(&self) -> &SnapshotRef {
        &self.source
    }

    pub fn vms(&self) -> &[String] {
        &self.vms
    }

    pub fn destination(&self) -> &DestinationDescriptor {
        &self.destination
    }

    pub fn overwrite(&self) -> OverwritePolicy {
        self.overwrite
    }

    pub fn power_on(&self) -> PowerOnPolicy {
        self.power_on
    }

    pub fn is_in_place(&self) -> bool {
        self.in_place
    }

    pub fn disks(&self) -> &[String] {
        &self.disks
    }

    pub fn source_paths(&self) -> &[String] {
        &self.source_paths
    }

    pub fn restore_path(&self) -> &str {
        &self.restore_path
    }

    /// Set when the restore runs as one worker of a parallel restore batch.
    pub fn is_part_of_thread(&self) -> bool {
        self.part_of_thread
    }

    pub(crate) fn as_thread_part(mut self) -> Self {
        self.part_of_thread = true;
        self
    }
}
