//! Data model shared by the engine, the validators and the SDK boundary.

pub mod disk;
pub mod job;
pub mod request;

pub use disk::{ControllerSlot, Disk, DiskFilterRule, RuleType};
pub use job::{ChildStatus, Job, JobKind, JobState, JobStatus, Outcome};
pub use request::{
    BackupKind, BackupRequest, ConsistencyMode, DestinationDescriptor, IncrLevel, OverwritePolicy, PowerOnPolicy,
    RestoreKind, RestoreRequest, RestoreRequestBuilder, SnapshotRef,
};
