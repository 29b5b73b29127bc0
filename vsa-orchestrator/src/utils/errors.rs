//! Error types for the orchestration engine.
//!
//! Every variant that reports a fatal condition carries the job id, VM or
//! disk identifier needed to locate the failing entity.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No hypervisor adapter registered for platform '{platform}'")]
    DispatchNotFound { platform: String },

    #[error("Placement resolution failed for [{vms}]: {reason}")]
    PlacementResolution { vms: String, reason: String },

    #[error("Job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("Job {job_id} stayed pending after {attempts} recovery attempts and was killed")]
    JobPendingExhausted { job_id: String, attempts: u32 },

    #[error("Disk filter validation failed for VM {vm}: expected {expected} disks backed up, found {actual}")]
    DiskFilterValidation { vm: String, expected: usize, actual: usize },

    #[error("CBT validation failed for VM {vm} disk {disk}: expected '{expected}', got '{actual}'{}", stale_note(.stale))]
    CbtValidation {
        vm: String,
        disk: String,
        expected: String,
        actual: String,
        stale: bool,
    },

    #[error("CBT artifacts still present on VM {vm} after restore: {}", .artifacts.join(", "))]
    CbtResidue { vm: String, artifacts: Vec<String> },

    #[error("Restored content for job {job_id} differs from source: {}", .differences.join("; "))]
    DataValidation { job_id: String, differences: Vec<String> },

    #[error("Timed out after {waited_secs}s waiting for {entity}")]
    Timeout { entity: String, waited_secs: u64 },

    #[error("Wait for job {job_id} was cancelled")]
    Cancelled { job_id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Hypervisor SDK error: {0}")]
    Sdk(String),

    #[error("Metadata store error: {0}")]
    Metadata(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Only SDK transport errors may be retried by a caller; everything else
    /// is either a product defect or a terminal job outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Sdk(_))
    }

    /// Shorthand used by validators that report a job-level failure.
    pub fn job_failed(job_id: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::JobFailed {
            job_id: job_id.into(),
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

fn stale_note(stale: &bool) -> &'static str {
    if *stale {
        " (stale identifier)"
    } else {
        ""
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_identifiers() {
        let err = EngineError::job_failed("1042", "VM vm-b failed to restore");
        assert_eq!(err.to_string(), "Job 1042 failed: VM vm-b failed to restore");

        let err = EngineError::CbtValidation {
            vm: "vm-a".into(),
            disk: "disk0.vmdk".into(),
            expected: "B".into(),
            actual: "X".into(),
            stale: false,
        };
        let msg = err.to_string();
        assert!(msg.contains("vm-a"));
        assert!(msg.contains("disk0.vmdk"));
        assert!(msg.contains("expected 'B', got 'X'"));
        assert!(!msg.contains("stale"));
    }

    #[test]
    fn test_stale_flag_in_message() {
        let err = EngineError::CbtValidation {
            vm: "vm-a".into(),
            disk: "d1".into(),
            expected: "B".into(),
            actual: "A".into(),
            stale: true,
        };
        assert!(err.to_string().ends_with("(stale identifier)"));
    }

    #[test]
    fn test_validation_errors_are_not_retryable() {
        assert!(!EngineError::DispatchNotFound { platform: "foo".into() }.is_retryable());
        assert!(!EngineError::JobPendingExhausted { job_id: "7".into(), attempts: 3 }.is_retryable());
        assert!(EngineError::Sdk("connection reset".into()).is_retryable());
    }
}
