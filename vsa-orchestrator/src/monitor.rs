//! Job handles and the wait loop that drives a job to a terminal state.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::MonitorConfig;
use crate::model::{Job, JobKind, JobState, JobStatus, Outcome};
use crate::sdk::HypervisorSdk;
use crate::utils::errors::{EngineError, Result};
use crate::utils::poll::poll_until;

/// A submitted remote job.
#[derive(Clone)]
pub struct JobHandle {
    id: String,
    kind: JobKind,
    sdk: Arc<dyn HypervisorSdk>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.id).field("kind", &self.kind).finish()
    }
}

impl JobHandle {
    pub fn new(id: impl Into<String>, kind: JobKind, sdk: Arc<dyn HypervisorSdk>) -> Self {
        Self {
            id: id.into(),
            kind,
            sdk,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    #[instrument(skip(self), fields(job_id = %self.id))]
    pub async fn poll_status(&self) -> Result<JobStatus> {
        self.sdk.get_status(&self.id).await
    }

    #[instrument(skip(self), fields(job_id = %self.id))]
    pub async fn pause(&self) -> Result<()> {
        info!("Pausing job");
        self.sdk.pause(&self.id).await
    }

    #[instrument(skip(self), fields(job_id = %self.id))]
    pub async fn resume(&self) -> Result<()> {
        info!("Resuming job");
        self.sdk.resume(&self.id).await
    }

    #[instrument(skip(self), fields(job_id = %self.id))]
    pub async fn kill(&self) -> Result<()> {
        warn!("Killing job");
        self.sdk.kill(&self.id).await
    }

    /// Poll until the job reaches any terminal state, failed ones included.
    pub async fn wait(&self, timeout: Duration, interval: Duration) -> Result<Job> {
        let entity = format!("job {}", self.id);
        poll_until(&entity, timeout, interval, move || async move {
            let status = self.poll_status().await?;
            let mut job = Job::new(self.id.clone(), self.kind);
            job.apply_status(status);
            Ok(job.state.is_terminal().then_some(job))
        })
        .await
    }
}

/// Recovery action run while a job reports PENDING.
#[async_trait]
pub trait PendingHandler: Send + Sync {
    /// `attempt` starts at 1.
    async fn on_pending(&self, job: &Job, attempt: u32) -> Result<()>;
}

/// Waits out PENDING without any recovery action.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecovery;

#[async_trait]
impl PendingHandler for NoRecovery {
    async fn on_pending(&self, job: &Job, attempt: u32) -> Result<()> {
        debug!(job_id = %job.id, attempt, "Job pending, no recovery action configured");
        Ok(())
    }
}

/// Drives jobs to a terminal state with bounded PENDING and SUSPENDED handling.
#[derive(Debug, Clone)]
pub struct JobMonitor {
    poll_interval: Duration,
    timeout: Duration,
    pending_retries: u32,
    suspend_resumes: u32,
    cancel: CancellationToken,
}

impl JobMonitor {
    pub fn new(config: &MonitorConfig, cancel: CancellationToken) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
            pending_retries: config.pending_retries,
            suspend_resumes: config.suspend_resumes,
            cancel,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Poll `handle` until it finishes.
    ///
    /// COMPLETED and COMPLETED_WITH_ERRORS end the wait with an [`Outcome`];
    /// FAILED and KILLED are errors. A job still PENDING after the retry
    /// budget, or SUSPENDED more often than the resume budget, is killed.
    /// Cancellation kills the job as well. Running past the timeout does not.
    pub async fn wait_for_terminal(&self, handle: &JobHandle, on_pending: &dyn PendingHandler) -> Result<Outcome> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut job = Job::new(handle.id(), handle.kind());
        let mut pending = 0u32;
        let mut suspended = 0u32;
        let mut last_state = None;

        loop {
            let status = handle.poll_status().await?;
            job.apply_status(status);

            if last_state != Some(job.state) {
                debug!(job_id = %job.id, state = %job.state, "Job state changed");
                last_state = Some(job.state);
            }

            match job.state {
                JobState::Completed => {
                    info!(job_id = %job.id, kind = %job.kind, "Job completed");
                    return Ok(Outcome::Completed(job));
                }
                JobState::CompletedWithErrors => {
                    warn!(
                        job_id = %job.id,
                        failed_vms = ?job.failed_vms(),
                        "Job completed with errors"
                    );
                    return Ok(Outcome::CompletedWithErrors(job));
                }
                JobState::Failed | JobState::Killed => {
                    if job.failed_children().next().is_some() {
                        let err = first_failed_child(&job);
                        warn!(job_id = %job.id, error = %err, "Job failed");
                        return Err(err);
                    }
                    let reason = job
                        .error_reason
                        .clone()
                        .unwrap_or_else(|| format!("job ended in state {}", job.state));
                    warn!(job_id = %job.id, reason = %reason, "Job failed");
                    return Err(EngineError::job_failed(job.id, reason));
                }
                JobState::Pending => {
                    pending += 1;
                    if pending > self.pending_retries {
                        warn!(job_id = %job.id, attempts = self.pending_retries, "Pending retry budget exhausted");
                        handle.kill().await?;
                        return Err(EngineError::JobPendingExhausted {
                            job_id: job.id,
                            attempts: self.pending_retries,
                        });
                    }
                    info!(job_id = %job.id, attempt = pending, "Job pending, running recovery action");
                    if let Err(e) = on_pending.on_pending(&job, pending).await {
                        warn!(job_id = %job.id, attempt = pending, error = %e, "Recovery action failed");
                        return Err(abandon(handle, e).await);
                    }
                }
                JobState::Suspended => {
                    suspended += 1;
                    if suspended > self.suspend_resumes {
                        handle.kill().await?;
                        return Err(EngineError::job_failed(
                            job.id,
                            format!("suspended {} times, resume budget exhausted", suspended),
                        ));
                    }
                    if let Err(e) = handle.resume().await {
                        warn!(job_id = %job.id, error = %e, "Resume failed");
                        return Err(abandon(handle, e).await);
                    }
                }
                JobState::Submitted | JobState::Running => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::Timeout {
                    entity: format!("job {}", job.id),
                    waited_secs: now.duration_since(started).as_secs(),
                });
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    handle.kill().await?;
                    return Err(EngineError::Cancelled { job_id: job.id });
                }
                _ = tokio::time::sleep(self.poll_interval.min(deadline - now)) => {}
            }
        }
    }
}

/// Kill a job the monitor stops waiting on. A kill failure is logged and the
/// original error is kept.
async fn abandon(handle: &JobHandle, err: EngineError) -> EngineError {
    if let Err(kill_err) = handle.kill().await {
        warn!(job_id = %handle.id(), error = %kill_err, "Failed to kill abandoned job");
    }
    err
}

/// Error naming the first child that did not complete, with the VM tally.
pub(crate) fn first_failed_child(job: &Job) -> EngineError {
    let total = job.children.len();
    let failed: Vec<&Job> = job.failed_children().collect();
    match failed.first() {
        Some(child) => EngineError::job_failed(
            child.id.clone(),
            format!(
                "VM {} ended {}{} ({} of {} VMs completed in job {})",
                child.vm.as_deref().unwrap_or("?"),
                child.state,
                child.error_reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default(),
                total - failed.len(),
                total,
                job.id
            ),
        ),
        None => EngineError::job_failed(job.id.clone(), format!("job ended {}", job.state)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackupKind, RestoreKind};
    use crate::sdk::BackupOptions;
    use crate::sim::SimulatedHypervisor;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn monitor(pending_retries: u32) -> JobMonitor {
        let config = MonitorConfig {
            poll_interval_ms: 1,
            timeout_secs: 5,
            pending_retries,
            suspend_resumes: 2,
        };
        JobMonitor::new(&config, CancellationToken::new())
    }

    struct CountingRecovery(AtomicU32);

    #[async_trait]
    impl PendingHandler for CountingRecovery {
        async fn on_pending(&self, _job: &Job, _attempt: u32) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn handle(sim: &Arc<SimulatedHypervisor>, id: &str) -> JobHandle {
        JobHandle::new(id, JobKind::Backup(BackupKind::Full), sim.clone())
    }

    #[tokio::test]
    async fn test_completes_after_running() {
        let sim = Arc::new(SimulatedHypervisor::new());
        sim.script_job("1", [JobState::Running, JobState::Running, JobState::Completed]);

        let outcome = monitor(3).wait_for_terminal(&handle(&sim, "1"), &NoRecovery).await.unwrap();
        assert!(outcome.is_clean());
        assert_eq!(outcome.job().id, "1");
    }

    #[tokio::test]
    async fn test_pending_budget_exhausted_kills_job() {
        let sim = Arc::new(SimulatedHypervisor::new());
        sim.script_job("2", [JobState::Pending]);
        let recovery = CountingRecovery(AtomicU32::new(0));

        let err = monitor(3).wait_for_terminal(&handle(&sim, "2"), &recovery).await.unwrap_err();

        match err {
            EngineError::JobPendingExhausted { job_id, attempts } => {
                assert_eq!(job_id, "2");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(recovery.0.load(Ordering::SeqCst), 3);
        assert_eq!(sim.killed_jobs(), vec!["2".to_string()]);
    }

    #[tokio::test]
    async fn test_pending_recovers() {
        let sim = Arc::new(SimulatedHypervisor::new());
        sim.script_job("3", [JobState::Pending, JobState::Pending, JobState::Running, JobState::Completed]);
        let recovery = CountingRecovery(AtomicU32::new(0));

        monitor(3).wait_for_terminal(&handle(&sim, "3"), &recovery).await.unwrap();
        assert_eq!(recovery.0.load(Ordering::SeqCst), 2);
        assert!(sim.killed_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_completed_with_errors_is_surfaced() {
        let sim = Arc::new(SimulatedHypervisor::new());
        sim.script_job("4", [JobState::CompletedWithErrors]);
        let outcome = monitor(3).wait_for_terminal(&handle(&sim, "4"), &NoRecovery).await.unwrap();
        assert!(!outcome.is_clean());
    }

    #[tokio::test]
    async fn test_failed_job_is_an_error() {
        let sim = Arc::new(SimulatedHypervisor::new());
        sim.script_job("5", [JobState::Running, JobState::Failed]);
        let err = monitor(3).wait_for_terminal(&handle(&sim, "5"), &NoRecovery).await.unwrap_err();
        assert!(matches!(err, EngineError::JobFailed { ref job_id, .. } if job_id == "5"));
    }

    #[tokio::test]
    async fn test_suspended_job_is_resumed() {
        let sim = Arc::new(SimulatedHypervisor::new());
        sim.script_job("6", [JobState::Suspended, JobState::Running, JobState::Completed]);
        monitor(3).wait_for_terminal(&handle(&sim, "6"), &NoRecovery).await.unwrap();
        assert_eq!(sim.call_count("resume"), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_from_failure() {
        let sim = Arc::new(SimulatedHypervisor::new());
        sim.script_job("7", [JobState::Running]);
        let err = monitor(3)
            .with_timeout(Duration::from_millis(20))
            .wait_for_terminal(&handle(&sim, "7"), &NoRecovery)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
        assert!(sim.killed_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_kills_job() {
        let sim = Arc::new(SimulatedHypervisor::new());
        sim.script_job("8", [JobState::Running]);
        let monitor = monitor(3);
        monitor.cancel_token().cancel();

        let err = monitor.wait_for_terminal(&handle(&sim, "8"), &NoRecovery).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { .. }));
        assert_eq!(sim.killed_jobs(), vec!["8".to_string()]);
    }

    #[tokio::test]
    async fn test_handle_wait_returns_failed_job() {
        let sim = Arc::new(SimulatedHypervisor::new());
        sim.script_job("9", [JobState::Running, JobState::Killed]);
        let handle = JobHandle::new("9", JobKind::Restore(RestoreKind::Disk), sim.clone());
        let job = handle.wait(Duration::from_secs(1), Duration::from_millis(1)).await.unwrap();
        assert_eq!(job.state, JobState::Killed);
    }

    struct FailingRecovery;

    #[async_trait]
    impl PendingHandler for FailingRecovery {
        async fn on_pending(&self, job: &Job, _attempt: u32) -> Result<()> {
            Err(EngineError::Sdk(format!("could not restart services for job {}", job.id)))
        }
    }

    async fn submit_three(sim: &Arc<SimulatedHypervisor>) -> String {
        for vm in ["vm1", "vm2", "vm3"] {
            sim.add_vm(vm, Vec::new());
        }
        let vms: Vec<String> = ["vm1", "vm2", "vm3"].map(String::from).to_vec();
        sim.submit_backup(&vms, BackupKind::Full, &BackupOptions::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_failed_recovery_action_kills_job() {
        let sim = Arc::new(SimulatedHypervisor::new());
        sim.script_job("10", [JobState::Pending]);

        let err = monitor(3).wait_for_terminal(&handle(&sim, "10"), &FailingRecovery).await.unwrap_err();
        assert!(matches!(err, EngineError::Sdk(ref msg) if msg.contains("job 10")));
        assert_eq!(sim.killed_jobs(), vec!["10".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_parent_with_completed_children_reports_errors() {
        let sim = Arc::new(SimulatedHypervisor::new());
        sim.fail_vm("vm2");
        sim.fail_parent_next();
        let id = submit_three(&sim).await;

        let outcome = monitor(3).wait_for_terminal(&handle(&sim, &id), &NoRecovery).await.unwrap();
        assert!(!outcome.is_clean());
        assert_eq!(outcome.job().failed_vms(), vec!["vm2".to_string()]);

        let err = first_failed_child(outcome.job());
        let child = outcome.job().children.iter().find(|c| c.vm.as_deref() == Some("vm2")).unwrap();
        assert!(matches!(err, EngineError::JobFailed { ref job_id, ref reason }
            if *job_id == child.id && reason.contains("2 of 3")));
    }

    #[tokio::test]
    async fn test_failed_parent_names_first_failed_child() {
        let sim = Arc::new(SimulatedHypervisor::new());
        sim.script_next([JobState::Running, JobState::Failed]);
        let id = submit_three(&sim).await;

        let err = monitor(3).wait_for_terminal(&handle(&sim, &id), &NoRecovery).await.unwrap_err();
        match err {
            EngineError::JobFailed { job_id, reason } => {
                assert_ne!(job_id, id);
                assert!(reason.contains("VM vm1"));
                assert!(reason.contains("0 of 3"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_pause_and_resume_reach_sdk() {
        let sim = Arc::new(SimulatedHypervisor::new());
        sim.script_job("11", [JobState::Running]);
        let handle = handle(&sim, "11");

        handle.pause().await.unwrap();
        handle.resume().await.unwrap();
        assert_eq!(sim.call_count("pause"), 1);
        assert_eq!(sim.call_count("resume"), 1);
        assert!(sim.killed_jobs().is_empty());
    }
}
