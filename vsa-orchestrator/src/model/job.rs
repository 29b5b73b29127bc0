//! Job records and the status reported for them by the hypervisor SDK.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::request::{BackupKind, RestoreKind};
use crate::utils::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Running,
    Pending,
    Suspended,
    Completed,
    CompletedWithErrors,
    Killed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::CompletedWithErrors | JobState::Killed | JobState::Failed
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, JobState::Killed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::Running => "running",
            JobState::Pending => "pending",
            JobState::Suspended => "suspended",
            JobState::Completed => "completed",
            JobState::CompletedWithErrors => "completed_with_errors",
            JobState::Killed => "killed",
            JobState::Failed => "failed",
        }
    }

    /// Parent state derived from child states.
    ///
    /// Any unfinished child keeps the parent running. Once every child is
    /// terminal the parent is completed only if all children completed
    /// cleanly, failed only if none did.
    pub fn aggregate<I>(children: I) -> Option<JobState>
    where
        I: IntoIterator<Item = JobState>,
    {
        let mut total = 0usize;
        let mut clean = 0usize;
        let mut failed = 0usize;

        for state in children {
            total += 1;
            if !state.is_terminal() {
                return Some(JobState::Running);
            }
            match state {
                JobState::Completed => clean += 1,
                JobState::Killed | JobState::Failed => failed += 1,
                _ => {}
            }
        }

        if total == 0 {
            None
        } else if clean == total {
            Some(JobState::Completed)
        } else if failed == total {
            Some(JobState::Failed)
        } else {
            Some(JobState::CompletedWithErrors)
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "submitted" | "waiting" => Ok(JobState::Submitted),
            "running" => Ok(JobState::Running),
            "pending" => Ok(JobState::Pending),
            "suspended" => Ok(JobState::Suspended),
            "completed" => Ok(JobState::Completed),
            "completed_with_errors" | "completed_w/_one_or_more_errors" => Ok(JobState::CompletedWithErrors),
            "killed" => Ok(JobState::Killed),
            "failed" | "failed_to_start" => Ok(JobState::Failed),
            other => Err(EngineError::Sdk(format!("unknown job state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "level")]
pub enum JobKind {
    Backup(BackupKind),
    Restore(RestoreKind),
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Backup(kind) => write!(f, "{kind} backup"),
            JobKind::Restore(kind) => write!(f, "{kind} restore"),
        }
    }
}

/// Per-VM child entry of a job status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildStatus {
    pub job_id: String,
    pub vm: String,
    pub state: JobState,
    #[serde(default)]
    pub error_reason: Option<String>,
}

/// Status snapshot returned by the SDK for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    #[serde(default)]
    pub children: Vec<ChildStatus>,
    #[serde(default)]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            children: Vec::new(),
            error_reason: None,
            start_time: None,
            end_time: None,
        }
    }
}

/// Local view of a submitted job and its per-VM children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub state: JobState,
    /// Set on per-VM children
    #[serde(default)]
    pub vm: Option<String>,
    #[serde(default)]
    pub children: Vec<Job>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_reason: Option<String>,
}

impl Job {
    pub fn new(id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            id: id.into(),
            kind,
            state: JobState::Submitted,
            vm: None,
            children: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            error_reason: None,
        }
    }

    /// Fold a status snapshot into this job. Children share the parent's kind.
    pub fn apply_status(&mut self, status: JobStatus) {
        if let Some(start) = status.start_time {
            self.start_time = start;
        }

        let mut children = Vec::with_capacity(status.children.len());
        for child in status.children {
            let start_time = self
                .children
                .iter()
                .find(|c| c.id == child.job_id)
                .map(|c| c.start_time)
                .unwrap_or(self.start_time);
            let terminal = child.state.is_terminal();
            children.push(Job {
                id: child.job_id,
                kind: self.kind,
                state: child.state,
                vm: Some(child.vm),
                children: Vec::new(),
                start_time,
                end_time: if terminal { Some(status.end_time.unwrap_or_else(Utc::now)) } else { None },
                error_reason: child.error_reason,
            });
        }
        self.children = children;

        // A finished parent with fan-out is judged by its children. A failed
        // parent keeps its own state unless some children did complete.
        self.state = match JobState::aggregate(self.children.iter().map(|c| c.state)) {
            Some(aggregated) if status.state.is_terminal() && !status.state.is_failure() => aggregated,
            Some(JobState::CompletedWithErrors) if status.state.is_failure() => JobState::CompletedWithErrors,
            _ => status.state,
        };

        self.error_reason = status.error_reason.or_else(|| {
            self.children
                .iter()
                .find_map(|c| c.error_reason.as_ref().map(|r| format!("{}: {r}", c.vm.as_deref().unwrap_or(&c.id))))
        });

        if self.state.is_terminal() {
            self.end_time = Some(status.end_time.unwrap_or_else(Utc::now));
        }
    }

    pub fn failed_children(&self) -> impl Iterator<Item = &Job> {
        self.children.iter().filter(|c| c.state != JobState::Completed)
    }

    /// VMs whose child job did not complete cleanly.
    pub fn failed_vms(&self) -> Vec<String> {
        self.failed_children().filter_map(|c| c.vm.clone()).collect()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// Terminal outcome of a successful wait. Failed and killed jobs are errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Job),
    CompletedWithErrors(Job),
}

impl Outcome {
    pub fn job(&self) -> &Job {
        match self {
            Outcome::Completed(job) | Outcome::CompletedWithErrors(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Outcome::Completed(job) | Outcome::CompletedWithErrors(job) => job,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(id: &str, vm: &str, state: JobState) -> ChildStatus {
        ChildStatus {
            job_id: id.into(),
            vm: vm.into(),
            state,
            error_reason: None,
        }
    }

    #[test]
    fn test_aggregate_states() {
        use JobState::*;
        assert_eq!(JobState::aggregate([]), None);
        assert_eq!(JobState::aggregate([Completed, Running]), Some(Running));
        assert_eq!(JobState::aggregate([Completed, Completed]), Some(Completed));
        assert_eq!(JobState::aggregate([Completed, Failed]), Some(CompletedWithErrors));
        assert_eq!(JobState::aggregate([Killed, Failed]), Some(Failed));
        assert_eq!(JobState::aggregate([Completed, CompletedWithErrors]), Some(CompletedWithErrors));
    }

    #[test]
    fn test_parent_follows_children() {
        let mut job = Job::new("100", JobKind::Restore(RestoreKind::FullVm));
        let mut status = JobStatus::new(JobState::Completed);
        status.children = vec![
            child("101", "vm-a", JobState::Completed),
            child("102", "vm-b", JobState::Failed),
            child("103", "vm-c", JobState::Completed),
        ];
        status.children[1].error_reason = Some("datastore full".into());

        job.apply_status(status);

        assert_eq!(job.state, JobState::CompletedWithErrors);
        assert_eq!(job.failed_vms(), vec!["vm-b".to_string()]);
        assert_eq!(job.error_reason.as_deref(), Some("vm-b: datastore full"));
        assert!(job.end_time.is_some());
        assert!(job.children.iter().all(|c| c.kind == job.kind));
    }

    #[test]
    fn test_failed_parent_with_completed_children_has_errors() {
        let mut job = Job::new("100", JobKind::Restore(RestoreKind::FullVm));
        let mut status = JobStatus::new(JobState::Failed);
        status.children = vec![
            child("101", "vm-a", JobState::Completed),
            child("102", "vm-b", JobState::Failed),
            child("103", "vm-c", JobState::Completed),
        ];
        job.apply_status(status);

        assert_eq!(job.state, JobState::CompletedWithErrors);
        assert_eq!(job.failed_vms(), vec!["vm-b".to_string()]);
    }

    #[test]
    fn test_failed_parent_keeps_state_when_no_child_completed() {
        let mut job = Job::new("100", JobKind::Backup(BackupKind::Full));
        let mut status = JobStatus::new(JobState::Killed);
        status.children = vec![child("101", "vm-a", JobState::Failed)];
        job.apply_status(status);
        assert_eq!(job.state, JobState::Killed);

        // Clean children do not hide a failure reported on the parent itself
        let mut status = JobStatus::new(JobState::Failed);
        status.children = vec![child("101", "vm-a", JobState::Completed)];
        job.apply_status(status);
        assert_eq!(job.state, JobState::Failed);
    }

    #[test]
    fn test_running_parent_with_finished_children_waits() {
        let mut job = Job::new("7", JobKind::Backup(BackupKind::Full));
        let mut status = JobStatus::new(JobState::Running);
        status.children = vec![child("8", "vm-a", JobState::Running)];
        job.apply_status(status);
        assert_eq!(job.state, JobState::Running);
        assert!(job.end_time.is_none());
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!("Completed w/ one or more errors".parse::<JobState>().unwrap(), JobState::CompletedWithErrors);
        assert_eq!("PENDING".parse::<JobState>().unwrap(), JobState::Pending);
        assert!("exploded".parse::<JobState>().is_err());
    }
}
