//! Backup orchestration.
//!
//! A request becomes an ordered list of steps. Each step is submitted only
//! after the previous one completed, then validated: backed-up disk counts
//! against the disk filters, CBT identifiers against the chain, and for
//! synthetic fulls the parent job is resolved from child links.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use super::Engine;
use crate::cbt::{self, ChangeRecord};
use crate::dispatch::{AdapterCapabilities, HypervisorAdapter};
use crate::model::{BackupKind, BackupRequest, IncrLevel, Job, JobKind, JobState, Outcome};
use crate::monitor::{first_failed_child, JobHandle};
use crate::utils::errors::{EngineError, Result};
use crate::utils::poll::poll_until;

/// Ordered backup kinds a request expands to.
pub fn plan_steps(request: &BackupRequest, capabilities: AdapterCapabilities) -> Result<Vec<BackupKind>> {
    use BackupKind::{Incremental, SyntheticFull};

    match (request.kind(), request.incr_level()) {
        (SyntheticFull, None) => Ok(vec![SyntheticFull]),
        (SyntheticFull, Some(IncrLevel::Before)) => Ok(vec![Incremental, SyntheticFull]),
        (SyntheticFull, Some(IncrLevel::After)) => Ok(vec![SyntheticFull, Incremental]),
        (SyntheticFull, Some(IncrLevel::Both)) if capabilities.synthetic_full_both => {
            Ok(vec![Incremental, SyntheticFull, Incremental])
        }
        (SyntheticFull, Some(IncrLevel::Both)) => Err(EngineError::InvalidRequest(format!(
            "{} does not support incrementals both before and after a synthetic full",
            request.platform()
        ))),
        (kind, Some(_)) => Err(EngineError::InvalidRequest(format!(
            "incremental level only applies to synthetic full backups, not {kind}"
        ))),
        (kind, None) => Ok(vec![kind]),
    }
}

/// Incremental duration compared with the chain's full.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeCheck {
    pub vm: String,
    pub full_secs: i64,
    pub incremental_secs: i64,
    pub limit_fraction: f64,
    pub exceeded: bool,
}

/// One submitted step of a backup request.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub kind: BackupKind,
    pub job: Job,
    /// Resubmission of the failed VMs, when one was needed
    pub retry_job: Option<Job>,
    pub retried_vms: Vec<String>,
    /// Synthetic-full parent resolved from child job links
    pub parent_job_id: Option<String>,
    pub time_checks: Vec<TimeCheck>,
}

impl StepReport {
    /// Job id other jobs refer to: the synthetic-full parent when known.
    pub fn job_id(&self) -> &str {
        self.parent_job_id.as_deref().unwrap_or(&self.job.id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub steps: Vec<StepReport>,
    /// Disks excluded by filter rules, per VM
    pub excluded_disks: BTreeMap<String, Vec<String>>,
}

impl BackupReport {
    /// The last step's job, which is the job the request asked for.
    pub fn job(&self) -> Option<&Job> {
        self.steps.last().map(|s| &s.job)
    }

    pub fn submitted_kinds(&self) -> Vec<BackupKind> {
        self.steps.iter().map(|s| s.kind).collect()
    }

    pub fn slow_incrementals(&self) -> impl Iterator<Item = &TimeCheck> {
        self.steps.iter().flat_map(|s| s.time_checks.iter()).filter(|c| c.exceeded)
    }
}

/// Disk filtering outcome for the whole request.
struct FilterPlan {
    excluded: BTreeMap<String, Vec<String>>,
    expected: HashMap<String, usize>,
}

impl Engine {
    /// Run a backup request to completion and validate every step.
    pub async fn submit_backup(&self, request: &BackupRequest) -> Result<BackupReport> {
        let adapter = self.dispatch.lookup(request.platform())?;
        let capabilities = adapter.capabilities();
        if request.cbt_enabled() && !capabilities.cbt {
            return Err(EngineError::InvalidRequest(format!(
                "{} does not support changed block tracking",
                adapter.platform()
            )));
        }
        if request.target_vms().is_empty() {
            return Err(EngineError::InvalidRequest("backup request names no VMs".to_string()));
        }

        let steps = plan_steps(request, capabilities)?;
        info!(
            platform = %adapter.platform(),
            kind = %request.kind(),
            steps = ?steps,
            vms = ?request.target_vms(),
            "Starting backup"
        );

        let filters = self.resolve_filters(request.target_vms()).await?;

        let mut reports = Vec::with_capacity(steps.len());
        for kind in steps {
            let report = self.run_step(adapter.as_ref(), request, kind, &filters).await?;
            info!(kind = %kind, job_id = %report.job_id(), "Backup step finished");
            reports.push(report);
        }

        Ok(BackupReport {
            steps: reports,
            excluded_disks: filters.excluded,
        })
    }

    /// Evaluate each VM's effective filter rules against its live disks.
    async fn resolve_filters(&self, vms: &[String]) -> Result<FilterPlan> {
        let mut excluded = BTreeMap::new();
        let mut expected = HashMap::new();

        for vm in vms {
            let disks = self.sdk.list_disks(vm).await?;
            let rules = {
                let mut inventory = self.inventory.write().await;
                let handle = inventory.require(vm)?;
                inventory.get_mut(handle).disks = disks.clone();
                inventory.effective_filters(handle)
            };

            let outcome = self.resolver.resolve(&disks, &rules)?;
            if outcome.remaining.is_empty() && !disks.is_empty() {
                warn!(vm = %vm, "Disk filters exclude every disk, VM will back up no disks");
            }
            debug!(
                vm = %vm,
                excluded = ?outcome.excluded,
                evaluated = outcome.evaluated,
                "Disk filters resolved"
            );
            expected.insert(vm.clone(), outcome.remaining.len());
            if !outcome.excluded.is_empty() {
                excluded.insert(vm.clone(), outcome.excluded_ids());
            }
        }

        Ok(FilterPlan { excluded, expected })
    }

    async fn submit_and_wait(
        &self,
        adapter: &dyn HypervisorAdapter,
        request: &BackupRequest,
        kind: BackupKind,
        vms: &[String],
        filters: &FilterPlan,
    ) -> Result<Outcome> {
        let excluded: BTreeMap<String, Vec<String>> = filters
            .excluded
            .iter()
            .filter(|(vm, _)| vms.contains(vm))
            .map(|(vm, disks)| (vm.clone(), disks.clone()))
            .collect();
        let options = adapter.backup_options(request, excluded);

        let job_id = self.sdk.submit_backup(vms, kind, &options).await?;
        info!(job_id = %job_id, kind = %kind, vms = ?vms, "Backup submitted");

        let handle = JobHandle::new(job_id, JobKind::Backup(kind), self.sdk.clone());
        self.monitor.wait_for_terminal(&handle, self.pending.as_ref()).await
    }

    async fn run_step(
        &self,
        adapter: &dyn HypervisorAdapter,
        request: &BackupRequest,
        kind: BackupKind,
        filters: &FilterPlan,
    ) -> Result<StepReport> {
        let outcome = self
            .submit_and_wait(adapter, request, kind, request.target_vms(), filters)
            .await?;

        let mut retry_job = None;
        let mut retried_vms = Vec::new();
        let job = match outcome {
            Outcome::Completed(job) => job,
            Outcome::CompletedWithErrors(job) if request.retry_failed_vms() && !job.failed_vms().is_empty() => {
                retried_vms = job.failed_vms();
                warn!(job_id = %job.id, vms = ?retried_vms, "Resubmitting backup for failed VMs only");
                let retry_request = request.for_vms(retried_vms.clone());
                let retry = self
                    .submit_and_wait(adapter, &retry_request, kind, &retried_vms, filters)
                    .await?;
                match retry {
                    Outcome::Completed(retried) => retry_job = Some(retried),
                    Outcome::CompletedWithErrors(retried) => return Err(first_failed_child(&retried)),
                }
                job
            }
            Outcome::CompletedWithErrors(job) => return Err(first_failed_child(&job)),
        };

        // VM -> job id to query for validation
        let mut per_vm: Vec<(String, String)> = completed_children(&job);
        if let Some(retried) = &retry_job {
            per_vm.extend(completed_children(retried));
        }

        let parent_job_id = if kind == BackupKind::SyntheticFull {
            let mut children: Vec<&Job> = job.children.iter().filter(|c| c.state == JobState::Completed).collect();
            if let Some(retried) = &retry_job {
                children.extend(retried.children.iter());
            }
            self.resolve_synthetic_parent(&children).await?
        } else {
            None
        };

        let mut time_checks = Vec::new();
        for (vm, job_id) in &per_vm {
            self.validate_disk_count(kind, vm, job_id, filters).await?;
            if request.cbt_enabled() {
                self.validate_cbt(kind, vm, job_id).await?;
            }
        }
        let finished = job.children.iter().chain(retry_job.iter().flat_map(|j| j.children.iter()));
        for child in finished.filter(|c| c.state == JobState::Completed) {
            if let Some(check) = self.check_backup_time(kind, child).await {
                time_checks.push(check);
            }
        }

        Ok(StepReport {
            kind,
            job,
            retry_job,
            retried_vms,
            parent_job_id,
            time_checks,
        })
    }

    /// Wait for every child to be linked to its synthetic-full parent. Links
    /// appear only after the children finish.
    async fn resolve_synthetic_parent(&self, children: &[&Job]) -> Result<Option<String>> {
        let mut parent: Option<String> = None;
        for child in children {
            let entity = format!("synthetic full parent link of job {}", child.id);
            let store = self.store.as_ref();
            let child_id = child.id.as_str();
            let linked = poll_until(
                &entity,
                self.config.cbt.link_timeout(),
                self.config.cbt.link_poll(),
                move || async move { store.parent_of(child_id).await },
            )
            .await?;

            match &parent {
                Some(existing) if *existing != linked => {
                    return Err(EngineError::job_failed(
                        child.id.clone(),
                        format!("linked to synthetic full {linked}, sibling jobs linked to {existing}"),
                    ));
                }
                Some(_) => {}
                None => {
                    debug!(child = %child.id, parent = %linked, "Synthetic full parent resolved");
                    parent = Some(linked);
                }
            }
        }
        Ok(parent)
    }

    async fn validate_disk_count(&self, kind: BackupKind, vm: &str, job_id: &str, filters: &FilterPlan) -> Result<()> {
        if !kind.reads_source() {
            return Ok(());
        }
        let Some(&expected) = filters.expected.get(vm) else {
            return Ok(());
        };

        let actual = self.sdk.backed_up_disks(job_id, vm).await?.len();
        if actual != expected {
            warn!(vm, job_id, expected, actual, "Backed-up disk count does not match filters");
            return Err(EngineError::DiskFilterValidation {
                vm: vm.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    async fn validate_cbt(&self, kind: BackupKind, vm: &str, job_id: &str) -> Result<()> {
        let changes = self.sdk.change_identifiers(job_id, vm).await?;
        let mut tracker = self.tracker.lock().await;

        for change in changes {
            let mut record = ChangeRecord::new(vm, &change.disk, kind, job_id, change.produced);
            record.consumed = change.consumed;
            self.store.append_change_record(&record).await?;
            let disk = record.disk.clone();
            tracker.record(record);
            tracker.verify(vm, &disk, kind)?;
        }
        drop(tracker);

        cbt::check_cbt_status(self.sdk.as_ref(), job_id, vm, kind).await
    }

    /// Compare an incremental child's duration with the VM's last full.
    async fn check_backup_time(&self, kind: BackupKind, child: &Job) -> Option<TimeCheck> {
        let vm = child.vm.clone()?;
        let secs = child.duration()?.num_seconds();
        let mut durations = self.full_durations.lock().await;

        match kind {
            BackupKind::Full => {
                durations.insert(vm, secs);
                None
            }
            BackupKind::Incremental => {
                let full_secs = match durations.get(&vm) {
                    Some(secs) => *secs,
                    None => {
                        let secs = self.previous_full_secs(&vm).await?;
                        durations.insert(vm.clone(), secs);
                        secs
                    }
                };
                let limit_fraction = self.config.cbt.incremental_time_fraction;
                let exceeded = full_secs > 0 && secs as f64 > full_secs as f64 * limit_fraction;
                if exceeded {
                    warn!(
                        vm = %vm,
                        job_id = %child.id,
                        incremental_secs = secs,
                        full_secs,
                        "Incremental took longer than expected relative to full"
                    );
                }
                Some(TimeCheck {
                    vm,
                    full_secs,
                    incremental_secs: secs,
                    limit_fraction,
                    exceeded,
                })
            }
            BackupKind::Differential | BackupKind::SyntheticFull => None,
        }
    }

    /// Duration of the VM's last recorded FULL, looked up through the metadata store.
    async fn previous_full_secs(&self, vm: &str) -> Option<i64> {
        let job_id = match self.store.last_job(vm, BackupKind::Full).await {
            Ok(job_id) => job_id?,
            Err(e) => {
                warn!(vm, error = %e, "Failed to look up previous full job");
                return None;
            }
        };
        let status = match self.sdk.get_status(&job_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(vm, job_id = %job_id, error = %e, "Failed to query previous full job");
                return None;
            }
        };
        let secs = (status.end_time? - status.start_time?).num_seconds();
        debug!(vm, job_id = %job_id, full_secs = secs, "Using duration of previous full job");
        Some(secs)
    }
}

fn completed_children(job: &Job) -> Vec<(String, String)> {
    job.children
        .iter()
        .filter(|c| c.state == JobState::Completed)
        .filter_map(|c| c.vm.clone().map(|vm| (vm, c.id.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(both: bool) -> AdapterCapabilities {
        AdapterCapabilities {
            synthetic_full_both: both,
            ..AdapterCapabilities::default()
        }
    }

    #[test]
    fn test_plan_steps() {
        let synth = BackupRequest::new("vmware", BackupKind::SyntheticFull, ["vm1"]);
        assert_eq!(plan_steps(&synth, caps(false)).unwrap(), vec![BackupKind::SyntheticFull]);

        let before = synth.clone().with_incr_level(IncrLevel::Before);
        assert_eq!(
            plan_steps(&before, caps(false)).unwrap(),
            vec![BackupKind::Incremental, BackupKind::SyntheticFull]
        );

        let after = synth.clone().with_incr_level(IncrLevel::After);
        assert_eq!(
            plan_steps(&after, caps(false)).unwrap(),
            vec![BackupKind::SyntheticFull, BackupKind::Incremental]
        );

        let both = synth.with_incr_level(IncrLevel::Both);
        assert!(plan_steps(&both, caps(false)).is_err());
        assert_eq!(
            plan_steps(&both, caps(true)).unwrap(),
            vec![BackupKind::Incremental, BackupKind::SyntheticFull, BackupKind::Incremental]
        );

        let full = BackupRequest::new("vmware", BackupKind::Full, ["vm1"]).with_incr_level(IncrLevel::Before);
        assert!(plan_steps(&full, caps(true)).is_err());
    }
}
