//! Scripted hypervisor and oracles.
//!
//! The simulator stands in for the vendor SDK in tests and dry runs. Each
//! job walks through a scripted list of states, one per status poll, and
//! stays on the last one. Backups derive chained change identifiers per disk
//! the way a CBT-capable hypervisor would.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::model::{BackupKind, ChildStatus, Disk, JobKind, JobState, JobStatus};
use crate::sdk::{
    BackupOptions, CbtStatus, ContentOracle, DiskChange, HypervisorSdk, MetadataStore, Placement, PlacementConstraints,
    PlacementOracle, RestoreParams,
};
use crate::utils::errors::{EngineError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One submission as seen by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub job_id: String,
    pub kind: JobKind,
    pub vms: Vec<String>,
    pub excluded_disks: HashMap<String, Vec<String>>,
}

#[derive(Debug)]
struct SimJob {
    kind: Option<JobKind>,
    states: VecDeque<JobState>,
    current: JobState,
    children: Vec<(String, String)>,
    failing: HashSet<String>,
    started: DateTime<Utc>,
    duration_secs: Option<i64>,
    linked: bool,
    /// Report FAILED on the parent once finished, whatever the children did
    parent_fails: bool,
}

impl SimJob {
    fn scripted(states: Vec<JobState>) -> Self {
        let mut states: VecDeque<JobState> = states.into();
        let current = states.pop_front().unwrap_or(JobState::Completed);
        Self {
            kind: None,
            states,
            current,
            children: Vec::new(),
            failing: HashSet::new(),
            started: Utc::now(),
            duration_secs: None,
            linked: false,
            parent_fails: false,
        }
    }

    /// State for this poll, then advance the script.
    fn step(&mut self) -> JobState {
        let state = self.current;
        if let Some(next) = self.states.pop_front() {
            self.current = next;
        }
        state
    }
}

#[derive(Debug, Default)]
struct CbtChain {
    full: Option<String>,
    last: Option<String>,
}

/// In-process stand-in for a hypervisor SDK.
#[derive(Default)]
pub struct SimulatedHypervisor {
    next_id: AtomicU64,
    next_change: AtomicU64,
    jobs: DashMap<String, SimJob>,
    next_scripts: Mutex<VecDeque<Vec<JobState>>>,
    submissions: Mutex<Vec<Submission>>,
    killed: Mutex<Vec<String>>,
    calls: DashMap<&'static str, u32>,
    disks: DashMap<String, Vec<Disk>>,
    powered_off: DashMap<String, bool>,
    /// Remaining child failures per VM; `u32::MAX` fails forever
    failing_vms: DashMap<String, u32>,
    chains: DashMap<(String, String), CbtChain>,
    changes: DashMap<(String, String), Vec<DiskChange>>,
    backed_up: DashMap<(String, String), Vec<String>>,
    cbt_status: DashMap<(String, String), CbtStatus>,
    corrupt_next: DashMap<(String, String), String>,
    artifacts: DashMap<String, Vec<String>>,
    artifact_polls: DashMap<String, u32>,
    durations: DashMap<BackupKind, i64>,
    ignore_filters: std::sync::atomic::AtomicBool,
    fail_parent_next: std::sync::atomic::AtomicBool,
    store: Mutex<Option<Arc<dyn MetadataStore>>>,
}

impl SimulatedHypervisor {
    pub fn new() -> Self {
        let sim = Self::default();
        sim.next_id.store(1000, Ordering::SeqCst);
        sim
    }

    /// Write synthetic-full job links to `store` once a job finishes.
    pub fn with_store(self, store: Arc<dyn MetadataStore>) -> Self {
        *lock(&self.store) = Some(store);
        self
    }

    pub fn add_vm(&self, name: impl Into<String>, disks: Vec<Disk>) {
        self.disks.insert(name.into(), disks);
    }

    /// Script the states reported for a job id that is never submitted.
    pub fn script_job<I: IntoIterator<Item = JobState>>(&self, job_id: &str, states: I) {
        self.jobs.insert(job_id.to_string(), SimJob::scripted(states.into_iter().collect()));
    }

    /// Script the states of the next submitted job.
    pub fn script_next<I: IntoIterator<Item = JobState>>(&self, states: I) {
        lock(&self.next_scripts).push_back(states.into_iter().collect());
    }

    /// Child jobs for this VM fail on every later submission.
    pub fn fail_vm(&self, vm: impl Into<String>) {
        self.failing_vms.insert(vm.into(), u32::MAX);
    }

    /// Child jobs for this VM fail on the next `times` submissions only.
    pub fn fail_vm_times(&self, vm: impl Into<String>, times: u32) {
        self.failing_vms.insert(vm.into(), times);
    }

    /// The next submitted job reports FAILED on the parent when it finishes.
    /// Children keep their own outcome.
    pub fn fail_parent_next(&self) {
        self.fail_parent_next.store(true, Ordering::SeqCst);
    }

    pub fn heal_vm(&self, vm: &str) {
        self.failing_vms.remove(vm);
    }

    /// Next incremental/differential on this disk consumes `bogus`.
    pub fn corrupt_next_change_id(&self, vm: &str, disk: &str, bogus: impl Into<String>) {
        self.corrupt_next.insert((vm.to_string(), disk.to_string()), bogus.into());
    }

    pub fn set_cbt_status(&self, job_id: &str, vm: &str, status: CbtStatus) {
        self.cbt_status.insert((job_id.to_string(), vm.to_string()), status);
    }

    /// Delta artifacts left on a VM, removed after `polls` queries (never if `None`).
    pub fn leave_artifacts(&self, vm: &str, artifacts: Vec<String>, polls: Option<u32>) {
        self.artifacts.insert(vm.to_string(), artifacts);
        match polls {
            Some(n) => self.artifact_polls.insert(vm.to_string(), n),
            None => self.artifact_polls.insert(vm.to_string(), u32::MAX),
        };
    }

    /// Report jobs of this kind as lasting `secs`.
    pub fn set_duration(&self, kind: BackupKind, secs: i64) {
        self.durations.insert(kind, secs);
    }

    /// Back up every disk regardless of the exclusions sent with the job.
    pub fn ignore_disk_filters(&self, ignore: bool) {
        self.ignore_filters.store(ignore, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.submissions).clone()
    }

    pub fn killed_jobs(&self) -> Vec<String> {
        lock(&self.killed).clone()
    }

    pub fn call_count(&self, call: &str) -> u32 {
        self.calls.get(call).map(|c| *c).unwrap_or(0)
    }

    pub fn is_powered_off(&self, vm: &str) -> bool {
        self.powered_off.get(vm).map(|v| *v).unwrap_or(false)
    }

    fn bump(&self, call: &'static str) {
        *self.calls.entry(call).or_insert(0) += 1;
    }

    fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn change_token(&self) -> String {
        format!("cid-{}", self.next_change.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn start_job(&self, kind: JobKind, vms: &[String], excluded: HashMap<String, Vec<String>>) -> String {
        let job_id = self.allocate_id();
        let script = lock(&self.next_scripts)
            .pop_front()
            .unwrap_or_else(|| vec![JobState::Running, JobState::Completed]);

        let mut job = SimJob::scripted(script);
        job.kind = Some(kind);
        job.parent_fails = self.fail_parent_next.swap(false, Ordering::SeqCst);
        for vm in vms {
            let child_id = self.allocate_id();
            if let Some(mut remaining) = self.failing_vms.get_mut(vm) {
                if *remaining > 0 {
                    job.failing.insert(child_id.clone());
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                }
            }
            job.children.push((child_id, vm.clone()));
        }
        if let JobKind::Backup(level) = kind {
            job.duration_secs = self.durations.get(&level).map(|d| *d);
        }

        debug!(job_id = %job_id, kind = %kind, vms = ?vms, "Simulated job submitted");
        lock(&self.submissions).push(Submission {
            job_id: job_id.clone(),
            kind,
            vms: vms.to_vec(),
            excluded_disks: excluded,
        });
        self.jobs.insert(job_id.clone(), job);
        job_id
    }

    fn record_changes(&self, job_ids: [&str; 2], vm: &str, kind: BackupKind, excluded: &[String]) {
        let disks = self.disks.get(vm).map(|d| d.clone()).unwrap_or_default();
        let ignore = self.ignore_filters.load(Ordering::SeqCst);
        let mut changes = Vec::new();
        let mut captured = Vec::new();

        for disk in disks {
            if !ignore && excluded.contains(&disk.id) {
                continue;
            }
            captured.push(disk.id.clone());

            let key = (vm.to_string(), disk.id.clone());
            let mut chain = self.chains.entry(key.clone()).or_default();
            let produced = self.change_token();
            let mut consumed = match kind {
                BackupKind::Full | BackupKind::SyntheticFull => None,
                BackupKind::Incremental => chain.last.clone(),
                BackupKind::Differential => chain.full.clone(),
            };
            if kind.consumes_change_id() {
                if let Some((_, bogus)) = self.corrupt_next.remove(&key) {
                    consumed = Some(bogus);
                }
            }
            match kind {
                BackupKind::Full => {
                    chain.full = Some(produced.clone());
                    chain.last = Some(produced.clone());
                }
                BackupKind::Incremental | BackupKind::Differential => chain.last = Some(produced.clone()),
                BackupKind::SyntheticFull => {}
            }

            changes.push(DiskChange {
                disk: disk.id,
                consumed,
                produced,
            });
        }

        let status = if kind == BackupKind::Full { CbtStatus::Enabled } else { CbtStatus::Used };
        for job_id in job_ids {
            let key = (job_id.to_string(), vm.to_string());
            self.cbt_status.entry(key.clone()).or_insert(status);
            self.changes.insert(key.clone(), changes.clone());
            self.backed_up.insert(key, captured.clone());
        }
    }

    /// Status of a per-VM child job. Does not advance the parent's script.
    fn child_status(&self, child_id: &str) -> Option<JobStatus> {
        self.jobs.iter().find_map(|job| {
            job.children.iter().find(|(id, _)| id == child_id)?;
            let state = Self::child_state(&job, child_id, job.current);
            let mut status = JobStatus::new(state);
            if let Some(secs) = job.duration_secs {
                status.start_time = Some(job.started);
                if state.is_terminal() {
                    status.end_time = Some(job.started + chrono::Duration::seconds(secs));
                }
            }
            Some(status)
        })
    }

    fn child_state(job: &SimJob, child_id: &str, parent: JobState) -> JobState {
        if !parent.is_terminal() {
            return JobState::Running;
        }
        if parent.is_failure() || job.failing.contains(child_id) {
            JobState::Failed
        } else {
            JobState::Completed
        }
    }
}

#[async_trait]
impl HypervisorSdk for SimulatedHypervisor {
    async fn submit_backup(&self, vms: &[String], kind: BackupKind, options: &BackupOptions) -> Result<String> {
        self.bump("submit_backup");
        let excluded: HashMap<String, Vec<String>> = options
            .excluded_disks
            .iter()
            .map(|(vm, disks)| (vm.clone(), disks.clone()))
            .collect();
        let job_id = self.start_job(JobKind::Backup(kind), vms, excluded.clone());

        let children: Vec<(String, String)> = self
            .jobs
            .get(&job_id)
            .map(|j| j.children.clone())
            .unwrap_or_default();
        for (child_id, vm) in &children {
            let skip = excluded.get(vm).cloned().unwrap_or_default();
            self.record_changes([job_id.as_str(), child_id.as_str()], vm, kind, &skip);
        }
        Ok(job_id)
    }

    async fn submit_restore(&self, params: &RestoreParams) -> Result<String> {
        self.bump("submit_restore");
        Ok(self.start_job(JobKind::Restore(params.kind), &params.vms, HashMap::new()))
    }

    async fn get_status(&self, job_id: &str) -> Result<JobStatus> {
        self.bump("get_status");
        let (status, link) = {
            let mut job = match self.jobs.get_mut(job_id) {
                Some(job) => job,
                None => {
                    return self
                        .child_status(job_id)
                        .ok_or_else(|| EngineError::Sdk(format!("unknown job {job_id}")))
                }
            };
            let state = job.step();
            let reported = if job.parent_fails && state == JobState::Completed {
                JobState::Failed
            } else {
                state
            };

            let children: Vec<ChildStatus> = job
                .children
                .iter()
                .map(|(id, vm)| {
                    let child = Self::child_state(&job, id, state);
                    ChildStatus {
                        job_id: id.clone(),
                        vm: vm.clone(),
                        state: child,
                        error_reason: child.is_failure().then(|| format!("simulated failure on {vm}")),
                    }
                })
                .collect();

            let mut status = JobStatus::new(reported);
            status.children = children;
            if reported.is_failure() {
                status.error_reason = Some(format!("simulated {} job {job_id}", reported));
            }
            if let Some(secs) = job.duration_secs {
                status.start_time = Some(job.started);
                if state.is_terminal() {
                    status.end_time = Some(job.started + chrono::Duration::seconds(secs));
                }
            }

            let link = state.is_terminal()
                && !job.linked
                && job.kind == Some(JobKind::Backup(BackupKind::SyntheticFull));
            if link {
                job.linked = true;
            }
            (status, link.then(|| job.children.clone()))
        };

        if let Some(children) = link {
            let store = lock(&self.store).clone();
            if let Some(store) = store {
                let parent = self.allocate_id();
                for (child_id, _) in children {
                    store.link_job(&child_id, &parent).await?;
                }
            }
        }

        Ok(status)
    }

    async fn kill(&self, job_id: &str) -> Result<()> {
        self.bump("kill");
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.states.clear();
            job.current = JobState::Killed;
        }
        lock(&self.killed).push(job_id.to_string());
        Ok(())
    }

    async fn pause(&self, _job_id: &str) -> Result<()> {
        self.bump("pause");
        Ok(())
    }

    async fn resume(&self, _job_id: &str) -> Result<()> {
        self.bump("resume");
        Ok(())
    }

    async fn list_disks(&self, vm: &str) -> Result<Vec<Disk>> {
        self.bump("list_disks");
        self.disks
            .get(vm)
            .map(|d| d.clone())
            .ok_or_else(|| EngineError::Sdk(format!("unknown VM {vm}")))
    }

    async fn power_off(&self, vm: &str) -> Result<()> {
        self.bump("power_off");
        self.powered_off.insert(vm.to_string(), true);
        Ok(())
    }

    async fn power_on(&self, vm: &str) -> Result<()> {
        self.bump("power_on");
        self.powered_off.insert(vm.to_string(), false);
        Ok(())
    }

    async fn change_identifiers(&self, job_id: &str, vm: &str) -> Result<Vec<DiskChange>> {
        Ok(self
            .changes
            .get(&(job_id.to_string(), vm.to_string()))
            .map(|c| c.clone())
            .unwrap_or_default())
    }

    async fn cbt_status(&self, job_id: &str, vm: &str) -> Result<CbtStatus> {
        Ok(self
            .cbt_status
            .get(&(job_id.to_string(), vm.to_string()))
            .map(|s| *s)
            .unwrap_or(CbtStatus::Disabled))
    }

    async fn backed_up_disks(&self, job_id: &str, vm: &str) -> Result<Vec<String>> {
        Ok(self
            .backed_up
            .get(&(job_id.to_string(), vm.to_string()))
            .map(|d| d.clone())
            .unwrap_or_default())
    }

    async fn delta_artifacts(&self, vm: &str) -> Result<Vec<String>> {
        self.bump("delta_artifacts");
        let remaining = match self.artifact_polls.get_mut(vm) {
            Some(mut polls) => {
                if *polls == 0 {
                    0
                } else {
                    if *polls != u32::MAX {
                        *polls -= 1;
                    }
                    *polls
                }
            }
            None => 0,
        };
        if remaining == 0 {
            self.artifacts.remove(vm);
            return Ok(Vec::new());
        }
        Ok(self.artifacts.get(vm).map(|a| a.clone()).unwrap_or_default())
    }
}

/// Content oracle with injectable differences.
#[derive(Debug, Default)]
pub struct InMemoryContentOracle {
    differences: DashMap<String, BTreeSet<String>>,
    compared: Mutex<Vec<(String, String)>>,
    removed: Mutex<Vec<String>>,
}

impl InMemoryContentOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Comparisons against any destination under `dest_prefix` report `difference`.
    pub fn inject_difference(&self, dest_prefix: &str, difference: impl Into<String>) {
        self.differences
            .entry(dest_prefix.to_string())
            .or_default()
            .insert(difference.into());
    }

    pub fn compared(&self) -> Vec<(String, String)> {
        lock(&self.compared).clone()
    }

    pub fn removed(&self) -> Vec<String> {
        lock(&self.removed).clone()
    }
}

#[async_trait]
impl ContentOracle for InMemoryContentOracle {
    async fn compare(&self, source_path: &str, dest_path: &str) -> Result<BTreeSet<String>> {
        lock(&self.compared).push((source_path.to_string(), dest_path.to_string()));
        let mut found = BTreeSet::new();
        for entry in self.differences.iter() {
            if dest_path.starts_with(entry.key().as_str()) {
                found.extend(entry.value().iter().cloned());
            }
        }
        Ok(found)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        lock(&self.removed).push(path.to_string());
        Ok(())
    }
}

/// Placement oracle returning a fixed answer.
#[derive(Debug, Default)]
pub struct StaticPlacementOracle {
    placement: Option<Placement>,
    calls: AtomicU32,
}

impl StaticPlacementOracle {
    pub fn new(placement: Option<Placement>) -> Self {
        Self {
            placement,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlacementOracle for StaticPlacementOracle {
    async fn compute_free_resources(
        &self,
        vms: &[String],
        constraints: &PlacementConstraints,
    ) -> Result<Option<Placement>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!(vms = ?vms, platform = %constraints.platform, "Computing simulated placement");
        Ok(self.placement.clone())
    }
}
