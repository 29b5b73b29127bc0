//! TOML scenarios run against the engine and the simulated hypervisor.
//!
//! A scenario names a platform, the VMs with their disks and filters, a few
//! simulator faults, and an ordered list of steps. Each step may state the
//! error it expects; a step passes when the outcome matches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vsa_orchestrator::inventory::{Inventory, VmRecord};
use vsa_orchestrator::model::{
    BackupKind, BackupRequest, DiskFilterRule, IncrLevel, RestoreKind, RestoreRequest, RestoreRequestBuilder,
    SnapshotRef,
};
use vsa_orchestrator::sdk::{MetadataStore, Placement};
use vsa_orchestrator::sim::{InMemoryContentOracle, SimulatedHypervisor, StaticPlacementOracle};
use vsa_orchestrator::{Collaborators, Engine, EngineConfig, EngineError};

#[derive(thiserror::Error, Debug)]
pub enum ScenarioError {
    #[error("Failed to read scenario: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse scenario: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Scenario '{scenario}' step {index} references unknown VM {vm}")]
    UnknownVm { scenario: String, index: usize, vm: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub platform: String,
    #[serde(default)]
    pub vms: Vec<VmRecord>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupFilters>,
    #[serde(default)]
    pub simulator: SimulatorSettings,
    /// Rebuild CBT chains from the metadata store before the first step
    #[serde(default)]
    pub resume_chains: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupFilters {
    #[serde(default)]
    pub filters: Vec<DiskFilterRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimulatorSettings {
    /// VMs whose child jobs always fail
    #[serde(default)]
    pub fail_vms: Vec<String>,
    #[serde(default)]
    pub ignore_disk_filters: bool,
    pub full_secs: Option<i64>,
    pub incremental_secs: Option<i64>,
    /// Placement the oracle computes; `None` means no capacity anywhere
    pub placement: Option<Placement>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Backup(BackupStep),
    Restore(RestoreStep),
    ParallelRestore { restores: Vec<RestoreStep> },
    PowerOffUnused {
        #[serde(default)]
        keep: Vec<String>,
    },
}

impl Step {
    fn op(&self) -> &'static str {
        match self {
            Step::Backup(_) => "backup",
            Step::Restore(_) => "restore",
            Step::ParallelRestore { .. } => "parallel_restore",
            Step::PowerOffUnused { .. } => "power_off_unused",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupStep {
    pub kind: BackupKind,
    /// Defaults to every scenario VM
    #[serde(default)]
    pub vms: Vec<String>,
    pub incr_level: Option<IncrLevel>,
    #[serde(default)]
    pub cbt: bool,
    #[serde(default)]
    pub retry_failed_vms: bool,
    /// VMs whose child jobs fail on this step only
    #[serde(default)]
    pub fail_once: Vec<String>,
    #[serde(default)]
    pub corrupt_change_ids: Vec<CorruptChangeId>,
    pub expect_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorruptChangeId {
    pub vm: String,
    pub disk: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestoreStep {
    pub kind: RestoreKind,
    #[serde(default)]
    pub vms: Vec<String>,
    /// Destination platform; defaults to the scenario platform
    pub platform: Option<String>,
    /// Defaults to the job of the latest backup step
    pub source_job: Option<String>,
    pub destination: Option<String>,
    #[serde(default)]
    pub in_place: bool,
    #[serde(default)]
    pub disks: Vec<String>,
    #[serde(default)]
    pub source_paths: Vec<String>,
    pub expect_error: Option<String>,
}

impl Scenario {
    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = toml::from_str(content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    fn validate(&self) -> Result<(), ScenarioError> {
        let known = |vm: &String| self.vms.iter().any(|r| &r.name == vm);
        for (index, step) in self.steps.iter().enumerate() {
            let named: Vec<&String> = match step {
                Step::Backup(b) => b.vms.iter().chain(&b.fail_once).collect(),
                Step::Restore(r) => r.vms.iter().collect(),
                Step::ParallelRestore { restores } => restores.iter().flat_map(|r| r.vms.iter()).collect(),
                Step::PowerOffUnused { keep } => keep.iter().collect(),
            };
            if let Some(vm) = named.into_iter().find(|vm| !known(vm)) {
                return Err(ScenarioError::UnknownVm {
                    scenario: self.name.clone(),
                    index,
                    vm: vm.clone(),
                });
            }
        }
        Ok(())
    }

    fn vm_names(&self) -> Vec<String> {
        self.vms.iter().map(|vm| vm.name.clone()).collect()
    }
}

/// Short name of an engine error, as used by `expect_error`.
pub fn error_kind(err: &EngineError) -> &'static str {
    match err {
        EngineError::DispatchNotFound { .. } => "dispatch_not_found",
        EngineError::PlacementResolution { .. } => "placement_resolution",
        EngineError::JobFailed { .. } => "job_failed",
        EngineError::JobPendingExhausted { .. } => "job_pending_exhausted",
        EngineError::DiskFilterValidation { .. } => "disk_filter_validation",
        EngineError::CbtValidation { .. } => "cbt_validation",
        EngineError::CbtResidue { .. } => "cbt_residue",
        EngineError::DataValidation { .. } => "data_validation",
        EngineError::Timeout { .. } => "timeout",
        EngineError::Cancelled { .. } => "cancelled",
        EngineError::InvalidRequest(_) => "invalid_request",
        EngineError::Sdk(_) => "sdk",
        EngineError::Metadata(_) => "metadata",
        EngineError::Config(_) => "config",
        EngineError::Io(_) => "io",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub index: usize,
    pub op: &'static str,
    pub job_ids: Vec<String>,
    pub error: Option<String>,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub steps: Vec<StepResult>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.steps.iter().all(|s| s.passed)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| !s.passed)
    }
}

fn default_placement() -> Placement {
    Placement {
        proxy: "sim-proxy".into(),
        host: "sim-host-01".into(),
        datastore: "sim-datastore-01".into(),
        network: "sim-network".into(),
        resource_group: None,
        region: None,
    }
}

pub struct ScenarioRunner {
    scenario: Scenario,
    engine: Arc<Engine>,
    sim: Arc<SimulatedHypervisor>,
    last_backup_job: Option<String>,
}

impl ScenarioRunner {
    pub fn new(
        scenario: Scenario,
        config: EngineConfig,
        store: Arc<dyn MetadataStore>,
        cancel: CancellationToken,
    ) -> Self {
        let sim = Arc::new(SimulatedHypervisor::new().with_store(store.clone()));
        let settings = &scenario.simulator;
        for vm in &scenario.vms {
            sim.add_vm(vm.name.clone(), vm.disks.clone());
        }
        for vm in &settings.fail_vms {
            sim.fail_vm(vm.clone());
        }
        sim.ignore_disk_filters(settings.ignore_disk_filters);
        if let Some(secs) = settings.full_secs {
            sim.set_duration(BackupKind::Full, secs);
        }
        if let Some(secs) = settings.incremental_secs {
            sim.set_duration(BackupKind::Incremental, secs);
        }

        let mut inventory = Inventory::new();
        for (group, filters) in &scenario.groups {
            inventory.set_group_filters(group.clone(), filters.filters.clone());
        }
        for vm in &scenario.vms {
            inventory.insert(vm.clone());
        }

        let placement = settings.placement.clone().or_else(|| Some(default_placement()));
        let engine = Engine::new(
            config,
            Collaborators {
                sdk: sim.clone(),
                store,
                content: Arc::new(InMemoryContentOracle::new()),
                placement: Arc::new(StaticPlacementOracle::new(placement)),
            },
        )
        .with_cancel(cancel)
        .with_inventory(inventory);

        Self {
            scenario,
            engine: Arc::new(engine),
            sim,
            last_backup_job: None,
        }
    }

    pub fn simulator(&self) -> &SimulatedHypervisor {
        &self.sim
    }

    pub async fn run(&mut self) -> anyhow::Result<ScenarioReport> {
        info!(scenario = %self.scenario.name, steps = self.scenario.steps.len(), "Running scenario");

        if self.scenario.resume_chains {
            self.engine.resume_chains(&self.scenario.vm_names()).await?;
        }

        let steps = self.scenario.steps.clone();
        let mut results = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let result = self.run_step(index, step).await;
            if result.passed {
                info!(index, op = result.op, jobs = ?result.job_ids, "Step passed");
            } else {
                warn!(index, op = result.op, error = ?result.error, "Step failed");
            }
            results.push(result);
        }

        Ok(ScenarioReport {
            name: self.scenario.name.clone(),
            steps: results,
        })
    }

    async fn run_step(&mut self, index: usize, step: &Step) -> StepResult {
        let op = step.op();
        match step {
            Step::Backup(backup) => {
                let outcome = self.run_backup(backup).await;
                judge(index, op, outcome, backup.expect_error.as_deref())
            }
            Step::Restore(restore) => {
                let outcome = self.run_restore(restore).await;
                judge(index, op, outcome, restore.expect_error.as_deref())
            }
            Step::ParallelRestore { restores } => self.run_parallel(index, restores).await,
            Step::PowerOffUnused { keep } => {
                let outcome = self.engine.power_off_unused_vms(keep).await.map(|_| Vec::new());
                judge(index, op, outcome, None)
            }
        }
    }

    async fn run_backup(&mut self, step: &BackupStep) -> Result<Vec<String>, EngineError> {
        for vm in &step.fail_once {
            self.sim.fail_vm_times(vm.clone(), 1);
        }
        for corrupt in &step.corrupt_change_ids {
            self.sim.corrupt_next_change_id(&corrupt.vm, &corrupt.disk, corrupt.value.clone());
        }

        let vms = if step.vms.is_empty() { self.scenario.vm_names() } else { step.vms.clone() };
        let mut request = BackupRequest::new(self.scenario.platform.clone(), step.kind, vms)
            .with_cbt(step.cbt)
            .with_retry_failed_vms(step.retry_failed_vms);
        if let Some(level) = step.incr_level {
            request = request.with_incr_level(level);
        }

        let report = self.engine.submit_backup(&request).await?;
        for check in report.slow_incrementals() {
            warn!(vm = %check.vm, incremental_secs = check.incremental_secs, full_secs = check.full_secs, "Slow incremental");
        }
        let job_ids: Vec<String> = report.steps.iter().map(|s| s.job_id().to_string()).collect();
        self.last_backup_job = job_ids.last().cloned();
        Ok(job_ids)
    }

    fn restore_request(&self, step: &RestoreStep) -> Result<RestoreRequest, EngineError> {
        let source = step
            .source_job
            .clone()
            .or_else(|| self.last_backup_job.clone())
            .ok_or_else(|| EngineError::InvalidRequest("restore step has no source job and no earlier backup".into()))?;
        let vms = if step.vms.is_empty() { self.scenario.vm_names() } else { step.vms.clone() };
        let platform = step.platform.clone().unwrap_or_else(|| self.scenario.platform.clone());

        let mut builder = RestoreRequestBuilder::new(platform, step.kind)
            .from_snapshot(SnapshotRef::job(source))
            .with_vms(vms)
            .in_place(step.in_place)
            .with_disks(step.disks.clone())
            .with_source_paths(step.source_paths.clone());
        if let Some(destination) = &step.destination {
            builder = builder.with_destination(destination.clone());
        }
        builder.resolve()
    }

    async fn run_restore(&self, step: &RestoreStep) -> Result<Vec<String>, EngineError> {
        let request = self.restore_request(step)?;
        let report = self.engine.submit_restore(&request).await?;
        Ok(vec![report.job.id])
    }

    async fn run_parallel(&self, index: usize, steps: &[RestoreStep]) -> StepResult {
        let mut requests = Vec::with_capacity(steps.len());
        for step in steps {
            match self.restore_request(step) {
                Ok(request) => requests.push(request),
                Err(e) => return judge(index, "parallel_restore", Err(e), step.expect_error.as_deref()),
            }
        }

        let results = self.engine.run_parallel_restores(requests).await;
        let mut job_ids = Vec::new();
        let mut errors = Vec::new();
        let mut passed = true;
        for (step, result) in steps.iter().zip(results) {
            let judged = judge(index, "parallel_restore", result.map(|r| vec![r.job.id]), step.expect_error.as_deref());
            passed &= judged.passed;
            job_ids.extend(judged.job_ids);
            errors.extend(judged.error);
        }

        StepResult {
            index,
            op: "parallel_restore",
            job_ids,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            passed,
        }
    }
}

fn judge(index: usize, op: &'static str, outcome: Result<Vec<String>, EngineError>, expect: Option<&str>) -> StepResult {
    let (job_ids, error, passed) = match (outcome, expect) {
        (Ok(ids), None) => (ids, None, true),
        (Ok(ids), Some(expected)) => (ids, Some(format!("expected {expected} error, step succeeded")), false),
        (Err(e), Some(expected)) => {
            let matched = error_kind(&e) == expected;
            (Vec::new(), Some(e.to_string()), matched)
        }
        (Err(e), None) => (Vec::new(), Some(e.to_string()), false),
    };
    StepResult {
        index,
        op,
        job_ids,
        error,
        passed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsa_orchestrator::store::InMemoryStore;

    const CHAIN: &str = r#"
        name = "vmware chain"
        platform = "vmware"

        [groups.sc1]
        filters = [{ rule_type = "datastore_uri", pattern = "ds-scratch*" }]

        [[vms]]
        name = "vm1"
        platform = "vmware"
        group = "sc1"
        disks = [{ id = "d1", datastore = "ds-prod" }, { id = "d2", datastore = "ds-scratch-1" }]

        [[steps]]
        op = "backup"
        kind = "full"
        cbt = true

        [[steps]]
        op = "backup"
        kind = "synthetic_full"
        incr_level = "before"
        cbt = true

        [[steps]]
        op = "backup"
        kind = "incremental"
        cbt = true
        corrupt_change_ids = [{ vm = "vm1", disk = "d1", value = "cid-wrong" }]
        expect_error = "cbt_validation"

        [[steps]]
        op = "restore"
        kind = "guest_file"
        destination = "proxy-1"
        source_paths = ["/etc/hosts"]
    "#;

    fn runner(content: &str) -> ScenarioRunner {
        ScenarioRunner::new(
            Scenario::parse(content).unwrap(),
            EngineConfig::fast(),
            Arc::new(InMemoryStore::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_chain_scenario_passes() {
        let mut runner = runner(CHAIN);
        let report = runner.run().await.unwrap();

        let failed: Vec<_> = report.failed_steps().collect();
        assert!(failed.is_empty(), "failed steps: {failed:?}");
        assert_eq!(report.steps[1].job_ids.len(), 2);
        assert_eq!(report.steps[2].error.as_deref().map(|e| e.contains("cid-wrong")), Some(true));

        // The group filter kept the scratch disk out of every submission
        for submission in runner.simulator().submissions().iter().filter(|s| s.vms.contains(&"vm1".to_string())) {
            if matches!(submission.kind, vsa_orchestrator::model::JobKind::Backup(_)) {
                assert_eq!(submission.excluded_disks.get("vm1"), Some(&vec!["d2".to_string()]));
            }
        }
    }

    const NO_CAPACITY: &str = r#"
        name = "no capacity"
        platform = "aws"

        [[vms]]
        name = "vm1"
        platform = "aws"

        [[steps]]
        op = "restore"
        kind = "full_vm"
        source_job = "77"
    "#;

    fn runner_without_placement(content: &str) -> ScenarioRunner {
        let mut scenario = Scenario::parse(content).unwrap();
        scenario.simulator.placement = None;
        ScenarioRunner::new(
            scenario,
            EngineConfig::fast(),
            Arc::new(InMemoryStore::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_unexpected_error_fails_step() {
        let report = runner_without_placement(NO_CAPACITY).run().await.unwrap();
        assert!(!report.passed());
        assert!(report.steps[0].error.as_deref().unwrap_or_default().contains("Placement resolution failed"));
    }

    #[tokio::test]
    async fn test_expected_error_passes_step() {
        let content = format!("{NO_CAPACITY}\n        expect_error = \"placement_resolution\"\n");
        let report = runner_without_placement(&content).run().await.unwrap();
        assert!(report.passed(), "{:?}", report.steps);
    }

    #[test]
    fn test_unknown_vm_rejected() {
        let err = Scenario::parse(
            r#"
            name = "typo"
            platform = "vmware"

            [[vms]]
            name = "vm1"
            platform = "vmware"

            [[steps]]
            op = "power_off_unused"
            keep = ["vm9"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ScenarioError::UnknownVm { index: 0, ref vm, .. } if vm == "vm9"));
    }
}
