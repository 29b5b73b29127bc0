//! Restore orchestration.

use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::monitor::first_failed_child;
use super::Engine;
use crate::cbt;
use crate::dispatch::PlacementSession;
use crate::inventory::PowerState;
use crate::model::{Job, Outcome, PowerOnPolicy, RestoreKind, RestoreRequest};
use crate::sdk::PlacementConstraints;
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub kind: RestoreKind,
    pub job: Job,
    /// Inventory records created for a cross-platform destination
    pub cloned_vms: Vec<String>,
    /// (source, destination) pairs checked by the content oracle
    pub compared: Vec<(String, String)>,
    /// Paths removed after validation
    pub cleaned: Vec<String>,
}

impl Engine {
    /// Submit a restore, wait for every child to complete and validate the
    /// restored data.
    pub async fn submit_restore(&self, request: &RestoreRequest) -> Result<RestoreReport> {
        let adapter = self.dispatch.lookup(request.platform())?;
        info!(
            platform = %adapter.platform(),
            kind = %request.kind(),
            source_job = %request.source().job_id,
            vms = ?request.vms(),
            in_place = request.is_in_place(),
            "Starting restore"
        );

        let cloned_vms = self.clone_for_destination(request).await?;

        let handle = {
            let _permits = self.lock_vms(request.vms()).await?;
            let constraints = PlacementConstraints {
                platform: adapter.platform().to_string(),
                min_free_bytes: self.config.restore.min_free_bytes,
                preferred_host: request.destination().host.clone(),
                preferred_datastore: request.destination().storage.clone(),
                region: request.destination().region.clone(),
            };
            let mut session = PlacementSession::new(self.placement.clone(), request.vms().to_vec(), constraints);
            adapter.submit_restore(self.sdk.clone(), request, &mut session).await?
        };

        let job = match self.monitor.wait_for_terminal(&handle, self.pending.as_ref()).await {
            Ok(Outcome::Completed(job)) => job,
            Ok(Outcome::CompletedWithErrors(job)) => {
                self.compensate(request).await;
                return Err(first_failed_child(&job));
            }
            Err(e) => {
                self.compensate(request).await;
                return Err(e);
            }
        };

        if request.kind() == RestoreKind::FullVm {
            self.finish_full_vm(request).await?;
        }

        let mut compared = Vec::new();
        let mut cleaned = Vec::new();
        if request.kind().writes_files() {
            let result = self.compare_content(request, &job, &mut compared).await;
            cleaned = self.cleanup(request).await?;
            result?;
        }

        info!(job_id = %job.id, kind = %request.kind(), "Restore validated");
        Ok(RestoreReport {
            kind: request.kind(),
            job,
            cloned_vms,
            compared,
            cleaned,
        })
    }

    /// Run several restores at once, at most `restore.max_parallel` at a time.
    /// Results come back in request order.
    pub async fn run_parallel_restores(self: &Arc<Self>, requests: Vec<RestoreRequest>) -> Vec<Result<RestoreReport>> {
        info!(count = requests.len(), "Starting parallel restores");

        let mut tasks = Vec::with_capacity(requests.len());
        for request in requests {
            let engine = Arc::clone(self);
            let slots = Arc::clone(&self.restore_slots);
            let request = request.as_thread_part();
            tasks.push(tokio::spawn(async move {
                let _slot = slots.acquire_owned().await.map_err(|_| EngineError::Cancelled {
                    job_id: format!("{} restore worker", request.kind()),
                })?;
                engine.submit_restore(&request).await
            }));
        }

        join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|e| Err(EngineError::job_failed("restore worker", e.to_string()))))
            .collect()
    }

    /// Clone inventory records when restoring a VM onto another platform.
    async fn clone_for_destination(&self, request: &RestoreRequest) -> Result<Vec<String>> {
        if request.kind() != RestoreKind::FullVm || request.is_in_place() {
            return Ok(Vec::new());
        }

        let mut inventory = self.inventory.write().await;
        let mut cloned = Vec::new();
        for vm in request.vms() {
            let Some(source) = inventory.handle(vm) else {
                continue;
            };
            if inventory.get(source).platform.eq_ignore_ascii_case(request.platform()) {
                continue;
            }

            let name = format!("{vm}_{}", request.platform().to_ascii_lowercase());
            if inventory.handle(&name).is_some() {
                debug!(vm = %vm, clone = %name, "Destination record already present");
                continue;
            }
            inventory.snapshot_and_clone(source, &name, request.platform())?;
            info!(vm = %vm, clone = %name, platform = %request.platform(), "Cloned VM record for destination platform");
            cloned.push(name);
        }
        Ok(cloned)
    }

    async fn finish_full_vm(&self, request: &RestoreRequest) -> Result<()> {
        if request.is_in_place() {
            for vm in request.vms() {
                cbt::verify_pruned(
                    self.sdk.as_ref(),
                    vm,
                    self.config.cbt.prune_timeout(),
                    self.config.cbt.prune_poll(),
                )
                .await?;
            }
        }

        let power = match request.power_on() {
            PowerOnPolicy::PowerOn => PowerState::On,
            PowerOnPolicy::LeaveOff => PowerState::Off,
        };
        let mut inventory = self.inventory.write().await;
        for vm in request.vms() {
            let name = if request.is_in_place() {
                vm.clone()
            } else {
                let clone = format!("{vm}_{}", request.platform().to_ascii_lowercase());
                if inventory.handle(&clone).is_some() { clone } else { vm.clone() }
            };
            if let Some(handle) = inventory.handle(&name) {
                inventory.get_mut(handle).power = power;
            }
        }
        Ok(())
    }

    async fn compare_content(
        &self,
        request: &RestoreRequest,
        job: &Job,
        compared: &mut Vec<(String, String)>,
    ) -> Result<()> {
        let sources = if request.source_paths().is_empty() {
            request.disks()
        } else {
            request.source_paths()
        };
        if sources.is_empty() {
            debug!(job_id = %job.id, "No source paths to compare");
            return Ok(());
        }

        let mut differences = Vec::new();
        for vm in request.vms() {
            let dest = vm_folder(request, vm);
            for source in sources {
                let found = self.content.compare(source, &dest).await?;
                compared.push((source.clone(), dest.clone()));
                differences.extend(found.into_iter().map(|d| format!("{vm}: {d}")));
            }
        }

        if differences.is_empty() {
            return Ok(());
        }
        warn!(job_id = %job.id, count = differences.len(), "Restored content differs from source");
        Err(EngineError::DataValidation {
            job_id: job.id.clone(),
            differences,
        })
    }

    /// Remove restored data. Parallel workers only touch their own VM folders
    /// and never fail the restore on a cleanup error.
    async fn cleanup(&self, request: &RestoreRequest) -> Result<Vec<String>> {
        if request.restore_path().is_empty() {
            return Ok(Vec::new());
        }

        if !request.is_part_of_thread() {
            self.content.remove(request.restore_path()).await?;
            return Ok(vec![request.restore_path().to_string()]);
        }

        let mut cleaned = Vec::new();
        for vm in request.vms() {
            let folder = vm_folder(request, vm);
            match self.content.remove(&folder).await {
                Ok(()) => cleaned.push(folder),
                Err(e) => warn!(path = %folder, error = %e, "Failed to clean up restore folder"),
            }
        }
        Ok(cleaned)
    }

    /// Best-effort cleanup after a failed restore.
    async fn compensate(&self, request: &RestoreRequest) {
        if !request.kind().writes_files() {
            return;
        }
        if let Err(e) = self.cleanup(request).await {
            warn!(path = %request.restore_path(), error = %e, "Cleanup after failed restore did not complete");
        }
    }
}

fn vm_folder(request: &RestoreRequest, vm: &str) -> String {
    format!("{}/{vm}", request.restore_path().trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Collaborators;
    use crate::inventory::{Inventory, VmRecord};
    use crate::model::{JobState, SnapshotRef};
    use crate::sdk::Placement;
    use crate::sim::{InMemoryContentOracle, SimulatedHypervisor, StaticPlacementOracle};
    use crate::store::InMemoryStore;

    struct Fixture {
        sim: Arc<SimulatedHypervisor>,
        content: Arc<InMemoryContentOracle>,
        engine: Engine,
    }

    fn fixture(inventory: Inventory) -> Fixture {
        let sim = Arc::new(SimulatedHypervisor::new());
        let content = Arc::new(InMemoryContentOracle::new());
        let placement = Arc::new(StaticPlacementOracle::new(Some(Placement {
            proxy: "proxy-1".into(),
            host: "esx-1".into(),
            datastore: "ds-1".into(),
            network: "lan".into(),
            resource_group: None,
            region: None,
        })));
        let engine = Engine::new(
            EngineConfig::fast(),
            Collaborators {
                sdk: sim.clone(),
                store: Arc::new(InMemoryStore::new()),
                content: content.clone(),
                placement,
            },
        )
        .with_inventory(inventory);
        Fixture { sim, content, engine }
    }

    fn guest_file_request() -> RestoreRequest {
        crate::model::RestoreRequestBuilder::new("vmware", RestoreKind::GuestFile)
            .from_snapshot(SnapshotRef::job("500"))
            .with_vms(["vm1"])
            .with_destination("proxy-7")
            .with_source_paths(["/data/a.txt"])
            .resolve()
            .unwrap()
    }

    #[tokio::test]
    async fn test_guest_file_restore_compares_and_cleans() {
        let f = fixture(Inventory::new());
        let report = f.engine.submit_restore(&guest_file_request()).await.unwrap();

        assert_eq!(report.job.state, JobState::Completed);
        assert_eq!(
            report.compared,
            vec![("/data/a.txt".to_string(), "/vsa_restore/guest_file/500/vm1".to_string())]
        );
        assert_eq!(f.content.removed(), vec!["/vsa_restore/guest_file/500".to_string()]);
    }

    #[tokio::test]
    async fn test_content_difference_fails_after_cleanup() {
        let f = fixture(Inventory::new());
        f.content.inject_difference("/vsa_restore/guest_file/500/vm1", "a.txt: checksum mismatch");

        let err = f.engine.submit_restore(&guest_file_request()).await.unwrap_err();
        match err {
            EngineError::DataValidation { differences, .. } => {
                assert_eq!(differences, vec!["vm1: a.txt: checksum mismatch".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.content.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_cross_platform_restore_clones_record() {
        let mut inventory = Inventory::new();
        inventory.insert(VmRecord::new("vm1", "vmware"));
        let f = fixture(inventory);

        let request = crate::model::RestoreRequestBuilder::new("hyperv", RestoreKind::FullVm)
            .from_snapshot(SnapshotRef::job("600"))
            .with_vms(["vm1"])
            .resolve()
            .unwrap();
        let report = f.engine.submit_restore(&request).await.unwrap();

        assert_eq!(report.cloned_vms, vec!["vm1_hyperv".to_string()]);
        let inventory = f.engine.inventory().await;
        let clone = inventory.get(inventory.require("vm1_hyperv").unwrap());
        assert_eq!(clone.platform, "hyperv");
        assert_eq!(clone.power, PowerState::On);
        assert_eq!(inventory.get(inventory.require("vm1").unwrap()).platform, "vmware");
    }

    #[tokio::test]
    async fn test_in_place_restore_waits_for_prune() {
        let f = fixture(Inventory::new());
        f.sim.leave_artifacts("vm1", vec!["vm1-000001.vmdk".into()], None);

        let request = crate::model::RestoreRequestBuilder::new("vmware", RestoreKind::FullVm)
            .from_snapshot(SnapshotRef::job("700"))
            .with_vms(["vm1"])
            .in_place(true)
            .resolve()
            .unwrap();

        let err = f.engine.submit_restore(&request).await.unwrap_err();
        assert!(matches!(err, EngineError::CbtResidue { ref vm, .. } if vm == "vm1"));
    }
}
