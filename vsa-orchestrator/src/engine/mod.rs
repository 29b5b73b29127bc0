//! Orchestration engine.
//!
//! Turns backup and restore requests into hypervisor jobs, drives them to a
//! terminal state and validates the result. Backup flow lives in
//! [`backup`], restore flow in [`restore`].

pub mod backup;
pub mod restore;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, RwLockReadGuard, RwLockWriteGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cbt::ChangeTracker;
use crate::config::EngineConfig;
use crate::dispatch::DispatchTable;
use crate::filter::DiskFilterResolver;
use crate::inventory::{Inventory, PowerState};
use crate::monitor::{JobMonitor, NoRecovery, PendingHandler};
use crate::sdk::{ContentOracle, HypervisorSdk, MetadataStore, PlacementOracle};
use crate::utils::errors::{EngineError, Result};

pub use backup::{plan_steps, BackupReport, StepReport, TimeCheck};
pub use restore::RestoreReport;

/// External systems the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub sdk: Arc<dyn HypervisorSdk>,
    pub store: Arc<dyn MetadataStore>,
    pub content: Arc<dyn ContentOracle>,
    pub placement: Arc<dyn PlacementOracle>,
}

pub struct Engine {
    config: EngineConfig,
    sdk: Arc<dyn HypervisorSdk>,
    store: Arc<dyn MetadataStore>,
    content: Arc<dyn ContentOracle>,
    placement: Arc<dyn PlacementOracle>,
    dispatch: DispatchTable,
    monitor: JobMonitor,
    pending: Arc<dyn PendingHandler>,
    resolver: DiskFilterResolver,
    inventory: RwLock<Inventory>,
    tracker: Mutex<ChangeTracker>,
    /// Per-VM wall-clock seconds of the last FULL backup
    full_durations: Mutex<HashMap<String, i64>>,
    restore_slots: Arc<Semaphore>,
    vm_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let monitor = JobMonitor::new(&config.monitor, CancellationToken::new());
        let restore_slots = Arc::new(Semaphore::new(config.restore.max_parallel.max(1)));
        Self {
            sdk: collaborators.sdk,
            store: collaborators.store,
            content: collaborators.content,
            placement: collaborators.placement,
            dispatch: DispatchTable::with_defaults(),
            monitor,
            pending: Arc::new(NoRecovery),
            resolver: DiskFilterResolver::new(),
            inventory: RwLock::new(Inventory::new()),
            tracker: Mutex::new(ChangeTracker::new()),
            full_durations: Mutex::new(HashMap::new()),
            restore_slots,
            vm_semaphores: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchTable) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Recovery action run while a job is PENDING.
    pub fn with_pending_handler(mut self, handler: Arc<dyn PendingHandler>) -> Self {
        self.pending = handler;
        self
    }

    /// Cancelling `token` kills whatever job the engine is waiting on.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.monitor = JobMonitor::new(&self.config.monitor, token);
        self
    }

    pub fn with_inventory(mut self, inventory: Inventory) -> Self {
        self.inventory = RwLock::new(inventory);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub async fn inventory(&self) -> RwLockReadGuard<'_, Inventory> {
        self.inventory.read().await
    }

    pub async fn inventory_mut(&self) -> RwLockWriteGuard<'_, Inventory> {
        self.inventory.write().await
    }

    /// Rebuild CBT chains for `vms` from persisted change records. Chains
    /// already tracked for other VMs are kept.
    pub async fn resume_chains(&self, vms: &[String]) -> Result<usize> {
        let mut records = Vec::new();
        for vm in vms {
            records.extend(self.store.change_records(vm).await?);
        }
        records.sort_by_key(|r| r.recorded_at);
        let count = self.tracker.lock().await.reload(vms, records);
        info!(vms = vms.len(), records = count, "CBT chains restored from metadata store");
        Ok(count)
    }

    /// Power off every powered-on VM in the inventory not listed in `keep`.
    ///
    /// Only runs when called; no backup or restore powers VMs off implicitly.
    pub async fn power_off_unused_vms(&self, keep: &[String]) -> Result<Vec<String>> {
        let targets: Vec<String> = {
            let inventory = self.inventory.read().await;
            inventory
                .iter()
                .filter(|(_, vm)| vm.power == PowerState::On && !keep.contains(&vm.name))
                .map(|(_, vm)| vm.name.clone())
                .collect()
        };

        for vm in &targets {
            self.sdk.power_off(vm).await?;
            let mut inventory = self.inventory.write().await;
            if let Some(handle) = inventory.handle(vm) {
                inventory.get_mut(handle).power = PowerState::Off;
            }
            info!(vm = %vm, "Powered off unused VM");
        }

        Ok(targets)
    }

    pub async fn power_on_vms(&self, vms: &[String]) -> Result<()> {
        for vm in vms {
            self.sdk.power_on(vm).await?;
            let mut inventory = self.inventory.write().await;
            if let Some(handle) = inventory.handle(vm) {
                inventory.get_mut(handle).power = PowerState::On;
            }
        }
        Ok(())
    }

    async fn get_vm_semaphore(&self, vm: &str) -> Arc<Semaphore> {
        let mut map = self.vm_semaphores.lock().await;
        map.entry(vm.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Exclusive permits for a VM set, taken in name order.
    async fn lock_vms(&self, vms: &[String]) -> Result<Vec<OwnedSemaphorePermit>> {
        let mut names: Vec<&String> = vms.iter().collect();
        names.sort();
        names.dedup();

        let mut permits = Vec::with_capacity(names.len());
        for vm in names {
            let semaphore = self.get_vm_semaphore(vm).await;
            let permit = semaphore.acquire_owned().await.map_err(|e| {
                warn!(vm = %vm, error = %e, "VM lock closed");
                EngineError::Cancelled { job_id: format!("lock on VM {vm}") }
            })?;
            permits.push(permit);
        }
        Ok(permits)
    }
}
