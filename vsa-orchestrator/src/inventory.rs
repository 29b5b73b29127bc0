//! VM inventory arena.
//!
//! VM records live in one arena and are addressed by [`VmHandle`]. Copying a
//! VM for a destination platform is an explicit [`Inventory::snapshot_and_clone`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::filter::merge_rules;
use crate::model::{Disk, DiskFilterRule};
use crate::utils::errors::{EngineError, Result};

/// Stable index of a VM record in an [`Inventory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmHandle(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    #[default]
    On,
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub platform: String,
    #[serde(default)]
    pub disks: Vec<Disk>,
    /// VM group (subclient) whose filters apply to this VM
    #[serde(default)]
    pub group: Option<String>,
    /// VM-level filters; `None` means only group filters apply
    #[serde(default)]
    pub filters: Option<Vec<DiskFilterRule>>,
    #[serde(default)]
    pub include_group_filters: bool,
    #[serde(default)]
    pub power: PowerState,
}

impl VmRecord {
    pub fn new(name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
            disks: Vec::new(),
            group: None,
            filters: None,
            include_group_filters: false,
            power: PowerState::On,
        }
    }

    pub fn with_disks(mut self, disks: Vec<Disk>) -> Self {
        self.disks = disks;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_filters(mut self, filters: Vec<DiskFilterRule>, include_group_filters: bool) -> Self {
        self.filters = Some(filters);
        self.include_group_filters = include_group_filters;
        self
    }
}

#[derive(Debug, Default, Clone)]
pub struct Inventory {
    vms: Vec<VmRecord>,
    by_name: HashMap<String, VmHandle>,
    group_filters: HashMap<String, Vec<DiskFilterRule>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a VM, replacing any record with the same name in place.
    pub fn insert(&mut self, record: VmRecord) -> VmHandle {
        if let Some(&handle) = self.by_name.get(&record.name) {
            self.vms[handle.0] = record;
            return handle;
        }
        let handle = VmHandle(self.vms.len());
        self.by_name.insert(record.name.clone(), handle);
        self.vms.push(record);
        handle
    }

    pub fn handle(&self, name: &str) -> Option<VmHandle> {
        self.by_name.get(name).copied()
    }

    pub fn require(&self, name: &str) -> Result<VmHandle> {
        self.handle(name)
            .ok_or_else(|| EngineError::InvalidRequest(format!("VM {name} is not in the inventory")))
    }

    pub fn get(&self, handle: VmHandle) -> &VmRecord {
        &self.vms[handle.0]
    }

    pub fn get_mut(&mut self, handle: VmHandle) -> &mut VmRecord {
        &mut self.vms[handle.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (VmHandle, &VmRecord)> {
        self.vms.iter().enumerate().map(|(i, vm)| (VmHandle(i), vm))
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    pub fn set_group_filters(&mut self, group: impl Into<String>, rules: Vec<DiskFilterRule>) {
        self.group_filters.insert(group.into(), rules);
    }

    /// Filter rules in effect for one VM after group/VM precedence.
    pub fn effective_filters(&self, handle: VmHandle) -> Vec<DiskFilterRule> {
        let vm = self.get(handle);
        let group = vm
            .group
            .as_ref()
            .and_then(|g| self.group_filters.get(g))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        merge_rules(group, vm.filters.as_deref(), vm.include_group_filters)
    }

    /// Copy a VM record under a new name and platform, e.g. for a
    /// cross-hypervisor restore. The source record is left untouched.
    pub fn snapshot_and_clone(&mut self, source: VmHandle, new_name: &str, platform: &str) -> Result<VmHandle> {
        if self.by_name.contains_key(new_name) {
            return Err(EngineError::InvalidRequest(format!(
                "cannot clone {} as {new_name}: name already in inventory",
                self.get(source).name
            )));
        }

        let mut clone = self.get(source).clone();
        clone.name = new_name.to_string();
        clone.platform = platform.to_string();
        clone.power = PowerState::Off;
        Ok(self.insert(clone))
    }
}
