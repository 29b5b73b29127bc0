//! Disk inventory and disk filter rule types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::utils::errors::EngineError;

/// Controller/bus/unit position of a virtual disk (`scsi 0:1`, `ide 1:0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControllerSlot {
    pub controller: String,
    pub bus: u32,
    pub unit: u32,
}

impl fmt::Display for ControllerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}-{}", self.controller, self.bus, self.unit)
    }
}

/// One virtual disk as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disk {
    /// Platform-specific disk name (may carry a `scsiN-M-` style prefix)
    pub id: String,
    /// Full path or URI of the backing file
    #[serde(default)]
    pub path: String,
    /// Datastore, storage account or volume pool holding the disk
    #[serde(default)]
    pub datastore: String,
    /// Storage repository / container (Xen SR, Nutanix container)
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub controller: Option<ControllerSlot>,
    #[serde(default)]
    pub label: String,
    /// Boot/OS disk as opposed to a data disk
    #[serde(default)]
    pub os_disk: bool,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Disk {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: String::new(),
            datastore: String::new(),
            repository: None,
            controller: None,
            label: String::new(),
            os_disk: false,
            size_bytes: 0,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_datastore(mut self, datastore: impl Into<String>) -> Self {
        self.datastore = datastore.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_controller(mut self, controller: impl Into<String>, bus: u32, unit: u32) -> Self {
        self.controller = Some(ControllerSlot {
            controller: controller.into(),
            bus,
            unit,
        });
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_os_disk(mut self, os_disk: bool) -> Self {
        self.os_disk = os_disk;
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }
}

/// Kind of disk filter rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    DatastoreUri,
    DiskPath,
    ControllerSlot,
    Repository,
    DiskLabel,
    OsType,
    DiskTag,
}

/// Priority id shared by the datastore-level rule types.
pub const STORAGE_RULE_PRIORITY: u8 = 1;

impl RuleType {
    /// Fixed numeric priority id. Rules are sorted by this id descending,
    /// except that id [`STORAGE_RULE_PRIORITY`] is always evaluated first.
    pub fn priority_id(self) -> u8 {
        match self {
            RuleType::DatastoreUri | RuleType::Repository => STORAGE_RULE_PRIORITY,
            RuleType::DiskPath => 2,
            RuleType::ControllerSlot => 3,
            RuleType::DiskLabel => 4,
            RuleType::OsType => 5,
            RuleType::DiskTag => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::DatastoreUri => "datastore_uri",
            RuleType::DiskPath => "disk_path",
            RuleType::ControllerSlot => "controller_slot",
            RuleType::Repository => "repository",
            RuleType::DiskLabel => "disk_label",
            RuleType::OsType => "os_type",
            RuleType::DiskTag => "disk_tag",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "datastore_uri" | "datastore" => Ok(RuleType::DatastoreUri),
            "disk_path" | "path" => Ok(RuleType::DiskPath),
            "controller_slot" | "controller" | "bus_type" => Ok(RuleType::ControllerSlot),
            "repository" => Ok(RuleType::Repository),
            "disk_label" | "label" => Ok(RuleType::DiskLabel),
            "os_type" => Ok(RuleType::OsType),
            "disk_tag" | "tag" => Ok(RuleType::DiskTag),
            other => Err(EngineError::InvalidRequest(format!("unknown disk filter rule type '{other}'"))),
        }
    }
}

/// A declarative rule excluding disks from backup.
///
/// `pattern` is matched against the attribute selected by `rule_type`;
/// `value` is only meaningful for [`RuleType::OsType`] (`os`/`data`) and
/// [`RuleType::DiskTag`] (tag value, empty matches any value).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskFilterRule {
    pub rule_type: RuleType,
    pub pattern: String,
    #[serde(default)]
    pub value: String,
}

impl DiskFilterRule {
    pub fn new(rule_type: RuleType, pattern: impl Into<String>) -> Self {
        Self {
            rule_type,
            pattern: pattern.into(),
            value: String::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }
}

impl fmt::Display for DiskFilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}:{}", self.rule_type, self.pattern)
        } else {
            write!(f, "{}:{}={}", self.rule_type, self.pattern, self.value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_rules_share_lowest_priority() {
        assert_eq!(RuleType::DatastoreUri.priority_id(), STORAGE_RULE_PRIORITY);
        assert_eq!(RuleType::Repository.priority_id(), STORAGE_RULE_PRIORITY);
        assert!(RuleType::DiskTag.priority_id() > RuleType::ControllerSlot.priority_id());
    }

    #[test]
    fn test_rule_type_parsing() {
        assert_eq!("DATASTORE_URI".parse::<RuleType>().unwrap(), RuleType::DatastoreUri);
        assert_eq!("bus_type".parse::<RuleType>().unwrap(), RuleType::ControllerSlot);
        assert!("colour".parse::<RuleType>().is_err());
    }

    #[test]
    fn test_rule_deserialization() {
        let rule: DiskFilterRule = toml::from_str(
            r#"
            rule_type = "disk_tag"
            pattern = "backup"
            value = "skip"
            "#,
        )
        .unwrap();
        assert_eq!(rule.rule_type, RuleType::DiskTag);
        assert_eq!(rule.to_string(), "disk_tag:backup=skip");
    }

    #[test]
    fn test_controller_slot_display() {
        let disk = Disk::new("d1").with_controller("scsi", 0, 2);
        assert_eq!(disk.controller.unwrap().to_string(), "scsi0-2");
    }
}
