//! Hypervisor dispatch table.
//!
//! Maps a platform identifier to the adapter that builds that platform's
//! parameters and submits the job. The engine has no platform branching;
//! supporting a new platform means one [`HypervisorAdapter`] impl and one
//! table entry.

pub mod placement;
pub mod platforms;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::model::{BackupRequest, JobKind, RestoreRequest};
use crate::monitor::JobHandle;
use crate::sdk::{BackupOptions, HypervisorSdk, Placement, RestoreParams};
use crate::utils::errors::{EngineError, Result};

pub use placement::{PlacementSession, PlacementState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    VMware,
    HyperV,
    Azure,
    Aws,
    OpenStack,
    Gcp,
    Nutanix,
    Xen,
    Oci,
    VCloud,
}

impl Platform {
    pub const ALL: [Platform; 10] = [
        Platform::VMware,
        Platform::HyperV,
        Platform::Azure,
        Platform::Aws,
        Platform::OpenStack,
        Platform::Gcp,
        Platform::Nutanix,
        Platform::Xen,
        Platform::Oci,
        Platform::VCloud,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::VMware => "vmware",
            Platform::HyperV => "hyperv",
            Platform::Azure => "azure",
            Platform::Aws => "aws",
            Platform::OpenStack => "openstack",
            Platform::Gcp => "gcp",
            Platform::Nutanix => "nutanix",
            Platform::Xen => "xen",
            Platform::Oci => "oci",
            Platform::VCloud => "vcloud",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vmware" | "vsphere" | "vcenter" => Ok(Platform::VMware),
            "hyperv" | "hyper-v" => Ok(Platform::HyperV),
            "azure" | "azure resource manager" => Ok(Platform::Azure),
            "aws" | "amazon" | "amazon web services" => Ok(Platform::Aws),
            "openstack" => Ok(Platform::OpenStack),
            "gcp" | "google cloud" | "google cloud platform" => Ok(Platform::Gcp),
            "nutanix" | "nutanix ahv" => Ok(Platform::Nutanix),
            "xen" | "xenserver" => Ok(Platform::Xen),
            "oci" | "oracle cloud infrastructure" => Ok(Platform::Oci),
            "vcloud" | "vcloud director" | "vmware cloud director" => Ok(Platform::VCloud),
            _ => Err(EngineError::DispatchNotFound { platform: s.to_string() }),
        }
    }
}

/// Optional features an adapter supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterCapabilities {
    /// Incrementals both before and after a synthetic full
    pub synthetic_full_both: bool,
    pub cbt: bool,
    pub in_place_restore: bool,
    pub attach_disk: bool,
}

impl Default for AdapterCapabilities {
    fn default() -> Self {
        Self {
            synthetic_full_both: false,
            cbt: true,
            in_place_restore: true,
            attach_disk: true,
        }
    }
}

/// Platform-specific strategy for building and submitting jobs.
#[async_trait]
pub trait HypervisorAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    /// Platform keys derived from the placement (host, datastore, network names).
    fn placement_keys(&self, placement: &Placement) -> BTreeMap<String, String>;

    fn backup_options(&self, request: &BackupRequest, excluded_disks: BTreeMap<String, Vec<String>>) -> BackupOptions {
        BackupOptions {
            consistency: request.consistency(),
            excluded_disks,
            advanced: request.advanced_options().clone(),
        }
    }

    /// Build the restore parameters, resolving placement where the request
    /// leaves it open.
    async fn restore_params(&self, request: &RestoreRequest, session: &mut PlacementSession) -> Result<RestoreParams> {
        let capabilities = self.capabilities();
        if request.is_in_place() && !capabilities.in_place_restore {
            return Err(EngineError::InvalidRequest(format!(
                "{} does not support in-place restore",
                self.platform()
            )));
        }
        if request.kind() == crate::model::RestoreKind::AttachDisk && !capabilities.attach_disk {
            return Err(EngineError::InvalidRequest(format!(
                "{} does not support attach-disk restore",
                self.platform()
            )));
        }

        let placement = if request.kind().writes_files() {
            // Files and disks land on the destination client itself
            let client = request.destination().client.clone().unwrap_or_default();
            Placement {
                proxy: request.destination().proxy.clone().unwrap_or_else(|| client.clone()),
                host: request.destination().host.clone().unwrap_or(client),
                ..Placement::default()
            }
        } else if request.is_in_place() {
            Placement::default()
        } else {
            session.resolve(request.destination()).await?
        };

        let mut extra = request.destination().extra.clone();
        if !request.is_in_place() && !request.kind().writes_files() {
            for (key, value) in self.placement_keys(&placement) {
                extra.entry(key).or_insert(value);
            }
        }

        Ok(RestoreParams {
            platform: self.platform().to_string(),
            kind: request.kind(),
            source: request.source().clone(),
            vms: request.vms().to_vec(),
            placement,
            overwrite: request.overwrite(),
            power_on: request.power_on(),
            in_place: request.is_in_place(),
            disks: request.disks().to_vec(),
            restore_path: request.restore_path().to_string(),
            extra,
        })
    }

    /// Build parameters and submit the restore.
    async fn submit_restore(
        &self,
        sdk: Arc<dyn HypervisorSdk>,
        request: &RestoreRequest,
        session: &mut PlacementSession,
    ) -> Result<JobHandle> {
        let params = self.restore_params(request, session).await?;
        let job_id = sdk.submit_restore(&params).await?;
        info!(
            job_id = %job_id,
            platform = %self.platform(),
            kind = %request.kind(),
            vms = ?request.vms(),
            "Restore submitted"
        );
        Ok(JobHandle::new(job_id, JobKind::Restore(request.kind()), sdk))
    }
}

/// Platform identifier to adapter mapping.
#[derive(Clone)]
pub struct DispatchTable {
    adapters: HashMap<Platform, Arc<dyn HypervisorAdapter>>,
}

impl DispatchTable {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Table with an adapter for every known platform.
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        for adapter in platforms::all() {
            table.register(adapter);
        }
        table
    }

    pub fn register(&mut self, adapter: Arc<dyn HypervisorAdapter>) {
        debug!(platform = %adapter.platform(), "Registering hypervisor adapter");
        self.adapters.insert(adapter.platform(), adapter);
    }

    /// Adapter for a platform identifier.
    pub fn lookup(&self, platform_id: &str) -> Result<Arc<dyn HypervisorAdapter>> {
        let platform: Platform = platform_id.parse()?;
        self.adapters
            .get(&platform)
            .cloned()
            .ok_or_else(|| EngineError::DispatchNotFound {
                platform: platform_id.to_string(),
            })
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.adapters.keys().copied().collect();
        platforms.sort();
        platforms
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parsing() {
        assert_eq!("Hyper-V".parse::<Platform>().unwrap(), Platform::HyperV);
        assert_eq!("Google Cloud".parse::<Platform>().unwrap(), Platform::Gcp);
        assert_eq!(" VMWARE ".parse::<Platform>().unwrap(), Platform::VMware);
    }

    #[test]
    fn test_unknown_platform_not_found() {
        let table = DispatchTable::with_defaults();
        match table.lookup("commodore64") {
            Err(EngineError::DispatchNotFound { platform }) => assert_eq!(platform, "commodore64"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("lookup should fail"),
        }
    }

    #[test]
    fn test_unregistered_platform_not_found() {
        let mut table = DispatchTable::empty();
        table.register(Arc::new(platforms::VMwareAdapter));
        assert!(table.lookup("vmware").is_ok());
        assert!(matches!(table.lookup("azure"), Err(EngineError::DispatchNotFound { .. })));
    }

    #[test]
    fn test_defaults_cover_every_platform() {
        assert_eq!(DispatchTable::with_defaults().platforms(), Platform::ALL.to_vec());
    }
}
