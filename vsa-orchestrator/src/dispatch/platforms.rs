//! Adapters for each supported hypervisor.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{AdapterCapabilities, HypervisorAdapter, Platform};
use crate::sdk::Placement;

fn keys<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

/// One adapter per platform, in table order.
pub fn all() -> Vec<Arc<dyn HypervisorAdapter>> {
    vec![
        Arc::new(VMwareAdapter),
        Arc::new(HyperVAdapter),
        Arc::new(AzureAdapter),
        Arc::new(AwsAdapter),
        Arc::new(OpenStackAdapter),
        Arc::new(GcpAdapter),
        Arc::new(NutanixAdapter),
        Arc::new(XenAdapter),
        Arc::new(OciAdapter),
        Arc::new(VCloudAdapter),
    ]
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VMwareAdapter;

impl HypervisorAdapter for VMwareAdapter {
    fn platform(&self) -> Platform {
        Platform::VMware
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            synthetic_full_both: true,
            ..AdapterCapabilities::default()
        }
    }

    fn placement_keys(&self, p: &Placement) -> BTreeMap<String, String> {
        keys([
            ("proxy", p.proxy.as_str()),
            ("esx_host", p.host.as_str()),
            ("datastore", p.datastore.as_str()),
            ("network", p.network.as_str()),
            ("resource_pool", opt(&p.resource_group)),
        ])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HyperVAdapter;

impl HypervisorAdapter for HyperVAdapter {
    fn platform(&self) -> Platform {
        Platform::HyperV
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            synthetic_full_both: true,
            attach_disk: false,
            ..AdapterCapabilities::default()
        }
    }

    fn placement_keys(&self, p: &Placement) -> BTreeMap<String, String> {
        keys([
            ("proxy", p.proxy.as_str()),
            ("hyperv_host", p.host.as_str()),
            ("destination_path", p.datastore.as_str()),
            ("network_adapter", p.network.as_str()),
        ])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AzureAdapter;

impl HypervisorAdapter for AzureAdapter {
    fn platform(&self) -> Platform {
        Platform::Azure
    }

    fn placement_keys(&self, p: &Placement) -> BTreeMap<String, String> {
        keys([
            ("proxy", p.proxy.as_str()),
            ("resource_group", opt(&p.resource_group)),
            ("storage_account", p.datastore.as_str()),
            ("virtual_network", p.network.as_str()),
            ("region", opt(&p.region)),
        ])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AwsAdapter;

impl HypervisorAdapter for AwsAdapter {
    fn platform(&self) -> Platform {
        Platform::Aws
    }

    fn placement_keys(&self, p: &Placement) -> BTreeMap<String, String> {
        keys([
            ("proxy", p.proxy.as_str()),
            ("availability_zone", p.host.as_str()),
            ("volume_type", p.datastore.as_str()),
            ("subnet", p.network.as_str()),
            ("region", opt(&p.region)),
        ])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenStackAdapter;

impl HypervisorAdapter for OpenStackAdapter {
    fn platform(&self) -> Platform {
        Platform::OpenStack
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            in_place_restore: false,
            ..AdapterCapabilities::default()
        }
    }

    fn placement_keys(&self, p: &Placement) -> BTreeMap<String, String> {
        keys([
            ("proxy", p.proxy.as_str()),
            ("project", opt(&p.resource_group)),
            ("availability_zone", p.host.as_str()),
            ("volume_type", p.datastore.as_str()),
            ("network", p.network.as_str()),
        ])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GcpAdapter;

impl HypervisorAdapter for GcpAdapter {
    fn platform(&self) -> Platform {
        Platform::Gcp
    }

    fn placement_keys(&self, p: &Placement) -> BTreeMap<String, String> {
        keys([
            ("proxy", p.proxy.as_str()),
            ("project", opt(&p.resource_group)),
            ("zone", p.host.as_str()),
            ("disk_type", p.datastore.as_str()),
            ("network", p.network.as_str()),
        ])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NutanixAdapter;

impl HypervisorAdapter for NutanixAdapter {
    fn platform(&self) -> Platform {
        Platform::Nutanix
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            synthetic_full_both: true,
            ..AdapterCapabilities::default()
        }
    }

    fn placement_keys(&self, p: &Placement) -> BTreeMap<String, String> {
        keys([
            ("proxy", p.proxy.as_str()),
            ("cluster", p.host.as_str()),
            ("container", p.datastore.as_str()),
            ("network", p.network.as_str()),
        ])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XenAdapter;

impl HypervisorAdapter for XenAdapter {
    fn platform(&self) -> Platform {
        Platform::Xen
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            cbt: false,
            ..AdapterCapabilities::default()
        }
    }

    fn placement_keys(&self, p: &Placement) -> BTreeMap<String, String> {
        keys([
            ("proxy", p.proxy.as_str()),
            ("xen_host", p.host.as_str()),
            ("storage_repository", p.datastore.as_str()),
            ("network", p.network.as_str()),
        ])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OciAdapter;

impl HypervisorAdapter for OciAdapter {
    fn platform(&self) -> Platform {
        Platform::Oci
    }

    fn placement_keys(&self, p: &Placement) -> BTreeMap<String, String> {
        keys([
            ("proxy", p.proxy.as_str()),
            ("compartment", opt(&p.resource_group)),
            ("availability_domain", p.host.as_str()),
            ("subnet", p.network.as_str()),
            ("region", opt(&p.region)),
        ])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VCloudAdapter;

impl HypervisorAdapter for VCloudAdapter {
    fn platform(&self) -> Platform {
        Platform::VCloud
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            attach_disk: false,
            ..AdapterCapabilities::default()
        }
    }

    fn placement_keys(&self, p: &Placement) -> BTreeMap<String, String> {
        keys([
            ("proxy", p.proxy.as_str()),
            ("org_vdc", p.host.as_str()),
            ("storage_policy", p.datastore.as_str()),
            ("org_network", p.network.as_str()),
            ("vapp", opt(&p.resource_group)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::PlacementSession;
    use crate::model::{DestinationDescriptor, RestoreKind, RestoreRequestBuilder, SnapshotRef};
    use crate::sdk::PlacementConstraints;
    use crate::sim::StaticPlacementOracle;

    fn oracle() -> Arc<StaticPlacementOracle> {
        Arc::new(StaticPlacementOracle::new(Some(Placement {
            proxy: "proxy-1".into(),
            host: "eastus-1".into(),
            datastore: "stacct01".into(),
            network: "vnet-a".into(),
            resource_group: Some("rg-restore".into()),
            region: Some("eastus".into()),
        })))
    }

    #[tokio::test]
    async fn test_azure_params_use_platform_keys() {
        let request = RestoreRequestBuilder::new("azure", RestoreKind::FullVm)
            .from_snapshot(SnapshotRef::job("77"))
            .with_vms(["vm1"])
            .resolve()
            .unwrap();
        let mut session = PlacementSession::new(oracle(), vec!["vm1".into()], PlacementConstraints::default());

        let params = AzureAdapter.restore_params(&request, &mut session).await.unwrap();

        assert_eq!(params.platform, "azure");
        assert_eq!(params.extra.get("resource_group").map(String::as_str), Some("rg-restore"));
        assert_eq!(params.extra.get("storage_account").map(String::as_str), Some("stacct01"));
        assert_eq!(params.extra.get("virtual_network").map(String::as_str), Some("vnet-a"));
        assert!(!params.extra.contains_key("esx_host"));
    }

    #[tokio::test]
    async fn test_explicit_extra_keys_win() {
        let mut descriptor = DestinationDescriptor::default();
        descriptor.extra.insert("datastore".into(), "ds-pinned".into());
        let request = RestoreRequestBuilder::new("vmware", RestoreKind::FullVm)
            .from_snapshot(SnapshotRef::job("5"))
            .with_vms(["vm1"])
            .with_descriptor(descriptor)
            .resolve()
            .unwrap();
        let mut session = PlacementSession::new(oracle(), vec!["vm1".into()], PlacementConstraints::default());

        let params = VMwareAdapter.restore_params(&request, &mut session).await.unwrap();
        assert_eq!(params.extra.get("datastore").map(String::as_str), Some("ds-pinned"));
        assert_eq!(params.extra.get("esx_host").map(String::as_str), Some("eastus-1"));
    }

    #[tokio::test]
    async fn test_unsupported_in_place_rejected() {
        let request = RestoreRequestBuilder::new("openstack", RestoreKind::FullVm)
            .from_snapshot(SnapshotRef::job("5"))
            .with_vms(["vm1"])
            .in_place(true)
            .resolve()
            .unwrap();
        let oracle = oracle();
        let mut session = PlacementSession::new(oracle.clone(), vec!["vm1".into()], PlacementConstraints::default());

        assert!(OpenStackAdapter.restore_params(&request, &mut session).await.is_err());
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn test_guest_file_restore_skips_placement() {
        let request = RestoreRequestBuilder::new("hyperv", RestoreKind::GuestFile)
            .from_snapshot(SnapshotRef::job("5"))
            .with_vms(["vm1"])
            .with_destination("proxy-7")
            .resolve()
            .unwrap();
        let oracle = oracle();
        let mut session = PlacementSession::new(oracle.clone(), vec!["vm1".into()], PlacementConstraints::default());

        let params = HyperVAdapter.restore_params(&request, &mut session).await.unwrap();
        assert_eq!(params.placement.host, "proxy-7");
        assert_eq!(params.restore_path, "/vsa_restore/guest_file/5");
        assert_eq!(oracle.calls(), 0);
    }
}
