//! Per-request destination placement.
//!
//! `Unresolved -> Resolving -> Resolved | Failed`. A session belongs to one
//! restore request; the resolved value is never carried over to another.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::model::DestinationDescriptor;
use crate::sdk::{Placement, PlacementConstraints, PlacementOracle};
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementState {
    Unresolved,
    Resolving,
    Resolved(Placement),
    Failed(String),
}

pub struct PlacementSession {
    state: PlacementState,
    oracle: Arc<dyn PlacementOracle>,
    vms: Vec<String>,
    constraints: PlacementConstraints,
    oracle_calls: u32,
}

impl PlacementSession {
    pub fn new(oracle: Arc<dyn PlacementOracle>, vms: Vec<String>, constraints: PlacementConstraints) -> Self {
        Self {
            state: PlacementState::Unresolved,
            oracle,
            vms,
            constraints,
            oracle_calls: 0,
        }
    }

    pub fn state(&self) -> &PlacementState {
        &self.state
    }

    pub fn oracle_calls(&self) -> u32 {
        self.oracle_calls
    }

    /// Placement for this request. Explicit destination fields win over
    /// computed ones; the oracle is only asked when something is missing.
    pub async fn resolve(&mut self, explicit: &DestinationDescriptor) -> Result<Placement> {
        match &self.state {
            PlacementState::Resolved(placement) => return Ok(placement.clone()),
            PlacementState::Failed(reason) => return Err(self.error(reason.clone())),
            PlacementState::Unresolved | PlacementState::Resolving => {}
        }

        if let Some(placement) = explicit_placement(explicit) {
            debug!(vms = ?self.vms, "Using explicit destination placement");
            self.state = PlacementState::Resolved(placement.clone());
            return Ok(placement);
        }

        self.state = PlacementState::Resolving;
        self.oracle_calls += 1;
        let computed = match self.oracle.compute_free_resources(&self.vms, &self.constraints).await {
            Ok(Some(computed)) => computed,
            Ok(None) => return Err(self.fail("no destination satisfies the placement constraints".to_string())),
            Err(e) => return Err(self.fail(e.to_string())),
        };

        let placement = overlay(explicit, computed);
        debug!(
            vms = ?self.vms,
            host = %placement.host,
            datastore = %placement.datastore,
            "Placement resolved"
        );
        self.state = PlacementState::Resolved(placement.clone());
        Ok(placement)
    }

    fn fail(&mut self, reason: String) -> EngineError {
        warn!(vms = ?self.vms, reason = %reason, "Placement resolution failed");
        self.state = PlacementState::Failed(reason.clone());
        self.error(reason)
    }

    fn error(&self, reason: String) -> EngineError {
        EngineError::PlacementResolution {
            vms: self.vms.join(", "),
            reason,
        }
    }
}

fn explicit_placement(d: &DestinationDescriptor) -> Option<Placement> {
    let storage = d.storage.clone()?;
    let network = d.network.clone()?;
    let host = d.host.clone().or_else(|| d.proxy.clone())?;
    Some(Placement {
        proxy: d.proxy.clone().unwrap_or_else(|| host.clone()),
        host,
        datastore: storage,
        network,
        resource_group: d.resource_group.clone(),
        region: d.region.clone(),
    })
}

fn overlay(d: &DestinationDescriptor, computed: Placement) -> Placement {
    Placement {
        proxy: d.proxy.clone().unwrap_or(computed.proxy),
        host: d.host.clone().unwrap_or(computed.host),
        datastore: d.storage.clone().unwrap_or(computed.datastore),
        network: d.network.clone().unwrap_or(computed.network),
        resource_group: d.resource_group.clone().or(computed.resource_group),
        region: d.region.clone().or(computed.region),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::StaticPlacementOracle;

    fn computed() -> Placement {
        Placement {
            proxy: "proxy-2".into(),
            host: "esx-2".into(),
            datastore: "ds-free".into(),
            network: "VM Network".into(),
            resource_group: None,
            region: None,
        }
    }

    fn session(oracle: Arc<StaticPlacementOracle>) -> PlacementSession {
        PlacementSession::new(oracle, vec!["vm1".into()], PlacementConstraints::default())
    }

    #[tokio::test]
    async fn test_resolves_once_and_caches() {
        let oracle = Arc::new(StaticPlacementOracle::new(Some(computed())));
        let mut session = session(oracle.clone());
        assert_eq!(session.state(), &PlacementState::Unresolved);

        let explicit = DestinationDescriptor {
            host: Some("esx-9".into()),
            ..Default::default()
        };
        let first = session.resolve(&explicit).await.unwrap();
        let second = session.resolve(&explicit).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.host, "esx-9");
        assert_eq!(first.datastore, "ds-free");
        assert_eq!(oracle.calls(), 1);
        assert!(matches!(session.state(), PlacementState::Resolved(_)));
    }

    #[tokio::test]
    async fn test_complete_explicit_input_skips_oracle() {
        let oracle = Arc::new(StaticPlacementOracle::new(Some(computed())));
        let mut session = session(oracle.clone());
        let explicit = DestinationDescriptor {
            host: Some("esx-1".into()),
            storage: Some("ds-1".into()),
            network: Some("lan".into()),
            ..Default::default()
        };

        let placement = session.resolve(&explicit).await.unwrap();
        assert_eq!(placement.proxy, "esx-1");
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_placement_fails() {
        let oracle = Arc::new(StaticPlacementOracle::new(None));
        let mut session = session(oracle.clone());

        let err = session.resolve(&DestinationDescriptor::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::PlacementResolution { ref vms, .. } if vms == "vm1"));
        assert!(matches!(session.state(), PlacementState::Failed(_)));

        // Failure is sticky for the request
        assert!(session.resolve(&DestinationDescriptor::default()).await.is_err());
        assert_eq!(oracle.calls(), 1);
    }
}
