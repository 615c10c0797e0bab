//! Claim resolution

use gpuclaim_core::{
    AllocationClaim, ClaimSource, PlacementPolicy, Requirement, SchedError, SchedResult,
    DEFAULT_DEVICE_COUNT,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::call::bounded;

/// Turns a claim reference into a validated [`Requirement`]
#[derive(Clone)]
pub struct ClaimResolver {
    source: Arc<dyn ClaimSource>,
    max_devices: u32,
    call_timeout: Duration,
}

impl ClaimResolver {
    pub fn new(source: Arc<dyn ClaimSource>, max_devices: u32, call_timeout: Duration) -> Self {
        Self {
            source,
            max_devices,
            call_timeout,
        }
    }

    /// Fetch and validate a claim. Fails with `NotFound` for a missing claim.
    pub async fn resolve(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> SchedResult<Requirement> {
        let claim = bounded(
            cancel,
            self.call_timeout,
            "claim get",
            self.source.get_claim(namespace, name),
        )
        .await?;

        let req = requirement_from_claim(claim, self.max_devices)?;
        debug!(
            claim = %name,
            count = req.count,
            policy = %req.policy,
            "Resolved claim"
        );
        Ok(req)
    }
}

/// Normalize and validate a claim
pub fn requirement_from_claim(claim: AllocationClaim, max_devices: u32) -> SchedResult<Requirement> {
    let count = if claim.devices.count <= 0 {
        DEFAULT_DEVICE_COUNT
    } else {
        claim.devices.count as u32
    };

    if count > max_devices {
        return Err(SchedError::InvalidClaim(format!(
            "{}/{} requests {} devices, limit is {}",
            claim.namespace, claim.name, count, max_devices
        )));
    }

    let mut seen = HashSet::new();
    if let Some(dup) = claim.devices.prefer_ids.iter().find(|id| !seen.insert(**id)) {
        return Err(SchedError::InvalidClaim(format!(
            "{}/{} pins device {} twice",
            claim.namespace, claim.name, dup
        )));
    }

    if claim.devices.policy == PlacementPolicy::PreferIds && claim.devices.prefer_ids.is_empty() {
        return Err(SchedError::InvalidClaim(format!(
            "{}/{} uses preferIds policy without ids",
            claim.namespace, claim.name
        )));
    }

    let topology = claim.topology.unwrap_or_default();
    if topology.min_bandwidth_gbps < 0 {
        return Err(SchedError::InvalidClaim(format!(
            "{}/{} has negative minimum bandwidth",
            claim.namespace, claim.name
        )));
    }

    Ok(Requirement {
        namespace: claim.namespace,
        claim_name: claim.name,
        count,
        policy: claim.devices.policy,
        pinned_ids: claim.devices.prefer_ids,
        exclusivity: claim.devices.exclusivity,
        topology,
        selector: claim.selector.unwrap_or_default(),
        gang_ref: claim.gang_ref,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuclaim_core::{TopologyMode, TopologyPolicy};
    use gpuclaim_store::MemoryStore;

    #[test]
    fn test_count_normalized() {
        for count in [0, -3] {
            let req = requirement_from_claim(AllocationClaim::new("ml", "c", count), 16).unwrap();
            assert_eq!(req.count, 1);
        }
        let req = requirement_from_claim(AllocationClaim::new("ml", "c", 4), 16).unwrap();
        assert_eq!(req.count, 4);
        assert_eq!(req.topology.mode, TopologyMode::Preferred);
    }

    #[test]
    fn test_invalid_claims() {
        let too_many = AllocationClaim::new("ml", "c", 17);
        assert!(matches!(
            requirement_from_claim(too_many, 16),
            Err(SchedError::InvalidClaim(_))
        ));

        let mut dup = AllocationClaim::new("ml", "c", 2);
        dup.devices.prefer_ids = vec![1, 1];
        assert!(requirement_from_claim(dup, 16).is_err());

        let mut no_ids = AllocationClaim::new("ml", "c", 2);
        no_ids.devices.policy = PlacementPolicy::PreferIds;
        assert!(requirement_from_claim(no_ids, 16).is_err());

        let mut bad_bw = AllocationClaim::new("ml", "c", 2);
        bad_bw.topology = Some(TopologyPolicy {
            mode: TopologyMode::Required,
            min_bandwidth_gbps: -1,
        });
        assert!(requirement_from_claim(bad_bw, 16).is_err());
    }

    #[tokio::test]
    async fn test_resolve_from_store() {
        let store = Arc::new(MemoryStore::new());
        store.put_claim(AllocationClaim::new("ml", "train", 2)).await;
        let resolver = ClaimResolver::new(store, 16, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let req = resolver.resolve("ml", "train", &cancel).await.unwrap();
        assert_eq!(req.claim_name, "train");
        assert_eq!(req.count, 2);

        let missing = resolver.resolve("ml", "absent", &cancel).await;
        assert!(matches!(missing, Err(SchedError::NotFound(_))));
    }
}
