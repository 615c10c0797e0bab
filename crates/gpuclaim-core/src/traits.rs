//! Collaborator trait definitions
//!
//! The scheduling core talks to its surroundings only through these traits.
//! Every method is a bounded remote call against a consistent store.

use async_trait::async_trait;

use crate::{AllocationClaim, AllocationRecord, DeviceLease, NodeDeviceReport, PodRef, SchedResult};

/// Source of declarative claims
#[async_trait]
pub trait ClaimSource: Send + Sync {
    /// Fetch a claim, failing with `NotFound` if it does not exist
    async fn get_claim(&self, namespace: &str, name: &str) -> SchedResult<AllocationClaim>;
}

/// Source of per-node device telemetry
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch a node's report, failing with `NotFound` if it does not exist
    async fn get_node_report(&self, node: &str) -> SchedResult<NodeDeviceReport>;
}

/// Store offering atomic conditional create over lease records
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the lease iff no record exists for its key.
    ///
    /// Returns `Ok(false)` when the key is already present. Errors are
    /// reserved for store failures.
    async fn create_if_absent(&self, lease: DeviceLease) -> SchedResult<bool>;

    /// Delete a lease record; deleting an absent record succeeds
    async fn delete(&self, namespace: &str, node: &str, device_id: u32) -> SchedResult<()>;

    /// Read a lease record
    async fn get(&self, namespace: &str, node: &str, device_id: u32)
        -> SchedResult<Option<DeviceLease>>;

    /// List all lease records in a namespace
    async fn list(&self, namespace: &str) -> SchedResult<Vec<DeviceLease>>;
}

/// Destination of committed allocation records
#[async_trait]
pub trait AllocationSink: Send + Sync {
    /// Persist the pod's allocation record
    async fn commit(&self, pod: &PodRef, record: &AllocationRecord) -> SchedResult<()>;
}
