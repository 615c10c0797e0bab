//! Device leases: atomic create/delete mutual exclusion over (node, device)

use gpuclaim_core::{DeviceLease, LeaseStore, SchedResult};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::call::bounded;

/// Lease manager that turns "is this device free" into a single atomic
/// create-if-absent against the backing store.
///
/// The manager holds no state of its own. Exclusivity comes entirely from
/// the store's conditional create.
#[derive(Clone)]
pub struct LeaseManager {
    /// Backing store
    store: Arc<dyn LeaseStore>,
    /// Namespace lease records live in
    namespace: String,
    /// Upper bound per store call
    call_timeout: Duration,
}

impl LeaseManager {
    /// Create a new lease manager
    pub fn new(store: Arc<dyn LeaseStore>, namespace: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            call_timeout,
        }
    }

    /// Namespace lease records are created in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Try to take the lease on one device.
    ///
    /// Returns `Ok(true)` iff this call created the lease and `Ok(false)` if
    /// someone already holds it. Store failures are returned as errors and
    /// must not be read as contention.
    pub async fn acquire(
        &self,
        node: &str,
        device_id: u32,
        holder: &str,
        cancel: &CancellationToken,
    ) -> SchedResult<bool> {
        let lease = DeviceLease::new(&self.namespace, node, device_id, holder);
        let name = lease.name();
        let created = bounded(
            cancel,
            self.call_timeout,
            "lease create",
            self.store.create_if_absent(lease),
        )
        .await?;

        debug!(lease = %name, holder = holder, acquired = created, "Lease acquire");
        Ok(created)
    }

    /// Drop the lease on one device. Releasing a free device succeeds.
    pub async fn release(&self, node: &str, device_id: u32, cancel: &CancellationToken) -> SchedResult<()> {
        bounded(
            cancel,
            self.call_timeout,
            "lease delete",
            self.store.delete(&self.namespace, node, device_id),
        )
        .await?;

        debug!(node = node, gpu = device_id, "Released lease");
        Ok(())
    }

    /// Release a lease only if `holder` owns it.
    ///
    /// Used when an acquire was interrupted and its outcome is unknown.
    pub async fn release_if_held(
        &self,
        node: &str,
        device_id: u32,
        holder: &str,
        cancel: &CancellationToken,
    ) -> SchedResult<bool> {
        let current = bounded(
            cancel,
            self.call_timeout,
            "lease get",
            self.store.get(&self.namespace, node, device_id),
        )
        .await?;

        match current {
            Some(lease) if lease.holder == holder => {
                self.release(node, device_id, cancel).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Release a batch of leases, continuing past failures.
    ///
    /// Returns the first error seen, after every release was attempted.
    pub async fn release_all(&self, node: &str, device_ids: &[u32], cancel: &CancellationToken) -> SchedResult<()> {
        let mut first_err = None;
        for id in device_ids {
            if let Err(e) = self.release(node, *id, cancel).await {
                warn!(node = node, gpu = id, error = %e, "Failed to release lease");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Current holder of a device, if any
    pub async fn holder(&self, node: &str, device_id: u32, cancel: &CancellationToken) -> SchedResult<Option<String>> {
        let lease = bounded(
            cancel,
            self.call_timeout,
            "lease get",
            self.store.get(&self.namespace, node, device_id),
        )
        .await?;
        Ok(lease.map(|l| l.holder))
    }

    /// Live leases on one node
    pub async fn held_on(&self, node: &str, cancel: &CancellationToken) -> SchedResult<Vec<DeviceLease>> {
        let mut leases = self.list(cancel).await?;
        leases.retain(|l| l.node == node);
        Ok(leases)
    }

    /// All live leases, ordered by node then device id
    pub async fn list(&self, cancel: &CancellationToken) -> SchedResult<Vec<DeviceLease>> {
        let mut leases = bounded(
            cancel,
            self.call_timeout,
            "lease list",
            self.store.list(&self.namespace),
        )
        .await?;
        leases.sort_by(|a, b| (&a.node, a.device_id).cmp(&(&b.node, b.device_id)));
        Ok(leases)
    }
}
