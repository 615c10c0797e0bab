//! Scheduling-cycle coordinator
//!
//! Phases are driven by the caller in order: `admit`, then `filter` and
//! `score` per candidate node, then `reserve` on the chosen node, and finally
//! `commit` or `unreserve`. All per-cycle data lives in the caller's
//! [`CycleState`]; the coordinator itself is shared by every cycle and holds
//! no mutable state.

use gpuclaim_core::{
    AllocationRecord, AllocationSink, CatalogSource, ClaimSource, CycleState, Device,
    FilterConfig, GpuclaimConfig, LeaseStore, NodeDeviceReport, PlacementPolicy, PodRef,
    Requirement, SchedError, SchedResult, TopologyMode,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::call::bounded;
use crate::lease::LeaseManager;
use crate::resolver::ClaimResolver;
use crate::topology::{ContiguousIslandStrategy, PlacementStrategy};

/// Key the attempt state is stored under in the cycle state
pub const STATE_KEY: &str = "GpuClaim";

/// Where a cycle's attempt currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// Claim resolved, nodes may be filtered and scored
    Admitted,
    /// Leases held on one node
    Reserved,
    /// Allocation record persisted
    Committed,
    /// Leases released after a later failure
    Unreserved,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CyclePhase::Admitted => write!(f, "Admitted"),
            CyclePhase::Reserved => write!(f, "Reserved"),
            CyclePhase::Committed => write!(f, "Committed"),
            CyclePhase::Unreserved => write!(f, "Unreserved"),
        }
    }
}

/// Scratch state of one scheduling attempt.
///
/// `chosen_ids` is either empty or holds exactly `requirement.count` ids.
#[derive(Debug, Clone)]
pub struct AttemptState {
    pub claim_name: String,
    pub requirement: Requirement,
    pub phase: CyclePhase,
    pub chosen_node: Option<String>,
    pub chosen_ids: Vec<u32>,
}

impl AttemptState {
    fn expect_phase(&self, allowed: &[CyclePhase], op: &str) -> SchedResult<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(SchedError::Internal(format!(
                "{} not allowed in phase {}",
                op, self.phase
            )))
        }
    }
}

/// A node that passed `filter` in some cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredNode {
    node: String,
}

impl FilteredNode {
    pub fn node(&self) -> &str {
        &self.node
    }
}

/// Runs the phases of one placement attempt against shared collaborators
pub struct CycleCoordinator {
    resolver: ClaimResolver,
    catalog: Arc<dyn CatalogSource>,
    leases: LeaseManager,
    sink: Arc<dyn AllocationSink>,
    strategy: Arc<dyn PlacementStrategy>,
    filter: FilterConfig,
    call_timeout: Duration,
}

impl CycleCoordinator {
    /// Create a coordinator with the contiguous-island strategy
    pub fn new(
        config: &GpuclaimConfig,
        claims: Arc<dyn ClaimSource>,
        catalog: Arc<dyn CatalogSource>,
        lease_store: Arc<dyn LeaseStore>,
        sink: Arc<dyn AllocationSink>,
    ) -> Self {
        let call_timeout = config.scheduler.call_timeout();
        Self {
            resolver: ClaimResolver::new(
                claims,
                config.scheduler.max_devices_per_node,
                call_timeout,
            ),
            catalog,
            leases: LeaseManager::new(
                lease_store,
                config.scheduler.lease_namespace.clone(),
                call_timeout,
            ),
            sink,
            strategy: Arc::new(ContiguousIslandStrategy),
            filter: config.filter.clone(),
            call_timeout,
        }
    }

    /// Replace the placement strategy
    pub fn with_strategy(mut self, strategy: Arc<dyn PlacementStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Lease manager used for reservations
    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Attempt state of a cycle
    pub fn attempt<'a>(&self, state: &'a CycleState) -> SchedResult<&'a AttemptState> {
        state.read::<AttemptState>(STATE_KEY)
    }

    /// Resolve the pod's claim and seed the cycle state
    pub async fn admit(
        &self,
        state: &mut CycleState,
        pod: &PodRef,
        cancel: &CancellationToken,
    ) -> SchedResult<()> {
        let claim_name = match pod.claim.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                return Err(SchedError::Unschedulable(
                    "gpu claim annotation missing".to_string(),
                ))
            }
        };
        if pod.uid.is_empty() {
            return Err(SchedError::Unschedulable(format!("pod {} has no uid", pod)));
        }

        let requirement = self
            .resolver
            .resolve(&pod.namespace, &claim_name, cancel)
            .await?;

        debug!(pod = %pod, claim = %claim_name, count = requirement.count, "Admitted pod");

        state.write(
            STATE_KEY,
            AttemptState {
                claim_name,
                requirement,
                phase: CyclePhase::Admitted,
                chosen_node: None,
                chosen_ids: Vec::new(),
            },
        );
        Ok(())
    }

    /// Decide whether a node can host the claim at all.
    ///
    /// Rejection is reported as `Unschedulable` with the reason. A node that
    /// passes comes back as a [`FilteredNode`], which is what `score` takes.
    pub async fn filter(
        &self,
        state: &CycleState,
        node: &str,
        cancel: &CancellationToken,
    ) -> SchedResult<FilteredNode> {
        let attempt = self.attempt(state)?;
        attempt.expect_phase(&[CyclePhase::Admitted], "filter")?;
        let req = &attempt.requirement;

        let report = self.fetch_report(node, cancel).await?;

        if !req.selector.matches(&report.labels) {
            return Err(SchedError::Unschedulable(format!(
                "node {} does not match claim selector",
                node
            )));
        }

        let free = self.free_devices(node, &report, cancel).await?;
        if self.filter.reject_under_capacity && (free.len() as u32) < req.count {
            return Err(SchedError::Unschedulable(format!(
                "node {} has {} free devices, {} requested",
                node,
                free.len(),
                req.count
            )));
        }

        if req.topology.mode == TopologyMode::Required {
            match self.strategy.select(&free, req.count) {
                None => {
                    return Err(SchedError::Unschedulable(format!(
                        "node {} has no contiguous set of {} free devices",
                        node, req.count
                    )))
                }
                Some(pick) if pick.bandwidth < req.min_bandwidth() => {
                    return Err(SchedError::Unschedulable(format!(
                        "node {} best bandwidth {} below required {}",
                        node,
                        pick.bandwidth,
                        req.min_bandwidth()
                    )))
                }
                Some(_) => {}
            }
        }

        debug!(node = node, free = free.len(), "Node passed filter");
        Ok(FilteredNode {
            node: node.to_string(),
        })
    }

    /// Score a filtered node; `None` excludes it from ranking.
    ///
    /// The best window over free devices sets the score. A node whose free
    /// devices are fragmented but whose full catalog has a window scores 0
    /// unless topology is required.
    pub async fn score(
        &self,
        state: &CycleState,
        filtered: &FilteredNode,
        cancel: &CancellationToken,
    ) -> SchedResult<Option<u64>> {
        let attempt = self.attempt(state)?;
        attempt.expect_phase(&[CyclePhase::Admitted], "score")?;
        let req = &attempt.requirement;
        let node = filtered.node();

        if req.policy != PlacementPolicy::Contiguous {
            debug!(
                policy = %req.policy,
                strategy = self.strategy.name(),
                "Policy has no dedicated strategy, scoring with default"
            );
        }

        let report = self.fetch_report(node, cancel).await?;
        let usable = report.usable_devices();
        let free = self.free_devices(node, &report, cancel).await?;

        let score = match self.strategy.select(&free, req.count) {
            Some(pick) => Some(pick.score),
            None => match req.topology.mode {
                TopologyMode::Ignore => Some(0),
                TopologyMode::Preferred if self.strategy.select(&usable, req.count).is_some() => {
                    Some(0)
                }
                _ => None,
            },
        };

        debug!(node = node, score = ?score, "Scored node");
        Ok(score)
    }

    /// Take leases for the requested count on `node`.
    ///
    /// The strategy's window over currently free devices is tried first.
    /// If it cannot be taken whole and topology is not required, usable
    /// devices are walked in ascending id order. When fewer leases than
    /// requested can be taken, every lease taken here is released before
    /// `InsufficientDevices` is returned.
    pub async fn reserve(
        &self,
        state: &mut CycleState,
        pod: &PodRef,
        node: &str,
        cancel: &CancellationToken,
    ) -> SchedResult<Vec<u32>> {
        let (count, mode) = {
            let attempt = self.attempt(state)?;
            attempt.expect_phase(&[CyclePhase::Admitted], "reserve")?;
            (attempt.requirement.count, attempt.requirement.topology.mode)
        };

        let report = self.fetch_report(node, cancel).await?;
        let free = self.free_devices(node, &report, cancel).await?;

        let mut acquired = match self.strategy.select(&free, count) {
            Some(pick) => self.take_all(pod, node, &pick.device_ids, cancel).await?,
            None => Vec::new(),
        };

        if acquired.is_empty() && mode != TopologyMode::Required {
            acquired = self.take_ascending(pod, node, &report.usable_devices(), count, cancel).await?;
        }

        if (acquired.len() as u32) < count {
            return Err(SchedError::InsufficientDevices {
                node: node.to_string(),
                requested: count,
                total: report.devices.len() as u32,
            });
        }

        let attempt = state.read_mut::<AttemptState>(STATE_KEY)?;
        attempt.phase = CyclePhase::Reserved;
        attempt.chosen_node = Some(node.to_string());
        attempt.chosen_ids = acquired.clone();

        info!(pod = %pod, node = node, gpus = ?acquired, "Reserved GPUs");
        Ok(acquired)
    }

    /// Release the leases recorded in this cycle.
    ///
    /// Safe to call any number of times. Runs with its own token so a
    /// cancelled cycle still gives its leases back.
    pub async fn unreserve(&self, state: &mut CycleState, pod: &PodRef) -> SchedResult<()> {
        if !state.contains(STATE_KEY) {
            return Ok(());
        }

        let (node, ids) = {
            let attempt = self.attempt(state)?;
            match attempt.chosen_node.clone() {
                Some(node) if !attempt.chosen_ids.is_empty() => {
                    (node, attempt.chosen_ids.clone())
                }
                _ => {
                    debug!(pod = %pod, phase = %attempt.phase, "Nothing to unreserve");
                    return Ok(());
                }
            }
        };

        // Keep the recorded ids until every release succeeded so a retry
        // covers the same set.
        let uncancelled = CancellationToken::new();
        self.leases.release_all(&node, &ids, &uncancelled).await?;

        let attempt = state.read_mut::<AttemptState>(STATE_KEY)?;
        attempt.phase = CyclePhase::Unreserved;
        attempt.chosen_node = None;
        attempt.chosen_ids.clear();

        info!(pod = %pod, node = %node, gpus = ?ids, "Unreserved GPUs");
        Ok(())
    }

    /// Persist the allocation record for the admission mutator.
    ///
    /// A failed commit leaves the leases held; the reservation itself stands
    /// and the commit may be retried.
    pub async fn commit(
        &self,
        state: &mut CycleState,
        pod: &PodRef,
        cancel: &CancellationToken,
    ) -> SchedResult<AllocationRecord> {
        let record = {
            let attempt = self.attempt(state)?;
            attempt.expect_phase(&[CyclePhase::Reserved, CyclePhase::Committed], "commit")?;
            let node = attempt
                .chosen_node
                .clone()
                .ok_or_else(|| SchedError::Internal("reserved without node".to_string()))?;
            let record = AllocationRecord::new(node, attempt.chosen_ids.clone());
            if attempt.phase == CyclePhase::Committed {
                return Ok(record);
            }
            record
        };

        bounded(
            cancel,
            self.call_timeout,
            "allocation commit",
            self.sink.commit(pod, &record),
        )
        .await
        .map_err(|e| match e {
            SchedError::Cancelled(_) => e,
            other => SchedError::Commit(other.to_string()),
        })?;

        state.read_mut::<AttemptState>(STATE_KEY)?.phase = CyclePhase::Committed;
        info!(pod = %pod, allocation = %record, "Committed allocation");
        Ok(record)
    }

    /// Usable devices on `node` that no live lease covers
    async fn free_devices(
        &self,
        node: &str,
        report: &NodeDeviceReport,
        cancel: &CancellationToken,
    ) -> SchedResult<Vec<Device>> {
        let leased: HashSet<u32> = self
            .leases
            .held_on(node, cancel)
            .await?
            .into_iter()
            .map(|l| l.device_id)
            .collect();
        let mut free = report.usable_devices();
        free.retain(|d| !leased.contains(&d.id));
        Ok(free)
    }

    /// Lease every id in `ids` or none of them.
    ///
    /// Returns the ids on success and an empty list when another holder won
    /// one of them.
    async fn take_all(
        &self,
        pod: &PodRef,
        node: &str,
        ids: &[u32],
        cancel: &CancellationToken,
    ) -> SchedResult<Vec<u32>> {
        let mut acquired = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.leases.acquire(node, id, &pod.uid, cancel).await {
                Ok(true) => acquired.push(id),
                Ok(false) => {
                    debug!(node = node, gpu = id, "Window device taken, releasing window");
                    self.rollback(node, &acquired, None, &pod.uid).await;
                    return Ok(Vec::new());
                }
                Err(e) => {
                    warn!(pod = %pod, node = node, gpu = id, error = %e, "Lease acquire failed, rolling back");
                    self.rollback(node, &acquired, Some(id), &pod.uid).await;
                    return Err(e);
                }
            }
        }
        Ok(acquired)
    }

    /// Lease the first `count` free devices in ascending id order.
    ///
    /// A short walk releases what it took and returns an empty list.
    async fn take_ascending(
        &self,
        pod: &PodRef,
        node: &str,
        devices: &[Device],
        count: u32,
        cancel: &CancellationToken,
    ) -> SchedResult<Vec<u32>> {
        let mut acquired: Vec<u32> = Vec::with_capacity(count as usize);
        for device in devices {
            if acquired.len() as u32 == count {
                break;
            }
            match self.leases.acquire(node, device.id, &pod.uid, cancel).await {
                Ok(true) => acquired.push(device.id),
                Ok(false) => debug!(node = node, gpu = device.id, "Device already leased"),
                Err(e) => {
                    warn!(pod = %pod, node = node, gpu = device.id, error = %e, "Lease acquire failed, rolling back");
                    self.rollback(node, &acquired, Some(device.id), &pod.uid).await;
                    return Err(e);
                }
            }
        }

        if (acquired.len() as u32) < count {
            warn!(
                pod = %pod,
                node = node,
                requested = count,
                acquired = acquired.len(),
                "Not enough free GPUs, rolling back"
            );
            self.rollback(node, &acquired, None, &pod.uid).await;
            acquired.clear();
        }
        Ok(acquired)
    }

    async fn fetch_report(&self, node: &str, cancel: &CancellationToken) -> SchedResult<NodeDeviceReport> {
        bounded(
            cancel,
            self.call_timeout,
            "node catalog get",
            self.catalog.get_node_report(node),
        )
        .await
    }

    /// Release leases taken by a failed reserve.
    ///
    /// `in_flight` is a device whose acquire was interrupted; it is only
    /// released if this pod turns out to hold it.
    async fn rollback(&self, node: &str, acquired: &[u32], in_flight: Option<u32>, holder: &str) {
        let uncancelled = CancellationToken::new();
        // Failures are logged by release_all; the leases stay for an operator sweep.
        let _ = self.leases.release_all(node, acquired, &uncancelled).await;

        if let Some(id) = in_flight {
            if let Err(e) = self
                .leases
                .release_if_held(node, id, holder, &uncancelled)
                .await
            {
                warn!(node = node, gpu = id, error = %e, "Failed to check interrupted lease");
            }
        }
    }
}
