//! Main scheduler logic

use futures::future::join_all;
use gpuclaim_core::{AllocationRecord, CycleState, PodRef, SchedError, SchedResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::CycleCoordinator;

/// A node that passed filtering, with its score
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedNode {
    pub node: String,
    pub score: u64,
}

/// Drives complete scheduling cycles through the coordinator's phases
pub struct Scheduler {
    coordinator: Arc<CycleCoordinator>,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(coordinator: Arc<CycleCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Underlying coordinator
    pub fn coordinator(&self) -> &Arc<CycleCoordinator> {
        &self.coordinator
    }

    /// Run one scheduling cycle for `pod` over `candidates`.
    ///
    /// Every candidate is filtered and scored concurrently. Reservation is
    /// tried on the best node first, then on the next ranked node when the
    /// best one turns out to be short on devices. Cancellation observed
    /// before commit releases the leases again; once the commit is issued it
    /// runs to completion under the call timeout, and a failed commit keeps
    /// the leases.
    ///
    /// The returned future must be driven to completion: dropping it after
    /// reserve leaves the leases held. Callers that may go away mid-cycle
    /// use [`Scheduler::schedule_detached`].
    pub async fn schedule_pod(
        &self,
        pod: &PodRef,
        candidates: &[String],
        cancel: &CancellationToken,
    ) -> SchedResult<AllocationRecord> {
        let mut state = CycleState::new();
        self.run_cycle(&mut state, pod, candidates, cancel).await
    }

    /// Run a cycle on its own task.
    ///
    /// Dropping the returned future cancels the cycle instead of abandoning
    /// it, so a reservation is either committed or released.
    pub async fn schedule_detached(
        self: &Arc<Self>,
        pod: PodRef,
        candidates: Vec<String>,
    ) -> SchedResult<AllocationRecord> {
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let scheduler = self.clone();

        tokio::spawn(async move { scheduler.schedule_pod(&pod, &candidates, &cancel).await })
            .await
            .map_err(|e| SchedError::Internal(format!("scheduling task failed: {}", e)))?
    }

    /// Run one cycle against caller-owned cycle state
    pub async fn run_cycle(
        &self,
        state: &mut CycleState,
        pod: &PodRef,
        candidates: &[String],
        cancel: &CancellationToken,
    ) -> SchedResult<AllocationRecord> {
        let cycle_id = Uuid::new_v4();
        info!(cycle = %cycle_id, pod = %pod, nodes = candidates.len(), "Starting scheduling cycle");

        self.coordinator.admit(state, pod, cancel).await?;

        let ranked = self.rank_nodes(state, candidates, cancel).await?;

        let mut last_err = None;
        let mut reserved_on = None;
        for candidate in &ranked {
            match self
                .coordinator
                .reserve(state, pod, &candidate.node, cancel)
                .await
            {
                Ok(_) => {
                    reserved_on = Some(candidate.node.clone());
                    break;
                }
                Err(e @ SchedError::InsufficientDevices { .. }) => {
                    debug!(cycle = %cycle_id, node = %candidate.node, error = %e, "Trying next node");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let Some(node) = reserved_on else {
            return Err(last_err.unwrap_or_else(|| {
                SchedError::Unschedulable(format!("no node could be reserved for {}", pod))
            }));
        };

        if cancel.is_cancelled() {
            self.unreserve_after_failure(state, pod).await;
            return Err(SchedError::Cancelled(format!("cycle for {} on {}", pod, node)));
        }

        // A commit may land remotely even when its caller stops waiting, so
        // it is not tied to the cycle's token.
        let uncancelled = CancellationToken::new();
        match self.coordinator.commit(state, pod, &uncancelled).await {
            Ok(record) => {
                info!(cycle = %cycle_id, pod = %pod, allocation = %record, "Scheduling cycle complete");
                Ok(record)
            }
            Err(e) => {
                warn!(cycle = %cycle_id, pod = %pod, error = %e, "Commit failed, leases kept for retry");
                Err(e)
            }
        }
    }

    /// Filter and score every candidate, best first.
    ///
    /// Ties are broken by node name. A transient failure is only returned when
    /// no node could be ranked at all.
    pub async fn rank_nodes(
        &self,
        state: &CycleState,
        candidates: &[String],
        cancel: &CancellationToken,
    ) -> SchedResult<Vec<RankedNode>> {
        let evaluations = join_all(candidates.iter().map(|node| async move {
            let filtered = self.coordinator.filter(state, node, cancel).await?;
            let score = self.coordinator.score(state, &filtered, cancel).await?;
            Ok::<_, SchedError>((node.clone(), score))
        }))
        .await;

        let mut ranked = Vec::new();
        let mut reasons = Vec::new();
        let mut transient = None;
        for evaluation in evaluations {
            match evaluation {
                Ok((node, Some(score))) => ranked.push(RankedNode { node, score }),
                Ok((node, None)) => reasons.push(format!("{}: no feasible device set", node)),
                Err(e) if e.is_unschedulable() => reasons.push(e.to_string()),
                Err(e @ SchedError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Node evaluation failed");
                    transient.get_or_insert(e);
                }
            }
        }

        if ranked.is_empty() {
            if let Some(e) = transient {
                return Err(e);
            }
            return Err(SchedError::Unschedulable(format!(
                "0/{} nodes available: [{}]",
                candidates.len(),
                reasons.join("; ")
            )));
        }

        ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.node.cmp(&b.node)));
        Ok(ranked)
    }

    async fn unreserve_after_failure(&self, state: &mut CycleState, pod: &PodRef) {
        if let Err(e) = self.coordinator.unreserve(state, pod).await {
            warn!(pod = %pod, error = %e, "Failed to unreserve GPUs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuclaim_core::{
        AllocationClaim, Device, GpuclaimConfig, NodeDeviceReport, TopologyMode, TopologyPolicy,
    };
    use gpuclaim_store::MemoryStore;

    async fn scheduler_with(nodes: Vec<NodeDeviceReport>) -> (Arc<MemoryStore>, Scheduler) {
        scheduler_with_config(nodes, GpuclaimConfig::default()).await
    }

    async fn scheduler_with_config(
        nodes: Vec<NodeDeviceReport>,
        config: GpuclaimConfig,
    ) -> (Arc<MemoryStore>, Scheduler) {
        let store = Arc::new(MemoryStore::new());
        for report in nodes {
            store.put_node_report(report).await;
        }
        let coordinator = CycleCoordinator::new(
            &config,
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
        );
        (store, Scheduler::new(Arc::new(coordinator)))
    }

    fn node(name: &str, devices: &[(u32, &str, u32)]) -> NodeDeviceReport {
        NodeDeviceReport::new(
            name,
            devices
                .iter()
                .map(|(id, island, bw)| Device::new(*id, *island, *bw))
                .collect(),
        )
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_prefers_contiguous_high_bandwidth_node() {
        let (store, scheduler) = scheduler_with(vec![
            node("node-a", &[(0, "A", 10), (1, "B", 10)]),
            node("node-b", &[(0, "A", 50), (1, "A", 50)]),
            node("node-c", &[(0, "A", 20), (1, "A", 20)]),
        ])
        .await;
        store.put_claim(AllocationClaim::new("ml", "train", 2)).await;

        let pod = PodRef::new("ml", "p0", "uid-0").with_claim("train");
        let record = scheduler
            .schedule_pod(&pod, &names(&["node-a", "node-b", "node-c"]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.to_string(), "node-b:0,1");
    }

    #[tokio::test]
    async fn test_falls_back_to_next_node() {
        let mut config = GpuclaimConfig::default();
        config.filter.reject_under_capacity = false;
        let (store, scheduler) = scheduler_with_config(
            vec![
                node("node-a", &[(0, "A", 90), (1, "A", 90)]),
                node("node-b", &[(0, "A", 10), (1, "A", 10), (2, "A", 10)]),
            ],
            config,
        )
        .await;
        store.put_claim(AllocationClaim::new("ml", "train", 2)).await;

        // Both nodes are fragmented and tie at score 0; node-a sorts first
        // but has nothing free.
        let cancel = CancellationToken::new();
        let leases = scheduler.coordinator().leases();
        for (name, id) in [("node-a", 0), ("node-a", 1), ("node-b", 1)] {
            assert!(leases.acquire(name, id, "other", &cancel).await.unwrap());
        }

        let pod = PodRef::new("ml", "p0", "uid-0").with_claim("train");
        let record = scheduler
            .schedule_pod(&pod, &names(&["node-a", "node-b"]), &cancel)
            .await
            .unwrap();
        assert_eq!(record.to_string(), "node-b:0,2");

        let held = leases.held_on("node-a", &cancel).await.unwrap();
        assert_eq!(held.len(), 2);
        assert!(held.iter().all(|l| l.holder == "other"));
    }

    #[tokio::test]
    async fn test_required_claim_skips_leased_device() {
        let (store, scheduler) = scheduler_with(vec![node(
            "node-a",
            &[(0, "X", 10), (1, "X", 10), (2, "X", 10), (3, "X", 10)],
        )])
        .await;
        let mut claim = AllocationClaim::new("ml", "train", 2);
        claim.topology = Some(TopologyPolicy {
            mode: TopologyMode::Required,
            min_bandwidth_gbps: 0,
        });
        store.put_claim(claim).await;

        let cancel = CancellationToken::new();
        scheduler
            .coordinator()
            .leases()
            .acquire("node-a", 1, "other", &cancel)
            .await
            .unwrap();

        let pod = PodRef::new("ml", "p0", "uid-0").with_claim("train");
        let record = scheduler
            .schedule_pod(&pod, &names(&["node-a"]), &cancel)
            .await
            .unwrap();
        assert_eq!(record.device_ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_no_feasible_node() {
        let (store, scheduler) =
            scheduler_with(vec![node("node-a", &[(0, "A", 10), (1, "B", 10)])]).await;
        store.put_claim(AllocationClaim::new("ml", "train", 2)).await;

        let pod = PodRef::new("ml", "p0", "uid-0").with_claim("train");
        let err = scheduler
            .schedule_pod(&pod, &names(&["node-a", "node-x"]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_unschedulable());
        assert!(err.to_string().contains("0/2 nodes available"));
    }

    #[tokio::test]
    async fn test_cancelled_cycle_holds_no_leases() {
        let (store, scheduler) =
            scheduler_with(vec![node("node-a", &[(0, "A", 10), (1, "A", 10)])]).await;
        store.put_claim(AllocationClaim::new("ml", "train", 1)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let pod = PodRef::new("ml", "p0", "uid-0").with_claim("train");
        let err = scheduler
            .schedule_pod(&pod, &names(&["node-a"]), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, SchedError::Cancelled(_)));
        let leases = scheduler
            .coordinator()
            .leases()
            .list(&CancellationToken::new())
            .await
            .unwrap();
        assert!(leases.is_empty());
    }
}
