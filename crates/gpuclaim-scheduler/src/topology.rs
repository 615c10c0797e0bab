//! Topology-aware device selection on one node

use gpuclaim_core::Device;

/// Fixed additive for any topologically contiguous placement.
///
/// Larger than any bandwidth difference, so contiguity always ranks first and
/// bandwidth only breaks ties.
pub const CONTIGUITY_BONUS: u64 = 1000;

/// Device subset chosen on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyPick {
    /// Placement score, higher is better
    pub score: u64,
    /// Chosen device ids, ascending
    pub device_ids: Vec<u32>,
    /// Bandwidth of the first device in the window
    pub bandwidth: u32,
}

/// Strategy for picking devices on one node
pub trait PlacementStrategy: Send + Sync {
    /// Strategy name for logging
    fn name(&self) -> &'static str;

    /// Pick `count` devices, or `None` if the node is infeasible
    fn select(&self, devices: &[Device], count: u32) -> Option<TopologyPick>;
}

/// Contiguous ids on a single interconnect island
pub struct ContiguousIslandStrategy;

impl PlacementStrategy for ContiguousIslandStrategy {
    fn name(&self) -> &'static str {
        "contiguous-island"
    }

    fn select(&self, devices: &[Device], count: u32) -> Option<TopologyPick> {
        select_contiguous(devices, count)
    }
}

/// Slide a window of `count` over the id-sorted devices and return the best
/// window whose ids are consecutive and share one island.
///
/// Score is `CONTIGUITY_BONUS + bandwidth` of the window's first device. The
/// first window wins on equal scores.
pub fn select_contiguous(devices: &[Device], count: u32) -> Option<TopologyPick> {
    let count = count as usize;
    if count == 0 || devices.len() < count {
        return None;
    }

    let mut sorted: Vec<&Device> = devices.iter().collect();
    sorted.sort_by_key(|d| d.id);

    let mut best: Option<TopologyPick> = None;
    for window in sorted.windows(count) {
        let first = window[0];
        let feasible = window.iter().enumerate().all(|(k, d)| {
            u64::from(d.id) == u64::from(first.id) + k as u64 && d.island == first.island
        });
        if !feasible {
            continue;
        }

        let score = CONTIGUITY_BONUS + u64::from(first.bandwidth);
        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(TopologyPick {
                score,
                device_ids: window.iter().map(|d| d.id).collect(),
                bandwidth: first.bandwidth,
            });
        }
    }

    best
}
