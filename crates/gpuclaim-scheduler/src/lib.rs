//! gpuclaim-scheduler: Topology-aware GPU scheduling core
//!
//! This crate provides the placement logic for pods that claim GPU devices:
//! - Device leases backed by an atomic create-if-absent store
//! - Contiguous, island-aware device selection
//! - Claim resolution and validation
//! - The per-cycle admit/filter/score/reserve/commit state machine

mod call;
pub mod coordinator;
pub mod lease;
pub mod resolver;
pub mod scheduler;
pub mod topology;

pub use coordinator::{AttemptState, CycleCoordinator, CyclePhase, STATE_KEY};
pub use lease::LeaseManager;
pub use resolver::ClaimResolver;
pub use scheduler::{RankedNode, Scheduler};
pub use topology::{ContiguousIslandStrategy, PlacementStrategy, TopologyPick, CONTIGUITY_BONUS};
