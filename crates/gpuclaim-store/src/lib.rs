//! gpuclaim-store: Storage backends for gpuclaim
//!
//! This crate provides the consistent store the scheduling core runs against:
//! - Claims, node reports, leases and allocation records in memory
//! - Atomic create-if-absent for device leases
//! - Seeding from a JSON snapshot directory

pub mod memory;
pub mod snapshot;

pub use memory::{AllocationEntry, MemoryStore, StoreStats};
pub use snapshot::{load_snapshot, SnapshotSummary};
