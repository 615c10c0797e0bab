//! gpuclaim-core: Core types and traits for gpuclaim
//!
//! This crate provides the fundamental types used throughout the gpuclaim system:
//! - Allocation claims and resolved requirements
//! - Per-node device reports
//! - Device leases and allocation records
//! - Cycle-scoped scheduling state
//! - Collaborator traits, configuration and error handling

pub mod allocation;
pub mod claim;
pub mod config;
pub mod cycle;
pub mod error;
pub mod gpu;
pub mod traits;

pub use allocation::*;
pub use claim::*;
pub use config::*;
pub use cycle::*;
pub use error::*;
pub use gpu::*;
pub use traits::*;
