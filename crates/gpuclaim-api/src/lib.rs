//! gpuclaim-api: REST API server for gpuclaim
//!
//! This crate provides the REST API of the daemon:
//! - Node report publishing and listing
//! - Claim management
//! - Lease and allocation inspection
//! - Driving scheduling cycles

pub mod rest;

pub use rest::create_router;
