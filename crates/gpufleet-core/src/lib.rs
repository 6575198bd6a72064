//! gpufleet-core: Core types and traits for the gpufleet control plane
//!
//! This crate provides the fundamental types used throughout gpufleet:
//! - Compute node, workload spec, image and workload records
//! - Lifecycle and connectivity states
//! - Catalog projections
//! - Configuration types
//! - Error handling

pub mod catalog;
pub mod config;
pub mod error;
pub mod model;

pub use catalog::*;
pub use config::*;
pub use error::*;
pub use model::*;
