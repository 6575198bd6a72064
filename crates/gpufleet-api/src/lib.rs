//! gpufleet-api: REST API server for gpufleet
//!
//! This crate exposes the control plane over HTTP:
//! - Candidate queries and catalog projections
//! - Workload lifecycle, stats and logs
//! - Node registration and liveness tests
//! - Interactive terminals over WebSocket

pub mod rest;
pub mod terminal;

pub use rest::{create_router, AppState, Caller};
