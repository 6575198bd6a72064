//! gpufleet-scheduler: GPU-aware placement and workload orchestration
//!
//! This crate decides where workloads run and drives them there:
//! - Per-card GPU memory ledger with whole-card and partitioned claims
//! - Pluggable card placement strategy (pack-first by default)
//! - Capacity scheduler replaying placed workloads onto listed nodes
//! - Workload service enforcing ownership over the lifecycle
//! - Periodic reconciliation of node connectivity and workload status

pub mod gpu_allocator;
pub mod placement;
pub mod reconcile;
pub mod scheduler;
pub mod service;

pub use gpu_allocator::{CardClaim, CardLedger};
pub use placement::{NodeCandidate, NodeUsage, PackFirstStrategy, PlacementStrategy};
pub use reconcile::{ReconcileReport, ReconciliationLoop};
pub use scheduler::CapacityScheduler;
pub use service::{CreateWorkload, NodeTest, WorkloadService};
