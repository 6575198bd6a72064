//! gpufleet-store: Record storage
//!
//! This crate provides the persistence collaborator:
//! - A generic repository over nodes, specs, images and workloads
//! - Per-kind filters and field patches
//! - Soft delete and pagination
//! - An in-memory store seeded from TOML

pub mod memory;
pub mod record;
pub mod repository;

pub use memory::{FleetStore, MemoryStore, SeedFile};
pub use record::*;
pub use repository::{MemoryRepository, Page, Paged, Repository};
