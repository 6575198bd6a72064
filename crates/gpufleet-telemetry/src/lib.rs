//! gpufleet-telemetry: Container and GPU telemetry
//!
//! This crate samples live usage of a workload's execution unit:
//! - CPU, memory and process counts from the engine CLI or raw stats frames
//! - GPU memory size and usage through an ordered chain of probes
//! - A short-lived keyed cache bounding load on remote hosts

pub mod cache;
pub mod cli;
pub mod collector;
pub mod cpu;
pub mod parse;
pub mod probe;

pub use cache::StatsCache;
pub use cli::{DockerCliSampler, SnapshotSampler};
pub use collector::{ContainerStats, TelemetryCollector};
pub use probe::{GpuMemory, GpuProbe, ProbeContext};
