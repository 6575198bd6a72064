//! gpufleet-runtime: Remote container engine control
//!
//! This crate drives execution units on compute nodes:
//! - The `ContainerEngine` trait over the engine's remote API
//! - A Docker Engine implementation over HTTP(S) with mutual TLS
//! - Per-node connection management and liveness probing
//! - The container lifecycle driver
//! - The interactive shell session proxy

pub mod connection;
pub mod docker;
pub mod driver;
pub mod session;
pub mod stream;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use connection::ConnectionManager;
pub use docker::DockerEngine;
pub use driver::{container_name, ContainerDriver, ProvisionedUnit};
pub use session::{ClientFrame, ControlMessage, ServerFrame, SessionProxy};
pub use traits::{ContainerEngine, EngineConnector, ExecIo};
pub use types::*;
