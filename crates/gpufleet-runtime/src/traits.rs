//! Engine trait definitions

use async_trait::async_trait;
use gpufleet_core::{ComputeNode, FleetResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::types::{ContainerCreate, ContainerInspect, StatsFrame, VolumeCreate};

/// Duplex byte stream of an attached exec session
pub trait ExecStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ExecStream for T {}

/// Boxed exec stream
pub type ExecIo = Box<dyn ExecStream>;

/// Remote container engine on one node
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine address this handle talks to
    fn endpoint(&self) -> &str;

    /// Lightweight liveness probe
    async fn ping(&self) -> FleetResult<()>;

    /// Create a named volume
    async fn create_volume(&self, volume: &VolumeCreate) -> FleetResult<()>;

    /// Remove a named volume
    async fn remove_volume(&self, name: &str) -> FleetResult<()>;

    /// Create a container, returning its id
    async fn create_container(&self, name: &str, body: &ContainerCreate) -> FleetResult<String>;

    /// Start a container
    async fn start_container(&self, id: &str) -> FleetResult<()>;

    /// Stop a container, killing it after `grace`
    async fn stop_container(&self, id: &str, grace: Duration) -> FleetResult<()>;

    /// Restart a container, killing it after `grace`
    async fn restart_container(&self, id: &str, grace: Duration) -> FleetResult<()>;

    /// Remove a container
    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> FleetResult<()>;

    /// Inspect a container
    async fn inspect_container(&self, id: &str) -> FleetResult<ContainerInspect>;

    /// Stdout and stderr with timestamps, demultiplexed
    async fn container_logs(&self, id: &str, tail: Option<u64>) -> FleetResult<String>;

    /// Up to `max` frames of the stats stream read within `window`
    async fn stats_frames(
        &self,
        id: &str,
        max: usize,
        window: Duration,
    ) -> FleetResult<Vec<StatsFrame>>;

    /// Run a command inside the container and collect its output
    async fn exec_output(&self, id: &str, cmd: &[&str]) -> FleetResult<String>;

    /// Create an interactive exec instance, returning its id
    async fn exec_create(&self, id: &str, cmd: &[&str]) -> FleetResult<String>;

    /// Start an exec instance and attach to its terminal
    async fn exec_attach(&self, exec_id: &str) -> FleetResult<ExecIo>;

    /// Resize an exec instance's terminal
    async fn exec_resize(&self, exec_id: &str, rows: u16, cols: u16) -> FleetResult<()>;
}

/// Opens engine handles for nodes
#[async_trait]
pub trait EngineConnector: Send + Sync {
    /// Build a handle for the node's engine
    async fn open(&self, node: &ComputeNode) -> FleetResult<Arc<dyn ContainerEngine>>;

    /// Probe the node's engine; never fails
    async fn test_connection(&self, node: &ComputeNode) -> (bool, String);
}
