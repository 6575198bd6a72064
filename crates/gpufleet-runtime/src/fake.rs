//! In-memory engine and connector for tests

use async_trait::async_trait;
use gpufleet_core::{ComputeNode, FleetError, FleetResult};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::DuplexStream;

use crate::traits::{ContainerEngine, EngineConnector, ExecIo};
use crate::types::{
    ContainerCreate, ContainerInspect, ContainerState, InspectConfig, InspectHostConfig,
    MountPoint, StatsFrame, VolumeCreate,
};

/// A container held by the fake engine
#[derive(Debug, Clone)]
pub struct FakeContainer {
    /// Container name
    pub name: String,
    /// Create request as received
    pub body: ContainerCreate,
    /// Engine state string
    pub status: String,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    containers: BTreeMap<String, FakeContainer>,
    volumes: BTreeSet<String>,
    fail_always: HashMap<String, (u16, String)>,
    fail_once: HashMap<String, VecDeque<(u16, String)>>,
    exec_outputs: HashMap<String, String>,
    stats: Vec<StatsFrame>,
    logs: String,
    exec_peers: Vec<DuplexStream>,
    next_id: u64,
    unreachable: bool,
}

/// Engine keeping containers and volumes in memory
pub struct FakeEngine {
    address: String,
    state: Mutex<FakeState>,
}

impl FakeEngine {
    /// Create an empty engine answering for `address`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fail every call to `op` (or `op:detail`)
    pub fn fail_always(&self, op: &str, status: u16, message: &str) {
        self.state()
            .fail_always
            .insert(op.to_string(), (status, message.to_string()));
    }

    /// Fail the next call to `op` (or `op:detail`)
    pub fn fail_once(&self, op: &str, status: u16, message: &str) {
        self.state()
            .fail_once
            .entry(op.to_string())
            .or_default()
            .push_back((status, message.to_string()));
    }

    /// Make every call fail with a connection error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Script the output of an in-container command
    pub fn set_exec_output(&self, cmd: &[&str], output: &str) {
        self.state()
            .exec_outputs
            .insert(cmd.join(" "), output.to_string());
    }

    /// Script the stats stream
    pub fn set_stats(&self, frames: Vec<StatsFrame>) {
        self.state().stats = frames;
    }

    /// Script the log output
    pub fn set_logs(&self, logs: &str) {
        self.state().logs = logs.to_string();
    }

    /// Insert a container directly
    pub fn add_container(&self, id: &str, name: &str, body: ContainerCreate, status: &str) {
        self.state().containers.insert(
            id.to_string(),
            FakeContainer {
                name: name.to_string(),
                body,
                status: status.to_string(),
            },
        );
    }

    /// Insert a volume directly
    pub fn add_volume(&self, name: &str) {
        self.state().volumes.insert(name.to_string());
    }

    /// Recorded calls in order
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// A container by id
    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state().containers.get(id).cloned()
    }

    /// Number of containers held
    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    /// Names of volumes held
    pub fn volumes(&self) -> Vec<String> {
        self.state().volumes.iter().cloned().collect()
    }

    /// The test side of the most recent exec attach
    pub fn take_exec_peer(&self) -> Option<DuplexStream> {
        self.state().exec_peers.pop()
    }

    fn begin(&self, op: &str, detail: &str) -> FleetResult<MutexGuard<'_, FakeState>> {
        let mut state = self.state();
        state.calls.push(format!("{} {}", op, detail).trim_end().to_string());
        if state.unreachable {
            return Err(FleetError::Connection(format!("{} unreachable", self.address)));
        }
        let detailed = format!("{}:{}", op, detail);
        for key in [detailed.as_str(), op] {
            if let Some((status, message)) = state.fail_once.get_mut(key).and_then(|q| q.pop_front())
            {
                return Err(FleetError::Engine { status, message });
            }
            if let Some((status, message)) = state.fail_always.get(key).cloned() {
                return Err(FleetError::Engine { status, message });
            }
        }
        Ok(state)
    }
}

fn no_such(kind: &str, id: &str) -> FleetError {
    FleetError::Engine {
        status: 404,
        message: format!("No such {}: {}", kind, id),
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn endpoint(&self) -> &str {
        &self.address
    }

    async fn ping(&self) -> FleetResult<()> {
        let _state = self.begin("ping", "")?;
        Ok(())
    }

    async fn create_volume(&self, volume: &VolumeCreate) -> FleetResult<()> {
        let mut state = self.begin("create_volume", &volume.name)?;
        state.volumes.insert(volume.name.clone());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> FleetResult<()> {
        let mut state = self.begin("remove_volume", name)?;
        if state.volumes.remove(name) {
            Ok(())
        } else {
            Err(no_such("volume", name))
        }
    }

    async fn create_container(&self, name: &str, body: &ContainerCreate) -> FleetResult<String> {
        let mut state = self.begin("create_container", name)?;
        if state.containers.values().any(|c| c.name == name) {
            return Err(FleetError::Engine {
                status: 409,
                message: format!("name {} already in use", name),
            });
        }
        state.next_id += 1;
        let id = format!("c{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                body: body.clone(),
                status: "created".to_string(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> FleetResult<()> {
        let mut state = self.begin("start", id)?;
        let container = state.containers.get_mut(id).ok_or_else(|| no_such("container", id))?;
        container.status = "running".to_string();
        Ok(())
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> FleetResult<()> {
        let mut state = self.begin("stop", &format!("{} {}", id, grace.as_secs()))?;
        let container = state.containers.get_mut(id).ok_or_else(|| no_such("container", id))?;
        container.status = "exited".to_string();
        Ok(())
    }

    async fn restart_container(&self, id: &str, grace: Duration) -> FleetResult<()> {
        let mut state = self.begin("restart", &format!("{} {}", id, grace.as_secs()))?;
        let container = state.containers.get_mut(id).ok_or_else(|| no_such("container", id))?;
        container.status = "running".to_string();
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> FleetResult<()> {
        let mut state = self.begin(
            "remove",
            &format!("{} force={} v={}", id, force, volumes),
        )?;
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| no_such("container", id))
    }

    async fn inspect_container(&self, id: &str) -> FleetResult<ContainerInspect> {
        let state = self.begin("inspect", id)?;
        let container = state.containers.get(id).ok_or_else(|| no_such("container", id))?;
        let host = &container.body.host_config;
        Ok(ContainerInspect {
            id: id.to_string(),
            name: format!("/{}", container.name),
            state: ContainerState {
                status: container.status.clone(),
                running: container.status == "running",
            },
            mounts: host
                .mounts
                .iter()
                .map(|m| MountPoint {
                    kind: m.kind.clone(),
                    name: if m.kind == "volume" {
                        m.source.clone()
                    } else {
                        String::new()
                    },
                    destination: m.target.clone(),
                })
                .collect(),
            config: InspectConfig {
                env: container.body.env.clone(),
            },
            host_config: InspectHostConfig {
                cpuset_cpus: String::new(),
                nano_cpus: host.nano_cpus,
            },
        })
    }

    async fn container_logs(&self, id: &str, _tail: Option<u64>) -> FleetResult<String> {
        let state = self.begin("logs", id)?;
        if !state.containers.contains_key(id) {
            return Err(no_such("container", id));
        }
        Ok(state.logs.clone())
    }

    async fn stats_frames(
        &self,
        id: &str,
        max: usize,
        _window: Duration,
    ) -> FleetResult<Vec<StatsFrame>> {
        let state = self.begin("stats", id)?;
        Ok(state.stats.iter().take(max).cloned().collect())
    }

    async fn exec_output(&self, id: &str, cmd: &[&str]) -> FleetResult<String> {
        let joined = cmd.join(" ");
        let state = self.begin("exec_output", &joined)?;
        state.exec_outputs.get(&joined).cloned().ok_or_else(|| FleetError::Engine {
            status: 500,
            message: format!("exec {} in {} failed", joined, id),
        })
    }

    async fn exec_create(&self, id: &str, cmd: &[&str]) -> FleetResult<String> {
        let shell = cmd.first().copied().unwrap_or_default();
        let state = self.begin("exec_create", shell)?;
        if !state.containers.contains_key(id) {
            return Err(no_such("container", id));
        }
        Ok(format!("exec-{}", shell.trim_start_matches('/').replace('/', "-")))
    }

    async fn exec_attach(&self, exec_id: &str) -> FleetResult<ExecIo> {
        let mut state = self.begin("exec_attach", exec_id)?;
        let (local, peer) = tokio::io::duplex(64 * 1024);
        state.exec_peers.push(peer);
        Ok(Box::new(local))
    }

    async fn exec_resize(&self, exec_id: &str, rows: u16, cols: u16) -> FleetResult<()> {
        let _state = self.begin("exec_resize", &format!("{} {}x{}", exec_id, rows, cols))?;
        Ok(())
    }
}

/// Connector handing out fake engines by node address
#[derive(Default)]
pub struct FakeConnector {
    engines: Mutex<HashMap<String, Arc<FakeEngine>>>,
}

impl FakeConnector {
    /// Create a connector with no engines
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the engine for an address
    pub fn engine(&self, address: &str) -> Arc<FakeEngine> {
        let mut engines = match self.engines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        engines
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(FakeEngine::new(address)))
            .clone()
    }
}

#[async_trait]
impl EngineConnector for FakeConnector {
    async fn open(&self, node: &ComputeNode) -> FleetResult<Arc<dyn ContainerEngine>> {
        if node.engine_address.is_empty() {
            return Err(FleetError::ConfigIncomplete(
                "engine address is empty".to_string(),
            ));
        }
        Ok(self.engine(&node.engine_address))
    }

    async fn test_connection(&self, node: &ComputeNode) -> (bool, String) {
        let engine = match self.open(node).await {
            Ok(engine) => engine,
            Err(e) => return (false, e.to_string()),
        };
        match engine.ping().await {
            Ok(()) => (true, "connected".to_string()),
            Err(e) => (false, e.to_string()),
        }
    }
}
