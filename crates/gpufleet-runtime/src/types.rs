//! Wire types of the container engine remote API

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of a container create request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreate {
    /// Image reference
    pub image: String,
    /// `KEY=value` environment entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Labels applied to the unit
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Host-side constraints
    #[serde(default)]
    pub host_config: HostConfig,
}

impl ContainerCreate {
    /// Value of an environment entry
    pub fn env_value(&self, key: &str) -> Option<&str> {
        env_lookup(&self.env, key)
    }
}

/// Host-side resource constraints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    /// CPU quota in units of 1e-9 CPUs
    #[serde(default, skip_serializing_if = "is_zero")]
    pub nano_cpus: i64,
    /// Memory ceiling in bytes
    #[serde(default, skip_serializing_if = "is_zero")]
    pub memory: i64,
    /// Volume and bind mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountSpec>,
    /// GPU device requests
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_requests: Vec<DeviceRequest>,
    /// Storage driver options (root filesystem quota)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_opt: Option<BTreeMap<String, String>>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// A mount requested at create time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountSpec {
    /// "volume" or "bind"
    #[serde(rename = "Type")]
    pub kind: String,
    /// Volume name or host path
    pub source: String,
    /// Path inside the unit
    pub target: String,
}

impl MountSpec {
    /// Named volume mount
    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: "volume".to_string(),
            source: name.into(),
            target: target.into(),
        }
    }

    /// Host bind mount
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: "bind".to_string(),
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A request for host devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRequest {
    /// Device driver
    pub driver: String,
    /// Number of devices
    pub count: i64,
    /// Capability sets
    pub capabilities: Vec<Vec<String>>,
}

impl DeviceRequest {
    /// Request `count` GPUs from the nvidia driver
    pub fn gpus(count: u64) -> Self {
        Self {
            driver: "nvidia".to_string(),
            count: count as i64,
            capabilities: vec![vec!["gpu".to_string()]],
        }
    }
}

/// Body of a volume create request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeCreate {
    /// Volume name
    pub name: String,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Reply carrying a newly created object's id
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdResponse {
    /// Object id
    pub id: String,
    /// Engine warnings
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// Container inspection result (fields gpufleet reads)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    /// Container id
    #[serde(default)]
    pub id: String,
    /// Container name, with a leading slash
    #[serde(default)]
    pub name: String,
    /// Runtime state
    #[serde(default)]
    pub state: ContainerState,
    /// Attached mounts
    #[serde(default)]
    pub mounts: Vec<MountPoint>,
    /// Creation config
    #[serde(default)]
    pub config: InspectConfig,
    /// Host config
    #[serde(default)]
    pub host_config: InspectHostConfig,
}

impl ContainerInspect {
    /// Value of an environment entry in the unit config
    pub fn env_value(&self, key: &str) -> Option<&str> {
        env_lookup(&self.config.env, key)
    }

    /// Names of attached named volumes
    pub fn named_volumes(&self) -> Vec<String> {
        self.mounts
            .iter()
            .filter(|m| m.kind == "volume" && !m.name.is_empty())
            .map(|m| m.name.clone())
            .collect()
    }
}

/// Runtime state of a container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    /// "created", "running", "exited", ...
    #[serde(default)]
    pub status: String,
    /// Whether the main process runs
    #[serde(default)]
    pub running: bool,
}

/// A mount reported by inspection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountPoint {
    /// "volume", "bind", ...
    #[serde(rename = "Type", default)]
    pub kind: String,
    /// Volume name (empty for binds)
    #[serde(default)]
    pub name: String,
    /// Path inside the unit
    #[serde(default)]
    pub destination: String,
}

/// Creation config reported by inspection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    /// Environment entries
    #[serde(default, deserialize_with = "null_as_default")]
    pub env: Vec<String>,
}

/// Host config reported by inspection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectHostConfig {
    /// CPU set the unit is pinned to (e.g. "0-3,8")
    #[serde(default)]
    pub cpuset_cpus: String,
    /// CPU quota in units of 1e-9 CPUs
    #[serde(default)]
    pub nano_cpus: i64,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn env_lookup<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter().find_map(|entry| {
        entry
            .split_once('=')
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
    })
}

/// Body of an exec create request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecCreate {
    /// Attach stdin
    pub attach_stdin: bool,
    /// Attach stdout
    pub attach_stdout: bool,
    /// Attach stderr
    pub attach_stderr: bool,
    /// Allocate a pseudo-terminal
    pub tty: bool,
    /// Command and arguments
    pub cmd: Vec<String>,
}

/// Body of an exec start request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecStart {
    /// Detach after starting
    pub detach: bool,
    /// Pseudo-terminal mode
    pub tty: bool,
}

/// One frame of the engine's stats stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsFrame {
    /// RFC 3339 read timestamp
    #[serde(default)]
    pub read: String,
    /// CPU counters at `read`
    #[serde(default)]
    pub cpu_stats: CpuStats,
    /// CPU counters of the previous frame
    #[serde(default)]
    pub precpu_stats: CpuStats,
    /// Memory counters
    #[serde(default)]
    pub memory_stats: MemoryStats,
    /// Process counters
    #[serde(default)]
    pub pids_stats: PidsStats,
}

impl StatsFrame {
    /// Parsed read timestamp
    pub fn read_at(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.read).ok()
    }
}

/// CPU counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuStats {
    /// Container usage
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    /// Host cumulative usage in nanoseconds
    #[serde(default)]
    pub system_cpu_usage: Option<u64>,
    /// Online CPUs visible to the unit
    #[serde(default)]
    pub online_cpus: Option<u32>,
}

/// Container CPU usage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuUsage {
    /// Cumulative usage in nanoseconds
    #[serde(default)]
    pub total_usage: u64,
    /// Per-CPU cumulative usage (cgroup v1 only)
    #[serde(default)]
    pub percpu_usage: Option<Vec<u64>>,
}

/// Memory counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Bytes in use
    #[serde(default)]
    pub usage: Option<u64>,
    /// Ceiling in bytes
    #[serde(default)]
    pub limit: Option<u64>,
}

/// Process counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PidsStats {
    /// Live processes
    #[serde(default)]
    pub current: Option<u64>,
}
