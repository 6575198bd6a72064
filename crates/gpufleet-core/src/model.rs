//! Node, spec, image and workload record definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned to every persisted record
pub type RecordId = u64;

/// A physical or virtual host offering capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeNode {
    /// Record identifier
    #[serde(default)]
    pub id: RecordId,
    /// Human-readable name
    pub name: String,
    /// Region or datacenter label
    #[serde(default)]
    pub region: String,
    /// CPU core count
    #[serde(default)]
    pub cpu_cores: u64,
    /// Memory in GB
    #[serde(default)]
    pub memory_gb: u64,
    /// System disk in GB
    #[serde(default)]
    pub system_disk_gb: u64,
    /// Data disk in GB
    #[serde(default)]
    pub data_disk_gb: u64,
    /// Public address
    #[serde(default)]
    pub public_ip: String,
    /// Private address
    #[serde(default)]
    pub private_ip: String,
    /// Remote container engine endpoint (e.g. "tcp://10.0.0.5:2376")
    #[serde(default)]
    pub engine_address: String,
    /// Whether the engine requires mutual TLS
    #[serde(default = "default_true")]
    pub use_tls: bool,
    /// CA certificate (PEM)
    #[serde(default)]
    pub ca_cert: Option<String>,
    /// Client certificate (PEM)
    #[serde(default)]
    pub client_cert: Option<String>,
    /// Client private key (PEM)
    #[serde(default, skip_serializing)]
    pub client_key: Option<String>,
    /// GPU model name (e.g. "A100-40G")
    #[serde(default)]
    pub gpu_name: Option<String>,
    /// Number of GPU cards
    #[serde(default)]
    pub gpu_count: u64,
    /// Memory of a single card in GB
    #[serde(default)]
    pub gpu_memory_per_card_gb: u64,
    /// Host directory holding the GPU partition library, if not the default
    #[serde(default)]
    pub partition_library_dir: Option<String>,
    /// Whether the node is listed in the catalog
    #[serde(default = "default_true")]
    pub listed: bool,
    /// Free-text note
    #[serde(default)]
    pub remark: String,
    /// Last known engine connectivity
    #[serde(default)]
    pub connectivity: NodeConnectivity,
    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Default for ComputeNode {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: String::new(),
            region: String::new(),
            cpu_cores: 0,
            memory_gb: 0,
            system_disk_gb: 0,
            data_disk_gb: 0,
            public_ip: String::new(),
            private_ip: String::new(),
            engine_address: String::new(),
            use_tls: false,
            ca_cert: None,
            client_cert: None,
            client_key: None,
            gpu_name: None,
            gpu_count: 0,
            gpu_memory_per_card_gb: 0,
            partition_library_dir: None,
            listed: true,
            remark: String::new(),
            connectivity: NodeConnectivity::Unknown,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

impl ComputeNode {
    /// Total GPU memory across all cards in GB
    pub fn total_gpu_memory_gb(&self) -> u64 {
        self.gpu_count * self.gpu_memory_per_card_gb
    }
}

fn default_true() -> bool {
    true
}

/// Engine connectivity as last observed by a liveness probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeConnectivity {
    /// Never probed
    #[default]
    Unknown,
    /// Last probe succeeded
    Connected,
    /// Last probe failed
    Failed,
}

impl std::fmt::Display for NodeConnectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeConnectivity::Unknown => write!(f, "unknown"),
            NodeConnectivity::Connected => write!(f, "connected"),
            NodeConnectivity::Failed => write!(f, "failed"),
        }
    }
}

/// A purchasable workload shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Record identifier
    #[serde(default)]
    pub id: RecordId,
    /// Display name
    pub name: String,
    /// Required GPU model, if any
    #[serde(default)]
    pub gpu_model: Option<String>,
    /// Number of GPU cards requested
    #[serde(default)]
    pub gpu_count: u64,
    /// Total GPU memory required in GB
    #[serde(default)]
    pub gpu_memory_gb: u64,
    /// CPU cores
    #[serde(default)]
    pub cpu_cores: u64,
    /// Memory in GB
    #[serde(default)]
    pub memory_gb: u64,
    /// System disk in GB
    #[serde(default)]
    pub system_disk_gb: u64,
    /// Data disk in GB
    #[serde(default)]
    pub data_disk_gb: u64,
    /// Whether GPU memory may be split across or within cards
    #[serde(default)]
    pub supports_memory_split: bool,
    /// Hourly price
    #[serde(default)]
    pub price_per_hour: f64,
    /// Whether the spec is listed in the catalog
    #[serde(default = "default_true")]
    pub listed: bool,
    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: String::new(),
            gpu_model: None,
            gpu_count: 0,
            gpu_memory_gb: 0,
            cpu_cores: 0,
            memory_gb: 0,
            system_disk_gb: 0,
            data_disk_gb: 0,
            supports_memory_split: false,
            price_per_hour: 0.0,
            listed: true,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

impl WorkloadSpec {
    /// Whether the spec needs any GPU card
    pub fn requires_gpu(&self) -> bool {
        self.gpu_count > 0
    }
}

/// A container image that workloads can be provisioned from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadImage {
    /// Record identifier
    #[serde(default)]
    pub id: RecordId,
    /// Display name
    pub name: String,
    /// Image reference (e.g. "registry.local/pytorch:2.3-cuda12")
    pub address: String,
    /// Whether the image ships the GPU memory partition hooks
    #[serde(default)]
    pub supports_memory_split: bool,
    /// Whether the image is listed in the catalog
    #[serde(default = "default_true")]
    pub listed: bool,
    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Default for WorkloadImage {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            supports_memory_split: false,
            listed: true,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// A placed workload bound to one compute node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workload {
    /// Record identifier
    #[serde(default)]
    pub id: RecordId,
    /// Requested name
    #[serde(default)]
    pub name: Option<String>,
    /// Image the workload runs
    pub image_id: RecordId,
    /// Spec the workload was sized from
    pub spec_id: RecordId,
    /// Node hosting the workload
    pub node_id: RecordId,
    /// Owning principal
    #[serde(default)]
    pub owner_id: RecordId,
    /// Engine-side container id, set once provisioned
    #[serde(default)]
    pub container_id: Option<String>,
    /// Engine-side container name, set once provisioned
    #[serde(default)]
    pub container_name: Option<String>,
    /// Lifecycle status
    #[serde(default)]
    pub status: WorkloadStatus,
    /// Free-text note
    #[serde(default)]
    pub remark: String,
    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Workload {
    /// Engine container id, if one has been recorded
    pub fn unit_id(&self) -> Option<&str> {
        self.container_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Whether the workload still holds capacity on its node
    pub fn holds_capacity(&self) -> bool {
        self.deleted_at.is_none()
            && !matches!(self.status, WorkloadStatus::Failed | WorkloadStatus::Removed)
    }
}

/// Workload lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    /// Record created, provisioning in flight
    #[default]
    Creating,
    /// Unit created but never started
    Created,
    /// Unit running
    Running,
    /// Unit paused
    Paused,
    /// Unit restarting
    Restarting,
    /// Unit exited or was stopped
    Stopped,
    /// Unit being removed by the engine
    Removing,
    /// Unit dead
    Dead,
    /// Provisioning failed
    Failed,
    /// Workload deleted
    Removed,
    /// Live status could not be determined
    Unknown,
}

impl WorkloadStatus {
    /// Map a container engine state string onto a lifecycle status
    pub fn from_engine_state(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" => WorkloadStatus::Created,
            "running" => WorkloadStatus::Running,
            "paused" => WorkloadStatus::Paused,
            "restarting" => WorkloadStatus::Restarting,
            "exited" => WorkloadStatus::Stopped,
            "removing" => WorkloadStatus::Removing,
            "dead" => WorkloadStatus::Dead,
            _ => WorkloadStatus::Unknown,
        }
    }
}

impl std::fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkloadStatus::Creating => "creating",
            WorkloadStatus::Created => "created",
            WorkloadStatus::Running => "running",
            WorkloadStatus::Paused => "paused",
            WorkloadStatus::Restarting => "restarting",
            WorkloadStatus::Stopped => "stopped",
            WorkloadStatus::Removing => "removing",
            WorkloadStatus::Dead => "dead",
            WorkloadStatus::Failed => "failed",
            WorkloadStatus::Removed => "removed",
            WorkloadStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// The caller on whose behalf an operation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// User identifier
    pub user_id: RecordId,
    /// Administrators may act on any workload
    pub is_admin: bool,
}

impl Principal {
    /// Create a regular user principal
    pub fn user(user_id: RecordId) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    /// Create an administrator principal
    pub fn admin(user_id: RecordId) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }

    /// Whether this principal may mutate the given workload
    pub fn can_manage(&self, workload: &Workload) -> bool {
        self.is_admin || workload.owner_id == self.user_id
    }
}
