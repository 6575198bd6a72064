//! Configuration types for gpufleet

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Remote engine configuration
    pub engine: EngineConfig,
    /// Telemetry configuration
    pub telemetry: TelemetryConfig,
    /// Reconciliation configuration
    pub reconcile: ReconcileConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Record store configuration
    pub store: StoreConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::FleetError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::FleetError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::FleetError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
    /// Enable CORS
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9090,
            cors_enabled: true,
        }
    }
}

/// Remote container engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-request HTTP timeout in seconds
    pub http_timeout_secs: u64,
    /// TCP/TLS connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Liveness probe timeout in seconds
    pub probe_timeout_secs: u64,
    /// Grace period for stop and restart in seconds
    pub stop_grace_secs: u64,
    /// Grace period for stop during teardown in seconds
    pub teardown_grace_secs: u64,
    /// Host directory holding the GPU partition library
    pub partition_library_host_dir: String,
    /// Mount point of the partition library inside the unit
    pub partition_library_unit_dir: String,
    /// Preloaded partition library file name
    pub partition_library_file: String,
    /// Mount point of the data volume inside the unit
    pub data_mount_path: String,
    /// Value of the `managed-by` label applied to units and volumes
    pub managed_by: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 30,
            connect_timeout_secs: 10,
            probe_timeout_secs: 10,
            stop_grace_secs: 30,
            teardown_grace_secs: 10,
            partition_library_host_dir: "/root/HAMi-core/build".to_string(),
            partition_library_unit_dir: "/libvgpu/build".to_string(),
            partition_library_file: "libvgpu.so".to_string(),
            data_mount_path: "/data".to_string(),
            managed_by: "gpufleet".to_string(),
        }
    }
}

impl EngineConfig {
    /// Per-request HTTP timeout
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Liveness probe timeout
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Stats cache time-to-live in seconds
    pub cache_ttl_secs: u64,
    /// Raw stats sampling window in milliseconds
    pub sample_window_ms: u64,
    /// Try the engine CLI snapshot before raw frames
    pub cli_sampler_enabled: bool,
    /// Engine CLI binary
    pub docker_binary: String,
    /// GPU query binary on the control host
    pub gpu_query_binary: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 20,
            sample_window_ms: 2000,
            cli_sampler_enabled: true,
            docker_binary: "docker".to_string(),
            gpu_query_binary: "nvidia-smi".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Cache time-to-live
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Raw sampling window
    pub fn sample_window(&self) -> Duration {
        Duration::from_millis(self.sample_window_ms)
    }
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Run the periodic loops
    pub enabled: bool,
    /// Node connectivity recheck interval in seconds
    pub node_interval_secs: u64,
    /// Workload status resync interval in seconds
    pub workload_interval_secs: u64,
    /// Delay between consecutive items in milliseconds
    pub pacing_ms: u64,
    /// Per-node probe timeout in seconds
    pub probe_timeout_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            node_interval_secs: 300,
            workload_interval_secs: 30,
            pacing_ms: 100,
            probe_timeout_secs: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Record store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// TOML file with initial nodes, specs, images and workloads
    pub seed_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.api.port, 9090);
        assert_eq!(config.engine.stop_grace_secs, 30);
        assert_eq!(config.engine.teardown_grace_secs, 10);
        assert_eq!(config.telemetry.cache_ttl(), Duration::from_secs(20));
        assert_eq!(config.telemetry.sample_window(), Duration::from_secs(2));
        assert_eq!(config.reconcile.node_interval_secs, 300);
        assert_eq!(config.reconcile.workload_interval_secs, 30);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
[api]
port = 8088

[engine]
http_timeout_secs = 5
"#,
        )
        .unwrap();
        assert_eq!(config.api.port, 8088);
        assert_eq!(config.api.address, "0.0.0.0");
        assert_eq!(config.engine.http_timeout(), Duration::from_secs(5));
        assert_eq!(config.engine.managed_by, "gpufleet");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpufleetd.toml");
        std::fs::write(&path, "[store]\nseed_file = \"/etc/gpufleet/seed.toml\"\n").unwrap();

        let config = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(
            config.store.seed_file,
            Some(PathBuf::from("/etc/gpufleet/seed.toml"))
        );
    }

    #[test]
    fn test_from_missing_file() {
        let err = DaemonConfig::from_file(std::path::Path::new("/nonexistent/gpufleetd.toml"))
            .unwrap_err();
        assert!(matches!(err, crate::FleetError::Config(_)));
    }
}
