//! Container lifecycle driver
//!
//! Translates a workload spec, image and node into engine calls: provision,
//! lifecycle passthroughs, status, logs and teardown of a unit together with
//! its named volumes.

use gpufleet_core::{
    ComputeNode, EngineConfig, FleetError, FleetResult, RecordId, WorkloadImage, WorkloadSpec,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::traits::{ContainerEngine, EngineConnector};
use crate::types::{ContainerCreate, DeviceRequest, HostConfig, MountSpec, VolumeCreate};

const GIB: i64 = 1024 * 1024 * 1024;

/// Build a unit name: sanitized base, record id and a unix timestamp
pub fn container_name(requested: Option<&str>, id: RecordId, unix_secs: i64) -> String {
    let base = requested
        .filter(|n| !n.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("instance-{}", id));

    let mut clean = String::with_capacity(base.len());
    for c in base.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' };
        if c == '-' && clean.ends_with('-') {
            continue;
        }
        clean.push(c);
    }
    let clean = clean.trim_matches('-');
    let clean = if clean.is_empty() { "instance" } else { clean };
    format!("{}-{}-{}", clean, id, unix_secs)
}

/// Name of the data volume attached to a unit
pub fn data_volume_name(container_name: &str) -> String {
    format!("{}-data", container_name)
}

/// Engine calls derived for one provision
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionPlan {
    /// Unit name
    pub container_name: String,
    /// Data volume to create first
    pub volume: Option<VolumeCreate>,
    /// Container create body
    pub body: ContainerCreate,
}

/// A unit that was created and started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedUnit {
    /// Engine container id
    pub container_id: String,
    /// Engine container name
    pub container_name: String,
}

/// Drives units on remote engines
pub struct ContainerDriver {
    connector: Arc<dyn EngineConnector>,
    config: EngineConfig,
}

impl ContainerDriver {
    /// Create a driver
    pub fn new(connector: Arc<dyn EngineConnector>, config: EngineConfig) -> Self {
        Self { connector, config }
    }

    /// Engine settings in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open the node's engine
    pub async fn engine(&self, node: &ComputeNode) -> FleetResult<Arc<dyn ContainerEngine>> {
        self.connector.open(node).await
    }

    /// Translate spec, image and node into engine calls
    pub fn build_plan(
        &self,
        node: &ComputeNode,
        spec: &WorkloadSpec,
        image: &WorkloadImage,
        container_name: &str,
    ) -> ProvisionPlan {
        let labels: BTreeMap<String, String> = [
            ("managed-by".to_string(), self.config.managed_by.clone()),
            ("instance".to_string(), container_name.to_string()),
        ]
        .into_iter()
        .collect();

        let mut host = HostConfig {
            nano_cpus: spec.cpu_cores as i64 * 1_000_000_000,
            memory: spec.memory_gb as i64 * GIB,
            ..Default::default()
        };
        let mut env = Vec::new();

        let volume = (spec.data_disk_gb > 0).then(|| {
            let name = data_volume_name(container_name);
            host.mounts
                .push(MountSpec::volume(&name, &self.config.data_mount_path));
            VolumeCreate {
                name,
                labels: labels.clone(),
            }
        });

        let per_card = node.gpu_memory_per_card_gb;
        if image.supports_memory_split
            && spec.supports_memory_split
            && spec.gpu_memory_gb > 0
            && per_card > 0
        {
            let host_dir = node
                .partition_library_dir
                .as_deref()
                .filter(|d| !d.is_empty())
                .unwrap_or(self.config.partition_library_host_dir.as_str());
            let unit_dir = &self.config.partition_library_unit_dir;
            host.mounts.push(MountSpec::bind(host_dir, unit_dir));

            let slice = spec.gpu_memory_gb / spec.gpu_count.max(1);
            let share = (slice * 100 / per_card).clamp(1, 100);
            env.push(format!(
                "LD_PRELOAD={}/{}",
                unit_dir.trim_end_matches('/'),
                self.config.partition_library_file
            ));
            env.push(format!("CUDA_DEVICE_MEMORY_LIMIT={}g", slice));
            env.push(format!("CUDA_DEVICE_SM_LIMIT={}", share));
            debug!(
                container = container_name,
                slice_gb = slice,
                per_card_gb = per_card,
                sm_limit = share,
                "Applying GPU memory partition"
            );
        }

        if spec.gpu_count > 0 {
            host.device_requests.push(DeviceRequest::gpus(spec.gpu_count));
        }

        if spec.system_disk_gb > 0 {
            host.storage_opt = Some(
                [(
                    "overlay2.size".to_string(),
                    format!("{}G", spec.system_disk_gb),
                )]
                .into_iter()
                .collect(),
            );
        }

        ProvisionPlan {
            container_name: container_name.to_string(),
            volume,
            body: ContainerCreate {
                image: image.address.clone(),
                env,
                labels,
                host_config: host,
            },
        }
    }

    /// Create and start a unit; a unit that fails to start is removed
    pub async fn provision(
        &self,
        node: &ComputeNode,
        spec: &WorkloadSpec,
        image: &WorkloadImage,
        container_name: &str,
    ) -> FleetResult<ProvisionedUnit> {
        let engine = self.engine(node).await?;
        let mut plan = self.build_plan(node, spec, image, container_name);

        if let Some(volume) = &plan.volume {
            if let Err(e) = engine.create_volume(volume).await {
                warn!(volume = %volume.name, error = %e, "Failed to create data volume, mounting anyway");
            }
        }

        let created = match engine.create_container(container_name, &plan.body).await {
            Ok(id) => Ok(id),
            Err(e) if plan.body.host_config.storage_opt.is_some() => {
                warn!(
                    container = container_name,
                    error = %e,
                    "Create with root filesystem quota failed, retrying without it"
                );
                plan.body.host_config.storage_opt = None;
                engine.create_container(container_name, &plan.body).await
            }
            Err(e) => Err(e),
        };
        let container_id = created
            .map_err(|e| FleetError::ProvisionFailure(format!("create container: {}", e)))?;

        if let Err(e) = engine.start_container(&container_id).await {
            if let Err(cleanup) = engine.remove_container(&container_id, true, false).await {
                warn!(container_id = %container_id, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(FleetError::ProvisionFailure(format!("start container: {}", e)));
        }

        info!(
            node_id = node.id,
            container_id = %container_id,
            container = container_name,
            "Container started"
        );
        Ok(ProvisionedUnit {
            container_id,
            container_name: container_name.to_string(),
        })
    }

    /// Remove a unit and its named volumes.
    ///
    /// Only failing to reach the engine is an error; every engine-side step
    /// failure is logged and the remaining steps still run.
    pub async fn teardown(
        &self,
        node: &ComputeNode,
        container_id: &str,
        container_name: Option<&str>,
    ) -> FleetResult<()> {
        let engine = self.engine(node).await?;

        let volumes = match engine.inspect_container(container_id).await {
            Ok(inspect) => inspect.named_volumes(),
            Err(e) => {
                warn!(container_id, error = %e, "Inspect failed, deriving volume name");
                container_name
                    .filter(|n| !n.is_empty())
                    .map(|n| vec![data_volume_name(n)])
                    .unwrap_or_default()
            }
        };

        let grace = Duration::from_secs(self.config.teardown_grace_secs);
        if let Err(e) = engine.stop_container(container_id, grace).await {
            debug!(container_id, error = %e, "Stop before removal failed");
        }
        if let Err(e) = engine.remove_container(container_id, true, true).await {
            warn!(container_id, error = %e, "Failed to remove container");
        }
        for volume in volumes {
            match engine.remove_volume(&volume).await {
                Ok(()) => info!(volume = %volume, "Removed volume"),
                Err(e) => warn!(volume = %volume, error = %e, "Failed to remove volume"),
            }
        }
        Ok(())
    }

    /// Start a unit
    pub async fn start(&self, node: &ComputeNode, container_id: &str) -> FleetResult<()> {
        self.engine(node).await?.start_container(container_id).await
    }

    /// Stop a unit with the configured grace period
    pub async fn stop(&self, node: &ComputeNode, container_id: &str) -> FleetResult<()> {
        self.engine(node)
            .await?
            .stop_container(container_id, Duration::from_secs(self.config.stop_grace_secs))
            .await
    }

    /// Restart a unit with the configured grace period
    pub async fn restart(&self, node: &ComputeNode, container_id: &str) -> FleetResult<()> {
        self.engine(node)
            .await?
            .restart_container(container_id, Duration::from_secs(self.config.stop_grace_secs))
            .await
    }

    /// Live engine state string of a unit
    pub async fn status(&self, node: &ComputeNode, container_id: &str) -> FleetResult<String> {
        let inspect = self.engine(node).await?.inspect_container(container_id).await?;
        Ok(inspect.state.status)
    }

    /// Recent log output of a unit
    pub async fn logs(
        &self,
        node: &ComputeNode,
        container_id: &str,
        tail: Option<u64>,
    ) -> FleetResult<String> {
        self.engine(node)
            .await?
            .container_logs(container_id, tail)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeConnector;

    fn node() -> ComputeNode {
        ComputeNode {
            id: 1,
            name: "gpu-a".to_string(),
            engine_address: "tcp://10.0.0.5:2376".to_string(),
            gpu_count: 2,
            gpu_memory_per_card_gb: 40,
            ..Default::default()
        }
    }

    fn spec() -> WorkloadSpec {
        WorkloadSpec {
            name: "a100".to_string(),
            cpu_cores: 4,
            memory_gb: 16,
            system_disk_gb: 50,
            data_disk_gb: 100,
            gpu_count: 1,
            gpu_memory_gb: 40,
            ..Default::default()
        }
    }

    fn image(split: bool) -> WorkloadImage {
        WorkloadImage {
            name: "pytorch".to_string(),
            address: "registry.local/pytorch:2.3".to_string(),
            supports_memory_split: split,
            ..Default::default()
        }
    }

    fn driver(connector: Arc<FakeConnector>) -> ContainerDriver {
        ContainerDriver::new(connector, EngineConfig::default())
    }

    #[test]
    fn test_container_name() {
        assert_eq!(container_name(Some("My Trainer!"), 7, 1700000000), "My-Trainer-7-1700000000");
        assert_eq!(container_name(Some("--a__b--"), 7, 1), "a-b-7-1");
        assert_eq!(container_name(None, 7, 1), "instance-7-7-1");
        assert_eq!(container_name(Some("***"), 3, 1), "instance-3-1");
        assert_eq!(container_name(Some("  "), 3, 1), "instance-3-3-1");
    }

    #[test]
    fn test_plan_resources() {
        let driver = driver(Arc::new(FakeConnector::new()));
        let plan = driver.build_plan(&node(), &spec(), &image(false), "w-1-1");
        let host = &plan.body.host_config;

        assert_eq!(host.nano_cpus, 4_000_000_000);
        assert_eq!(host.memory, 16 * GIB);
        assert_eq!(host.mounts, vec![MountSpec::volume("w-1-1-data", "/data")]);
        assert_eq!(host.device_requests, vec![DeviceRequest::gpus(1)]);
        assert_eq!(
            host.storage_opt.as_ref().and_then(|o| o.get("overlay2.size")),
            Some(&"50G".to_string())
        );
        assert!(plan.body.env.is_empty());
        assert_eq!(plan.body.labels.get("instance"), Some(&"w-1-1".to_string()));
        assert_eq!(plan.volume.as_ref().map(|v| v.name.as_str()), Some("w-1-1-data"));
    }

    #[test]
    fn test_plan_partition_hints() {
        let driver = driver(Arc::new(FakeConnector::new()));
        let split_spec = WorkloadSpec {
            gpu_count: 2,
            gpu_memory_gb: 20,
            supports_memory_split: true,
            data_disk_gb: 0,
            ..spec()
        };

        let plan = driver.build_plan(&node(), &split_spec, &image(true), "w");
        assert_eq!(
            plan.body.env_value("LD_PRELOAD"),
            Some("/libvgpu/build/libvgpu.so")
        );
        assert_eq!(plan.body.env_value("CUDA_DEVICE_MEMORY_LIMIT"), Some("10g"));
        assert_eq!(plan.body.env_value("CUDA_DEVICE_SM_LIMIT"), Some("25"));
        assert_eq!(
            plan.body.host_config.mounts,
            vec![MountSpec::bind("/root/HAMi-core/build", "/libvgpu/build")]
        );
        assert!(plan.volume.is_none());

        // image without partition support gets whole cards, no hints
        let plan = driver.build_plan(&node(), &split_spec, &image(false), "w");
        assert!(plan.body.env_value("LD_PRELOAD").is_none());

        // node override of the library directory
        let custom = ComputeNode {
            partition_library_dir: Some("/opt/hami".to_string()),
            ..node()
        };
        let plan = driver.build_plan(&custom, &split_spec, &image(true), "w");
        assert_eq!(plan.body.host_config.mounts[0].source, "/opt/hami");
    }

    #[test]
    fn test_sm_limit_clamped() {
        let driver = driver(Arc::new(FakeConnector::new()));
        let tiny = WorkloadSpec {
            gpu_count: 1,
            gpu_memory_gb: 1,
            supports_memory_split: true,
            ..spec()
        };
        let big_card = ComputeNode {
            gpu_memory_per_card_gb: 400,
            ..node()
        };
        let plan = driver.build_plan(&big_card, &tiny, &image(true), "w");
        assert_eq!(plan.body.env_value("CUDA_DEVICE_SM_LIMIT"), Some("1"));
    }

    #[tokio::test]
    async fn test_provision_success() {
        let connector = Arc::new(FakeConnector::new());
        let engine = connector.engine("tcp://10.0.0.5:2376");
        let driver = driver(connector.clone());

        let unit = driver
            .provision(&node(), &spec(), &image(false), "w-1-1")
            .await
            .unwrap();
        assert_eq!(unit.container_name, "w-1-1");
        assert_eq!(engine.container(&unit.container_id).unwrap().status, "running");
        assert_eq!(engine.volumes(), vec!["w-1-1-data"]);
    }

    #[tokio::test]
    async fn test_provision_retries_without_quota() {
        let connector = Arc::new(FakeConnector::new());
        let engine = connector.engine("tcp://10.0.0.5:2376");
        engine.fail_once("create_container", 500, "storage-opt is supported only for overlay over xfs");
        let driver = driver(connector.clone());

        let unit = driver
            .provision(&node(), &spec(), &image(false), "w")
            .await
            .unwrap();
        let created = engine.container(&unit.container_id).unwrap();
        assert!(created.body.host_config.storage_opt.is_none());
        let creates = engine
            .calls()
            .iter()
            .filter(|c| c.starts_with("create_container"))
            .count();
        assert_eq!(creates, 2);
    }

    #[tokio::test]
    async fn test_provision_volume_failure_is_absorbed() {
        let connector = Arc::new(FakeConnector::new());
        let engine = connector.engine("tcp://10.0.0.5:2376");
        engine.fail_once("create_volume", 500, "disk full");

        let unit = driver(connector.clone())
            .provision(&node(), &spec(), &image(false), "w")
            .await
            .unwrap();
        let created = engine.container(&unit.container_id).unwrap();
        assert_eq!(created.body.host_config.mounts[0].source, "w-data");
    }

    #[tokio::test]
    async fn test_provision_start_failure_removes_unit() {
        let connector = Arc::new(FakeConnector::new());
        let engine = connector.engine("tcp://10.0.0.5:2376");
        engine.fail_once("start", 500, "could not select device driver");

        let err = driver(connector.clone())
            .provision(&node(), &spec(), &image(false), "w")
            .await
            .unwrap_err();
        match err {
            FleetError::ProvisionFailure(message) => {
                assert!(message.starts_with("start container:"));
                assert!(message.contains("could not select device driver"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(engine.container_count(), 0);
    }

    #[tokio::test]
    async fn test_provision_create_failure() {
        let connector = Arc::new(FakeConnector::new());
        let engine = connector.engine("tcp://10.0.0.5:2376");
        engine.fail_always("create_container", 404, "No such image");

        let err = driver(connector.clone())
            .provision(&node(), &spec(), &image(false), "w")
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::ProvisionFailure(ref m) if m.starts_with("create container:")));
    }

    #[tokio::test]
    async fn test_teardown_removes_volumes() {
        let connector = Arc::new(FakeConnector::new());
        let engine = connector.engine("tcp://10.0.0.5:2376");
        let driver = driver(connector.clone());
        let unit = driver
            .provision(&node(), &spec(), &image(false), "w-1-1")
            .await
            .unwrap();

        driver
            .teardown(&node(), &unit.container_id, Some("w-1-1"))
            .await
            .unwrap();
        assert_eq!(engine.container_count(), 0);
        assert!(engine.volumes().is_empty());
        let calls = engine.calls();
        assert!(calls.contains(&format!("stop {} 10", unit.container_id)));
        assert!(calls.contains(&format!("remove {} force=true v=true", unit.container_id)));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let connector = Arc::new(FakeConnector::new());
        let engine = connector.engine("tcp://10.0.0.5:2376");
        let driver = driver(connector.clone());
        let unit = driver
            .provision(&node(), &spec(), &image(false), "w-1-1")
            .await
            .unwrap();

        driver
            .teardown(&node(), &unit.container_id, Some("w-1-1"))
            .await
            .unwrap();
        driver
            .teardown(&node(), &unit.container_id, Some("w-1-1"))
            .await
            .unwrap();

        // second pass fell back to the derived volume name
        let volume_removals = engine
            .calls()
            .iter()
            .filter(|c| *c == "remove_volume w-1-1-data")
            .count();
        assert_eq!(volume_removals, 2);
    }

    #[tokio::test]
    async fn test_teardown_cleans_volumes_when_remove_fails() {
        let connector = Arc::new(FakeConnector::new());
        let engine = connector.engine("tcp://10.0.0.5:2376");
        let driver = driver(connector.clone());
        let unit = driver
            .provision(&node(), &spec(), &image(false), "w")
            .await
            .unwrap();
        engine.fail_always("remove", 500, "device busy");

        driver
            .teardown(&node(), &unit.container_id, Some("w"))
            .await
            .unwrap();
        assert!(engine.volumes().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_passthrough() {
        let connector = Arc::new(FakeConnector::new());
        let engine = connector.engine("tcp://10.0.0.5:2376");
        let driver = driver(connector.clone());
        let unit = driver
            .provision(&node(), &spec(), &image(false), "w")
            .await
            .unwrap();

        driver.stop(&node(), &unit.container_id).await.unwrap();
        assert_eq!(driver.status(&node(), &unit.container_id).await.unwrap(), "exited");
        driver.restart(&node(), &unit.container_id).await.unwrap();
        assert_eq!(driver.status(&node(), &unit.container_id).await.unwrap(), "running");
        assert!(engine
            .calls()
            .contains(&format!("stop {} 30", unit.container_id)));

        assert!(driver.status(&node(), "missing").await.unwrap_err().is_engine_not_found());
    }
}
