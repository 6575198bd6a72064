//! Telemetry collection for a workload's execution unit

use gpufleet_core::{ComputeNode, FleetError, FleetResult, TelemetryConfig};
use gpufleet_runtime::{ContainerEngine, EngineConnector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::StatsCache;
use crate::cli::{DockerCliSampler, SnapshotSampler};
use crate::cpu::{cpu_percent, frame_cpus, normalize};
use crate::parse::cpuset_count;
use crate::probe::{default_probes, GpuMemory, GpuProbe, ProbeContext};

/// Live usage of one execution unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// CPU usage normalized to 0..=100 across the unit's CPUs
    pub cpu_usage_percent: f64,
    /// Cores in use times 100; may exceed 100
    pub cpu_usage_percent_raw: f64,
    /// Memory in use in bytes
    pub memory_usage: u64,
    /// Memory ceiling in bytes
    pub memory_limit: u64,
    /// Memory usage as a percentage of the ceiling
    pub memory_usage_percent: f64,
    /// Live processes
    pub pids: u64,
    /// GPU memory visible to the unit in GB
    pub gpu_memory_size_gb: f64,
    /// GPU memory usage percentage
    pub gpu_memory_usage_rate: f64,
}

/// Samples and caches unit telemetry
pub struct TelemetryCollector {
    connector: Arc<dyn EngineConnector>,
    cache: Arc<StatsCache>,
    sampler: Option<Arc<dyn SnapshotSampler>>,
    probes: Vec<Box<dyn GpuProbe>>,
    sample_window: Duration,
}

impl TelemetryCollector {
    /// Create a collector from configuration.
    ///
    /// `command_timeout` bounds each CLI invocation.
    pub fn new(
        connector: Arc<dyn EngineConnector>,
        config: &TelemetryConfig,
        command_timeout: Duration,
    ) -> Self {
        let sampler: Option<Arc<dyn SnapshotSampler>> = if config.cli_sampler_enabled {
            Some(Arc::new(DockerCliSampler::new(
                config.docker_binary.clone(),
                command_timeout,
            )))
        } else {
            None
        };
        Self {
            connector,
            cache: Arc::new(StatsCache::new(config.cache_ttl())),
            sampler,
            probes: default_probes(&config.gpu_query_binary, command_timeout),
            sample_window: config.sample_window(),
        }
    }

    /// Replace the snapshot sampler
    pub fn with_sampler(mut self, sampler: Option<Arc<dyn SnapshotSampler>>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Share an existing sample cache
    pub fn with_cache(mut self, cache: Arc<StatsCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the GPU probe chain
    pub fn with_probes(mut self, probes: Vec<Box<dyn GpuProbe>>) -> Self {
        self.probes = probes;
        self
    }

    /// The sample cache
    pub fn cache(&self) -> &StatsCache {
        &self.cache
    }

    /// Stats for a unit on a node, served from cache when fresh.
    ///
    /// Tries the CLI snapshot first, then two raw stats frames from the engine.
    pub async fn get_stats(
        &self,
        node: &ComputeNode,
        unit_id: &str,
    ) -> FleetResult<ContainerStats> {
        if unit_id.is_empty() {
            return Err(FleetError::InvalidRequest(
                "workload has no execution unit".to_string(),
            ));
        }
        let key = StatsCache::key(&node.engine_address, unit_id);
        if let Some(stats) = self.cache.get(&key) {
            debug!(key = %key, "Stats served from cache");
            return Ok(stats);
        }

        if let Some(sampler) = &self.sampler {
            match sampler.sample(node, unit_id).await {
                Ok(mut stats) => {
                    match self.connector.open(node).await {
                        Ok(engine) => {
                            let ctx = ProbeContext::new(engine.as_ref(), unit_id);
                            let cpus = inspect_cpus(&ctx).await;
                            if cpus > 0 {
                                stats.cpu_usage_percent =
                                    normalize(stats.cpu_usage_percent_raw, cpus);
                            }
                            let gpu = self.gpu_memory(&ctx).await;
                            stats.gpu_memory_size_gb = gpu.size_gb;
                            stats.gpu_memory_usage_rate = gpu.usage_rate;
                        }
                        Err(e) => debug!(node = %node.name, error = %e, "Skipping GPU probes"),
                    }
                    self.cache.insert(key, stats.clone());
                    return Ok(stats);
                }
                Err(e) => {
                    debug!(
                        node = %node.name,
                        unit = %unit_id,
                        error = %e,
                        "CLI sampling failed, reading raw stats"
                    );
                }
            }
        }

        let engine = self.connector.open(node).await?;
        let stats = self.sample_raw(engine.as_ref(), unit_id).await?;
        self.cache.insert(key, stats.clone());
        Ok(stats)
    }

    async fn sample_raw(
        &self,
        engine: &dyn ContainerEngine,
        unit_id: &str,
    ) -> FleetResult<ContainerStats> {
        let frames = engine.stats_frames(unit_id, 2, self.sample_window).await?;
        let Some(curr) = frames.last() else {
            return Err(FleetError::Internal(format!(
                "no stats received for {} within {}ms",
                unit_id,
                self.sample_window.as_millis()
            )));
        };

        let ctx = ProbeContext::new(engine, unit_id);
        let fallback_cpus = if frame_cpus(curr) == 0 {
            inspect_cpus(&ctx).await
        } else {
            0
        };
        let cpu = cpu_percent(&frames, fallback_cpus);

        let memory_usage = curr.memory_stats.usage.unwrap_or(0);
        let memory_limit = curr.memory_stats.limit.unwrap_or(0);
        let memory_usage_percent = if memory_limit > 0 {
            memory_usage as f64 / memory_limit as f64 * 100.0
        } else {
            0.0
        };

        let gpu = self.gpu_memory(&ctx).await;
        Ok(ContainerStats {
            cpu_usage_percent: cpu.normalized,
            cpu_usage_percent_raw: cpu.raw,
            memory_usage,
            memory_limit,
            memory_usage_percent,
            pids: curr.pids_stats.current.unwrap_or(0),
            gpu_memory_size_gb: gpu.size_gb,
            gpu_memory_usage_rate: gpu.usage_rate,
        })
    }

    /// Run the probe chain; the first answer wins, zero when none answers
    pub async fn gpu_memory(&self, ctx: &ProbeContext<'_>) -> GpuMemory {
        for probe in &self.probes {
            if let Some(memory) = probe.probe(ctx).await {
                debug!(probe = probe.name(), unit = %ctx.unit_id, "GPU memory probed");
                return memory;
            }
        }
        warn!(unit = %ctx.unit_id, "No GPU memory information available");
        GpuMemory::default()
    }
}

/// CPUs allotted to the unit according to its host config
async fn inspect_cpus(ctx: &ProbeContext<'_>) -> u32 {
    let Some(inspect) = ctx.inspect().await else {
        return 0;
    };
    let host = &inspect.host_config;
    match cpuset_count(&host.cpuset_cpus) {
        0 if host.nano_cpus > 0 => (host.nano_cpus as f64 / 1e9).ceil() as u32,
        n => n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gpufleet_runtime::fake::{FakeConnector, FakeEngine};
    use gpufleet_runtime::{
        ContainerCreate, CpuStats, CpuUsage, HostConfig, MemoryStats, PidsStats, StatsFrame,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SMI_NOUNITS: [&str; 3] = [
        "nvidia-smi",
        "--query-gpu=memory.total,memory.used",
        "--format=csv,noheader,nounits",
    ];

    struct ScriptedSampler {
        result: Option<ContainerStats>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotSampler for ScriptedSampler {
        async fn sample(&self, _node: &ComputeNode, _unit_id: &str) -> FleetResult<ContainerStats> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
                .clone()
                .ok_or_else(|| FleetError::Internal("docker not installed".to_string()))
        }
    }

    fn node() -> ComputeNode {
        ComputeNode {
            id: 1,
            name: "gpu-a".to_string(),
            engine_address: "tcp://10.0.0.5:2376".to_string(),
            ..Default::default()
        }
    }

    fn frame(read: &str, total: u64, online: Option<u32>) -> StatsFrame {
        StatsFrame {
            read: read.to_string(),
            cpu_stats: CpuStats {
                cpu_usage: CpuUsage {
                    total_usage: total,
                    percpu_usage: None,
                },
                system_cpu_usage: Some(0),
                online_cpus: online,
            },
            memory_stats: MemoryStats {
                usage: Some(2 * 1024 * 1024 * 1024),
                limit: Some(8 * 1024 * 1024 * 1024),
            },
            pids_stats: PidsStats { current: Some(9) },
            ..Default::default()
        }
    }

    fn setup(online: Option<u32>) -> (Arc<FakeConnector>, Arc<FakeEngine>) {
        let connector = Arc::new(FakeConnector::new());
        let engine = connector.engine("tcp://10.0.0.5:2376");
        let body = ContainerCreate {
            image: "cuda:12".to_string(),
            host_config: HostConfig {
                nano_cpus: 2_000_000_000,
                ..Default::default()
            },
            ..Default::default()
        };
        engine.add_container("c1", "ws-1", body, "running");
        engine.set_stats(vec![
            frame("2024-05-01T10:00:00Z", 0, online),
            frame("2024-05-01T10:00:01Z", 1_000_000_000, online),
        ]);
        (connector, engine)
    }

    fn collector(
        connector: Arc<FakeConnector>,
        sampler: Option<Arc<dyn SnapshotSampler>>,
    ) -> TelemetryCollector {
        let config = TelemetryConfig {
            cli_sampler_enabled: false,
            ..Default::default()
        };
        TelemetryCollector::new(connector, &config, Duration::from_secs(1)).with_sampler(sampler)
    }

    fn stats_calls(engine: &FakeEngine) -> usize {
        engine.calls().iter().filter(|c| c.starts_with("stats")).count()
    }

    #[tokio::test]
    async fn test_raw_stats_with_gpu_and_cache() {
        let (connector, engine) = setup(Some(4));
        engine.set_exec_output(&SMI_NOUNITS, "40960, 10240\n40960, 10240\n");
        let collector = collector(connector, None);

        let stats = collector.get_stats(&node(), "c1").await.unwrap();
        assert!((stats.cpu_usage_percent_raw - 100.0).abs() < 1e-9);
        assert!((stats.cpu_usage_percent - 25.0).abs() < 1e-9);
        assert_eq!(stats.memory_usage_percent, 25.0);
        assert_eq!(stats.pids, 9);
        assert_eq!(stats.gpu_memory_size_gb, 80.0);
        assert_eq!(stats.gpu_memory_usage_rate, 25.0);

        let again = collector.get_stats(&node(), "c1").await.unwrap();
        assert_eq!(again, stats);
        assert_eq!(stats_calls(&engine), 1);
    }

    #[tokio::test]
    async fn test_cpu_count_from_inspect() {
        let (connector, _engine) = setup(None);
        let collector = collector(connector, None);

        let stats = collector.get_stats(&node(), "c1").await.unwrap();
        assert!((stats.cpu_usage_percent - 50.0).abs() < 1e-9);
        assert_eq!(stats.gpu_memory_size_gb, 0.0);
    }

    #[tokio::test]
    async fn test_cli_sampler_preferred() {
        let (connector, engine) = setup(Some(4));
        engine.set_exec_output(&SMI_NOUNITS, "24576, 0");
        let sampler = Arc::new(ScriptedSampler {
            result: Some(ContainerStats {
                cpu_usage_percent: 100.0,
                cpu_usage_percent_raw: 150.0,
                pids: 3,
                ..Default::default()
            }),
            calls: AtomicUsize::new(0),
        });
        let collector = collector(connector, Some(sampler.clone()));

        let stats = collector.get_stats(&node(), "c1").await.unwrap();
        assert_eq!(stats.cpu_usage_percent_raw, 150.0);
        assert_eq!(stats.cpu_usage_percent, 75.0);
        assert_eq!(stats.pids, 3);
        assert_eq!(stats.gpu_memory_size_gb, 24.0);
        assert_eq!(stats_calls(&engine), 0);
        assert_eq!(sampler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cli_failure_falls_back_to_raw() {
        let (connector, engine) = setup(Some(4));
        let sampler = Arc::new(ScriptedSampler {
            result: None,
            calls: AtomicUsize::new(0),
        });
        let collector = collector(connector, Some(sampler));

        let stats = collector.get_stats(&node(), "c1").await.unwrap();
        assert_eq!(stats.pids, 9);
        assert_eq!(stats_calls(&engine), 1);
    }

    #[tokio::test]
    async fn test_partition_limit_when_queries_fail() {
        let connector = Arc::new(FakeConnector::new());
        let engine = connector.engine("tcp://10.0.0.5:2376");
        let body = ContainerCreate {
            image: "cuda:12".to_string(),
            env: vec!["CUDA_DEVICE_MEMORY_LIMIT=10g".to_string()],
            ..Default::default()
        };
        engine.add_container("c1", "ws-1", body, "running");
        engine.set_stats(vec![frame("2024-05-01T10:00:00Z", 0, Some(1))]);
        let collector = collector(connector, None);

        let stats = collector.get_stats(&node(), "c1").await.unwrap();
        assert_eq!(stats.gpu_memory_size_gb, 10.0);
        assert_eq!(stats.gpu_memory_usage_rate, 0.0);
    }

    #[tokio::test]
    async fn test_injected_cache_is_shared() {
        let (connector, engine) = setup(Some(4));
        let cache = Arc::new(StatsCache::new(Duration::from_secs(60)));
        let first = collector(connector.clone(), None).with_cache(cache.clone());
        let second = collector(connector, None).with_cache(cache.clone());

        let stats = first.get_stats(&node(), "c1").await.unwrap();
        assert_eq!(second.get_stats(&node(), "c1").await.unwrap(), stats);
        assert_eq!(stats_calls(&engine), 1);
        assert!(!cache.is_empty());
    }

    #[tokio::test]
    async fn test_no_frames_is_an_error() {
        let (connector, engine) = setup(Some(4));
        engine.set_stats(Vec::new());
        let collector = collector(connector, None);

        assert!(collector.get_stats(&node(), "c1").await.is_err());
        assert!(collector.cache().is_empty());
        assert!(matches!(
            collector.get_stats(&node(), "").await,
            Err(FleetError::InvalidRequest(_))
        ));
    }
}
