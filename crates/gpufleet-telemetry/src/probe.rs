//! GPU memory probes, tried in order until one answers

use async_trait::async_trait;
use gpufleet_runtime::{ContainerEngine, ContainerInspect};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::cli::run_command;
use crate::parse::{parse_gpu_memory_lines, GpuMemoryLines};

const QUERY: &str = "--query-gpu=memory.total,memory.used";
const FORMAT_NOUNITS: &str = "--format=csv,noheader,nounits";
const FORMAT_UNITS: &str = "--format=csv,noheader";

/// GPU memory visible to a unit
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpuMemory {
    /// Total memory in GB
    pub size_gb: f64,
    /// Used memory as a percentage of the total
    pub usage_rate: f64,
}

impl From<GpuMemoryLines> for GpuMemory {
    fn from(lines: GpuMemoryLines) -> Self {
        Self {
            size_gb: lines.total_mb / 1024.0,
            usage_rate: lines.used_mb / lines.total_mb * 100.0,
        }
    }
}

/// Unit being probed, with its inspect result fetched at most once
pub struct ProbeContext<'a> {
    /// Engine hosting the unit
    pub engine: &'a dyn ContainerEngine,
    /// Unit id
    pub unit_id: &'a str,
    inspect: OnceCell<Option<ContainerInspect>>,
}

impl<'a> ProbeContext<'a> {
    /// Create a context for one probe run
    pub fn new(engine: &'a dyn ContainerEngine, unit_id: &'a str) -> Self {
        Self {
            engine,
            unit_id,
            inspect: OnceCell::new(),
        }
    }

    /// The unit's inspect result, `None` when the engine could not provide it
    pub async fn inspect(&self) -> Option<&ContainerInspect> {
        self.inspect
            .get_or_init(|| async {
                match self.engine.inspect_container(self.unit_id).await {
                    Ok(inspect) => Some(inspect),
                    Err(e) => {
                        debug!(unit = %self.unit_id, error = %e, "Inspect failed while probing");
                        None
                    }
                }
            })
            .await
            .as_ref()
    }
}

/// One strategy for reading a unit's GPU memory
#[async_trait]
pub trait GpuProbe: Send + Sync {
    /// Probe name for logging
    fn name(&self) -> &str;

    /// Read GPU memory, `None` when this strategy has no answer
    async fn probe(&self, ctx: &ProbeContext<'_>) -> Option<GpuMemory>;
}

/// Runs the GPU query inside the unit
pub struct ContainerSmiProbe {
    name: &'static str,
    cmd: [&'static str; 3],
}

impl ContainerSmiProbe {
    /// Query with unit-less output
    pub fn nounits() -> Self {
        Self {
            name: "container-smi",
            cmd: ["nvidia-smi", QUERY, FORMAT_NOUNITS],
        }
    }

    /// Query allowing unit-suffixed output
    pub fn with_units() -> Self {
        Self {
            name: "container-smi-units",
            cmd: ["nvidia-smi", QUERY, FORMAT_UNITS],
        }
    }

    /// Query through the absolute binary path
    pub fn absolute_path() -> Self {
        Self {
            name: "container-smi-abs",
            cmd: ["/usr/bin/nvidia-smi", QUERY, FORMAT_NOUNITS],
        }
    }
}

#[async_trait]
impl GpuProbe for ContainerSmiProbe {
    fn name(&self) -> &str {
        self.name
    }

    async fn probe(&self, ctx: &ProbeContext<'_>) -> Option<GpuMemory> {
        match ctx.engine.exec_output(ctx.unit_id, &self.cmd).await {
            Ok(output) => parse_gpu_memory_lines(&output).map(GpuMemory::from),
            Err(e) => {
                debug!(probe = self.name, unit = %ctx.unit_id, error = %e, "GPU query failed");
                None
            }
        }
    }
}

/// Arguments for a host-side query scoped to the unit's visible devices.
///
/// `None` when the unit sees no devices.
pub fn host_query_args(visible: &str) -> Option<Vec<String>> {
    let visible = visible.trim();
    if visible.is_empty() || visible == "none" || visible == "void" {
        return None;
    }
    let mut args = Vec::with_capacity(4);
    if !visible.eq_ignore_ascii_case("all") {
        args.push("-i".to_string());
        args.push(visible.to_string());
    }
    args.push(QUERY.to_string());
    args.push(FORMAT_NOUNITS.to_string());
    Some(args)
}

/// Runs the GPU query on the control host, scoped to `NVIDIA_VISIBLE_DEVICES`.
///
/// Only meaningful when the control plane shares a host with the engine.
pub struct HostSmiProbe {
    binary: String,
    timeout: Duration,
}

impl HostSmiProbe {
    /// Create a probe running `binary`, bounded by `timeout` per attempt
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn query(&self, args: &[String]) -> Option<GpuMemory> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        match run_command(cmd, self.timeout).await {
            Ok(output) => parse_gpu_memory_lines(&output).map(GpuMemory::from),
            Err(e) => {
                debug!(binary = %self.binary, error = %e, "Host GPU query failed");
                None
            }
        }
    }
}

#[async_trait]
impl GpuProbe for HostSmiProbe {
    fn name(&self) -> &str {
        "host-smi"
    }

    async fn probe(&self, ctx: &ProbeContext<'_>) -> Option<GpuMemory> {
        let visible = ctx.inspect().await?.env_value("NVIDIA_VISIBLE_DEVICES")?;
        let args = host_query_args(visible)?;
        if let Some(memory) = self.query(&args).await {
            return Some(memory);
        }
        if args.len() > 2 {
            // scoped query failed; retry against every device
            return self.query(&args[2..]).await;
        }
        None
    }
}

/// Reports the configured partition ceiling with zero usage
pub struct MemoryLimitEnvProbe;

/// Parse a `CUDA_DEVICE_MEMORY_LIMIT` value such as `"20g"` into GB
pub fn parse_memory_limit(value: &str) -> Option<u64> {
    let value = value.trim();
    let value = value.strip_suffix('g').unwrap_or(value).trim();
    value.parse().ok().filter(|v| *v > 0)
}

#[async_trait]
impl GpuProbe for MemoryLimitEnvProbe {
    fn name(&self) -> &str {
        "memory-limit-env"
    }

    async fn probe(&self, ctx: &ProbeContext<'_>) -> Option<GpuMemory> {
        let limit = ctx
            .inspect()
            .await?
            .env_value("CUDA_DEVICE_MEMORY_LIMIT")
            .and_then(parse_memory_limit)?;
        Some(GpuMemory {
            size_gb: limit as f64,
            usage_rate: 0.0,
        })
    }
}

/// The default probe chain
pub fn default_probes(host_binary: &str, host_timeout: Duration) -> Vec<Box<dyn GpuProbe>> {
    vec![
        Box::new(ContainerSmiProbe::nounits()),
        Box::new(ContainerSmiProbe::with_units()),
        Box::new(ContainerSmiProbe::absolute_path()),
        Box::new(HostSmiProbe::new(host_binary, host_timeout)),
        Box::new(MemoryLimitEnvProbe),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpufleet_runtime::fake::FakeEngine;
    use gpufleet_runtime::ContainerCreate;

    fn engine_with_env(env: &[&str]) -> FakeEngine {
        let engine = FakeEngine::new("tcp://10.0.0.5:2376");
        let body = ContainerCreate {
            image: "cuda:12".to_string(),
            env: env.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        };
        engine.add_container("c1", "ws-1", body, "running");
        engine
    }

    #[tokio::test]
    async fn test_container_probe_parses_output() {
        let engine = engine_with_env(&[]);
        engine.set_exec_output(
            &["nvidia-smi", QUERY, FORMAT_UNITS],
            "40960 MiB, 10240 MiB\n",
        );
        let ctx = ProbeContext::new(&engine, "c1");

        assert!(ContainerSmiProbe::nounits().probe(&ctx).await.is_none());
        let memory = ContainerSmiProbe::with_units().probe(&ctx).await.unwrap();
        assert_eq!(memory.size_gb, 40.0);
        assert_eq!(memory.usage_rate, 25.0);
    }

    #[tokio::test]
    async fn test_inspect_fetched_once() {
        let engine = engine_with_env(&["CUDA_DEVICE_MEMORY_LIMIT=20g"]);
        let ctx = ProbeContext::new(&engine, "c1");

        let memory = MemoryLimitEnvProbe.probe(&ctx).await.unwrap();
        assert_eq!(memory, GpuMemory { size_gb: 20.0, usage_rate: 0.0 });
        assert!(MemoryLimitEnvProbe.probe(&ctx).await.is_some());

        let inspects = engine.calls().iter().filter(|c| c.starts_with("inspect")).count();
        assert_eq!(inspects, 1);
    }

    #[tokio::test]
    async fn test_host_probe_skips_units_without_devices() {
        let probe = HostSmiProbe::new("/nonexistent/nvidia-smi", Duration::from_secs(1));
        for env in [&[][..], &["NVIDIA_VISIBLE_DEVICES=void"][..]] {
            let engine = engine_with_env(env);
            let ctx = ProbeContext::new(&engine, "c1");
            assert!(probe.probe(&ctx).await.is_none());
        }

        let engine = engine_with_env(&["NVIDIA_VISIBLE_DEVICES=0,1"]);
        let ctx = ProbeContext::new(&engine, "c1");
        assert!(probe.probe(&ctx).await.is_none());
    }

    #[test]
    fn test_host_query_args() {
        assert_eq!(
            host_query_args("0,1").unwrap(),
            vec!["-i", "0,1", QUERY, FORMAT_NOUNITS]
        );
        assert_eq!(host_query_args("ALL").unwrap(), vec![QUERY, FORMAT_NOUNITS]);
        assert!(host_query_args("").is_none());
        assert!(host_query_args("none").is_none());
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("20g"), Some(20));
        assert_eq!(parse_memory_limit(" 8 "), Some(8));
        assert_eq!(parse_memory_limit("0g"), None);
        assert_eq!(parse_memory_limit("lots"), None);
    }

    #[test]
    fn test_default_chain_order() {
        let names: Vec<_> = default_probes("nvidia-smi", Duration::from_secs(1))
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(
            names,
            [
                "container-smi",
                "container-smi-units",
                "container-smi-abs",
                "host-smi",
                "memory-limit-env"
            ]
        );
    }
}
