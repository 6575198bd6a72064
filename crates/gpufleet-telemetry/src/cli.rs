//! Stats snapshots through the engine's command-line client

use async_trait::async_trait;
use gpufleet_core::{ComputeNode, FleetError, FleetResult};
use gpufleet_runtime::connection::TlsMaterial;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::collector::ContainerStats;
use crate::parse::{parse_percent, parse_used_total};

/// Source of a single stats snapshot for a unit
#[async_trait]
pub trait SnapshotSampler: Send + Sync {
    /// Take one snapshot of the unit's CPU, memory and process usage
    async fn sample(&self, node: &ComputeNode, unit_id: &str) -> FleetResult<ContainerStats>;
}

/// Run a command to completion within `limit` and return its stdout
pub(crate) async fn run_command(mut cmd: Command, limit: Duration) -> FleetResult<String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(limit, cmd.output()).await {
        Ok(output) => output?,
        Err(_) => {
            return Err(FleetError::Internal(format!(
                "command timed out after {}s",
                limit.as_secs()
            )))
        }
    };
    if !output.status.success() {
        return Err(FleetError::Internal(format!(
            "command exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "MemPerc", default)]
    mem_perc: String,
    #[serde(rename = "PIDs", default)]
    pids: String,
}

/// Parse one `{{json .}}` line of `docker stats`.
///
/// The CLI's CPU percentage is cores times 100 and becomes the raw value. The
/// normalized value is only clamped here; the collector divides the raw value
/// by the unit's CPU count once it is known.
pub fn parse_stats_line(line: &str) -> FleetResult<ContainerStats> {
    let line: StatsLine = serde_json::from_str(line.trim())?;
    let cpu = parse_percent(&line.cpu_perc);
    let (memory_usage, memory_limit) = parse_used_total(&line.mem_usage);
    Ok(ContainerStats {
        cpu_usage_percent: cpu.clamp(0.0, 100.0),
        cpu_usage_percent_raw: cpu,
        memory_usage,
        memory_limit,
        memory_usage_percent: parse_percent(&line.mem_perc),
        pids: line.pids.trim().parse().unwrap_or(0),
        ..Default::default()
    })
}

/// `DOCKER_HOST` value for an engine address
pub fn docker_host(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("tcp://{}", address)
    }
}

/// Samples stats with `docker stats --no-stream` against the node's engine
pub struct DockerCliSampler {
    binary: String,
    timeout: Duration,
}

impl DockerCliSampler {
    /// Create a sampler running `binary`, bounded by `timeout`
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn write_certs(dir: &Path, tls: &TlsMaterial<'_>) -> FleetResult<()> {
        tokio::fs::write(dir.join("ca.pem"), tls.ca_cert).await?;
        tokio::fs::write(dir.join("cert.pem"), tls.client_cert).await?;
        tokio::fs::write(dir.join("key.pem"), tls.client_key).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotSampler for DockerCliSampler {
    async fn sample(&self, node: &ComputeNode, unit_id: &str) -> FleetResult<ContainerStats> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["stats", "--no-stream", "--format", "{{json .}}", unit_id]);
        if !node.engine_address.is_empty() {
            cmd.env("DOCKER_HOST", docker_host(&node.engine_address));
        }

        // the directory must outlive the command
        let _cert_dir = if node.use_tls {
            let tls = TlsMaterial::from_node(node)?;
            let dir = tempfile::Builder::new().prefix("docker-cert-").tempdir()?;
            Self::write_certs(dir.path(), &tls).await?;
            cmd.env("DOCKER_TLS_VERIFY", "1")
                .env("DOCKER_CERT_PATH", dir.path());
            Some(dir)
        } else {
            None
        };

        debug!(node = %node.name, unit = %unit_id, "Sampling stats through the engine CLI");
        let output = run_command(cmd, self.timeout).await?;
        let line = output
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| FleetError::Internal("docker stats printed nothing".to_string()))?;
        parse_stats_line(line)
    }
}
