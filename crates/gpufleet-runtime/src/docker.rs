//! Docker Engine remote API over HTTP(S)

use async_trait::async_trait;
use futures::StreamExt;
use gpufleet_core::{FleetError, FleetResult};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::stream::demultiplex_lossy;
use crate::traits::{ContainerEngine, ExecIo};
use crate::types::{
    ContainerCreate, ContainerInspect, ExecCreate, ExecStart, IdResponse, StatsFrame,
    VolumeCreate,
};

#[derive(Deserialize)]
struct EngineMessage {
    message: String,
}

/// Handle to one node's Docker Engine
pub struct DockerEngine {
    address: String,
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl DockerEngine {
    /// Create a handle over a prepared client
    pub fn new(
        address: impl Into<String>,
        base_url: impl Into<String>,
        client: Client,
        timeout: Duration,
    ) -> Self {
        Self {
            address: address.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> FleetResult<Response> {
        let response = request.send().await.map_err(map_transport_error)?;
        check_status(response).await
    }

    async fn send_timed(&self, request: RequestBuilder) -> FleetResult<Response> {
        self.send(request.timeout(self.timeout)).await
    }

    async fn lifecycle(&self, id: &str, action: &str, grace: Option<Duration>) -> FleetResult<()> {
        let mut request = self
            .client
            .post(self.url(&format!("/containers/{}/{}", id, action)));
        let mut timeout = self.timeout;
        if let Some(grace) = grace {
            request = request.query(&[("t", grace.as_secs())]);
            timeout += grace;
        }
        match self.send(request.timeout(timeout)).await {
            Ok(_) => Ok(()),
            // 304: already in the requested state
            Err(FleetError::Engine { status: 304, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> FleetError {
    if err.is_timeout() {
        FleetError::Connection(format!("engine request timed out: {}", err))
    } else if err.is_connect() {
        FleetError::Connection(format!("engine unreachable: {}", err))
    } else {
        FleetError::Connection(err.to_string())
    }
}

async fn check_status(response: Response) -> FleetResult<Response> {
    let status = response.status();
    if status.is_success() || status == StatusCode::SWITCHING_PROTOCOLS {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<EngineMessage>(&body)
        .map(|m| m.message)
        .unwrap_or_else(|_| body.trim().to_string());
    Err(FleetError::Engine {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn endpoint(&self) -> &str {
        &self.address
    }

    async fn ping(&self) -> FleetResult<()> {
        self.send_timed(self.client.get(self.url("/_ping"))).await?;
        Ok(())
    }

    async fn create_volume(&self, volume: &VolumeCreate) -> FleetResult<()> {
        self.send_timed(self.client.post(self.url("/volumes/create")).json(volume))
            .await?;
        debug!(volume = %volume.name, "Created volume");
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> FleetResult<()> {
        self.send_timed(
            self.client
                .delete(self.url(&format!("/volumes/{}", name)))
                .query(&[("force", "true")]),
        )
        .await?;
        Ok(())
    }

    async fn create_container(&self, name: &str, body: &ContainerCreate) -> FleetResult<String> {
        let response = self
            .send_timed(
                self.client
                    .post(self.url("/containers/create"))
                    .query(&[("name", name)])
                    .json(body),
            )
            .await?;
        let created: IdResponse = response.json().await.map_err(map_transport_error)?;
        for warning in created.warnings.iter().flatten() {
            warn!(container = name, warning = %warning, "Engine warning on create");
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> FleetResult<()> {
        self.lifecycle(id, "start", None).await
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> FleetResult<()> {
        self.lifecycle(id, "stop", Some(grace)).await
    }

    async fn restart_container(&self, id: &str, grace: Duration) -> FleetResult<()> {
        self.lifecycle(id, "restart", Some(grace)).await
    }

    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> FleetResult<()> {
        self.send_timed(
            self.client
                .delete(self.url(&format!("/containers/{}", id)))
                .query(&[("force", force), ("v", volumes)]),
        )
        .await?;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> FleetResult<ContainerInspect> {
        let response = self
            .send_timed(self.client.get(self.url(&format!("/containers/{}/json", id))))
            .await?;
        response.json().await.map_err(map_transport_error)
    }

    async fn container_logs(&self, id: &str, tail: Option<u64>) -> FleetResult<String> {
        let tail = tail.map_or_else(|| "all".to_string(), |n| n.to_string());
        let response = self
            .send_timed(
                self.client
                    .get(self.url(&format!("/containers/{}/logs", id)))
                    .query(&[
                        ("stdout", "true"),
                        ("stderr", "true"),
                        ("timestamps", "true"),
                        ("tail", tail.as_str()),
                    ]),
            )
            .await?;
        let bytes = response.bytes().await.map_err(map_transport_error)?;
        Ok(demultiplex_lossy(&bytes))
    }

    async fn stats_frames(
        &self,
        id: &str,
        max: usize,
        window: Duration,
    ) -> FleetResult<Vec<StatsFrame>> {
        let deadline = Instant::now() + window;
        let request = self
            .client
            .get(self.url(&format!("/containers/{}/stats", id)))
            .query(&[("stream", "true")]);
        let response = tokio::time::timeout_at(deadline, self.send(request))
            .await
            .map_err(|_| FleetError::Connection("stats stream did not open in time".to_string()))??;

        let mut frames = Vec::new();
        let mut buffer: Vec<u8> = Vec::new();
        let mut body = response.bytes_stream();
        while frames.len() < max {
            let chunk = match tokio::time::timeout_at(deadline, body.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    debug!(container_id = id, error = %e, "Stats stream failed");
                    break;
                }
                Ok(None) | Err(_) => break,
            };
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<StatsFrame>(&line) {
                    Ok(frame) => frames.push(frame),
                    Err(e) => debug!(container_id = id, error = %e, "Skipping stats frame"),
                }
                if frames.len() >= max {
                    break;
                }
            }
        }
        Ok(frames)
    }

    async fn exec_output(&self, id: &str, cmd: &[&str]) -> FleetResult<String> {
        let create = ExecCreate {
            attach_stdin: false,
            attach_stdout: true,
            attach_stderr: true,
            tty: false,
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
        };
        let response = self
            .send_timed(
                self.client
                    .post(self.url(&format!("/containers/{}/exec", id)))
                    .json(&create),
            )
            .await?;
        let exec: IdResponse = response.json().await.map_err(map_transport_error)?;

        let response = self
            .send_timed(
                self.client
                    .post(self.url(&format!("/exec/{}/start", exec.id)))
                    .json(&ExecStart {
                        detach: false,
                        tty: false,
                    }),
            )
            .await?;
        let bytes = response.bytes().await.map_err(map_transport_error)?;
        Ok(demultiplex_lossy(&bytes))
    }

    async fn exec_create(&self, id: &str, cmd: &[&str]) -> FleetResult<String> {
        let create = ExecCreate {
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            tty: true,
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
        };
        let response = self
            .send_timed(
                self.client
                    .post(self.url(&format!("/containers/{}/exec", id)))
                    .json(&create),
            )
            .await?;
        let exec: IdResponse = response.json().await.map_err(map_transport_error)?;
        Ok(exec.id)
    }

    async fn exec_attach(&self, exec_id: &str) -> FleetResult<ExecIo> {
        let request = self
            .client
            .post(self.url(&format!("/exec/{}/start", exec_id)))
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp")
            .json(&ExecStart {
                detach: false,
                tty: true,
            });
        let response = tokio::time::timeout(self.timeout, self.send(request))
            .await
            .map_err(|_| FleetError::Connection("exec attach timed out".to_string()))??;
        let upgraded = response.upgrade().await.map_err(|e| {
            FleetError::Connection(format!("exec attach upgrade failed: {}", e))
        })?;
        Ok(Box::new(upgraded))
    }

    async fn exec_resize(&self, exec_id: &str, rows: u16, cols: u16) -> FleetResult<()> {
        self.send_timed(
            self.client
                .post(self.url(&format!("/exec/{}/resize", exec_id)))
                .query(&[("h", rows), ("w", cols)]),
        )
        .await?;
        Ok(())
    }
}
