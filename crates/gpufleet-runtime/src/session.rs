//! Interactive shell sessions
//!
//! Bridges a caller-facing frame stream to a TTY exec inside a unit. Two
//! pumps run for the lifetime of a session: unit output to caller as binary
//! frames, caller input to unit as JSON control messages or raw keystrokes.
//! When one pump ends the other is cancelled, and both are joined before the
//! exec stream is dropped.

use futures::{Sink, SinkExt, Stream, StreamExt};
use gpufleet_core::FleetResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::traits::{ContainerEngine, ExecIo};

const OUTPUT_BUFFER: usize = 32 * 1024;

/// Preferred interactive shell
pub const BASH: &str = "/bin/bash";
/// Alternate interactive shell
pub const SH: &str = "/bin/sh";

/// A frame received from the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
    /// Caller closed the connection
    Close,
}

/// A frame sent to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Text frame (notices, pong)
    Text(String),
    /// Binary frame (shell output)
    Binary(Vec<u8>),
}

/// Control message carried in caller text frames
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// "input", "resize" or "ping"
    #[serde(rename = "type")]
    pub kind: String,
    /// Keystrokes for "input"
    #[serde(default)]
    pub data: String,
    /// Terminal width for "resize"
    #[serde(default)]
    pub cols: u16,
    /// Terminal height for "resize"
    #[serde(default)]
    pub rows: u16,
}

impl ControlMessage {
    /// Reply to a ping
    pub fn pong() -> Self {
        Self {
            kind: "pong".to_string(),
            ..Default::default()
        }
    }
}

/// Preferred and fallback shell for a requested shell name
pub fn shell_order(requested: Option<&str>) -> (&'static str, &'static str) {
    match requested {
        Some("sh") => (SH, BASH),
        _ => (BASH, SH),
    }
}

type SharedSink<K> = Arc<Mutex<K>>;

/// Runs interactive sessions against one engine
pub struct SessionProxy {
    engine: Arc<dyn ContainerEngine>,
}

impl SessionProxy {
    /// Create a proxy over an engine handle
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Run a session until either side closes
    pub async fn run<S, K>(
        &self,
        container_id: &str,
        shell: Option<&str>,
        incoming: S,
        outgoing: K,
    ) -> FleetResult<()>
    where
        S: Stream<Item = ClientFrame> + Unpin + Send,
        K: Sink<ServerFrame> + Unpin + Send,
        K::Error: std::fmt::Display,
    {
        let sink: SharedSink<K> = Arc::new(Mutex::new(outgoing));

        let exec_id = match self.create_exec(container_id, shell, &sink).await {
            Ok(id) => id,
            Err(e) => {
                send_text(&sink, format!("failed to create exec: {}\r\n", e)).await;
                return Err(e);
            }
        };

        let io = match self.engine.exec_attach(&exec_id).await {
            Ok(io) => io,
            Err(e) => {
                send_text(&sink, format!("failed to attach to exec: {}\r\n", e)).await;
                return Err(e);
            }
        };
        info!(container_id, exec_id = %exec_id, "Terminal session started");

        let (reader, writer) = tokio::io::split(io);
        let cancel = CancellationToken::new();

        let output = pump_output(reader, sink.clone(), cancel.clone());
        let input = self.pump_input(&exec_id, incoming, writer, sink.clone(), cancel.clone());
        tokio::join!(output, input);

        if let Err(e) = sink.lock().await.close().await {
            debug!(error = %e, "Closing caller stream failed");
        }
        info!(container_id, exec_id = %exec_id, "Terminal session ended");
        Ok(())
    }

    async fn create_exec<K>(
        &self,
        container_id: &str,
        shell: Option<&str>,
        sink: &SharedSink<K>,
    ) -> FleetResult<String>
    where
        K: Sink<ServerFrame> + Unpin + Send,
        K::Error: std::fmt::Display,
    {
        let (preferred, fallback) = shell_order(shell);
        match self.engine.exec_create(container_id, &[preferred]).await {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!(container_id, shell = preferred, error = %e, "Shell unavailable, trying fallback");
                let id = self.engine.exec_create(container_id, &[fallback]).await?;
                send_text(
                    sink,
                    format!(
                        "note: {} is not available in this container, switched to {}\r\n",
                        preferred, fallback
                    ),
                )
                .await;
                Ok(id)
            }
        }
    }

    async fn pump_input<S, K>(
        &self,
        exec_id: &str,
        mut incoming: S,
        mut writer: WriteHalf<ExecIo>,
        sink: SharedSink<K>,
        cancel: CancellationToken,
    ) where
        S: Stream<Item = ClientFrame> + Unpin + Send,
        K: Sink<ServerFrame> + Unpin + Send,
        K::Error: std::fmt::Display,
    {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = incoming.next() => frame,
            };
            let keystrokes = match frame {
                None | Some(ClientFrame::Close) => break,
                Some(ClientFrame::Binary(bytes)) => bytes,
                Some(ClientFrame::Text(text)) => {
                    match serde_json::from_str::<ControlMessage>(&text) {
                        Ok(message) => match message.kind.as_str() {
                            "input" => message.data.into_bytes(),
                            "resize" => {
                                if let Err(e) = self
                                    .engine
                                    .exec_resize(exec_id, message.rows, message.cols)
                                    .await
                                {
                                    warn!(exec_id, error = %e, "Terminal resize failed");
                                }
                                continue;
                            }
                            "ping" => {
                                if let Ok(pong) = serde_json::to_string(&ControlMessage::pong()) {
                                    send_text(&sink, pong).await;
                                }
                                continue;
                            }
                            other => {
                                debug!(kind = other, "Ignoring control message");
                                continue;
                            }
                        },
                        Err(_) => text.into_bytes(),
                    }
                }
            };
            if keystrokes.is_empty() {
                continue;
            }
            if let Err(e) = writer.write_all(&keystrokes).await {
                warn!(exec_id, error = %e, "Writing terminal input failed");
                break;
            }
        }
        cancel.cancel();
        let _ = writer.shutdown().await;
    }
}

async fn pump_output<K>(mut reader: ReadHalf<ExecIo>, sink: SharedSink<K>, cancel: CancellationToken)
where
    K: Sink<ServerFrame> + Unpin + Send,
    K::Error: std::fmt::Display,
{
    let mut buf = vec![0u8; OUTPUT_BUFFER];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Terminal output stream ended");
                break;
            }
        };
        if let Err(e) = sink
            .lock()
            .await
            .send(ServerFrame::Binary(buf[..n].to_vec()))
            .await
        {
            warn!(error = %e, "Sending terminal output failed");
            break;
        }
    }
    cancel.cancel();
}

async fn send_text<K>(sink: &SharedSink<K>, text: String)
where
    K: Sink<ServerFrame> + Unpin + Send,
    K::Error: std::fmt::Display,
{
    if let Err(e) = sink.lock().await.send(ServerFrame::Text(text)).await {
        debug!(error = %e, "Sending notice to caller failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeEngine;
    use crate::types::ContainerCreate;
    use futures::channel::mpsc;
    use std::time::Duration;

    struct Harness {
        engine: Arc<FakeEngine>,
        to_proxy: mpsc::UnboundedSender<ClientFrame>,
        from_proxy: mpsc::UnboundedReceiver<ServerFrame>,
        session: tokio::task::JoinHandle<FleetResult<()>>,
    }

    fn start(engine: Arc<FakeEngine>, shell: Option<&'static str>) -> Harness {
        let (to_proxy, incoming) = mpsc::unbounded();
        let (outgoing, from_proxy) = mpsc::unbounded();
        let proxy = SessionProxy::new(engine.clone());
        let session = tokio::spawn(async move { proxy.run("c1", shell, incoming, outgoing).await });
        Harness {
            engine,
            to_proxy,
            from_proxy,
            session,
        }
    }

    fn engine_with_container() -> Arc<FakeEngine> {
        let engine = Arc::new(FakeEngine::new("tcp://10.0.0.5:2376"));
        engine.add_container("c1", "w", ContainerCreate::default(), "running");
        engine
    }

    async fn peer(engine: &FakeEngine) -> tokio::io::DuplexStream {
        for _ in 0..100 {
            if let Some(peer) = engine.take_exec_peer() {
                return peer;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("exec was never attached");
    }

    #[test]
    fn test_shell_order() {
        assert_eq!(shell_order(Some("sh")), (SH, BASH));
        assert_eq!(shell_order(Some("bash")), (BASH, SH));
        assert_eq!(shell_order(None), (BASH, SH));
    }

    #[test]
    fn test_pong_format() {
        assert_eq!(
            serde_json::to_string(&ControlMessage::pong()).unwrap(),
            r#"{"type":"pong","data":"","cols":0,"rows":0}"#
        );
    }

    #[tokio::test]
    async fn test_pumps_both_directions() {
        let mut h = start(engine_with_container(), None);
        let mut unit = peer(&h.engine).await;

        unit.write_all(b"root@w:/# ").await.unwrap();
        assert_eq!(
            h.from_proxy.next().await,
            Some(ServerFrame::Binary(b"root@w:/# ".to_vec()))
        );

        h.to_proxy
            .unbounded_send(ClientFrame::Text(r#"{"type":"input","data":"ls\r"}"#.to_string()))
            .unwrap();
        h.to_proxy
            .unbounded_send(ClientFrame::Text("pwd\r".to_string()))
            .unwrap();
        let mut received = vec![0u8; 7];
        unit.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"ls\rpwd\r");

        h.to_proxy
            .unbounded_send(ClientFrame::Text(r#"{"type":"ping"}"#.to_string()))
            .unwrap();
        assert_eq!(
            h.from_proxy.next().await,
            Some(ServerFrame::Text(
                r#"{"type":"pong","data":"","cols":0,"rows":0}"#.to_string()
            ))
        );

        h.to_proxy
            .unbounded_send(ClientFrame::Text(
                r#"{"type":"resize","cols":120,"rows":40}"#.to_string(),
            ))
            .unwrap();
        h.to_proxy.unbounded_send(ClientFrame::Close).unwrap();
        h.session.await.unwrap().unwrap();
        assert!(h
            .engine
            .calls()
            .contains(&"exec_resize exec-bin-bash 40x120".to_string()));
    }

    #[tokio::test]
    async fn test_unit_exit_ends_session() {
        let mut h = start(engine_with_container(), Some("sh"));
        let unit = peer(&h.engine).await;
        drop(unit);

        tokio::time::timeout(Duration::from_secs(5), &mut h.session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(h.engine.calls().contains(&"exec_create /bin/sh".to_string()));
    }

    #[tokio::test]
    async fn test_shell_fallback_notice() {
        let engine = engine_with_container();
        engine.fail_always("exec_create:/bin/bash", 500, "no such file");
        let mut h = start(engine, None);

        match h.from_proxy.next().await {
            Some(ServerFrame::Text(notice)) => assert!(notice.contains("switched to /bin/sh")),
            other => panic!("unexpected frame: {:?}", other),
        }
        let _unit = peer(&h.engine).await;
        h.to_proxy.unbounded_send(ClientFrame::Close).unwrap();
        h.session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_no_shell_available() {
        let engine = engine_with_container();
        engine.fail_always("exec_create", 500, "no such file");
        let mut h = start(engine, None);

        match h.from_proxy.next().await {
            Some(ServerFrame::Text(message)) => assert!(message.starts_with("failed to create exec")),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(h.session.await.unwrap().is_err());
    }
}
