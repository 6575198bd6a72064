//! WebSocket terminal endpoint
//!
//! Adapts an upgraded socket to the session proxy's frame types. Ownership
//! and unit lookup happen before the upgrade so failures surface as HTTP
//! errors.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
};
use futures::{future, SinkExt, StreamExt};
use gpufleet_core::RecordId;
use gpufleet_runtime::{ClientFrame, ServerFrame, SessionProxy};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::rest::{error_response, AppState, Caller};

/// Terminal query
#[derive(Debug, Default, Deserialize)]
pub struct TerminalQuery {
    /// `sh` selects `/bin/sh` first; anything else prefers bash
    #[serde(default)]
    pub shell: Option<String>,
}

/// Convert a socket message into a proxy frame; control frames are dropped
pub fn client_frame(message: Result<Message, axum::Error>) -> Option<ClientFrame> {
    match message {
        Ok(Message::Text(text)) => Some(ClientFrame::Text(text)),
        Ok(Message::Binary(data)) => Some(ClientFrame::Binary(data)),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Ok(Message::Close(_)) | Err(_) => Some(ClientFrame::Close),
    }
}

/// Convert a proxy frame into a socket message
pub fn server_message(frame: ServerFrame) -> Message {
    match frame {
        ServerFrame::Text(text) => Message::Text(text),
        ServerFrame::Binary(data) => Message::Binary(data),
    }
}

/// Upgrade to a terminal session on a workload's unit
pub async fn open_terminal(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<RecordId>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, (StatusCode, String)> {
    let (engine, unit_id) = state
        .service
        .session_target(&caller, id)
        .await
        .map_err(error_response)?;
    let session_id = Uuid::new_v4();
    info!(
        session_id = %session_id,
        workload_id = id,
        user_id = caller.user_id,
        "Opening terminal session"
    );

    Ok(ws.on_upgrade(move |socket| async move {
        run_session(socket, SessionProxy::new(engine), unit_id, query.shell, session_id).await
    }))
}

async fn run_session(
    socket: WebSocket,
    proxy: SessionProxy,
    unit_id: String,
    shell: Option<String>,
    session_id: Uuid,
) {
    let (sink, stream) = socket.split();
    let incoming = Box::pin(stream.filter_map(|message| future::ready(client_frame(message))));
    let outgoing = sink.with(|frame: ServerFrame| future::ready(Ok::<_, axum::Error>(server_message(frame))));

    if let Err(e) = proxy
        .run(&unit_id, shell.as_deref(), incoming, outgoing)
        .await
    {
        warn!(session_id = %session_id, error = %e, "Terminal session failed");
    }
    info!(session_id = %session_id, "Terminal session closed");
}
