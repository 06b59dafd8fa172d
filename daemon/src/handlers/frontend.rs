//! Preview server handlers
//!
//! Starting or stopping a server can take seconds (startup grace, stop
//! escalation), so both run as their own task and reply through the
//! client's event channel. The connection loop keeps serving meanwhile.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::protocol::*;
use crate::state::{ClientId, DaemonState};

pub async fn handle_start(port: u16, state: Arc<DaemonState>, client_id: ClientId) -> Option<ServerMessage> {
    let sink = state.client_sender(client_id).await?;
    tokio::spawn(async move {
        if sink.send(start(port, &state).await).is_err() {
            debug!(client_id, port, "client gone before frontend result");
        }
    });
    None
}

pub async fn handle_stop(port: u16, state: Arc<DaemonState>, client_id: ClientId) -> Option<ServerMessage> {
    let sink = state.client_sender(client_id).await?;
    tokio::spawn(async move {
        if sink.send(stop(port, &state).await).is_err() {
            debug!(client_id, port, "client gone before frontend result");
        }
    });
    None
}

async fn start(port: u16, state: &DaemonState) -> ServerMessage {
    match state.frontends.start(port, state.workspace.root()).await {
        Ok(started) => {
            info!(port = started.port, pid = started.pid, command = %started.command_line, "frontend started");
            ServerMessage::FrontendResult {
                success: true,
                port,
                error: None,
            }
        }
        Err(e) => {
            error!(port, error = %e, "failed to start frontend");
            ServerMessage::FrontendResult {
                success: false,
                port,
                error: Some(e.to_string()),
            }
        }
    }
}

async fn stop(port: u16, state: &DaemonState) -> ServerMessage {
    if state.frontends.stop(port).await {
        ServerMessage::FrontendResult {
            success: true,
            port,
            error: None,
        }
    } else {
        ServerMessage::FrontendResult {
            success: false,
            port,
            error: Some(format!("no preview server running on port {port}")),
        }
    }
}
