//! File passthrough handlers

use tracing::warn;

use crate::protocol::*;
use crate::state::DaemonState;

/// An unreadable root lists as empty
pub async fn handle_list(state: &DaemonState) -> ServerMessage {
    let files = match state.workspace.list_files().await {
        Ok(files) => files,
        Err(e) => {
            warn!(error = %e, "failed to list files");
            Vec::new()
        }
    };
    ServerMessage::FileList { files }
}

pub async fn handle_get(filename: Option<String>, state: &DaemonState) -> ServerMessage {
    let filename = filename.unwrap_or_default();
    match state.workspace.read_file(&filename).await {
        Ok(content) => ServerMessage::FileContent {
            filename,
            content,
            error: None,
        },
        Err(e) => {
            warn!(%filename, error = %e, "failed to read file");
            ServerMessage::FileContent {
                filename,
                content: String::new(),
                error: Some(e.to_string()),
            }
        }
    }
}

pub async fn handle_save(filename: Option<String>, content: String, state: &DaemonState) -> ServerMessage {
    let filename = filename.unwrap_or_default();
    match state.workspace.write_file(&filename, &content).await {
        Ok(()) => ServerMessage::SaveAck {
            filename,
            success: true,
            error: None,
        },
        Err(e) => {
            warn!(%filename, error = %e, "failed to save file");
            ServerMessage::SaveAck {
                filename,
                success: false,
                error: Some(e.to_string()),
            }
        }
    }
}
