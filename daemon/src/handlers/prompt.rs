//! Prompt and cancel handlers

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::protocol::*;
use crate::registry::CancelOutcome;
use crate::state::{ClientId, DaemonState};

/// Start an execution for the prompt. Events flow to the client's channel;
/// only rejections are returned directly.
pub async fn handle_prompt(
    prompt: Option<String>,
    conversation_id: Option<String>,
    state: &DaemonState,
    client_id: ClientId,
) -> Option<ServerMessage> {
    let Some(prompt) = prompt.filter(|p| !p.is_empty()) else {
        return Some(ServerMessage::error(PROMPT_NOT_PROVIDED));
    };
    let conversation_id = conversation_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(sink) = state.client_sender(client_id).await else {
        debug!(client_id, %conversation_id, "client gone before prompt started");
        return None;
    };

    match state.registry.start(&conversation_id, &prompt, sink).await {
        Ok(started) => {
            debug!(client_id, conversation_id = %started.conversation_id, pid = started.pid, "prompt accepted");
            None
        }
        Err(e @ RegistryError::Busy(_)) => {
            warn!(client_id, %conversation_id, "prompt rejected: conversation busy");
            Some(ServerMessage::Error {
                error: e.to_string(),
                conversation_id: Some(conversation_id),
            })
        }
        Err(RegistryError::Execution(e)) => {
            warn!(client_id, %conversation_id, error = %e, "failed to start execution");
            Some(ServerMessage::Result(ExecutionResult {
                returncode: None,
                conversation_id,
                response: String::new(),
                error: Some(e.to_string()),
            }))
        }
    }
}

pub async fn handle_cancel(conversation_id: Option<String>, state: &DaemonState) -> ServerMessage {
    let Some(conversation_id) = conversation_id else {
        return ServerMessage::CancelResult {
            success: false,
            conversation_id: None,
            message: "conversationId not provided".to_string(),
        };
    };

    let message = match state.registry.cancel(&conversation_id).await {
        CancelOutcome::Cancelled => "cancelled",
        CancelOutcome::NotRunning => "no active execution",
    };

    ServerMessage::CancelResult {
        success: true,
        conversation_id: Some(conversation_id),
        message: message.to_string(),
    }
}
