use crate::protocol::*;
use crate::state::DaemonState;

pub async fn handle_status(state: &DaemonState) -> ServerMessage {
    ServerMessage::StatusSnapshot {
        active_conversations: state.registry.active_conversations().await,
        active_frontends: state.frontends.active_ports().await,
    }
}

pub async fn handle_list(state: &DaemonState) -> ServerMessage {
    ServerMessage::ConversationList {
        conversations: state.registry.summaries().await,
    }
}

/// Unknown ids load as an empty conversation
pub async fn handle_load(conversation_id: String, state: &DaemonState) -> ServerMessage {
    let turns = state.registry.transcript(&conversation_id).await;
    ServerMessage::Conversation {
        conversation_id,
        turns,
    }
}
