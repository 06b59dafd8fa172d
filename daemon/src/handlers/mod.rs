pub mod conversations;
pub mod files;
pub mod frontend;
pub mod prompt;

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::protocol::{ClientRequest, ServerMessage};
use crate::state::{ClientId, DaemonState};

/// Dispatch a request to the appropriate handler.
///
/// Returns the direct reply, if any. Prompts and preview-server requests
/// reply through the client's event channel instead and return `None`.
pub async fn dispatch(
    request: ClientRequest,
    state: Arc<DaemonState>,
    client_id: ClientId,
) -> Option<ServerMessage> {
    let start = Instant::now();
    let name = request.name();

    debug!("[dispatch] → request={} client={}", name, client_id);

    let response = match request {
        ClientRequest::ListFiles => Some(files::handle_list(&state).await),
        ClientRequest::GetFile { filename } => Some(files::handle_get(filename, &state).await),
        ClientRequest::SaveFile { filename, content } => {
            Some(files::handle_save(filename, content, &state).await)
        }
        ClientRequest::StartFrontend { port } => {
            frontend::handle_start(port, state.clone(), client_id).await
        }
        ClientRequest::StopFrontend { port } => {
            frontend::handle_stop(port, state.clone(), client_id).await
        }
        ClientRequest::Cancel { conversation_id } => {
            Some(prompt::handle_cancel(conversation_id, &state).await)
        }
        ClientRequest::Status => Some(conversations::handle_status(&state).await),
        ClientRequest::ListConversations => Some(conversations::handle_list(&state).await),
        ClientRequest::LoadConversation { conversation_id } => {
            Some(conversations::handle_load(conversation_id, &state).await)
        }
        ClientRequest::Prompt {
            prompt,
            conversation_id,
        } => prompt::handle_prompt(prompt, conversation_id, &state, client_id).await,
    };

    let elapsed = start.elapsed();
    if matches!(response, Some(ServerMessage::Error { .. })) {
        info!("[dispatch] ← request={} error elapsed={:?}", name, elapsed);
    } else {
        debug!("[dispatch] ← request={} ok elapsed={:?}", name, elapsed);
    }

    response
}
