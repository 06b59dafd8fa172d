use std::sync::Arc;

use futures::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};

use crate::handlers;
use crate::protocol::{ClientRequest, ServerMessage};
use crate::state::{ClientId, DaemonState};

/// Handle a single client connection
pub async fn handle_client(stream: TcpStream, state: Arc<DaemonState>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Websocket handshake with {peer} failed: {e}");
            return;
        }
    };

    info!("Client connected: {peer}");

    let (client_id, event_rx) = state.register_client().await;
    debug!("Assigned client_id={client_id} to {peer}");

    let result = handle_client_inner(ws, state.clone(), client_id, event_rx).await;

    if let Err(e) = result {
        debug!("Client {peer} error: {e}");
    }

    info!("Client disconnected: {peer}");
    state.unregister_client(client_id).await;
}

async fn handle_client_inner(
    ws: WebSocketStream<TcpStream>,
    state: Arc<DaemonState>,
    client_id: ClientId,
    mut event_rx: mpsc::UnboundedReceiver<ServerMessage>,
) -> Result<(), String> {
    let (mut writer, mut reader) = ws.split();

    // Main loop: read requests and forward events. Handlers never block on
    // an execution, so this loop stays responsive to cancel requests.
    loop {
        tokio::select! {
            // Read request from client
            incoming = reader.next() => {
                let text = match incoming {
                    None => break,
                    Some(Err(e)) => return Err(format!("Read error: {e}")),
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            send(&mut writer, &ServerMessage::error("Binary frames must be UTF-8 JSON")).await?;
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) => break,
                    // ping/pong are answered by tungstenite
                    Some(Ok(_)) => continue,
                };

                if let Some(response) = process_request(&text, state.clone(), client_id).await {
                    send(&mut writer, &response).await?;
                }
            }

            // Forward events to client
            Some(event) = event_rx.recv() => {
                send(&mut writer, &event).await?;
            }
        }
    }

    Ok(())
}

async fn send<S>(writer: &mut S, message: &ServerMessage) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    writer.send(Message::Text(message.to_json())).await.map_err(|e| {
        error!("Failed to write message: {e}");
        format!("Write error: {e}")
    })
}

/// Decode a single message and dispatch it
async fn process_request(
    text: &str,
    state: Arc<DaemonState>,
    client_id: ClientId,
) -> Option<ServerMessage> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    match ClientRequest::parse(trimmed) {
        Ok(request) => handlers::dispatch(request, state, client_id).await,
        Err(e) => {
            debug!("client={client_id} rejected message: {e}");
            Some(ServerMessage::error(e.to_string()))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::Value;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_tungstenite::MaybeTlsStream;

    use crate::handlers::tests::state;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn connect(state: Arc<DaemonState>) -> Client {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_client(stream, state).await;
        });
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("websocket handshake");
        ws
    }

    async fn recv_json(ws: &mut Client) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
                .await
                .expect("message before timeout")
                .expect("connection open")
                .expect("valid frame");
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).expect("server sends JSON");
            }
        }
    }

    #[tokio::test]
    async fn undecodable_messages_get_error_events() {
        let tmp = TempDir::new().unwrap();
        let mut ws = connect(state(&tmp).await).await;

        ws.send(Message::Text("not json".to_string())).await.unwrap();
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["type"], "error");
        assert!(reply["error"].as_str().unwrap().starts_with("Invalid JSON"));

        ws.send(Message::Text(r#"{"command":"explode"}"#.to_string())).await.unwrap();
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "Unknown command: explode");
    }

    #[tokio::test]
    async fn binary_frames_are_decoded_as_utf8_json() {
        let tmp = TempDir::new().unwrap();
        let mut ws = connect(state(&tmp).await).await;

        ws.send(Message::Binary(vec![0xff, 0xfe])).await.unwrap();
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "Binary frames must be UTF-8 JSON");

        ws.send(Message::Binary(br#"{"command":"status"}"#.to_vec())).await.unwrap();
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["type"], "status_snapshot");
        assert_eq!(reply["activeConversations"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn prompt_events_arrive_in_order_over_the_socket() {
        let tmp = TempDir::new().unwrap();
        let mut ws = connect(state(&tmp).await).await;

        ws.send(Message::Text(r#"{"prompt":"Hello","conversationId":"c1"}"#.to_string()))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        loop {
            let event = recv_json(&mut ws).await;
            assert_eq!(event["conversationId"], "c1");
            let kind = match event["type"].as_str().unwrap() {
                "status" => format!("status:{}", event["status"].as_str().unwrap()),
                other => other.to_string(),
            };
            let done = kind == "result";
            kinds.push(kind);
            if done {
                break;
            }
        }
        assert_eq!(kinds, vec!["status:running", "stream", "status:complete", "result"]);
    }

    #[tokio::test]
    async fn blank_messages_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let state = state(&tmp).await;
        let (client_id, _rx) = state.register_client().await;
        assert_eq!(process_request("  \n", state, client_id).await, None);
    }
}
