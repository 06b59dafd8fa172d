use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::transcript::{ConversationSummary, Turn};

// Command names (`{"command": ...}`)
pub const COMMAND_CANCEL: &str = "cancel";
pub const COMMAND_START_FRONTEND: &str = "start-frontend";
pub const COMMAND_STOP_FRONTEND: &str = "stop-frontend";
pub const COMMAND_STATUS: &str = "status";
pub const COMMAND_LIST_CONVERSATIONS: &str = "list-conversations";
pub const COMMAND_LOAD_CONVERSATION: &str = "load-conversation";

// File operation names (`{"type": ...}`)
pub const TYPE_LIST_FILES: &str = "list_files";
pub const TYPE_GET_FILE: &str = "get_file";
pub const TYPE_SAVE_FILE: &str = "save_file";

pub const PROMPT_NOT_PROVIDED: &str = "Prompt not provided";

/// Wire shape of every incoming message. Which fields are present decides
/// what the message means; see [`ClientRequest::parse`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequest {
    #[serde(rename = "type")]
    kind: Option<String>,
    command: Option<String>,
    prompt: Option<String>,
    #[serde(default, deserialize_with = "id_from_string_or_number")]
    conversation_id: Option<String>,
    filename: Option<String>,
    content: Option<String>,
    #[serde(default, deserialize_with = "port_from_number_or_string")]
    port: Option<u16>,
}

/// A decoded client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    ListFiles,
    GetFile {
        filename: Option<String>,
    },
    SaveFile {
        filename: Option<String>,
        content: String,
    },
    StartFrontend {
        port: u16,
    },
    StopFrontend {
        port: u16,
    },
    Cancel {
        conversation_id: Option<String>,
    },
    Status,
    ListConversations,
    LoadConversation {
        conversation_id: String,
    },
    Prompt {
        prompt: Option<String>,
        conversation_id: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),
}

impl ClientRequest {
    /// Classify one incoming text message.
    ///
    /// `command` takes precedence over `type`; anything else is treated as a
    /// prompt, so a message without a prompt decodes to `Prompt { prompt: None }`
    /// and is answered with "Prompt not provided".
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let raw: RawRequest = serde_json::from_str(text)?;

        if let Some(command) = raw.command {
            return match command.as_str() {
                COMMAND_CANCEL => Ok(Self::Cancel {
                    conversation_id: raw.conversation_id,
                }),
                COMMAND_START_FRONTEND => Ok(Self::StartFrontend {
                    port: raw.port.ok_or(DecodeError::MissingField("port"))?,
                }),
                COMMAND_STOP_FRONTEND => Ok(Self::StopFrontend {
                    port: raw.port.ok_or(DecodeError::MissingField("port"))?,
                }),
                COMMAND_STATUS => Ok(Self::Status),
                COMMAND_LIST_CONVERSATIONS => Ok(Self::ListConversations),
                COMMAND_LOAD_CONVERSATION => Ok(Self::LoadConversation {
                    conversation_id: raw
                        .conversation_id
                        .ok_or(DecodeError::MissingField("conversationId"))?,
                }),
                _ => Err(DecodeError::UnknownCommand(command)),
            };
        }

        if let Some(kind) = raw.kind {
            return match kind.as_str() {
                TYPE_LIST_FILES => Ok(Self::ListFiles),
                TYPE_GET_FILE => Ok(Self::GetFile {
                    filename: raw.filename,
                }),
                TYPE_SAVE_FILE => Ok(Self::SaveFile {
                    filename: raw.filename,
                    content: raw.content.unwrap_or_default(),
                }),
                _ => Err(DecodeError::UnknownType(kind)),
            };
        }

        Ok(Self::Prompt {
            prompt: raw.prompt,
            conversation_id: raw.conversation_id,
        })
    }
}

impl ClientRequest {
    /// Short name used in dispatch logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListFiles => TYPE_LIST_FILES,
            Self::GetFile { .. } => TYPE_GET_FILE,
            Self::SaveFile { .. } => TYPE_SAVE_FILE,
            Self::StartFrontend { .. } => COMMAND_START_FRONTEND,
            Self::StopFrontend { .. } => COMMAND_STOP_FRONTEND,
            Self::Cancel { .. } => COMMAND_CANCEL,
            Self::Status => COMMAND_STATUS,
            Self::ListConversations => COMMAND_LIST_CONVERSATIONS,
            Self::LoadConversation { .. } => COMMAND_LOAD_CONVERSATION,
            Self::Prompt { .. } => "prompt",
        }
    }
}

/// Conversation ids are opaque keys; numeric ids are kept as their decimal text
fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "conversationId must be a string or number, got {other}"
        ))),
    }
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid port: {n}"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {s}"))),
        Some(other) => Err(serde::de::Error::custom(format!("invalid port: {other}"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Complete,
}

/// Terminal outcome of one prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub returncode: Option<i32>,
    pub conversation_id: String,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Server→client message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Stream {
        stream: StreamKind,
        data: String,
        conversation_id: String,
    },
    Status {
        status: ExecutionStatus,
        conversation_id: String,
    },
    Result(ExecutionResult),
    CancelResult {
        success: bool,
        conversation_id: Option<String>,
        message: String,
    },
    FrontendResult {
        success: bool,
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StatusSnapshot {
        active_conversations: Vec<String>,
        active_frontends: Vec<u16>,
    },
    ConversationList {
        conversations: Vec<ConversationSummary>,
    },
    Conversation {
        conversation_id: String,
        turns: Vec<Turn>,
    },
    FileList {
        files: Vec<String>,
    },
    FileContent {
        filename: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SaveAck {
        filename: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            conversation_id: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","error":"failed to encode message: {e}"}}"#)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Role;
    use serde_json::json;

    #[test]
    fn prompt_without_command_or_type() {
        let request = ClientRequest::parse(r#"{"prompt":"Hello","conversationId":"c1"}"#)
            .expect("request to parse");
        assert_eq!(
            request,
            ClientRequest::Prompt {
                prompt: Some("Hello".to_string()),
                conversation_id: Some("c1".to_string()),
            }
        );
    }

    #[test]
    fn empty_object_is_a_prompt_without_text() {
        let request = ClientRequest::parse("{}").expect("request to parse");
        assert_eq!(
            request,
            ClientRequest::Prompt {
                prompt: None,
                conversation_id: None,
            }
        );
    }

    #[test]
    fn command_wins_over_prompt() {
        let request =
            ClientRequest::parse(r#"{"command":"cancel","conversationId":"c1","prompt":"x"}"#)
                .expect("request to parse");
        assert_eq!(
            request,
            ClientRequest::Cancel {
                conversation_id: Some("c1".to_string())
            }
        );
    }

    #[test]
    fn frontend_port_accepts_string_or_number() {
        let a = ClientRequest::parse(r#"{"command":"start-frontend","port":3000}"#).unwrap();
        let b = ClientRequest::parse(r#"{"command":"stop-frontend","port":"3001"}"#).unwrap();
        assert_eq!(a, ClientRequest::StartFrontend { port: 3000 });
        assert_eq!(b, ClientRequest::StopFrontend { port: 3001 });
    }

    #[test]
    fn numeric_conversation_id_is_kept_as_text() {
        let prompt = ClientRequest::parse(r#"{"prompt":"Hi","conversationId":42}"#).unwrap();
        assert_eq!(
            prompt,
            ClientRequest::Prompt {
                prompt: Some("Hi".to_string()),
                conversation_id: Some("42".to_string()),
            }
        );

        let cancel = ClientRequest::parse(r#"{"command":"cancel","conversationId":7}"#).unwrap();
        assert_eq!(
            cancel,
            ClientRequest::Cancel {
                conversation_id: Some("7".to_string())
            }
        );

        let err = ClientRequest::parse(r#"{"prompt":"Hi","conversationId":[1]}"#).unwrap_err();
        assert!(err.to_string().contains("conversationId must be a string or number"));
    }

    #[test]
    fn frontend_without_port_is_rejected() {
        let err = ClientRequest::parse(r#"{"command":"start-frontend"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField("port")));
    }

    #[test]
    fn unknown_command_and_type_are_errors() {
        assert!(matches!(
            ClientRequest::parse(r#"{"command":"explode"}"#),
            Err(DecodeError::UnknownCommand(c)) if c == "explode"
        ));
        assert!(matches!(
            ClientRequest::parse(r#"{"type":"rename_file"}"#),
            Err(DecodeError::UnknownType(t)) if t == "rename_file"
        ));
        assert!(matches!(
            ClientRequest::parse("not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn file_requests_decode() {
        assert_eq!(
            ClientRequest::parse(r#"{"type":"list_files"}"#).unwrap(),
            ClientRequest::ListFiles
        );
        assert_eq!(
            ClientRequest::parse(r#"{"type":"save_file","filename":"a.txt","content":"hi"}"#)
                .unwrap(),
            ClientRequest::SaveFile {
                filename: Some("a.txt".to_string()),
                content: "hi".to_string(),
            }
        );
    }

    #[test]
    fn stream_event_shape() {
        let message = ServerMessage::Stream {
            stream: StreamKind::Stderr,
            data: "warn\n".to_string(),
            conversation_id: "c1".to_string(),
        };
        let value = serde_json::to_value(message).expect("message to serialize");
        assert_eq!(
            value,
            json!({"type": "stream", "stream": "stderr", "data": "warn\n", "conversationId": "c1"})
        );
    }

    #[test]
    fn result_shape_omits_missing_error() {
        let message = ServerMessage::Result(ExecutionResult {
            returncode: Some(0),
            conversation_id: "c1".to_string(),
            response: "hi\n".to_string(),
            error: None,
        });
        let value = serde_json::to_value(message).expect("message to serialize");
        assert_eq!(
            value,
            json!({"type": "result", "returncode": 0, "conversationId": "c1", "response": "hi\n"})
        );
    }

    #[test]
    fn snapshot_and_conversation_shapes() {
        let snapshot = ServerMessage::StatusSnapshot {
            active_conversations: vec!["c1".to_string()],
            active_frontends: vec![3000],
        };
        assert_eq!(
            serde_json::to_value(snapshot).unwrap(),
            json!({"type": "status_snapshot", "activeConversations": ["c1"], "activeFrontends": [3000]})
        );

        let conversation = ServerMessage::Conversation {
            conversation_id: "c1".to_string(),
            turns: vec![Turn::new(Role::User, "Hello")],
        };
        assert_eq!(
            serde_json::to_value(conversation).unwrap(),
            json!({"type": "conversation", "conversationId": "c1", "turns": [{"role": "user", "text": "Hello"}]})
        );
    }
}
