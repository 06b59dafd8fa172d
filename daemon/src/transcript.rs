//! Durable conversation transcripts
//!
//! One JSON document per work root maps conversation id to its ordered turns.
//! Loading never fails (a missing or unreadable file is an empty store) and
//! every append rewrites the whole document through a temp file + rename so a
//! crash mid-write leaves the previous copy intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::TranscriptError;

pub const TRANSCRIPT_FILE: &str = "conversations.json";

const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Model => "Model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub turn_count: usize,
    pub preview: String,
}

pub type Transcripts = BTreeMap<String, Vec<Turn>>;

pub struct TranscriptStore {
    path: PathBuf,
    conversations: Transcripts,
}

impl TranscriptStore {
    /// Open the store at `path`, loading whatever valid content is there
    pub async fn open(path: PathBuf) -> Self {
        let conversations = load(&path).await;
        info!(
            path = %path.display(),
            conversations = conversations.len(),
            "loaded transcripts"
        );
        Self {
            path,
            conversations,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn turns(&self, conversation_id: &str) -> &[Turn] {
        self.conversations
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.conversations.contains_key(conversation_id)
    }

    /// Prior turns rendered one per line (`User: ...` / `Model: ...`)
    pub fn history(&self, conversation_id: &str) -> String {
        self.turns(conversation_id)
            .iter()
            .map(|turn| format!("{}: {}", turn.role.label(), turn.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.conversations
            .iter()
            .map(|(id, turns)| ConversationSummary {
                conversation_id: id.clone(),
                turn_count: turns.len(),
                preview: turns
                    .iter()
                    .find(|t| t.role == Role::User)
                    .map(|t| t.text.chars().take(PREVIEW_CHARS).collect())
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Append a user/model pair and persist with a single save. On a write
    /// failure the turns stay in memory, which remains authoritative for the
    /// rest of the process.
    pub async fn append_exchange(
        &mut self,
        conversation_id: &str,
        prompt: &str,
        response: &str,
    ) -> Result<(), TranscriptError> {
        let turns = self
            .conversations
            .entry(conversation_id.to_string())
            .or_default();
        turns.push(Turn::new(Role::User, prompt));
        turns.push(Turn::new(Role::Model, response));
        self.save().await
    }

    pub async fn save(&self) -> Result<(), TranscriptError> {
        let result = save(&self.path, &self.conversations).await;
        if let Err(e) = &result {
            warn!(
                path = %self.path.display(),
                error = %e,
                "failed to persist transcripts; keeping in-memory copy"
            );
        }
        result
    }
}

/// Read the transcript file, returning an empty mapping on any failure
pub async fn load(path: &Path) -> Transcripts {
    match try_load(path).await {
        Ok(Some(conversations)) => conversations,
        Ok(None) => {
            debug!(path = %path.display(), "transcript file not found");
            Transcripts::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load transcripts");
            Transcripts::new()
        }
    }
}

async fn try_load(path: &Path) -> Result<Option<Transcripts>, TranscriptError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}

async fn save(path: &Path, conversations: &Transcripts) -> Result<(), TranscriptError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(conversations)?;

    tokio::fs::write(&tmp_path, &json).await?;
    tokio::fs::rename(&tmp_path, path).await?;

    debug!(
        path = %path.display(),
        conversations = conversations.len(),
        "saved transcripts"
    );
    Ok(())
}
