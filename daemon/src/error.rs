use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("command not found: {program}")]
    NotFound { program: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to capture {0} of child process")]
    MissingPipe(&'static str),

    #[error("failed waiting for child process: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("conversation {0} already has an active execution")]
    Busy(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no serve command available (tried: {0})")]
    NoCandidate(String),

    #[error("all serve commands failed: {0}")]
    AllFailed(String),

    #[error("daemon is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("filename not provided")]
    MissingName,

    #[error("path escapes the work root: {0}")]
    OutsideRoot(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
