//! Conversation registry
//!
//! Tracks at most one live execution per conversation id. Executions run as
//! detached tasks; when one ends it queues a [`Completion`] that a single
//! finalizer task processes in order, so a cancel racing a completion always
//! resolves the same way: whoever takes the registry entry first wins.
//! Cancelled executions leave the registry at once but stay tracked until
//! their escalation finishes, so shutdown can wait for them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CommandTemplate;
use crate::error::RegistryError;
use crate::execution::{self, render_prompt, ExecutionOutcome, CANCELLED_RESPONSE, CANCELLED_RETURNCODE};
use crate::process::{kill_group, EscalationPolicy, ProcessHandle};
use crate::protocol::{ExecutionResult, ExecutionStatus, ServerMessage};
use crate::state::ClientSender;
use crate::transcript::{ConversationSummary, TranscriptStore, Turn};

struct ActiveExecution {
    generation: u64,
    pid: u32,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    started_at: Instant,
}

/// Sent by an execution task when it reaches a terminal state
struct Completion {
    conversation_id: String,
    generation: u64,
    prompt: String,
    outcome: ExecutionOutcome,
    cancel: CancellationToken,
    sink: ClientSender,
}

enum FinalizerMessage {
    Completion(Completion),
    /// Answered once every earlier completion has been finalized
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotRunning,
}

/// Returned by [`ConversationRegistry::start`] once the process is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedExecution {
    pub conversation_id: String,
    pub pid: u32,
}

pub struct ConversationRegistry {
    command: CommandTemplate,
    work_root: PathBuf,
    policy: EscalationPolicy,
    active: Arc<Mutex<HashMap<String, ActiveExecution>>>,
    /// Cancelled executions still escalating
    cancelled: Mutex<Vec<ActiveExecution>>,
    transcripts: Arc<Mutex<TranscriptStore>>,
    completions: mpsc::UnboundedSender<FinalizerMessage>,
    next_generation: AtomicU64,
}

impl ConversationRegistry {
    /// Create the registry and start its finalizer task. Must be called
    /// inside a tokio runtime.
    pub fn new(
        command: CommandTemplate,
        work_root: PathBuf,
        policy: EscalationPolicy,
        transcripts: TranscriptStore,
    ) -> Self {
        let active = Arc::new(Mutex::new(HashMap::new()));
        let transcripts = Arc::new(Mutex::new(transcripts));
        let (completions, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_finalizer(rx, Arc::clone(&active), Arc::clone(&transcripts)));

        Self {
            command,
            work_root,
            policy,
            active,
            cancelled: Mutex::new(Vec::new()),
            transcripts,
            completions,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Spawn the external command for `prompt` and return without waiting.
    ///
    /// `status: running` is queued on `sink` before any output, and the
    /// registry entry exists before this returns, so an immediate cancel
    /// always finds the process.
    pub async fn start(
        &self,
        conversation_id: &str,
        prompt: &str,
        sink: ClientSender,
    ) -> Result<StartedExecution, RegistryError> {
        let mut active = self.active.lock().await;
        if active.contains_key(conversation_id) {
            return Err(RegistryError::Busy(conversation_id.to_string()));
        }

        let full_prompt = {
            let transcripts = self.transcripts.lock().await;
            if !transcripts.contains(conversation_id) {
                info!(conversation_id, "new conversation started");
            }
            render_prompt(prompt, &transcripts.history(conversation_id))
        };

        let argv = self.command.render(&full_prompt);
        let (handle, pipes) = ProcessHandle::spawn(&self.command.program, &argv, &self.work_root)?;
        let pid = handle.pid();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let _ = sink.send(ServerMessage::Status {
            status: ExecutionStatus::Running,
            conversation_id: conversation_id.to_string(),
        });

        let task = {
            let conversation_id = conversation_id.to_string();
            let prompt = prompt.to_string();
            let cancel = cancel.clone();
            let policy = self.policy;
            let completions = self.completions.clone();
            tokio::spawn(async move {
                let outcome =
                    execution::run(handle, pipes, &conversation_id, &sink, &cancel, &policy).await;
                let completion = Completion {
                    conversation_id,
                    generation,
                    prompt,
                    outcome,
                    cancel,
                    sink,
                };
                if completions.send(FinalizerMessage::Completion(completion)).is_err() {
                    error!(generation, "finalizer gone; dropping completion");
                }
            })
        };

        active.insert(
            conversation_id.to_string(),
            ActiveExecution {
                generation,
                pid,
                cancel,
                task,
                started_at: Instant::now(),
            },
        );

        info!(conversation_id, pid, generation, "execution started");

        Ok(StartedExecution {
            conversation_id: conversation_id.to_string(),
            pid,
        })
    }

    /// Cancel the live execution for `conversation_id`, if any.
    ///
    /// The entry is removed before the process is confirmed dead, so a new
    /// prompt for the same id is never blocked behind cleanup.
    pub async fn cancel(&self, conversation_id: &str) -> CancelOutcome {
        let entry = self.active.lock().await.remove(conversation_id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                info!(
                    conversation_id,
                    pid = entry.pid,
                    elapsed = ?entry.started_at.elapsed(),
                    "execution cancelled"
                );
                let mut cancelled = self.cancelled.lock().await;
                cancelled.retain(|entry| !entry.task.is_finished());
                cancelled.push(entry);
                CancelOutcome::Cancelled
            }
            None => {
                debug!(conversation_id, "cancel requested with no active execution");
                CancelOutcome::NotRunning
            }
        }
    }

    pub async fn active_conversations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub async fn is_active(&self, conversation_id: &str) -> bool {
        self.active.lock().await.contains_key(conversation_id)
    }

    pub async fn transcript(&self, conversation_id: &str) -> Vec<Turn> {
        self.transcripts.lock().await.turns(conversation_id).to_vec()
    }

    pub async fn summaries(&self) -> Vec<ConversationSummary> {
        self.transcripts.lock().await.summaries()
    }

    /// Cancel every live execution and wait, bounded by `grace`, for the
    /// escalations and queued finalizations to finish. Executions cancelled
    /// earlier are waited on too. Process groups still alive at the deadline
    /// are killed outright.
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;

        let mut entries: Vec<ActiveExecution> =
            self.active.lock().await.drain().map(|(_, entry)| entry).collect();
        entries.extend(self.cancelled.lock().await.drain(..));
        entries.retain(|entry| !entry.task.is_finished());

        if !entries.is_empty() {
            info!(count = entries.len(), "stopping executions");
            let mut pids = Vec::with_capacity(entries.len());
            let mut tasks = Vec::with_capacity(entries.len());
            for entry in entries {
                debug!(pid = entry.pid, generation = entry.generation, "cancelling for shutdown");
                entry.cancel.cancel();
                pids.push(entry.pid);
                tasks.push(entry.task);
            }

            let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
            if tokio::time::timeout_at(deadline, join_all(tasks)).await.is_err() {
                warn!(?grace, "executions still running after grace period; killing");
                for (pid, abort) in pids.into_iter().zip(aborts) {
                    kill_group(pid);
                    abort.abort();
                }
            }
        }

        let (flushed, done) = oneshot::channel();
        if self.completions.send(FinalizerMessage::Flush(flushed)).is_ok()
            && tokio::time::timeout_at(deadline, done).await.is_err()
        {
            warn!("finalizations still pending after grace period");
        }
    }
}

async fn run_finalizer(
    mut rx: mpsc::UnboundedReceiver<FinalizerMessage>,
    active: Arc<Mutex<HashMap<String, ActiveExecution>>>,
    transcripts: Arc<Mutex<TranscriptStore>>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            FinalizerMessage::Completion(completion) => {
                finalize(completion, &active, &transcripts).await;
            }
            FinalizerMessage::Flush(flushed) => {
                let _ = flushed.send(());
            }
        }
    }
    debug!("finalizer stopped");
}

async fn finalize(
    completion: Completion,
    active: &Mutex<HashMap<String, ActiveExecution>>,
    transcripts: &Mutex<TranscriptStore>,
) {
    let Completion {
        conversation_id,
        generation,
        prompt,
        outcome,
        cancel,
        sink,
    } = completion;

    // The active lock is held through the transcript append so a follow-up
    // prompt for this id always renders the history including this turn.
    let mut active = active.lock().await;
    if active
        .get(&conversation_id)
        .is_some_and(|entry| entry.generation == generation)
    {
        active.remove(&conversation_id);
    }
    let outcome = if cancel.is_cancelled() {
        ExecutionOutcome::Cancelled
    } else {
        outcome
    };
    let cancelled = matches!(outcome, ExecutionOutcome::Cancelled);

    let result = match outcome {
        ExecutionOutcome::Cancelled => ExecutionResult {
            returncode: Some(CANCELLED_RETURNCODE),
            conversation_id: conversation_id.clone(),
            response: CANCELLED_RESPONSE.to_string(),
            error: None,
        },
        ExecutionOutcome::Completed { exit_code, stdout } => {
            let mut error = None;
            if exit_code == Some(0) {
                let mut transcripts = transcripts.lock().await;
                if let Err(e) = transcripts.append_exchange(&conversation_id, &prompt, &stdout).await {
                    error = Some(format!("transcript not persisted: {e}"));
                }
            } else {
                info!(%conversation_id, ?exit_code, "execution failed; transcript unchanged");
            }
            ExecutionResult {
                returncode: exit_code,
                conversation_id: conversation_id.clone(),
                response: stdout,
                error,
            }
        }
        ExecutionOutcome::Failed(e) => {
            warn!(%conversation_id, error = %e, "execution failed");
            ExecutionResult {
                returncode: None,
                conversation_id: conversation_id.clone(),
                response: String::new(),
                error: Some(e.to_string()),
            }
        }
    };
    drop(active);

    info!(
        %conversation_id,
        generation,
        returncode = ?result.returncode,
        cancelled,
        "execution finalized"
    );

    let _ = sink.send(ServerMessage::Status {
        status: ExecutionStatus::Complete,
        conversation_id,
    });
    let _ = sink.send(ServerMessage::Result(result));
}
