//! One run of the external command for one prompt.

use std::future::Future;
use std::pin::{pin, Pin};
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExecutionError;
use crate::process::{exit_code, EscalationPolicy, ProcessHandle, ProcessPipes};
use crate::state::ClientSender;
use crate::stream::drain_streams;

/// Return code reported for a cancelled execution; real exit codes are
/// 0..=255 and signal deaths are reported as small negative numbers.
pub const CANCELLED_RETURNCODE: i32 = -1000;

/// Response text reported for a cancelled execution
pub const CANCELLED_RESPONSE: &str = "[cancelled]";

/// How long output may keep draining after the process group is dead
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The process exited on its own
    Completed {
        exit_code: Option<i32>,
        stdout: String,
    },
    /// Stopped through the escalation protocol
    Cancelled,
    /// Spawned, but waiting on it failed
    Failed(ExecutionError),
}

/// Full prompt sent to the command: the new prompt followed by the rendered history
pub fn render_prompt(prompt: &str, history: &str) -> String {
    format!("{prompt}\n\n[conversation history]\n{history}")
}

/// Drive a spawned process to a terminal outcome.
///
/// Output is forwarded to `sink` while the process runs. When `cancel` fires
/// the process group is escalated (interrupt → terminate → kill) while output
/// keeps draining, and the outcome is `Cancelled` whatever the exit status.
pub async fn run(
    mut handle: ProcessHandle,
    pipes: ProcessPipes,
    conversation_id: &str,
    sink: &ClientSender,
    cancel: &CancellationToken,
    policy: &EscalationPolicy,
) -> ExecutionOutcome {
    let pid = handle.pid();
    let mut drain = pin!(drain_streams(pipes.stdout, pipes.stderr, conversation_id, sink));

    let stdout = tokio::select! {
        captured = &mut drain => captured,
        _ = cancel.cancelled() => {
            info!(conversation_id, pid, "cancelling execution");
            stop_draining(&mut handle, drain, policy).await;
            return ExecutionOutcome::Cancelled;
        }
    };

    debug!(conversation_id, pid, "output closed, waiting for exit");

    tokio::select! {
        status = handle.wait() => match status {
            Ok(status) => ExecutionOutcome::Completed {
                exit_code: exit_code(&status),
                stdout,
            },
            Err(e) => ExecutionOutcome::Failed(e),
        },
        _ = cancel.cancelled() => {
            info!(conversation_id, pid, "cancelling execution after output closed");
            stop(&mut handle, policy).await;
            ExecutionOutcome::Cancelled
        }
    }
}

async fn stop(handle: &mut ProcessHandle, policy: &EscalationPolicy) {
    if let Err(e) = handle.escalate(policy).await {
        warn!(pid = handle.pid(), error = %e, "escalation failed");
    }
}

/// Escalate while the pipes keep draining, so a child writing on its way out
/// never blocks on a full pipe.
async fn stop_draining<F>(handle: &mut ProcessHandle, mut drain: Pin<&mut F>, policy: &EscalationPolicy)
where
    F: Future<Output = String>,
{
    let pid = handle.pid();
    let mut escalation = pin!(handle.escalate(policy));

    let mut drained = false;
    let result = loop {
        tokio::select! {
            result = &mut escalation => break result,
            _ = &mut drain, if !drained => drained = true,
        }
    };
    if let Err(e) = result {
        warn!(pid, error = %e, "escalation failed");
    }

    if !drained && timeout(DRAIN_GRACE, drain).await.is_err() {
        // something outside the group still holds the pipes open
        warn!(pid, "output still open after process group exit; abandoning drain");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::{ServerMessage, StreamKind};
    use tokio::sync::mpsc;

    fn policy() -> EscalationPolicy {
        EscalationPolicy {
            interrupt: Some(Duration::from_millis(300)),
            terminate: Some(Duration::from_millis(300)),
        }
    }

    fn spawn_sh(script: &str) -> (ProcessHandle, ProcessPipes) {
        ProcessHandle::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            &std::env::temp_dir(),
        )
        .expect("sh to spawn")
    }

    #[test]
    fn prompt_rendering_appends_history_section() {
        assert_eq!(
            render_prompt("Next", "User: Hello\nModel: Hi"),
            "Next\n\n[conversation history]\nUser: Hello\nModel: Hi"
        );
    }

    #[tokio::test]
    async fn completed_run_returns_exit_code_and_stdout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handle, pipes) = spawn_sh("echo out; echo err >&2; exit 4");
        let cancel = CancellationToken::new();

        let outcome = run(handle, pipes, "c1", &tx, &cancel, &policy()).await;
        match outcome {
            ExecutionOutcome::Completed { exit_code, stdout } => {
                assert_eq!(exit_code, Some(4));
                assert_eq!(stdout, "out\n");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let mut saw_stderr = false;
        while let Ok(message) = rx.try_recv() {
            if let ServerMessage::Stream { stream: StreamKind::Stderr, data, .. } = message {
                assert_eq!(data, "err\n");
                saw_stderr = true;
            }
        }
        assert!(saw_stderr);
    }

    #[tokio::test]
    async fn cancel_stops_a_running_process() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, pipes) = spawn_sh("echo started; sleep 30");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = timeout(Duration::from_secs(5), run(handle, pipes, "c1", &tx, &cancel, &policy()))
            .await
            .expect("cancel to finish within the escalation budget");
        assert!(matches!(outcome, ExecutionOutcome::Cancelled));
    }

    #[tokio::test]
    async fn cancel_is_reported_even_when_process_exits_cleanly() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, pipes) = spawn_sh("trap 'exit 0' INT; while :; do sleep 0.05; done");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = run(handle, pipes, "c1", &tx, &cancel, &policy()).await;
        assert!(matches!(outcome, ExecutionOutcome::Cancelled));
    }
}
