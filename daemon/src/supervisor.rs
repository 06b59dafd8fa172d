//! Preview server supervision
//!
//! Long-lived "serve this directory on this port" processes keyed by port.
//! Independent of the conversation registry: no transcripts, no client
//! streaming (server output goes to the daemon log).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ExecutionError, SupervisorError};
use crate::process::{exit_code, kill_group, EscalationPolicy, ProcessHandle};

pub const PORT_PLACEHOLDER: &str = "{port}";
pub const DIR_PLACEHOLDER: &str = "{dir}";

/// An exit inside this window counts as a failed start
const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(750);

/// Time between terminate and kill when stopping a server
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// One candidate command line for serving a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ServeCommand {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn render(&self, port: u16, dir: &Path) -> Vec<String> {
        let port = port.to_string();
        let dir = dir.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace(PORT_PLACEHOLDER, &port).replace(DIR_PLACEHOLDER, &dir))
            .collect()
    }

    fn command_line(&self, argv: &[String]) -> String {
        std::iter::once(self.program.as_str())
            .chain(argv.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Candidates tried in order until one stays up
pub fn default_serve_commands() -> Vec<ServeCommand> {
    vec![
        ServeCommand::new("npm", ["run", "dev", "--", "--port", PORT_PLACEHOLDER]),
        ServeCommand::new("python3", ["-m", "http.server", PORT_PLACEHOLDER, "--directory", DIR_PLACEHOLDER]),
        ServeCommand::new("python", ["-m", "http.server", PORT_PLACEHOLDER, "--directory", DIR_PLACEHOLDER]),
        ServeCommand::new("npx", ["--yes", "http-server", DIR_PLACEHOLDER, "-p", PORT_PLACEHOLDER]),
    ]
}

struct ServerEntry {
    generation: u64,
    pid: u32,
    command_line: String,
    stop: CancellationToken,
    monitor: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedServer {
    pub port: u16,
    pub pid: u32,
    pub command_line: String,
}

pub struct ServerSupervisor {
    candidates: Vec<ServeCommand>,
    startup_grace: Duration,
    stop_grace: Duration,
    /// Serializes start/stop so a port never has two servers
    ops: Mutex<()>,
    servers: Arc<Mutex<HashMap<u16, ServerEntry>>>,
    next_generation: AtomicU64,
    /// Set by shutdown; later starts are refused
    closed: AtomicBool,
}

impl Default for ServerSupervisor {
    fn default() -> Self {
        Self::new(default_serve_commands(), DEFAULT_STARTUP_GRACE, DEFAULT_STOP_GRACE)
    }
}

impl ServerSupervisor {
    pub fn new(candidates: Vec<ServeCommand>, startup_grace: Duration, stop_grace: Duration) -> Self {
        Self {
            candidates,
            startup_grace,
            stop_grace,
            ops: Mutex::new(()),
            servers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Start a server for `work_dir` on `port`, replacing any existing one.
    pub async fn start(&self, port: u16, work_dir: &Path) -> Result<StartedServer, SupervisorError> {
        let _ops = self.ops.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(SupervisorError::ShuttingDown);
        }
        self.stop_locked(port).await;

        let mut missing = Vec::new();
        let mut failures = Vec::new();

        for candidate in &self.candidates {
            let argv = candidate.render(port, work_dir);
            let command_line = candidate.command_line(&argv);

            let (mut handle, pipes) = match ProcessHandle::spawn(&candidate.program, &argv, work_dir) {
                Ok(spawned) => spawned,
                Err(ExecutionError::NotFound { program }) => {
                    debug!(port, %program, "serve candidate not installed");
                    missing.push(program);
                    continue;
                }
                Err(e) => {
                    warn!(port, command = %command_line, error = %e, "serve candidate failed to spawn");
                    failures.push(format!("{command_line}: {e}"));
                    continue;
                }
            };

            tokio::spawn(forward_to_log(pipes.stdout, port, "stdout"));
            tokio::spawn(forward_to_log(pipes.stderr, port, "stderr"));

            let early_exit = match timeout(self.startup_grace, handle.wait()).await {
                Ok(Ok(status)) => {
                    warn!(port, command = %command_line, code = ?exit_code(&status), "serve candidate exited during startup");
                    Some(format!("{command_line}: exited immediately ({status})"))
                }
                Ok(Err(e)) => Some(format!("{command_line}: {e}")),
                Err(_) => None,
            };
            if let Some(failure) = early_exit {
                // helpers the candidate forked must not outlive the attempt
                if let Err(e) = handle.escalate(&EscalationPolicy::terminate_then_kill(self.stop_grace)).await {
                    warn!(port, command = %command_line, error = %e, "failed to clean up serve candidate");
                }
                failures.push(failure);
                continue;
            }

            let pid = handle.pid();
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let stop = CancellationToken::new();
            let monitor = tokio::spawn(monitor(
                handle,
                port,
                generation,
                stop.clone(),
                Arc::clone(&self.servers),
                self.stop_grace,
            ));

            self.servers.lock().await.insert(
                port,
                ServerEntry {
                    generation,
                    pid,
                    command_line: command_line.clone(),
                    stop,
                    monitor,
                },
            );

            info!(port, pid, command = %command_line, "preview server started");
            return Ok(StartedServer {
                port,
                pid,
                command_line,
            });
        }

        if failures.is_empty() {
            Err(SupervisorError::NoCandidate(missing.join(", ")))
        } else {
            Err(SupervisorError::AllFailed(failures.join("; ")))
        }
    }

    /// Stop the server on `port`. Returns false if none was running.
    pub async fn stop(&self, port: u16) -> bool {
        let _ops = self.ops.lock().await;
        self.stop_locked(port).await
    }

    /// Caller holds `ops`. Waits until the process has been reaped.
    async fn stop_locked(&self, port: u16) -> bool {
        let Some(entry) = self.servers.lock().await.remove(&port) else {
            return false;
        };

        info!(port, pid = entry.pid, command = %entry.command_line, "stopping preview server");
        entry.stop.cancel();
        if let Err(e) = entry.monitor.await {
            warn!(port, error = %e, "preview server monitor failed");
        }
        true
    }

    pub async fn active_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.servers.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Stop every server, bounded by `grace` overall, and refuse later
    /// starts. Groups still alive at the deadline are killed outright.
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        self.closed.store(true, Ordering::Release);

        let Ok(_ops) = tokio::time::timeout_at(deadline, self.ops.lock()).await else {
            warn!(?grace, "preview server start still in progress at shutdown");
            return;
        };
        let entries: Vec<(u16, ServerEntry)> = self.servers.lock().await.drain().collect();
        if entries.is_empty() {
            return;
        }

        info!(count = entries.len(), "stopping preview servers");
        let mut pids = Vec::with_capacity(entries.len());
        let mut monitors: Vec<JoinHandle<()>> = Vec::with_capacity(entries.len());
        for (_, entry) in entries {
            entry.stop.cancel();
            pids.push(entry.pid);
            monitors.push(entry.monitor);
        }
        let aborts: Vec<_> = monitors.iter().map(|m| m.abort_handle()).collect();

        if tokio::time::timeout_at(deadline, join_all(monitors)).await.is_err() {
            warn!(?grace, "preview servers still running after grace period; killing");
            for (pid, abort) in pids.into_iter().zip(aborts) {
                kill_group(pid);
                abort.abort();
            }
        }
    }
}

/// Reap the server; on a stop request run terminate → kill instead
async fn monitor(
    mut handle: ProcessHandle,
    port: u16,
    generation: u64,
    stop: CancellationToken,
    servers: Arc<Mutex<HashMap<u16, ServerEntry>>>,
    stop_grace: Duration,
) {
    let pid = handle.pid();
    tokio::select! {
        status = handle.wait() => {
            match status {
                Ok(status) if status.success() => info!(port, pid, "preview server exited"),
                Ok(status) => warn!(port, pid, code = ?exit_code(&status), "preview server exited with failure"),
                Err(e) => warn!(port, pid, error = %e, "failed waiting on preview server"),
            }
            let mut servers = servers.lock().await;
            if servers.get(&port).is_some_and(|entry| entry.generation == generation) {
                servers.remove(&port);
            }
        }
        _ = stop.cancelled() => {
            match handle.escalate(&EscalationPolicy::terminate_then_kill(stop_grace)).await {
                Ok((status, step)) => debug!(port, pid, ?step, code = ?exit_code(&status), "preview server stopped"),
                Err(e) => warn!(port, pid, error = %e, "failed to stop preview server"),
            }
        }
    }
}

async fn forward_to_log<R>(reader: R, port: u16, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(port, stream, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(port, stream, error = %e, "preview server output closed");
                break;
            }
        }
    }
}
