//! Child processes spawned in their own process group, and the
//! interrupt → terminate → kill escalation used to stop them.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationStep {
    Interrupt,
    Terminate,
    Kill,
}

impl EscalationStep {
    #[cfg(unix)]
    fn signal(self) -> libc::c_int {
        match self {
            Self::Interrupt => libc::SIGINT,
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Terminate => "terminate",
            Self::Kill => "kill",
        }
    }
}

/// How long each polite step waits before escalating. `None` skips the step.
/// The final kill is unconditional and waited on without a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub interrupt: Option<Duration>,
    pub terminate: Option<Duration>,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            interrupt: Some(Duration::from_secs(2)),
            terminate: Some(Duration::from_secs(2)),
        }
    }
}

impl EscalationPolicy {
    /// Terminate, wait, then kill (no interrupt step)
    pub fn terminate_then_kill(grace: Duration) -> Self {
        Self {
            interrupt: None,
            terminate: Some(grace),
        }
    }

    fn graced_steps(&self) -> impl Iterator<Item = (EscalationStep, Duration)> {
        [
            self.interrupt.map(|t| (EscalationStep::Interrupt, t)),
            self.terminate.map(|t| (EscalationStep::Terminate, t)),
        ]
        .into_iter()
        .flatten()
    }
}

/// Handle to a spawned child that leads its own process group
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    program: String,
}

/// Pipes taken from a freshly spawned child
pub struct ProcessPipes {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl ProcessHandle {
    /// Spawn `program args...` in `cwd` with the full inherited environment.
    /// Stdin is closed; stdout/stderr are piped back to the caller.
    pub fn spawn(program: &str, args: &[String], cwd: &Path) -> Result<(Self, ProcessPipes), ExecutionError> {
        if !cwd.is_dir() {
            return Err(ExecutionError::Spawn {
                program: program.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("working directory does not exist: {}", cwd.display()),
                ),
            });
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecutionError::NotFound {
                    program: program.to_string(),
                }
            } else {
                ExecutionError::Spawn {
                    program: program.to_string(),
                    source: e,
                }
            }
        })?;

        let pid = child.id().unwrap_or_default();
        let stdout = child.stdout.take().ok_or(ExecutionError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ExecutionError::MissingPipe("stderr"))?;

        debug!(pid, program, cwd = %cwd.display(), "spawned process group");

        Ok((
            Self {
                child,
                pid,
                program: program.to_string(),
            },
            ProcessPipes { stdout, stderr },
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, ExecutionError> {
        self.child.wait().await.map_err(ExecutionError::Wait)
    }

    /// Non-blocking exit check
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, ExecutionError> {
        self.child.try_wait().map_err(ExecutionError::Wait)
    }

    /// Deliver one escalation step to the whole process group
    pub fn signal(&mut self, step: EscalationStep) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            signal_group(self.pid, step.signal())
        }
        #[cfg(not(unix))]
        {
            let _ = step;
            self.child.start_kill()
        }
    }

    /// Run the escalation protocol until the process has exited and been reaped.
    /// Returns the exit status and the step that ended it (`None` if it had
    /// already exited).
    pub async fn escalate(
        &mut self,
        policy: &EscalationPolicy,
    ) -> Result<(ExitStatus, Option<EscalationStep>), ExecutionError> {
        if let Some(status) = self.try_wait()? {
            self.sweep_group();
            return Ok((status, None));
        }

        for (step, grace) in policy.graced_steps() {
            if let Err(e) = self.signal(step) {
                warn!(pid = self.pid, step = step.as_str(), error = %e, "failed to signal process group");
            }
            match timeout(grace, self.child.wait()).await {
                Ok(status) => {
                    let status = status.map_err(ExecutionError::Wait)?;
                    info!(pid = self.pid, step = step.as_str(), "process stopped");
                    self.sweep_group();
                    return Ok((status, Some(step)));
                }
                Err(_) => {
                    debug!(pid = self.pid, step = step.as_str(), ?grace, "process survived, escalating");
                }
            }
        }

        if let Err(e) = self.signal(EscalationStep::Kill) {
            warn!(pid = self.pid, error = %e, "failed to kill process group");
            let _ = self.child.start_kill();
        }
        let status = self.wait().await?;
        info!(pid = self.pid, program = %self.program, "process killed");
        Ok((status, Some(EscalationStep::Kill)))
    }

    /// Kill anything the leader left behind in its group
    fn sweep_group(&self) {
        #[cfg(unix)]
        {
            let _ = signal_group(self.pid, libc::SIGKILL);
        }
    }
}

/// SIGKILL a whole process group. A group that is already gone is fine.
pub fn kill_group(pgid: u32) {
    #[cfg(unix)]
    {
        if let Err(e) = signal_group(pgid, libc::SIGKILL) {
            warn!(pgid, error = %e, "failed to kill process group");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> std::io::Result<()> {
    if pgid == 0 {
        return Ok(());
    }
    let result = unsafe { libc::kill(-(pgid as libc::pid_t), signal) };
    if result == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // group already gone
        return Ok(());
    }
    Err(err)
}

/// Exit code as reported to clients: the process code, or the negated
/// signal number when the process was killed by a signal.
pub fn exit_code(status: &ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|s| -s)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// Zombies count as dead; containers may not reap reparented children
#[cfg(all(test, unix))]
pub(crate) fn is_alive(pid: u32) -> bool {
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        let state = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next());
        return !matches!(state, Some('Z') | Some('X'));
    }
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::AsyncBufReadExt;

    fn fast_policy() -> EscalationPolicy {
        EscalationPolicy {
            interrupt: Some(Duration::from_millis(300)),
            terminate: Some(Duration::from_millis(300)),
        }
    }

    fn sh(script: &str) -> (ProcessHandle, ProcessPipes) {
        let cwd = std::env::temp_dir();
        ProcessHandle::spawn("sh", &["-c".to_string(), script.to_string()], &cwd)
            .expect("sh to spawn")
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let cwd = std::env::temp_dir();
        let err = ProcessHandle::spawn("relay-definitely-missing-binary", &[], &cwd)
            .err()
            .expect("spawn to fail");
        assert!(matches!(err, ExecutionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn invalid_directory_is_spawn_error() {
        let err = ProcessHandle::spawn("sh", &[], Path::new("/definitely/not/here"))
            .err()
            .expect("spawn to fail");
        assert!(matches!(err, ExecutionError::Spawn { .. }));
    }

    #[tokio::test]
    async fn interrupt_stops_cooperative_process() {
        let (mut handle, _pipes) = sh("sleep 30");
        let (status, step) = handle.escalate(&fast_policy()).await.unwrap();
        assert_eq!(step, Some(EscalationStep::Interrupt));
        assert!(!status.success());
    }

    #[tokio::test]
    async fn ignored_interrupt_escalates_to_terminate() {
        let (mut handle, _pipes) = sh("trap '' INT; sleep 30");
        let (status, step) = handle.escalate(&fast_policy()).await.unwrap();
        assert_eq!(step, Some(EscalationStep::Terminate));
        assert_eq!(exit_code(&status), Some(-libc::SIGTERM));
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_within_budget() {
        let (mut handle, _pipes) = sh("trap '' INT TERM; sleep 30");
        let started = Instant::now();
        let (status, step) = handle.escalate(&fast_policy()).await.unwrap();
        assert_eq!(step, Some(EscalationStep::Kill));
        assert_eq!(exit_code(&status), Some(-libc::SIGKILL));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn escalation_reaches_grandchildren() {
        let (mut handle, pipes) = sh("sleep 30 & echo $!; wait");
        let mut lines = tokio::io::BufReader::new(pipes.stdout).lines();
        let grandchild: u32 = lines
            .next_line()
            .await
            .unwrap()
            .expect("grandchild pid")
            .trim()
            .parse()
            .unwrap();
        assert!(is_alive(grandchild));

        handle.escalate(&fast_policy()).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while is_alive(grandchild) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!is_alive(grandchild));
    }

    #[tokio::test]
    async fn escalating_an_exited_process_reports_no_step() {
        let (mut handle, _pipes) = sh("exit 3");
        let status = handle.wait().await.unwrap();
        assert_eq!(exit_code(&status), Some(3));

        let (status, step) = handle.escalate(&fast_policy()).await.unwrap();
        assert_eq!(step, None);
        assert_eq!(exit_code(&status), Some(3));
    }
}
