use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder replaced by the full prompt (always a single argv element)
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Placeholder replaced by the configured model
pub const MODEL_PLACEHOLDER: &str = "{model}";

const DEFAULT_COMMAND_ARGS: &[&str] = &["-y", "-a", "-p", PROMPT_PLACEHOLDER, "-m", MODEL_PLACEHOLDER];

/// Directory under the work root holding per-root state
pub const STATE_DIR: &str = ".relay";

/// Relay daemon - streams external command turns over a websocket
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
pub struct Args {
    /// Bind address
    #[arg(long, env = "RELAY_LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: String,

    /// External command run once per prompt
    #[arg(long = "command", env = "GEMINI_PATH", default_value = "gemini")]
    pub command: String,

    /// Model passed to the external command
    #[arg(long, env = "GEMINI_MODEL", default_value = "gemini-2.5-flash")]
    pub model: String,

    /// Argument template for the external command (repeatable).
    /// `{prompt}` and `{model}` are substituted.
    #[arg(long = "command-arg", allow_hyphen_values = true)]
    pub command_args: Vec<String>,

    /// Work root (falls back to OUTPUT_DIR, then the current directory)
    #[arg(long, env = "GENERATIONS_DIR")]
    pub work_root: Option<PathBuf>,

    /// Upper bound on shutdown cleanup, in seconds
    #[arg(long, env = "RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

impl Args {
    pub fn work_root(&self) -> PathBuf {
        self.work_root
            .clone()
            .or_else(|| std::env::var_os("OUTPUT_DIR").map(PathBuf::from))
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn command_template(&self) -> CommandTemplate {
        let args: Vec<String> = if self.command_args.is_empty() {
            DEFAULT_COMMAND_ARGS.iter().map(|a| a.to_string()).collect()
        } else {
            self.command_args.clone()
        };

        CommandTemplate::new(
            self.command.clone(),
            args.into_iter().map(|a| a.replace(MODEL_PLACEHOLDER, &self.model)),
        )
    }
}

/// Program plus argument template for one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Render the argv for a prompt. Only arguments that are exactly the
    /// placeholder are replaced, so the prompt never gets split or re-quoted.
    pub fn render(&self, prompt: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                if arg == PROMPT_PLACEHOLDER {
                    prompt.to_string()
                } else {
                    arg.clone()
                }
            })
            .collect()
    }
}
