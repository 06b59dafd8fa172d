mod config;
mod connection;
mod error;
mod execution;
mod handlers;
mod process;
mod protocol;
mod registry;
mod state;
mod stream;
mod supervisor;
mod transcript;
mod workspace;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::{Args, STATE_DIR};
use process::EscalationPolicy;
use registry::ConversationRegistry;
use state::DaemonState;
use supervisor::ServerSupervisor;
use transcript::{TranscriptStore, TRANSCRIPT_FILE};
use workspace::Workspace;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Prepare the work root
    let work_root = args.work_root();
    if !work_root.exists() {
        std::fs::create_dir_all(&work_root)
            .with_context(|| format!("failed to create work root {}", work_root.display()))?;
        info!("Created work root: {}", work_root.display());
    }
    info!("Work root: {}", work_root.display());

    let transcripts = TranscriptStore::open(work_root.join(STATE_DIR).join(TRANSCRIPT_FILE)).await;
    info!("Transcripts: {}", transcripts.path().display());

    let command = args.command_template();
    info!("External command: {} {}", command.program, command.args.join(" "));

    // Create shared state
    let registry = ConversationRegistry::new(
        command,
        work_root.clone(),
        EscalationPolicy::default(),
        transcripts,
    );
    let state = Arc::new(DaemonState::new(
        registry,
        ServerSupervisor::default(),
        Workspace::new(work_root),
        args.shutdown_grace(),
    ));

    // Bind TCP listener
    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("Listening on {}", args.listen);

    // Accept loop
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        connection::handle_client(stream, state).await;
                    });
                }
                Err(e) => {
                    error!("Accept error: {e}");
                }
            },
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    state.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
