//! clouddeploy: session and automation engine for interactive deployment wizards
//!
//! Runs wizard scripts in a PTY, watches their output for prompts, errors and
//! completion, and exposes a Unix socket tool surface through which an
//! operator (or an AI collaborator) reads output, sends input, proposes
//! command plans and toggles the autopilot.
//!
//! Usage:
//!   clouddeploy --socket /tmp/clouddeploy.sock --workdir ./work -- ./scripts/deploy.sh

// Allow dead code - client helpers and accessors are used by tests only
#![allow(dead_code)]

mod autopilot;
mod detector;
mod distributor;
mod error;
mod plan;
mod policy;
mod protocol;
mod pty;
mod redact;
mod scripts;
mod serializer;
mod session;
mod socket;
mod tools;

use anyhow::{Context, Result};
use autopilot::{AutopilotLimits, YesNoAnswer};
use clap::Parser;
use detector::CustomPatterns;
use protocol::Config;
use pty::PtySize;
use session::SessionEvent;
use socket::SocketServer;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tools::ToolSurface;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Session and automation engine for interactive deployment wizards
#[derive(Parser, Debug)]
#[command(name = "clouddeploy")]
#[command(about = "PTY session and autopilot engine for interactive deployment wizards")]
#[command(version)]
struct Args {
    /// Unix socket path (default: $CLOUDDEPLOY_SOCKET or /tmp/clouddeploy.sock)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Working directory for sessions
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,

    /// Directory searched for deployment scripts (*.sh)
    #[arg(long, default_value = "scripts")]
    scripts_dir: PathBuf,

    /// Characters of output kept for read/context
    #[arg(long, default_value = "12000")]
    tail_chars: usize,

    /// Characters of trailing output the prompt detector considers
    #[arg(long, default_value = "4000")]
    window_chars: usize,

    /// Output chunks buffered per subscriber before dropping
    #[arg(long, default_value = "256")]
    queue_depth: usize,

    /// Milliseconds between SIGTERM and SIGKILL when stopping a session
    #[arg(long, default_value = "2000")]
    stop_grace: u64,

    /// Terminal rows
    #[arg(long, default_value = "40")]
    rows: u16,

    /// Terminal columns
    #[arg(long, default_value = "120")]
    cols: u16,

    /// Limit raw input to ENTER, y/n or a number (default: $CLOUDDEPLOY_STRICT_POLICY)
    #[arg(long)]
    strict_input: bool,

    /// Allow the wizard autopilot to be switched on
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    allow_wizard: bool,

    /// Allow plan auto-approval and execution to be switched on
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    allow_plan_auto: bool,

    /// Answer for yes/no prompts that show no default (y or n)
    #[arg(long, default_value = "n")]
    yes_no_default: YesNoAnswer,

    /// Extra regex marking successful completion (repeatable)
    #[arg(long = "completion-pattern")]
    completion_patterns: Vec<String>,

    /// Extra regex marking a fatal error (repeatable)
    #[arg(long = "error-pattern")]
    error_patterns: Vec<String>,

    /// Extra regex matching a free-text prompt line (repeatable)
    #[arg(long = "prompt-pattern")]
    prompt_patterns: Vec<String>,

    /// Finished plans kept in the plan list
    #[arg(long, default_value = "100")]
    plan_history: usize,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Command to start immediately (after --)
    #[arg(last = true)]
    command: Vec<String>,
}

/// Parse an on/off environment flag
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    let parsed = parse_flag(&value);
    if parsed.is_none() {
        warn!("Ignoring {}={:?}: expected 1/0, true/false, yes/no or on/off", name, value);
    }
    parsed
}

fn build_config(args: &Args) -> Config {
    let socket_path = args.socket.clone().unwrap_or_else(|| {
        std::env::var("CLOUDDEPLOY_SOCKET")
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| Config::default().socket_path)
    });
    let strict_input =
        args.strict_input || env_flag("CLOUDDEPLOY_STRICT_POLICY").unwrap_or(false);

    Config {
        socket_path,
        workdir: args.workdir.clone(),
        scripts_dir: args.scripts_dir.clone(),
        tail_chars: args.tail_chars,
        window_chars: args.window_chars,
        queue_depth: args.queue_depth,
        stop_grace: Duration::from_millis(args.stop_grace),
        size: PtySize {
            rows: args.rows,
            cols: args.cols,
        },
        strict_input,
        autopilot: AutopilotLimits {
            allow_wizard: args.allow_wizard,
            allow_plan_auto: args.allow_plan_auto,
            yes_no_fallback: args.yes_no_default,
        },
        patterns: CustomPatterns {
            completion: args.completion_patterns.clone(),
            error: args.error_patterns.clone(),
            prompt: args.prompt_patterns.clone(),
        },
        plan_history: args.plan_history,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    info!("clouddeploy v{}", env!("CARGO_PKG_VERSION"));

    let config = build_config(&args);
    let socket_path = config.socket_path.clone();
    info!("Socket: {}", socket_path.display());
    info!("Working directory: {}", config.workdir.display());
    if config.strict_input {
        info!("Strict input mode enabled");
    }

    let tools = Arc::new(ToolSurface::new(&config));
    let background = tools.spawn_background();
    let mut session_events = tools.subscribe_sessions();

    // Start socket server
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let socket_server = SocketServer::new(socket_path.clone(), Arc::clone(&tools), shutdown_tx);
    let socket_handle = tokio::spawn(async move {
        if let Err(e) = socket_server.run().await {
            error!("Socket server error: {}", e);
        }
    });

    if !args.command.is_empty() {
        let command = args.command.join(" ");
        info!("Command: {}", command);
        tools
            .start_session(&command, None)
            .await
            .context("Failed to start session")?;
    }

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown requested");
                break;
            }

            _ = sigint.recv() => {
                info!("SIGINT received");
                break;
            }

            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }

            event = session_events.recv() => {
                match event {
                    Ok(SessionEvent::Started { session_id, command, .. }) => {
                        info!("Session {} running: {}", session_id, command);
                    }
                    Ok(SessionEvent::Exited { session_id, exit_code }) => {
                        info!("Session {} exited with code {}", session_id, exit_code);
                    }
                    Ok(SessionEvent::Stopped { session_id }) => {
                        debug!("Session {} stopped", session_id);
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("Missed {} session events", n);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Session event channel closed");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup
    info!("Shutting down...");

    if let Err(e) = tools.stop_session().await {
        warn!("Failed to stop session: {}", e);
    }

    let _ = std::fs::remove_file(&socket_path);

    socket_handle.abort();
    for handle in background {
        handle.abort();
    }

    info!("Goodbye!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        for on in ["1", "true", "YES", " on "] {
            assert_eq!(parse_flag(on), Some(true), "{on}");
        }
        for off in ["0", "False", "no", "off"] {
            assert_eq!(parse_flag(off), Some(false), "{off}");
        }
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_args_build_config() {
        let args = Args::parse_from([
            "clouddeploy",
            "--socket",
            "/tmp/cd-test.sock",
            "--allow-plan-auto",
            "false",
            "--yes-no-default",
            "y",
            "--completion-pattern",
            "ALL GREEN",
            "--",
            "bash",
            "deploy.sh",
        ]);
        let config = build_config(&args);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/cd-test.sock"));
        assert!(config.autopilot.allow_wizard);
        assert!(!config.autopilot.allow_plan_auto);
        assert_eq!(config.autopilot.yes_no_fallback, YesNoAnswer::Yes);
        assert_eq!(config.patterns.completion, vec!["ALL GREEN".to_string()]);
        assert_eq!(config.tail_chars, 12000);
        assert_eq!(args.command, vec!["bash".to_string(), "deploy.sh".to_string()]);
    }
}
