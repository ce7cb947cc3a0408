//! flowforge - execution-control plane for long-running AI and
//! automation jobs.
//!
//! `flowforge run -- <cmd>` supervises a command with the monitor and
//! control plane attached; `flowforge demo` shows the runaway/recovery
//! loop end to end; `flowforge daemon` manages a background instance.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// flowforge - supervise long-running jobs with a local control plane.
#[derive(Parser, Debug)]
#[command(name = "flowforge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Supervise a command: `flowforge run -- python3 worker.py`.
    Run {
        /// Control-plane port on loopback.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// CPU percent threshold for the watchdog.
        #[arg(long, default_value = "90.0")]
        max_cpu: f64,

        /// Seconds CPU must stay above the threshold before acting.
        #[arg(long, default_value = "10")]
        cpu_window_secs: u64,

        /// Monitor polling interval in milliseconds.
        #[arg(long, default_value = "1000")]
        poll_ms: u64,

        /// Workload label stamped on incidents.
        #[arg(long, default_value = "worker")]
        model_name: String,

        /// Command and arguments to supervise (after `--`).
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Run a self-contained runaway/recovery demonstration.
    Demo {
        /// CPU threshold used to trigger runaway handling.
        #[arg(long, default_value = "30.0")]
        max_cpu: f64,

        /// Monitor polling interval in milliseconds.
        #[arg(long, default_value = "250")]
        poll_ms: u64,
    },

    /// Manage a background control-plane instance.
    #[command(subcommand)]
    Daemon(DaemonCommands),
}

#[derive(Subcommand, Debug)]
enum DaemonCommands {
    /// Start the daemon in the background.
    Start {
        /// Control-plane port on loopback.
        #[arg(long, default_value = "8080")]
        port: u16,
    },

    /// Stop the background daemon.
    Stop,

    /// Report daemon status.
    Status {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Tail the daemon log file.
    Logs {
        /// Number of lines to show.
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Follow mode (stream new lines).
        #[arg(short, long)]
        follow: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Run {
            port,
            max_cpu,
            cpu_window_secs,
            poll_ms,
            model_name,
            command,
        } => commands::run::run(commands::run::RunOptions {
            port,
            max_cpu,
            cpu_window_secs,
            poll_ms,
            model_name,
            command,
        }),
        Commands::Demo { max_cpu, poll_ms } => commands::demo::run(max_cpu, poll_ms),
        Commands::Daemon(daemon_command) => match daemon_command {
            DaemonCommands::Start { port } => commands::daemon::start(port),
            DaemonCommands::Stop => commands::daemon::stop(),
            DaemonCommands::Status { json } => commands::daemon::status(json),
            DaemonCommands::Logs { lines, follow } => commands::daemon::logs(lines, follow),
        },
    }
}
