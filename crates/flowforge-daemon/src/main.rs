//! flowforge-daemon — standalone control-plane binary.
//!
//! Composes the ledger, process state, and lifecycle actor, then serves
//! the HTTP control plane on loopback until SIGINT/SIGTERM. The
//! `flowforge` CLI embeds the same composition for `run` and `daemon`;
//! this binary exists for container images and systemd units that only
//! need the API surface.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use flowforge_core::config::Config;
use flowforge_core::crypto::EncryptionPolicy;
use flowforge_core::ledger::Ledger;
use flowforge_core::lifecycle::{LifecycleConfig, LifecycleManager};
use flowforge_core::redact::Redactor;
use flowforge_core::state::ProcessStateHandle;
use flowforge_daemon::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// FlowForge control-plane daemon.
#[derive(Parser, Debug)]
#[command(name = "flowforge-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to bind on the loopback interface.
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = Config::from_env();
    if config.api_key.is_some() {
        info!("API key authentication enabled for mutating endpoints");
    } else {
        warn!("no FLOWFORGE_API_KEY set; mutating endpoints are blocked");
    }

    let encryption = match EncryptionPolicy::from_master_key(config.master_key.as_deref()) {
        Ok(policy) => policy,
        Err(err) => {
            // A malformed key must never downgrade silently.
            eprintln!("invalid FLOWFORGE_MASTER_KEY: {err}");
            std::process::exit(2);
        }
    };
    if encryption.is_sealed() {
        info!("ledger column encryption enabled");
    } else {
        warn!("no FLOWFORGE_MASTER_KEY set; ledger columns stored as sanitized plaintext");
    }

    let ledger = match Ledger::open(&config.db_path, encryption, Redactor::new()) {
        Ok(ledger) => Arc::new(ledger),
        Err(err) => {
            eprintln!("failed to open ledger at {}: {err}", config.db_path.display());
            std::process::exit(2);
        }
    };

    let process_state = ProcessStateHandle::new();
    let lifecycle = LifecycleManager::new(
        LifecycleConfig::default(),
        ledger.clone(),
        process_state.clone(),
        None,
    )
    .spawn();

    let app = AppState::new(config, ledger, process_state, lifecycle);

    let shutdown = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    };

    flowforge_daemon::serve(app, args.port, shutdown).await?;
    info!("daemon shutdown complete");
    Ok(())
}
