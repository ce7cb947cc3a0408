//! `flowforge run -- <cmd> [args…]`
//!
//! Composes the full stack around one supervised command: ledger,
//! process state, lifecycle actor, a monitor per spawned child, and the
//! HTTP control plane on loopback. SIGINT/SIGTERM tear the child tree
//! down before the process exits. The exit code reflects the outcome:
//! zero for a normal completion or operator stop, non-zero when policy
//! killed the run or the teardown failed.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use flowforge_core::config::Config;
use flowforge_core::crypto::EncryptionPolicy;
use flowforge_core::ledger::Ledger;
use flowforge_core::lifecycle::{
    LifecycleConfig, LifecycleHandle, LifecycleManager, OpContext, SpawnObserver,
};
use flowforge_core::monitor::{MonitorConfig, spawn_monitor};
use flowforge_core::policy::{PolicyThresholds, RolloutMode};
use flowforge_core::redact::Redactor;
use flowforge_core::state::{LifecyclePhase, ProcessStateHandle, WorkerStatus};
use flowforge_core::supervisor::ChildSpec;
use flowforge_daemon::AppState;
use tracing::info;
use uuid::Uuid;

/// Options for the run command.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Control-plane port.
    pub port: u16,
    /// CPU threshold percent.
    pub max_cpu: f64,
    /// Sustained-CPU window seconds.
    pub cpu_window_secs: u64,
    /// Monitor tick milliseconds.
    pub poll_ms: u64,
    /// Workload label.
    pub model_name: String,
    /// Command and arguments.
    pub command: Vec<String>,
}

/// Entry point for `flowforge run`.
pub fn run(options: RunOptions) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to create runtime")?;
    let exit_code = runtime.block_on(run_async(options))?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

async fn run_async(options: RunOptions) -> Result<i32> {
    let Some((command, args)) = options.command.split_first() else {
        bail!("no command given; usage: flowforge run -- <cmd> [args…]");
    };

    let config = Config::from_env();
    let encryption = EncryptionPolicy::from_master_key(config.master_key.as_deref())
        .context("invalid FLOWFORGE_MASTER_KEY")?;
    if !encryption.is_sealed() {
        info!("no FLOWFORGE_MASTER_KEY set; ledger columns stored as sanitized plaintext");
    }
    let ledger = Arc::new(
        Ledger::open(&config.db_path, encryption, Redactor::new())
            .with_context(|| format!("failed to open ledger at {}", config.db_path.display()))?,
    );
    ledger.set_run_id(&format!("run-{}", Uuid::new_v4()));

    let process_state = ProcessStateHandle::new();
    let monitor_config = MonitorConfig {
        tick: Duration::from_millis(options.poll_ms.max(50)),
        window_lines: 10,
        thresholds: PolicyThresholds {
            max_cpu_percent: options.max_cpu,
            cpu_window: Duration::from_secs(options.cpu_window_secs.max(1)),
            ..PolicyThresholds::default()
        },
        rollout_mode: RolloutMode::Enforce,
        model_name: options.model_name.clone(),
    };

    // The observer needs the lifecycle handle, which does not exist
    // until the actor is spawned; a OnceLock breaks the cycle.
    let handle_cell: Arc<OnceLock<LifecycleHandle>> = Arc::new(OnceLock::new());
    let observer: SpawnObserver = {
        let ledger = ledger.clone();
        let process_state = process_state.clone();
        let handle_cell = handle_cell.clone();
        let monitor_config = monitor_config.clone();
        Arc::new(move |supervisor| {
            if let Some(lifecycle) = handle_cell.get() {
                spawn_monitor(
                    monitor_config.clone(),
                    ledger.clone(),
                    process_state.clone(),
                    lifecycle.clone(),
                    supervisor,
                    Redactor::new(),
                );
            }
        })
    };

    let lifecycle = LifecycleManager::new(
        LifecycleConfig::default(),
        ledger.clone(),
        process_state.clone(),
        Some(observer),
    )
    .spawn();
    let _ = handle_cell.set(lifecycle.clone());

    lifecycle
        .register_spec(ChildSpec::new(command.clone(), args.to_vec()))
        .await;
    let started = lifecycle
        .request_start(OpContext::operator("flowforge run", "", "cli"))
        .await;
    if started.pid == 0 {
        bail!("failed to start '{command}': {:?}", started.error_kind);
    }
    info!(pid = started.pid, %command, "supervising");

    // Control plane in the background for the lifetime of the run.
    let app = AppState::new(config, ledger.clone(), process_state.clone(), lifecycle.clone());
    let port = options.port;
    tokio::spawn(async move {
        if let Err(err) = flowforge_daemon::serve(app, port, std::future::pending()).await {
            tracing::warn!(%err, "control plane exited");
        }
    });

    // Signal trap: graceful teardown through the lifecycle actor.
    let trap_lifecycle = lifecycle.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        info!("signal received, stopping worker");
        trap_lifecycle
            .request_stop(OpContext::operator("terminal signal", "", "cli"))
            .await;
    });

    // Wait for the run to end, however it ends.
    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let control = lifecycle.snapshot().await;
        match control.phase {
            LifecyclePhase::Stopped | LifecyclePhase::Failed => break,
            _ => {}
        }
    }

    let snap = process_state.snapshot();
    let exit_code = match snap.status {
        WorkerStatus::LoopDetected
        | WorkerStatus::SafetyLimitExceeded
        | WorkerStatus::Failed
        | WorkerStatus::CommandFailure => 1,
        _ => i32::from(lifecycle.snapshot().await.phase == LifecyclePhase::Failed),
    };
    info!(status = %snap.status, exit_code, "run finished");
    Ok(exit_code)
}
