//! `flowforge demo` — deterministic runaway/recovery demonstration.
//!
//! 1. launches a runaway shell loop,
//! 2. detects it via sustained CPU,
//! 3. terminates the whole group,
//! 4. starts a healthy worker,
//! 5. prints an outcome summary.
//!
//! The demo writes real evidence: a decision trace, an `AUTO_KILL`
//! audit, and a `LOOP_DETECTED` incident, all correlated through one
//! incident id.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flowforge_core::config::Config;
use flowforge_core::crypto::EncryptionPolicy;
use flowforge_core::ledger::{Ledger, NewIncident};
use flowforge_core::policy::{RolloutMode, confidence_score, current_engine_contract};
use flowforge_core::procstat::{ProcSampler, process_exists};
use flowforge_core::redact::Redactor;
use flowforge_core::supervisor::{ChildSpec, Supervisor};
use uuid::Uuid;

/// Runaway workload: a busy loop emitting one repeating line.
const RUNAWAY_SCRIPT: &str =
    "while true; do echo 'processing request 4242 failed, retrying endlessly'; done";

/// Healthy workload: progressing step output.
const RECOVERED_SCRIPT: &str =
    "i=0; while true; do i=$((i+1)); echo \"progress step=$i phase=compute\"; sleep 1; done";

/// Hard cap on the detection window.
const DETECTION_DEADLINE: Duration = Duration::from_secs(15);

/// Entry point for `flowforge demo`.
pub fn run(max_cpu: f64, poll_ms: u64) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to create runtime")?;
    runtime.block_on(run_async(max_cpu, poll_ms.max(50)))
}

async fn run_async(max_cpu: f64, poll_ms: u64) -> Result<()> {
    let config = Config::from_env();
    let encryption = EncryptionPolicy::from_master_key(config.master_key.as_deref())
        .context("invalid FLOWFORGE_MASTER_KEY")?;
    let ledger = Arc::new(
        Ledger::open(&config.db_path, encryption, Redactor::new())
            .with_context(|| format!("failed to open ledger at {}", config.db_path.display()))?,
    );
    ledger.set_run_id(&format!("demo-{}", Uuid::new_v4()));

    println!("[Demo] Starting a broken worker...");
    let started_at = tokio::time::Instant::now();
    let broken = Supervisor::start(ChildSpec::new(
        "sh",
        vec!["-c".to_string(), RUNAWAY_SCRIPT.to_string()],
    ))
    .context("start broken worker")?;
    let pid = broken.pid();

    let mut sampler = ProcSampler::new(pid);
    let mut peak_cpu: f64 = 0.0;
    let mut consecutive_above = 0u32;
    let mut detected_reason = String::new();
    // Warm-up sample so the first delta is meaningful.
    let _ = sampler.sample_cpu_percent();

    let mut ticker = tokio::time::interval(Duration::from_millis(poll_ms));
    loop {
        ticker.tick().await;
        let Ok(cpu) = sampler.sample_cpu_percent() else {
            break;
        };
        peak_cpu = peak_cpu.max(cpu);
        if cpu > max_cpu {
            consecutive_above += 1;
        } else {
            consecutive_above = 0;
        }
        if consecutive_above >= 2 {
            detected_reason = format!(
                "CPU stayed above {max_cpu:.1}% for {consecutive_above} consecutive samples"
            );
            break;
        }
        if started_at.elapsed() > DETECTION_DEADLINE {
            detected_reason = "runaway behavior persisted during the demo window".to_string();
            break;
        }
    }
    let detected_after = started_at.elapsed();

    let reason = format!("demo runaway: {detected_reason}");
    let cpu_score = (peak_cpu / max_cpu * 100.0).min(100.0);
    let entropy_score = 5.0;
    let confidence = confidence_score(cpu_score, entropy_score);
    let command_line = format!("sh -c '{RUNAWAY_SCRIPT}'");
    let incident_id = Uuid::new_v4().to_string();
    let contract = current_engine_contract(RolloutMode::Enforce);

    // Trace first, then the audit, then the incident.
    {
        let ledger = ledger.clone();
        let command_line = command_line.clone();
        let reason = reason.clone();
        let incident_id = incident_id.clone();
        let written = tokio::task::spawn_blocking(
            move || -> Result<(), flowforge_core::ledger::LedgerError> {
                ledger.log_decision_trace(
                    &command_line,
                    pid,
                    cpu_score,
                    entropy_score,
                    confidence,
                    "KILL",
                    &reason,
                    &incident_id,
                    "",
                    &contract,
                )?;
                ledger.log_audit(
                    "flowforge-demo",
                    "AUTO_KILL",
                    &reason,
                    "demo",
                    pid,
                    &command_line,
                    &incident_id,
                    "",
                )?;
                ledger.log_incident(NewIncident {
                    command: command_line.clone(),
                    model_name: "demo".to_string(),
                    exit_reason: "LOOP_DETECTED".to_string(),
                    max_cpu: peak_cpu,
                    pattern: "processing request 4242 failed, retrying endlessly".to_string(),
                    token_savings_estimate: detected_after.as_secs_f64() * 25.0,
                    reason: reason.clone(),
                    cpu_score,
                    entropy_score,
                    confidence_score: confidence,
                    recovery_status: "restarting".to_string(),
                    restart_count: 1,
                    incident_id: incident_id.clone(),
                    request_id: String::new(),
                })?;
                Ok(())
            },
        )
        .await
        .context("demo evidence task")?;
        written.context("write demo evidence")?;
    }

    broken
        .stop(Duration::from_secs(2))
        .await
        .context("terminate runaway group")?;

    println!("[Demo] Restarting a healthy worker...");
    let healthy = Supervisor::start(ChildSpec::new(
        "sh",
        vec!["-c".to_string(), RECOVERED_SCRIPT.to_string()],
    ))
    .context("restart healthy worker")?;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let recovered = process_exists(healthy.pid());
    if recovered {
        let ledger = ledger.clone();
        let healthy_pid = healthy.pid();
        let _ = tokio::task::spawn_blocking(move || {
            ledger.log_audit(
                "flowforge-demo",
                "AUTO_RESTART",
                "restarted with healthy worker profile",
                "demo",
                healthy_pid,
                "sh -c progress loop",
                "",
                "",
            )
        })
        .await;
    }
    healthy
        .stop(Duration::from_secs(2))
        .await
        .context("stop healthy worker")?;

    println!();
    println!("Runaway detected in {:.1} seconds", detected_after.as_secs_f64());
    println!("CPU peaked at {peak_cpu:.1}%");
    if recovered {
        println!("Process recovered");
    } else {
        println!("Process recovery failed");
    }
    Ok(())
}
