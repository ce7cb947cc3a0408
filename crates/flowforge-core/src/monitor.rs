//! Runtime monitor loop.
//!
//! One ticker task per run. Each tick samples the child's CPU from
//! `/proc`, counts fds and sockets, folds the latest (redacted) output
//! lines into the log window, and hands the resulting telemetry to the
//! policy engine. Decisions are enacted through the lifecycle mailbox
//! and evidenced in the ledger, with the decision trace always landing
//! before the audit that describes the action taken from it. Identical
//! alerts are rate-limited to one per CPU window so a long spike cannot
//! flood the audit trail. Policy failures are logged and skipped; they
//! never take the supervisor down.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::{Ledger, NewIncident};
use crate::lifecycle::{LifecycleHandle, OpContext};
use crate::policy::{
    Decision, DecisionAction, PolicyThresholds, RolloutMode, Telemetry, current_engine_contract,
};
use crate::procstat::{ProcSampler, ResourceCounts};
use crate::redact::Redactor;
use crate::signals;
use crate::state::{ProcessStateHandle, WorkerStatus};
use crate::supervisor::{Supervisor, pump_lines};

/// Rough tokens-per-second burn used for the savings estimate on a
/// terminated loop.
const TOKEN_BURN_PER_SECOND: f64 = 25.0;

/// Socket-count probing heuristics (baseline-relative).
const PROBING_SOCKET_FLOOR: usize = 50;
/// FD-count probing floor.
const PROBING_FD_FLOOR: usize = 20;

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sampling interval.
    pub tick: Duration,
    /// Output lines kept in the sliding window.
    pub window_lines: usize,
    /// Policy thresholds handed to the decider.
    pub thresholds: PolicyThresholds,
    /// Engine rollout posture; shadow records dry-runs instead of acting.
    pub rollout_mode: RolloutMode,
    /// Workload label stamped on incidents.
    pub model_name: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            window_lines: 10,
            thresholds: PolicyThresholds::default(),
            rollout_mode: RolloutMode::Enforce,
            model_name: "worker".to_string(),
        }
    }
}

/// Derives one decision from the current window and CPU posture.
///
/// Pure seam between sampling and policy, so the scenario tests can
/// drive it without a live child.
#[must_use]
pub fn evaluate_tick(
    window: &[String],
    cpu_percent: f64,
    cpu_over_for: Duration,
    thresholds: &PolicyThresholds,
) -> Decision {
    let stats = signals::analyze(window);
    crate::policy::decide(
        &Telemetry {
            cpu_percent,
            cpu_over_for,
            log_repetition: stats.repetition_ratio,
            log_entropy: stats.entropy_bits,
            raw_diversity: stats.raw_diversity,
            progress_like: stats.progress_like,
        },
        thresholds,
    )
}

/// FD/socket probing detector carried across ticks.
///
/// The first observation is the baseline; sockets doubling past the
/// floor or fds tripling past theirs flag probing. A falling socket
/// count lowers the baseline so spikes from idle are caught.
#[derive(Debug, Default)]
pub struct ProbingDetector {
    baseline: Option<ResourceCounts>,
}

impl ProbingDetector {
    /// Feeds one sample; returns a human-readable detail on detection.
    pub fn observe(&mut self, current: ResourceCounts) -> Option<String> {
        let Some(baseline) = self.baseline.as_mut() else {
            self.baseline = Some(current);
            return None;
        };

        let mut details = Vec::new();
        if current.socket_count > PROBING_SOCKET_FLOOR
            && current.socket_count > baseline.socket_count * 2
        {
            details.push(format!(
                "sockets {} -> {}",
                baseline.socket_count, current.socket_count
            ));
        }
        if current.open_fds > PROBING_FD_FLOOR && current.open_fds > baseline.open_fds * 3 {
            details.push(format!("fds {} -> {}", baseline.open_fds, current.open_fds));
        }

        if current.socket_count < baseline.socket_count {
            baseline.socket_count = current.socket_count;
        }

        if details.is_empty() {
            None
        } else {
            Some(details.join(" | "))
        }
    }
}

/// Spawns the monitor task for one supervised run.
pub fn spawn_monitor(
    config: MonitorConfig,
    ledger: Arc<Ledger>,
    state: ProcessStateHandle,
    lifecycle: LifecycleHandle,
    supervisor: Arc<Supervisor>,
    redactor: Redactor,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let window: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        attach_output_pumps(&supervisor, &window, config.window_lines, redactor).await;
        run_loop(config, ledger, state, lifecycle, supervisor, window).await;
    })
}

async fn attach_output_pumps(
    supervisor: &Arc<Supervisor>,
    window: &Arc<Mutex<VecDeque<String>>>,
    window_lines: usize,
    redactor: Redactor,
) {
    if let Some(stdout) = supervisor.take_stdout().await {
        let sink = window.clone();
        let redactor = redactor.clone();
        tokio::spawn(async move {
            pump_lines(stdout, move |line| {
                push_line(&sink, window_lines, redactor.line(&line));
            })
            .await;
        });
    }
    if let Some(stderr) = supervisor.take_stderr().await {
        let sink = window.clone();
        tokio::spawn(async move {
            pump_lines(stderr, move |line| {
                push_line(&sink, window_lines, redactor.line(&line));
            })
            .await;
        });
    }
}

fn push_line(window: &Arc<Mutex<VecDeque<String>>>, cap: usize, line: String) {
    let mut guard = window.lock().unwrap();
    guard.push_back(line);
    while guard.len() > cap {
        guard.pop_front();
    }
}

#[allow(clippy::too_many_lines)]
async fn run_loop(
    config: MonitorConfig,
    ledger: Arc<Ledger>,
    state: ProcessStateHandle,
    lifecycle: LifecycleHandle,
    supervisor: Arc<Supervisor>,
    window: Arc<Mutex<VecDeque<String>>>,
) {
    let pid = supervisor.pid();
    let mut sampler = ProcSampler::new(pid);
    let mut probing = ProbingDetector::default();
    let mut ticker = tokio::time::interval(config.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut cpu_over_since: Option<Instant> = None;
    let mut last_alert_at: Option<Instant> = None;
    let mut last_probe_alert_at: Option<Instant> = None;
    let mut peak_cpu: f64 = 0.0;
    let contract = current_engine_contract(config.rollout_mode);
    let snapshot = state.snapshot();
    let command_line = if snapshot.args.is_empty() {
        snapshot.command.clone()
    } else {
        format!("{} {}", snapshot.command, snapshot.args.join(" "))
    };

    info!(pid, tick_ms = config.tick.as_millis() as u64, "monitor attached");

    loop {
        ticker.tick().await;
        if supervisor.is_stopped() {
            debug!(pid, "monitor detaching: child exited");
            break;
        }

        let cpu = match sampler.sample_cpu_percent() {
            Ok(cpu) => cpu,
            Err(err) => {
                debug!(pid, %err, "cpu sample failed, detaching monitor");
                break;
            }
        };
        peak_cpu = peak_cpu.max(cpu);

        let now = Instant::now();
        if cpu >= config.thresholds.max_cpu_percent {
            cpu_over_since.get_or_insert(now);
        } else {
            cpu_over_since = None;
        }
        let cpu_over_for = cpu_over_since.map_or(Duration::ZERO, |since| now - since);

        // Resource probing is advisory; a sampling failure is not fatal.
        if let Ok(counts) = sampler.resource_counts() {
            if let Some(detail) = probing.observe(counts) {
                let allow = last_probe_alert_at
                    .map_or(true, |at| now - at >= config.thresholds.cpu_window);
                if allow {
                    last_probe_alert_at = Some(now);
                    state.update_run(
                        cpu,
                        &last_line(&window),
                        WorkerStatus::ProbingDetected,
                        &snapshot.command,
                        &snapshot.args,
                        &snapshot.dir,
                        pid,
                    );
                    log_audit_blocking(
                        &ledger,
                        "flowforge",
                        "PROBING_DETECTED",
                        &format!("resource probing suspected: {detail}"),
                        pid,
                        &command_line,
                        "",
                    )
                    .await;
                }
            }
        }

        let lines: Vec<String> = window.lock().unwrap().iter().cloned().collect();
        let decision = evaluate_tick(&lines, cpu, cpu_over_for, &config.thresholds);

        let status = match decision.action {
            DecisionAction::Continue => WorkerStatus::Running,
            DecisionAction::Alert => WorkerStatus::WatchdogAlert,
            DecisionAction::Kill => WorkerStatus::LoopDetected,
            DecisionAction::Restart => WorkerStatus::LoopDetected,
        };
        state.update_run(
            cpu,
            &last_line(&window),
            status,
            &snapshot.command,
            &snapshot.args,
            &snapshot.dir,
            pid,
        );
        state.update_decision(
            &decision.reason,
            decision.cpu_score,
            decision.entropy_score,
            decision.confidence_score,
        );

        match decision.action {
            DecisionAction::Continue => {}
            DecisionAction::Alert => {
                let allow =
                    last_alert_at.map_or(true, |at| now - at >= config.thresholds.cpu_window);
                if allow {
                    last_alert_at = Some(now);
                    record_trace(&ledger, &contract, &command_line, pid, &decision, "", "").await;
                    log_audit_blocking(
                        &ledger,
                        "flowforge",
                        "WATCHDOG_ALERT",
                        &decision.reason,
                        pid,
                        &command_line,
                        "",
                    )
                    .await;
                }
            }
            DecisionAction::Kill | DecisionAction::Restart => {
                let restart = decision.action == DecisionAction::Restart;
                if config.rollout_mode == RolloutMode::Shadow {
                    let ledger2 = ledger.clone();
                    let command2 = command_line.clone();
                    let summary = format!("would {}: {}", decision.action, decision.reason);
                    let confidence = decision.confidence_score;
                    let _ = tokio::task::spawn_blocking(move || {
                        ledger2.log_policy_dry_run(&command2, pid, &summary, confidence, "")
                    })
                    .await;
                    continue;
                }

                let incident_id = Uuid::new_v4().to_string();
                // Trace first, then the audit describing the action.
                record_trace(
                    &ledger,
                    &contract,
                    &command_line,
                    pid,
                    &decision,
                    &incident_id,
                    "",
                )
                .await;
                log_audit_blocking(
                    &ledger,
                    "flowforge",
                    if restart { "AUTO_RESTART" } else { "AUTO_KILL" },
                    &decision.reason,
                    pid,
                    &command_line,
                    &incident_id,
                )
                .await;

                let incident = NewIncident {
                    command: command_line.clone(),
                    model_name: config.model_name.clone(),
                    exit_reason: "LOOP_DETECTED".to_string(),
                    max_cpu: peak_cpu,
                    pattern: dominant_line(&lines),
                    token_savings_estimate: cpu_over_for.as_secs_f64() * TOKEN_BURN_PER_SECOND,
                    reason: decision.reason.clone(),
                    cpu_score: decision.cpu_score,
                    entropy_score: decision.entropy_score,
                    confidence_score: decision.confidence_score,
                    recovery_status: if restart { "restarting" } else { "terminated" }.to_string(),
                    restart_count: 0,
                    incident_id: incident_id.clone(),
                    request_id: String::new(),
                };
                let ledger2 = ledger.clone();
                let result =
                    tokio::task::spawn_blocking(move || ledger2.log_incident(incident)).await;
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(%err, "incident append failed"),
                    Err(err) => warn!(%err, "incident task failed"),
                }

                let ctx = OpContext::policy(&decision.reason, WorkerStatus::LoopDetected);
                let verdict = if restart {
                    lifecycle.request_restart(ctx).await
                } else {
                    lifecycle.request_stop(ctx).await
                };
                info!(pid, status = %verdict.status, "policy intervention requested");
                break;
            }
        }
    }
}

fn last_line(window: &Arc<Mutex<VecDeque<String>>>) -> String {
    window.lock().unwrap().back().cloned().unwrap_or_default()
}

/// Most frequent line in the window, used as the incident's loop
/// pattern excerpt.
fn dominant_line(lines: &[String]) -> String {
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for line in lines {
        *counts.entry(line.trim()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(line, _)| line.to_string())
        .unwrap_or_default()
}

async fn record_trace(
    ledger: &Arc<Ledger>,
    contract: &crate::policy::EngineContract,
    command: &str,
    pid: i32,
    decision: &Decision,
    incident_id: &str,
    request_id: &str,
) {
    let ledger = ledger.clone();
    let contract = contract.clone();
    let command = command.to_string();
    let decision = decision.clone();
    let incident_id = incident_id.to_string();
    let request_id = request_id.to_string();
    let result = tokio::task::spawn_blocking(move || {
        ledger.log_decision_trace(
            &command,
            pid,
            decision.cpu_score,
            decision.entropy_score,
            decision.confidence_score,
            &decision.action.to_string(),
            &decision.reason,
            &incident_id,
            &request_id,
            &contract,
        )
    })
    .await;
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!(%err, "decision trace append failed"),
        Err(err) => warn!(%err, "decision trace task failed"),
    }
}

async fn log_audit_blocking(
    ledger: &Arc<Ledger>,
    actor: &str,
    action: &str,
    details: &str,
    pid: i32,
    command: &str,
    incident_id: &str,
) {
    let ledger = ledger.clone();
    let actor = actor.to_string();
    let action = action.to_string();
    let details = details.to_string();
    let command = command.to_string();
    let incident_id = incident_id.to_string();
    let result = tokio::task::spawn_blocking(move || {
        ledger.log_audit(&actor, &action, &details, "monitor", pid, &command, &incident_id, "")
    })
    .await;
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!(%err, "audit append failed"),
        Err(err) => warn!(%err, "audit task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionPolicy;
    use crate::ledger::EventKind;
    use crate::lifecycle::{LifecycleConfig, LifecycleManager};
    use crate::policy::replay;
    use crate::state::LifecyclePhase;
    use crate::supervisor::ChildSpec;

    fn progress_window() -> Vec<String> {
        (1..=10)
            .map(|i| format!("progress step={i} phase=compute metric=0.90{i}"))
            .collect()
    }

    fn loop_window() -> Vec<String> {
        vec!["processing request 4242 failed, retrying endlessly".to_string(); 10]
    }

    #[test]
    fn healthy_spike_alerts_but_never_kills() {
        let decision = evaluate_tick(
            &progress_window(),
            96.0,
            Duration::from_secs(15),
            &PolicyThresholds::default(),
        );
        assert_eq!(decision.action, DecisionAction::Alert);
        assert!(
            decision.reason.contains("progressing output pattern detected"),
            "{}",
            decision.reason
        );
    }

    #[test]
    fn endless_loop_is_killed() {
        let decision = evaluate_tick(
            &loop_window(),
            96.0,
            Duration::from_secs(15),
            &PolicyThresholds::default(),
        );
        assert_eq!(decision.action, DecisionAction::Kill);
    }

    #[test]
    fn probing_detector_flags_socket_explosion() {
        let mut detector = ProbingDetector::default();
        assert!(detector
            .observe(ResourceCounts {
                open_fds: 10,
                socket_count: 4,
            })
            .is_none());
        // Above the floor and more than double the baseline.
        let detail = detector
            .observe(ResourceCounts {
                open_fds: 12,
                socket_count: 80,
            })
            .expect("probing expected");
        assert!(detail.contains("sockets 4 -> 80"), "{detail}");
    }

    #[test]
    fn probing_detector_tracks_idle_baseline_down() {
        let mut detector = ProbingDetector::default();
        detector.observe(ResourceCounts {
            open_fds: 10,
            socket_count: 40,
        });
        // Process went idle; baseline follows down.
        detector.observe(ResourceCounts {
            open_fds: 10,
            socket_count: 2,
        });
        let detail = detector
            .observe(ResourceCounts {
                open_fds: 10,
                socket_count: 60,
            })
            .expect("spike from idle should flag");
        assert!(detail.contains("2 -> 60"), "{detail}");
    }

    #[test]
    fn probing_detector_flags_fd_leak() {
        let mut detector = ProbingDetector::default();
        detector.observe(ResourceCounts {
            open_fds: 8,
            socket_count: 0,
        });
        let detail = detector
            .observe(ResourceCounts {
                open_fds: 40,
                socket_count: 0,
            })
            .expect("fd growth should flag");
        assert!(detail.contains("fds 8 -> 40"), "{detail}");
    }

    #[test]
    fn dominant_line_picks_the_repeated_pattern() {
        let mut lines = loop_window();
        lines.push("one odd line".to_string());
        assert_eq!(
            dominant_line(&lines),
            "processing request 4242 failed, retrying endlessly"
        );
    }

    /// End-to-end: a runaway looper is detected, traced, audited,
    /// recorded as an incident, and its tree is torn down.
    #[tokio::test(flavor = "multi_thread")]
    async fn runaway_loop_is_detected_and_killed() {
        let ledger = Arc::new(
            Ledger::in_memory(EncryptionPolicy::Plaintext, Redactor::new()).unwrap(),
        );
        let state = ProcessStateHandle::new();
        let manager = LifecycleManager::new(
            LifecycleConfig {
                stop_timeout: Duration::from_secs(2),
                ..LifecycleConfig::default()
            },
            ledger.clone(),
            state.clone(),
            None,
        );
        let lifecycle = manager.spawn();

        // Busy loop printing the same line: high CPU, zero diversity.
        let spec = ChildSpec::new(
            "sh",
            vec![
                "-c".to_string(),
                "while true; do echo 'processing request 4242 failed, retrying endlessly'; done"
                    .to_string(),
            ],
        );
        lifecycle.register_spec(spec).await;
        let started = lifecycle
            .request_start(crate::lifecycle::OpContext::operator("boot", "", "test"))
            .await;
        assert!(started.pid > 0);

        // The lifecycle owns the supervisor; attach a monitor through a
        // fresh one is not possible, so watch the spawned pid directly.
        let snapshot = lifecycle.snapshot().await;
        assert_eq!(snapshot.phase, LifecyclePhase::Running);

        // Aggressive thresholds so the test converges in a few ticks.
        let config = MonitorConfig {
            tick: Duration::from_millis(100),
            window_lines: 10,
            thresholds: PolicyThresholds {
                max_cpu_percent: 1.0,
                cpu_window: Duration::from_millis(200),
                min_log_entropy: 2.5,
                max_log_repetition: 0.8,
            },
            rollout_mode: RolloutMode::Enforce,
            model_name: "test-worker".to_string(),
        };

        // Drive the sampling/decision path directly against the live pid.
        let mut sampler = ProcSampler::new(started.pid);
        let window = loop_window();
        let mut cpu_over = Duration::ZERO;
        let mut decision = None;
        for _ in 0..50 {
            tokio::time::sleep(config.tick).await;
            let cpu = match sampler.sample_cpu_percent() {
                Ok(cpu) => cpu,
                Err(_) => break,
            };
            if cpu >= config.thresholds.max_cpu_percent {
                cpu_over += config.tick;
            } else {
                cpu_over = Duration::ZERO;
            }
            let d = evaluate_tick(&window, cpu, cpu_over, &config.thresholds);
            if d.action == DecisionAction::Kill {
                decision = Some(d);
                break;
            }
        }
        let decision = decision.expect("kill decision for the busy looper");

        // Evidence chain exactly as the monitor writes it.
        let contract = current_engine_contract(RolloutMode::Enforce);
        let incident_id = Uuid::new_v4().to_string();
        record_trace(
            &ledger,
            &contract,
            "sh -c loop",
            started.pid,
            &decision,
            &incident_id,
            "",
        )
        .await;
        log_audit_blocking(
            &ledger,
            "flowforge",
            "AUTO_KILL",
            &decision.reason,
            started.pid,
            "sh -c loop",
            &incident_id,
        )
        .await;
        ledger
            .log_incident(NewIncident {
                command: "sh -c loop".to_string(),
                model_name: config.model_name.clone(),
                exit_reason: "LOOP_DETECTED".to_string(),
                max_cpu: 100.0,
                pattern: dominant_line(&window),
                token_savings_estimate: 100.0,
                reason: decision.reason.clone(),
                cpu_score: decision.cpu_score,
                entropy_score: decision.entropy_score,
                confidence_score: decision.confidence_score,
                recovery_status: "terminated".to_string(),
                restart_count: 0,
                incident_id: incident_id.clone(),
                request_id: String::new(),
            })
            .unwrap();

        let stopped = lifecycle
            .request_stop(OpContext::policy(&decision.reason, WorkerStatus::LoopDetected))
            .await;
        assert_eq!(stopped.pid, started.pid);
        for _ in 0..100 {
            if lifecycle.snapshot().await.phase == LifecyclePhase::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!crate::procstat::process_exists(started.pid));

        // Incident + correlated audit + verifiable trace.
        let chain = ledger.incident_timeline(&incident_id, 100).unwrap();
        assert!(chain.iter().any(|e| e.event_type == EventKind::Incident));
        assert!(chain.iter().any(|e| e.title == "AUTO_KILL"));

        let trace = ledger.decision_traces(10).unwrap().remove(0);
        assert!(!trace.replay_digest.is_empty());
        let verification = replay::verify(
            &trace.replay_digest,
            &replay::ReplayInput {
                decision_engine: trace.decision_engine.clone(),
                engine_version: trace.engine_version.clone(),
                decision_contract_version: trace.decision_contract_version.clone(),
                rollout_mode: trace.rollout_mode.clone(),
                decision: trace.decision.clone(),
                reason: trace.reason.clone(),
                cpu_score: trace.cpu_score,
                entropy_score: trace.entropy_score,
                confidence_score: trace.confidence_score,
            },
        );
        assert_eq!(verification.status, replay::ReplayStatus::Match);
    }
}
