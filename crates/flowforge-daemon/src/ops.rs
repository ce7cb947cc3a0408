//! Decision-intelligence summaries served under `/v1/ops/…`.
//!
//! Two scans run over recent decision traces: replay-integrity health
//! (recompute every digest, bucket the verdicts) and signal-baseline
//! drift (group by engine bucket, compare the latest trace against the
//! baseline mean, escalate breach streaks). The baseline scan persists
//! streak state and, on transitions into or out of at-risk, appends an
//! audit carrying the originating request id. Both also render as
//! Prometheus gauge sections appended to `/metrics`.

use chrono::{SecondsFormat, Utc};
use flowforge_core::config::BaselineTuning;
use flowforge_core::ledger::{DecisionTrace, Ledger, LedgerError, NewEvent, ReplayCacheStats};
use flowforge_core::policy::baseline::{
    self, BASELINE_CONTRACT_VERSION, BaselineSample, BaselineStatus, BucketEvaluation,
    PreviousBucketState,
};
use flowforge_core::policy::replay::{self, REPLAY_CONTRACT_VERSION, ReplayInput, ReplayStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Cap on trace-id lists carried in the replay health summary.
const MAX_LISTED_TRACE_IDS: usize = 20;

// ---------------------------------------------------------------------
// Replay integrity
// ---------------------------------------------------------------------

/// Replay-integrity summary over recent decision traces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayHealthSummary {
    /// Replay contract version.
    pub contract_version: String,
    /// Sample limit used.
    pub limit: usize,
    /// Traces scanned.
    pub scanned: usize,
    /// No mismatches, missing digests, or unreplayable rows.
    pub healthy: bool,
    /// MATCH verdicts.
    pub match_count: usize,
    /// MISMATCH verdicts.
    pub mismatch_count: usize,
    /// MISSING_DIGEST verdicts.
    pub missing_digest_count: usize,
    /// LEGACY_FALLBACK verdicts.
    pub legacy_fallback_count: usize,
    /// NOT_REPLAYABLE verdicts.
    pub unreplayable_count: usize,
    /// mismatch / scanned.
    pub mismatch_ratio: f64,
    /// Scan timestamp.
    pub checked_at: String,
    /// First few mismatching trace ids.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub mismatch_trace_ids: Vec<i64>,
    /// First few digest-less trace ids.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub missing_digest_trace_ids: Vec<i64>,
}

/// Builds the replay input for a stored trace.
#[must_use]
pub fn replay_input_for(trace: &DecisionTrace) -> ReplayInput {
    ReplayInput {
        decision_engine: trace.decision_engine.clone(),
        engine_version: trace.engine_version.clone(),
        decision_contract_version: trace.decision_contract_version.clone(),
        rollout_mode: trace.rollout_mode.clone(),
        decision: trace.decision.clone(),
        reason: trace.reason.clone(),
        cpu_score: trace.cpu_score,
        entropy_score: trace.entropy_score,
        confidence_score: trace.confidence_score,
    }
}

/// Scans recent traces and buckets replay verdicts.
///
/// # Errors
///
/// Fails on ledger errors.
pub fn build_replay_health(
    ledger: &Ledger,
    limit: usize,
) -> Result<ReplayHealthSummary, LedgerError> {
    let traces = ledger.decision_traces(limit)?;
    let mut summary = ReplayHealthSummary {
        contract_version: REPLAY_CONTRACT_VERSION.to_string(),
        limit,
        scanned: traces.len(),
        healthy: false,
        match_count: 0,
        mismatch_count: 0,
        missing_digest_count: 0,
        legacy_fallback_count: 0,
        unreplayable_count: 0,
        mismatch_ratio: 0.0,
        checked_at: now_rfc3339(),
        mismatch_trace_ids: Vec::new(),
        missing_digest_trace_ids: Vec::new(),
    };

    for trace in &traces {
        let verification = replay::verify(&trace.replay_digest, &replay_input_for(trace));
        match verification.status {
            ReplayStatus::Match => summary.match_count += 1,
            ReplayStatus::Mismatch => {
                summary.mismatch_count += 1;
                if summary.mismatch_trace_ids.len() < MAX_LISTED_TRACE_IDS {
                    summary.mismatch_trace_ids.push(trace.id);
                }
            }
            ReplayStatus::MissingDigest => {
                summary.missing_digest_count += 1;
                if summary.missing_digest_trace_ids.len() < MAX_LISTED_TRACE_IDS {
                    summary.missing_digest_trace_ids.push(trace.id);
                }
            }
            ReplayStatus::LegacyFallback => summary.legacy_fallback_count += 1,
            ReplayStatus::NotReplayable => summary.unreplayable_count += 1,
        }
    }

    if summary.scanned > 0 {
        summary.mismatch_ratio = summary.mismatch_count as f64 / summary.scanned as f64;
    }
    summary.healthy = summary.mismatch_count == 0
        && summary.missing_digest_count == 0
        && summary.unreplayable_count == 0;
    Ok(summary)
}

// ---------------------------------------------------------------------
// Signal baseline
// ---------------------------------------------------------------------

/// Lowercase dimension filter for the baseline scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaselineFilter {
    /// Engine name filter.
    #[serde(default)]
    pub engine: String,
    /// Engine version filter.
    #[serde(default)]
    pub engine_version: String,
    /// Rollout mode filter.
    #[serde(default)]
    pub rollout_mode: String,
}

impl BaselineFilter {
    /// Normalizes the filter values to lowercase.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            engine: self.engine.trim().to_ascii_lowercase(),
            engine_version: self.engine_version.trim().to_ascii_lowercase(),
            rollout_mode: self.rollout_mode.trim().to_ascii_lowercase(),
        }
    }

    fn matches(&self, trace: &DecisionTrace) -> bool {
        let engine = trace.decision_engine.trim().to_ascii_lowercase();
        let version = trace.engine_version.trim().to_ascii_lowercase();
        let rollout = trace.rollout_mode.trim().to_ascii_lowercase();
        (self.engine.is_empty() || engine == self.engine)
            && (self.engine_version.is_empty() || version == self.engine_version)
            && (self.rollout_mode.is_empty() || rollout == self.rollout_mode)
    }
}

/// Threshold echo carried in the summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineThresholds {
    /// CPU-score delta threshold.
    pub cpu_delta: f64,
    /// Entropy-score delta threshold.
    pub entropy_delta: f64,
    /// Confidence-score delta threshold.
    pub confidence_delta: f64,
}

/// Guardrail echo carried in the summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineGuardrails {
    /// Minimum baseline samples before drift logic applies.
    pub min_baseline_samples: usize,
    /// Consecutive breaches required for at-risk.
    pub required_consecutive_breaches: usize,
}

/// Build options for the baseline scan.
#[derive(Debug, Clone, Default)]
pub struct BaselineBuildOptions {
    /// Persist updated streak state.
    pub persist_state: bool,
    /// Append audits for at-risk transitions.
    pub emit_audit_transitions: bool,
    /// Request id to stamp on audits.
    pub request_id: String,
}

/// Grouped signal-baseline summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineSummary {
    /// Baseline contract version.
    pub contract_version: String,
    /// Sample limit used.
    pub limit: usize,
    /// Traces scanned after filtering.
    pub scanned: usize,
    /// Bucket count.
    pub bucket_count: usize,
    /// At-risk buckets.
    pub at_risk_bucket_count: usize,
    /// Pending buckets.
    pub pending_bucket_count: usize,
    /// Insufficient-history buckets.
    pub insufficient_history_bucket_count: usize,
    /// Status transitions observed in this evaluation.
    pub transition_count: usize,
    /// Max |cpu delta| across buckets.
    pub max_cpu_delta_abs: f64,
    /// Max |entropy delta| across buckets.
    pub max_entropy_delta_abs: f64,
    /// Max |confidence delta| across buckets.
    pub max_confidence_delta_abs: f64,
    /// No bucket at risk.
    pub healthy: bool,
    /// Scan timestamp.
    pub checked_at: String,
    /// Applied filter.
    pub filter: BaselineFilter,
    /// Applied thresholds.
    pub thresholds: BaselineThresholds,
    /// Applied guardrails.
    pub guardrails: BaselineGuardrails,
    /// Per-bucket evaluations.
    pub buckets: Vec<BucketEvaluation>,
    /// Sorted at-risk bucket keys.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub at_risk_bucket_keys: Vec<String>,
    /// Sorted pending bucket keys.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub pending_bucket_keys: Vec<String>,
    /// Sorted insufficient-history bucket keys.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub insufficient_history_bucket_keys: Vec<String>,
}

fn sample_from(trace: &DecisionTrace) -> BaselineSample {
    BaselineSample {
        trace_id: trace.id,
        timestamp: trace.timestamp.clone(),
        decision_engine: trace.decision_engine.clone(),
        engine_version: trace.engine_version.clone(),
        rollout_mode: trace.rollout_mode.clone(),
        cpu_score: trace.cpu_score,
        entropy_score: trace.entropy_score,
        confidence_score: trace.confidence_score,
    }
}

/// Scans recent traces, evaluates every bucket, persists streak state,
/// and emits at-risk transition audits.
///
/// # Errors
///
/// Fails on ledger errors.
pub fn build_baseline_summary(
    ledger: &Ledger,
    limit: usize,
    filter: &BaselineFilter,
    tuning: &BaselineTuning,
    options: &BaselineBuildOptions,
) -> Result<BaselineSummary, LedgerError> {
    let traces = ledger.decision_traces(limit)?;
    let filtered: Vec<&DecisionTrace> = traces.iter().filter(|t| filter.matches(t)).collect();

    let mut summary = BaselineSummary {
        contract_version: BASELINE_CONTRACT_VERSION.to_string(),
        limit,
        scanned: filtered.len(),
        bucket_count: 0,
        at_risk_bucket_count: 0,
        pending_bucket_count: 0,
        insufficient_history_bucket_count: 0,
        transition_count: 0,
        max_cpu_delta_abs: 0.0,
        max_entropy_delta_abs: 0.0,
        max_confidence_delta_abs: 0.0,
        healthy: true,
        checked_at: now_rfc3339(),
        filter: filter.clone(),
        thresholds: BaselineThresholds {
            cpu_delta: tuning.cpu_delta_threshold,
            entropy_delta: tuning.entropy_delta_threshold,
            confidence_delta: tuning.confidence_delta_threshold,
        },
        guardrails: BaselineGuardrails {
            min_baseline_samples: tuning.min_baseline_samples,
            required_consecutive_breaches: tuning.required_consecutive_breaches,
        },
        buckets: Vec::new(),
        at_risk_bucket_keys: Vec::new(),
        pending_bucket_keys: Vec::new(),
        insufficient_history_bucket_keys: Vec::new(),
    };
    if filtered.is_empty() {
        return Ok(summary);
    }

    // Group newest-first; the head of each bucket is its latest trace.
    let mut bucket_map: HashMap<String, Vec<BaselineSample>> = HashMap::new();
    for trace in &filtered {
        let sample = sample_from(trace);
        bucket_map
            .entry(baseline::bucket_key(&sample))
            .or_default()
            .push(sample);
    }

    let mut buckets = Vec::with_capacity(bucket_map.len());
    for (key, samples) in bucket_map {
        let previous_record = ledger.baseline_state(&key)?;
        let previous = previous_record.as_ref().map(|record| PreviousBucketState {
            latest_trace_id: record.latest_trace_id,
            consecutive_breach_count: record.consecutive_breach_count.max(0) as usize,
            status: BaselineStatus::parse_lenient(&record.status),
        });

        let Some(evaluation) = baseline::evaluate_bucket(&samples, previous.as_ref(), tuning)
        else {
            continue;
        };

        if !evaluation.state_transition.is_empty() {
            summary.transition_count += 1;
        }
        match evaluation.status {
            BaselineStatus::AtRisk => summary.at_risk_bucket_keys.push(key.clone()),
            BaselineStatus::Pending => summary.pending_bucket_keys.push(key.clone()),
            BaselineStatus::InsufficientHistory => {
                summary.insufficient_history_bucket_keys.push(key.clone());
            }
            BaselineStatus::Healthy => {}
        }
        summary.max_cpu_delta_abs = summary.max_cpu_delta_abs.max(evaluation.cpu_delta.abs());
        summary.max_entropy_delta_abs = summary
            .max_entropy_delta_abs
            .max(evaluation.entropy_delta.abs());
        summary.max_confidence_delta_abs = summary
            .max_confidence_delta_abs
            .max(evaluation.confidence_delta.abs());

        if options.persist_state {
            let changed = previous.as_ref().map_or(true, |p| {
                p.latest_trace_id != evaluation.latest_trace_id
                    || p.consecutive_breach_count != evaluation.consecutive_breach_count
                    || p.status != evaluation.status
            });
            if changed {
                ledger.upsert_baseline_state(
                    &key,
                    evaluation.latest_trace_id,
                    evaluation.consecutive_breach_count as i64,
                    &evaluation.status.to_string(),
                )?;
            }
            if options.emit_audit_transitions {
                if let Some(previous) = previous.as_ref() {
                    emit_transition_audit(ledger, previous.status, &evaluation, tuning, options)?;
                }
            }
        }

        buckets.push(evaluation);
    }

    buckets.sort_by(|a, b| {
        b.sample_count
            .cmp(&a.sample_count)
            .then_with(|| a.bucket_key.cmp(&b.bucket_key))
    });
    summary.at_risk_bucket_keys.sort();
    summary.pending_bucket_keys.sort();
    summary.insufficient_history_bucket_keys.sort();
    summary.bucket_count = buckets.len();
    summary.at_risk_bucket_count = summary.at_risk_bucket_keys.len();
    summary.pending_bucket_count = summary.pending_bucket_keys.len();
    summary.insufficient_history_bucket_count = summary.insufficient_history_bucket_keys.len();
    summary.healthy = summary.at_risk_bucket_count == 0;
    summary.buckets = buckets;
    Ok(summary)
}

/// Appends the at-risk/recovered audit for a status change; transitions
/// not involving at-risk are silent.
fn emit_transition_audit(
    ledger: &Ledger,
    previous_status: BaselineStatus,
    evaluation: &BucketEvaluation,
    tuning: &BaselineTuning,
    options: &BaselineBuildOptions,
) -> Result<(), LedgerError> {
    if previous_status == evaluation.status {
        return Ok(());
    }
    let entering_risk = evaluation.status == BaselineStatus::AtRisk;
    if !entering_risk && previous_status != BaselineStatus::AtRisk {
        return Ok(());
    }

    let (title, summary) = if entering_risk {
        (
            "SIGNAL_BASELINE_AT_RISK",
            format!(
                "signal baseline drift breached guardrail for {}",
                evaluation.bucket_key
            ),
        )
    } else {
        (
            "SIGNAL_BASELINE_RECOVERED",
            format!("signal baseline recovered for {}", evaluation.bucket_key),
        )
    };
    let reason = format!(
        "signal baseline transition {} -> {} (bucket={}, breaches={}, streak={}/{})",
        previous_status,
        evaluation.status,
        evaluation.bucket_key,
        evaluation.breach_signal_count,
        evaluation.consecutive_breach_count,
        tuning.required_consecutive_breaches,
    );
    let payload = serde_json::json!({
        "bucket_key": evaluation.bucket_key,
        "previous_status": previous_status.to_string(),
        "status": evaluation.status.to_string(),
        "latest_trace_id": evaluation.latest_trace_id,
        "latest_timestamp": evaluation.latest_timestamp,
        "decision_engine": evaluation.decision_engine,
        "engine_version": evaluation.engine_version,
        "rollout_mode": evaluation.rollout_mode,
        "breach_signal_count": evaluation.breach_signal_count,
        "consecutive_breach_count": evaluation.consecutive_breach_count,
        "required_consecutive_breaches": tuning.required_consecutive_breaches,
        "min_baseline_samples": tuning.min_baseline_samples,
        "cpu_delta": evaluation.cpu_delta,
        "entropy_delta": evaluation.entropy_delta,
        "confidence_delta": evaluation.confidence_delta,
        "cpu_delta_threshold": tuning.cpu_delta_threshold,
        "entropy_delta_threshold": tuning.entropy_delta_threshold,
        "confidence_delta_threshold": tuning.confidence_delta_threshold,
    });
    ledger.append_event(NewEvent {
        kind: Some(flowforge_core::ledger::EventKind::Audit),
        request_id: options.request_id.clone(),
        title: title.to_string(),
        actor: "decision-intelligence".to_string(),
        reason_text: reason,
        summary,
        pid: 0,
        cpu_score: evaluation.latest_cpu_score,
        entropy_score: evaluation.latest_entropy_score,
        confidence_score: evaluation.latest_confidence_score,
        payload,
        ..NewEvent::default()
    })?;
    Ok(())
}

// ---------------------------------------------------------------------
// Prometheus sections
// ---------------------------------------------------------------------

/// Renders the idempotency replay-cache gauges.
#[must_use]
pub fn replay_cache_prometheus(stats: Result<ReplayCacheStats, LedgerError>) -> String {
    let mut out = String::new();
    out.push_str(
        "# HELP flowforge_controlplane_replay_rows Persisted control-plane replay rows.\n\
         # TYPE flowforge_controlplane_replay_rows gauge\n\
         # HELP flowforge_controlplane_replay_oldest_age_seconds Age of the oldest replay row.\n\
         # TYPE flowforge_controlplane_replay_oldest_age_seconds gauge\n\
         # HELP flowforge_controlplane_replay_newest_age_seconds Age of the newest replay row.\n\
         # TYPE flowforge_controlplane_replay_newest_age_seconds gauge\n\
         # HELP flowforge_controlplane_replay_stats_error Replay stats collection failed (1) or succeeded (0).\n\
         # TYPE flowforge_controlplane_replay_stats_error gauge\n",
    );
    match stats {
        Ok(stats) => {
            let _ = writeln!(out, "flowforge_controlplane_replay_rows {}", stats.row_count);
            let _ = writeln!(
                out,
                "flowforge_controlplane_replay_oldest_age_seconds {}",
                stats.oldest_age_seconds
            );
            let _ = writeln!(
                out,
                "flowforge_controlplane_replay_newest_age_seconds {}",
                stats.newest_age_seconds
            );
            out.push_str("flowforge_controlplane_replay_stats_error 0\n");
        }
        Err(_) => {
            out.push_str(
                "flowforge_controlplane_replay_rows 0\n\
                 flowforge_controlplane_replay_oldest_age_seconds 0\n\
                 flowforge_controlplane_replay_newest_age_seconds 0\n\
                 flowforge_controlplane_replay_stats_error 1\n",
            );
        }
    }
    out
}

/// Renders the decision replay-integrity gauges.
#[must_use]
pub fn replay_health_prometheus(
    summary: Result<ReplayHealthSummary, LedgerError>,
    limit: usize,
) -> String {
    let mut out = String::new();
    out.push_str(
        "# HELP flowforge_decision_replay_checked_rows Decision traces scanned for replay integrity.\n\
         # TYPE flowforge_decision_replay_checked_rows gauge\n\
         # HELP flowforge_decision_replay_match_rows Traces whose replay digest matched.\n\
         # TYPE flowforge_decision_replay_match_rows gauge\n\
         # HELP flowforge_decision_replay_mismatch_rows Traces whose replay digest mismatched.\n\
         # TYPE flowforge_decision_replay_mismatch_rows gauge\n\
         # HELP flowforge_decision_replay_missing_digest_rows Non-legacy traces missing a digest.\n\
         # TYPE flowforge_decision_replay_missing_digest_rows gauge\n\
         # HELP flowforge_decision_replay_legacy_fallback_rows Traces replayed via legacy fallback.\n\
         # TYPE flowforge_decision_replay_legacy_fallback_rows gauge\n\
         # HELP flowforge_decision_replay_unreplayable_rows Traces without a replayable decision.\n\
         # TYPE flowforge_decision_replay_unreplayable_rows gauge\n\
         # HELP flowforge_decision_replay_mismatch_ratio Mismatch ratio across sampled traces.\n\
         # TYPE flowforge_decision_replay_mismatch_ratio gauge\n\
         # HELP flowforge_decision_replay_healthiness Replay healthiness flag.\n\
         # TYPE flowforge_decision_replay_healthiness gauge\n\
         # HELP flowforge_decision_replay_health_sample_limit Sample size for the scan.\n\
         # TYPE flowforge_decision_replay_health_sample_limit gauge\n\
         # HELP flowforge_decision_replay_stats_error Replay health collection failed (1) or succeeded (0).\n\
         # TYPE flowforge_decision_replay_stats_error gauge\n",
    );
    match summary {
        Ok(summary) => {
            let _ = writeln!(out, "flowforge_decision_replay_checked_rows {}", summary.scanned);
            let _ = writeln!(out, "flowforge_decision_replay_match_rows {}", summary.match_count);
            let _ = writeln!(
                out,
                "flowforge_decision_replay_mismatch_rows {}",
                summary.mismatch_count
            );
            let _ = writeln!(
                out,
                "flowforge_decision_replay_missing_digest_rows {}",
                summary.missing_digest_count
            );
            let _ = writeln!(
                out,
                "flowforge_decision_replay_legacy_fallback_rows {}",
                summary.legacy_fallback_count
            );
            let _ = writeln!(
                out,
                "flowforge_decision_replay_unreplayable_rows {}",
                summary.unreplayable_count
            );
            let _ = writeln!(
                out,
                "flowforge_decision_replay_mismatch_ratio {:.6}",
                summary.mismatch_ratio
            );
            let _ = writeln!(
                out,
                "flowforge_decision_replay_healthiness {}",
                i32::from(summary.healthy)
            );
            let _ = writeln!(
                out,
                "flowforge_decision_replay_health_sample_limit {}",
                summary.limit
            );
            out.push_str("flowforge_decision_replay_stats_error 0\n");
        }
        Err(_) => {
            for gauge in [
                "checked_rows",
                "match_rows",
                "mismatch_rows",
                "missing_digest_rows",
                "legacy_fallback_rows",
                "unreplayable_rows",
                "mismatch_ratio",
                "healthiness",
            ] {
                let _ = writeln!(out, "flowforge_decision_replay_{gauge} 0");
            }
            let _ = writeln!(out, "flowforge_decision_replay_health_sample_limit {limit}");
            out.push_str("flowforge_decision_replay_stats_error 1\n");
        }
    }
    out
}

/// Renders the signal-baseline gauges.
#[must_use]
pub fn baseline_prometheus(
    summary: Result<BaselineSummary, LedgerError>,
    limit: usize,
    tuning: &BaselineTuning,
) -> String {
    let mut out = String::new();
    out.push_str(
        "# HELP flowforge_decision_signal_baseline_checked_rows Decision traces scanned for baseline checks.\n\
         # TYPE flowforge_decision_signal_baseline_checked_rows gauge\n\
         # HELP flowforge_decision_signal_baseline_bucket_count Grouped baseline buckets.\n\
         # TYPE flowforge_decision_signal_baseline_bucket_count gauge\n\
         # HELP flowforge_decision_signal_baseline_at_risk_buckets Buckets currently at risk.\n\
         # TYPE flowforge_decision_signal_baseline_at_risk_buckets gauge\n\
         # HELP flowforge_decision_signal_baseline_pending_buckets Buckets breached below the escalation streak.\n\
         # TYPE flowforge_decision_signal_baseline_pending_buckets gauge\n\
         # HELP flowforge_decision_signal_baseline_insufficient_history_buckets Buckets skipped for lack of history.\n\
         # TYPE flowforge_decision_signal_baseline_insufficient_history_buckets gauge\n\
         # HELP flowforge_decision_signal_baseline_transition_count Status transitions in this evaluation.\n\
         # TYPE flowforge_decision_signal_baseline_transition_count gauge\n\
         # HELP flowforge_decision_signal_baseline_max_cpu_delta_abs Max absolute cpu-score delta.\n\
         # TYPE flowforge_decision_signal_baseline_max_cpu_delta_abs gauge\n\
         # HELP flowforge_decision_signal_baseline_max_entropy_delta_abs Max absolute entropy-score delta.\n\
         # TYPE flowforge_decision_signal_baseline_max_entropy_delta_abs gauge\n\
         # HELP flowforge_decision_signal_baseline_max_confidence_delta_abs Max absolute confidence-score delta.\n\
         # TYPE flowforge_decision_signal_baseline_max_confidence_delta_abs gauge\n\
         # HELP flowforge_decision_signal_baseline_healthiness Baseline healthiness flag.\n\
         # TYPE flowforge_decision_signal_baseline_healthiness gauge\n\
         # HELP flowforge_decision_signal_baseline_sample_limit Sample size for the scan.\n\
         # TYPE flowforge_decision_signal_baseline_sample_limit gauge\n\
         # HELP flowforge_decision_signal_baseline_required_streak Breach streak required for at-risk.\n\
         # TYPE flowforge_decision_signal_baseline_required_streak gauge\n\
         # HELP flowforge_decision_signal_baseline_min_baseline_samples Minimum baseline samples required.\n\
         # TYPE flowforge_decision_signal_baseline_min_baseline_samples gauge\n\
         # HELP flowforge_decision_signal_baseline_stats_error Baseline collection failed (1) or succeeded (0).\n\
         # TYPE flowforge_decision_signal_baseline_stats_error gauge\n",
    );
    match summary {
        Ok(summary) => {
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_checked_rows {}",
                summary.scanned
            );
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_bucket_count {}",
                summary.bucket_count
            );
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_at_risk_buckets {}",
                summary.at_risk_bucket_count
            );
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_pending_buckets {}",
                summary.pending_bucket_count
            );
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_insufficient_history_buckets {}",
                summary.insufficient_history_bucket_count
            );
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_transition_count {}",
                summary.transition_count
            );
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_max_cpu_delta_abs {:.6}",
                summary.max_cpu_delta_abs
            );
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_max_entropy_delta_abs {:.6}",
                summary.max_entropy_delta_abs
            );
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_max_confidence_delta_abs {:.6}",
                summary.max_confidence_delta_abs
            );
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_healthiness {}",
                i32::from(summary.healthy)
            );
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_sample_limit {}",
                summary.limit
            );
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_required_streak {}",
                summary.guardrails.required_consecutive_breaches
            );
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_min_baseline_samples {}",
                summary.guardrails.min_baseline_samples
            );
            out.push_str("flowforge_decision_signal_baseline_stats_error 0\n");
        }
        Err(_) => {
            for gauge in [
                "checked_rows",
                "bucket_count",
                "at_risk_buckets",
                "pending_buckets",
                "insufficient_history_buckets",
                "transition_count",
                "max_cpu_delta_abs",
                "max_entropy_delta_abs",
                "max_confidence_delta_abs",
                "healthiness",
            ] {
                let _ = writeln!(out, "flowforge_decision_signal_baseline_{gauge} 0");
            }
            let _ = writeln!(out, "flowforge_decision_signal_baseline_sample_limit {limit}");
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_required_streak {}",
                tuning.required_consecutive_breaches
            );
            let _ = writeln!(
                out,
                "flowforge_decision_signal_baseline_min_baseline_samples {}",
                tuning.min_baseline_samples
            );
            out.push_str("flowforge_decision_signal_baseline_stats_error 1\n");
        }
    }
    out
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::crypto::EncryptionPolicy;
    use flowforge_core::ledger::EventKind;
    use flowforge_core::policy::{RolloutMode, current_engine_contract};
    use flowforge_core::redact::Redactor;
    use std::sync::Arc;

    fn test_ledger() -> Arc<Ledger> {
        Arc::new(Ledger::in_memory(EncryptionPolicy::Plaintext, Redactor::new()).unwrap())
    }

    fn seed_trace(ledger: &Ledger, cpu: f64, reason: &str) -> i64 {
        let contract = current_engine_contract(RolloutMode::Enforce);
        ledger
            .log_decision_trace(
                "worker",
                4242,
                cpu,
                40.0,
                60.0,
                "ALERT",
                reason,
                "",
                "",
                &contract,
            )
            .unwrap()
    }

    #[test]
    fn replay_health_is_green_for_fresh_traces() {
        let ledger = test_ledger();
        for i in 0..5 {
            seed_trace(&ledger, 40.0 + f64::from(i), "steady");
        }
        let summary = build_replay_health(&ledger, 500).unwrap();
        assert_eq!(summary.scanned, 5);
        assert_eq!(summary.match_count, 5);
        assert!(summary.healthy);
        assert_eq!(summary.mismatch_ratio, 0.0);
    }

    /// Baseline escalation scenario: a drifting latest reports pending
    /// on the first evaluation, at-risk on the second *new* breach, and
    /// recovery emits the matching audit.
    #[test]
    fn baseline_escalates_then_recovers_with_audits() {
        let ledger = test_ledger();
        let tuning = BaselineTuning::default();
        let filter = BaselineFilter::default();
        let options = BaselineBuildOptions {
            persist_state: true,
            emit_audit_transitions: true,
            request_id: "req_baseline".to_string(),
        };

        // Baseline of four steady traces (cpu mean 40), then a spike.
        for _ in 0..4 {
            seed_trace(&ledger, 40.0, "steady");
        }
        seed_trace(&ledger, 95.0, "spike one");

        let first = build_baseline_summary(&ledger, 500, &filter, &tuning, &options).unwrap();
        assert_eq!(first.bucket_count, 1);
        assert_eq!(first.pending_bucket_count, 1);
        assert!(first.healthy);
        assert_eq!(
            first.pending_bucket_keys,
            vec!["threshold-decider@1.1.0|enforce".to_string()]
        );

        // A second, new drifting latest escalates.
        seed_trace(&ledger, 96.0, "spike two");
        let second = build_baseline_summary(&ledger, 500, &filter, &tuning, &options).unwrap();
        assert_eq!(second.at_risk_bucket_count, 1);
        assert!(!second.healthy);
        assert_eq!(second.transition_count, 1);

        let at_risk_audits: Vec<_> = ledger
            .timeline(50)
            .unwrap()
            .into_iter()
            .filter(|e| e.title == "SIGNAL_BASELINE_AT_RISK")
            .collect();
        assert_eq!(at_risk_audits.len(), 1);
        assert_eq!(
            at_risk_audits[0].request_id.as_deref(),
            Some("req_baseline")
        );
        assert_eq!(at_risk_audits[0].event_type, EventKind::Audit);
        assert_eq!(
            at_risk_audits[0].payload["bucket_key"],
            "threshold-decider@1.1.0|enforce"
        );

        // Re-evaluating the same latest is a no-op on the streak.
        let replayed = build_baseline_summary(&ledger, 500, &filter, &tuning, &options).unwrap();
        assert_eq!(replayed.at_risk_bucket_count, 1);
        assert_eq!(replayed.transition_count, 0);

        // Healthy latest: back to healthy with a recovery audit.
        // (The old spikes fold into the baseline mean of ~55; a 50-score
        // latest sits within every threshold.)
        seed_trace(&ledger, 50.0, "recovered");
        let third = build_baseline_summary(&ledger, 500, &filter, &tuning, &options).unwrap();
        assert!(third.healthy);
        assert_eq!(third.at_risk_bucket_count, 0);

        let recovered: Vec<_> = ledger
            .timeline(50)
            .unwrap()
            .into_iter()
            .filter(|e| e.title == "SIGNAL_BASELINE_RECOVERED")
            .collect();
        assert_eq!(recovered.len(), 1);
    }

    #[test]
    fn baseline_filter_narrows_scan() {
        let ledger = test_ledger();
        for _ in 0..5 {
            seed_trace(&ledger, 40.0, "steady");
        }
        let filter = BaselineFilter {
            engine: "different-engine".to_string(),
            ..BaselineFilter::default()
        }
        .normalized();
        let summary = build_baseline_summary(
            &ledger,
            500,
            &filter,
            &BaselineTuning::default(),
            &BaselineBuildOptions::default(),
        )
        .unwrap();
        assert_eq!(summary.scanned, 0);
        assert!(summary.healthy);
    }

    #[test]
    fn insufficient_history_bucket_is_guarded() {
        let ledger = test_ledger();
        seed_trace(&ledger, 95.0, "lonely spike");
        let summary = build_baseline_summary(
            &ledger,
            500,
            &BaselineFilter::default(),
            &BaselineTuning::default(),
            &BaselineBuildOptions::default(),
        )
        .unwrap();
        assert_eq!(summary.insufficient_history_bucket_count, 1);
        assert!(summary.healthy);
    }

    #[test]
    fn prometheus_sections_render_on_success_and_error() {
        let ledger = test_ledger();
        seed_trace(&ledger, 40.0, "x");
        let tuning = BaselineTuning::default();

        let text = replay_cache_prometheus(ledger.replay_cache_stats());
        assert!(text.contains("flowforge_controlplane_replay_stats_error 0"));

        let text = replay_health_prometheus(build_replay_health(&ledger, 500), 500);
        assert!(text.contains("flowforge_decision_replay_checked_rows 1"));
        assert!(text.contains("flowforge_decision_replay_stats_error 0"));

        let text = baseline_prometheus(
            build_baseline_summary(
                &ledger,
                500,
                &BaselineFilter::default(),
                &tuning,
                &BaselineBuildOptions::default(),
            ),
            500,
            &tuning,
        );
        assert!(text.contains("flowforge_decision_signal_baseline_sample_limit 500"));
        assert!(text.contains("flowforge_decision_signal_baseline_required_streak 2"));

        let err_text = replay_health_prometheus(
            Err(LedgerError::InvalidInput("boom".into())),
            500,
        );
        assert!(err_text.contains("flowforge_decision_replay_stats_error 1"));
    }
}
