//! Decision-signal baseline drift analysis.
//!
//! Recent decision traces are grouped into buckets keyed by
//! `engine@version|rollout`. Within a bucket the newest trace is compared
//! against the mean of the remaining (baseline) traces; a signal drifts
//! when its absolute delta meets the configured threshold. Escalation is
//! guarded twice: buckets with too little history are skipped, and a
//! bucket must breach on consecutive *new* latest traces before it is
//! promoted from `pending` to `at_risk`.

use serde::{Deserialize, Serialize};

use crate::config::BaselineTuning;

/// Contract version of the baseline evaluation.
pub const BASELINE_CONTRACT_VERSION: &str = "decision-signal-baseline.v2";

/// Fallback bucket dimensions for traces missing engine metadata.
pub const UNKNOWN_ENGINE: &str = "unknown-engine";
/// Fallback for a missing engine version.
pub const UNKNOWN_VERSION: &str = "unknown-version";
/// Fallback for a missing rollout mode.
pub const UNKNOWN_ROLLOUT: &str = "unknown-rollout";

/// Health state of one baseline bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BaselineStatus {
    /// No drifting signals.
    #[default]
    Healthy,
    /// Breached, but the escalation streak is not yet met.
    Pending,
    /// Breached on enough consecutive new traces.
    AtRisk,
    /// Too few baseline samples to judge.
    InsufficientHistory,
}

impl std::fmt::Display for BaselineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Pending => "pending",
            Self::AtRisk => "at_risk",
            Self::InsufficientHistory => "insufficient_history",
        };
        write!(f, "{s}")
    }
}

impl BaselineStatus {
    /// Parses a stored status, defaulting unknown values to healthy.
    #[must_use]
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "at_risk" => Self::AtRisk,
            "insufficient_history" => Self::InsufficientHistory,
            _ => Self::Healthy,
        }
    }
}

/// The signal slice of one decision trace, newest first within a bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineSample {
    /// Ledger id of the trace.
    pub trace_id: i64,
    /// RFC 3339 timestamp of the trace.
    pub timestamp: String,
    /// Engine that produced the trace (may be empty for legacy rows).
    pub decision_engine: String,
    /// Engine version.
    pub engine_version: String,
    /// Rollout mode.
    pub rollout_mode: String,
    /// CPU score.
    pub cpu_score: f64,
    /// Entropy score.
    pub entropy_score: f64,
    /// Confidence score.
    pub confidence_score: f64,
}

/// Persisted streak state carried between evaluations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousBucketState {
    /// Trace id of the latest trace at the previous evaluation.
    pub latest_trace_id: i64,
    /// Breach streak at the previous evaluation.
    pub consecutive_breach_count: usize,
    /// Status at the previous evaluation.
    pub status: BaselineStatus,
}

/// Full evaluation of one bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketEvaluation {
    /// `engine@version|rollout` key.
    pub bucket_key: String,
    /// Engine dimension (fallback-normalized).
    pub decision_engine: String,
    /// Version dimension (fallback-normalized).
    pub engine_version: String,
    /// Rollout dimension (fallback-normalized).
    pub rollout_mode: String,
    /// Total traces in the bucket.
    pub sample_count: usize,
    /// Traces used for the baseline mean.
    pub baseline_sample_count: usize,
    /// Latest trace id.
    pub latest_trace_id: i64,
    /// Latest trace timestamp.
    pub latest_timestamp: String,
    /// Latest cpu score.
    pub latest_cpu_score: f64,
    /// Latest entropy score.
    pub latest_entropy_score: f64,
    /// Latest confidence score.
    pub latest_confidence_score: f64,
    /// Baseline mean cpu score.
    pub baseline_cpu_mean: f64,
    /// Baseline mean entropy score.
    pub baseline_entropy_mean: f64,
    /// Baseline mean confidence score.
    pub baseline_confidence_mean: f64,
    /// Latest minus baseline mean, cpu.
    pub cpu_delta: f64,
    /// Latest minus baseline mean, entropy.
    pub entropy_delta: f64,
    /// Latest minus baseline mean, confidence.
    pub confidence_delta: f64,
    /// Whether the cpu delta meets its threshold.
    pub cpu_drift: bool,
    /// Whether the entropy delta meets its threshold.
    pub entropy_drift: bool,
    /// Whether the confidence delta meets its threshold.
    pub confidence_drift: bool,
    /// Number of drifting signals, 0..=3.
    pub breach_signal_count: usize,
    /// Current breach streak.
    pub consecutive_breach_count: usize,
    /// Breached but below the escalation streak.
    pub pending_escalation: bool,
    /// Bucket skipped for lack of history.
    pub insufficient_history: bool,
    /// Resulting status.
    pub status: BaselineStatus,
    /// `previous->current` when the status changed, else empty.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub state_transition: String,
    /// Healthy flag (anything but at-risk).
    pub healthy: bool,
}

/// Normalizes one bucket dimension, substituting the fallback for
/// empty values.
#[must_use]
pub fn normalize_dimension(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Builds the `engine@version|rollout` bucket key for a sample.
#[must_use]
pub fn bucket_key(sample: &BaselineSample) -> String {
    format!(
        "{}@{}|{}",
        normalize_dimension(&sample.decision_engine, UNKNOWN_ENGINE),
        normalize_dimension(&sample.engine_version, UNKNOWN_VERSION),
        normalize_dimension(&sample.rollout_mode, UNKNOWN_ROLLOUT),
    )
}

fn mean_scores(samples: &[BaselineSample]) -> (f64, f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let mut cpu = 0.0;
    let mut entropy = 0.0;
    let mut confidence = 0.0;
    for s in samples {
        cpu += s.cpu_score;
        entropy += s.entropy_score;
        confidence += s.confidence_score;
    }
    let n = samples.len() as f64;
    (cpu / n, entropy / n, confidence / n)
}

/// Evaluates one bucket.
///
/// `samples` must be ordered newest first; the head is the latest trace
/// and the tail is the baseline. `previous` is the persisted streak state
/// from the last evaluation, if any. Only a latest trace the previous
/// evaluation has not seen can move the streak; re-evaluating the same
/// latest is a no-op on the counter.
#[must_use]
pub fn evaluate_bucket(
    samples: &[BaselineSample],
    previous: Option<&PreviousBucketState>,
    tuning: &BaselineTuning,
) -> Option<BucketEvaluation> {
    let latest = samples.first()?;
    let baseline = if samples.len() > 1 {
        &samples[1..]
    } else {
        samples
    };

    let (cpu_mean, entropy_mean, confidence_mean) = mean_scores(baseline);
    let cpu_delta = latest.cpu_score - cpu_mean;
    let entropy_delta = latest.entropy_score - entropy_mean;
    let confidence_delta = latest.confidence_score - confidence_mean;
    let cpu_drift = cpu_delta.abs() >= tuning.cpu_delta_threshold;
    let entropy_drift = entropy_delta.abs() >= tuning.entropy_delta_threshold;
    let confidence_drift = confidence_delta.abs() >= tuning.confidence_delta_threshold;
    let breach_signal_count =
        usize::from(cpu_drift) + usize::from(entropy_drift) + usize::from(confidence_drift);
    let insufficient_history = baseline.len() < tuning.min_baseline_samples;

    let latest_is_new = previous.map_or(true, |p| p.latest_trace_id != latest.trace_id);
    let mut consecutive_breach_count = previous.map_or(0, |p| p.consecutive_breach_count);
    let previous_status = previous.map(|p| p.status);

    let mut pending_escalation = false;
    let status = if insufficient_history {
        consecutive_breach_count = 0;
        BaselineStatus::InsufficientHistory
    } else if breach_signal_count == 0 {
        consecutive_breach_count = 0;
        BaselineStatus::Healthy
    } else {
        if latest_is_new {
            consecutive_breach_count = match previous_status {
                Some(BaselineStatus::Pending | BaselineStatus::AtRisk) => {
                    consecutive_breach_count + 1
                }
                _ => 1,
            };
        }
        if consecutive_breach_count == 0 {
            consecutive_breach_count = 1;
        }
        if consecutive_breach_count >= tuning.required_consecutive_breaches {
            BaselineStatus::AtRisk
        } else {
            pending_escalation = true;
            BaselineStatus::Pending
        }
    };

    let state_transition = match previous_status {
        Some(prev) if prev != status => format!("{prev}->{status}"),
        _ => String::new(),
    };

    Some(BucketEvaluation {
        bucket_key: bucket_key(latest),
        decision_engine: normalize_dimension(&latest.decision_engine, UNKNOWN_ENGINE),
        engine_version: normalize_dimension(&latest.engine_version, UNKNOWN_VERSION),
        rollout_mode: normalize_dimension(&latest.rollout_mode, UNKNOWN_ROLLOUT),
        sample_count: samples.len(),
        baseline_sample_count: baseline.len(),
        latest_trace_id: latest.trace_id,
        latest_timestamp: latest.timestamp.clone(),
        latest_cpu_score: latest.cpu_score,
        latest_entropy_score: latest.entropy_score,
        latest_confidence_score: latest.confidence_score,
        baseline_cpu_mean: cpu_mean,
        baseline_entropy_mean: entropy_mean,
        baseline_confidence_mean: confidence_mean,
        cpu_delta,
        entropy_delta,
        confidence_delta,
        cpu_drift,
        entropy_drift,
        confidence_drift,
        breach_signal_count,
        consecutive_breach_count,
        pending_escalation,
        insufficient_history,
        status,
        state_transition,
        healthy: status != BaselineStatus::AtRisk,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(trace_id: i64, cpu: f64) -> BaselineSample {
        BaselineSample {
            trace_id,
            timestamp: format!("2026-08-01T00:00:{:02}Z", trace_id % 60),
            decision_engine: "threshold-decider".into(),
            engine_version: "1.1.0".into(),
            rollout_mode: "enforce".into(),
            cpu_score: cpu,
            entropy_score: 40.0,
            confidence_score: 60.0,
        }
    }

    /// Newest-first window: drifting latest (cpu 95) over a stable 40-mean
    /// baseline of four traces.
    fn drifting_window() -> Vec<BaselineSample> {
        vec![
            sample(5, 95.0),
            sample(4, 40.0),
            sample(3, 40.0),
            sample(2, 40.0),
            sample(1, 40.0),
        ]
    }

    #[test]
    fn bucket_key_normalizes_empty_dimensions() {
        let mut s = sample(1, 10.0);
        s.decision_engine = "  ".into();
        s.rollout_mode = String::new();
        assert_eq!(bucket_key(&s), "unknown-engine@1.1.0|unknown-rollout");
        assert_eq!(bucket_key(&sample(1, 10.0)), "threshold-decider@1.1.0|enforce");
    }

    #[test]
    fn insufficient_history_short_circuits() {
        let window = vec![sample(2, 95.0), sample(1, 40.0)];
        let eval = evaluate_bucket(&window, None, &BaselineTuning::default()).unwrap();
        assert_eq!(eval.status, BaselineStatus::InsufficientHistory);
        assert!(eval.insufficient_history);
        assert_eq!(eval.consecutive_breach_count, 0);
        assert!(eval.healthy);
    }

    #[test]
    fn no_drift_is_healthy() {
        let window = vec![
            sample(4, 42.0),
            sample(3, 40.0),
            sample(2, 41.0),
            sample(1, 39.0),
        ];
        let eval = evaluate_bucket(&window, None, &BaselineTuning::default()).unwrap();
        assert_eq!(eval.status, BaselineStatus::Healthy);
        assert_eq!(eval.breach_signal_count, 0);
    }

    #[test]
    fn first_breach_is_pending() {
        let eval = evaluate_bucket(&drifting_window(), None, &BaselineTuning::default()).unwrap();
        assert_eq!(eval.status, BaselineStatus::Pending);
        assert!(eval.pending_escalation);
        assert_eq!(eval.consecutive_breach_count, 1);
        assert!(eval.cpu_drift);
        assert!((eval.cpu_delta - 55.0).abs() < 1e-9);
        assert!(eval.healthy);
    }

    #[test]
    fn second_new_breach_escalates_to_at_risk() {
        let tuning = BaselineTuning::default();
        let first = evaluate_bucket(&drifting_window(), None, &tuning).unwrap();
        assert_eq!(first.status, BaselineStatus::Pending);

        // A new drifting latest arrives.
        let mut window = drifting_window();
        window.insert(0, sample(6, 96.0));
        let previous = PreviousBucketState {
            latest_trace_id: first.latest_trace_id,
            consecutive_breach_count: first.consecutive_breach_count,
            status: first.status,
        };
        let second = evaluate_bucket(&window, Some(&previous), &tuning).unwrap();
        assert_eq!(second.status, BaselineStatus::AtRisk);
        assert_eq!(second.consecutive_breach_count, 2);
        assert!(!second.healthy);
        assert_eq!(second.state_transition, "pending->at_risk");
    }

    #[test]
    fn same_latest_does_not_grow_the_streak() {
        let tuning = BaselineTuning::default();
        let first = evaluate_bucket(&drifting_window(), None, &tuning).unwrap();
        let previous = PreviousBucketState {
            latest_trace_id: first.latest_trace_id,
            consecutive_breach_count: first.consecutive_breach_count,
            status: first.status,
        };
        // Re-evaluating the identical window must not escalate.
        let again = evaluate_bucket(&drifting_window(), Some(&previous), &tuning).unwrap();
        assert_eq!(again.status, BaselineStatus::Pending);
        assert_eq!(again.consecutive_breach_count, 1);
        assert!(again.state_transition.is_empty());
    }

    #[test]
    fn recovery_resets_streak_and_reports_transition() {
        let tuning = BaselineTuning::default();
        let previous = PreviousBucketState {
            latest_trace_id: 6,
            consecutive_breach_count: 2,
            status: BaselineStatus::AtRisk,
        };
        let mut window = drifting_window();
        window.insert(0, sample(7, 41.0));
        let eval = evaluate_bucket(&window, Some(&previous), &tuning).unwrap();
        // Baseline now includes the old 95-score spike, mean ~51; delta
        // stays under the 25-point threshold.
        assert_eq!(eval.status, BaselineStatus::Healthy);
        assert_eq!(eval.consecutive_breach_count, 0);
        assert_eq!(eval.state_transition, "at_risk->healthy");
    }

    #[test]
    fn status_parse_is_lenient() {
        assert_eq!(BaselineStatus::parse_lenient("AT_RISK"), BaselineStatus::AtRisk);
        assert_eq!(BaselineStatus::parse_lenient(" pending "), BaselineStatus::Pending);
        assert_eq!(
            BaselineStatus::parse_lenient("insufficient_history"),
            BaselineStatus::InsufficientHistory
        );
        assert_eq!(BaselineStatus::parse_lenient("garbage"), BaselineStatus::Healthy);
    }

    #[test]
    fn single_sample_bucket_is_insufficient() {
        let window = vec![sample(1, 95.0)];
        let eval = evaluate_bucket(&window, None, &BaselineTuning::default()).unwrap();
        assert_eq!(eval.status, BaselineStatus::InsufficientHistory);
        assert_eq!(eval.baseline_sample_count, 1);
    }
}
