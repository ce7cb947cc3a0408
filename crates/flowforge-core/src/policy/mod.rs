//! Policy engine: threshold decider, deterministic replay contract, and
//! signal-baseline drift analysis.
//!
//! The decider is a pure function from sampled telemetry and configured
//! thresholds to a [`Decision`]; everything it needs arrives in its
//! arguments so past decisions can be re-evaluated byte-for-byte.

pub mod baseline;
pub mod replay;

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Name of the built-in decision engine.
pub const DECISION_ENGINE_NAME: &str = "threshold-decider";
/// Version of the built-in decision engine.
pub const DECISION_ENGINE_VERSION: &str = "1.1.0";
/// Contract version stamped on every decision trace.
pub const DECISION_CONTRACT_VERSION: &str = "decision-trace.v1";

/// Raw-diversity level above which output is considered healthy
/// regardless of CPU.
pub const HEALTHY_DIVERSITY_FLOOR: f64 = 0.85;

/// Reason fragment stamped on healthy-spike decisions.
pub const PROGRESS_GUARD_REASON: &str = "progressing output pattern detected";

/// Rollout posture of the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RolloutMode {
    /// Decisions are recorded but not enacted.
    Shadow,
    /// Decisions are enacted for a limited slice of runs.
    Canary,
    /// Decisions are fully enacted.
    #[default]
    Enforce,
}

impl std::fmt::Display for RolloutMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shadow => write!(f, "shadow"),
            Self::Canary => write!(f, "canary"),
            Self::Enforce => write!(f, "enforce"),
        }
    }
}

impl RolloutMode {
    /// Parses a rollout mode, defaulting to enforce on unknown input.
    #[must_use]
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "shadow" => Self::Shadow,
            "canary" => Self::Canary,
            _ => Self::Enforce,
        }
    }
}

/// Identity stamped on decision traces for replay bucketing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineContract {
    /// Engine name.
    pub decision_engine: String,
    /// Engine semver.
    pub engine_version: String,
    /// Trace contract version.
    pub decision_contract_version: String,
    /// Rollout posture, lowercase.
    pub rollout_mode: String,
}

/// Returns the contract for the built-in engine at the given rollout.
#[must_use]
pub fn current_engine_contract(rollout_mode: RolloutMode) -> EngineContract {
    EngineContract {
        decision_engine: DECISION_ENGINE_NAME.to_string(),
        engine_version: DECISION_ENGINE_VERSION.to_string(),
        decision_contract_version: DECISION_CONTRACT_VERSION.to_string(),
        rollout_mode: rollout_mode.to_string(),
    }
}

/// Checks that an engine version is plain semver (optional leading `v`).
#[must_use]
pub fn is_valid_engine_version(version: &str) -> bool {
    static SEMVER_RE: OnceLock<Regex> = OnceLock::new();
    let re = SEMVER_RE.get_or_init(|| {
        Regex::new(r"^v?\d+\.\d+\.\d+(?:[-+][0-9A-Za-z.-]+)?$").expect("semver pattern")
    });
    re.is_match(version.trim())
}

/// One sample of runtime telemetry handed to the decider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    /// Rolling CPU usage of the child, percent.
    pub cpu_percent: f64,
    /// How long CPU has continuously been above the threshold.
    pub cpu_over_for: Duration,
    /// Max n-gram repetition ratio over the log window, 0..=1.
    pub log_repetition: f64,
    /// Shannon entropy of the log window, bits per byte.
    pub log_entropy: f64,
    /// Unique-line diversity over the log window, 0..=1.
    pub raw_diversity: f64,
    /// Whether the window matches a progressing-output pattern.
    pub progress_like: bool,
}

/// Configured intervention thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyThresholds {
    /// CPU percent above which a breach window opens.
    pub max_cpu_percent: f64,
    /// How long CPU must stay above the threshold before acting.
    pub cpu_window: Duration,
    /// Entropy (bits) at or below which output looks stuck.
    pub min_log_entropy: f64,
    /// Repetition ratio at or above which output looks stuck.
    pub max_log_repetition: f64,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            max_cpu_percent: 90.0,
            cpu_window: Duration::from_secs(10),
            min_log_entropy: 2.5,
            max_log_repetition: 0.8,
        }
    }
}

/// Action the control plane should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionAction {
    /// No intervention.
    Continue,
    /// Record an alert, keep the child running.
    Alert,
    /// Terminate the child tree.
    Kill,
    /// Terminate and start a replacement.
    Restart,
}

impl std::fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "CONTINUE"),
            Self::Alert => write!(f, "ALERT"),
            Self::Kill => write!(f, "KILL"),
            Self::Restart => write!(f, "RESTART"),
        }
    }
}

/// Outcome of one decider evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Chosen action.
    pub action: DecisionAction,
    /// Human-readable justification including numeric breaches.
    pub reason: String,
    /// CPU pressure on the 0..100 scale.
    pub cpu_score: f64,
    /// Log entropy projected onto 0..100.
    pub entropy_score: f64,
    /// Blended confidence in the decision, 0..100.
    pub confidence_score: f64,
}

/// Evaluates the threshold rules. First match wins.
#[must_use]
pub fn decide(telemetry: &Telemetry, thresholds: &PolicyThresholds) -> Decision {
    let cpu_score = cpu_score(telemetry.cpu_percent, thresholds.max_cpu_percent);
    let entropy_score = entropy_score(telemetry.log_entropy);
    let confidence_score = confidence_score(cpu_score, entropy_score);

    let cpu_breach = telemetry.cpu_percent >= thresholds.max_cpu_percent
        && telemetry.cpu_over_for >= thresholds.cpu_window;
    let log_breach = telemetry.log_repetition >= thresholds.max_log_repetition
        || telemetry.log_entropy <= thresholds.min_log_entropy;

    // Healthy-spike guard: progressing output caps severity at ALERT.
    if telemetry.progress_like || telemetry.raw_diversity >= HEALTHY_DIVERSITY_FLOOR {
        if cpu_breach {
            return Decision {
                action: DecisionAction::Alert,
                reason: format!(
                    "CPU {:.1}% >= {:.1}% for {:.0}s but {PROGRESS_GUARD_REASON}",
                    telemetry.cpu_percent,
                    thresholds.max_cpu_percent,
                    telemetry.cpu_over_for.as_secs_f64(),
                ),
                cpu_score,
                entropy_score,
                confidence_score,
            };
        }
        return Decision {
            action: DecisionAction::Continue,
            reason: "within thresholds".to_string(),
            cpu_score,
            entropy_score,
            confidence_score,
        };
    }

    if cpu_breach && log_breach {
        let log_detail = if telemetry.log_repetition >= thresholds.max_log_repetition {
            format!(
                "log repetition {:.2} >= {:.2}",
                telemetry.log_repetition, thresholds.max_log_repetition
            )
        } else {
            format!(
                "log entropy {:.2} <= {:.2}",
                telemetry.log_entropy, thresholds.min_log_entropy
            )
        };
        return Decision {
            action: DecisionAction::Kill,
            reason: format!(
                "CPU {:.1}% >= {:.1}% for {:.0}s and {log_detail}",
                telemetry.cpu_percent,
                thresholds.max_cpu_percent,
                telemetry.cpu_over_for.as_secs_f64(),
            ),
            cpu_score,
            entropy_score,
            confidence_score,
        };
    }

    if cpu_breach {
        return Decision {
            action: DecisionAction::Alert,
            reason: format!(
                "CPU {:.1}% sustained above {:.1}% for {:.0}s",
                telemetry.cpu_percent,
                thresholds.max_cpu_percent,
                telemetry.cpu_over_for.as_secs_f64(),
            ),
            cpu_score,
            entropy_score,
            confidence_score,
        };
    }

    Decision {
        action: DecisionAction::Continue,
        reason: "within thresholds".to_string(),
        cpu_score,
        entropy_score,
        confidence_score,
    }
}

/// CPU pressure: `min(100, cpu / max_cpu * 100)`.
#[must_use]
pub fn cpu_score(cpu_percent: f64, max_cpu_percent: f64) -> f64 {
    if max_cpu_percent <= 0.0 {
        return 100.0;
    }
    (cpu_percent / max_cpu_percent * 100.0).clamp(0.0, 100.0)
}

/// Projects raw entropy bits onto the 0..100 scale.
#[must_use]
pub fn entropy_score(log_entropy_bits: f64) -> f64 {
    (log_entropy_bits / 8.0 * 100.0).clamp(0.0, 100.0)
}

/// Blended confidence: `0.65 * cpu_score + 0.35 * (100 - entropy_score)`.
#[must_use]
pub fn confidence_score(cpu_score: f64, entropy_score: f64) -> f64 {
    0.65 * cpu_score + 0.35 * (100.0 - entropy_score)
}
