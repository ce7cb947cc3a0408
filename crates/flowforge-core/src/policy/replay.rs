//! Deterministic decision-replay contract.
//!
//! Every persisted decision trace carries a hex SHA-256 digest over its
//! canonicalized inputs. Recomputing the digest from the stored row must
//! reproduce it byte-for-byte; anything else is surfaced as a mismatch.
//! Rows written before the contract existed are backfilled with fixed
//! sentinels and flagged as legacy fallbacks rather than failures.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Version tag of the replay contract itself.
pub const REPLAY_CONTRACT_VERSION: &str = "decision-replay.v1";

/// Sentinels substituted for missing legacy metadata.
pub const LEGACY_ENGINE: &str = "legacy-decider";
/// Sentinel for a missing engine version.
pub const LEGACY_ENGINE_VERSION: &str = "legacy-unknown";
/// Sentinel for a missing decision contract.
pub const LEGACY_DECISION_CONTRACT: &str = "legacy-decision-trace";
/// Sentinel for a missing rollout mode.
pub const LEGACY_ROLLOUT_MODE: &str = "legacy";

/// Outcome classes of a replay verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplayStatus {
    /// Stored digest equals the recomputed digest.
    Match,
    /// Stored digest differs from the recomputed digest.
    Mismatch,
    /// Non-legacy row without a stored digest.
    MissingDigest,
    /// Legacy row replayed through sentinel backfill.
    LegacyFallback,
    /// Row cannot be replayed (no decision value).
    NotReplayable,
}

impl std::fmt::Display for ReplayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Match => "MATCH",
            Self::Mismatch => "MISMATCH",
            Self::MissingDigest => "MISSING_DIGEST",
            Self::LegacyFallback => "LEGACY_FALLBACK",
            Self::NotReplayable => "NOT_REPLAYABLE",
        };
        write!(f, "{s}")
    }
}

/// Canonicalizable inputs of one decision trace.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReplayInput {
    /// Engine that produced the decision.
    pub decision_engine: String,
    /// Engine version.
    pub engine_version: String,
    /// Decision contract version.
    pub decision_contract_version: String,
    /// Rollout mode, canonically lowercase.
    pub rollout_mode: String,
    /// Decision value, canonically uppercase.
    pub decision: String,
    /// Decision reason.
    pub reason: String,
    /// CPU score, canonically rounded.
    pub cpu_score: f64,
    /// Entropy score, canonically rounded.
    pub entropy_score: f64,
    /// Confidence score, canonically rounded.
    pub confidence_score: f64,
}

/// Result of verifying a stored digest against its canonical input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayVerification {
    /// Contract version used for verification.
    pub contract_version: String,
    /// Whether the row carries enough input to replay at all.
    pub replayable: bool,
    /// Verdict.
    pub status: ReplayStatus,
    /// Normalized stored digest (lowercase hex), empty if absent.
    pub stored_digest: String,
    /// Recomputed digest, empty when not replayable.
    pub computed_digest: String,
    /// True only on a byte-for-byte match.
    pub deterministic_match: bool,
    /// Whether legacy sentinels were substituted.
    pub legacy_fallback: bool,
    /// Explanation of the verdict.
    pub reason: String,
    /// Canonicalized input the digest covers.
    pub canonical_input: ReplayInput,
}

/// Canonicalizes a replay input.
///
/// Strings are trimmed, `decision` is uppercased, `rollout_mode` is
/// lowercased, scores are rounded half-to-even to six decimals with
/// negative zero collapsed. Returns the normalized input and whether any
/// legacy sentinel was substituted.
#[must_use]
pub fn normalize(input: &ReplayInput) -> (ReplayInput, bool) {
    let mut normalized = ReplayInput {
        decision_engine: input.decision_engine.trim().to_string(),
        engine_version: input.engine_version.trim().to_string(),
        decision_contract_version: input.decision_contract_version.trim().to_string(),
        rollout_mode: input.rollout_mode.trim().to_ascii_lowercase(),
        decision: input.decision.trim().to_ascii_uppercase(),
        reason: input.reason.trim().to_string(),
        cpu_score: normalize_score(input.cpu_score),
        entropy_score: normalize_score(input.entropy_score),
        confidence_score: normalize_score(input.confidence_score),
    };

    let mut legacy_fallback = false;
    if normalized.decision_engine.is_empty() {
        normalized.decision_engine = LEGACY_ENGINE.to_string();
        legacy_fallback = true;
    }
    if normalized.engine_version.is_empty() {
        normalized.engine_version = LEGACY_ENGINE_VERSION.to_string();
        legacy_fallback = true;
    }
    if normalized.decision_contract_version.is_empty() {
        normalized.decision_contract_version = LEGACY_DECISION_CONTRACT.to_string();
        legacy_fallback = true;
    }
    if normalized.rollout_mode.is_empty() {
        normalized.rollout_mode = LEGACY_ROLLOUT_MODE.to_string();
        legacy_fallback = true;
    }

    (normalized, legacy_fallback)
}

/// Computes the hex SHA-256 replay digest over the canonical input.
#[must_use]
pub fn digest(input: &ReplayInput) -> String {
    let (normalized, _) = normalize(input);
    let lines = [
        format!("decision_engine={}", normalized.decision_engine),
        format!("engine_version={}", normalized.engine_version),
        format!(
            "decision_contract_version={}",
            normalized.decision_contract_version
        ),
        format!("rollout_mode={}", normalized.rollout_mode),
        format!("decision={}", normalized.decision),
        format!("reason={}", normalized.reason),
        format!("cpu_score={}", format_score(normalized.cpu_score)),
        format!("entropy_score={}", format_score(normalized.entropy_score)),
        format!(
            "confidence_score={}",
            format_score(normalized.confidence_score)
        ),
    ];
    let mut hasher = Sha256::new();
    hasher.update(lines.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

/// Verifies a stored digest against its canonical input.
#[must_use]
pub fn verify(stored_digest: &str, input: &ReplayInput) -> ReplayVerification {
    let (normalized, legacy_fallback) = normalize(input);
    let stored = stored_digest.trim().to_ascii_lowercase();
    let replayable = !normalized.decision.is_empty();

    let mut out = ReplayVerification {
        contract_version: REPLAY_CONTRACT_VERSION.to_string(),
        replayable,
        status: ReplayStatus::NotReplayable,
        stored_digest: stored.clone(),
        computed_digest: String::new(),
        deterministic_match: false,
        legacy_fallback,
        reason: "decision value is required for deterministic replay".to_string(),
        canonical_input: normalized.clone(),
    };

    if !replayable {
        return out;
    }

    out.computed_digest = digest(&normalized);

    if stored.is_empty() {
        if legacy_fallback {
            out.status = ReplayStatus::LegacyFallback;
            out.reason =
                "legacy decision trace missing replay digest; generated deterministic fallback digest"
                    .to_string();
        } else {
            out.status = ReplayStatus::MissingDigest;
            out.reason = "decision trace missing replay digest".to_string();
        }
        return out;
    }

    if stored == out.computed_digest {
        out.status = ReplayStatus::Match;
        out.deterministic_match = true;
        out.reason = "stored replay digest matches deterministic replay computation".to_string();
    } else {
        out.status = ReplayStatus::Mismatch;
        out.reason =
            "stored replay digest does not match deterministic replay computation".to_string();
    }
    out
}

/// Rounds half-to-even at six decimals; `-0` collapses to `0`.
#[must_use]
pub fn normalize_score(value: f64) -> f64 {
    let rounded = (value * 1_000_000.0).round_ties_even() / 1_000_000.0;
    if rounded == 0.0 { 0.0 } else { rounded }
}

/// Formats a score with exactly six fractional digits.
#[must_use]
pub fn format_score(value: f64) -> String {
    format!("{:.6}", normalize_score(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> ReplayInput {
        ReplayInput {
            decision_engine: "threshold-decider".into(),
            engine_version: "1.1.0".into(),
            decision_contract_version: "decision-trace.v1".into(),
            rollout_mode: "enforce".into(),
            decision: "KILL".into(),
            reason: "CPU 96.0% >= 90.0% for 15s and log repetition 1.00 >= 0.80".into(),
            cpu_score: 100.0,
            entropy_score: 48.75,
            confidence_score: 82.9375,
        }
    }

    #[test]
    fn digest_is_stable() {
        let input = sample_input();
        assert_eq!(digest(&input), digest(&input));
        assert_eq!(digest(&input).len(), 64);
    }

    #[test]
    fn digest_insensitive_to_trim_and_case() {
        let input = sample_input();
        let mut noisy = input.clone();
        noisy.decision = "  kill  ".into();
        noisy.rollout_mode = "ENFORCE".into();
        noisy.reason = format!("  {}  ", input.reason);
        assert_eq!(digest(&input), digest(&noisy));
    }

    #[test]
    fn digest_stable_under_sub_microscore_noise() {
        let input = sample_input();
        let mut noisy = input.clone();
        noisy.cpu_score = 100.000_000_4;
        assert_eq!(digest(&input), digest(&noisy));
    }

    #[test]
    fn negative_zero_collapses() {
        assert_eq!(format_score(-0.0), "0.000000");
        assert_eq!(format_score(-0.000_000_4), "0.000000");
    }

    #[test]
    fn rounds_to_six_decimals() {
        assert_eq!(format_score(0.123_456_74), "0.123457");
        assert_eq!(format_score(0.123_456_44), "0.123456");
        assert_eq!(format_score(1.0 / 3.0), "0.333333");
        assert_eq!(format_score(100.0), "100.000000");
    }

    #[test]
    fn verify_matches_stored_digest() {
        let input = sample_input();
        let stored = digest(&input);
        let verification = verify(&stored, &input);
        assert_eq!(verification.status, ReplayStatus::Match);
        assert!(verification.deterministic_match);
        assert!(!verification.legacy_fallback);
    }

    #[test]
    fn verify_accepts_uppercase_stored_digest() {
        let input = sample_input();
        let stored = digest(&input).to_ascii_uppercase();
        assert_eq!(verify(&stored, &input).status, ReplayStatus::Match);
    }

    #[test]
    fn verify_flags_mismatch() {
        let input = sample_input();
        let mut altered = input.clone();
        altered.reason = "different reason".into();
        let stored = digest(&altered);
        let verification = verify(&stored, &input);
        assert_eq!(verification.status, ReplayStatus::Mismatch);
        assert!(!verification.deterministic_match);
    }

    #[test]
    fn missing_digest_on_modern_row() {
        let verification = verify("", &sample_input());
        assert_eq!(verification.status, ReplayStatus::MissingDigest);
        assert!(!verification.computed_digest.is_empty());
    }

    #[test]
    fn legacy_row_backfills_sentinels() {
        let input = ReplayInput {
            decision: "ALERT".into(),
            reason: "old row".into(),
            cpu_score: 50.0,
            ..ReplayInput::default()
        };
        let verification = verify("", &input);
        assert_eq!(verification.status, ReplayStatus::LegacyFallback);
        assert!(verification.legacy_fallback);
        assert_eq!(verification.canonical_input.decision_engine, LEGACY_ENGINE);
        assert_eq!(
            verification.canonical_input.engine_version,
            LEGACY_ENGINE_VERSION
        );
        assert_eq!(
            verification.canonical_input.decision_contract_version,
            LEGACY_DECISION_CONTRACT
        );
        assert_eq!(
            verification.canonical_input.rollout_mode,
            LEGACY_ROLLOUT_MODE
        );
    }

    #[test]
    fn empty_decision_is_not_replayable() {
        let input = ReplayInput {
            decision: "   ".into(),
            ..sample_input()
        };
        let verification = verify("whatever", &input);
        assert_eq!(verification.status, ReplayStatus::NotReplayable);
        assert!(!verification.replayable);
        assert!(verification.computed_digest.is_empty());
    }
}
