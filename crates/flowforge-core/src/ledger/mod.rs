//! Append-only evidence ledger.
//!
//! Everything the control plane decides or an operator does lands here:
//! incidents, audits, decision traces, and policy dry-runs, all projected
//! into one `events` table the timeline reads from. The store is a single
//! SQLite file in WAL mode behind a writer mutex; UPDATE/DELETE against
//! `events` is rejected by triggers so history cannot be rewritten.

mod store;

#[cfg(test)]
mod tests;

pub use store::{Ledger, LedgerError};

use serde::{Deserialize, Serialize};

/// Kinds of unified events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A recorded incident.
    Incident,
    /// An operator or automatic action.
    Audit,
    /// A decision trace from the policy engine.
    Decision,
    /// A shadow-mode policy evaluation.
    PolicyDryRun,
}

impl EventKind {
    /// Storage identifier for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Incident => "incident",
            Self::Audit => "audit",
            Self::Decision => "decision",
            Self::PolicyDryRun => "policy_dry_run",
        }
    }

    /// Parses a storage identifier.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "incident" => Some(Self::Incident),
            "audit" => Some(Self::Audit),
            "decision" => Some(Self::Decision),
            "policy_dry_run" => Some(Self::PolicyDryRun),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted incident row. `command` and `pattern` are stored encrypted
/// when a master key is configured; this struct always carries the opened
/// (but still sanitized) values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// Row id.
    pub id: i64,
    /// RFC 3339 creation time.
    pub timestamp: String,
    /// Sanitized supervised command.
    pub command: String,
    /// Model or workload label.
    pub model_name: String,
    /// Terminal classification (e.g. `LOOP_DETECTED`).
    pub exit_reason: String,
    /// Peak CPU percent seen during the run.
    pub max_cpu: f64,
    /// Sanitized loop pattern excerpt.
    pub pattern: String,
    /// Rough token spend avoided by the intervention.
    pub token_savings_estimate: f64,
    /// Decision reason.
    pub reason: String,
    /// Decision cpu score.
    pub cpu_score: f64,
    /// Decision entropy score.
    pub entropy_score: f64,
    /// Decision confidence score.
    pub confidence_score: f64,
    /// Recovery posture (e.g. `terminated`, `restarting`).
    pub recovery_status: String,
    /// Restarts consumed when the incident closed.
    pub restart_count: i64,
    /// External correlation UUID.
    pub incident_id: String,
}

/// Fields for a new incident write.
#[derive(Debug, Clone, Default)]
pub struct NewIncident {
    /// Raw command line (sanitized on write).
    pub command: String,
    /// Model or workload label.
    pub model_name: String,
    /// Terminal classification.
    pub exit_reason: String,
    /// Peak CPU percent.
    pub max_cpu: f64,
    /// Raw pattern excerpt (sanitized on write).
    pub pattern: String,
    /// Rough token spend avoided.
    pub token_savings_estimate: f64,
    /// Decision reason (sanitized on write).
    pub reason: String,
    /// Decision cpu score.
    pub cpu_score: f64,
    /// Decision entropy score.
    pub entropy_score: f64,
    /// Decision confidence score.
    pub confidence_score: f64,
    /// Recovery posture.
    pub recovery_status: String,
    /// Restarts consumed.
    pub restart_count: i64,
    /// External correlation UUID; generated when empty.
    pub incident_id: String,
    /// Request that caused the incident, when HTTP-originated.
    pub request_id: String,
}

/// A decision trace as read back from the `events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    /// Row id (trace id).
    pub id: i64,
    /// RFC 3339 creation time.
    pub timestamp: String,
    /// Sanitized command.
    pub command: String,
    /// Child PID at decision time.
    pub pid: i32,
    /// CPU score.
    pub cpu_score: f64,
    /// Entropy score.
    pub entropy_score: f64,
    /// Confidence score.
    pub confidence_score: f64,
    /// Decision value (`CONTINUE`/`ALERT`/`KILL`/`RESTART`).
    pub decision: String,
    /// Decision reason.
    pub reason: String,
    /// Engine name.
    pub decision_engine: String,
    /// Engine version.
    pub engine_version: String,
    /// Decision contract version.
    pub decision_contract_version: String,
    /// Rollout mode.
    pub rollout_mode: String,
    /// Replay contract version stamped at write time.
    pub replay_contract_version: String,
    /// Stored replay digest.
    pub replay_digest: String,
}

/// Normalized projection over all event kinds, used by the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedEvent {
    /// Row id (cursor key).
    pub id: i64,
    /// Stable external id.
    pub event_id: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Run the event belongs to.
    pub run_id: String,
    /// Correlated incident, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    /// Originating request, if HTTP-produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Event kind.
    pub event_type: EventKind,
    /// Short title (e.g. `AUTO_KILL`, `KILL`, `RESTART_BLOCKED`).
    pub title: String,
    /// Acting principal.
    pub actor: String,
    /// Sanitized reason text.
    pub reason_text: String,
    /// Sanitized one-line summary.
    pub summary: String,
    /// Child PID.
    pub pid: i32,
    /// CPU score.
    pub cpu_score: f64,
    /// Entropy score.
    pub entropy_score: f64,
    /// Confidence score.
    pub confidence_score: f64,
    /// Engine name (decision events).
    pub decision_engine: String,
    /// Engine version (decision events).
    pub engine_version: String,
    /// Decision contract version (decision events).
    pub decision_contract_version: String,
    /// Rollout mode (decision events).
    pub rollout_mode: String,
    /// Replay contract version (decision events).
    pub replay_contract_version: String,
    /// Replay digest (decision events).
    pub replay_digest: String,
    /// Opaque kind-specific payload.
    pub payload: serde_json::Value,
}

/// Fields for a generic event append.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    /// Event kind; required.
    pub kind: Option<EventKind>,
    /// Correlated incident id.
    pub incident_id: String,
    /// Originating request id.
    pub request_id: String,
    /// Short title.
    pub title: String,
    /// Acting principal.
    pub actor: String,
    /// Reason text (sanitized on write).
    pub reason_text: String,
    /// Summary (sanitized on write).
    pub summary: String,
    /// Child PID.
    pub pid: i32,
    /// CPU score.
    pub cpu_score: f64,
    /// Entropy score.
    pub entropy_score: f64,
    /// Confidence score.
    pub confidence_score: f64,
    /// Engine name for decision events.
    pub decision_engine: String,
    /// Engine version.
    pub engine_version: String,
    /// Decision contract version.
    pub decision_contract_version: String,
    /// Rollout mode.
    pub rollout_mode: String,
    /// Replay contract version.
    pub replay_contract_version: String,
    /// Replay digest.
    pub replay_digest: String,
    /// Opaque payload map.
    pub payload: serde_json::Value,
}

/// One page of cursor-paginated rows.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Rows, newest first.
    pub items: Vec<T>,
    /// Cursor for the next page, 0 when exhausted.
    pub next_cursor: i64,
    /// Whether older rows remain.
    pub has_more: bool,
}

/// Persisted idempotency record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Mutation scope, e.g. `POST /process/kill`.
    pub scope: String,
    /// SHA-256 of the client key; the raw key is never stored.
    pub key_hash: String,
    /// SHA-256 of the canonical request body.
    pub request_fingerprint: String,
    /// Original response status.
    pub status_code: u16,
    /// Original response body, replayed verbatim.
    pub response_body: String,
    /// RFC 3339 creation time.
    pub created_at: String,
}

/// Aggregate statistics over the idempotency replay cache.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReplayCacheStats {
    /// Persisted rows.
    pub row_count: i64,
    /// Age of the oldest row, seconds.
    pub oldest_age_seconds: i64,
    /// Age of the newest row, seconds.
    pub newest_age_seconds: i64,
}

/// Replays/conflicts observed on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayTrendPoint {
    /// `YYYY-MM-DD` day bucket.
    pub day: String,
    /// Replayed responses that day.
    pub replay_count: i64,
    /// Fingerprint conflicts that day.
    pub conflict_count: i64,
}

/// Persisted signal-baseline streak state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBaselineRecord {
    /// `engine@version|rollout` bucket key.
    pub bucket_key: String,
    /// Latest trace id seen at the last evaluation.
    pub latest_trace_id: i64,
    /// Breach streak.
    pub consecutive_breach_count: i64,
    /// Stored status.
    pub status: String,
    /// When the status last changed.
    pub last_transition_at: String,
    /// When the bucket was last evaluated.
    pub last_checked_at: String,
}

/// A registered integration workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationWorkspace {
    /// Stable workspace id.
    pub workspace_id: String,
    /// Workspace path on disk.
    pub workspace_path: String,
    /// Protection profile.
    pub profile: String,
    /// Registering client.
    pub client: String,
    /// Whether protection is active.
    pub protection_enabled: bool,
    /// PID currently bound to the workspace, 0 when idle.
    pub active_pid: i32,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 last update time.
    pub last_updated: String,
}

/// Outcome of an idempotency check for a `(scope, key)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyOutcome {
    /// No record yet; the caller should execute and persist.
    FirstUse,
    /// Identical request already completed; replay this response.
    Replay {
        /// Original status code.
        status_code: u16,
        /// Original body, byte-for-byte.
        response_body: String,
    },
    /// Same key, different request body.
    Conflict,
}
