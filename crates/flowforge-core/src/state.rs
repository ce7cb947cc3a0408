//! Shared worker process state.
//!
//! Exactly one [`ProcessStateHandle`] exists per daemon; the lifecycle
//! manager and monitor write through it and HTTP readers take deep-copy
//! snapshots, so a returned [`ProcessState`] can never alias internal
//! mutable data. The handle is constructed in the composition root and
//! passed down explicitly.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// Observable worker status, including watchdog verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Spawn requested, child not confirmed yet.
    Starting,
    /// Child is running normally.
    Running,
    /// Graceful teardown in progress.
    Stopping,
    /// No child.
    #[default]
    Stopped,
    /// Policy engine identified an unproductive loop.
    LoopDetected,
    /// Policy engine raised an alert without terminating.
    WatchdogAlert,
    /// FD/socket probing heuristics fired.
    ProbingDetected,
    /// A hard safety limit terminated the run.
    SafetyLimitExceeded,
    /// The command itself failed to run.
    CommandFailure,
    /// An operator terminated the run.
    UserTerminated,
    /// Teardown could not confirm the tree is gone.
    Failed,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::LoopDetected => "LOOP_DETECTED",
            Self::WatchdogAlert => "WATCHDOG_ALERT",
            Self::ProbingDetected => "PROBING_DETECTED",
            Self::SafetyLimitExceeded => "SAFETY_LIMIT_EXCEEDED",
            Self::CommandFailure => "COMMAND_FAILURE",
            Self::UserTerminated => "USER_TERMINATED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Coarse lifecycle phase of the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecyclePhase {
    /// Start accepted, child coming up.
    Starting,
    /// Child running.
    Running,
    /// Stop accepted, teardown underway.
    Stopping,
    /// No child.
    #[default]
    Stopped,
    /// Unexpected exit or failed teardown.
    Failed,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of the supervised worker, serialized for `/worker/lifecycle`
/// and the SSE stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessState {
    /// Rolling CPU percent.
    pub cpu: f64,
    /// Most recent (redacted) output line.
    pub last_line: String,
    /// Watchdog status.
    pub status: WorkerStatus,
    /// Supervised command.
    pub command: String,
    /// Exact arguments, kept for restart.
    pub args: Vec<String>,
    /// Working directory.
    pub dir: String,
    /// Child PID, 0 when stopped.
    pub pid: i32,
    /// Last decision reason.
    pub reason: String,
    /// Last decision cpu score.
    pub cpu_score: f64,
    /// Last decision entropy score.
    #[serde(rename = "entropy_score")]
    pub entropy_score: f64,
    /// Last decision confidence score.
    #[serde(rename = "confidence_score")]
    pub confidence_score: f64,
    /// Lifecycle phase.
    pub lifecycle: LifecyclePhase,
    /// Milliseconds since the Unix epoch of the last mutation.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
}

#[derive(Debug, Default)]
struct Inner {
    state: ProcessState,
    lifecycle_override: Option<LifecyclePhase>,
}

/// Single-writer handle over the worker state.
#[derive(Debug, Clone, Default)]
pub struct ProcessStateHandle {
    inner: Arc<RwLock<Inner>>,
}

impl ProcessStateHandle {
    /// Creates an empty handle (stopped worker).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the run identity and telemetry portion of the state.
    #[allow(clippy::too_many_arguments)]
    pub fn update_run(
        &self,
        cpu: f64,
        last_line: &str,
        status: WorkerStatus,
        command: &str,
        args: &[String],
        dir: &str,
        pid: i32,
    ) {
        let mut inner = self.inner.write().expect("state lock");
        let previous = inner.state.clone();
        inner.state = ProcessState {
            cpu,
            last_line: last_line.to_string(),
            status,
            command: command.to_string(),
            args: args.to_vec(),
            dir: dir.to_string(),
            pid,
            reason: previous.reason,
            cpu_score: previous.cpu_score,
            entropy_score: previous.entropy_score,
            confidence_score: previous.confidence_score,
            lifecycle: derive_lifecycle(status, pid),
            timestamp_ms: now_ms(),
        };
        if let Some(overridden) = inner.lifecycle_override {
            inner.state.lifecycle = overridden;
        }
    }

    /// Updates decision diagnostics, preserving run identity.
    pub fn update_decision(
        &self,
        reason: &str,
        cpu_score: f64,
        entropy_score: f64,
        confidence_score: f64,
    ) {
        let mut inner = self.inner.write().expect("state lock");
        inner.state.reason = reason.to_string();
        inner.state.cpu_score = cpu_score;
        inner.state.entropy_score = entropy_score;
        inner.state.confidence_score = confidence_score;
        inner.state.timestamp_ms = now_ms();
    }

    /// Updates lifecycle metadata while preserving telemetry.
    ///
    /// Transitional phases (starting/stopping/failed) stick as an
    /// override until a terminal running/stopped update clears them, so a
    /// racing monitor tick cannot mask an in-flight operation. A negative
    /// `pid` preserves the current PID.
    pub fn update_lifecycle(
        &self,
        lifecycle: LifecyclePhase,
        status: Option<WorkerStatus>,
        pid: i32,
    ) {
        let mut inner = self.inner.write().expect("state lock");
        inner.lifecycle_override = match lifecycle {
            LifecyclePhase::Starting | LifecyclePhase::Stopping | LifecyclePhase::Failed => {
                Some(lifecycle)
            }
            LifecyclePhase::Running | LifecyclePhase::Stopped => None,
        };
        inner.state.lifecycle = lifecycle;
        if let Some(status) = status {
            inner.state.status = status;
        }
        if pid >= 0 {
            inner.state.pid = pid;
        }
        inner.state.timestamp_ms = now_ms();
    }

    /// Deep-copy snapshot for readers.
    #[must_use]
    pub fn snapshot(&self) -> ProcessState {
        self.inner.read().expect("state lock").state.clone()
    }
}

/// Derives the lifecycle phase implied by a watchdog status.
#[must_use]
pub fn derive_lifecycle(status: WorkerStatus, _pid: i32) -> LifecyclePhase {
    match status {
        WorkerStatus::Starting => LifecyclePhase::Starting,
        WorkerStatus::Running => LifecyclePhase::Running,
        WorkerStatus::Stopping => LifecyclePhase::Stopping,
        WorkerStatus::Stopped => LifecyclePhase::Stopped,
        WorkerStatus::Failed => LifecyclePhase::Failed,
        WorkerStatus::WatchdogAlert | WorkerStatus::ProbingDetected => LifecyclePhase::Running,
        WorkerStatus::LoopDetected
        | WorkerStatus::SafetyLimitExceeded
        | WorkerStatus::CommandFailure
        | WorkerStatus::UserTerminated => LifecyclePhase::Stopped,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_a_deep_copy() {
        let handle = ProcessStateHandle::new();
        handle.update_run(
            10.0,
            "line",
            WorkerStatus::Running,
            "python3",
            &["worker.py".to_string()],
            "/tmp",
            42,
        );
        let mut snap = handle.snapshot();
        snap.args.push("mutated".to_string());
        snap.cpu = 999.0;
        let fresh = handle.snapshot();
        assert_eq!(fresh.args, vec!["worker.py".to_string()]);
        assert_eq!(fresh.cpu, 10.0);
    }

    #[test]
    fn decision_update_preserves_identity() {
        let handle = ProcessStateHandle::new();
        handle.update_run(
            50.0,
            "out",
            WorkerStatus::Running,
            "cmd",
            &[],
            ".",
            7,
        );
        handle.update_decision("loop suspected", 90.0, 12.0, 88.0);
        let snap = handle.snapshot();
        assert_eq!(snap.command, "cmd");
        assert_eq!(snap.pid, 7);
        assert_eq!(snap.reason, "loop suspected");
        assert_eq!(snap.cpu_score, 90.0);
    }

    #[test]
    fn watchdog_statuses_map_to_phases() {
        assert_eq!(
            derive_lifecycle(WorkerStatus::WatchdogAlert, 9),
            LifecyclePhase::Running
        );
        assert_eq!(
            derive_lifecycle(WorkerStatus::LoopDetected, 0),
            LifecyclePhase::Stopped
        );
        assert_eq!(
            derive_lifecycle(WorkerStatus::Failed, 0),
            LifecyclePhase::Failed
        );
    }

    #[test]
    fn transitional_override_survives_run_updates() {
        let handle = ProcessStateHandle::new();
        handle.update_lifecycle(LifecyclePhase::Stopping, Some(WorkerStatus::Stopping), -1);
        // Monitor tick lands while the stop is still in flight.
        handle.update_run(5.0, "", WorkerStatus::Running, "cmd", &[], ".", 7);
        assert_eq!(handle.snapshot().lifecycle, LifecyclePhase::Stopping);
        // Terminal update clears the override.
        handle.update_lifecycle(LifecyclePhase::Stopped, Some(WorkerStatus::Stopped), 0);
        handle.update_run(0.0, "", WorkerStatus::Running, "cmd", &[], ".", 8);
        assert_eq!(handle.snapshot().lifecycle, LifecyclePhase::Running);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&WorkerStatus::LoopDetected).unwrap();
        assert_eq!(json, "\"LOOP_DETECTED\"");
        let json = serde_json::to_string(&LifecyclePhase::Stopping).unwrap();
        assert_eq!(json, "\"STOPPING\"");
    }
}
