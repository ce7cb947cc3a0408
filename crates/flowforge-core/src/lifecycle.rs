//! Worker lifecycle control plane.
//!
//! All START/STOP/RESTART traffic funnels through a single-consumer
//! mailbox; callers get their reply on a per-request oneshot channel.
//! Because the actor alone mutates lifecycle state, duplicate requests
//! collapse naturally: an identical operation already running answers
//! `IN_PROGRESS`, an identical operation already completed answers
//! `REPLAYED`, and everything else is either `ACCEPTED` or `REJECTED`
//! with an error kind (and a retry-after for budget denials). Every
//! transition is written to the ledger with the originating request id.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::ledger::Ledger;
use crate::state::{LifecyclePhase, ProcessStateHandle, WorkerStatus};
use crate::supervisor::{ChildSpec, Supervisor, SupervisorError, group_member_pids};

/// Mailbox depth; beyond this, callers see `Unavailable`.
const MAILBOX_DEPTH: usize = 64;

/// Lifecycle tuning.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Graceful teardown budget per stop.
    pub stop_timeout: Duration,
    /// Sliding window for the restart budget.
    pub restart_window: Duration,
    /// Accepted restarts allowed inside the window.
    pub max_restarts: usize,
    /// Base delay for failure-class backoff.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(3),
            restart_window: Duration::from_secs(60),
            max_restarts: 3,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Decision statuses returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    /// New action accepted and underway.
    Accepted,
    /// An identical action is already in flight.
    InProgress,
    /// Idempotent replay of a completed action.
    Replayed,
    /// Refused.
    Rejected,
}

impl std::fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Accepted => "ACCEPTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Replayed => "REPLAYED",
            Self::Rejected => "REJECTED",
        };
        write!(f, "{s}")
    }
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Restart budget exhausted.
    BudgetExceeded,
    /// Operation invalid in the current phase.
    WrongState,
    /// Request was malformed (e.g. no spec registered).
    Validation,
    /// The actor is shutting down.
    Unavailable,
    /// Unclassified failure.
    Internal,
}

/// Reply for every control-plane operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleDecision {
    /// Outcome class.
    pub status: DecisionStatus,
    /// Whether new work was actually started by this request.
    pub accepted_new: bool,
    /// Child PID after the decision (0 when none).
    pub pid: i32,
    /// Lifecycle phase after the decision.
    pub lifecycle: LifecyclePhase,
    /// Seconds until a budget denial clears.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    /// Rejection classification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl LifecycleDecision {
    fn rejected(kind: ErrorKind, pid: i32, lifecycle: LifecyclePhase) -> Self {
        Self {
            status: DecisionStatus::Rejected,
            accepted_new: false,
            pid,
            lifecycle,
            retry_after_seconds: None,
            error_kind: Some(kind),
        }
    }
}

/// Failure classes driving the restart backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Initiator {
    /// Operator-requested via the control plane.
    Operator,
    /// Policy engine intervention.
    Policy,
    /// Recovery from an unexpected child exit.
    Crash,
}

impl Initiator {
    const fn index(self) -> usize {
        match self {
            Self::Operator => 0,
            Self::Policy => 1,
            Self::Crash => 2,
        }
    }
}

/// Context accompanying every operation request.
#[derive(Debug, Clone)]
pub struct OpContext {
    /// Acting principal for the audit trail.
    pub actor: String,
    /// Human-readable reason.
    pub reason: String,
    /// Correlating HTTP request id, when any.
    pub request_id: String,
    /// Failure class for backoff bookkeeping.
    pub initiator: Initiator,
    /// Worker status stamped on a successful stop.
    pub stop_status: WorkerStatus,
}

impl OpContext {
    /// Operator context with the given reason.
    #[must_use]
    pub fn operator(reason: &str, request_id: &str, actor: &str) -> Self {
        Self {
            actor: actor.to_string(),
            reason: reason.to_string(),
            request_id: request_id.to_string(),
            initiator: Initiator::Operator,
            stop_status: WorkerStatus::UserTerminated,
        }
    }

    /// Policy-engine context (e.g. loop kill).
    #[must_use]
    pub fn policy(reason: &str, stop_status: WorkerStatus) -> Self {
        Self {
            actor: "flowforge".to_string(),
            reason: reason.to_string(),
            request_id: String::new(),
            initiator: Initiator::Policy,
            stop_status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Start,
    Stop,
    Restart,
}

impl OpKind {
    const fn audit_title(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Stop => "KILL",
            Self::Restart => "RESTART",
        }
    }
}

/// Snapshot of the actor for `/worker/lifecycle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSnapshot {
    /// Current phase.
    pub phase: LifecyclePhase,
    /// Operation currently in flight, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Child PID (0 when none).
    pub pid: i32,
    /// Whether a spec is registered.
    pub managed: bool,
    /// Last operation error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

enum Command {
    Register {
        spec: ChildSpec,
    },
    Operate {
        kind: OpKind,
        ctx: OpContext,
        reply: oneshot::Sender<LifecycleDecision>,
    },
    StopCompleted {
        kind: OpKind,
        ctx: OpContext,
        result: Result<(), SupervisorError>,
    },
    ChildExited {
        pid: i32,
        code: Option<i32>,
    },
    Snapshot {
        reply: oneshot::Sender<ControlSnapshot>,
    },
}

/// Cloneable handle to the lifecycle actor.
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    tx: mpsc::Sender<Command>,
}

impl LifecycleHandle {
    /// Registers (or replaces) the spec the worker runs.
    pub async fn register_spec(&self, spec: ChildSpec) {
        let _ = self.tx.send(Command::Register { spec }).await;
    }

    /// Requests a start.
    pub async fn request_start(&self, ctx: OpContext) -> LifecycleDecision {
        self.operate(OpKind::Start, ctx).await
    }

    /// Requests a stop (kill).
    pub async fn request_stop(&self, ctx: OpContext) -> LifecycleDecision {
        self.operate(OpKind::Stop, ctx).await
    }

    /// Requests a restart.
    pub async fn request_restart(&self, ctx: OpContext) -> LifecycleDecision {
        self.operate(OpKind::Restart, ctx).await
    }

    /// Snapshot of the control state.
    pub async fn snapshot(&self) -> ControlSnapshot {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot { reply }).await.is_ok() {
            if let Ok(snapshot) = rx.await {
                return snapshot;
            }
        }
        ControlSnapshot {
            phase: LifecyclePhase::Stopped,
            operation: None,
            pid: 0,
            managed: false,
            last_error: Some("lifecycle manager unavailable".to_string()),
        }
    }

    async fn operate(&self, kind: OpKind, ctx: OpContext) -> LifecycleDecision {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Operate { kind, ctx, reply })
            .await
            .is_err()
        {
            return LifecycleDecision::rejected(
                ErrorKind::Unavailable,
                0,
                LifecyclePhase::Stopped,
            );
        }
        rx.await.unwrap_or_else(|_| {
            LifecycleDecision::rejected(ErrorKind::Unavailable, 0, LifecyclePhase::Stopped)
        })
    }
}

/// Callback invoked with each newly spawned supervisor, used by the
/// composition root to attach a monitor.
pub type SpawnObserver = Arc<dyn Fn(Arc<Supervisor>) + Send + Sync>;

/// The lifecycle actor.
pub struct LifecycleManager {
    config: LifecycleConfig,
    ledger: Arc<Ledger>,
    state: ProcessStateHandle,
    observer: Option<SpawnObserver>,

    spec: Option<ChildSpec>,
    supervisor: Option<Arc<Supervisor>>,
    phase: LifecyclePhase,
    in_flight: Option<OpKind>,
    last_error: Option<String>,
    restart_times: VecDeque<Instant>,
    failure_streaks: [u32; 3],

    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
}

impl LifecycleManager {
    /// Builds the actor; call [`Self::spawn`] to run it.
    #[must_use]
    pub fn new(
        config: LifecycleConfig,
        ledger: Arc<Ledger>,
        state: ProcessStateHandle,
        observer: Option<SpawnObserver>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        Self {
            config,
            ledger,
            state,
            observer,
            spec: None,
            supervisor: None,
            phase: LifecyclePhase::Stopped,
            in_flight: None,
            last_error: None,
            restart_times: VecDeque::new(),
            failure_streaks: [0; 3],
            tx,
            rx,
        }
    }

    /// Spawns the mailbox loop and returns the caller handle.
    #[must_use]
    pub fn spawn(mut self) -> LifecycleHandle {
        let handle = LifecycleHandle {
            tx: self.tx.clone(),
        };
        tokio::spawn(async move {
            while let Some(command) = self.rx.recv().await {
                self.handle(command).await;
            }
            info!("lifecycle mailbox drained, manager stopped");
        });
        handle
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Register { spec } => {
                self.spec = Some(spec);
            }
            Command::Operate { kind, ctx, reply } => {
                let decision = self.operate(kind, ctx).await;
                let _ = reply.send(decision);
            }
            Command::StopCompleted { kind, ctx, result } => {
                self.finish_stop(kind, ctx, result).await;
            }
            Command::ChildExited { pid, code } => {
                self.child_exited(pid, code);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(ControlSnapshot {
                    phase: self.phase,
                    operation: self.in_flight.map(|k| k.audit_title().to_string()),
                    pid: self.current_pid(),
                    managed: self.spec.is_some(),
                    last_error: self.last_error.clone(),
                });
            }
        }
    }

    fn current_pid(&self) -> i32 {
        self.supervisor.as_ref().map_or(0, |s| s.pid())
    }

    async fn operate(&mut self, kind: OpKind, ctx: OpContext) -> LifecycleDecision {
        // Identical operation already running: no new work.
        if self.in_flight == Some(kind) {
            return LifecycleDecision {
                status: DecisionStatus::InProgress,
                accepted_new: false,
                pid: self.current_pid(),
                lifecycle: self.phase,
                retry_after_seconds: None,
                error_kind: None,
            };
        }
        if self.in_flight.is_some() {
            return LifecycleDecision::rejected(ErrorKind::WrongState, self.current_pid(), self.phase);
        }

        match kind {
            OpKind::Start => self.start(&ctx).await,
            OpKind::Stop => self.stop(ctx).await,
            OpKind::Restart => self.restart(ctx).await,
        }
    }

    async fn start(&mut self, ctx: &OpContext) -> LifecycleDecision {
        if matches!(self.phase, LifecyclePhase::Running | LifecyclePhase::Starting) {
            return LifecycleDecision {
                status: DecisionStatus::Replayed,
                accepted_new: false,
                pid: self.current_pid(),
                lifecycle: self.phase,
                retry_after_seconds: None,
                error_kind: None,
            };
        }
        let Some(spec) = self.spec.clone() else {
            return LifecycleDecision::rejected(ErrorKind::Validation, 0, self.phase);
        };

        if !self.audit(OpKind::Start.audit_title(), ctx, 0).await {
            return LifecycleDecision::rejected(ErrorKind::Internal, 0, self.phase);
        }
        self.set_phase(LifecyclePhase::Starting, Some(WorkerStatus::Starting), -1);
        match self.spawn_child(&spec) {
            Ok(pid) => {
                LifecycleDecision {
                    status: DecisionStatus::Accepted,
                    accepted_new: true,
                    pid,
                    lifecycle: self.phase,
                    retry_after_seconds: None,
                    error_kind: None,
                }
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                self.set_phase(
                    LifecyclePhase::Failed,
                    Some(WorkerStatus::CommandFailure),
                    0,
                );
                let _ = self.audit_detail("COMMAND_FAILURE", ctx, 0, &err.to_string()).await;
                LifecycleDecision::rejected(ErrorKind::Internal, 0, self.phase)
            }
        }
    }

    async fn stop(&mut self, ctx: OpContext) -> LifecycleDecision {
        if matches!(self.phase, LifecyclePhase::Stopped | LifecyclePhase::Failed)
            || self.supervisor.is_none()
        {
            // Stopping an already-stopped worker is an idempotent replay.
            return LifecycleDecision {
                status: DecisionStatus::Replayed,
                accepted_new: false,
                pid: 0,
                lifecycle: self.phase,
                retry_after_seconds: None,
                error_kind: None,
            };
        }

        // The accepted audit is written before anything happens; if the
        // ledger refuses it the action never leaves the previous state.
        let pid = self.current_pid();
        if !self.audit(OpKind::Stop.audit_title(), &ctx, pid).await {
            return LifecycleDecision::rejected(ErrorKind::Internal, pid, self.phase);
        }
        self.begin_stop(OpKind::Stop, ctx);
        LifecycleDecision {
            status: DecisionStatus::Accepted,
            accepted_new: true,
            pid,
            lifecycle: self.phase,
            retry_after_seconds: None,
            error_kind: None,
        }
    }

    async fn restart(&mut self, ctx: OpContext) -> LifecycleDecision {
        if self.spec.is_none() {
            return LifecycleDecision::rejected(ErrorKind::Validation, self.current_pid(), self.phase);
        }
        if let Some(retry_after) = self.budget_denied_for() {
            let _ = self
                .audit_detail(
                    "RESTART_BLOCKED",
                    &ctx,
                    self.current_pid(),
                    &format!(
                        "restart budget exceeded: {} restarts within {:?}; retry after {}s",
                        self.config.max_restarts, self.config.restart_window, retry_after
                    ),
                )
                .await;
            let mut decision = LifecycleDecision::rejected(
                ErrorKind::BudgetExceeded,
                self.current_pid(),
                self.phase,
            );
            decision.retry_after_seconds = Some(retry_after);
            return decision;
        }

        self.restart_times.push_back(Instant::now());
        let pid = self.current_pid();
        if !self.audit(OpKind::Restart.audit_title(), &ctx, pid).await {
            // Ledger refused the accepted audit: give the budget slot
            // back and leave the lifecycle untouched.
            self.restart_times.pop_back();
            return LifecycleDecision::rejected(ErrorKind::Internal, pid, self.phase);
        }

        if self.supervisor.is_some() {
            self.begin_stop(OpKind::Restart, ctx);
        } else {
            // Nothing to tear down; go straight to the spawn half.
            self.finish_stop(OpKind::Restart, ctx, Ok(())).await;
        }
        LifecycleDecision {
            status: DecisionStatus::Accepted,
            accepted_new: true,
            pid: self.current_pid(),
            lifecycle: self.phase,
            retry_after_seconds: None,
            error_kind: None,
        }
    }

    /// Hands the blocking half of a stop to a task so the mailbox keeps
    /// draining (that is what makes IN_PROGRESS observable).
    fn begin_stop(&mut self, kind: OpKind, ctx: OpContext) {
        let Some(supervisor) = self.supervisor.clone() else {
            return;
        };
        self.in_flight = Some(kind);
        self.set_phase(LifecyclePhase::Stopping, Some(WorkerStatus::Stopping), -1);

        let timeout = self.config.stop_timeout;
        let backoff = if kind == OpKind::Restart {
            self.next_backoff(ctx.initiator)
        } else {
            Duration::ZERO
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = supervisor.stop(timeout).await;
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
            let _ = tx.send(Command::StopCompleted { kind, ctx, result }).await;
        });
    }

    async fn finish_stop(
        &mut self,
        kind: OpKind,
        ctx: OpContext,
        result: Result<(), SupervisorError>,
    ) {
        self.in_flight = None;
        let pgid = self.supervisor.as_ref().map_or(0, |s| s.pgid());
        self.supervisor = None;

        match result {
            Ok(()) => {
                self.last_error = None;
                self.reset_backoff(ctx.initiator);
                self.set_phase(LifecyclePhase::Stopped, Some(ctx.stop_status), 0);
            }
            Err(err) => {
                // Mixed teardown results classify the run as failed; any
                // stragglers left in the group are orphan suspects.
                let stragglers = group_member_pids(pgid);
                self.last_error = Some(err.to_string());
                self.bump_backoff(ctx.initiator);
                self.set_phase(LifecyclePhase::Failed, Some(WorkerStatus::Failed), 0);
                let _ = self
                    .audit_detail(
                        "TEARDOWN_FAILED",
                        &ctx,
                        0,
                        &format!(
                            "{err}; orphan suspected: {} group member(s) remain",
                            stragglers.len()
                        ),
                    )
                    .await;
                return;
            }
        }

        if kind == OpKind::Restart {
            let Some(spec) = self.spec.clone() else {
                return;
            };
            self.set_phase(LifecyclePhase::Starting, Some(WorkerStatus::Starting), -1);
            match self.spawn_child(&spec) {
                Ok(pid) => {
                    info!(pid, "worker restarted");
                }
                Err(err) => {
                    self.last_error = Some(err.to_string());
                    self.bump_backoff(ctx.initiator);
                    self.set_phase(
                        LifecyclePhase::Failed,
                        Some(WorkerStatus::CommandFailure),
                        0,
                    );
                    let _ = self
                        .audit_detail("COMMAND_FAILURE", &ctx, 0, &err.to_string())
                        .await;
                }
            }
        }
    }

    fn spawn_child(&mut self, spec: &ChildSpec) -> Result<i32, SupervisorError> {
        let supervisor = Arc::new(Supervisor::start(spec.clone())?);
        let pid = supervisor.pid();

        // Exit watcher: unexpected deaths flow back into the mailbox.
        let tx = self.tx.clone();
        let waiter = supervisor.clone();
        tokio::spawn(async move {
            let code = waiter.wait().await;
            let _ = tx.send(Command::ChildExited { pid, code }).await;
        });

        self.state.update_run(
            0.0,
            "",
            WorkerStatus::Running,
            &spec.command,
            &spec.args,
            spec.dir
                .as_deref()
                .map(|d| d.to_string_lossy().into_owned())
                .unwrap_or_default()
                .as_str(),
            pid,
        );
        self.set_phase(LifecyclePhase::Running, Some(WorkerStatus::Running), pid);

        if let Some(observer) = &self.observer {
            observer(supervisor.clone());
        }
        self.supervisor = Some(supervisor);
        Ok(pid)
    }

    fn child_exited(&mut self, pid: i32, code: Option<i32>) {
        // Expected exits are owned by the in-flight stop/restart.
        if self.in_flight.is_some() || self.current_pid() != pid {
            return;
        }
        if self.phase == LifecyclePhase::Running {
            warn!(pid, ?code, "worker exited unexpectedly");
            self.supervisor = None;
            self.last_error = Some(format!("worker exited unexpectedly (code {code:?})"));
            self.set_phase(LifecyclePhase::Failed, Some(WorkerStatus::CommandFailure), 0);
            let ledger = self.ledger.clone();
            let detail = format!("worker pid {pid} exited unexpectedly with code {code:?}");
            tokio::task::spawn_blocking(move || {
                if let Err(err) =
                    ledger.log_audit("flowforge", "WORKER_EXITED", &detail, "lifecycle", pid, "", "", "")
                {
                    warn!(%err, "failed to audit unexpected exit");
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // Budget & backoff
    // ------------------------------------------------------------------

    /// Returns the retry-after seconds when the budget denies a restart.
    fn budget_denied_for(&mut self) -> Option<u64> {
        let window = self.config.restart_window;
        let now = Instant::now();
        while let Some(front) = self.restart_times.front() {
            if now.duration_since(*front) >= window {
                self.restart_times.pop_front();
            } else {
                break;
            }
        }
        if self.restart_times.len() < self.config.max_restarts {
            return None;
        }
        let oldest = *self.restart_times.front()?;
        let remaining = window.saturating_sub(now.duration_since(oldest));
        Some(remaining.as_secs().max(1))
    }

    fn next_backoff(&mut self, initiator: Initiator) -> Duration {
        let streak = self.failure_streaks[initiator.index()];
        if streak == 0 {
            return Duration::ZERO;
        }
        let exp = streak.min(10);
        let base = self.config.backoff_base.as_millis() as u64;
        let raw = base.saturating_mul(1_u64 << (exp - 1));
        let capped = raw.min(self.config.backoff_max.as_millis() as u64);
        // Jitter keeps co-located agents from thundering in step.
        let jitter = rand::thread_rng().gen_range(0..=capped / 10 + 1);
        Duration::from_millis(capped + jitter)
    }

    fn bump_backoff(&mut self, initiator: Initiator) {
        self.failure_streaks[initiator.index()] =
            self.failure_streaks[initiator.index()].saturating_add(1);
    }

    fn reset_backoff(&mut self, initiator: Initiator) {
        self.failure_streaks[initiator.index()] = 0;
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn set_phase(&mut self, phase: LifecyclePhase, status: Option<WorkerStatus>, pid: i32) {
        self.phase = phase;
        self.state.update_lifecycle(phase, status, pid);
    }

    async fn audit(&self, title: &str, ctx: &OpContext, pid: i32) -> bool {
        let reason = ctx.reason.clone();
        self.audit_detail(title, ctx, pid, &reason).await
    }

    async fn audit_detail(&self, title: &str, ctx: &OpContext, pid: i32, detail: &str) -> bool {
        let ledger = self.ledger.clone();
        let command = self.state.snapshot().command;
        let title = title.to_string();
        let actor = ctx.actor.clone();
        let detail = annotate_request_id(detail, &ctx.request_id);
        let request_id = ctx.request_id.clone();
        let result = tokio::task::spawn_blocking(move || {
            ledger.log_audit(&actor, &title, &detail, "lifecycle", pid, &command, "", &request_id)
        })
        .await;
        match result {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                warn!(%err, "audit append failed");
                false
            }
            Err(err) => {
                warn!(%err, "audit task failed");
                false
            }
        }
    }
}

/// Appends `[request_id=…]` to a reason unless already present.
#[must_use]
pub fn annotate_request_id(reason: &str, request_id: &str) -> String {
    let trimmed = reason.trim();
    let rid = request_id.trim();
    if rid.is_empty() || trimmed.contains("request_id=") {
        return trimmed.to_string();
    }
    if trimmed.is_empty() {
        return format!("request_id={rid}");
    }
    format!("{trimmed} [request_id={rid}]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionPolicy;
    use crate::redact::Redactor;

    fn test_ledger() -> Arc<Ledger> {
        Arc::new(Ledger::in_memory(EncryptionPolicy::Plaintext, Redactor::new()).unwrap())
    }

    fn sleeper_spec() -> ChildSpec {
        ChildSpec::new("sh", vec!["-c".to_string(), "sleep 120".to_string()])
    }

    fn stubborn_spec() -> ChildSpec {
        ChildSpec::new(
            "sh",
            vec!["-c".to_string(), "trap '' TERM; sleep 120".to_string()],
        )
    }

    async fn spawn_manager(config: LifecycleConfig) -> (LifecycleHandle, Arc<Ledger>) {
        let ledger = test_ledger();
        let state = ProcessStateHandle::new();
        let manager = LifecycleManager::new(config, ledger.clone(), state, None);
        (manager.spawn(), ledger)
    }

    async fn wait_phase(handle: &LifecycleHandle, phase: LifecyclePhase) {
        for _ in 0..200 {
            if handle.snapshot().await.phase == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("phase {phase} not reached");
    }

    #[tokio::test]
    async fn start_stop_round_trip() {
        let (handle, _ledger) = spawn_manager(LifecycleConfig::default()).await;
        handle.register_spec(sleeper_spec()).await;

        let started = handle
            .request_start(OpContext::operator("boot", "req_1", "api-key"))
            .await;
        assert_eq!(started.status, DecisionStatus::Accepted);
        assert!(started.accepted_new);
        assert!(started.pid > 0);

        // Starting again while running replays.
        let again = handle
            .request_start(OpContext::operator("boot", "req_2", "api-key"))
            .await;
        assert_eq!(again.status, DecisionStatus::Replayed);
        assert!(!again.accepted_new);

        let stopped = handle
            .request_stop(OpContext::operator("op kill", "req_3", "api-key"))
            .await;
        assert_eq!(stopped.status, DecisionStatus::Accepted);
        wait_phase(&handle, LifecyclePhase::Stopped).await;

        // Stopping a stopped worker replays.
        let re_stop = handle
            .request_stop(OpContext::operator("again", "req_4", "api-key"))
            .await;
        assert_eq!(re_stop.status, DecisionStatus::Replayed);
    }

    #[tokio::test]
    async fn start_without_spec_is_validation_error() {
        let (handle, _ledger) = spawn_manager(LifecycleConfig::default()).await;
        let decision = handle
            .request_start(OpContext::operator("boot", "", "api-key"))
            .await;
        assert_eq!(decision.status, DecisionStatus::Rejected);
        assert_eq!(decision.error_kind, Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn concurrent_restarts_collapse_to_in_progress() {
        let config = LifecycleConfig {
            stop_timeout: Duration::from_millis(400),
            ..LifecycleConfig::default()
        };
        let (handle, _ledger) = spawn_manager(config).await;
        handle.register_spec(stubborn_spec()).await;
        handle
            .request_start(OpContext::operator("boot", "", "api-key"))
            .await;

        // The stubborn child ignores TERM, so the stop half of the
        // restart holds the in-flight slot for ~400ms.
        let first = handle
            .request_restart(OpContext::operator("op restart", "req_a", "api-key"))
            .await;
        assert_eq!(first.status, DecisionStatus::Accepted);

        let second = handle
            .request_restart(OpContext::operator("op restart", "req_b", "api-key"))
            .await;
        assert_eq!(second.status, DecisionStatus::InProgress);
        assert!(!second.accepted_new);

        wait_phase(&handle, LifecyclePhase::Running).await;
        handle
            .request_stop(OpContext::operator("cleanup", "", "api-key"))
            .await;
        wait_phase(&handle, LifecyclePhase::Stopped).await;
    }

    #[tokio::test]
    async fn restart_budget_denies_with_retry_after() {
        let config = LifecycleConfig {
            restart_window: Duration::from_secs(60),
            max_restarts: 3,
            stop_timeout: Duration::from_millis(300),
            ..LifecycleConfig::default()
        };
        let (handle, ledger) = spawn_manager(config).await;
        handle.register_spec(sleeper_spec()).await;
        handle
            .request_start(OpContext::operator("boot", "", "api-key"))
            .await;
        wait_phase(&handle, LifecyclePhase::Running).await;

        for attempt in 0..3 {
            let decision = handle
                .request_restart(OpContext::operator("op", &format!("req_{attempt}"), "api-key"))
                .await;
            assert_eq!(decision.status, DecisionStatus::Accepted, "attempt {attempt}");
            wait_phase(&handle, LifecyclePhase::Running).await;
        }

        let denied = handle
            .request_restart(OpContext::operator("op", "req_denied", "api-key"))
            .await;
        assert_eq!(denied.status, DecisionStatus::Rejected);
        assert_eq!(denied.error_kind, Some(ErrorKind::BudgetExceeded));
        let retry_after = denied.retry_after_seconds.expect("retry after");
        assert!(retry_after >= 1 && retry_after <= 60, "{retry_after}");

        let blocked: Vec<_> = ledger
            .timeline(50)
            .unwrap()
            .into_iter()
            .filter(|e| e.title == "RESTART_BLOCKED")
            .collect();
        assert_eq!(blocked.len(), 1);
        assert!(
            blocked[0]
                .reason_text
                .contains("request_id=req_denied"),
            "{}",
            blocked[0].reason_text
        );

        handle
            .request_stop(OpContext::operator("cleanup", "", "api-key"))
            .await;
        wait_phase(&handle, LifecyclePhase::Stopped).await;
    }

    #[tokio::test]
    async fn unexpected_exit_fails_the_phase() {
        let (handle, ledger) = spawn_manager(LifecycleConfig::default()).await;
        handle.register_spec(ChildSpec::new(
            "sh",
            vec!["-c".to_string(), "exit 3".to_string()],
        ))
        .await;
        handle
            .request_start(OpContext::operator("boot", "", "api-key"))
            .await;
        wait_phase(&handle, LifecyclePhase::Failed).await;

        // Audit lands asynchronously.
        for _ in 0..100 {
            let exited = ledger
                .timeline(20)
                .unwrap()
                .into_iter()
                .any(|e| e.title == "WORKER_EXITED");
            if exited {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("WORKER_EXITED audit not written");
    }

    #[tokio::test]
    async fn audits_carry_request_ids() {
        let (handle, ledger) = spawn_manager(LifecycleConfig::default()).await;
        handle.register_spec(sleeper_spec()).await;
        handle
            .request_start(OpContext::operator("boot", "req_chain", "api-key"))
            .await;
        handle
            .request_stop(OpContext::operator("kill", "req_chain", "api-key"))
            .await;
        wait_phase(&handle, LifecyclePhase::Stopped).await;

        let chain = ledger.events_by_request_id("req_chain", 50).unwrap();
        assert!(chain.len() >= 2, "expected start+kill audits, got {chain:?}");
        assert!(chain.iter().any(|e| e.title == "START"));
        assert!(chain.iter().any(|e| e.title == "KILL"));
    }

    #[test]
    fn request_id_annotation() {
        assert_eq!(annotate_request_id("r", "id1"), "r [request_id=id1]");
        assert_eq!(annotate_request_id("", "id1"), "request_id=id1");
        assert_eq!(annotate_request_id("r", ""), "r");
        assert_eq!(
            annotate_request_id("already request_id=x", "id1"),
            "already request_id=x"
        );
    }
}
