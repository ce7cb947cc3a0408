//! Shared control-plane state.
//!
//! Every handler receives an [`AppState`]: explicitly constructed
//! components wired together in the composition root and cloned cheaply
//! behind `Arc`s. Nothing here is process-global; tests build their own
//! hermetic instances.

use std::sync::Arc;

use axum::http::StatusCode;
use flowforge_core::config::Config;
use flowforge_core::ledger::{Ledger, LedgerError};
use flowforge_core::lifecycle::LifecycleHandle;
use flowforge_core::state::ProcessStateHandle;

use crate::idempotency::IdempotencyGate;
use crate::metrics::ControlPlaneMetrics;
use crate::problem::Problem;
use crate::ratelimit::RateLimiter;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Resolved environment configuration.
    pub config: Arc<Config>,
    /// Evidence ledger.
    pub ledger: Arc<Ledger>,
    /// Worker process state.
    pub process_state: ProcessStateHandle,
    /// Lifecycle actor handle.
    pub lifecycle: LifecycleHandle,
    /// Control-plane metrics.
    pub metrics: Arc<ControlPlaneMetrics>,
    /// Per-IP rate limiter.
    pub limiter: Arc<RateLimiter>,
    /// In-flight idempotency slots.
    pub idempotency: Arc<IdempotencyGate>,
}

impl AppState {
    /// Wires up an application state from its parts.
    #[must_use]
    pub fn new(
        config: Config,
        ledger: Arc<Ledger>,
        process_state: ProcessStateHandle,
        lifecycle: LifecycleHandle,
    ) -> Self {
        Self {
            config: Arc::new(config),
            ledger,
            process_state,
            lifecycle,
            metrics: Arc::new(ControlPlaneMetrics::new()),
            limiter: Arc::new(RateLimiter::default()),
            idempotency: Arc::new(IdempotencyGate::default()),
        }
    }

    /// Runs a blocking ledger closure off the async runtime.
    ///
    /// # Errors
    ///
    /// Ledger errors surface as problem documents; a cancelled worker
    /// task maps to an internal problem.
    pub async fn with_ledger<T, F>(&self, f: F) -> Result<T, Problem>
    where
        T: Send + 'static,
        F: FnOnce(&Ledger) -> Result<T, LedgerError> + Send + 'static,
    {
        let ledger = self.ledger.clone();
        match tokio::task::spawn_blocking(move || f(&ledger)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(ledger_problem(&err)),
            Err(join_err) => Err(Problem::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("ledger task failed: {join_err}"),
            )),
        }
    }
}

/// Maps ledger errors onto problem documents.
#[must_use]
pub fn ledger_problem(err: &LedgerError) -> Problem {
    match err {
        LedgerError::NotFound(what) => {
            Problem::new(StatusCode::NOT_FOUND, format!("{what} not found"))
        }
        LedgerError::InvalidInput(detail) => {
            Problem::new(StatusCode::BAD_REQUEST, detail.clone())
        }
        other => Problem::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("database error: {other}"),
        ),
    }
}
