//! HTTP route handlers.
//!
//! Every route is registered under both its legacy path and the `/v1`
//! alias; list endpoints keep the legacy bare-array shape while `/v1`
//! adds cursor-paginated envelopes. Mutations run auth and the
//! idempotency protocol before touching the lifecycle actor, and all
//! errors leave as RFC 7807 problem documents.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::Extension;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tokio::time::Instant;

use flowforge_core::ledger::UnifiedEvent;
use flowforge_core::lifecycle::{DecisionStatus, ErrorKind, LifecycleDecision, OpContext};
use flowforge_core::policy::replay::ReplayStatus;

use crate::auth::require_auth;
use crate::clouddeps;
use crate::idempotency::{self, IdempotencyBegin};
use crate::middleware::RequestCtx;
use crate::ops::{
    self, BaselineBuildOptions, BaselineFilter, build_baseline_summary, build_replay_health,
    replay_input_for,
};
use crate::problem::Problem;
use crate::state::AppState;

/// Default page size for cursor pagination.
const DEFAULT_PAGE_LIMIT: usize = 100;
/// Page size ceiling.
const MAX_PAGE_LIMIT: usize = 500;
/// Default/maximum sample sizes for the ops scans.
const DEFAULT_OPS_LIMIT: usize = 500;
/// Ops scan ceiling.
const MAX_OPS_LIMIT: usize = 5000;

type Params = Query<HashMap<String, String>>;

// ---------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------

fn json_ok<T: serde::Serialize>(value: &T) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()),
    )
        .into_response()
}

fn parse_limit(
    params: &HashMap<String, String>,
    default: usize,
    max: usize,
) -> Result<usize, String> {
    match params.get("limit").map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => match raw.parse::<usize>() {
            Ok(v) if (1..=max).contains(&v) => Ok(v),
            _ => Err(format!("limit must be an integer between 1 and {max}")),
        },
    }
}

fn parse_cursor(params: &HashMap<String, String>) -> Result<i64, String> {
    match params.get("cursor").map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(0),
        Some(raw) => match raw.parse::<i64>() {
            Ok(v) if v > 0 => Ok(v),
            _ => Err("cursor must be a positive integer".to_string()),
        },
    }
}

fn parse_bool(params: &HashMap<String, String>, key: &str) -> bool {
    matches!(
        params
            .get(key)
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

fn bad_request(ctx: &RequestCtx, path: &str, detail: String) -> Problem {
    Problem::new(StatusCode::BAD_REQUEST, detail)
        .instance(path)
        .request_id(&ctx.request_id)
}

fn is_v1(uri: &Uri) -> bool {
    uri.path().starts_with("/v1/")
}

fn page_envelope<T: serde::Serialize>(
    items: &[T],
    next_cursor: i64,
    has_more: bool,
    limit: usize,
) -> Value {
    let mut envelope = json!({
        "items": items,
        "has_more": has_more,
        "limit": limit,
    });
    if has_more && next_cursor > 0 {
        envelope["next_cursor"] = Value::String(next_cursor.to_string());
    }
    envelope
}

/// Extracts the optional `{"reason": …}` body of a mutation.
fn mutation_reason(body: &[u8]) -> String {
    if body.is_empty() || body.len() > 2048 {
        return String::new();
    }
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("reason").and_then(Value::as_str).map(str::trim).map(String::from))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------

/// `GET /incidents` and `GET /v1/incidents`.
pub async fn incidents(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    Query(params): Params,
) -> Result<Response, Problem> {
    if is_v1(&uri) {
        let limit = parse_limit(&params, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT)
            .map_err(|e| bad_request(&ctx, uri.path(), e))?;
        let cursor = parse_cursor(&params).map_err(|e| bad_request(&ctx, uri.path(), e))?;
        let page = app
            .with_ledger(move |ledger| ledger.incidents_page(limit, cursor))
            .await?;
        return Ok(json_ok(&page_envelope(
            &page.items,
            page.next_cursor,
            page.has_more,
            limit,
        )));
    }
    let items = app.with_ledger(|ledger| ledger.get_incidents(100)).await?;
    Ok(json_ok(&items))
}

/// `GET /timeline` and `GET /v1/timeline`, with `incident_id` filter.
pub async fn timeline(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    Query(params): Params,
) -> Result<Response, Problem> {
    if let Some(incident_id) = params
        .get("incident_id")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        let events = app
            .with_ledger(move |ledger| ledger.incident_timeline(&incident_id, 500))
            .await?;
        return Ok(json_ok(&events));
    }

    if is_v1(&uri) {
        let limit = parse_limit(&params, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT)
            .map_err(|e| bad_request(&ctx, uri.path(), e))?;
        let cursor = parse_cursor(&params).map_err(|e| bad_request(&ctx, uri.path(), e))?;
        let page = app
            .with_ledger(move |ledger| ledger.timeline_page(limit, cursor))
            .await?;
        return Ok(json_ok(&page_envelope(
            &page.items,
            page.next_cursor,
            page.has_more,
            limit,
        )));
    }
    let events = app.with_ledger(|ledger| ledger.timeline(100)).await?;
    Ok(json_ok(&events))
}

/// `GET /worker/lifecycle`.
pub async fn worker_lifecycle(State(app): State<AppState>) -> Response {
    let control = app.lifecycle.snapshot().await;
    let snap = app.process_state.snapshot();
    json_ok(&json!({
        "phase": control.phase,
        "operation": control.operation,
        "pid": control.pid,
        "managed": control.managed,
        "last_error": control.last_error,
        "status": snap.status,
        "lifecycle": snap.lifecycle,
        "command": snap.command,
        "timestamp": snap.timestamp_ms,
    }))
}

/// `GET /stream` — process-state snapshots every 500 ms.
pub async fn stream(State(app): State<AppState>) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let state = app.process_state.clone();
    let interval = tokio::time::interval(Duration::from_millis(500));
    let stream = futures::stream::unfold(interval, move |mut interval| {
        let state = state.clone();
        async move {
            interval.tick().await;
            let data = serde_json::to_string(&state.snapshot()).unwrap_or_else(|_| "{}".into());
            Some((Ok(Event::default().data(data)), interval))
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `GET /healthz`.
pub async fn healthz() -> Response {
    json_ok(&json!({ "status": "ok" }))
}

/// `GET /readyz` — database plus optional cloud dependency probes.
pub async fn readyz(State(app): State<AppState>) -> Response {
    let mut ready = true;
    let mut checks = serde_json::Map::new();

    let mut db_check = json!({ "name": "database", "healthy": true, "target": "sqlite" });
    if let Err(problem) = app.with_ledger(|ledger| ledger.replay_cache_stats()).await {
        db_check["healthy"] = Value::Bool(false);
        db_check["error"] = Value::String(problem.detail);
        ready = false;
    }
    checks.insert("database".to_string(), db_check);

    let cloud_required = app.config.cloud.required;
    if cloud_required {
        let (results, cloud_healthy) = clouddeps::probe(&app.config.cloud).await;
        for result in results {
            checks.insert(result.name.clone(), serde_json::to_value(&result).unwrap_or_default());
        }
        if !cloud_healthy {
            ready = false;
        }
    }

    let payload = json!({
        "status": if ready { "ready" } else { "not-ready" },
        "cloud_dependencies_required": cloud_required,
        "checks": checks,
    });
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        payload.to_string(),
    )
        .into_response()
}

/// `GET /metrics` — registry families plus computed ledger sections.
pub async fn metrics(State(app): State<AppState>) -> Response {
    let snap = app.process_state.snapshot();
    app.metrics
        .set_worker_active(snap.pid > 0 && snap.status != flowforge_core::state::WorkerStatus::Stopped);

    let mut body = app
        .metrics
        .encode_text()
        .unwrap_or_else(|err| format!("# metrics encoding failed: {err}\n"));

    let tuning = app.config.baseline;
    let replay_limit = app.config.replay_health_limit;
    let baseline_limit = tuning.sample_limit;
    let ledger = app.ledger.clone();
    let sections = tokio::task::spawn_blocking(move || {
        let cache = ops::replay_cache_prometheus(ledger.replay_cache_stats());
        let health = ops::replay_health_prometheus(
            build_replay_health(&ledger, replay_limit),
            replay_limit,
        );
        let baseline = ops::baseline_prometheus(
            build_baseline_summary(
                &ledger,
                baseline_limit,
                &BaselineFilter::default(),
                &tuning,
                &BaselineBuildOptions {
                    persist_state: true,
                    emit_audit_transitions: false,
                    request_id: String::new(),
                },
            ),
            baseline_limit,
            &tuning,
        );
        format!("{cache}{health}{baseline}")
    })
    .await
    .unwrap_or_else(|err| format!("# ledger sections failed: {err}\n"));
    body.push_str(&sections);

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

// ---------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------

/// `POST /process/kill`.
pub async fn process_kill(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_lifecycle_mutation(&app, &ctx, &uri, &headers, &body, Mutation::Kill).await
}

/// `POST /process/restart`.
pub async fn process_restart(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_lifecycle_mutation(&app, &ctx, &uri, &headers, &body, Mutation::Restart).await
}

/// Guard for non-POST unsafe methods on mutating routes: the auth
/// contract applies to every unsafe method, so an unconfigured key
/// yields the same stable 403 before the 405 is considered.
pub async fn unsafe_method_guard(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if let Err(problem) = require_auth(&app, &headers, &ctx, uri.path()) {
        return problem.into_response();
    }
    Problem::new(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
        .instance(uri.path())
        .request_id(&ctx.request_id)
        .into_response()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mutation {
    Kill,
    Restart,
}

impl Mutation {
    const fn scope(self) -> &'static str {
        match self {
            Self::Kill => "POST /process/kill",
            Self::Restart => "POST /process/restart",
        }
    }

    const fn default_reason(self) -> &'static str {
        match self {
            Self::Kill => "manual API kill request",
            Self::Restart => "manual API restart request",
        }
    }
}

async fn run_lifecycle_mutation(
    app: &AppState,
    ctx: &RequestCtx,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
    mutation: Mutation,
) -> Response {
    let path = uri.path();

    let actor = match require_auth(app, headers, ctx, path) {
        Ok(actor) => actor,
        Err(problem) => return problem.into_response(),
    };

    let ticket = match idempotency::begin(app, mutation.scope(), headers, body, ctx, path).await {
        IdempotencyBegin::Respond(response) => return response,
        IdempotencyBegin::Execute(ticket) => Some(ticket),
        IdempotencyBegin::NoKey => None,
    };

    let mut reason = mutation_reason(body);
    if reason.is_empty() {
        reason = mutation.default_reason().to_string();
    }
    let op_ctx = OpContext::operator(&reason, &ctx.request_id, &actor);

    let started = Instant::now();
    let decision = match mutation {
        Mutation::Kill => app.lifecycle.request_stop(op_ctx).await,
        Mutation::Restart => app.lifecycle.request_restart(op_ctx).await,
    };
    let elapsed = started.elapsed().as_secs_f64();

    if decision.status == DecisionStatus::Rejected {
        let problem = rejection_problem(ctx, path, &decision);
        let (status, body_text, retry_after) = problem_parts(&problem, &decision);
        if let Some(ticket) = ticket {
            idempotency::persist(app, ticket, status, &body_text).await;
        }
        let mut response = problem.into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        return response;
    }

    if decision.accepted_new {
        match mutation {
            Mutation::Kill => {
                app.metrics.inc_process_kill();
                app.metrics.observe_stop(elapsed);
            }
            Mutation::Restart => {
                app.metrics.inc_process_restart();
                app.metrics.observe_restart(elapsed);
            }
        }
    }

    let snap = app.process_state.snapshot();
    let mut payload = json!({
        "status": decision.status,
        "pid": decision.pid,
        "lifecycle": decision.lifecycle,
    });
    if mutation == Mutation::Restart {
        payload["command"] = Value::String(snap.command);
    }
    let body_text = payload.to_string();
    if let Some(ticket) = ticket {
        idempotency::persist(app, ticket, StatusCode::ACCEPTED, &body_text).await;
    }
    (
        StatusCode::ACCEPTED,
        [(header::CONTENT_TYPE, "application/json")],
        body_text,
    )
        .into_response()
}

fn rejection_problem(ctx: &RequestCtx, path: &str, decision: &LifecycleDecision) -> Problem {
    let (status, detail) = match decision.error_kind {
        Some(ErrorKind::BudgetExceeded) => (
            StatusCode::TOO_MANY_REQUESTS,
            format!(
                "restart budget exceeded; retry after {}s",
                decision.retry_after_seconds.unwrap_or(0)
            ),
        ),
        Some(ErrorKind::WrongState) => (
            StatusCode::CONFLICT,
            "operation not valid in the current lifecycle state".to_string(),
        ),
        Some(ErrorKind::Validation) => (
            StatusCode::BAD_REQUEST,
            "no worker spec registered for this operation".to_string(),
        ),
        Some(ErrorKind::Unavailable) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "lifecycle manager unavailable".to_string(),
        ),
        Some(ErrorKind::Internal) | None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "lifecycle operation failed".to_string(),
        ),
    };
    let mut problem = Problem::new(status, detail)
        .instance(path)
        .request_id(&ctx.request_id);
    if let Some(retry) = decision.retry_after_seconds {
        problem = problem.with("retry_after_seconds", json!(retry));
    }
    problem
}

fn problem_parts(
    problem: &Problem,
    decision: &LifecycleDecision,
) -> (StatusCode, String, Option<u64>) {
    (
        problem.status,
        problem.body().to_string(),
        decision.retry_after_seconds,
    )
}

// ---------------------------------------------------------------------
// Ops: decision intelligence
// ---------------------------------------------------------------------

/// `GET /v1/ops/decisions/replay/{trace_id}`.
pub async fn decision_replay(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    Path(raw_trace_id): Path<String>,
    Query(params): Params,
) -> Result<Response, Problem> {
    let trace_id: i64 = raw_trace_id
        .trim()
        .parse()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| {
            bad_request(&ctx, uri.path(), "trace_id must be a positive integer".to_string())
        })?;

    let trace = app
        .with_ledger(move |ledger| ledger.decision_trace_by_id(trace_id))
        .await?;
    let verification =
        flowforge_core::policy::replay::verify(&trace.replay_digest, &replay_input_for(&trace));

    let payload = json!({
        "trace_id": trace.id,
        "timestamp": trace.timestamp,
        "command": trace.command,
        "pid": trace.pid,
        "decision": trace.decision,
        "reason": trace.reason,
        "cpu_score": trace.cpu_score,
        "entropy_score": trace.entropy_score,
        "confidence_score": trace.confidence_score,
        "decision_engine": trace.decision_engine,
        "engine_version": trace.engine_version,
        "decision_contract_version": trace.decision_contract_version,
        "rollout_mode": trace.rollout_mode,
        "trace_replay_contract_version": trace.replay_contract_version.trim(),
        "trace_replay_digest": trace.replay_digest.trim(),
        "replay_contract_version": verification.contract_version,
        "replay_status": verification.status,
        "replayable": verification.replayable,
        "deterministic_match": verification.deterministic_match,
        "legacy_fallback": verification.legacy_fallback,
        "replay_reason": verification.reason,
        "stored_replay_digest": verification.stored_digest,
        "computed_replay_digest": verification.computed_digest,
        "canonical_input": verification.canonical_input,
    });

    if parse_bool(&params, "strict") && verification.status != ReplayStatus::Match {
        return Ok(Problem::new(
            StatusCode::CONFLICT,
            format!("decision replay strict check failed: {}", verification.status),
        )
        .instance(uri.path())
        .request_id(&ctx.request_id)
        .with("replay", payload)
        .into_response());
    }
    Ok(json_ok(&payload))
}

/// `GET /v1/ops/decisions/replay/health`.
pub async fn decision_replay_health(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    Query(params): Params,
) -> Result<Response, Problem> {
    let limit = parse_limit(&params, DEFAULT_OPS_LIMIT, MAX_OPS_LIMIT)
        .map_err(|e| bad_request(&ctx, uri.path(), e))?;
    let summary = app
        .with_ledger(move |ledger| build_replay_health(ledger, limit))
        .await?;

    if parse_bool(&params, "strict") && !summary.healthy {
        return Ok(Problem::new(
            StatusCode::CONFLICT,
            "decision replay strict health check failed",
        )
        .instance(uri.path())
        .request_id(&ctx.request_id)
        .with("replay_health", serde_json::to_value(&summary).unwrap_or_default())
        .into_response());
    }
    Ok(json_ok(&summary))
}

/// `GET /v1/ops/decisions/signals/baseline`.
pub async fn decision_signal_baseline(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    Query(params): Params,
) -> Result<Response, Problem> {
    let limit = parse_limit(&params, app.config.baseline.sample_limit, MAX_OPS_LIMIT)
        .map_err(|e| bad_request(&ctx, uri.path(), e))?;
    let filter = BaselineFilter {
        engine: params.get("engine").cloned().unwrap_or_default(),
        engine_version: params.get("engine_version").cloned().unwrap_or_default(),
        rollout_mode: params.get("rollout_mode").cloned().unwrap_or_default(),
    }
    .normalized();
    let tuning = app.config.baseline;
    let options = BaselineBuildOptions {
        persist_state: true,
        emit_audit_transitions: true,
        request_id: ctx.request_id.clone(),
    };
    let summary = app
        .with_ledger(move |ledger| {
            build_baseline_summary(ledger, limit, &filter, &tuning, &options)
        })
        .await?;

    if parse_bool(&params, "strict") && !summary.healthy {
        return Ok(Problem::new(
            StatusCode::CONFLICT,
            "decision signal baseline strict health check failed",
        )
        .instance(uri.path())
        .request_id(&ctx.request_id)
        .with(
            "signal_baseline",
            serde_json::to_value(&summary).unwrap_or_default(),
        )
        .into_response());
    }
    Ok(json_ok(&summary))
}

/// `GET /v1/ops/requests/{request_id}`.
pub async fn request_trace(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    Path(raw_request_id): Path<String>,
    Query(params): Params,
) -> Result<Response, Problem> {
    let request_id = raw_request_id.trim().to_string();
    if !crate::middleware::is_valid_request_id(&request_id) {
        return Err(bad_request(
            &ctx,
            uri.path(),
            "request_id must contain only visible ASCII and be at most 128 chars".to_string(),
        ));
    }
    let limit = parse_limit(&params, 200, 1000).map_err(|e| bad_request(&ctx, uri.path(), e))?;

    let lookup = request_id.clone();
    let events: Vec<UnifiedEvent> = app
        .with_ledger(move |ledger| ledger.events_by_request_id(&lookup, limit))
        .await?;
    Ok(json_ok(&json!({
        "request_id": request_id,
        "count": events.len(),
        "events": events,
    })))
}

/// `GET /v1/ops/controlplane/replay/history`.
pub async fn controlplane_replay_history(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    Query(params): Params,
) -> Result<Response, Problem> {
    let days: u32 = match params.get("days").map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => 7,
        Some(raw) => raw
            .parse::<u32>()
            .ok()
            .filter(|d| (1..=90).contains(d))
            .ok_or_else(|| {
                bad_request(
                    &ctx,
                    uri.path(),
                    "days must be an integer between 1 and 90".to_string(),
                )
            })?,
    };

    let stats = app.with_ledger(|ledger| ledger.replay_cache_stats()).await?;
    let points = app
        .with_ledger(move |ledger| ledger.replay_cache_trend(days))
        .await?;
    Ok(json_ok(&json!({
        "days": days,
        "row_count": stats.row_count,
        "oldest_age_seconds": stats.oldest_age_seconds,
        "newest_age_seconds": stats.newest_age_seconds,
        "points": points,
    })))
}

// ---------------------------------------------------------------------
// Integrations
// ---------------------------------------------------------------------

/// `POST /v1/integrations/workspaces/register`.
pub async fn workspace_register(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Problem> {
    require_auth(&app, &headers, &ctx, uri.path())?;

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|_| bad_request(&ctx, uri.path(), "request body must be JSON".to_string()))?;
    let workspace_id = payload
        .get("workspace_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let workspace_path = payload
        .get("workspace_path")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let profile = payload
        .get("profile")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let client = payload
        .get("client")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let workspace = app
        .with_ledger(move |ledger| {
            ledger.upsert_workspace(&workspace_id, &workspace_path, &profile, &client)
        })
        .await?;
    Ok(json_ok(&workspace))
}

/// `GET /v1/integrations/workspaces/{workspace_id}`.
pub async fn workspace_get(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    Path(workspace_id): Path<String>,
) -> Result<Response, Problem> {
    let workspace = app
        .with_ledger(move |ledger| ledger.get_workspace(&workspace_id))
        .await?;
    workspace.map(|w| json_ok(&w)).ok_or_else(|| {
        Problem::new(StatusCode::NOT_FOUND, "integration workspace not found")
            .instance(uri.path())
            .request_id(&ctx.request_id)
    })
}

/// `POST /v1/integrations/workspaces/{workspace_id}/protection`.
pub async fn workspace_protection(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Problem> {
    require_auth(&app, &headers, &ctx, uri.path())?;
    let enabled = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.get("enabled").and_then(Value::as_bool))
        .ok_or_else(|| {
            bad_request(&ctx, uri.path(), "body must include a boolean 'enabled'".to_string())
        })?;
    let workspace = app
        .with_ledger(move |ledger| ledger.set_workspace_protection(&workspace_id, enabled))
        .await?;
    Ok(json_ok(&workspace))
}

/// `GET /v1/integrations/workspaces/{workspace_id}/latest-incident`.
pub async fn workspace_latest_incident(
    State(app): State<AppState>,
    Extension(ctx): Extension<RequestCtx>,
    uri: Uri,
    Path(workspace_id): Path<String>,
) -> Result<Response, Problem> {
    // Workspace must exist even though incidents are daemon-global.
    let lookup = workspace_id.clone();
    let workspace = app
        .with_ledger(move |ledger| ledger.get_workspace(&lookup))
        .await?;
    if workspace.is_none() {
        return Err(
            Problem::new(StatusCode::NOT_FOUND, "integration workspace not found")
                .instance(uri.path())
                .request_id(&ctx.request_id),
        );
    }

    let latest = app
        .with_ledger(|ledger| ledger.latest_incident_event())
        .await?;
    let Some(event) = latest else {
        return Err(
            Problem::new(StatusCode::NOT_FOUND, "no incidents recorded yet")
                .instance(uri.path())
                .request_id(&ctx.request_id),
        );
    };
    let exit_reason = event
        .payload
        .get("exit_reason")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("UNKNOWN");
    Ok(json_ok(&json!({
        "incident_id": event.incident_id.unwrap_or_default(),
        "exit_reason": exit_reason,
        "reason_text": event.reason_text,
        "confidence_score": event.confidence_score,
        "created_at": event.created_at,
    })))
}
