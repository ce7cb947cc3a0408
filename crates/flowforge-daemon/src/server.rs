//! Router composition and serving.
//!
//! Both the legacy and `/v1` route families share one handler set; the
//! outer security layer (request-ID, CORS, rate limiting, metrics)
//! wraps everything. The listener binds to the loopback host resolved
//! by configuration — a non-local bind host never survives to here.

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use tracing::info;

use crate::handlers;
use crate::middleware::security_layer;
use crate::state::AppState;

/// Builds the full control-plane router.
#[must_use]
pub fn router(app: AppState) -> Router {
    Router::new()
        // Streams and reads, both route families.
        .route("/stream", get(handlers::stream))
        .route("/v1/stream", get(handlers::stream))
        .route("/incidents", get(handlers::incidents))
        .route("/v1/incidents", get(handlers::incidents))
        .route("/timeline", get(handlers::timeline))
        .route("/v1/timeline", get(handlers::timeline))
        .route("/worker/lifecycle", get(handlers::worker_lifecycle))
        .route("/v1/worker/lifecycle", get(handlers::worker_lifecycle))
        // Lifecycle mutations. Non-POST unsafe methods still hit the
        // auth contract before the method check.
        .route(
            "/process/kill",
            post(handlers::process_kill)
                .delete(handlers::unsafe_method_guard)
                .put(handlers::unsafe_method_guard)
                .patch(handlers::unsafe_method_guard),
        )
        .route(
            "/v1/process/kill",
            post(handlers::process_kill)
                .delete(handlers::unsafe_method_guard)
                .put(handlers::unsafe_method_guard)
                .patch(handlers::unsafe_method_guard),
        )
        .route(
            "/process/restart",
            post(handlers::process_restart)
                .delete(handlers::unsafe_method_guard)
                .put(handlers::unsafe_method_guard)
                .patch(handlers::unsafe_method_guard),
        )
        .route(
            "/v1/process/restart",
            post(handlers::process_restart)
                .delete(handlers::unsafe_method_guard)
                .put(handlers::unsafe_method_guard)
                .patch(handlers::unsafe_method_guard),
        )
        // Health, readiness, metrics.
        .route("/healthz", get(handlers::healthz))
        .route("/v1/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/v1/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        .route("/v1/metrics", get(handlers::metrics))
        // Decision intelligence.
        .route(
            "/v1/ops/decisions/replay/health",
            get(handlers::decision_replay_health),
        )
        .route(
            "/v1/ops/decisions/replay/:trace_id",
            get(handlers::decision_replay),
        )
        .route(
            "/v1/ops/decisions/signals/baseline",
            get(handlers::decision_signal_baseline),
        )
        .route("/v1/ops/requests/:request_id", get(handlers::request_trace))
        .route(
            "/v1/ops/controlplane/replay/history",
            get(handlers::controlplane_replay_history),
        )
        // Integrations.
        .route(
            "/v1/integrations/workspaces/register",
            post(handlers::workspace_register),
        )
        .route(
            "/v1/integrations/workspaces/:workspace_id",
            get(handlers::workspace_get),
        )
        .route(
            "/v1/integrations/workspaces/:workspace_id/protection",
            post(handlers::workspace_protection),
        )
        .route(
            "/v1/integrations/workspaces/:workspace_id/latest-incident",
            get(handlers::workspace_latest_incident),
        )
        .layer(from_fn_with_state(app.clone(), security_layer))
        .with_state(app)
}

/// Serves the router until `shutdown` resolves.
///
/// # Errors
///
/// Fails when the listener cannot bind or the server errors out.
pub async fn serve(
    app: AppState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let host = app.config.bind_host.clone();
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, auth = app.config.api_key.is_some(), "control plane listening");

    axum::serve(
        listener,
        router(app).into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
