//! Bearer-token authentication for unsafe methods.
//!
//! With `FLOWFORGE_API_KEY` configured, every unsafe method needs a
//! valid bearer compared in constant time. Without a key, unsafe
//! methods are rejected with one stable forbidden response so the
//! control plane never mutates unauthenticated. Safe methods are always
//! allowed. Repeated failures trip the per-IP auth block.

use axum::http::{HeaderMap, StatusCode, header};
use subtle::ConstantTimeEq;

use crate::middleware::RequestCtx;
use crate::problem::Problem;
use crate::state::AppState;

/// Stable rejection detail when no API key is configured.
pub const NO_KEY_DETAIL: &str =
    "Security Alert: set FLOWFORGE_API_KEY to enable mutating endpoints.";

/// Detail for the auth-abuse block (drives the problem type).
pub const AUTH_BLOCKED_DETAIL: &str = "Too many failed auth attempts. Retry later.";

/// Authenticates an unsafe request, returning the audit actor.
///
/// # Errors
///
/// A problem document ready to return: 403 (no key configured or bad
/// key), 401 (missing bearer), or 429 once the IP trips the auth block.
pub fn require_auth(
    app: &AppState,
    headers: &HeaderMap,
    ctx: &RequestCtx,
    path: &str,
) -> Result<String, Problem> {
    let Some(api_key) = app.config.api_key.as_deref().filter(|k| !k.is_empty()) else {
        return Err(Problem::new(StatusCode::FORBIDDEN, NO_KEY_DETAIL)
            .instance(path)
            .request_id(&ctx.request_id));
    };

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = bearer.map(str::trim) else {
        return Err(auth_failure(
            app,
            ctx,
            path,
            StatusCode::UNAUTHORIZED,
            "Authorization required",
        ));
    };

    if token.as_bytes().ct_eq(api_key.as_bytes()).unwrap_u8() != 1 {
        return Err(auth_failure(
            app,
            ctx,
            path,
            StatusCode::FORBIDDEN,
            "Invalid API key",
        ));
    }

    app.limiter.clear_auth_failures(&ctx.client_ip);
    Ok("api-key".to_string())
}

fn auth_failure(
    app: &AppState,
    ctx: &RequestCtx,
    path: &str,
    status: StatusCode,
    detail: &str,
) -> Problem {
    app.metrics.inc_auth_failure();
    if app.limiter.add_auth_failure(&ctx.client_ip) {
        return Problem::new(StatusCode::TOO_MANY_REQUESTS, AUTH_BLOCKED_DETAIL)
            .instance(path)
            .request_id(&ctx.request_id);
    }
    Problem::new(status, detail)
        .instance(path)
        .request_id(&ctx.request_id)
}

/// Actor label for audit rows: `api-key` when a bearer was presented,
/// `anonymous` otherwise. No token material is ever persisted.
#[must_use]
pub fn actor_from_headers(headers: &HeaderMap) -> String {
    let has_bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with("Bearer "));
    if has_bearer { "api-key" } else { "anonymous" }.to_string()
}
