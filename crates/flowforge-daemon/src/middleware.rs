//! Request context, CORS, and the outer security layer.
//!
//! Chain (outer to inner): request-ID injection, CORS headers, the
//! per-IP rate limiter, then the handler; the layer also records the
//! request metric on the way out. Preflight `OPTIONS` requests
//! short-circuit here. Auth and idempotency run inside the mutation
//! handlers, where the scope and body are known.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::problem::Problem;
use crate::state::AppState;

/// Request-ID header name.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Upper bound on handler execution per request.
pub const HANDLER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Longest accepted inbound request id.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Fixed CORS fallback origin.
pub const DEFAULT_ORIGIN: &str = "http://localhost:3000";

/// Origins always allowed.
const ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost",
    "http://localhost:3000",
    "http://localhost:3001",
];

/// Per-request context injected into extensions.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    /// Correlation id echoed on the response and stamped into audits.
    pub request_id: String,
    /// Client IP used by the rate limiter.
    pub client_ip: String,
    /// Resolved CORS origin for the response.
    pub origin: String,
}

/// A request id is visible ASCII, at most 128 bytes.
#[must_use]
pub fn is_valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id.bytes().all(|b| (33..=126).contains(&b))
}

/// Whether an origin URL points at localhost.
#[must_use]
pub fn is_local_origin(raw: &str) -> bool {
    let rest = raw
        .strip_prefix("http://")
        .or_else(|| raw.strip_prefix("https://"));
    let Some(rest) = rest else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    };
    let host = host.to_ascii_lowercase();
    host == "localhost" || host == "127.0.0.1"
}

/// Resolves the origin to reflect back to the caller.
///
/// Origins in the allowlist (plus a configured local override) and any
/// other local origin are reflected; everything else gets the fixed
/// default. Never `*`.
#[must_use]
pub fn resolve_origin(request_origin: Option<&str>, configured_extra: Option<&str>) -> String {
    let Some(origin) = request_origin.map(str::trim).filter(|o| !o.is_empty()) else {
        return DEFAULT_ORIGIN.to_string();
    };
    if ALLOWED_ORIGINS.contains(&origin) {
        return origin.to_string();
    }
    if let Some(extra) = configured_extra.map(str::trim).filter(|o| !o.is_empty()) {
        if extra == origin && is_local_origin(extra) {
            return origin.to_string();
        }
    }
    if is_local_origin(origin) {
        return origin.to_string();
    }
    DEFAULT_ORIGIN.to_string()
}

/// Applies the CORS header set to a response.
pub fn apply_cors(headers: &mut HeaderMap, origin: &str) {
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, Idempotency-Key"),
    );
}

fn derive_ctx(app: &AppState, request: &Request) -> RequestCtx {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| is_valid_request_id(id))
        .map_or_else(|| format!("req_{}", Uuid::new_v4()), str::to_string);

    let client_ip = request
        .extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map_or_else(|| "local".to_string(), |info| info.0.ip().to_string());

    let origin = resolve_origin(
        request
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok()),
        app.config.allowed_origin.as_deref(),
    );

    RequestCtx {
        request_id,
        client_ip,
        origin,
    }
}

/// The outer security layer.
pub async fn security_layer(
    State(app): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let ctx = derive_ctx(&app, &request);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    request.extensions_mut().insert(ctx.clone());

    if method == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        finish(&app, &ctx, &path, &method, &mut response);
        return response;
    }

    // A brute-forced IP stays blocked regardless of payload.
    if app.limiter.is_blocked(&ctx.client_ip) {
        let mut response = Problem::new(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many failed auth attempts. Retry later.",
        )
        .instance(&path)
        .request_id(&ctx.request_id)
        .into_response();
        finish(&app, &ctx, &path, &method, &mut response);
        return response;
    }

    if !app.limiter.allow(&ctx.client_ip) {
        let mut response = Problem::new(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded")
            .instance(&path)
            .request_id(&ctx.request_id)
            .into_response();
        finish(&app, &ctx, &path, &method, &mut response);
        return response;
    }

    // Handlers are bounded; streaming bodies are not affected because
    // the response (with its body stream) is produced long before this
    // deadline.
    let mut response =
        match tokio::time::timeout(HANDLER_TIMEOUT, next.run(request)).await {
            Ok(response) => response,
            Err(_) => Problem::new(StatusCode::INTERNAL_SERVER_ERROR, "request timed out")
                .instance(&path)
                .request_id(&ctx.request_id)
                .into_response(),
        };
    finish(&app, &ctx, &path, &method, &mut response);
    response
}

fn finish(app: &AppState, ctx: &RequestCtx, path: &str, method: &Method, response: &mut Response) {
    apply_cors(response.headers_mut(), &ctx.origin);
    if !response.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
    }
    app.metrics
        .inc_request(path, method.as_str(), response.status().as_u16());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_validation() {
        assert!(is_valid_request_id("req_abc-123"));
        assert!(!is_valid_request_id(""));
        assert!(!is_valid_request_id("has space"));
        assert!(!is_valid_request_id(&"x".repeat(129)));
        assert!(is_valid_request_id(&"x".repeat(128)));
    }

    #[test]
    fn local_origin_detection() {
        assert!(is_local_origin("http://localhost"));
        assert!(is_local_origin("http://localhost:5173"));
        assert!(is_local_origin("http://127.0.0.1:8080"));
        assert!(is_local_origin("https://LOCALHOST:8443"));
        assert!(!is_local_origin("http://evil.example.com"));
        assert!(!is_local_origin("localhost:3000"));
        assert!(!is_local_origin("http://localhost.evil.com"));
    }

    #[test]
    fn origin_resolution_never_wildcards() {
        assert_eq!(resolve_origin(None, None), DEFAULT_ORIGIN);
        assert_eq!(
            resolve_origin(Some("http://localhost:3001"), None),
            "http://localhost:3001"
        );
        assert_eq!(
            resolve_origin(Some("http://127.0.0.1:5173"), None),
            "http://127.0.0.1:5173"
        );
        assert_eq!(
            resolve_origin(Some("https://attacker.example"), None),
            DEFAULT_ORIGIN
        );
        // The configured extra origin must itself be local.
        assert_eq!(
            resolve_origin(
                Some("https://dashboard.example"),
                Some("https://dashboard.example")
            ),
            DEFAULT_ORIGIN
        );
    }
}
