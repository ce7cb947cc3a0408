//! RFC 7807 problem documents.
//!
//! Every error response from the control plane is a `problem+json`
//! payload carrying a stable `type` URI, the HTTP status, a detail
//! string (duplicated into a compatibility `error` field for existing
//! clients), the request path as `instance`, and the correlating
//! `request_id`.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value, json};

/// Base URI for problem types.
pub const PROBLEM_TYPE_BASE: &str = "https://flowforge.dev/problems/";

/// An RFC 7807 problem document.
#[derive(Debug, Clone)]
pub struct Problem {
    /// HTTP status.
    pub status: StatusCode,
    /// Detail string.
    pub detail: String,
    /// Request path.
    pub instance: String,
    /// Correlating request id.
    pub request_id: String,
    /// Extra top-level fields (e.g. `retry_after_seconds`).
    pub extra: Map<String, Value>,
}

impl Problem {
    /// Builds a problem for `status` with a detail message.
    #[must_use]
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            instance: String::new(),
            request_id: String::new(),
            extra: Map::new(),
        }
    }

    /// Attaches the request path.
    #[must_use]
    pub fn instance(mut self, path: &str) -> Self {
        self.instance = path.trim().to_string();
        self
    }

    /// Attaches the request id.
    #[must_use]
    pub fn request_id(mut self, request_id: &str) -> Self {
        self.request_id = request_id.trim().to_string();
        self
    }

    /// Adds an extra top-level field.
    #[must_use]
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// The problem `type` URI derived from status and detail.
    #[must_use]
    pub fn type_uri(&self) -> String {
        problem_type_uri(self.status, &self.detail)
    }

    /// Serializes the document body.
    #[must_use]
    pub fn body(&self) -> Value {
        let mut payload = json!({
            "type": self.type_uri(),
            "title": self
                .status
                .canonical_reason()
                .unwrap_or("Error"),
            "status": self.status.as_u16(),
        });
        let map = payload.as_object_mut().expect("object payload");
        if !self.detail.is_empty() {
            map.insert("detail".to_string(), Value::String(self.detail.clone()));
            // Compatibility field for existing clients and scripts.
            map.insert("error".to_string(), Value::String(self.detail.clone()));
        }
        if !self.instance.is_empty() {
            map.insert("instance".to_string(), Value::String(self.instance.clone()));
        }
        if !self.request_id.is_empty() {
            map.insert(
                "request_id".to_string(),
                Value::String(self.request_id.clone()),
            );
        }
        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }
        payload
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            self.body().to_string(),
        )
            .into_response();
        if !self.request_id.is_empty() {
            if let Ok(value) = self.request_id.parse() {
                response.headers_mut().insert("x-request-id", value);
            }
        }
        response
    }
}

/// Chooses the problem `type` URI for a status/detail pair.
#[must_use]
pub fn problem_type_uri(status: StatusCode, detail: &str) -> String {
    let detail_lower = detail.to_ascii_lowercase();
    let slug = match status {
        StatusCode::BAD_REQUEST => "bad-request",
        StatusCode::UNAUTHORIZED => "unauthorized",
        StatusCode::FORBIDDEN => "forbidden",
        StatusCode::NOT_FOUND => "not-found",
        StatusCode::METHOD_NOT_ALLOWED => "method-not-allowed",
        StatusCode::CONFLICT => {
            if detail_lower.contains("idempotency") {
                "idempotency-conflict"
            } else {
                "conflict"
            }
        }
        StatusCode::TOO_MANY_REQUESTS => {
            if detail_lower.contains("restart budget") {
                "restart-budget-exceeded"
            } else if detail_lower.contains("auth attempt") {
                "auth-rate-limited"
            } else {
                "rate-limited"
            }
        }
        StatusCode::SERVICE_UNAVAILABLE => "not-ready",
        StatusCode::INTERNAL_SERVER_ERROR => "internal",
        other => {
            return format!("{PROBLEM_TYPE_BASE}http-{}", other.as_u16());
        }
    };
    format!("{PROBLEM_TYPE_BASE}{slug}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_uri_selection() {
        assert_eq!(
            problem_type_uri(StatusCode::FORBIDDEN, "nope"),
            "https://flowforge.dev/problems/forbidden"
        );
        assert_eq!(
            problem_type_uri(StatusCode::CONFLICT, "Idempotency-Key fingerprint mismatch"),
            "https://flowforge.dev/problems/idempotency-conflict"
        );
        assert_eq!(
            problem_type_uri(StatusCode::TOO_MANY_REQUESTS, "restart budget exceeded"),
            "https://flowforge.dev/problems/restart-budget-exceeded"
        );
        assert_eq!(
            problem_type_uri(StatusCode::TOO_MANY_REQUESTS, "too many failed auth attempts"),
            "https://flowforge.dev/problems/auth-rate-limited"
        );
        assert_eq!(
            problem_type_uri(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded"),
            "https://flowforge.dev/problems/rate-limited"
        );
        assert_eq!(
            problem_type_uri(StatusCode::IM_A_TEAPOT, "x"),
            "https://flowforge.dev/problems/http-418"
        );
    }

    #[test]
    fn body_carries_contract_fields() {
        let problem = Problem::new(StatusCode::TOO_MANY_REQUESTS, "restart budget exceeded")
            .instance("/v1/process/restart")
            .request_id("req_1")
            .with("retry_after_seconds", json!(42));
        let body = problem.body();
        assert_eq!(body["status"], 429);
        assert_eq!(body["detail"], "restart budget exceeded");
        assert_eq!(body["error"], "restart budget exceeded");
        assert_eq!(body["instance"], "/v1/process/restart");
        assert_eq!(body["request_id"], "req_1");
        assert_eq!(body["retry_after_seconds"], 42);
        assert_eq!(
            body["type"],
            "https://flowforge.dev/problems/restart-budget-exceeded"
        );
    }
}
