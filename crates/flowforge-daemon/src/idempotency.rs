//! Idempotency middleware for mutation handlers.
//!
//! `Idempotency-Key` is hashed before it goes anywhere near storage;
//! the request body is fingerprinted the same way. In-flight mutations
//! for one `(scope, key_hash)` serialize through an in-process slot
//! map, so a racing duplicate observes `IN_PROGRESS` instead of
//! executing twice. Completed responses replay verbatim from the
//! ledger; a key reused with a different body is a conflict.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use flowforge_core::ledger::IdempotencyOutcome;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::middleware::RequestCtx;
use crate::problem::Problem;
use crate::state::AppState;

/// Idempotency key header.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Hex SHA-256 of a client-supplied value.
#[must_use]
pub fn hash_value(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical body fingerprint: hash of the trimmed raw bytes.
#[must_use]
pub fn fingerprint_body(body: &[u8]) -> String {
    let trimmed: &[u8] = std::str::from_utf8(body)
        .map_or(body, |s| s.trim().as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(trimmed);
    hex::encode(hasher.finalize())
}

/// In-process slot map serializing in-flight mutations.
#[derive(Debug, Default)]
pub struct IdempotencyGate {
    in_flight: Mutex<HashSet<(String, String)>>,
}

impl IdempotencyGate {
    fn try_acquire(&self, scope: &str, key_hash: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap()
            .insert((scope.to_string(), key_hash.to_string()))
    }

    fn release(&self, scope: &str, key_hash: &str) {
        self.in_flight
            .lock()
            .unwrap()
            .remove(&(scope.to_string(), key_hash.to_string()));
    }
}

/// Slot ownership for one executing mutation; releases on drop.
#[derive(Debug)]
pub struct IdempotencyTicket {
    gate: Arc<IdempotencyGate>,
    /// Mutation scope, e.g. `POST /process/kill`.
    pub scope: String,
    /// Hashed client key.
    pub key_hash: String,
    /// Canonical body fingerprint.
    pub fingerprint: String,
    released: bool,
}

impl Drop for IdempotencyTicket {
    fn drop(&mut self) {
        if !self.released {
            self.gate.release(&self.scope, &self.key_hash);
        }
    }
}

/// Outcome of the idempotency gate for one request.
pub enum IdempotencyBegin {
    /// No key supplied; run without replay caching.
    NoKey,
    /// First use; execute and persist through the ticket.
    Execute(IdempotencyTicket),
    /// Short-circuit with this response.
    Respond(Response),
}

/// Runs the idempotency protocol before a mutation executes.
pub async fn begin(
    app: &AppState,
    scope: &str,
    headers: &HeaderMap,
    body: &[u8],
    ctx: &RequestCtx,
    path: &str,
) -> IdempotencyBegin {
    let Some(raw_key) = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
    else {
        return IdempotencyBegin::NoKey;
    };

    let key_hash = hash_value(raw_key);
    let fingerprint = fingerprint_body(body);

    // First to acquire the slot executes; racers observe IN_PROGRESS.
    if !app.idempotency.try_acquire(scope, &key_hash) {
        let body = serde_json::json!({ "status": "IN_PROGRESS" }).to_string();
        return IdempotencyBegin::Respond(json_response(StatusCode::ACCEPTED, body));
    }

    let check = {
        let ledger = app.ledger.clone();
        let scope_owned = scope.to_string();
        let key = key_hash.clone();
        let fp = fingerprint.clone();
        tokio::task::spawn_blocking(move || ledger.check_idempotent(&scope_owned, &key, &fp)).await
    };

    match check {
        Ok(Ok(IdempotencyOutcome::FirstUse)) => IdempotencyBegin::Execute(IdempotencyTicket {
            gate: app.idempotency.clone(),
            scope: scope.to_string(),
            key_hash,
            fingerprint,
            released: false,
        }),
        Ok(Ok(IdempotencyOutcome::Replay {
            status_code,
            response_body,
        })) => {
            app.idempotency.release(scope, &key_hash);
            let status =
                StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            IdempotencyBegin::Respond(replay_response(status, response_body))
        }
        Ok(Ok(IdempotencyOutcome::Conflict)) => {
            app.idempotency.release(scope, &key_hash);
            IdempotencyBegin::Respond(
                Problem::new(
                    StatusCode::CONFLICT,
                    "idempotency key reused with a different request fingerprint",
                )
                .instance(path)
                .request_id(&ctx.request_id)
                .into_response(),
            )
        }
        Ok(Err(err)) => {
            app.idempotency.release(scope, &key_hash);
            IdempotencyBegin::Respond(
                Problem::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("idempotency lookup failed: {err}"),
                )
                .instance(path)
                .request_id(&ctx.request_id)
                .into_response(),
            )
        }
        Err(join_err) => {
            app.idempotency.release(scope, &key_hash);
            IdempotencyBegin::Respond(
                Problem::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("idempotency task failed: {join_err}"),
                )
                .instance(path)
                .request_id(&ctx.request_id)
                .into_response(),
            )
        }
    }
}

/// Persists the completed response body for replay and releases the
/// slot. The body stored is exactly what went on the wire.
pub async fn persist(app: &AppState, mut ticket: IdempotencyTicket, status: StatusCode, body: &str) {
    let ledger = app.ledger.clone();
    let scope = ticket.scope.clone();
    let key_hash = ticket.key_hash.clone();
    let fingerprint = ticket.fingerprint.clone();
    let body = body.to_string();
    let result = tokio::task::spawn_blocking(move || {
        ledger.store_idempotent(&scope, &key_hash, &fingerprint, status.as_u16(), &body)
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%err, "failed to persist idempotency record"),
        Err(err) => warn!(%err, "idempotency persist task failed"),
    }
    ticket.gate.release(&ticket.scope, &ticket.key_hash);
    ticket.released = true;
}

fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Replays a stored response byte-for-byte with its original content
/// type (problem bodies were stored from problem responses).
fn replay_response(status: StatusCode, body: String) -> Response {
    let content_type = if status.is_success() {
        "application/json"
    } else {
        "application/problem+json"
    };
    (status, [(header::CONTENT_TYPE, content_type)], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_stable_and_never_raw() {
        let hash = hash_value("00000000-0000-0000-0000-000000000001");
        assert_eq!(hash.len(), 64);
        assert!(!hash.contains("0000-"));
        assert_eq!(hash, hash_value(" 00000000-0000-0000-0000-000000000001 "));
    }

    #[test]
    fn fingerprint_trims_whitespace() {
        assert_eq!(
            fingerprint_body(b"{\"reason\":\"op\"}"),
            fingerprint_body(b"  {\"reason\":\"op\"}\n")
        );
        assert_ne!(
            fingerprint_body(b"{\"reason\":\"op\"}"),
            fingerprint_body(b"{\"reason\":\"other\"}")
        );
    }

    #[test]
    fn gate_serializes_and_releases() {
        let gate = IdempotencyGate::default();
        assert!(gate.try_acquire("POST /x", "k1"));
        assert!(!gate.try_acquire("POST /x", "k1"));
        // Different scope or key is independent.
        assert!(gate.try_acquire("POST /y", "k1"));
        assert!(gate.try_acquire("POST /x", "k2"));
        gate.release("POST /x", "k1");
        assert!(gate.try_acquire("POST /x", "k1"));
    }
}
