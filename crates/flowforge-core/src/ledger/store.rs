//! SQLite-backed ledger store.
//!
//! One connection behind a mutex is the single writer; WAL mode keeps
//! concurrent readers off its back. The schema ships embedded and is
//! applied idempotently on open. Designated incident columns are sealed
//! through the configured [`EncryptionPolicy`] and every free-form field
//! passes the [`Redactor`] before it is bound to a statement.

// SQLite hands back i64 for row ids and counts; they are never negative
// here. A poisoned mutex means another thread panicked mid-write, which
// is not recoverable.
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use thiserror::Error;
use uuid::Uuid;

use super::{
    DecisionTrace, EventKind, IdempotencyOutcome, Incident, IntegrationWorkspace, NewEvent,
    NewIncident, Page, ReplayCacheStats, ReplayTrendPoint, SignalBaselineRecord, UnifiedEvent,
};
use crate::crypto::{CryptoError, EncryptionPolicy};
use crate::policy::EngineContract;
use crate::policy::replay::{self, REPLAY_CONTRACT_VERSION, ReplayInput};
use crate::redact::Redactor;

/// Schema applied on every open.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Columns of the `events` table in select order.
const EVENT_COLUMNS: &str = "id, event_id, created_at, event_type, run_id, incident_id, \
     request_id, title, actor, reason_text, summary, pid, cpu_score, entropy_score, \
     confidence_score, decision_engine, engine_version, decision_contract_version, \
     rollout_mode, replay_contract_version, replay_digest, payload_json";

/// Ledger errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Underlying SQLite failure (including append-only trigger aborts).
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Column encryption failed on a write; the write was rolled back.
    #[error("encrypt incident {column} failed: {source}")]
    Encrypt {
        /// Column that failed to seal.
        column: &'static str,
        /// Underlying crypto error.
        #[source]
        source: CryptoError,
    },

    /// Column decryption failed on a read.
    #[error("decrypt failed: {0}")]
    Decrypt(#[from] CryptoError),

    /// Caller passed invalid input.
    #[error("{0}")]
    InvalidInput(String),

    /// Row not found.
    #[error("{0} not found")]
    NotFound(&'static str),
}

/// The evidence ledger.
pub struct Ledger {
    conn: Mutex<Connection>,
    encryption: EncryptionPolicy,
    redactor: Redactor,
    run_id: Mutex<String>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("sealed", &self.encryption.is_sealed())
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Opens (creating if needed) a ledger at `path`.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened or the schema cannot be
    /// applied.
    pub fn open(
        path: impl AsRef<Path>,
        encryption: EncryptionPolicy,
        redactor: Redactor,
    ) -> Result<Self, LedgerError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::from_connection(conn, encryption, redactor)
    }

    /// Opens an in-memory ledger for tests.
    ///
    /// # Errors
    ///
    /// Fails when the schema cannot be applied.
    pub fn in_memory(
        encryption: EncryptionPolicy,
        redactor: Redactor,
    ) -> Result<Self, LedgerError> {
        Self::from_connection(Connection::open_in_memory()?, encryption, redactor)
    }

    fn from_connection(
        conn: Connection,
        encryption: EncryptionPolicy,
        redactor: Redactor,
    ) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            encryption,
            redactor,
            run_id: Mutex::new(String::new()),
        })
    }

    /// Whether designated columns are being sealed.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.encryption.is_sealed()
    }

    /// Sets the run id stamped on subsequent events.
    pub fn set_run_id(&self, run_id: &str) {
        *self.run_id.lock().unwrap() = run_id.trim().to_string();
    }

    /// Current run id.
    #[must_use]
    pub fn run_id(&self) -> String {
        self.run_id.lock().unwrap().clone()
    }

    // ------------------------------------------------------------------
    // Event appends
    // ------------------------------------------------------------------

    /// Appends a unified event, returning `(row_id, event_id)`.
    ///
    /// Reason and summary are sanitized before persistence.
    ///
    /// # Errors
    ///
    /// Fails on a missing kind or a storage error.
    pub fn append_event(&self, event: NewEvent) -> Result<(i64, String), LedgerError> {
        let kind = event
            .kind
            .ok_or_else(|| LedgerError::InvalidInput("event kind is required".into()))?;
        let event_id = Uuid::new_v4().to_string();
        let payload = if event.payload.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            event.payload
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (event_id, created_at, event_type, run_id, incident_id, \
             request_id, title, actor, reason_text, summary, pid, cpu_score, entropy_score, \
             confidence_score, decision_engine, engine_version, decision_contract_version, \
             rollout_mode, replay_contract_version, replay_digest, payload_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18, ?19, ?20, ?21)",
            params![
                event_id,
                now_rfc3339(),
                kind.as_str(),
                self.run_id(),
                event.incident_id.trim(),
                event.request_id.trim(),
                event.title.trim(),
                event.actor.trim(),
                self.redactor.line(event.reason_text.trim()),
                self.redactor.line(event.summary.trim()),
                event.pid,
                event.cpu_score,
                event.entropy_score,
                event.confidence_score,
                event.decision_engine.trim(),
                event.engine_version.trim(),
                event.decision_contract_version.trim(),
                event.rollout_mode.trim(),
                event.replay_contract_version.trim(),
                event.replay_digest.trim(),
                payload.to_string(),
            ],
        )?;
        Ok((conn.last_insert_rowid(), event_id))
    }

    /// Records a decision trace, computing its replay digest over the
    /// canonical input.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    #[allow(clippy::too_many_arguments)]
    pub fn log_decision_trace(
        &self,
        command: &str,
        pid: i32,
        cpu_score: f64,
        entropy_score: f64,
        confidence_score: f64,
        decision: &str,
        reason: &str,
        incident_id: &str,
        request_id: &str,
        contract: &EngineContract,
    ) -> Result<i64, LedgerError> {
        let digest = replay::digest(&ReplayInput {
            decision_engine: contract.decision_engine.clone(),
            engine_version: contract.engine_version.clone(),
            decision_contract_version: contract.decision_contract_version.clone(),
            rollout_mode: contract.rollout_mode.clone(),
            decision: decision.to_string(),
            reason: reason.to_string(),
            cpu_score,
            entropy_score,
            confidence_score,
        });
        let (id, _) = self.append_event(NewEvent {
            kind: Some(EventKind::Decision),
            incident_id: incident_id.to_string(),
            request_id: request_id.to_string(),
            title: decision.trim().to_ascii_uppercase(),
            actor: "system".to_string(),
            reason_text: reason.to_string(),
            summary: self.redactor.line(command),
            pid,
            cpu_score,
            entropy_score,
            confidence_score,
            decision_engine: contract.decision_engine.clone(),
            engine_version: contract.engine_version.clone(),
            decision_contract_version: contract.decision_contract_version.clone(),
            rollout_mode: contract.rollout_mode.clone(),
            replay_contract_version: REPLAY_CONTRACT_VERSION.to_string(),
            replay_digest: digest,
            payload: serde_json::Value::Null,
        })?;
        Ok(id)
    }

    /// Records an audit event.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    #[allow(clippy::too_many_arguments)]
    pub fn log_audit(
        &self,
        actor: &str,
        action: &str,
        details: &str,
        source: &str,
        pid: i32,
        command: &str,
        incident_id: &str,
        request_id: &str,
    ) -> Result<i64, LedgerError> {
        let (id, _) = self.append_event(NewEvent {
            kind: Some(EventKind::Audit),
            incident_id: incident_id.to_string(),
            request_id: request_id.to_string(),
            title: action.trim().to_string(),
            actor: actor.to_string(),
            reason_text: details.to_string(),
            summary: self.redactor.line(command),
            pid,
            payload: serde_json::json!({ "source": source }),
            ..NewEvent::default()
        })?;
        Ok(id)
    }

    /// Records a shadow-mode policy evaluation.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn log_policy_dry_run(
        &self,
        command: &str,
        pid: i32,
        summary: &str,
        confidence_score: f64,
        incident_id: &str,
    ) -> Result<i64, LedgerError> {
        let (id, _) = self.append_event(NewEvent {
            kind: Some(EventKind::PolicyDryRun),
            incident_id: incident_id.to_string(),
            title: "POLICY_DRY_RUN".to_string(),
            actor: "system".to_string(),
            reason_text: summary.to_string(),
            summary: format!("{} :: {}", self.redactor.line(command), summary),
            pid,
            confidence_score,
            ..NewEvent::default()
        })?;
        Ok(id)
    }

    /// Records an incident plus its timeline event in one transaction.
    ///
    /// The command and pattern are sanitized, then sealed per the
    /// encryption policy. With a master key configured, a sealing failure
    /// aborts the whole write.
    ///
    /// # Errors
    ///
    /// Fails closed on encryption errors and on storage errors.
    pub fn log_incident(&self, incident: NewIncident) -> Result<(i64, String), LedgerError> {
        let sanitized_command = self.redactor.line(incident.command.trim());
        let sanitized_pattern = self.redactor.line(incident.pattern.trim());
        let sanitized_reason = self.redactor.line(incident.reason.trim());

        let sealed_command = self
            .encryption
            .seal(&sanitized_command)
            .map_err(|source| LedgerError::Encrypt {
                column: "command",
                source,
            })?;
        let sealed_pattern = self
            .encryption
            .seal(&sanitized_pattern)
            .map_err(|source| LedgerError::Encrypt {
                column: "pattern",
                source,
            })?;

        let incident_id = if incident.incident_id.trim().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            incident.incident_id.trim().to_string()
        };
        let now = now_rfc3339();
        let run_id = self.run_id();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO incidents (timestamp, command, model_name, exit_reason, max_cpu, \
             pattern, token_savings_estimate, reason, cpu_score, entropy_score, \
             confidence_score, recovery_status, restart_count, incident_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                now,
                sealed_command,
                incident.model_name.trim(),
                incident.exit_reason.trim(),
                incident.max_cpu,
                sealed_pattern,
                incident.token_savings_estimate,
                sanitized_reason,
                incident.cpu_score,
                incident.entropy_score,
                incident.confidence_score,
                incident.recovery_status.trim(),
                incident.restart_count,
                incident_id,
            ],
        )?;
        let row_id = tx.last_insert_rowid();

        let payload = serde_json::json!({
            "id": row_id,
            "exit_reason": incident.exit_reason.trim(),
            "reason": sanitized_reason,
            "recovery_status": incident.recovery_status.trim(),
        });
        tx.execute(
            "INSERT INTO events (event_id, created_at, event_type, run_id, incident_id, \
             request_id, title, actor, reason_text, summary, pid, cpu_score, entropy_score, \
             confidence_score, payload_json) \
             VALUES (?1, ?2, 'incident', ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11, ?12, ?13)",
            params![
                Uuid::new_v4().to_string(),
                now,
                run_id,
                incident_id,
                incident.request_id.trim(),
                incident.exit_reason.trim(),
                "system",
                sanitized_reason,
                sanitized_command,
                incident.cpu_score,
                incident.entropy_score,
                incident.confidence_score,
                payload.to_string(),
            ],
        )?;
        tx.commit()?;
        Ok((row_id, incident_id))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fetches one incident by row id, opening sealed columns.
    ///
    /// # Errors
    ///
    /// `NotFound` when the row does not exist; decryption errors
    /// propagate.
    pub fn get_incident(&self, id: i64) -> Result<Incident, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, timestamp, command, model_name, exit_reason, max_cpu, pattern, \
                 token_savings_estimate, reason, cpu_score, entropy_score, confidence_score, \
                 recovery_status, restart_count, incident_id FROM incidents WHERE id = ?1",
                params![id],
                Self::incident_row,
            )
            .optional()?;
        drop(conn);
        let raw = row.ok_or(LedgerError::NotFound("incident"))?;
        self.open_incident(raw)
    }

    /// Newest-first incident list for the legacy route.
    ///
    /// # Errors
    ///
    /// Fails on storage or decryption errors.
    pub fn get_incidents(&self, limit: usize) -> Result<Vec<Incident>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, command, model_name, exit_reason, max_cpu, pattern, \
             token_savings_estimate, reason, cpu_score, entropy_score, confidence_score, \
             recovery_status, restart_count, incident_id FROM incidents \
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], Self::incident_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        rows.into_iter().map(|r| self.open_incident(r)).collect()
    }

    /// Cursor-paginated incidents, newest first.
    ///
    /// # Errors
    ///
    /// Fails on storage or decryption errors.
    pub fn incidents_page(&self, limit: usize, cursor: i64) -> Result<Page<Incident>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, command, model_name, exit_reason, max_cpu, pattern, \
             token_savings_estimate, reason, cpu_score, entropy_score, confidence_score, \
             recovery_status, restart_count, incident_id FROM incidents \
             WHERE (?1 <= 0 OR id < ?1) ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![cursor, (limit + 1) as i64], Self::incident_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_more {
            rows.last().map_or(0, |r| r.id)
        } else {
            0
        };
        let items = rows
            .into_iter()
            .map(|r| self.open_incident(r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            next_cursor,
            has_more,
        })
    }

    /// Newest-first unified timeline for the legacy route.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn timeline(&self, limit: usize) -> Result<Vec<UnifiedEvent>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], Self::event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Cursor-paginated unified timeline, newest first.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn timeline_page(
        &self,
        limit: usize,
        cursor: i64,
    ) -> Result<Page<UnifiedEvent>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE (?1 <= 0 OR id < ?1) \
             ORDER BY id DESC LIMIT ?2"
        ))?;
        let mut rows = stmt
            .query_map(params![cursor, (limit + 1) as i64], Self::event_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_more {
            rows.last().map_or(0, |r| r.id)
        } else {
            0
        };
        Ok(Page {
            items: rows,
            next_cursor,
            has_more,
        })
    }

    /// All events correlated to one incident, oldest first, insertion
    /// order preserved within ties.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn incident_timeline(
        &self,
        incident_id: &str,
        limit: usize,
    ) -> Result<Vec<UnifiedEvent>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE incident_id = ?1 \
             ORDER BY created_at ASC, id ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![incident_id.trim(), limit as i64], Self::event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All events carrying one request id, oldest first.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn events_by_request_id(
        &self,
        request_id: &str,
        limit: usize,
    ) -> Result<Vec<UnifiedEvent>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE request_id = ?1 \
             ORDER BY created_at ASC, id ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![request_id.trim(), limit as i64], Self::event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Newest incident event, if any.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn latest_incident_event(&self) -> Result<Option<UnifiedEvent>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM events WHERE event_type = 'incident' \
                     ORDER BY id DESC LIMIT 1"
                ),
                [],
                Self::event_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Newest-first decision traces.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn decision_traces(&self, limit: usize) -> Result<Vec<DecisionTrace>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE event_type = 'decision' \
             ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], Self::event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(trace_from_event).collect())
    }

    /// One decision trace by row id.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id does not refer to a decision event.
    pub fn decision_trace_by_id(&self, id: i64) -> Result<DecisionTrace, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM events \
                     WHERE id = ?1 AND event_type = 'decision'"
                ),
                params![id],
                Self::event_row,
            )
            .optional()?;
        row.map(trace_from_event)
            .ok_or(LedgerError::NotFound("decision trace"))
    }

    // ------------------------------------------------------------------
    // Idempotency replay cache
    // ------------------------------------------------------------------

    /// Checks the replay cache for `(scope, key_hash)`.
    ///
    /// A hit with a matching fingerprint bumps the replay counter and
    /// returns the original response; a differing fingerprint bumps the
    /// conflict counter.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn check_idempotent(
        &self,
        scope: &str,
        key_hash: &str,
        fingerprint: &str,
    ) -> Result<IdempotencyOutcome, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let existing = conn
            .query_row(
                "SELECT request_fingerprint, status_code, response_body \
                 FROM idempotency_records WHERE scope = ?1 AND key_hash = ?2",
                params![scope, key_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match existing {
            None => Ok(IdempotencyOutcome::FirstUse),
            Some((stored_fingerprint, status, body)) => {
                if stored_fingerprint == fingerprint {
                    conn.execute(
                        "UPDATE idempotency_records \
                         SET replay_count = replay_count + 1, last_seen_at = ?3 \
                         WHERE scope = ?1 AND key_hash = ?2",
                        params![scope, key_hash, now_rfc3339()],
                    )?;
                    Ok(IdempotencyOutcome::Replay {
                        status_code: status as u16,
                        response_body: body,
                    })
                } else {
                    conn.execute(
                        "UPDATE idempotency_records \
                         SET conflict_count = conflict_count + 1, last_seen_at = ?3 \
                         WHERE scope = ?1 AND key_hash = ?2",
                        params![scope, key_hash, now_rfc3339()],
                    )?;
                    Ok(IdempotencyOutcome::Conflict)
                }
            }
        }
    }

    /// Persists the completed response for `(scope, key_hash)`.
    ///
    /// A concurrent first-writer wins; the duplicate insert is a no-op.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn store_idempotent(
        &self,
        scope: &str,
        key_hash: &str,
        fingerprint: &str,
        status_code: u16,
        response_body: &str,
    ) -> Result<(), LedgerError> {
        let now = now_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO idempotency_records \
             (scope, key_hash, request_fingerprint, status_code, response_body, created_at, \
              last_seen_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
             ON CONFLICT (scope, key_hash) DO NOTHING",
            params![scope, key_hash, fingerprint, i64::from(status_code), response_body, now],
        )?;
        Ok(())
    }

    /// Aggregate replay-cache statistics.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn replay_cache_stats(&self) -> Result<ReplayCacheStats, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let (count, oldest, newest) = conn.query_row(
            "SELECT COUNT(1), MIN(last_seen_at), MAX(last_seen_at) FROM idempotency_records",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )?;
        Ok(ReplayCacheStats {
            row_count: count,
            oldest_age_seconds: oldest.map_or(0, |t| age_seconds(&t)),
            newest_age_seconds: newest.map_or(0, |t| age_seconds(&t)),
        })
    }

    /// Daily replay/conflict counts over the trailing `days`.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn replay_cache_trend(&self, days: u32) -> Result<Vec<ReplayTrendPoint>, LedgerError> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(days)))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT substr(created_at, 1, 10) AS day, SUM(replay_count), SUM(conflict_count) \
             FROM idempotency_records WHERE created_at >= ?1 \
             GROUP BY day ORDER BY day ASC",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| {
                Ok(ReplayTrendPoint {
                    day: row.get(0)?,
                    replay_count: row.get(1)?,
                    conflict_count: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Signal baseline state
    // ------------------------------------------------------------------

    /// Loads the persisted streak state for a bucket.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn baseline_state(
        &self,
        bucket_key: &str,
    ) -> Result<Option<SignalBaselineRecord>, LedgerError> {
        let key = bucket_key.trim();
        if key.is_empty() {
            return Err(LedgerError::InvalidInput("bucket_key is required".into()));
        }
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT bucket_key, latest_trace_id, consecutive_breach_count, status, \
                 last_transition_at, last_checked_at \
                 FROM decision_signal_baseline_state WHERE bucket_key = ?1",
                params![key],
                |row| {
                    Ok(SignalBaselineRecord {
                        bucket_key: row.get(0)?,
                        latest_trace_id: row.get::<_, i64>(1)?.max(0),
                        consecutive_breach_count: row.get::<_, i64>(2)?.max(0),
                        status: row.get(3)?,
                        last_transition_at: row.get(4)?,
                        last_checked_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Upserts a bucket's streak state, keeping the transition timestamp
    /// unless the status actually changed.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn upsert_baseline_state(
        &self,
        bucket_key: &str,
        latest_trace_id: i64,
        consecutive_breach_count: i64,
        status: &str,
    ) -> Result<(), LedgerError> {
        let key = bucket_key.trim();
        if key.is_empty() {
            return Err(LedgerError::InvalidInput("bucket_key is required".into()));
        }
        let now = now_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO decision_signal_baseline_state \
             (bucket_key, latest_trace_id, consecutive_breach_count, status, \
              last_transition_at, last_checked_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
             ON CONFLICT (bucket_key) DO UPDATE SET \
                latest_trace_id = excluded.latest_trace_id, \
                consecutive_breach_count = excluded.consecutive_breach_count, \
                status = excluded.status, \
                last_transition_at = CASE \
                    WHEN decision_signal_baseline_state.status <> excluded.status \
                        THEN excluded.last_checked_at \
                    ELSE decision_signal_baseline_state.last_transition_at \
                END, \
                last_checked_at = excluded.last_checked_at",
            params![
                key,
                latest_trace_id.max(0),
                consecutive_breach_count.max(0),
                status,
                now
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Integration workspaces
    // ------------------------------------------------------------------

    /// Registers or refreshes a workspace.
    ///
    /// # Errors
    ///
    /// Fails on missing identifiers or storage errors.
    pub fn upsert_workspace(
        &self,
        workspace_id: &str,
        workspace_path: &str,
        profile: &str,
        client: &str,
    ) -> Result<IntegrationWorkspace, LedgerError> {
        let workspace_id = workspace_id.trim();
        let workspace_path = workspace_path.trim();
        if workspace_id.is_empty() {
            return Err(LedgerError::InvalidInput("workspace_id is required".into()));
        }
        if workspace_path.is_empty() {
            return Err(LedgerError::InvalidInput(
                "workspace_path is required".into(),
            ));
        }
        let profile = non_empty_or(profile, "standard");
        let client = non_empty_or(client, "unknown");
        let now = now_rfc3339();
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO integration_workspaces \
                 (workspace_id, workspace_path, profile, client, protection_enabled, \
                  active_pid, created_at, last_updated) \
                 VALUES (?1, ?2, ?3, ?4, 1, 0, ?5, ?5) \
                 ON CONFLICT (workspace_id) DO UPDATE SET \
                    workspace_path = excluded.workspace_path, \
                    profile = excluded.profile, \
                    client = excluded.client, \
                    last_updated = excluded.last_updated",
                params![workspace_id, workspace_path, profile, client, now],
            )?;
        }
        self.get_workspace(workspace_id)?
            .ok_or(LedgerError::NotFound("integration workspace"))
    }

    /// Loads one workspace.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn get_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Option<IntegrationWorkspace>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT workspace_id, workspace_path, profile, client, protection_enabled, \
                 active_pid, created_at, last_updated \
                 FROM integration_workspaces WHERE workspace_id = ?1",
                params![workspace_id.trim()],
                |row| {
                    Ok(IntegrationWorkspace {
                        workspace_id: row.get(0)?,
                        workspace_path: row.get(1)?,
                        profile: row.get(2)?,
                        client: row.get(3)?,
                        protection_enabled: row.get::<_, i64>(4)? == 1,
                        active_pid: row.get::<_, i64>(5)? as i32,
                        created_at: row.get(6)?,
                        last_updated: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Toggles workspace protection.
    ///
    /// # Errors
    ///
    /// `NotFound` when the workspace is not registered.
    pub fn set_workspace_protection(
        &self,
        workspace_id: &str,
        enabled: bool,
    ) -> Result<IntegrationWorkspace, LedgerError> {
        let affected = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE integration_workspaces \
                 SET protection_enabled = ?2, last_updated = ?3 WHERE workspace_id = ?1",
                params![workspace_id.trim(), i64::from(enabled), now_rfc3339()],
            )?
        };
        if affected == 0 {
            return Err(LedgerError::NotFound("integration workspace"));
        }
        self.get_workspace(workspace_id)?
            .ok_or(LedgerError::NotFound("integration workspace"))
    }

    /// Binds the active PID for a workspace.
    ///
    /// # Errors
    ///
    /// `NotFound` when the workspace is not registered.
    pub fn set_workspace_active_pid(
        &self,
        workspace_id: &str,
        pid: i32,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE integration_workspaces \
             SET active_pid = ?2, last_updated = ?3 WHERE workspace_id = ?1",
            params![workspace_id.trim(), i64::from(pid.max(0)), now_rfc3339()],
        )?;
        if affected == 0 {
            return Err(LedgerError::NotFound("integration workspace"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Row mappers
    // ------------------------------------------------------------------

    fn incident_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Incident> {
        Ok(Incident {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            command: row.get(2)?,
            model_name: row.get(3)?,
            exit_reason: row.get(4)?,
            max_cpu: row.get(5)?,
            pattern: row.get(6)?,
            token_savings_estimate: row.get(7)?,
            reason: row.get(8)?,
            cpu_score: row.get(9)?,
            entropy_score: row.get(10)?,
            confidence_score: row.get(11)?,
            recovery_status: row.get(12)?,
            restart_count: row.get(13)?,
            incident_id: row.get(14)?,
        })
    }

    fn open_incident(&self, mut incident: Incident) -> Result<Incident, LedgerError> {
        incident.command = self.encryption.open(&incident.command)?;
        incident.pattern = self.encryption.open(&incident.pattern)?;
        Ok(incident)
    }

    fn event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UnifiedEvent> {
        let kind_raw: String = row.get(3)?;
        let incident_id: String = row.get(5)?;
        let request_id: String = row.get(6)?;
        let payload_raw: String = row.get(21)?;
        Ok(UnifiedEvent {
            id: row.get(0)?,
            event_id: row.get(1)?,
            created_at: row.get(2)?,
            // The CHECK constraint keeps unknown kinds out; audit is a
            // safe fallback for rows predating it.
            event_type: EventKind::parse(&kind_raw).unwrap_or(EventKind::Audit),
            run_id: row.get(4)?,
            incident_id: (!incident_id.is_empty()).then_some(incident_id),
            request_id: (!request_id.is_empty()).then_some(request_id),
            title: row.get(7)?,
            actor: row.get(8)?,
            reason_text: row.get(9)?,
            summary: row.get(10)?,
            pid: row.get::<_, i64>(11)? as i32,
            cpu_score: row.get(12)?,
            entropy_score: row.get(13)?,
            confidence_score: row.get(14)?,
            decision_engine: row.get(15)?,
            engine_version: row.get(16)?,
            decision_contract_version: row.get(17)?,
            rollout_mode: row.get(18)?,
            replay_contract_version: row.get(19)?,
            replay_digest: row.get(20)?,
            payload: serde_json::from_str(&payload_raw)
                .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
        })
    }
}

#[cfg(test)]
impl Ledger {
    /// Test hook: run one raw statement against the connection.
    pub(crate) fn raw_execute(&self, sql: &str) -> Result<usize, rusqlite::Error> {
        self.conn.lock().unwrap().execute(sql, [])
    }

    /// Test hook: read one string cell.
    pub(crate) fn raw_query_string(&self, sql: &str) -> Result<String, rusqlite::Error> {
        self.conn.lock().unwrap().query_row(sql, [], |row| row.get(0))
    }
}

fn trace_from_event(event: UnifiedEvent) -> DecisionTrace {
    DecisionTrace {
        id: event.id,
        timestamp: event.created_at,
        command: event.summary,
        pid: event.pid,
        cpu_score: event.cpu_score,
        entropy_score: event.entropy_score,
        confidence_score: event.confidence_score,
        decision: event.title,
        reason: event.reason_text,
        decision_engine: event.decision_engine,
        engine_version: event.engine_version,
        decision_contract_version: event.decision_contract_version,
        rollout_mode: event.rollout_mode,
        replay_contract_version: event.replay_contract_version,
        replay_digest: event.replay_digest,
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() { fallback } else { trimmed }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn age_seconds(timestamp: &str) -> i64 {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|t| (Utc::now() - t.with_timezone(&Utc)).num_seconds().max(0))
        .unwrap_or(0)
}
