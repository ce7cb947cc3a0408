//! Ledger store tests.

use tempfile::TempDir;

use super::*;
use crate::crypto::EncryptionPolicy;
use crate::policy::{RolloutMode, current_engine_contract};
use crate::redact::Redactor;

const TEST_MASTER_KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

fn sealed_policy() -> EncryptionPolicy {
    EncryptionPolicy::from_master_key(Some(TEST_MASTER_KEY)).expect("test key")
}

fn memory_ledger() -> Ledger {
    Ledger::in_memory(sealed_policy(), Redactor::new()).expect("in-memory ledger")
}

fn plaintext_ledger() -> Ledger {
    Ledger::in_memory(EncryptionPolicy::Plaintext, Redactor::new()).expect("in-memory ledger")
}

fn sample_incident(incident_id: &str, command: &str) -> NewIncident {
    NewIncident {
        command: command.to_string(),
        model_name: "gpt-4".to_string(),
        exit_reason: "LOOP_DETECTED".to_string(),
        max_cpu: 95.0,
        pattern: "repeat loop".to_string(),
        token_savings_estimate: 42.0,
        reason: "loop coverage".to_string(),
        cpu_score: 95.0,
        entropy_score: 10.0,
        confidence_score: 96.0,
        recovery_status: "terminated".to_string(),
        restart_count: 0,
        incident_id: incident_id.to_string(),
        request_id: String::new(),
    }
}

fn audit_event(incident_id: &str, title: &str) -> NewEvent {
    NewEvent {
        kind: Some(EventKind::Audit),
        incident_id: incident_id.to_string(),
        title: title.to_string(),
        actor: "api-key".to_string(),
        reason_text: "operator action".to_string(),
        summary: "manual".to_string(),
        pid: 4040,
        ..NewEvent::default()
    }
}

#[test]
fn events_are_append_only() {
    let ledger = memory_ledger();
    let (id, _) = ledger.append_event(audit_event("inc-1", "KILL")).unwrap();

    let update = ledger.raw_execute(&format!("UPDATE events SET title = 'EDITED' WHERE id = {id}"));
    assert!(update.is_err(), "update must be rejected");
    let delete = ledger.raw_execute(&format!("DELETE FROM events WHERE id = {id}"));
    assert!(delete.is_err(), "delete must be rejected");

    let timeline = ledger.timeline(10).unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].title, "KILL");
}

#[test]
fn event_kind_is_validated() {
    let ledger = memory_ledger();
    let err = ledger
        .append_event(NewEvent {
            kind: None,
            ..audit_event("inc", "KILL")
        })
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));
}

#[test]
fn incident_columns_are_sealed_at_rest() {
    let ledger = memory_ledger();
    let secret_command = "python3 worker.py --api-key supersecret --token abc123";
    let (row_id, _) = ledger
        .log_incident(sample_incident("incident-secure-1", secret_command))
        .unwrap();

    // Raw column bytes must not contain the secret or even the sanitized
    // plaintext.
    let stored = ledger
        .raw_query_string(&format!("SELECT command FROM incidents WHERE id = {row_id}"))
        .unwrap();
    assert!(!stored.contains("supersecret"));
    assert!(!stored.contains("worker.py"));

    // Read path opens the sealed value, which is sanitized.
    let incident = ledger.get_incident(row_id).unwrap();
    assert!(incident.command.contains("<REDACTED>"), "{}", incident.command);
    assert!(!incident.command.contains("supersecret"));
    assert!(!incident.command.contains("abc123"));
}

#[test]
fn wrong_key_fails_closed_on_read() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.db");
    let writer = Ledger::open(&path, sealed_policy(), Redactor::new()).unwrap();
    let (row_id, _) = writer
        .log_incident(sample_incident("incident-key", "python3 worker.py"))
        .unwrap();
    drop(writer);

    let other_key = "f".repeat(64);
    let other_policy = EncryptionPolicy::from_master_key(Some(&other_key)).unwrap();
    let reader = Ledger::open(&path, other_policy, Redactor::new()).unwrap();
    assert!(matches!(
        reader.get_incident(row_id),
        Err(LedgerError::Decrypt(_))
    ));
}

#[test]
fn plaintext_policy_stores_sanitized_plaintext() {
    let ledger = plaintext_ledger();
    let (row_id, _) = ledger
        .log_incident(sample_incident("incident-plain", "run --password hunter2"))
        .unwrap();
    let incident = ledger.get_incident(row_id).unwrap();
    assert!(incident.command.contains("--password <REDACTED>"));
}

#[test]
fn sanitization_covers_every_event_kind() {
    let ledger = memory_ledger();
    let secret_command = "python3 worker.py --api-key supersecret";
    let contract = current_engine_contract(RolloutMode::Enforce);

    ledger
        .log_decision_trace(
            secret_command,
            4242,
            95.0,
            10.0,
            96.0,
            "KILL",
            "sanitized decision trace",
            "incident-secure-1",
            "",
            &contract,
        )
        .unwrap();
    ledger
        .log_audit(
            "flowforge",
            "AUTO_KILL",
            "details FLOWFORGE_API_KEY=anothersecret",
            "monitor",
            4242,
            secret_command,
            "incident-secure-1",
            "",
        )
        .unwrap();
    ledger
        .log_policy_dry_run(secret_command, 4242, "dry-run coverage", 88.8, "incident-secure-1")
        .unwrap();

    let traces = ledger.decision_traces(10).unwrap();
    assert_eq!(traces.len(), 1);
    assert!(traces[0].command.contains("<REDACTED>"));
    assert!(!traces[0].command.contains("supersecret"));

    for event in ledger.timeline(10).unwrap() {
        assert!(!event.summary.contains("supersecret"), "{}", event.summary);
        assert!(
            !event.reason_text.contains("anothersecret"),
            "{}",
            event.reason_text
        );
    }

    let dry_runs: Vec<_> = ledger
        .timeline(10)
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventKind::PolicyDryRun)
        .collect();
    assert_eq!(dry_runs.len(), 1);
    assert!(dry_runs[0].summary.contains("<REDACTED>"));
}

#[test]
fn decision_trace_digest_replays_to_match() {
    let ledger = memory_ledger();
    let contract = current_engine_contract(RolloutMode::Enforce);
    let id = ledger
        .log_decision_trace(
            "python3 worker.py",
            4242,
            100.0,
            48.75,
            82.9375,
            "KILL",
            "CPU 96.0% >= 90.0% for 15s and log repetition 1.00 >= 0.80",
            "incident-loop",
            "req_test",
            &contract,
        )
        .unwrap();

    let trace = ledger.decision_trace_by_id(id).unwrap();
    assert!(!trace.replay_digest.is_empty());
    assert_eq!(trace.replay_contract_version, "decision-replay.v1");

    let verification = crate::policy::replay::verify(
        &trace.replay_digest,
        &crate::policy::replay::ReplayInput {
            decision_engine: trace.decision_engine.clone(),
            engine_version: trace.engine_version.clone(),
            decision_contract_version: trace.decision_contract_version.clone(),
            rollout_mode: trace.rollout_mode.clone(),
            decision: trace.decision.clone(),
            reason: trace.reason.clone(),
            cpu_score: trace.cpu_score,
            entropy_score: trace.entropy_score,
            confidence_score: trace.confidence_score,
        },
    );
    assert_eq!(
        verification.status,
        crate::policy::replay::ReplayStatus::Match
    );
}

#[test]
fn incidents_paginate_newest_first() {
    let ledger = memory_ledger();
    for name in ["worker_a", "worker_b", "worker_c"] {
        ledger
            .log_incident(sample_incident("", &format!("python3 {name}.py")))
            .unwrap();
    }

    let page1 = ledger.incidents_page(2, 0).unwrap();
    assert_eq!(page1.items.len(), 2);
    assert!(page1.has_more);
    assert!(page1.next_cursor > 0);
    assert!(page1.items[0].id > page1.items[1].id, "newest first");

    let page2 = ledger.incidents_page(2, page1.next_cursor).unwrap();
    assert_eq!(page2.items.len(), 1);
    assert!(!page2.has_more);
    assert_eq!(page2.next_cursor, 0);
    let page1_ids: Vec<i64> = page1.items.iter().map(|i| i.id).collect();
    assert!(!page1_ids.contains(&page2.items[0].id));
}

#[test]
fn timeline_paginates_newest_first() {
    let ledger = memory_ledger();
    for title in ["A", "B", "C"] {
        ledger.append_event(audit_event("incident-page", title)).unwrap();
    }

    let page1 = ledger.timeline_page(2, 0).unwrap();
    assert_eq!(page1.items.len(), 2);
    assert!(page1.has_more);
    assert_eq!(page1.items[0].title, "C");

    let page2 = ledger.timeline_page(2, page1.next_cursor).unwrap();
    assert_eq!(page2.items.len(), 1);
    assert!(!page2.has_more);
    assert_eq!(page2.next_cursor, 0);
    assert_eq!(page2.items[0].title, "A");
}

#[test]
fn incident_timeline_filters_and_orders_ascending() {
    let ledger = memory_ledger();
    ledger.set_run_id("run-contract");
    let incident_id = "incident-contract-001";

    let contract = current_engine_contract(RolloutMode::Enforce);
    ledger
        .log_decision_trace(
            "worker",
            4040,
            100.0,
            12.0,
            95.0,
            "KILL",
            "CPU threshold breach",
            incident_id,
            "",
            &contract,
        )
        .unwrap();
    ledger
        .log_audit("api-key", "RESTART", "manual restart", "api", 4040, "worker", incident_id, "")
        .unwrap();
    ledger
        .log_audit("system", "ALERT", "unrelated", "api", 9090, "other", "incident-other-002", "")
        .unwrap();

    let events = ledger.incident_timeline(incident_id, 500).unwrap();
    assert_eq!(events.len(), 2);
    assert!(events[0].id < events[1].id, "ascending insertion order");
    for event in &events {
        assert_eq!(event.incident_id.as_deref(), Some(incident_id));
        assert_eq!(event.run_id, "run-contract");
        assert!(!event.event_id.is_empty());
    }
}

#[test]
fn events_are_searchable_by_request_id() {
    let ledger = memory_ledger();
    ledger
        .log_audit("api-key", "KILL", "op kill", "api", 1, "cmd", "inc-1", "req_abc")
        .unwrap();
    ledger
        .log_audit("api-key", "RESTART", "op restart", "api", 1, "cmd", "inc-1", "req_abc")
        .unwrap();
    ledger
        .log_audit("api-key", "KILL", "other", "api", 1, "cmd", "inc-2", "req_other")
        .unwrap();

    let chain = ledger.events_by_request_id("req_abc", 100).unwrap();
    assert_eq!(chain.len(), 2);
    assert!(chain.iter().all(|e| e.request_id.as_deref() == Some("req_abc")));
    assert!(chain[0].id < chain[1].id);
}

#[test]
fn idempotency_replays_and_conflicts() {
    let ledger = memory_ledger();
    let scope = "POST /process/restart";
    let key_hash = "k".repeat(64);
    let fp_a = "a".repeat(64);
    let fp_b = "b".repeat(64);

    assert_eq!(
        ledger.check_idempotent(scope, &key_hash, &fp_a).unwrap(),
        IdempotencyOutcome::FirstUse
    );
    ledger
        .store_idempotent(scope, &key_hash, &fp_a, 202, r#"{"status":"ACCEPTED"}"#)
        .unwrap();

    match ledger.check_idempotent(scope, &key_hash, &fp_a).unwrap() {
        IdempotencyOutcome::Replay {
            status_code,
            response_body,
        } => {
            assert_eq!(status_code, 202);
            assert_eq!(response_body, r#"{"status":"ACCEPTED"}"#);
        }
        other => panic!("expected replay, got {other:?}"),
    }

    assert_eq!(
        ledger.check_idempotent(scope, &key_hash, &fp_b).unwrap(),
        IdempotencyOutcome::Conflict
    );

    // Duplicate store is a no-op; the original response wins.
    ledger
        .store_idempotent(scope, &key_hash, &fp_b, 500, "late")
        .unwrap();
    match ledger.check_idempotent(scope, &key_hash, &fp_a).unwrap() {
        IdempotencyOutcome::Replay { status_code, .. } => assert_eq!(status_code, 202),
        other => panic!("expected replay, got {other:?}"),
    }

    let stats = ledger.replay_cache_stats().unwrap();
    assert_eq!(stats.row_count, 1);
    assert!(stats.oldest_age_seconds >= 0);

    let trend = ledger.replay_cache_trend(7).unwrap();
    assert_eq!(trend.len(), 1);
    assert_eq!(trend[0].replay_count, 2);
    assert_eq!(trend[0].conflict_count, 1);
}

#[test]
fn baseline_state_round_trips_and_tracks_transitions() {
    let ledger = memory_ledger();
    let key = "threshold-decider@1.1.0|enforce";

    assert!(ledger.baseline_state(key).unwrap().is_none());

    ledger.upsert_baseline_state(key, 5, 1, "pending").unwrap();
    let first = ledger.baseline_state(key).unwrap().unwrap();
    assert_eq!(first.latest_trace_id, 5);
    assert_eq!(first.consecutive_breach_count, 1);
    assert_eq!(first.status, "pending");

    // Same status: transition timestamp is preserved.
    ledger.upsert_baseline_state(key, 6, 2, "pending").unwrap();
    let second = ledger.baseline_state(key).unwrap().unwrap();
    assert_eq!(second.last_transition_at, first.last_transition_at);
    assert_eq!(second.latest_trace_id, 6);

    // Status change: transition timestamp moves with last_checked_at.
    ledger.upsert_baseline_state(key, 7, 2, "at_risk").unwrap();
    let third = ledger.baseline_state(key).unwrap().unwrap();
    assert_eq!(third.status, "at_risk");
    assert_eq!(third.last_transition_at, third.last_checked_at);
}

#[test]
fn baseline_state_requires_bucket_key() {
    let ledger = memory_ledger();
    assert!(matches!(
        ledger.baseline_state("  "),
        Err(LedgerError::InvalidInput(_))
    ));
    assert!(matches!(
        ledger.upsert_baseline_state("", 1, 1, "pending"),
        Err(LedgerError::InvalidInput(_))
    ));
}

#[test]
fn workspaces_upsert_and_toggle_protection() {
    let ledger = memory_ledger();
    let ws = ledger
        .upsert_workspace("ws-1", "/repos/app", "", "")
        .unwrap();
    assert_eq!(ws.profile, "standard");
    assert_eq!(ws.client, "unknown");
    assert!(ws.protection_enabled);

    let updated = ledger
        .upsert_workspace("ws-1", "/repos/app2", "strict", "editor")
        .unwrap();
    assert_eq!(updated.workspace_path, "/repos/app2");
    assert_eq!(updated.profile, "strict");
    assert_eq!(updated.created_at, ws.created_at);

    let off = ledger.set_workspace_protection("ws-1", false).unwrap();
    assert!(!off.protection_enabled);

    ledger.set_workspace_active_pid("ws-1", 4242).unwrap();
    let bound = ledger.get_workspace("ws-1").unwrap().unwrap();
    assert_eq!(bound.active_pid, 4242);

    assert!(matches!(
        ledger.set_workspace_protection("missing", true),
        Err(LedgerError::NotFound(_))
    ));
}

#[test]
fn latest_incident_event_is_newest() {
    let ledger = memory_ledger();
    assert!(ledger.latest_incident_event().unwrap().is_none());
    ledger.log_incident(sample_incident("inc-old", "a")).unwrap();
    ledger.log_incident(sample_incident("inc-new", "b")).unwrap();
    let latest = ledger.latest_incident_event().unwrap().unwrap();
    assert_eq!(latest.incident_id.as_deref(), Some("inc-new"));
}

#[test]
fn incident_id_is_generated_when_empty() {
    let ledger = memory_ledger();
    let (_, incident_id) = ledger.log_incident(sample_incident("", "cmd")).unwrap();
    assert_eq!(incident_id.len(), 36, "uuid v4 expected: {incident_id}");
}
