//! Scenario: the Authorization Gate decides from the audit index alone.
//!
//! # Invariants under test
//! 1. A subject with no events is denied with `ConsentUnknown`.
//! 2. A blank purpose is denied before consent is read.
//! 3. After grant then revoke, `can_view` and `request_access` both answer
//!    `ConsentRevoked` and no access write reaches the ledger.
//! 4. An unreadable index fails closed with `AuditUnavailable`.

use ctr_reconcile::{AccessDecision, DenyReason, FailureKind, ReconciliationResult};
use ctr_schemas::{ActorId, ConsentChange};
use ctr_testkit::{subject, Harness};

fn h1() -> ActorId {
    ActorId::parse("0xH1").unwrap()
}

#[tokio::test]
async fn unknown_subject_is_denied() {
    let h = Harness::new();
    assert_eq!(
        h.engine.gate().can_view(&h1(), &subject("0xP1"), "review").await,
        AccessDecision::Denied(DenyReason::ConsentUnknown)
    );

    let r = h.engine.request_access("0xH1", "0xP1", "review").await;
    assert_eq!(
        r.failure_kind(),
        Some(FailureKind::AccessDenied(DenyReason::ConsentUnknown))
    );
    assert_eq!(h.ledger.submit_calls(), 0);
}

#[tokio::test]
async fn blank_purpose_denied_even_with_consent() {
    let h = Harness::new();
    assert!(h
        .engine
        .request_consent_change("0xP1", ConsentChange::Grant)
        .await
        .is_success());
    assert_eq!(
        h.engine.gate().can_view(&h1(), &subject("0xP1"), " ").await,
        AccessDecision::Denied(DenyReason::PurposeMissing)
    );
}

#[tokio::test]
async fn revoke_closes_access() {
    let h = Harness::new();
    let p1 = subject("0xP1");

    h.engine
        .request_consent_change("0xP1", ConsentChange::Grant)
        .await;
    assert!(h.engine.gate().can_view(&h1(), &p1, "review").await.is_allowed());
    assert!(h
        .engine
        .request_access("0xH1", "0xP1", "review")
        .await
        .is_success());

    h.engine
        .request_consent_change("0xP1", ConsentChange::Revoke)
        .await;
    assert_eq!(
        h.engine.gate().can_view(&h1(), &p1, "review").await,
        AccessDecision::Denied(DenyReason::ConsentRevoked)
    );

    let writes_before = h.ledger.accepted_writes();
    match h.engine.request_access("0xH1", "0xP1", "review").await {
        ReconciliationResult::Failure {
            kind, retriable, ..
        } => {
            assert_eq!(kind, FailureKind::AccessDenied(DenyReason::ConsentRevoked));
            assert!(!retriable);
        }
        other => panic!("expected denial, got {other:?}"),
    }
    assert_eq!(h.ledger.accepted_writes(), writes_before);
}

#[tokio::test]
async fn unreadable_index_fails_closed() {
    let h = Harness::new();
    h.engine
        .request_consent_change("0xP1", ConsentChange::Grant)
        .await;
    h.index.set_reads_down(true);

    assert_eq!(
        h.engine.gate().can_view(&h1(), &subject("0xP1"), "review").await,
        AccessDecision::Denied(DenyReason::AuditUnavailable)
    );
    let submits = h.ledger.submit_calls();
    let r = h.engine.request_access("0xH1", "0xP1", "review").await;
    assert_eq!(
        r.failure_kind(),
        Some(FailureKind::AccessDenied(DenyReason::AuditUnavailable))
    );
    assert_eq!(h.ledger.submit_calls(), submits);
}
