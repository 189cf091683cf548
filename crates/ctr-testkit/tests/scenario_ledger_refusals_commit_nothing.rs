//! Scenario: the ledger refuses a write.
//!
//! # Invariants under test
//! 1. A rejected submission is a retriable `SubmissionRejected`; nothing is
//!    indexed and the subject lane is released.
//! 2. A write that reverts at inclusion is `SubmissionRejected` carrying the
//!    ledger's reason; nothing is indexed.

use ctr_audit::AuditIndex;
use ctr_reconcile::{FailureKind, ReconciliationResult};
use ctr_schemas::{ConsentChange, ConsentView};
use ctr_testkit::{subject, Harness};

#[tokio::test]
async fn rejected_submission() -> anyhow::Result<()> {
    let h = Harness::new();
    let p1 = subject("0xP1");
    h.ledger.reject_next_submit("nonce too low");

    match h
        .engine
        .request_consent_change("0xP1", ConsentChange::Grant)
        .await
    {
        ReconciliationResult::Failure {
            kind,
            retriable,
            detail,
            ..
        } => {
            assert_eq!(kind, FailureKind::SubmissionRejected);
            assert!(retriable);
            assert!(detail.contains("nonce too low"), "{detail}");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(h.index.latest_consent_state(&p1).await?, ConsentView::Unknown);

    let retry = h
        .engine
        .request_consent_change("0xP1", ConsentChange::Grant)
        .await;
    assert!(retry.is_success(), "{retry:?}");
    Ok(())
}

#[tokio::test]
async fn reverted_write() -> anyhow::Result<()> {
    let h = Harness::new();
    let p1 = subject("0xP1");
    h.ledger.revert_next_submit("execution reverted");

    let r = h
        .engine
        .request_consent_change("0xP1", ConsentChange::Grant)
        .await;
    match &r {
        ReconciliationResult::Failure { kind, detail, .. } => {
            assert_eq!(*kind, FailureKind::SubmissionRejected);
            assert!(detail.contains("execution reverted"), "{detail}");
        }
        other => panic!("expected revert, got {other:?}"),
    }
    assert_eq!(h.index.last_seq(&p1).await?, 0);
    assert!(h.engine.pending_attempts().is_empty());

    match h
        .engine
        .request_consent_change("0xP1", ConsentChange::Grant)
        .await
    {
        ReconciliationResult::Success { seq, .. } => assert_eq!(seq, 1),
        other => panic!("follow-up grant failed: {other:?}"),
    }
    Ok(())
}
