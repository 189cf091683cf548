//! Scenario: finality timeouts never resubmit.
//!
//! # Invariants under test
//! 1. A wait that times out once and succeeds on re-poll reaches `Indexed`
//!    with exactly one event and one ledger write.
//! 2. Past the finality horizon the attempt is parked: the caller gets a
//!    retriable `FinalityTimeout`, the subject is busy, and operators see it.
//! 3. A caller already queued on the subject lane when the attempt parks is
//!    turned away as busy instead of waiting on the parked lane.
//! 4. `resume_pending` completes a parked attempt from the same handle, with
//!    no second submission, and frees the subject.

use ctr_audit::AuditIndex;
use ctr_reconcile::{
    AlertKind, EngineError, EngineEvent, FailureKind, ProgressStage, ReconciliationResult,
};
use ctr_schemas::{ConsentChange, ConsentView};
use ctr_testkit::{subject, Harness};

#[tokio::test]
async fn one_timeout_then_included() -> anyhow::Result<()> {
    let h = Harness::new();
    let mut rx = h.engine.events();
    h.ledger.stall_polls(1);

    let r = h
        .engine
        .request_consent_change("0xP1", ConsentChange::Grant)
        .await;
    assert!(r.is_success(), "{r:?}");

    let p1 = subject("0xP1");
    assert_eq!(h.index.list_consent_events(&p1, None).await?.len(), 1);
    assert_eq!(h.ledger.accepted_writes(), 1);
    assert_eq!(h.ledger.submit_calls(), 1);

    let mut timeouts = 0;
    while let Ok(ev) = rx.try_recv() {
        if let EngineEvent::Progress {
            stage: ProgressStage::FinalityTimeout,
            ..
        } = ev
        {
            timeouts += 1;
        }
    }
    assert_eq!(timeouts, 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_attempt_is_parked_then_resumed() -> anyhow::Result<()> {
    let h = Harness::new();
    let mut rx = h.engine.events();
    let p1 = subject("0xP1");
    h.ledger.hold_inclusion(true);

    let parked = h
        .engine
        .request_consent_change("0xP1", ConsentChange::Grant)
        .await;
    match &parked {
        ReconciliationResult::Failure {
            kind, retriable, ..
        } => {
            assert_eq!(*kind, FailureKind::FinalityTimeout);
            assert!(*retriable);
        }
        other => panic!("expected FinalityTimeout, got {other:?}"),
    }

    let pending = h.engine.pending_attempts();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt_id, parked.attempt_id());
    assert_eq!(pending[0].finality_timeouts, 2);

    let mut exhausted = 0;
    while let Ok(ev) = rx.try_recv() {
        if let EngineEvent::Alert {
            alert: AlertKind::FinalityExhausted,
            ..
        } = ev
        {
            exhausted += 1;
        }
    }
    assert_eq!(exhausted, 1);

    // The subject is owned by the parked attempt.
    let busy = h
        .engine
        .request_consent_change("0xP1", ConsentChange::Revoke)
        .await;
    assert_eq!(busy.failure_kind(), Some(FailureKind::SubjectBusy));
    assert!(matches!(
        h.engine.verify_subject(&p1).await,
        Err(EngineError::SubjectBusy(_))
    ));

    // Still held: re-parked, nothing indexed.
    let still = h.engine.resume_pending().await;
    assert_eq!(still.len(), 1);
    assert_eq!(still[0].failure_kind(), Some(FailureKind::FinalityTimeout));
    assert_eq!(h.engine.pending_attempts().len(), 1);
    assert_eq!(h.index.latest_consent_state(&p1).await?, ConsentView::Unknown);

    h.ledger.hold_inclusion(false);
    let done = h.engine.resume_pending().await;
    assert_eq!(done.len(), 1);
    match &done[0] {
        ReconciliationResult::Success {
            attempt_id, seq, ..
        } => {
            assert_eq!(*attempt_id, parked.attempt_id());
            assert_eq!(*seq, 1);
        }
        other => panic!("resume should succeed, got {other:?}"),
    }
    assert!(h.engine.pending_attempts().is_empty());
    assert_eq!(h.ledger.submit_calls(), 1);
    assert_eq!(h.index.latest_consent_state(&p1).await?, ConsentView::Granted);

    // Lane released with the handle.
    let next = h
        .engine
        .request_consent_change("0xP1", ConsentChange::Revoke)
        .await;
    assert!(next.is_success(), "{next:?}");
    Ok(())
}

#[tokio::test]
async fn queued_caller_is_released_when_attempt_parks() -> anyhow::Result<()> {
    let h = Harness::new();
    h.ledger.hold_inclusion(true);

    let engine = h.engine.clone();
    let first = tokio::spawn(async move {
        engine
            .request_consent_change("0xP1", ConsentChange::Grant)
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // Queues behind the in-flight grant, which then parks.
    let second = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        h.engine
            .request_consent_change("0xP1", ConsentChange::Revoke),
    )
    .await?;
    assert_eq!(second.failure_kind(), Some(FailureKind::SubjectBusy));

    let first = first.await?;
    assert_eq!(first.failure_kind(), Some(FailureKind::FinalityTimeout));
    assert_eq!(h.ledger.submit_calls(), 1);
    Ok(())
}
