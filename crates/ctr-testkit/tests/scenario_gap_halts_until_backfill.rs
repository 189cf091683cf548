//! Scenario: a ledger write missing from the index.
//!
//! # Invariants under test
//! 1. Mirroring a confirmed write whose seq skips one is refused as a gap:
//!    the caller gets `GapDetected` (not retriable), the subject is halted
//!    and an alert is raised.
//! 2. A halted subject refuses new actions without contacting the ledger.
//! 3. `verify_subject` reports the drift.
//! 4. `backfill` replays ledger history, absorbs what is already indexed,
//!    and lifts the halt once the index is contiguous and agrees.

use ctr_audit::AuditIndex;
use ctr_ledger::LedgerWrite;
use ctr_reconcile::{AlertKind, DriftReport, EngineEvent, FailureKind, ReconciliationResult};
use ctr_schemas::{ConsentChange, ConsentState, ConsentView};
use ctr_testkit::{subject, Harness};

#[tokio::test]
async fn gap_halts_and_backfill_repairs() -> anyhow::Result<()> {
    let h = Harness::new();
    let mut rx = h.engine.events();
    let p1 = subject("0xP1");

    h.ledger
        .commit_out_of_band(&LedgerWrite::Consent {
            subject: p1.clone(),
            change: ConsentChange::Grant,
        })
        .await?;

    let r = h
        .engine
        .request_consent_change("0xP1", ConsentChange::Grant)
        .await;
    match &r {
        ReconciliationResult::Failure {
            kind, retriable, ..
        } => {
            assert_eq!(*kind, FailureKind::GapDetected);
            assert!(!retriable);
        }
        other => panic!("expected gap, got {other:?}"),
    }
    assert!(h.engine.is_halted(&p1));
    let halted = h.engine.halted_subjects();
    assert_eq!(halted.len(), 1);
    assert_eq!((halted[0].expected_seq, halted[0].got_seq), (1, 2));

    let mut gap_alerts = 0;
    while let Ok(ev) = rx.try_recv() {
        if let EngineEvent::Alert {
            alert: AlertKind::GapDetected,
            ..
        } = ev
        {
            gap_alerts += 1;
        }
    }
    assert_eq!(gap_alerts, 1);

    let submits = h.ledger.submit_calls();
    let refused = h.engine.request_access("0xH1", "0xP1", "review").await;
    assert_eq!(refused.failure_kind(), Some(FailureKind::GapDetected));
    assert_eq!(h.ledger.submit_calls(), submits);

    assert_eq!(
        h.engine.verify_subject(&p1).await?,
        DriftReport::Drift {
            subject: p1.clone(),
            ledger: ConsentState::Granted,
            index: ConsentView::Unknown,
        }
    );

    let report = h.engine.backfill(&p1).await?;
    assert_eq!(report.ledger_records, 2);
    assert_eq!(report.appended, 2);
    assert_eq!(report.duplicates, 0);
    assert_eq!(report.index_last_seq, 2);
    assert_eq!(report.gap, None);
    assert!(report.halt_lifted);
    assert!(!h.engine.is_halted(&p1));

    // A second backfill only finds duplicates.
    let again = h.engine.backfill(&p1).await?;
    assert_eq!((again.appended, again.duplicates), (0, 2));
    assert!(!again.halt_lifted);

    let access = h.engine.request_access("0xH1", "0xP1", "review").await;
    match access {
        ReconciliationResult::Success { seq, .. } => assert_eq!(seq, 3),
        other => panic!("access after backfill failed: {other:?}"),
    }
    assert!(h.engine.verify_subject(&p1).await?.is_clean());
    Ok(())
}

#[tokio::test]
async fn other_subjects_keep_working_while_one_is_halted() {
    let h = Harness::new();
    let p1 = subject("0xP1");
    h.ledger
        .commit_out_of_band(&LedgerWrite::Consent {
            subject: p1.clone(),
            change: ConsentChange::Revoke,
        })
        .await
        .unwrap();
    let r = h
        .engine
        .request_consent_change("0xP1", ConsentChange::Grant)
        .await;
    assert_eq!(r.failure_kind(), Some(FailureKind::GapDetected));

    assert!(h
        .engine
        .request_consent_change("0xP2", ConsentChange::Grant)
        .await
        .is_success());
    assert!(h.engine.is_halted(&p1));
    assert!(!h.engine.is_halted(&subject("0xP2")));
}
