//! Scenario: per-subject ordering under concurrency.
//!
//! # Invariants under test
//! 1. Concurrent consent changes for one subject are indexed in exactly the
//!    ledger's inclusion order, with contiguous seq.
//! 2. After N changes the index's latest state equals the ledger's.
//! 3. Subjects do not block or reorder each other.

use std::sync::Arc;

use ctr_audit::AuditIndex;
use ctr_ledger::LedgerBackend;
use ctr_reconcile::{ReconciliationEngine, ReconciliationResult};
use ctr_schemas::{ConfirmationId, ConsentChange, ConsentView};
use ctr_testkit::{subject, Harness};

fn change(i: usize) -> ConsentChange {
    if i % 2 == 0 {
        ConsentChange::Grant
    } else {
        ConsentChange::Revoke
    }
}

async fn spawn_changes(
    engine: &Arc<ReconciliationEngine>,
    subjects: &[&str],
    per_subject: usize,
) -> anyhow::Result<Vec<ReconciliationResult>> {
    let mut tasks = Vec::new();
    for i in 0..per_subject {
        for s in subjects {
            let engine = engine.clone();
            let s = s.to_string();
            tasks.push(tokio::spawn(async move {
                engine.request_consent_change(&s, change(i)).await
            }));
        }
    }
    let mut out = Vec::new();
    for t in tasks {
        out.push(t.await?);
    }
    Ok(out)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_changes_index_in_ledger_order() -> anyhow::Result<()> {
    let h = Harness::new();
    let results = spawn_changes(&h.engine, &["0xP1"], 20).await?;
    assert!(results.iter().all(|r| r.is_success()), "{results:?}");

    let p1 = subject("0xP1");
    let indexed: Vec<(u64, ConfirmationId)> = h
        .index
        .list_consent_events(&p1, None)
        .await?
        .into_iter()
        .map(|e| (e.seq, e.confirmation_id))
        .collect();
    let ledger: Vec<(u64, ConfirmationId)> = h
        .ledger
        .history(&p1)
        .await?
        .into_iter()
        .map(|r| (r.confirmation.seq, r.confirmation.confirmation_id))
        .collect();

    assert_eq!(indexed.len(), 20);
    assert_eq!(indexed, ledger);
    let seqs: Vec<u64> = indexed.iter().map(|(s, _)| *s).collect();
    assert_eq!(seqs, (1..=20).collect::<Vec<u64>>());

    let ledger_state = h.ledger.read_consent(&p1).await?;
    assert_eq!(
        h.index.latest_consent_state(&p1).await?,
        ConsentView::from(ledger_state)
    );
    assert!(h.engine.verify_subject(&p1).await?.is_clean());
    Ok(())
}

#[tokio::test]
async fn sequential_changes_end_on_last() -> anyhow::Result<()> {
    let h = Harness::new();
    let p1 = subject("0xP1");
    for i in 0..7 {
        let r = h.engine.request_consent_change("0xP1", change(i)).await;
        match r {
            ReconciliationResult::Success { seq, .. } => assert_eq!(seq, i as u64 + 1),
            other => panic!("change {i} failed: {other:?}"),
        }
    }
    // Index 6 is a grant.
    assert_eq!(h.index.latest_consent_state(&p1).await?, ConsentView::Granted);
    assert_eq!(h.index.last_seq(&p1).await?, 7);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subjects_are_independent() -> anyhow::Result<()> {
    let h = Harness::new();
    let names = ["0xP1", "0xP2", "0xP3"];
    let results = spawn_changes(&h.engine, &names, 5).await?;
    assert!(results.iter().all(|r| r.is_success()), "{results:?}");

    for name in names {
        let s = subject(name);
        assert_eq!(h.index.last_seq(&s).await?, 5);
        let on_ledger = h.ledger.read_consent(&s).await?;
        assert_eq!(
            h.index.latest_consent_state(&s).await?,
            ConsentView::from(on_ledger)
        );
    }
    let mut reports = h.engine.drift_sweep().await?;
    reports.retain(|r| !r.is_clean());
    assert!(reports.is_empty(), "{reports:?}");
    Ok(())
}
