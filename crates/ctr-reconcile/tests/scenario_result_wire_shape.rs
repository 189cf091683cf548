//! Scenario: wire shape of reconciliation results.
//!
//! # Invariants under test
//! 1. Results are tagged by `outcome`; failures carry a `code` plus an
//!    optional `reason` for access denials.
//! 2. `retriable` is derived from the failure kind, never chosen by callers.
//! 3. Results deserialize back from the shape transports emit.

use chrono::{TimeZone, Utc};
use ctr_reconcile::{DenyReason, FailureKind, ReconciliationResult};
use ctr_schemas::ConfirmationId;
use serde_json::json;
use uuid::Uuid;

#[test]
fn success_shape() {
    let id = Uuid::nil();
    let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let r = ReconciliationResult::Success {
        attempt_id: id,
        confirmation_id: ConfirmationId::new("0xabc"),
        timestamp: ts,
        seq: 7,
    };
    let v = serde_json::to_value(&r).unwrap();
    assert_eq!(v["outcome"], "success");
    assert_eq!(v["confirmation_id"], "0xabc");
    assert_eq!(v["seq"], 7);
    assert_eq!(r.confirmation_id().map(|c| c.as_str()), Some("0xabc"));
}

#[test]
fn denial_carries_reason() {
    let r = ReconciliationResult::failure(
        Uuid::nil(),
        FailureKind::AccessDenied(DenyReason::ConsentRevoked),
        "consent revoked",
    );
    let v = serde_json::to_value(&r).unwrap();
    assert_eq!(v["outcome"], "failure");
    assert_eq!(
        v["kind"],
        json!({"code": "access_denied", "reason": "consent_revoked"})
    );
    assert_eq!(v["retriable"], false);
}

#[test]
fn retriable_follows_kind() {
    let cases = [
        (FailureKind::InvalidInput, false),
        (FailureKind::GapDetected, false),
        (FailureKind::AccessDenied(DenyReason::PurposeMissing), false),
        (FailureKind::SubmissionRejected, true),
        (FailureKind::FinalityTimeout, true),
        (FailureKind::IndexUnavailable, true),
        (FailureKind::Cancelled, true),
        (FailureKind::SubjectBusy, true),
    ];
    for (kind, retriable) in cases {
        let r = ReconciliationResult::failure(Uuid::new_v4(), kind, "x");
        assert_eq!(r.failure_kind(), Some(kind));
        match r {
            ReconciliationResult::Failure { retriable: got, .. } => {
                assert_eq!(got, retriable, "{kind:?}")
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}

#[test]
fn failure_reads_back() {
    let raw = json!({
        "outcome": "failure",
        "attempt_id": Uuid::nil(),
        "kind": {"code": "finality_timeout"},
        "retriable": true,
        "detail": "still pending",
    });
    let r: ReconciliationResult = serde_json::from_value(raw).unwrap();
    assert_eq!(r.failure_kind(), Some(FailureKind::FinalityTimeout));
    assert!(!r.is_success());
}
