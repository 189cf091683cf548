use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ctr_audit::IndexError;
use ctr_config::EngineSettings;
use ctr_ledger::LedgerError;
use ctr_schemas::{ActionKind, ConfirmationId, ConsentState, ConsentView, SubjectId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gate::DenyReason;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "reason", rename_all = "snake_case")]
pub enum FailureKind {
    InvalidInput,
    SubmissionRejected,
    /// Outcome unknown; the attempt stays pending and is re-polled, never resubmitted.
    FinalityTimeout,
    IndexUnavailable,
    /// The subject is halted until an operator backfills it.
    GapDetected,
    AccessDenied(DenyReason),
    Cancelled,
    /// An unresolved pending attempt already owns the subject.
    SubjectBusy,
}

impl FailureKind {
    pub fn retriable(&self) -> bool {
        match self {
            FailureKind::InvalidInput
            | FailureKind::GapDetected
            | FailureKind::AccessDenied(_) => false,
            FailureKind::SubmissionRejected
            | FailureKind::FinalityTimeout
            | FailureKind::IndexUnavailable
            | FailureKind::Cancelled
            | FailureKind::SubjectBusy => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconciliationResult {
    Success {
        attempt_id: Uuid,
        confirmation_id: ConfirmationId,
        timestamp: DateTime<Utc>,
        seq: u64,
    },
    Failure {
        attempt_id: Uuid,
        kind: FailureKind,
        retriable: bool,
        detail: String,
    },
}

impl ReconciliationResult {
    pub fn failure(attempt_id: Uuid, kind: FailureKind, detail: impl Into<String>) -> Self {
        ReconciliationResult::Failure {
            attempt_id,
            kind,
            retriable: kind.retriable(),
            detail: detail.into(),
        }
    }

    pub fn attempt_id(&self) -> Uuid {
        match self {
            ReconciliationResult::Success { attempt_id, .. } => *attempt_id,
            ReconciliationResult::Failure { attempt_id, .. } => *attempt_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ReconciliationResult::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ReconciliationResult::Failure { kind, .. } => Some(*kind),
            ReconciliationResult::Success { .. } => None,
        }
    }

    pub fn confirmation_id(&self) -> Option<&ConfirmationId> {
        match self {
            ReconciliationResult::Success {
                confirmation_id, ..
            } => Some(confirmation_id),
            ReconciliationResult::Failure { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Operator visibility
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Submitted,
    FinalityTimeout,
    Confirmed,
    IndexRetry,
    Indexed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Finality horizon exceeded; attempt parked as pending.
    FinalityExhausted,
    /// Index writes keep failing for a confirmed ledger write.
    IndexUnavailable,
    GapDetected,
    /// Ledger and index disagree on a subject's consent.
    Drift,
    IllegalTransition,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Progress {
        attempt_id: Uuid,
        subject: SubjectId,
        stage: ProgressStage,
        detail: String,
    },
    Alert {
        alert: AlertKind,
        subject: SubjectId,
        attempt_id: Option<Uuid>,
        detail: String,
    },
    Completed {
        subject: SubjectId,
        kind: ActionKind,
        result: ReconciliationResult,
    },
}

/// Operator snapshot of an attempt parked after its finality horizon.
#[derive(Debug, Clone, Serialize)]
pub struct PendingAttemptView {
    pub attempt_id: Uuid,
    pub subject: SubjectId,
    pub kind: ActionKind,
    pub confirmation_id: ConfirmationId,
    pub submitted_at: DateTime<Utc>,
    pub parked_at: DateTime<Utc>,
    pub finality_timeouts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HaltedSubject {
    pub subject: SubjectId,
    pub expected_seq: u64,
    pub got_seq: u64,
    pub halted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftReport {
    Clean {
        subject: SubjectId,
        consent: ConsentState,
    },
    Drift {
        subject: SubjectId,
        ledger: ConsentState,
        index: ConsentView,
    },
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        matches!(self, DriftReport::Clean { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub subject: SubjectId,
    pub ledger_records: usize,
    pub appended: usize,
    pub duplicates: usize,
    pub index_last_seq: u64,
    /// Set when replay stopped on a gap the ledger history cannot fill.
    pub gap: Option<(u64, u64)>,
    pub halt_lifted: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of an operator operation (verify, backfill).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Ledger(LedgerError),
    Index(IndexError),
    /// A pending attempt owns the subject lane.
    SubjectBusy(SubjectId),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Ledger(e) => write!(f, "{e}"),
            EngineError::Index(e) => write!(f, "{e}"),
            EngineError::SubjectBusy(s) => write!(f, "subject {s} has a pending attempt"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        EngineError::Ledger(e)
    }
}

impl From<IndexError> for EngineError {
    fn from(e: IndexError) -> Self {
        EngineError::Index(e)
    }
}

// ---------------------------------------------------------------------------
// Config and cancellation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub finality_timeout: Duration,
    pub max_finality_polls: u32,
    pub index_backoff_initial: Duration,
    pub index_backoff_max: Duration,
    pub index_alert_after: u32,
}

impl EngineConfig {
    pub fn from_settings(s: &EngineSettings) -> Self {
        Self {
            finality_timeout: s.finality_timeout(),
            max_finality_polls: s.max_finality_polls.max(1),
            index_backoff_initial: s.index_backoff_initial(),
            index_backoff_max: s.index_backoff_max(),
            index_alert_after: s.index_alert_after.max(1),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

/// Caller-side cancellation. Honoured only before submission.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
