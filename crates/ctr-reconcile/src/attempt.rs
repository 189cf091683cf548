//! Reconciliation attempt state machine.
//!
//! ```text
//!  Created ──Submit──► Submitted ──Finalized──► Confirmed ──Indexed──► Indexed (term.)
//!     │                 │    ▲                     │
//!     │ SubmitRefused   │    │ FinalityTimedOut    │ IndexGap
//!     ▼                 │    └─────┘               ▼
//!  SubmitFailed (term.) │                      IndexFailed (term.)
//!                       │ FinalityRejected
//!                       ▼
//!                  FinalityFailed (term.)
//! ```
//!
//! `FinalityTimedOut` keeps the attempt in `Submitted`: the write may still
//! land, so the same handle is re-polled. There is no edge back to `Created`;
//! a submitted write is never resubmitted.
//!
//! Illegal transitions return [`TransitionError`]. Callers treat it as an
//! alert condition.

use chrono::{DateTime, Utc};
use ctr_schemas::{ActionKind, ActorId, ConfirmationId, Purpose, SubjectId};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Created,
    Submitted,
    Confirmed,
    /// Mirrored into the audit index. **Terminal.**
    Indexed,
    /// Refused before or at submission; nothing reached the ledger. **Terminal.**
    SubmitFailed,
    /// Ledger reported the write failed; nothing committed. **Terminal.**
    FinalityFailed,
    /// Confirmed on the ledger but refused by the index as a gap. **Terminal.**
    IndexFailed,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Indexed | Self::SubmitFailed | Self::FinalityFailed | Self::IndexFailed
        )
    }
}

/// Off-chain commit status of the attempt's event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Pending,
    Committed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptEvent {
    Submit { confirmation_id: ConfirmationId },
    SubmitRefused,
    FinalityTimedOut,
    Finalized { seq: u64, included_at: DateTime<Utc> },
    FinalityRejected,
    Indexed,
    IndexGap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: AttemptState,
    pub event: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal attempt transition: {:?} + {}", self.from, self.event)
    }
}

impl std::error::Error for TransitionError {}

/// One in-flight consent change or access action.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationAttempt {
    pub attempt_id: Uuid,
    pub kind: ActionKind,
    pub subject: SubjectId,
    pub actor: Option<ActorId>,
    pub purpose: Option<Purpose>,
    pub confirmation_id: Option<ConfirmationId>,
    pub seq: Option<u64>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub commit_status: CommitStatus,
    pub state: AttemptState,
    pub created_at: DateTime<Utc>,
    /// Finality waits that ended in a timeout.
    pub finality_timeouts: u32,
}

impl ReconciliationAttempt {
    fn new(kind: ActionKind, subject: SubjectId) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            kind,
            subject,
            actor: None,
            purpose: None,
            confirmation_id: None,
            seq: None,
            confirmed_at: None,
            commit_status: CommitStatus::Pending,
            state: AttemptState::Created,
            created_at: Utc::now(),
            finality_timeouts: 0,
        }
    }

    pub fn consent(kind: ActionKind, subject: SubjectId) -> Self {
        debug_assert!(kind != ActionKind::Access);
        Self::new(kind, subject)
    }

    pub fn access(actor: ActorId, subject: SubjectId, purpose: Purpose) -> Self {
        let mut a = Self::new(ActionKind::Access, subject);
        a.actor = Some(actor);
        a.purpose = Some(purpose);
        a
    }

    pub fn apply(&mut self, event: &AttemptEvent) -> Result<(), TransitionError> {
        use AttemptEvent as E;
        use AttemptState::*;

        match (self.state, event) {
            (Created, E::Submit { confirmation_id }) => {
                self.confirmation_id = Some(confirmation_id.clone());
                self.state = Submitted;
            }
            (Created, E::SubmitRefused) => {
                self.commit_status = CommitStatus::Failed;
                self.state = SubmitFailed;
            }

            (Submitted, E::FinalityTimedOut) => {
                self.finality_timeouts += 1;
            }
            (Submitted, E::Finalized { seq, included_at }) => {
                self.seq = Some(*seq);
                self.confirmed_at = Some(*included_at);
                self.state = Confirmed;
            }
            (Submitted, E::FinalityRejected) => {
                self.commit_status = CommitStatus::Failed;
                self.state = FinalityFailed;
            }

            (Confirmed, E::Indexed) => {
                self.commit_status = CommitStatus::Committed;
                self.state = Indexed;
            }
            (Confirmed, E::IndexGap) => {
                self.commit_status = CommitStatus::Failed;
                self.state = IndexFailed;
            }

            (state, ev) => {
                return Err(TransitionError {
                    from: state,
                    event: format!("{ev:?}"),
                });
            }
        }
        Ok(())
    }
}
