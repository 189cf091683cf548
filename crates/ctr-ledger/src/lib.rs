//! ctr-ledger
//!
//! Ledger Client for the on-chain consent registry.
//!
//! # Layers
//! - [`LedgerBackend`] is the raw transport contract (submit a write, poll its
//!   inclusion, read finalized consent, read history). Implementations:
//!   [`SimLedger`] (in-process) and [`RpcLedger`] (Ethereum JSON-RPC).
//! - [`LedgerClient`] owns the per-subject submission lanes and the finality
//!   wait. It is the only component that touches the lanes.
//!
//! # Invariants
//! - A write is submitted only while its subject's lane is held, and the lane
//!   stays held by the returned [`PendingHandle`] until the caller drops it.
//!   Two writes for the same subject therefore can never be in flight at once,
//!   so ledger inclusion order equals submission order per subject.
//! - `await_finality` never resubmits. A timed-out handle is re-polled, not
//!   replaced.

mod client;
pub mod rpc;
pub mod sim;

pub use client::{FinalityError, LedgerClient, PendingHandle, SubjectSlot};
pub use rpc::RpcLedger;
pub use sim::SimLedger;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ctr_schemas::{
    AccessEvent, ActionKind, ActorId, AuditRecord, ConfirmationId, ConsentChange, ConsentEvent,
    ConsentState, Purpose, SubjectId,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Writes and confirmations
// ---------------------------------------------------------------------------

/// A write against the registry contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerWrite {
    Consent {
        subject: SubjectId,
        change: ConsentChange,
    },
    Access {
        subject: SubjectId,
        actor: ActorId,
        purpose: Purpose,
    },
}

impl LedgerWrite {
    pub fn subject(&self) -> &SubjectId {
        match self {
            LedgerWrite::Consent { subject, .. } => subject,
            LedgerWrite::Access { subject, .. } => subject,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            LedgerWrite::Consent { change, .. } => change.kind(),
            LedgerWrite::Access { .. } => ActionKind::Access,
        }
    }
}

/// Proof of irreversible inclusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub confirmation_id: ConfirmationId,
    /// Per-subject position in ledger inclusion order (1-based).
    pub seq: u64,
    pub included_at: DateTime<Utc>,
}

/// Inclusion state of a submitted write, as reported by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InclusionStatus {
    Pending,
    Included(Confirmation),
    /// The ledger reports the submission invalid (reverted, stale nonce,
    /// not authorized at the contract layer). Nothing was committed.
    Failed { reason: String },
}

/// A finalized write read back from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    pub write: LedgerWrite,
    pub confirmation: Confirmation,
}

impl LedgerRecord {
    /// The audit event this record must be mirrored as.
    pub fn to_audit_record(&self) -> AuditRecord {
        let c = &self.confirmation;
        match &self.write {
            LedgerWrite::Consent { subject, change } => AuditRecord::Consent(ConsentEvent {
                subject: subject.clone(),
                state: change.target_state(),
                confirmation_id: c.confirmation_id.clone(),
                recorded_at: c.included_at,
                seq: c.seq,
            }),
            LedgerWrite::Access {
                subject,
                actor,
                purpose,
            } => AuditRecord::Access(AccessEvent {
                subject: subject.clone(),
                actor: actor.clone(),
                purpose: purpose.clone(),
                confirmation_id: c.confirmation_id.clone(),
                recorded_at: c.included_at,
                seq: c.seq,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Synchronous submission failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// Malformed write; the ledger was never contacted.
    Invalid(String),
    /// The ledger refused the submission.
    Rejected(String),
    /// The ledger could not be reached; nothing was submitted.
    Transport(String),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Invalid(m) => write!(f, "invalid ledger write: {m}"),
            SubmitError::Rejected(m) => write!(f, "ledger rejected submission: {m}"),
            SubmitError::Transport(m) => write!(f, "ledger transport error: {m}"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Read/poll failure. Always transient from the caller's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    Transport(String),
    Decode(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Transport(m) => write!(f, "ledger transport error: {m}"),
            LedgerError::Decode(m) => write!(f, "ledger decode error: {m}"),
        }
    }
}

impl std::error::Error for LedgerError {}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Raw registry transport.
///
/// Implementations must be object-safe and `Send + Sync` so the client can
/// hold an `Arc<dyn LedgerBackend>` across task boundaries.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Short name for logs (e.g. `"sim"`, `"rpc"`).
    fn name(&self) -> &'static str;

    /// Hand the write to the ledger; returns the transaction hash at once.
    async fn submit(&self, write: &LedgerWrite) -> Result<ConfirmationId, SubmitError>;

    /// One inclusion check for a previously submitted write.
    async fn poll(&self, id: &ConfirmationId) -> Result<InclusionStatus, LedgerError>;

    /// Consent as last finalized on the ledger. Never-written subjects read
    /// as `Revoked`.
    async fn read_consent(&self, subject: &SubjectId) -> Result<ConsentState, LedgerError>;

    /// Every finalized write for `subject`, in ledger order.
    async fn history(&self, subject: &SubjectId) -> Result<Vec<LedgerRecord>, LedgerError>;
}
