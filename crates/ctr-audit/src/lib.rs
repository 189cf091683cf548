//! ctr-audit
//!
//! Off-chain Audit Index: one record per confirmed consent change and per
//! confirmed access event, keyed by subject and ordered by ledger sequence.
//!
//! # Append rules (every implementation)
//! 1. A confirmation id already present anywhere in the index is a
//!    `DuplicateConfirmationId`: nothing is written, state is unchanged.
//! 2. `seq != last_seq(subject) + 1` is a `Gap` (jumps and regressions alike).
//! 3. Otherwise the record is appended.
//!
//! [`SubjectLedger`] holds these rules so the in-memory and journal indexes
//! cannot drift apart. The Postgres index (`ctr-db`) enforces the same rules
//! in SQL.

pub mod journal;
mod ledger;
mod memory;

pub use journal::{verify_journal, verify_journal_str, JournalAuditIndex, VerifyResult};
pub use ledger::SubjectLedger;
pub use memory::MemoryAuditIndex;

use std::fmt;

use async_trait::async_trait;
use ctr_schemas::{AccessEvent, AuditRecord, ConsentEvent, ConsentView, SubjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The confirmation id was already recorded; the append was a no-op.
    DuplicateConfirmationId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// Store unreachable or a write failed. Transient; retry.
    Unavailable(String),
    /// The record's seq is not the next one for its subject. A ledger write
    /// for this subject is missing from the index.
    Gap {
        subject: SubjectId,
        expected: u64,
        got: u64,
    },
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::Unavailable(m) => write!(f, "audit index unavailable: {m}"),
            IndexError::Gap {
                subject,
                expected,
                got,
            } => write!(
                f,
                "audit index gap for subject {subject}: expected seq {expected}, got {got}"
            ),
        }
    }
}

impl std::error::Error for IndexError {}

#[async_trait]
pub trait AuditIndex: Send + Sync {
    fn name(&self) -> &'static str;

    async fn append_consent_event(&self, ev: &ConsentEvent) -> Result<AppendOutcome, IndexError>;

    async fn append_access_event(&self, ev: &AccessEvent) -> Result<AppendOutcome, IndexError>;

    /// `Unknown` until the first consent event for the subject is recorded.
    async fn latest_consent_state(&self, subject: &SubjectId) -> Result<ConsentView, IndexError>;

    /// Access events in seq order. `since` is an exclusive seq cursor.
    async fn list_access_events(
        &self,
        subject: &SubjectId,
        since: Option<u64>,
    ) -> Result<Vec<AccessEvent>, IndexError>;

    /// Consent events in seq order. `since` is an exclusive seq cursor.
    async fn list_consent_events(
        &self,
        subject: &SubjectId,
        since: Option<u64>,
    ) -> Result<Vec<ConsentEvent>, IndexError>;

    /// Highest recorded seq for the subject; 0 when nothing is recorded.
    async fn last_seq(&self, subject: &SubjectId) -> Result<u64, IndexError>;

    /// Every subject with at least one record.
    async fn subjects(&self) -> Result<Vec<SubjectId>, IndexError>;

    async fn append_record(&self, rec: &AuditRecord) -> Result<AppendOutcome, IndexError> {
        match rec {
            AuditRecord::Consent(ev) => self.append_consent_event(ev).await,
            AuditRecord::Access(ev) => self.append_access_event(ev).await,
        }
    }
}
