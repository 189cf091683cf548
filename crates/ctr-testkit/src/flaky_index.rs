//! Audit index double that goes unavailable on demand.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use ctr_audit::{AppendOutcome, AuditIndex, IndexError, MemoryAuditIndex};
use ctr_schemas::{AccessEvent, ConsentEvent, ConsentView, SubjectId};

#[derive(Debug, Default)]
pub struct FlakyIndex {
    inner: MemoryAuditIndex,
    failing_appends: AtomicU32,
    reads_down: AtomicBool,
    append_calls: AtomicU64,
}

impl FlakyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` appends fail with `Unavailable` and write nothing.
    pub fn fail_next_appends(&self, n: u32) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    pub fn set_reads_down(&self, down: bool) {
        self.reads_down.store(down, Ordering::SeqCst);
    }

    /// Append calls seen, failed ones included.
    pub fn append_calls(&self) -> u64 {
        self.append_calls.load(Ordering::SeqCst)
    }

    fn gate_append(&self) -> Result<(), IndexError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(IndexError::Unavailable("scripted outage".to_string()));
        }
        Ok(())
    }

    fn gate_read(&self) -> Result<(), IndexError> {
        if self.reads_down.load(Ordering::SeqCst) {
            return Err(IndexError::Unavailable("scripted read outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditIndex for FlakyIndex {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn append_consent_event(&self, ev: &ConsentEvent) -> Result<AppendOutcome, IndexError> {
        self.gate_append()?;
        self.inner.append_consent_event(ev).await
    }

    async fn append_access_event(&self, ev: &AccessEvent) -> Result<AppendOutcome, IndexError> {
        self.gate_append()?;
        self.inner.append_access_event(ev).await
    }

    async fn latest_consent_state(&self, subject: &SubjectId) -> Result<ConsentView, IndexError> {
        self.gate_read()?;
        self.inner.latest_consent_state(subject).await
    }

    async fn list_access_events(
        &self,
        subject: &SubjectId,
        since: Option<u64>,
    ) -> Result<Vec<AccessEvent>, IndexError> {
        self.gate_read()?;
        self.inner.list_access_events(subject, since).await
    }

    async fn list_consent_events(
        &self,
        subject: &SubjectId,
        since: Option<u64>,
    ) -> Result<Vec<ConsentEvent>, IndexError> {
        self.gate_read()?;
        self.inner.list_consent_events(subject, since).await
    }

    async fn last_seq(&self, subject: &SubjectId) -> Result<u64, IndexError> {
        self.gate_read()?;
        self.inner.last_seq(subject).await
    }

    async fn subjects(&self) -> Result<Vec<SubjectId>, IndexError> {
        self.gate_read()?;
        self.inner.subjects().await
    }
}
