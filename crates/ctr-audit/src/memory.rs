use async_trait::async_trait;
use ctr_schemas::{AccessEvent, AuditRecord, ConsentEvent, ConsentView, SubjectId};
use tokio::sync::RwLock;

use crate::{AppendOutcome, AuditIndex, IndexError, SubjectLedger};

/// Volatile index. Used by `audit.backend: memory` and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditIndex {
    inner: RwLock<SubjectLedger>,
}

impl MemoryAuditIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditIndex for MemoryAuditIndex {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append_consent_event(&self, ev: &ConsentEvent) -> Result<AppendOutcome, IndexError> {
        self.inner
            .write()
            .await
            .append(AuditRecord::Consent(ev.clone()))
    }

    async fn append_access_event(&self, ev: &AccessEvent) -> Result<AppendOutcome, IndexError> {
        self.inner
            .write()
            .await
            .append(AuditRecord::Access(ev.clone()))
    }

    async fn latest_consent_state(&self, subject: &SubjectId) -> Result<ConsentView, IndexError> {
        Ok(self.inner.read().await.latest_consent(subject))
    }

    async fn list_access_events(
        &self,
        subject: &SubjectId,
        since: Option<u64>,
    ) -> Result<Vec<AccessEvent>, IndexError> {
        Ok(self.inner.read().await.access_since(subject, since))
    }

    async fn list_consent_events(
        &self,
        subject: &SubjectId,
        since: Option<u64>,
    ) -> Result<Vec<ConsentEvent>, IndexError> {
        Ok(self.inner.read().await.consent_since(subject, since))
    }

    async fn last_seq(&self, subject: &SubjectId) -> Result<u64, IndexError> {
        Ok(self.inner.read().await.last_seq(subject))
    }

    async fn subjects(&self) -> Result<Vec<SubjectId>, IndexError> {
        Ok(self.inner.read().await.subjects())
    }
}
