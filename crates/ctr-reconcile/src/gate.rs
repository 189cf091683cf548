//! Authorization Gate.
//!
//! Answers "may `actor` view `subject`'s data for `purpose` right now" from
//! the audit index alone. Client-held flags are never consulted. Read only;
//! safe to call speculatively, and the engine calls it again under the
//! subject lane before submitting an access write.
//!
//! Evaluation order:
//! 1. blank purpose → `PurposeMissing`
//! 2. index read error → `AuditUnavailable` (fail closed)
//! 3. no consent ever recorded → `ConsentUnknown` (fail closed)
//! 4. latest consent revoked → `ConsentRevoked`
//! 5. otherwise `Allowed`

use std::sync::Arc;

use ctr_audit::AuditIndex;
use ctr_schemas::{ActorId, ConsentView, SubjectId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    PurposeMissing,
    ConsentUnknown,
    ConsentRevoked,
    AuditUnavailable,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::PurposeMissing => "purpose_missing",
            DenyReason::ConsentUnknown => "consent_unknown",
            DenyReason::ConsentRevoked => "consent_revoked",
            DenyReason::AuditUnavailable => "audit_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum AccessDecision {
    Allowed,
    Denied(DenyReason),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }
}

#[derive(Clone)]
pub struct AuthorizationGate {
    index: Arc<dyn AuditIndex>,
}

impl AuthorizationGate {
    pub fn new(index: Arc<dyn AuditIndex>) -> Self {
        Self { index }
    }

    pub async fn can_view(
        &self,
        actor: &ActorId,
        subject: &SubjectId,
        purpose: &str,
    ) -> AccessDecision {
        if purpose.trim().is_empty() {
            return AccessDecision::Denied(DenyReason::PurposeMissing);
        }

        let decision = match self.index.latest_consent_state(subject).await {
            Err(e) => {
                warn!(subject = %subject, error = %e, "consent read failed; denying");
                AccessDecision::Denied(DenyReason::AuditUnavailable)
            }
            Ok(ConsentView::Unknown) => AccessDecision::Denied(DenyReason::ConsentUnknown),
            Ok(ConsentView::Revoked) => AccessDecision::Denied(DenyReason::ConsentRevoked),
            Ok(ConsentView::Granted) => AccessDecision::Allowed,
        };
        debug!(actor = %actor, subject = %subject, ?decision, "can_view");
        decision
    }
}
