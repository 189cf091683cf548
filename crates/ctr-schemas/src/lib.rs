//! ctr-schemas
//!
//! Shared domain types for the consent / access-audit subsystem. Every other
//! crate speaks in these types; nothing here performs IO.
//!
//! Sequence numbers live in a single per-subject space shared by consent and
//! access events. The ledger assigns them at inclusion (1, 2, 3, ...), and the
//! audit index mirrors them verbatim.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Rejected identifier or purpose text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Empty or whitespace-only input.
    Blank { field: &'static str },
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdError::Blank { field } => write!(f, "{field} must not be blank"),
        }
    }
}

impl std::error::Error for IdError {}

fn normalize_wallet(raw: &str, field: &'static str) -> Result<String, IdError> {
    let t = raw.trim();
    if t.is_empty() {
        return Err(IdError::Blank { field });
    }
    // Wallet addresses are compared case-insensitively (checksum casing is
    // presentation only).
    Ok(t.to_ascii_lowercase())
}

/// A patient identity, addressed by its wallet-derived identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

impl SubjectId {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        normalize_wallet(raw, "subject").map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SubjectId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SubjectId> for String {
    fn from(v: SubjectId) -> Self {
        v.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The viewer of a subject's data (hospital / researcher wallet).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorId(String);

impl ActorId {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        normalize_wallet(raw, "actor").map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ActorId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ActorId> for String {
    fn from(v: ActorId) -> Self {
        v.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stated reason for viewing a subject's data. Never blank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Purpose(String);

impl Purpose {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let t = raw.trim();
        if t.is_empty() {
            return Err(IdError::Blank { field: "purpose" });
        }
        Ok(Self(t.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Purpose {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Purpose> for String {
    fn from(v: Purpose) -> Self {
        v.0
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The ledger's proof that a submitted action is irreversibly included
/// (the transaction hash). Opaque, globally unique, stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfirmationId(String);

impl ConfirmationId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfirmationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Consent
// ---------------------------------------------------------------------------

/// Definite consent state of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    Granted,
    Revoked,
}

impl ConsentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentState::Granted => "granted",
            ConsentState::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "granted" => Some(ConsentState::Granted),
            "revoked" => Some(ConsentState::Revoked),
            _ => None,
        }
    }
}

/// Consent state as seen by the audit index: `Unknown` only before the first
/// event for the subject has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentView {
    Granted,
    Revoked,
    Unknown,
}

impl From<ConsentState> for ConsentView {
    fn from(s: ConsentState) -> Self {
        match s {
            ConsentState::Granted => ConsentView::Granted,
            ConsentState::Revoked => ConsentView::Revoked,
        }
    }
}

/// Requested consent transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentChange {
    Grant,
    Revoke,
}

impl ConsentChange {
    pub fn target_state(&self) -> ConsentState {
        match self {
            ConsentChange::Grant => ConsentState::Granted,
            ConsentChange::Revoke => ConsentState::Revoked,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            ConsentChange::Grant => ActionKind::Grant,
            ConsentChange::Revoke => ActionKind::Revoke,
        }
    }
}

/// Target kind of a reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Grant,
    Revoke,
    Access,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Grant => "grant",
            ActionKind::Revoke => "revoke",
            ActionKind::Access => "access",
        }
    }
}

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// Immutable record of a confirmed consent change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentEvent {
    pub subject: SubjectId,
    pub state: ConsentState,
    pub confirmation_id: ConfirmationId,
    pub recorded_at: DateTime<Utc>,
    pub seq: u64,
}

/// Immutable record of a confirmed view-access event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub subject: SubjectId,
    pub actor: ActorId,
    pub purpose: Purpose,
    pub confirmation_id: ConfirmationId,
    pub recorded_at: DateTime<Utc>,
    pub seq: u64,
}

/// Either kind of audit event, as stored in journals and returned by ledger
/// history reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    Consent(ConsentEvent),
    Access(AccessEvent),
}

impl AuditRecord {
    pub fn subject(&self) -> &SubjectId {
        match self {
            AuditRecord::Consent(e) => &e.subject,
            AuditRecord::Access(e) => &e.subject,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            AuditRecord::Consent(e) => e.seq,
            AuditRecord::Access(e) => e.seq,
        }
    }

    pub fn confirmation_id(&self) -> &ConfirmationId {
        match self {
            AuditRecord::Consent(e) => &e.confirmation_id,
            AuditRecord::Access(e) => &e.confirmation_id,
        }
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            AuditRecord::Consent(e) => e.recorded_at,
            AuditRecord::Access(e) => e.recorded_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_ids_are_case_insensitive() {
        let a = SubjectId::parse("0xAbC123").unwrap();
        let b = SubjectId::parse("  0xabc123 ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "0xabc123");
    }

    #[test]
    fn blank_ids_and_purposes_rejected() {
        assert_eq!(
            SubjectId::parse("   "),
            Err(IdError::Blank { field: "subject" })
        );
        assert!(ActorId::parse("").is_err());
        assert_eq!(Purpose::parse(" \t"), Err(IdError::Blank { field: "purpose" }));
    }

    #[test]
    fn deserializing_blank_purpose_fails() {
        let r: Result<Purpose, _> = serde_json::from_str("\"  \"");
        assert!(r.is_err());
    }

    #[test]
    fn audit_record_is_tagged_by_kind() {
        let ev = ConsentEvent {
            subject: SubjectId::parse("0xP1").unwrap(),
            state: ConsentState::Granted,
            confirmation_id: ConfirmationId::new("0xaa"),
            recorded_at: Utc::now(),
            seq: 1,
        };
        let v = serde_json::to_value(AuditRecord::Consent(ev)).unwrap();
        assert_eq!(v["kind"], "consent");
        assert_eq!(v["state"], "granted");
        assert_eq!(v["subject"], "0xp1");
    }
}
