//! Request and response types for all ctr-daemon HTTP endpoints.
//!
//! No business logic lives here.

use ctr_reconcile::{AccessDecision, HaltedSubject, PendingAttemptView};
use ctr_schemas::{AccessEvent, ConsentEvent, ConsentView, SubjectId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub ledger: &'static str,
    pub audit: &'static str,
}

/// Body for every refusal that is not a `ReconciliationResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRequest {
    pub subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    pub actor: String,
    pub subject: String,
    pub purpose: String,
}

// ---------------------------------------------------------------------------
// /v1/authorize
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeQuery {
    pub actor: String,
    pub subject: String,
    #[serde(default)]
    pub purpose: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeResponse {
    pub allowed: bool,
    pub decision: AccessDecision,
}

// ---------------------------------------------------------------------------
// /v1/audit/:subject/*
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ConsentHistoryResponse {
    pub subject: SubjectId,
    pub latest: ConsentView,
    pub events: Vec<ConsentEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinceQuery {
    pub since: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessListResponse {
    pub subject: SubjectId,
    pub events: Vec<AccessEvent>,
}

// ---------------------------------------------------------------------------
// /v1/attempts/pending
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PendingResponse {
    pub pending: Vec<PendingAttemptView>,
    pub halted: Vec<HaltedSubject>,
}
