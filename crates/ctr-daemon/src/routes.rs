//! Axum router and all HTTP handlers for ctr-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers so tests can drive the bare router.
//!
//! Reconciliation results map onto status codes as follows:
//!
//! | result                          | status |
//! |---------------------------------|--------|
//! | `Success`                       | 200    |
//! | `FinalityTimeout` (pending)     | 202    |
//! | `InvalidInput`                  | 400    |
//! | `AccessDenied`                  | 403    |
//! | `GapDetected`, `SubjectBusy`    | 409    |
//! | `SubmissionRejected`            | 502    |
//! | `IndexUnavailable`              | 503    |
//!
//! The body is always the `ReconciliationResult` itself.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use ctr_reconcile::{EngineError, FailureKind, ReconciliationResult};
use ctr_schemas::{ActorId, ConsentChange, SubjectId};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::{
    api_types::{
        AccessListResponse, AccessRequest, AuthorizeQuery, AuthorizeResponse,
        ConsentHistoryResponse, ConsentRequest, ErrorResponse, HealthResponse, PendingResponse,
        SinceQuery,
    },
    state::{AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/stream", get(stream))
        .route("/v1/consent/grant", post(consent_grant))
        .route("/v1/consent/revoke", post(consent_revoke))
        .route("/v1/access", post(access))
        .route("/v1/authorize", get(authorize))
        .route("/v1/audit/:subject/consent", get(audit_consent))
        .route("/v1/audit/:subject/access", get(audit_access))
        .route("/v1/subjects/:subject/verify", get(subject_verify))
        .route("/v1/subjects/:subject/backfill", post(subject_backfill))
        .route("/v1/attempts/pending", get(attempts_pending))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn result_status(result: &ReconciliationResult) -> StatusCode {
    match result.failure_kind() {
        None => StatusCode::OK,
        Some(FailureKind::FinalityTimeout) => StatusCode::ACCEPTED,
        Some(FailureKind::InvalidInput) => StatusCode::BAD_REQUEST,
        Some(FailureKind::AccessDenied(_)) => StatusCode::FORBIDDEN,
        Some(FailureKind::GapDetected) | Some(FailureKind::SubjectBusy) => StatusCode::CONFLICT,
        Some(FailureKind::SubmissionRejected) => StatusCode::BAD_GATEWAY,
        Some(FailureKind::IndexUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
        // Client closed request; no HTTP caller can cancel, kept for completeness.
        Some(FailureKind::Cancelled) => {
            StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
        }
    }
}

fn result_response(result: ReconciliationResult) -> Response {
    (result_status(&result), Json(result)).into_response()
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn engine_error_response(e: EngineError) -> Response {
    let status = match e {
        EngineError::SubjectBusy(_) => StatusCode::CONFLICT,
        EngineError::Ledger(_) => StatusCode::BAD_GATEWAY,
        EngineError::Index(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, e.to_string())
}

fn parse_subject(raw: &str) -> Result<SubjectId, Response> {
    SubjectId::parse(raw).map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
            ledger: st.engine.ledger().backend_name(),
            audit: st.engine.index().name(),
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/consent/{grant,revoke}   POST /v1/access
// ---------------------------------------------------------------------------

pub(crate) async fn consent_grant(
    State(st): State<Arc<AppState>>,
    Json(req): Json<ConsentRequest>,
) -> Response {
    consent_change(&st, &req.subject, ConsentChange::Grant).await
}

pub(crate) async fn consent_revoke(
    State(st): State<Arc<AppState>>,
    Json(req): Json<ConsentRequest>,
) -> Response {
    consent_change(&st, &req.subject, ConsentChange::Revoke).await
}

async fn consent_change(st: &AppState, subject: &str, change: ConsentChange) -> Response {
    let result = st.engine.request_consent_change(subject, change).await;
    info!(
        subject,
        kind = change.kind().as_str(),
        attempt_id = %result.attempt_id(),
        success = result.is_success(),
        "consent change"
    );
    result_response(result)
}

pub(crate) async fn access(
    State(st): State<Arc<AppState>>,
    Json(req): Json<AccessRequest>,
) -> Response {
    let result = st
        .engine
        .request_access(&req.actor, &req.subject, &req.purpose)
        .await;
    info!(
        actor = %req.actor,
        subject = %req.subject,
        attempt_id = %result.attempt_id(),
        success = result.is_success(),
        "access"
    );
    result_response(result)
}

// ---------------------------------------------------------------------------
// GET /v1/authorize
// ---------------------------------------------------------------------------

/// Speculative gate check. Answers 200 whether allowed or denied; only
/// malformed ids are a 400.
pub(crate) async fn authorize(
    State(st): State<Arc<AppState>>,
    Query(q): Query<AuthorizeQuery>,
) -> Response {
    let subject = match parse_subject(&q.subject) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let actor = match ActorId::parse(&q.actor) {
        Ok(a) => a,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let decision = st.engine.gate().can_view(&actor, &subject, &q.purpose).await;
    (
        StatusCode::OK,
        Json(AuthorizeResponse {
            allowed: decision.is_allowed(),
            decision,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/audit/:subject/{consent,access}
// ---------------------------------------------------------------------------

pub(crate) async fn audit_consent(
    State(st): State<Arc<AppState>>,
    Path(subject): Path<String>,
) -> Response {
    let subject = match parse_subject(&subject) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let index = st.engine.index();
    let read = async {
        let latest = index.latest_consent_state(&subject).await?;
        let events = index.list_consent_events(&subject, None).await?;
        Ok::<_, ctr_audit::IndexError>((latest, events))
    };
    match read.await {
        Ok((latest, events)) => (
            StatusCode::OK,
            Json(ConsentHistoryResponse {
                subject,
                latest,
                events,
            }),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

pub(crate) async fn audit_access(
    State(st): State<Arc<AppState>>,
    Path(subject): Path<String>,
    Query(q): Query<SinceQuery>,
) -> Response {
    let subject = match parse_subject(&subject) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match st.engine.index().list_access_events(&subject, q.since).await {
        Ok(events) => (StatusCode::OK, Json(AccessListResponse { subject, events })).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Operator: verify, backfill, pending
// ---------------------------------------------------------------------------

pub(crate) async fn subject_verify(
    State(st): State<Arc<AppState>>,
    Path(subject): Path<String>,
) -> Response {
    let subject = match parse_subject(&subject) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match st.engine.verify_subject(&subject).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => engine_error_response(e),
    }
}

pub(crate) async fn subject_backfill(
    State(st): State<Arc<AppState>>,
    Path(subject): Path<String>,
) -> Response {
    let subject = match parse_subject(&subject) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match st.engine.backfill(&subject).await {
        Ok(report) => {
            info!(subject = %subject, halt_lifted = report.halt_lifted, "backfill");
            let _ = st.bus.send(BusMsg::LogLine {
                level: "INFO".to_string(),
                msg: format!(
                    "backfill {subject}: appended {} duplicates {} halt_lifted {}",
                    report.appended, report.duplicates, report.halt_lifted
                ),
            });
            (StatusCode::OK, Json(report)).into_response()
        }
        Err(e) => engine_error_response(e),
    }
}

pub(crate) async fn attempts_pending(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(PendingResponse {
            pending: st.engine.pending_attempts(),
            halted: st.engine.halted_subjects(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Engine { .. } => "engine",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
