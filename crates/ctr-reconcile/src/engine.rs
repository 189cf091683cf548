//! Reconciliation Engine.
//!
//! Drives one action end to end: validate, reserve the subject lane, re-check
//! the gate (access only), submit, wait for finality, mirror into the audit
//! index, report.
//!
//! # Invariants
//! - Nothing is compensated after confirmation. A confirmed write is mirrored
//!   with unlimited backoff; only a gap stops the mirror, and a gap halts the
//!   subject until `backfill` repairs it.
//! - A write is submitted at most once. Finality timeouts re-poll the same
//!   handle; past the horizon the attempt is parked (lane still held) and only
//!   `resume_pending` touches it again.
//! - The subject lane is held from reservation until the event is indexed or
//!   the attempt fails, so index order equals ledger order per subject.
//! - Everything after submission runs on a spawned task that owns the
//!   handle. Dropping the caller's future detaches it; mirroring continues.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ctr_audit::{AppendOutcome, AuditIndex, IndexError};
use ctr_ledger::{FinalityError, LedgerClient, LedgerRecord, PendingHandle, SubmitError};
use ctr_schemas::{
    ActionKind, ActorId, AuditRecord, ConsentChange, ConsentState, ConsentView, Purpose,
    SubjectId,
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::attempt::{AttemptEvent, ReconciliationAttempt};
use crate::gate::{AccessDecision, AuthorizationGate};
use crate::types::{
    AlertKind, BackfillReport, CancelToken, DriftReport, EngineConfig, EngineError, EngineEvent,
    FailureKind, HaltedSubject, PendingAttemptView, ProgressStage, ReconciliationResult,
};

const EVENT_BUS_CAPACITY: usize = 1024;
const LANE_RECHECK: Duration = Duration::from_millis(50);

struct ParkedAttempt {
    attempt: ReconciliationAttempt,
    handle: PendingHandle,
    parked_at: DateTime<Utc>,
}

/// State reachable from detached settle tasks.
struct Shared {
    ledger: Arc<LedgerClient>,
    index: Arc<dyn AuditIndex>,
    cfg: EngineConfig,
    pending: Mutex<HashMap<SubjectId, ParkedAttempt>>,
    halted: Mutex<BTreeMap<SubjectId, HaltedSubject>>,
    events: broadcast::Sender<EngineEvent>,
}

pub struct ReconciliationEngine {
    shared: Arc<Shared>,
    gate: AuthorizationGate,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Ledger state and index view agree. A never-written subject reads
/// `Revoked` on the ledger and `Unknown` in the index.
fn consent_matches(ledger: ConsentState, index: ConsentView) -> bool {
    matches!(
        (ledger, index),
        (ConsentState::Granted, ConsentView::Granted)
            | (ConsentState::Revoked, ConsentView::Revoked)
            | (ConsentState::Revoked, ConsentView::Unknown)
    )
}

impl ReconciliationEngine {
    pub fn new(ledger: Arc<LedgerClient>, index: Arc<dyn AuditIndex>, cfg: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            gate: AuthorizationGate::new(index.clone()),
            shared: Arc::new(Shared {
                ledger,
                index,
                cfg,
                pending: Mutex::new(HashMap::new()),
                halted: Mutex::new(BTreeMap::new()),
                events,
            }),
        }
    }

    pub fn gate(&self) -> &AuthorizationGate {
        &self.gate
    }

    pub fn index(&self) -> &Arc<dyn AuditIndex> {
        &self.shared.index
    }

    pub fn ledger(&self) -> &Arc<LedgerClient> {
        &self.shared.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.cfg
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Caller boundary
    // -----------------------------------------------------------------------

    pub async fn request_consent_change(
        &self,
        subject: &str,
        change: ConsentChange,
    ) -> ReconciliationResult {
        self.consent_change(subject, change, None).await
    }

    pub async fn request_consent_change_with_cancel(
        &self,
        subject: &str,
        change: ConsentChange,
        cancel: &CancelToken,
    ) -> ReconciliationResult {
        self.consent_change(subject, change, Some(cancel)).await
    }

    pub async fn request_access(
        &self,
        actor: &str,
        subject: &str,
        purpose: &str,
    ) -> ReconciliationResult {
        self.access(actor, subject, purpose, None).await
    }

    pub async fn request_access_with_cancel(
        &self,
        actor: &str,
        subject: &str,
        purpose: &str,
        cancel: &CancelToken,
    ) -> ReconciliationResult {
        self.access(actor, subject, purpose, Some(cancel)).await
    }

    async fn consent_change(
        &self,
        subject: &str,
        change: ConsentChange,
        cancel: Option<&CancelToken>,
    ) -> ReconciliationResult {
        let subject = match SubjectId::parse(subject) {
            Ok(s) => s,
            Err(e) => return invalid_input(change.kind(), e.to_string()),
        };
        self.run(ReconciliationAttempt::consent(change.kind(), subject), cancel)
            .await
    }

    async fn access(
        &self,
        actor: &str,
        subject: &str,
        purpose: &str,
        cancel: Option<&CancelToken>,
    ) -> ReconciliationResult {
        let parsed = SubjectId::parse(subject).and_then(|s| {
            let a = ActorId::parse(actor)?;
            let p = Purpose::parse(purpose)?;
            Ok((s, a, p))
        });
        let (subject, actor, purpose) = match parsed {
            Ok(v) => v,
            Err(e) => return invalid_input(ActionKind::Access, e.to_string()),
        };
        self.run(ReconciliationAttempt::access(actor, subject, purpose), cancel)
            .await
    }

    async fn run(
        &self,
        attempt: ReconciliationAttempt,
        cancel: Option<&CancelToken>,
    ) -> ReconciliationResult {
        let id = attempt.attempt_id;
        let subject = attempt.subject.clone();
        let kind = attempt.kind;

        let (attempt, handle) = match self.submit(attempt, cancel).await {
            Ok(submitted) => submitted,
            Err(refused) => {
                self.shared.completed(subject, kind, &refused);
                return refused;
            }
        };

        let shared = Arc::clone(&self.shared);
        let budget = shared.cfg.max_finality_polls;
        let task = tokio::spawn(async move {
            let result = shared.settle(attempt, handle, budget).await;
            shared.completed(subject, kind, &result);
            result
        });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(attempt_id = %id, error = %e, "settle task aborted");
                ReconciliationResult::failure(
                    id,
                    FailureKind::IndexUnavailable,
                    format!("settle task aborted: {e}"),
                )
            }
        }
    }

    /// Admission, lane, cancellation, gate and submission. On success the
    /// returned handle holds the subject lane.
    async fn submit(
        &self,
        mut attempt: ReconciliationAttempt,
        cancel: Option<&CancelToken>,
    ) -> Result<(ReconciliationAttempt, PendingHandle), ReconciliationResult> {
        let id = attempt.attempt_id;
        let sh = &self.shared;
        if let Some(refused) = sh.admission(&attempt) {
            return Err(refused);
        }

        // A parked attempt keeps its lane, so re-check admission while queued.
        let slot = loop {
            match tokio::time::timeout(LANE_RECHECK, sh.ledger.reserve(&attempt.subject)).await {
                Ok(slot) => break slot,
                Err(_) => {
                    if let Some(refused) = sh.admission(&attempt) {
                        return Err(refused);
                    }
                }
            }
        };
        if let Some(refused) = sh.admission(&attempt) {
            return Err(refused);
        }

        if cancel.is_some_and(CancelToken::is_cancelled) {
            sh.transition(&mut attempt, &AttemptEvent::SubmitRefused);
            info!(attempt_id = %id, subject = %attempt.subject, "attempt cancelled before submission");
            return Err(ReconciliationResult::failure(
                id,
                FailureKind::Cancelled,
                "cancelled before submission",
            ));
        }

        let submitted = match attempt.kind {
            ActionKind::Grant => {
                sh.ledger
                    .submit_consent_change(slot, ConsentChange::Grant)
                    .await
            }
            ActionKind::Revoke => {
                sh.ledger
                    .submit_consent_change(slot, ConsentChange::Revoke)
                    .await
            }
            ActionKind::Access => {
                let (Some(actor), Some(purpose)) = (attempt.actor.clone(), attempt.purpose.clone())
                else {
                    sh.transition(&mut attempt, &AttemptEvent::SubmitRefused);
                    return Err(ReconciliationResult::failure(
                        id,
                        FailureKind::InvalidInput,
                        "access attempt without actor or purpose",
                    ));
                };
                // Consent may have been revoked since any speculative check.
                let decision = self
                    .gate
                    .can_view(&actor, &attempt.subject, purpose.as_str())
                    .await;
                if let AccessDecision::Denied(reason) = decision {
                    sh.transition(&mut attempt, &AttemptEvent::SubmitRefused);
                    info!(attempt_id = %id, subject = %attempt.subject, actor = %actor,
                        reason = reason.as_str(), "access denied under lane");
                    return Err(ReconciliationResult::failure(
                        id,
                        FailureKind::AccessDenied(reason),
                        format!("access denied: {}", reason.as_str()),
                    ));
                }
                sh.ledger.submit_access_event(slot, actor, purpose).await
            }
        };

        let handle = match submitted {
            Ok(h) => h,
            Err(e) => {
                sh.transition(&mut attempt, &AttemptEvent::SubmitRefused);
                let kind = match e {
                    SubmitError::Invalid(_) => FailureKind::InvalidInput,
                    SubmitError::Rejected(_) | SubmitError::Transport(_) => {
                        FailureKind::SubmissionRejected
                    }
                };
                warn!(attempt_id = %id, subject = %attempt.subject, error = %e, "submission refused");
                return Err(ReconciliationResult::failure(id, kind, e.to_string()));
            }
        };

        sh.transition(
            &mut attempt,
            &AttemptEvent::Submit {
                confirmation_id: handle.confirmation_id().clone(),
            },
        );
        sh.progress(
            &attempt,
            ProgressStage::Submitted,
            handle.confirmation_id().to_string(),
        );
        if cancel.is_some_and(CancelToken::is_cancelled) {
            info!(attempt_id = %id, "cancellation after submission ignored; mirroring continues");
        }
        Ok((attempt, handle))
    }

    /// Re-poll every parked attempt once (same handle, never resubmitted).
    /// Attempts still unresolved are parked again.
    pub async fn resume_pending(&self) -> Vec<ReconciliationResult> {
        let sh = &self.shared;
        let subjects: Vec<SubjectId> = lock(&sh.pending).keys().cloned().collect();
        let mut results = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let parked = lock(&sh.pending).remove(&subject);
            let Some(parked) = parked else {
                continue;
            };
            let id = parked.attempt.attempt_id;
            let kind = parked.attempt.kind;
            info!(attempt_id = %id, subject = %subject, "resuming pending attempt");
            let shared = Arc::clone(sh);
            let task = tokio::spawn(async move {
                let result = shared.settle(parked.attempt, parked.handle, 1).await;
                shared.completed(subject, kind, &result);
                result
            });
            match task.await {
                Ok(result) => results.push(result),
                Err(e) => error!(attempt_id = %id, error = %e, "resume task aborted"),
            }
        }
        results
    }

    pub fn pending_attempts(&self) -> Vec<PendingAttemptView> {
        let mut out: Vec<PendingAttemptView> = lock(&self.shared.pending)
            .values()
            .map(|p| PendingAttemptView {
                attempt_id: p.attempt.attempt_id,
                subject: p.attempt.subject.clone(),
                kind: p.attempt.kind,
                confirmation_id: p.handle.confirmation_id().clone(),
                submitted_at: p.handle.submitted_at(),
                parked_at: p.parked_at,
                finality_timeouts: p.attempt.finality_timeouts,
            })
            .collect();
        out.sort_by_key(|v| v.parked_at);
        out
    }

    fn has_pending(&self, subject: &SubjectId) -> bool {
        lock(&self.shared.pending).contains_key(subject)
    }

    // -----------------------------------------------------------------------
    // Halts, drift, backfill
    // -----------------------------------------------------------------------

    pub fn halted_subjects(&self) -> Vec<HaltedSubject> {
        lock(&self.shared.halted).values().cloned().collect()
    }

    pub fn is_halted(&self, subject: &SubjectId) -> bool {
        lock(&self.shared.halted).contains_key(subject)
    }

    /// Compare finalized ledger consent with the index's latest consent,
    /// under the subject lane so no attempt is mid-flight.
    pub async fn verify_subject(&self, subject: &SubjectId) -> Result<DriftReport, EngineError> {
        if self.has_pending(subject) {
            return Err(EngineError::SubjectBusy(subject.clone()));
        }
        let sh = &self.shared;
        let _slot = sh.ledger.reserve(subject).await;
        let ledger = sh.ledger.read_consent_state(subject).await?;
        let index = sh.index.latest_consent_state(subject).await?;

        if consent_matches(ledger, index) {
            return Ok(DriftReport::Clean {
                subject: subject.clone(),
                consent: ledger,
            });
        }
        let detail = format!("ledger={} index={index:?}", ledger.as_str());
        warn!(subject = %subject, %detail, "consent drift between ledger and index");
        sh.alert(AlertKind::Drift, subject, None, detail);
        Ok(DriftReport::Drift {
            subject: subject.clone(),
            ledger,
            index,
        })
    }

    /// Verify every indexed subject that has no parked attempt.
    pub async fn drift_sweep(&self) -> Result<Vec<DriftReport>, EngineError> {
        let mut reports = Vec::new();
        for subject in self.shared.index.subjects().await? {
            match self.verify_subject(&subject).await {
                Ok(r) => reports.push(r),
                Err(EngineError::SubjectBusy(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(reports)
    }

    /// Replay the subject's finalized ledger history into the index.
    /// Duplicates are absorbed. Lifts a halt once the index is contiguous and
    /// agrees with the ledger.
    pub async fn backfill(&self, subject: &SubjectId) -> Result<BackfillReport, EngineError> {
        if self.has_pending(subject) {
            return Err(EngineError::SubjectBusy(subject.clone()));
        }
        let sh = &self.shared;
        let _slot = sh.ledger.reserve(subject).await;

        let mut history = sh.ledger.history(subject).await?;
        history.sort_by_key(|r| r.confirmation.seq);

        let mut appended = 0usize;
        let mut duplicates = 0usize;
        let mut gap = None;
        for rec in &history {
            match sh.index.append_record(&rec.to_audit_record()).await {
                Ok(AppendOutcome::Appended) => appended += 1,
                Ok(AppendOutcome::DuplicateConfirmationId) => duplicates += 1,
                Err(IndexError::Gap { expected, got, .. }) => {
                    gap = Some((expected, got));
                    break;
                }
                Err(e @ IndexError::Unavailable(_)) => return Err(e.into()),
            }
        }

        let index_last_seq = sh.index.last_seq(subject).await?;
        let ledger_last_seq = history.last().map(|r| r.confirmation.seq).unwrap_or(0);
        let ledger_consent = sh.ledger.read_consent_state(subject).await?;
        let index_consent = sh.index.latest_consent_state(subject).await?;

        let consistent = gap.is_none()
            && index_last_seq == ledger_last_seq
            && consent_matches(ledger_consent, index_consent);
        let halt_lifted = consistent && lock(&sh.halted).remove(subject).is_some();

        info!(
            subject = %subject,
            ledger_records = history.len(),
            appended,
            duplicates,
            index_last_seq,
            halt_lifted,
            "backfill finished"
        );
        Ok(BackfillReport {
            subject: subject.clone(),
            ledger_records: history.len(),
            appended,
            duplicates,
            index_last_seq,
            gap,
            halt_lifted,
        })
    }
}

// ---------------------------------------------------------------------------
// Shared: finality, mirroring, parking, events
// ---------------------------------------------------------------------------

impl Shared {
    /// Refusals that need no lane: halted subject, parked attempt.
    fn admission(&self, attempt: &ReconciliationAttempt) -> Option<ReconciliationResult> {
        let id = attempt.attempt_id;
        if let Some(h) = lock(&self.halted).get(&attempt.subject) {
            return Some(ReconciliationResult::failure(
                id,
                FailureKind::GapDetected,
                format!(
                    "subject halted: index expected seq {} but ledger delivered {}",
                    h.expected_seq, h.got_seq
                ),
            ));
        }
        if let Some(p) = lock(&self.pending).get(&attempt.subject) {
            return Some(ReconciliationResult::failure(
                id,
                FailureKind::SubjectBusy,
                format!(
                    "attempt {} is pending finality as {}",
                    p.attempt.attempt_id,
                    p.handle.confirmation_id()
                ),
            ));
        }
        None
    }

    async fn settle(
        &self,
        mut attempt: ReconciliationAttempt,
        handle: PendingHandle,
        finality_waits: u32,
    ) -> ReconciliationResult {
        let id = attempt.attempt_id;
        let mut waits = 0u32;

        let confirmation = loop {
            match self
                .ledger
                .await_finality(&handle, self.cfg.finality_timeout)
                .await
            {
                Ok(c) => break c,
                Err(FinalityError::Rejected { reason }) => {
                    self.transition(&mut attempt, &AttemptEvent::FinalityRejected);
                    warn!(attempt_id = %id, confirmation_id = %handle.confirmation_id(),
                        reason = %reason, "ledger rejected write; nothing committed");
                    return ReconciliationResult::failure(
                        id,
                        FailureKind::SubmissionRejected,
                        reason,
                    );
                }
                Err(e @ FinalityError::TimedOut { .. }) => {
                    waits += 1;
                    self.transition(&mut attempt, &AttemptEvent::FinalityTimedOut);
                    self.progress(&attempt, ProgressStage::FinalityTimeout, e.to_string());
                    if waits >= finality_waits {
                        return self.park(attempt, handle);
                    }
                }
            }
        };

        self.transition(
            &mut attempt,
            &AttemptEvent::Finalized {
                seq: confirmation.seq,
                included_at: confirmation.included_at,
            },
        );
        self.progress(
            &attempt,
            ProgressStage::Confirmed,
            format!("seq {}", confirmation.seq),
        );

        let record = LedgerRecord {
            write: handle.write().clone(),
            confirmation: confirmation.clone(),
        }
        .to_audit_record();

        match self.mirror(&attempt, &record).await {
            Ok(outcome) => {
                self.transition(&mut attempt, &AttemptEvent::Indexed);
                self.progress(&attempt, ProgressStage::Indexed, format!("{outcome:?}"));
                info!(
                    attempt_id = %id,
                    subject = %attempt.subject,
                    kind = attempt.kind.as_str(),
                    confirmation_id = %confirmation.confirmation_id,
                    seq = confirmation.seq,
                    duplicate = outcome == AppendOutcome::DuplicateConfirmationId,
                    "attempt indexed"
                );
                drop(handle);
                ReconciliationResult::Success {
                    attempt_id: id,
                    confirmation_id: confirmation.confirmation_id,
                    timestamp: confirmation.included_at,
                    seq: confirmation.seq,
                }
            }
            Err((expected, got)) => {
                self.halt(&attempt.subject, expected, got);
                self.transition(&mut attempt, &AttemptEvent::IndexGap);
                let detail = format!(
                    "index expected seq {expected}, ledger confirmed {got} as {}; subject halted",
                    confirmation.confirmation_id
                );
                error!(attempt_id = %id, subject = %attempt.subject, %detail, "gap detected");
                self.alert(AlertKind::GapDetected, &attempt.subject, Some(id), detail.clone());
                ReconciliationResult::failure(id, FailureKind::GapDetected, detail)
            }
        }
    }

    /// Append with unlimited backoff. Returns `Err((expected, got))` on a gap.
    async fn mirror(
        &self,
        attempt: &ReconciliationAttempt,
        record: &AuditRecord,
    ) -> Result<AppendOutcome, (u64, u64)> {
        let mut delay = self.cfg.index_backoff_initial;
        let mut failures: u32 = 0;
        loop {
            match self.index.append_record(record).await {
                Ok(outcome) => {
                    if failures > 0 {
                        info!(attempt_id = %attempt.attempt_id, failures, "audit index recovered");
                    }
                    return Ok(outcome);
                }
                Err(IndexError::Gap { expected, got, .. }) => return Err((expected, got)),
                Err(IndexError::Unavailable(msg)) => {
                    failures += 1;
                    warn!(
                        attempt_id = %attempt.attempt_id,
                        subject = %attempt.subject,
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %msg,
                        "audit index write failed; retrying"
                    );
                    self.progress(
                        attempt,
                        ProgressStage::IndexRetry,
                        format!("attempt {failures}: {msg}"),
                    );
                    if failures == self.cfg.index_alert_after.max(1) {
                        self.alert(
                            AlertKind::IndexUnavailable,
                            &attempt.subject,
                            Some(attempt.attempt_id),
                            format!("{failures} consecutive index failures; still retrying"),
                        );
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.cfg.index_backoff_max);
                }
            }
        }
    }

    fn park(&self, attempt: ReconciliationAttempt, handle: PendingHandle) -> ReconciliationResult {
        let id = attempt.attempt_id;
        let subject = attempt.subject.clone();
        let detail = format!(
            "finality not reached after {} waits; {} stays pending and will be re-polled",
            attempt.finality_timeouts,
            handle.confirmation_id()
        );
        warn!(attempt_id = %id, subject = %subject, %detail, "attempt parked");
        self.alert(
            AlertKind::FinalityExhausted,
            &subject,
            Some(id),
            detail.clone(),
        );
        lock(&self.pending).insert(
            subject,
            ParkedAttempt {
                attempt,
                handle,
                parked_at: Utc::now(),
            },
        );
        ReconciliationResult::failure(id, FailureKind::FinalityTimeout, detail)
    }

    fn halt(&self, subject: &SubjectId, expected: u64, got: u64) {
        lock(&self.halted).insert(
            subject.clone(),
            HaltedSubject {
                subject: subject.clone(),
                expected_seq: expected,
                got_seq: got,
                halted_at: Utc::now(),
            },
        );
    }

    fn transition(&self, attempt: &mut ReconciliationAttempt, event: &AttemptEvent) {
        if let Err(e) = attempt.apply(event) {
            error!(attempt_id = %attempt.attempt_id, error = %e, "illegal attempt transition");
            self.alert(
                AlertKind::IllegalTransition,
                &attempt.subject,
                Some(attempt.attempt_id),
                e.to_string(),
            );
        }
    }

    fn progress(&self, attempt: &ReconciliationAttempt, stage: ProgressStage, detail: String) {
        self.emit(EngineEvent::Progress {
            attempt_id: attempt.attempt_id,
            subject: attempt.subject.clone(),
            stage,
            detail,
        });
    }

    fn alert(&self, alert: AlertKind, subject: &SubjectId, attempt_id: Option<Uuid>, detail: String) {
        self.emit(EngineEvent::Alert {
            alert,
            subject: subject.clone(),
            attempt_id,
            detail,
        });
    }

    fn completed(&self, subject: SubjectId, kind: ActionKind, result: &ReconciliationResult) {
        self.emit(EngineEvent::Completed {
            subject,
            kind,
            result: result.clone(),
        });
    }

    fn emit(&self, ev: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(ev);
    }
}

fn invalid_input(kind: ActionKind, detail: String) -> ReconciliationResult {
    let id = Uuid::new_v4();
    info!(attempt_id = %id, kind = kind.as_str(), %detail, "request refused as invalid");
    ReconciliationResult::failure(id, FailureKind::InvalidInput, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctr_audit::MemoryAuditIndex;
    use ctr_ledger::SimLedger;

    fn engine() -> (ReconciliationEngine, Arc<SimLedger>) {
        let sim = Arc::new(SimLedger::new(0));
        let client = Arc::new(LedgerClient::new(sim.clone(), Duration::from_millis(1)));
        let cfg = EngineConfig {
            finality_timeout: Duration::from_millis(200),
            max_finality_polls: 2,
            index_backoff_initial: Duration::from_millis(1),
            index_backoff_max: Duration::from_millis(4),
            index_alert_after: 3,
        };
        (
            ReconciliationEngine::new(client, Arc::new(MemoryAuditIndex::new()), cfg),
            sim,
        )
    }

    #[tokio::test]
    async fn grant_then_access_are_indexed_in_order() {
        let (eng, _) = engine();
        let g = eng.request_consent_change("0xP1", ConsentChange::Grant).await;
        let a = eng.request_access("0xH1", "0xP1", "screening").await;
        match (&g, &a) {
            (
                ReconciliationResult::Success { seq: s1, .. },
                ReconciliationResult::Success { seq: s2, .. },
            ) => {
                assert_eq!(*s1, 1);
                assert_eq!(*s2, 2);
            }
            other => panic!("expected two successes, got {other:?}"),
        }
        let p1 = SubjectId::parse("0xp1").unwrap();
        assert_eq!(
            eng.index().latest_consent_state(&p1).await.unwrap(),
            ConsentView::Granted
        );
        assert_eq!(eng.index().list_access_events(&p1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_inputs_never_reach_ledger() {
        let (eng, sim) = engine();
        let r = eng.request_access("0xH1", "0xP1", "  ").await;
        assert_eq!(r.failure_kind(), Some(FailureKind::InvalidInput));
        let r = eng.request_consent_change("", ConsentChange::Grant).await;
        assert_eq!(r.failure_kind(), Some(FailureKind::InvalidInput));
        assert_eq!(sim.submissions(), 0);
    }

    #[tokio::test]
    async fn access_denied_without_consent_submits_nothing() {
        let (eng, sim) = engine();
        let r = eng.request_access("0xH1", "0xP1", "screening").await;
        assert_eq!(
            r.failure_kind(),
            Some(FailureKind::AccessDenied(
                crate::gate::DenyReason::ConsentUnknown
            ))
        );
        assert_eq!(sim.submissions(), 0);
    }

    #[tokio::test]
    async fn cancel_before_submission() {
        let (eng, sim) = engine();
        let token = CancelToken::new();
        token.cancel();
        let r = eng
            .request_consent_change_with_cancel("0xP1", ConsentChange::Grant, &token)
            .await;
        assert_eq!(r.failure_kind(), Some(FailureKind::Cancelled));
        assert!(matches!(r, ReconciliationResult::Failure { retriable: true, .. }));
        assert_eq!(sim.submissions(), 0);
    }

    #[tokio::test]
    async fn verify_reports_clean_after_changes() {
        let (eng, _) = engine();
        let p1 = SubjectId::parse("0xp1").unwrap();
        assert!(eng.verify_subject(&p1).await.unwrap().is_clean());
        eng.request_consent_change("0xP1", ConsentChange::Grant).await;
        eng.request_consent_change("0xP1", ConsentChange::Revoke).await;
        assert_eq!(
            eng.verify_subject(&p1).await.unwrap(),
            DriftReport::Clean {
                subject: p1,
                consent: ConsentState::Revoked
            }
        );
    }

    #[tokio::test]
    async fn completion_is_broadcast() {
        let (eng, _) = engine();
        let mut rx = eng.events();
        eng.request_consent_change("0xP1", ConsentChange::Grant).await;
        let mut completed = 0;
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::Completed { kind, result, .. } = ev {
                assert_eq!(kind, ActionKind::Grant);
                assert!(result.is_success());
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
    }
}
