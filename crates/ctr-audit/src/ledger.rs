use std::collections::{BTreeMap, HashSet};

use ctr_schemas::{
    AccessEvent, AuditRecord, ConfirmationId, ConsentEvent, ConsentState, ConsentView, SubjectId,
};

use crate::{AppendOutcome, IndexError};

#[derive(Debug, Default)]
struct SubjectLog {
    consent: Vec<ConsentEvent>,
    access: Vec<AccessEvent>,
    last_seq: u64,
    latest: Option<ConsentState>,
}

/// In-memory per-subject audit state plus the append rules.
#[derive(Debug, Default)]
pub struct SubjectLedger {
    subjects: BTreeMap<SubjectId, SubjectLog>,
    confirmations: HashSet<ConfirmationId>,
}

impl SubjectLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide what appending `rec` would do, without mutating.
    pub fn check(&self, rec: &AuditRecord) -> Result<AppendOutcome, IndexError> {
        if self.confirmations.contains(rec.confirmation_id()) {
            return Ok(AppendOutcome::DuplicateConfirmationId);
        }
        let expected = self.last_seq(rec.subject()) + 1;
        if rec.seq() != expected {
            return Err(IndexError::Gap {
                subject: rec.subject().clone(),
                expected,
                got: rec.seq(),
            });
        }
        Ok(AppendOutcome::Appended)
    }

    /// Record `rec`. Callers must have received `Appended` from [`check`].
    ///
    /// [`check`]: SubjectLedger::check
    pub fn apply(&mut self, rec: AuditRecord) {
        self.confirmations.insert(rec.confirmation_id().clone());
        let log = self.subjects.entry(rec.subject().clone()).or_default();
        log.last_seq = rec.seq();
        match rec {
            AuditRecord::Consent(ev) => {
                log.latest = Some(ev.state);
                log.consent.push(ev);
            }
            AuditRecord::Access(ev) => log.access.push(ev),
        }
    }

    pub fn append(&mut self, rec: AuditRecord) -> Result<AppendOutcome, IndexError> {
        let outcome = self.check(&rec)?;
        if outcome == AppendOutcome::Appended {
            self.apply(rec);
        }
        Ok(outcome)
    }

    pub fn latest_consent(&self, subject: &SubjectId) -> ConsentView {
        self.subjects
            .get(subject)
            .and_then(|l| l.latest)
            .map(ConsentView::from)
            .unwrap_or(ConsentView::Unknown)
    }

    pub fn access_since(&self, subject: &SubjectId, since: Option<u64>) -> Vec<AccessEvent> {
        let floor = since.unwrap_or(0);
        self.subjects
            .get(subject)
            .map(|l| {
                l.access
                    .iter()
                    .filter(|e| e.seq > floor)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn consent_since(&self, subject: &SubjectId, since: Option<u64>) -> Vec<ConsentEvent> {
        let floor = since.unwrap_or(0);
        self.subjects
            .get(subject)
            .map(|l| {
                l.consent
                    .iter()
                    .filter(|e| e.seq > floor)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_seq(&self, subject: &SubjectId) -> u64 {
        self.subjects.get(subject).map(|l| l.last_seq).unwrap_or(0)
    }

    pub fn subjects(&self) -> Vec<SubjectId> {
        self.subjects.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ctr_schemas::{ActorId, Purpose};

    fn s(id: &str) -> SubjectId {
        SubjectId::parse(id).unwrap()
    }

    fn consent(subject: &str, state: ConsentState, tx: &str, seq: u64) -> AuditRecord {
        AuditRecord::Consent(ConsentEvent {
            subject: s(subject),
            state,
            confirmation_id: ConfirmationId::new(tx),
            recorded_at: Utc::now(),
            seq,
        })
    }

    fn access(subject: &str, tx: &str, seq: u64) -> AuditRecord {
        AuditRecord::Access(AccessEvent {
            subject: s(subject),
            actor: ActorId::parse("0xh1").unwrap(),
            purpose: Purpose::parse("study").unwrap(),
            confirmation_id: ConfirmationId::new(tx),
            recorded_at: Utc::now(),
            seq,
        })
    }

    #[test]
    fn consent_and_access_share_one_seq_space() {
        let mut l = SubjectLedger::new();
        l.append(consent("0xp1", ConsentState::Granted, "t1", 1))
            .unwrap();
        l.append(access("0xp1", "t2", 2)).unwrap();
        l.append(consent("0xp1", ConsentState::Revoked, "t3", 3))
            .unwrap();
        assert_eq!(l.last_seq(&s("0xp1")), 3);
        assert_eq!(l.latest_consent(&s("0xp1")), ConsentView::Revoked);
        assert_eq!(l.access_since(&s("0xp1"), None).len(), 1);
    }

    #[test]
    fn duplicate_wins_over_gap() {
        let mut l = SubjectLedger::new();
        l.append(consent("0xp1", ConsentState::Granted, "t1", 1))
            .unwrap();
        // Same confirmation id redelivered with a stale seq: duplicate, not gap.
        let out = l
            .append(consent("0xp1", ConsentState::Granted, "t1", 1))
            .unwrap();
        assert_eq!(out, AppendOutcome::DuplicateConfirmationId);
        assert_eq!(l.last_seq(&s("0xp1")), 1);
    }

    #[test]
    fn jump_and_regression_are_gaps() {
        let mut l = SubjectLedger::new();
        let err = l
            .append(consent("0xp1", ConsentState::Granted, "t1", 2))
            .unwrap_err();
        assert_eq!(
            err,
            IndexError::Gap {
                subject: s("0xp1"),
                expected: 1,
                got: 2
            }
        );
        l.append(consent("0xp1", ConsentState::Granted, "t1", 1))
            .unwrap();
        l.append(access("0xp1", "t2", 2)).unwrap();
        assert!(matches!(
            l.append(access("0xp1", "t3", 2)),
            Err(IndexError::Gap { expected: 3, .. })
        ));
    }

    #[test]
    fn unknown_until_first_consent() {
        let l = SubjectLedger::new();
        assert_eq!(l.latest_consent(&s("0xp1")), ConsentView::Unknown);
        assert!(l.subjects().is_empty());
    }

    #[test]
    fn since_cursor_is_exclusive() {
        let mut l = SubjectLedger::new();
        l.append(consent("0xp1", ConsentState::Granted, "t1", 1))
            .unwrap();
        for (i, tx) in ["a2", "a3", "a4"].iter().enumerate() {
            l.append(access("0xp1", tx, i as u64 + 2)).unwrap();
        }
        let seqs: Vec<u64> = l
            .access_since(&s("0xp1"), Some(2))
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![3, 4]);
    }
}
