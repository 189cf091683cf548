//! In-process registry used by `ledger.mode: sim` and by tests.
//!
//! Behaves like the on-chain contract as seen through the JSON-RPC ledger:
//! - transaction hashes are deterministic (`0x` + SHA-256 of a nonce and the write);
//! - a write stays pending for `inclusion_polls` polls; the next poll mines
//!   every pending write submitted up to and including it, in submission order;
//! - an access write for a subject whose consent is not granted fails at
//!   inclusion ("consent not granted"), exactly like a contract revert;
//! - per-subject sequence numbers are assigned at inclusion.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use ctr_schemas::{ConfirmationId, ConsentState, SubjectId};
use sha2::{Digest, Sha256};

use crate::{
    Confirmation, InclusionStatus, LedgerBackend, LedgerError, LedgerRecord, LedgerWrite,
    SubmitError,
};

#[derive(Debug, Clone)]
enum TxStatus {
    Pending,
    Included(Confirmation),
    Failed(String),
}

#[derive(Debug)]
struct SimTx {
    write: LedgerWrite,
    polls: u32,
    status: TxStatus,
}

#[derive(Debug, Default)]
struct SimState {
    nonce: u64,
    txs: HashMap<ConfirmationId, SimTx>,
    /// Submission order of writes not yet mined.
    mempool: Vec<ConfirmationId>,
    consent: HashMap<SubjectId, ConsentState>,
    seqs: HashMap<SubjectId, u64>,
    history: HashMap<SubjectId, Vec<LedgerRecord>>,
}

impl SimState {
    fn mine_through(&mut self, id: &ConfirmationId) {
        let Some(pos) = self.mempool.iter().position(|p| p == id) else {
            return;
        };
        let batch: Vec<ConfirmationId> = self.mempool.drain(..=pos).collect();
        let included_at = Utc::now();
        for tx_id in batch {
            let Some(write) = self.txs.get(&tx_id).map(|t| t.write.clone()) else {
                continue;
            };
            let subject = write.subject().clone();

            let refused = matches!(write, LedgerWrite::Access { .. })
                && self.consent.get(&subject) != Some(&ConsentState::Granted);

            let status = if refused {
                TxStatus::Failed("consent not granted".to_string())
            } else {
                if let LedgerWrite::Consent { change, .. } = &write {
                    self.consent.insert(subject.clone(), change.target_state());
                }
                let seq = self.seqs.entry(subject.clone()).or_insert(0);
                *seq += 1;
                let confirmation = Confirmation {
                    confirmation_id: tx_id.clone(),
                    seq: *seq,
                    included_at,
                };
                self.history.entry(subject).or_default().push(LedgerRecord {
                    write,
                    confirmation: confirmation.clone(),
                });
                TxStatus::Included(confirmation)
            };

            if let Some(tx) = self.txs.get_mut(&tx_id) {
                tx.status = status;
            }
        }
    }
}

pub struct SimLedger {
    inclusion_polls: u32,
    state: Mutex<SimState>,
}

impl SimLedger {
    pub fn new(inclusion_polls: u32) -> Self {
        Self {
            inclusion_polls,
            state: Mutex::new(SimState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of writes ever handed to this ledger.
    pub fn submissions(&self) -> u64 {
        self.state().nonce
    }
}

impl Default for SimLedger {
    fn default() -> Self {
        Self::new(0)
    }
}

fn tx_hash(nonce: u64, write: &LedgerWrite) -> Result<ConfirmationId, SubmitError> {
    let body = serde_json::to_vec(write).map_err(|e| SubmitError::Invalid(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_be_bytes());
    hasher.update(&body);
    Ok(ConfirmationId::new(format!(
        "0x{}",
        hex::encode(hasher.finalize())
    )))
}

#[async_trait]
impl LedgerBackend for SimLedger {
    fn name(&self) -> &'static str {
        "sim"
    }

    async fn submit(&self, write: &LedgerWrite) -> Result<ConfirmationId, SubmitError> {
        let mut st = self.state();
        st.nonce += 1;
        let id = tx_hash(st.nonce, write)?;
        st.txs.insert(
            id.clone(),
            SimTx {
                write: write.clone(),
                polls: 0,
                status: TxStatus::Pending,
            },
        );
        st.mempool.push(id.clone());
        Ok(id)
    }

    async fn poll(&self, id: &ConfirmationId) -> Result<InclusionStatus, LedgerError> {
        let mut st = self.state();
        let inclusion_polls = self.inclusion_polls;

        let mine = match st.txs.get_mut(id) {
            None => {
                return Ok(InclusionStatus::Failed {
                    reason: format!("unknown transaction {id}"),
                })
            }
            Some(tx) => match &tx.status {
                TxStatus::Pending => {
                    tx.polls = tx.polls.saturating_add(1);
                    tx.polls > inclusion_polls
                }
                _ => false,
            },
        };
        if mine {
            st.mine_through(id);
        }

        let status = match st.txs.get(id).map(|t| &t.status) {
            Some(TxStatus::Included(c)) => InclusionStatus::Included(c.clone()),
            Some(TxStatus::Failed(reason)) => InclusionStatus::Failed {
                reason: reason.clone(),
            },
            _ => InclusionStatus::Pending,
        };
        Ok(status)
    }

    async fn read_consent(&self, subject: &SubjectId) -> Result<ConsentState, LedgerError> {
        Ok(self
            .state()
            .consent
            .get(subject)
            .copied()
            .unwrap_or(ConsentState::Revoked))
    }

    async fn history(&self, subject: &SubjectId) -> Result<Vec<LedgerRecord>, LedgerError> {
        Ok(self
            .state()
            .history
            .get(subject)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctr_schemas::{ActorId, ConsentChange, Purpose};

    fn p1() -> SubjectId {
        SubjectId::parse("0xp1").unwrap()
    }

    fn grant() -> LedgerWrite {
        LedgerWrite::Consent {
            subject: p1(),
            change: ConsentChange::Grant,
        }
    }

    fn access() -> LedgerWrite {
        LedgerWrite::Access {
            subject: p1(),
            actor: ActorId::parse("0xh1").unwrap(),
            purpose: Purpose::parse("study").unwrap(),
        }
    }

    fn included(s: InclusionStatus) -> Confirmation {
        match s {
            InclusionStatus::Included(c) => c,
            other => panic!("expected inclusion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_write_twice_gets_distinct_hashes() {
        let sim = SimLedger::default();
        let a = sim.submit(&grant()).await.unwrap();
        let b = sim.submit(&grant()).await.unwrap();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("0x"));
        assert_eq!(sim.submissions(), 2);
    }

    #[tokio::test]
    async fn inclusion_waits_for_configured_polls() {
        let sim = SimLedger::new(2);
        let id = sim.submit(&grant()).await.unwrap();
        assert_eq!(sim.poll(&id).await.unwrap(), InclusionStatus::Pending);
        assert_eq!(sim.poll(&id).await.unwrap(), InclusionStatus::Pending);
        let c = included(sim.poll(&id).await.unwrap());
        assert_eq!(c.seq, 1);
        assert_eq!(sim.read_consent(&p1()).await.unwrap(), ConsentState::Granted);
    }

    #[tokio::test]
    async fn access_without_consent_fails_at_inclusion() {
        let sim = SimLedger::default();
        let id = sim.submit(&access()).await.unwrap();
        match sim.poll(&id).await.unwrap() {
            InclusionStatus::Failed { reason } => assert_eq!(reason, "consent not granted"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(sim.history(&p1()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mining_includes_earlier_writes_in_submission_order() {
        let sim = SimLedger::default();
        let g = sim.submit(&grant()).await.unwrap();
        let a = sim.submit(&access()).await.unwrap();

        // Polling the later write mines the grant first.
        let ca = included(sim.poll(&a).await.unwrap());
        let cg = included(sim.poll(&g).await.unwrap());
        assert_eq!(cg.seq, 1);
        assert_eq!(ca.seq, 2);

        let hist = sim.history(&p1()).await.unwrap();
        let seqs: Vec<u64> = hist.iter().map(|r| r.confirmation.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn never_written_subject_reads_revoked() {
        let sim = SimLedger::default();
        assert_eq!(sim.read_consent(&p1()).await.unwrap(), ConsentState::Revoked);
    }
}
