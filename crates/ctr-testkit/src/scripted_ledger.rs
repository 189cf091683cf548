//! Ledger double with scripted faults, layered over [`SimLedger`].
//!
//! Every fault is one-shot or counted so a scenario states exactly what the
//! ledger does and in which order.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use ctr_ledger::{
    Confirmation, InclusionStatus, LedgerBackend, LedgerError, LedgerRecord, LedgerWrite,
    SimLedger, SubmitError,
};
use ctr_schemas::{ConfirmationId, ConsentState, SubjectId};

#[derive(Debug, Default)]
struct Script {
    reject_next_submit: Option<String>,
    redeliver_next_submit: bool,
    revert_next_submit: Option<String>,
    reverted: Vec<(ConfirmationId, String)>,
    stall_polls: u32,
    hold_inclusion: bool,
    last_id: Option<ConfirmationId>,
    submit_calls: u64,
    poll_calls: u64,
}

pub struct ScriptedLedger {
    sim: SimLedger,
    script: Mutex<Script>,
}

impl Default for ScriptedLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedLedger {
    pub fn new() -> Self {
        Self {
            sim: SimLedger::new(0),
            script: Mutex::new(Script::default()),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The next `submit` fails with `SubmitError::Rejected(reason)`.
    pub fn reject_next_submit(&self, reason: &str) {
        self.script().reject_next_submit = Some(reason.to_string());
    }

    /// The next `submit` is answered with the previous transaction hash, as a
    /// node does when an identical signed transaction is broadcast again.
    pub fn redeliver_next_submit(&self) {
        self.script().redeliver_next_submit = true;
    }

    /// The next submitted write is accepted but reverts at inclusion.
    pub fn revert_next_submit(&self, reason: &str) {
        self.script().revert_next_submit = Some(reason.to_string());
    }

    /// The next `n` polls never answer.
    pub fn stall_polls(&self, n: u32) {
        self.script().stall_polls = n;
    }

    /// While held, every poll reports `Pending` and nothing is mined.
    pub fn hold_inclusion(&self, hold: bool) {
        self.script().hold_inclusion = hold;
    }

    /// Calls that reached `submit`, including scripted refusals.
    pub fn submit_calls(&self) -> u64 {
        self.script().submit_calls
    }

    pub fn poll_calls(&self) -> u64 {
        self.script().poll_calls
    }

    /// Writes the simulated ledger actually accepted.
    pub fn accepted_writes(&self) -> u64 {
        self.sim.submissions()
    }

    /// Submit and mine a write without going through any client. Leaves the
    /// audit index behind the ledger.
    pub async fn commit_out_of_band(&self, write: &LedgerWrite) -> anyhow::Result<Confirmation> {
        let id = self
            .sim
            .submit(write)
            .await
            .map_err(|e| anyhow::anyhow!("out-of-band submit: {e}"))?;
        match self
            .sim
            .poll(&id)
            .await
            .map_err(|e| anyhow::anyhow!("out-of-band poll: {e}"))?
        {
            InclusionStatus::Included(c) => Ok(c),
            other => anyhow::bail!("out-of-band write not included: {other:?}"),
        }
    }
}

#[async_trait]
impl LedgerBackend for ScriptedLedger {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn submit(&self, write: &LedgerWrite) -> Result<ConfirmationId, SubmitError> {
        {
            let mut s = self.script();
            s.submit_calls += 1;
            if let Some(reason) = s.reject_next_submit.take() {
                return Err(SubmitError::Rejected(reason));
            }
            if std::mem::take(&mut s.redeliver_next_submit) {
                if let Some(id) = s.last_id.clone() {
                    return Ok(id);
                }
            }
            // A reverting write never reaches the simulated chain.
            if let Some(reason) = s.revert_next_submit.take() {
                let id = ConfirmationId::new(format!("0xreverted{:04}", s.submit_calls));
                s.reverted.push((id.clone(), reason));
                s.last_id = Some(id.clone());
                return Ok(id);
            }
        }

        let id = self.sim.submit(write).await?;
        self.script().last_id = Some(id.clone());
        Ok(id)
    }

    async fn poll(&self, id: &ConfirmationId) -> Result<InclusionStatus, LedgerError> {
        let stall = {
            let mut s = self.script();
            s.poll_calls += 1;
            if let Some((_, reason)) = s.reverted.iter().find(|(r, _)| r == id) {
                return Ok(InclusionStatus::Failed {
                    reason: reason.clone(),
                });
            }
            if s.stall_polls > 0 {
                s.stall_polls -= 1;
                true
            } else if s.hold_inclusion {
                return Ok(InclusionStatus::Pending);
            } else {
                false
            }
        };
        if stall {
            std::future::pending::<()>().await;
        }
        self.sim.poll(id).await
    }

    async fn read_consent(&self, subject: &SubjectId) -> Result<ConsentState, LedgerError> {
        self.sim.read_consent(subject).await
    }

    async fn history(&self, subject: &SubjectId) -> Result<Vec<LedgerRecord>, LedgerError> {
        self.sim.history(subject).await
    }
}
