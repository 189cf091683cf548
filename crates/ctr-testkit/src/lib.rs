//! ctr-testkit
//!
//! Fault-injecting doubles for the ledger and the audit index, and a harness
//! wiring them into a `ReconciliationEngine` with test-speed timings.
//!
//! The scenario tests under `tests/` drive the whole pipeline through the
//! engine's public operations only.

mod flaky_index;
mod scripted_ledger;

pub use flaky_index::FlakyIndex;
pub use scripted_ledger::ScriptedLedger;

use std::sync::Arc;
use std::time::Duration;

use ctr_audit::AuditIndex;
use ctr_ledger::LedgerClient;
use ctr_reconcile::{EngineConfig, ReconciliationEngine};
use ctr_schemas::SubjectId;

/// Timings short enough for tests; finality gets two waits before parking.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        finality_timeout: Duration::from_millis(100),
        max_finality_polls: 2,
        index_backoff_initial: Duration::from_millis(2),
        index_backoff_max: Duration::from_millis(16),
        index_alert_after: 3,
    }
}

pub struct Harness {
    pub engine: Arc<ReconciliationEngine>,
    pub ledger: Arc<ScriptedLedger>,
    pub index: Arc<FlakyIndex>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(cfg: EngineConfig) -> Self {
        let ledger = Arc::new(ScriptedLedger::new());
        let index = Arc::new(FlakyIndex::new());
        let client = Arc::new(LedgerClient::new(ledger.clone(), Duration::from_millis(1)));
        let engine = Arc::new(ReconciliationEngine::new(
            client,
            index.clone() as Arc<dyn AuditIndex>,
            cfg,
        ));
        Self {
            engine,
            ledger,
            index,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a subject id in tests.
pub fn subject(raw: &str) -> SubjectId {
    match SubjectId::parse(raw) {
        Ok(s) => s,
        Err(e) => panic!("bad test subject {raw:?}: {e}"),
    }
}
