//! Shared runtime state for ctr-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The engine owns all
//! reconciliation state; this module only adds the SSE bus and the
//! background tasks that drive the engine on a timer.

use std::sync::Arc;
use std::time::Duration;

use ctr_reconcile::{EngineEvent, ReconciliationEngine};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// BusMsg: SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the daemon bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Engine { event: EngineEvent },
    LogLine { level: String, msg: String },
}

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub engine: Arc<ReconciliationEngine>,
}

impl AppState {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            bus,
            build: BuildInfo {
                service: "ctr-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            engine,
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Emit a heartbeat on the bus every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Relay engine progress, alerts and completions onto the SSE bus.
pub fn spawn_event_forwarder(state: Arc<AppState>) {
    let mut rx = state.engine.events();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let _ = state.bus.send(BusMsg::Engine { event });
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "engine event relay lagged");
                    let _ = state.bus.send(BusMsg::LogLine {
                        level: "WARN".to_string(),
                        msg: format!("{n} engine events dropped by relay"),
                    });
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Re-poll parked attempts every `interval`. Never resubmits.
pub fn spawn_pending_resumer(engine: Arc<ReconciliationEngine>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if engine.pending_attempts().is_empty() {
                continue;
            }
            let results = engine.resume_pending().await;
            let resolved = results.iter().filter(|r| r.is_success()).count();
            info!(resumed = results.len(), resolved, "pending attempts re-polled");
        }
    });
}

/// Compare ledger and index consent for every indexed subject every
/// `interval`. Drift is alerted by the engine; failures of the sweep itself
/// go to the bus as log lines.
pub fn spawn_drift_tick(state: Arc<AppState>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so boot is not a sweep.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match state.engine.drift_sweep().await {
                Ok(reports) => {
                    let drifted = reports.iter().filter(|r| !r.is_clean()).count();
                    info!(checked = reports.len(), drifted, "drift sweep");
                }
                Err(e) => {
                    warn!(error = %e, "drift sweep failed");
                    let _ = state.bus.send(BusMsg::LogLine {
                        level: "ERROR".to_string(),
                        msg: format!("drift sweep failed: {e}"),
                    });
                }
            }
        }
    });
}
