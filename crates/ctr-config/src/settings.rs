//! Typed view of the merged config tree.
//!
//! Every section has defaults so a bare `{}` yields a working sim/memory
//! service. Unknown keys are rejected.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub engine: EngineSettings,
    pub ledger: LedgerSettings,
    pub audit: AuditSettings,
    pub daemon: DaemonSettings,
}

impl ServiceConfig {
    pub fn from_json(v: &Value) -> Result<Self> {
        let cfg: ServiceConfig =
            serde_json::from_value(v.clone()).context("CONFIG_INVALID: service config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_finality_polls == 0 {
            bail!("CONFIG_INVALID: engine.max_finality_polls must be >= 1");
        }
        if self.engine.index_backoff_initial_ms == 0 {
            bail!("CONFIG_INVALID: engine.index_backoff_initial_ms must be > 0");
        }
        if self.engine.index_backoff_max_ms < self.engine.index_backoff_initial_ms {
            bail!("CONFIG_INVALID: engine.index_backoff_max_ms must be >= index_backoff_initial_ms");
        }
        if self.engine.index_alert_after == 0 {
            bail!("CONFIG_INVALID: engine.index_alert_after must be >= 1");
        }
        if self.engine.resume_interval_ms == 0
            || self.engine.drift_check_interval_ms == 0
            || self.daemon.heartbeat_interval_ms == 0
        {
            bail!("CONFIG_INVALID: background task intervals must be > 0");
        }
        if self.ledger.mode == LedgerMode::Rpc {
            if self.ledger.rpc.contract_address.trim().is_empty() {
                bail!("CONFIG_INVALID: ledger.rpc.contract_address is required in rpc mode");
            }
            if self.ledger.rpc.confirmations == 0 {
                bail!("CONFIG_INVALID: ledger.rpc.confirmations must be >= 1");
            }
        }
        if self.audit.backend == AuditBackend::Journal && self.audit.journal_path.is_none() {
            bail!("CONFIG_INVALID: audit.journal_path is required for the journal backend");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// engine
// ---------------------------------------------------------------------------

/// Timing and retry policy of the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// Per-poll finality wait.
    pub finality_timeout_ms: u64,
    /// Finality waits before the attempt is parked as pending and alerted.
    pub max_finality_polls: u32,
    /// First index-retry delay; doubles on each failure.
    pub index_backoff_initial_ms: u64,
    /// Cap for the index-retry delay. Retries never stop.
    pub index_backoff_max_ms: u64,
    /// Consecutive index failures before an operator alert is raised.
    pub index_alert_after: u32,
    /// How often the daemon re-polls parked attempts.
    pub resume_interval_ms: u64,
    /// How often the daemon compares ledger and index consent per subject.
    pub drift_check_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            finality_timeout_ms: 30_000,
            max_finality_polls: 3,
            index_backoff_initial_ms: 100,
            index_backoff_max_ms: 10_000,
            index_alert_after: 10,
            resume_interval_ms: 15_000,
            drift_check_interval_ms: 60_000,
        }
    }
}

impl EngineSettings {
    pub fn finality_timeout(&self) -> Duration {
        Duration::from_millis(self.finality_timeout_ms)
    }

    pub fn index_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.index_backoff_initial_ms)
    }

    pub fn index_backoff_max(&self) -> Duration {
        Duration::from_millis(self.index_backoff_max_ms)
    }

    pub fn resume_interval(&self) -> Duration {
        Duration::from_millis(self.resume_interval_ms)
    }

    pub fn drift_check_interval(&self) -> Duration {
        Duration::from_millis(self.drift_check_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerMode {
    /// In-process simulated registry.
    #[default]
    Sim,
    /// Ethereum JSON-RPC node with unlocked accounts.
    Rpc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerSettings {
    pub mode: LedgerMode,
    pub poll_interval_ms: u64,
    pub sim: SimSettings,
    pub rpc: RpcSettings,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            mode: LedgerMode::Sim,
            poll_interval_ms: 500,
            sim: SimSettings::default(),
            rpc: RpcSettings::default(),
        }
    }
}

impl LedgerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimSettings {
    /// Polls a submission stays pending before inclusion.
    pub inclusion_polls: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpcSettings {
    /// NAME of the env var holding the node URL (hosted URLs embed API keys).
    pub url_env: String,
    pub contract_address: String,
    /// Blocks (inclusive of the receipt's block) before a write is final.
    pub confirmations: u64,
    pub request_timeout_ms: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            url_env: "CTR_RPC_URL".to_string(),
            contract_address: String::new(),
            confirmations: 2,
            request_timeout_ms: 10_000,
        }
    }
}

impl RpcSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditBackend {
    #[default]
    Memory,
    Journal,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditSettings {
    pub backend: AuditBackend,
    pub journal_path: Option<PathBuf>,
    /// NAME of the env var holding the Postgres URL.
    pub database_url_env: String,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            backend: AuditBackend::Memory,
            journal_path: None,
            database_url_env: "CTR_DATABASE_URL".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSettings {
    pub bind: SocketAddr,
    pub heartbeat_interval_ms: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8899)),
            heartbeat_interval_ms: 1_000,
        }
    }
}

impl DaemonSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_tree_yields_defaults() {
        let cfg = ServiceConfig::from_json(&json!({})).unwrap();
        assert_eq!(cfg, ServiceConfig::default());
        assert_eq!(cfg.ledger.mode, LedgerMode::Sim);
        assert_eq!(cfg.audit.backend, AuditBackend::Memory);
    }

    #[test]
    fn unknown_key_rejected() {
        let err = ServiceConfig::from_json(&json!({"engine": {"max_polls": 2}})).unwrap_err();
        assert!(format!("{err:#}").contains("CONFIG_INVALID"));
    }

    #[test]
    fn rpc_mode_requires_contract_address() {
        let err = ServiceConfig::from_json(&json!({"ledger": {"mode": "rpc"}})).unwrap_err();
        assert!(err.to_string().contains("contract_address"));
    }

    #[test]
    fn journal_backend_requires_path() {
        let err = ServiceConfig::from_json(&json!({"audit": {"backend": "journal"}})).unwrap_err();
        assert!(err.to_string().contains("journal_path"));
    }

    #[test]
    fn zero_finality_polls_rejected() {
        let err =
            ServiceConfig::from_json(&json!({"engine": {"max_finality_polls": 0}})).unwrap_err();
        assert!(err.to_string().contains("max_finality_polls"));
    }

    #[test]
    fn zero_interval_rejected() {
        let err = ServiceConfig::from_json(&json!({"daemon": {"heartbeat_interval_ms": 0}}))
            .unwrap_err();
        assert!(err.to_string().contains("intervals"));
    }

    #[test]
    fn zero_alert_threshold_rejected() {
        let err = ServiceConfig::from_json(&json!({"engine": {"index_alert_after": 0}}))
            .unwrap_err();
        assert!(err.to_string().contains("index_alert_after"));

        let ok = ServiceConfig::from_json(&json!({"engine": {"index_alert_after": 1}})).unwrap();
        assert_eq!(ok.engine.index_alert_after, 1);
    }
}
