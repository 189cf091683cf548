//! Back-end selection from `ServiceConfig`.

use std::sync::Arc;

use anyhow::{Context, Result};
use ctr_audit::{AuditIndex, JournalAuditIndex, MemoryAuditIndex};
use ctr_config::secrets::ResolvedSecrets;
use ctr_config::{AuditBackend, LedgerMode, ServiceConfig};
use ctr_ledger::{LedgerBackend, LedgerClient, RpcLedger, SimLedger};
use ctr_reconcile::{EngineConfig, ReconciliationEngine};
use tracing::info;

pub fn build_ledger(
    cfg: &ServiceConfig,
    secrets: &ResolvedSecrets,
) -> Result<Arc<dyn LedgerBackend>> {
    match cfg.ledger.mode {
        LedgerMode::Sim => Ok(Arc::new(SimLedger::new(cfg.ledger.sim.inclusion_polls))),
        LedgerMode::Rpc => {
            let url = secrets
                .rpc_url
                .as_deref()
                .context("ledger.mode=rpc requires a node url")?;
            let rpc = &cfg.ledger.rpc;
            let ledger = RpcLedger::new(
                url,
                &rpc.contract_address,
                rpc.confirmations,
                rpc.request_timeout(),
            )
            .map_err(|e| anyhow::anyhow!("rpc ledger: {e}"))?;
            Ok(Arc::new(ledger))
        }
    }
}

pub async fn build_index(
    cfg: &ServiceConfig,
    secrets: &ResolvedSecrets,
) -> Result<Arc<dyn AuditIndex>> {
    match cfg.audit.backend {
        AuditBackend::Memory => Ok(Arc::new(MemoryAuditIndex::new())),
        AuditBackend::Journal => {
            let path = cfg
                .audit
                .journal_path
                .as_ref()
                .context("audit.backend=journal requires audit.journal_path")?;
            let index = JournalAuditIndex::open(path)
                .with_context(|| format!("open audit journal {}", path.display()))?;
            Ok(Arc::new(index))
        }
        AuditBackend::Postgres => {
            let url = secrets
                .database_url
                .as_deref()
                .context("audit.backend=postgres requires a database url")?;
            let pool = ctr_db::connect(url).await?;
            ctr_db::migrate(&pool).await?;
            Ok(Arc::new(ctr_db::PgAuditIndex::new(pool)))
        }
    }
}

pub async fn build_engine(
    cfg: &ServiceConfig,
    secrets: &ResolvedSecrets,
) -> Result<Arc<ReconciliationEngine>> {
    let ledger = build_ledger(cfg, secrets)?;
    let index = build_index(cfg, secrets).await?;
    let client = Arc::new(LedgerClient::new(ledger, cfg.ledger.poll_interval()));
    info!(
        ledger = client.backend_name(),
        audit = index.name(),
        "reconciliation engine wired"
    );
    Ok(Arc::new(ReconciliationEngine::new(
        client,
        index,
        EngineConfig::from_settings(&cfg.engine),
    )))
}
