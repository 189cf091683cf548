use anyhow::Result;
use ctr_config::{AuditBackend, LedgerMode, LoadedConfig};

pub fn load(paths: &[String]) -> Result<LoadedConfig> {
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    ctr_config::load_layered_yaml(&path_refs)
}

/// Validate the typed view and report which back ends it selects. Secrets
/// are only checked for presence, never printed.
pub fn check(paths: &[String]) -> Result<()> {
    let loaded = load(paths)?;
    let cfg = loaded.service()?;
    let secrets = ctr_config::secrets::resolve_secrets(&cfg)?;

    let ledger = match cfg.ledger.mode {
        LedgerMode::Sim => "sim",
        LedgerMode::Rpc => "rpc",
    };
    let audit = match cfg.audit.backend {
        AuditBackend::Memory => "memory",
        AuditBackend::Journal => "journal",
        AuditBackend::Postgres => "postgres",
    };
    println!("config_hash={}", loaded.config_hash);
    println!("ledger_mode={ledger}");
    println!("audit_backend={audit}");
    println!("rpc_url_present={}", secrets.rpc_url.is_some());
    println!("database_url_present={}", secrets.database_url.is_some());
    Ok(())
}
