//! Runtime secret resolution.
//!
//! # Contract
//! - Config YAML stores only **env var NAMES** (e.g. `"CTR_RPC_URL"`).
//! - At startup, callers invoke [`resolve_secrets`] once and pass the result
//!   into constructors; `std::env::var` is not scattered across the codebase.
//! - `Debug` on [`ResolvedSecrets`] redacts values.
//! - Error messages reference the env var **NAME**, never the value.
//!
//! # Enforcement
//! | Setting                 | Required                     |
//! |-------------------------|------------------------------|
//! | `ledger.mode: rpc`      | node URL (`ledger.rpc.url_env`) |
//! | `audit.backend: postgres` | database URL (`audit.database_url_env`) |
//! | otherwise               | nothing                      |

use anyhow::{bail, Result};

use crate::{AuditBackend, LedgerMode, ServiceConfig};

/// All runtime-resolved secrets for one service instantiation.
#[derive(Clone, Default)]
pub struct ResolvedSecrets {
    /// JSON-RPC node URL. Hosted providers embed the API key in it.
    pub rpc_url: Option<String>,
    /// Postgres connection string.
    pub database_url: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("rpc_url", &self.rpc_url.as_ref().map(|_| "<REDACTED>"))
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

/// Resolve a named environment variable.
/// Returns `None` if the variable is unset or its value is blank.
fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve all secrets the configured back ends need.
///
/// # Errors
/// Returns `Err` naming the **env var** of the first missing required secret.
pub fn resolve_secrets(cfg: &ServiceConfig) -> Result<ResolvedSecrets> {
    let rpc_var = cfg.ledger.rpc.url_env.trim();
    let db_var = cfg.audit.database_url_env.trim();

    let rpc_url = if rpc_var.is_empty() {
        None
    } else {
        resolve_env(rpc_var)
    };
    let database_url = if db_var.is_empty() {
        None
    } else {
        resolve_env(db_var)
    };

    if cfg.ledger.mode == LedgerMode::Rpc && rpc_url.is_none() {
        bail!(
            "SECRETS_MISSING ledger=rpc: required env var '{}' (node url) is not set or empty",
            rpc_var
        );
    }
    if cfg.audit.backend == AuditBackend::Postgres && database_url.is_none() {
        bail!(
            "SECRETS_MISSING audit=postgres: required env var '{}' (database url) is not set or empty",
            db_var
        );
    }

    Ok(ResolvedSecrets {
        rpc_url,
        database_url,
    })
}
