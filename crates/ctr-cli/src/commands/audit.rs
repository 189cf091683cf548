//! Offline inspection of a hash-chained audit journal.

use std::path::Path;

use anyhow::{bail, Context, Result};
use ctr_audit::journal::read_journal;
use ctr_audit::{verify_journal, VerifyResult};
use ctr_schemas::{AuditRecord, ConsentView, SubjectId};
use tracing::debug;

fn require_file(path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("audit journal not found: {}", path.display());
    }
    debug!(path = %path.display(), "reading audit journal");
    Ok(())
}

/// Exit non-zero when the chain is broken so scripts can gate on it.
pub fn verify(path: &Path) -> Result<()> {
    require_file(path)?;
    match verify_journal(path)? {
        VerifyResult::Valid { lines } => {
            println!("journal_valid=true lines={lines}");
            Ok(())
        }
        VerifyResult::Broken { line, reason } => {
            println!("journal_valid=false line={line}");
            bail!("AUDIT_JOURNAL_BROKEN line={line}: {reason}")
        }
    }
}

fn verified_records(path: &Path, subject: &SubjectId) -> Result<Vec<AuditRecord>> {
    require_file(path)?;
    if let VerifyResult::Broken { line, reason } = verify_journal(path)? {
        bail!("AUDIT_JOURNAL_BROKEN line={line}: {reason}; refusing to read");
    }
    Ok(read_journal(path)?
        .into_iter()
        .map(|e| e.record)
        .filter(|r| r.subject() == subject)
        .collect())
}

/// One JSON record per line, in seq order, after `since` (exclusive).
pub fn list(path: &Path, subject: &str, since: Option<u64>) -> Result<()> {
    let subject = SubjectId::parse(subject).context("invalid --subject")?;
    let cursor = since.unwrap_or(0);
    for rec in verified_records(path, &subject)? {
        if rec.seq() > cursor {
            println!("{}", serde_json::to_string(&rec)?);
        }
    }
    Ok(())
}

pub fn latest(path: &Path, subject: &str) -> Result<()> {
    let subject = SubjectId::parse(subject).context("invalid --subject")?;
    let latest = verified_records(path, &subject)?
        .into_iter()
        .filter_map(|r| match r {
            AuditRecord::Consent(ev) => Some(ConsentView::from(ev.state)),
            AuditRecord::Access(_) => None,
        })
        .last()
        .unwrap_or(ConsentView::Unknown);
    let label = match latest {
        ConsentView::Granted => "granted",
        ConsentView::Revoked => "revoked",
        ConsentView::Unknown => "unknown",
    };
    println!("subject={subject} consent={label}");
    Ok(())
}
