//! Durable audit index: an append-only JSON Lines journal.
//!
//! One audit record per line, canonical (recursively sorted keys, compact),
//! chained with SHA-256: `hash_prev` is the previous line's `hash_self`, and
//! `hash_self` is the hash of the line's canonical JSON without `hash_self`.
//!
//! On open the whole journal is verified and replayed through the append
//! rules. A broken chain or a replay that violates the rules refuses to open.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ctr_schemas::{AccessEvent, AuditRecord, ConsentEvent, ConsentView, SubjectId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{AppendOutcome, AuditIndex, IndexError, SubjectLedger};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub record: AuditRecord,
    pub written_at: DateTime<Utc>,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}

// ---------------------------------------------------------------------------
// Canonical form and hashing
// ---------------------------------------------------------------------------

fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize journal entry failed")?;
    serde_json::to_string(&sort_keys(&raw)).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

pub fn compute_entry_hash(entry: &JournalEntry) -> Result<String> {
    let mut unsealed = entry.clone();
    unsealed.hash_self = None;
    let canonical = canonical_json_line(&unsealed)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

pub fn verify_journal(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit journal {:?}", path.as_ref()))?;
    verify_journal_str(&content)
}

pub fn verify_journal_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut lines = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry: JournalEntry = match serde_json::from_str(trimmed) {
            Ok(e) => e,
            Err(e) => {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!("unparseable entry: {e}"),
                })
            }
        };
        lines += 1;

        if entry.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, entry.hash_prev
                ),
            });
        }

        let Some(claimed) = entry.hash_self.clone() else {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: "missing hash_self".to_string(),
            });
        };
        let recomputed = compute_entry_hash(&entry)?;
        if claimed != recomputed {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!("hash_self mismatch: claimed {claimed}, recomputed {recomputed}"),
            });
        }
        prev_hash = Some(claimed);
    }

    Ok(VerifyResult::Valid { lines })
}

/// Parse every record of a journal, in file order. Does not verify the chain.
pub fn read_journal(path: impl AsRef<Path>) -> Result<Vec<JournalEntry>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit journal {:?}", path.as_ref()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str(l.trim())
                .with_context(|| format!("parse journal entry at line {}", i + 1))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

struct JournalState {
    ledger: SubjectLedger,
    last_hash: Option<String>,
}

pub struct JournalAuditIndex {
    path: PathBuf,
    state: Mutex<JournalState>,
}

impl JournalAuditIndex {
    /// Open (or create) the journal at `path`, verifying and replaying it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create_dir_all {:?}", parent))?;
            }
        }

        let mut ledger = SubjectLedger::new();
        let mut last_hash = None;

        if path.exists() {
            match verify_journal(&path)? {
                VerifyResult::Valid { .. } => {}
                VerifyResult::Broken { line, reason } => {
                    bail!("AUDIT_JOURNAL_BROKEN path={:?} line={line}: {reason}", path)
                }
            }
            let entries = read_journal(&path)?;
            for (i, entry) in entries.into_iter().enumerate() {
                match ledger.append(entry.record) {
                    Ok(AppendOutcome::Appended) => {}
                    Ok(AppendOutcome::DuplicateConfirmationId) => {
                        bail!("AUDIT_JOURNAL_INVALID entry={}: duplicate confirmation id", i + 1)
                    }
                    Err(e) => bail!("AUDIT_JOURNAL_INVALID entry={}: {e}", i + 1),
                }
                last_hash = entry.hash_self;
            }
            info!(path = ?path, subjects = ledger.subjects().len(), "audit journal replayed");
        }

        Ok(Self {
            path,
            state: Mutex::new(JournalState { ledger, last_hash }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, rec: AuditRecord) -> Result<AppendOutcome, IndexError> {
        let mut st = self.state.lock().await;
        let outcome = st.ledger.check(&rec)?;
        if outcome == AppendOutcome::DuplicateConfirmationId {
            return Ok(outcome);
        }

        let mut entry = JournalEntry {
            record: rec,
            written_at: Utc::now(),
            hash_prev: st.last_hash.clone(),
            hash_self: None,
        };
        let hash = compute_entry_hash(&entry).map_err(|e| IndexError::Unavailable(e.to_string()))?;
        entry.hash_self = Some(hash.clone());
        let line =
            canonical_json_line(&entry).map_err(|e| IndexError::Unavailable(e.to_string()))?;

        if let Err(e) = append_line(&self.path, &line) {
            warn!(path = ?self.path, error = %e, "audit journal write failed");
            return Err(IndexError::Unavailable(format!("{e:#}")));
        }

        st.last_hash = Some(hash);
        st.ledger.apply(entry.record);
        Ok(AppendOutcome::Appended)
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    append_with(path, line, write_synced)
}

fn write_synced(f: &mut File, buf: &[u8]) -> Result<()> {
    f.write_all(buf).context("write journal line failed")?;
    f.sync_data().context("sync journal failed")?;
    Ok(())
}

/// Append one line or leave the file exactly as it was.
///
/// A failed write is truncated back to the previous length so the next
/// append cannot land after a torn line.
fn append_with<W>(path: &Path, line: &str, write: W) -> Result<()>
where
    W: FnOnce(&mut File, &[u8]) -> Result<()>,
{
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit journal {:?}", path))?;
    let committed = f
        .metadata()
        .with_context(|| format!("stat audit journal {:?}", path))?
        .len();

    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');

    if let Err(e) = write(&mut f, &buf) {
        if let Err(undo) = f.set_len(committed).and_then(|_| f.sync_data()) {
            error!(
                path = ?path,
                committed,
                error = %undo,
                "audit journal rollback failed; journal may hold a torn line"
            );
            return Err(e.context(format!("rollback to {committed} bytes failed: {undo}")));
        }
        return Err(e);
    }
    Ok(())
}

#[async_trait]
impl AuditIndex for JournalAuditIndex {
    fn name(&self) -> &'static str {
        "journal"
    }

    async fn append_consent_event(&self, ev: &ConsentEvent) -> Result<AppendOutcome, IndexError> {
        self.append(AuditRecord::Consent(ev.clone())).await
    }

    async fn append_access_event(&self, ev: &AccessEvent) -> Result<AppendOutcome, IndexError> {
        self.append(AuditRecord::Access(ev.clone())).await
    }

    async fn latest_consent_state(&self, subject: &SubjectId) -> Result<ConsentView, IndexError> {
        Ok(self.state.lock().await.ledger.latest_consent(subject))
    }

    async fn list_access_events(
        &self,
        subject: &SubjectId,
        since: Option<u64>,
    ) -> Result<Vec<AccessEvent>, IndexError> {
        Ok(self.state.lock().await.ledger.access_since(subject, since))
    }

    async fn list_consent_events(
        &self,
        subject: &SubjectId,
        since: Option<u64>,
    ) -> Result<Vec<ConsentEvent>, IndexError> {
        Ok(self.state.lock().await.ledger.consent_since(subject, since))
    }

    async fn last_seq(&self, subject: &SubjectId) -> Result<u64, IndexError> {
        Ok(self.state.lock().await.ledger.last_seq(subject))
    }

    async fn subjects(&self) -> Result<Vec<SubjectId>, IndexError> {
        Ok(self.state.lock().await.ledger.subjects())
    }
}
