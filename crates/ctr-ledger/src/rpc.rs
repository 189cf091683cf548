//! Ethereum JSON-RPC backend for the consent registry contract.
//!
//! The node must expose unlocked accounts (hardhat / anvil dev node): writes
//! go through `eth_sendTransaction` with `from` set to the signing party
//! (the subject for consent changes, the actor for access logs).
//!
//! Contract surface:
//! - `grantConsent()` / `revokeConsent()`
//! - `logAccess(address subject, string purpose)`
//! - `consentOf(address) returns (bool)`
//! - `event ConsentChanged(address indexed subject, uint64 indexed seq, bool granted)`
//! - `event DataAccess(address indexed subject, uint64 indexed seq, address actor, string purpose)`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ctr_schemas::{ActorId, ConfirmationId, ConsentChange, ConsentState, Purpose, SubjectId};
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    Confirmation, InclusionStatus, LedgerBackend, LedgerError, LedgerRecord, LedgerWrite,
    SubmitError,
};

const SEL_GRANT: &str = "6fac0fe9";
const SEL_REVOKE: &str = "ff4c4d54";
const SEL_LOG_ACCESS: &str = "152d8103";
const SEL_CONSENT_OF: &str = "bac3bcce";

/// keccak256("ConsentChanged(address,uint64,bool)")
pub const TOPIC_CONSENT_CHANGED: &str =
    "0x5469d60cb9dd7b1ae4f65e9f1fdba3cb84b080ccab6710b80d2e474d6bc884f7";
/// keccak256("DataAccess(address,uint64,address,string)")
pub const TOPIC_DATA_ACCESS: &str =
    "0xd607cbf365f64cbe96d42bff2a9823bbf1afd013b3e0fb620e55f0e7bba3c429";

#[derive(Debug)]
enum RpcError {
    Transport(String),
    Node { code: i64, message: String },
    Decode(String),
}

impl From<RpcError> for LedgerError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Transport(m) => LedgerError::Transport(m),
            RpcError::Node { code, message } => {
                LedgerError::Transport(format!("rpc error {code}: {message}"))
            }
            RpcError::Decode(m) => LedgerError::Decode(m),
        }
    }
}

pub struct RpcLedger {
    http: reqwest::Client,
    url: String,
    contract: String,
    confirmations: u64,
    next_id: AtomicU64,
}

impl RpcLedger {
    pub fn new(
        url: &str,
        contract_address: &str,
        confirmations: u64,
        request_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let contract = normalize_address(contract_address)
            .ok_or_else(|| LedgerError::Decode(format!("bad contract address: {contract_address}")))?;
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            url: url.to_string(),
            contract,
            confirmations: confirmations.max(1),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RpcError::Transport(format!("http status {status}")));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| RpcError::Decode(e.to_string()))?;

        if let Some(err) = v.get("error") {
            return Err(RpcError::Node {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        debug!(method, id, "rpc ok");
        Ok(v.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn block_timestamp(&self, block: &str) -> Result<DateTime<Utc>, RpcError> {
        let b = self
            .call("eth_getBlockByNumber", json!([block, false]))
            .await?;
        let ts = b
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::Decode(format!("block {block} has no timestamp")))
            .and_then(parse_quantity)?;
        let secs = i64::try_from(ts).map_err(|_| RpcError::Decode("timestamp overflow".into()))?;
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| RpcError::Decode(format!("bad block timestamp {ts}")))
    }

    fn encode_write(&self, write: &LedgerWrite) -> Result<(String, String), SubmitError> {
        match write {
            LedgerWrite::Consent { subject, change } => {
                let from = require_address(subject.as_str(), "subject")?;
                let sel = match change {
                    ConsentChange::Grant => SEL_GRANT,
                    ConsentChange::Revoke => SEL_REVOKE,
                };
                Ok((from, format!("0x{sel}")))
            }
            LedgerWrite::Access {
                subject,
                actor,
                purpose,
            } => {
                let from = require_address(actor.as_str(), "actor")?;
                let subject = require_address(subject.as_str(), "subject")?;
                let mut data = format!("0x{SEL_LOG_ACCESS}");
                data.push_str(&address_word(&subject));
                data.push_str(&u64_word(0x40));
                data.push_str(&encode_string_tail(purpose.as_str()));
                Ok((from, data))
            }
        }
    }
}

#[async_trait]
impl LedgerBackend for RpcLedger {
    fn name(&self) -> &'static str {
        "rpc"
    }

    async fn submit(&self, write: &LedgerWrite) -> Result<ConfirmationId, SubmitError> {
        let (from, data) = self.encode_write(write)?;
        let tx = json!([{ "from": from, "to": self.contract, "data": data }]);
        match self.call("eth_sendTransaction", tx).await {
            Ok(Value::String(hash)) => Ok(ConfirmationId::new(hash.to_ascii_lowercase())),
            Ok(other) => Err(SubmitError::Rejected(format!(
                "unexpected transaction hash: {other}"
            ))),
            Err(RpcError::Node { code, message }) => {
                Err(SubmitError::Rejected(format!("{message} (code {code})")))
            }
            Err(RpcError::Transport(m)) | Err(RpcError::Decode(m)) => {
                Err(SubmitError::Transport(m))
            }
        }
    }

    async fn poll(&self, id: &ConfirmationId) -> Result<InclusionStatus, LedgerError> {
        let receipt = self
            .call("eth_getTransactionReceipt", json!([id.as_str()]))
            .await?;
        if receipt.is_null() {
            return Ok(InclusionStatus::Pending);
        }

        if receipt.get("status").and_then(Value::as_str) == Some("0x0") {
            return Ok(InclusionStatus::Failed {
                reason: "transaction reverted".to_string(),
            });
        }

        let block_hex = receipt
            .get("blockNumber")
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::Decode("receipt without blockNumber".into()))?
            .to_string();
        let block = parse_quantity(&block_hex)?;

        let head_v = self.call("eth_blockNumber", json!([])).await?;
        let head = head_v
            .as_str()
            .ok_or_else(|| LedgerError::Decode("eth_blockNumber not a string".into()))
            .and_then(|s| parse_quantity(s).map_err(LedgerError::from))?;
        if head.saturating_sub(block) + 1 < self.confirmations {
            return Ok(InclusionStatus::Pending);
        }

        let logs = receipt
            .get("logs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let seq = logs
            .iter()
            .filter(|l| self.is_registry_log(l))
            .find_map(|l| topic(l, 2).and_then(|t| word_to_u64(&t).ok()))
            .ok_or_else(|| LedgerError::Decode(format!("no registry event in receipt {id}")))?;

        let included_at = self.block_timestamp(&block_hex).await?;
        Ok(InclusionStatus::Included(Confirmation {
            confirmation_id: id.clone(),
            seq,
            included_at,
        }))
    }

    async fn read_consent(&self, subject: &SubjectId) -> Result<ConsentState, LedgerError> {
        let addr = normalize_address(subject.as_str())
            .ok_or_else(|| LedgerError::Decode(format!("subject is not an address: {subject}")))?;
        let data = format!("0x{SEL_CONSENT_OF}{}", address_word(&addr));
        let out = self
            .call("eth_call", json!([{ "to": self.contract, "data": data }, "latest"]))
            .await?;
        let word = out
            .as_str()
            .ok_or_else(|| LedgerError::Decode("eth_call result not a string".into()))?;
        let granted = word_to_u64(word)? != 0;
        Ok(if granted {
            ConsentState::Granted
        } else {
            ConsentState::Revoked
        })
    }

    async fn history(&self, subject: &SubjectId) -> Result<Vec<LedgerRecord>, LedgerError> {
        let addr = normalize_address(subject.as_str())
            .ok_or_else(|| LedgerError::Decode(format!("subject is not an address: {subject}")))?;
        let filter = json!([{
            "address": self.contract,
            "fromBlock": "0x0",
            "toBlock": "latest",
            "topics": [
                [TOPIC_CONSENT_CHANGED, TOPIC_DATA_ACCESS],
                format!("0x{}", address_word(&addr)),
            ],
        }]);
        let logs = self.call("eth_getLogs", filter).await?;
        let logs = logs
            .as_array()
            .ok_or_else(|| LedgerError::Decode("eth_getLogs result not an array".into()))?;

        let mut block_times: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut out = Vec::with_capacity(logs.len());
        for log in logs {
            let block = log
                .get("blockNumber")
                .and_then(Value::as_str)
                .ok_or_else(|| LedgerError::Decode("log without blockNumber".into()))?
                .to_string();
            let included_at = match block_times.get(&block) {
                Some(t) => *t,
                None => {
                    let t = self.block_timestamp(&block).await?;
                    block_times.insert(block.clone(), t);
                    t
                }
            };
            out.push(decode_registry_log(subject, log, included_at)?);
        }
        out.sort_by_key(|r| r.confirmation.seq);
        Ok(out)
    }
}

impl RpcLedger {
    fn is_registry_log(&self, log: &Value) -> bool {
        let from_contract = log
            .get("address")
            .and_then(Value::as_str)
            .map(|a| a.eq_ignore_ascii_case(&self.contract))
            .unwrap_or(false);
        let t0 = topic(log, 0);
        from_contract
            && matches!(t0.as_deref(), Some(TOPIC_CONSENT_CHANGED) | Some(TOPIC_DATA_ACCESS))
    }
}

// ---------------------------------------------------------------------------
// Log decoding
// ---------------------------------------------------------------------------

fn decode_registry_log(
    subject: &SubjectId,
    log: &Value,
    included_at: DateTime<Utc>,
) -> Result<LedgerRecord, LedgerError> {
    let tx = log
        .get("transactionHash")
        .and_then(Value::as_str)
        .ok_or_else(|| LedgerError::Decode("log without transactionHash".into()))?;
    let seq = topic(log, 2)
        .ok_or_else(|| LedgerError::Decode("log without seq topic".into()))
        .and_then(|t| word_to_u64(&t))?;
    let data = log
        .get("data")
        .and_then(Value::as_str)
        .unwrap_or("0x")
        .trim_start_matches("0x");

    let write = match topic(log, 0).as_deref() {
        Some(TOPIC_CONSENT_CHANGED) => {
            let granted = word_to_u64(word_at(data, 0)?)? != 0;
            LedgerWrite::Consent {
                subject: subject.clone(),
                change: if granted {
                    ConsentChange::Grant
                } else {
                    ConsentChange::Revoke
                },
            }
        }
        Some(TOPIC_DATA_ACCESS) => {
            let actor_word = word_at(data, 0)?;
            let actor_hex = actor_word
                .get(24..)
                .ok_or_else(|| LedgerError::Decode("short actor word".into()))?;
            let actor = ActorId::parse(&format!("0x{actor_hex}"))
                .map_err(|e| LedgerError::Decode(e.to_string()))?;
            let offset = word_to_usize(word_at(data, 1)?)?;
            let purpose = decode_string_at(data, offset)?;
            let purpose =
                Purpose::parse(&purpose).map_err(|e| LedgerError::Decode(e.to_string()))?;
            LedgerWrite::Access {
                subject: subject.clone(),
                actor,
                purpose,
            }
        }
        other => {
            return Err(LedgerError::Decode(format!(
                "unexpected registry topic {other:?}"
            )))
        }
    };

    Ok(LedgerRecord {
        write,
        confirmation: Confirmation {
            confirmation_id: ConfirmationId::new(tx.to_ascii_lowercase()),
            seq,
            included_at,
        },
    })
}

fn topic(log: &Value, i: usize) -> Option<String> {
    log.get("topics")
        .and_then(Value::as_array)
        .and_then(|t| t.get(i))
        .and_then(Value::as_str)
        .map(|s| s.to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// ABI helpers
// ---------------------------------------------------------------------------

fn normalize_address(raw: &str) -> Option<String> {
    let body = raw.trim().strip_prefix("0x").or_else(|| raw.trim().strip_prefix("0X"))?;
    if body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("0x{}", body.to_ascii_lowercase()))
    } else {
        None
    }
}

fn require_address(raw: &str, field: &str) -> Result<String, SubmitError> {
    normalize_address(raw)
        .ok_or_else(|| SubmitError::Invalid(format!("{field} is not a 20-byte hex address: {raw}")))
}

/// Left-pads a `0x`-prefixed address to one 32-byte word (no prefix).
fn address_word(addr: &str) -> String {
    format!("{:0>64}", addr.trim_start_matches("0x"))
}

fn u64_word(v: u64) -> String {
    format!("{v:064x}")
}

/// Length word followed by the UTF-8 bytes right-padded to a word boundary.
fn encode_string_tail(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = u64_word(bytes.len() as u64);
    let mut body = hex::encode(bytes);
    let rem = body.len() % 64;
    if rem != 0 {
        body.push_str(&"0".repeat(64 - rem));
    }
    out.push_str(&body);
    out
}

fn parse_quantity(s: &str) -> Result<u64, RpcError> {
    let body = s.trim_start_matches("0x");
    if body.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(body, 16).map_err(|e| RpcError::Decode(format!("bad quantity {s}: {e}")))
}

fn word_at(data: &str, index: usize) -> Result<&str, LedgerError> {
    let short = || LedgerError::Decode(format!("abi data too short for word {index}"));
    let start = index.checked_mul(64).ok_or_else(short)?;
    let end = start.checked_add(64).ok_or_else(short)?;
    data.get(start..end).ok_or_else(short)
}

/// Reads a 32-byte word as `u64`, refusing values that do not fit.
fn word_to_u64(word: &str) -> Result<u64, LedgerError> {
    let body = word.trim_start_matches("0x");
    if body.len() > 64 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(LedgerError::Decode(format!("not an abi word: {word}")));
    }
    let split = body.len().saturating_sub(16);
    if body[..split].chars().any(|c| c != '0') {
        return Err(LedgerError::Decode(format!("abi word exceeds u64: {word}")));
    }
    if body[split..].is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(&body[split..], 16).map_err(|e| LedgerError::Decode(e.to_string()))
}

fn word_to_usize(word: &str) -> Result<usize, LedgerError> {
    let v = word_to_u64(word)?;
    usize::try_from(v).map_err(|_| LedgerError::Decode(format!("abi word exceeds usize: {v}")))
}

/// Offsets and lengths come from node data; every step is bounds-checked.
fn decode_string_at(data: &str, byte_offset: usize) -> Result<String, LedgerError> {
    let offset_err = || LedgerError::Decode("abi string offset out of range".into());
    let body_err = || LedgerError::Decode("abi string body out of range".into());

    let start = byte_offset.checked_mul(2).ok_or_else(offset_err)?;
    let len_end = start.checked_add(64).ok_or_else(offset_err)?;
    let len_word = data.get(start..len_end).ok_or_else(offset_err)?;
    let len = word_to_usize(len_word)?;
    let body_end = len
        .checked_mul(2)
        .and_then(|n| len_end.checked_add(n))
        .ok_or_else(body_err)?;
    let body = data.get(len_end..body_end).ok_or_else(body_err)?;
    let bytes = hex::decode(body).map_err(|e| LedgerError::Decode(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| LedgerError::Decode(e.to_string()))
}
