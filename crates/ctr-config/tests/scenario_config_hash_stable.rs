//! Config hash stability
//!
//! GREEN when:
//! - `load_layered_yaml_from_strings` called twice on the same inputs returns
//!   identical config_hash.
//! - Reordering keys within YAML doesn't change the hash (canonicalization).
//! - Different values produce different hashes.

use ctr_config::load_layered_yaml_from_strings;

const BASE_YAML: &str = r#"
engine:
  finality_timeout_ms: 30000
  max_finality_polls: 3
ledger:
  mode: "rpc"
  rpc:
    url_env: "CTR_RPC_URL"
    contract_address: "0x5FbDB2315678afecb367f032d93F642f64180aa3"
"#;

/// Same content as BASE_YAML but with keys in different order.
const BASE_YAML_REORDERED: &str = r#"
ledger:
  rpc:
    contract_address: "0x5FbDB2315678afecb367f032d93F642f64180aa3"
    url_env: "CTR_RPC_URL"
  mode: "rpc"
engine:
  max_finality_polls: 3
  finality_timeout_ms: 30000
"#;

const OVERLAY_YAML: &str = r#"
engine:
  max_finality_polls: 5
"#;

#[test]
fn same_input_produces_identical_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();

    assert_eq!(a.config_hash, b.config_hash);
    assert_eq!(a.canonical_json, b.canonical_json);
}

#[test]
fn key_order_does_not_change_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML_REORDERED]).unwrap();

    assert_eq!(
        a.config_hash, b.config_hash,
        "reordered keys must canonicalize to the same hash"
    );
}

#[test]
fn different_values_produce_different_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();

    assert_ne!(a.config_hash, b.config_hash);
    assert_eq!(b.config_json["engine"]["max_finality_polls"], 5);
    assert_eq!(b.config_json["engine"]["finality_timeout_ms"], 30000);
}

#[test]
fn hash_is_hex_sha256() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    assert_eq!(a.config_hash.len(), 64);
    assert!(a.config_hash.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn layered_config_deserializes_into_service_config() {
    let loaded = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    let svc = loaded.service().unwrap();
    assert_eq!(svc.engine.max_finality_polls, 5);
    assert_eq!(svc.ledger.mode, ctr_config::LedgerMode::Rpc);
    assert_eq!(svc.ledger.rpc.confirmations, 2, "unset keys keep defaults");
}
