//! ctr-reconcile
//!
//! Reconciliation Engine and Authorization Gate.
//!
//! The ledger is the source of truth; the audit index is a queryable mirror.
//! Every consent change and access action goes ledger first, then index, and
//! the engine is the only writer of either.
//!
//! # Invariants
//! - Writes for one subject are serialized on the ledger client's subject
//!   lane, held until the event is indexed.
//! - A confirmed ledger write is never compensated and always eventually
//!   mirrored (or the subject is halted on a gap).
//! - An access write is only submitted after the gate allows it under the
//!   lane, so a revoke cannot slip between check and submit.
//! - Submitted writes are never resubmitted; unresolved ones are parked.

mod attempt;
mod engine;
mod gate;
mod types;

pub use attempt::{
    AttemptEvent, AttemptState, CommitStatus, ReconciliationAttempt, TransitionError,
};
pub use engine::ReconciliationEngine;
pub use gate::{AccessDecision, AuthorizationGate, DenyReason};
pub use types::*;
