//! # vouch-core
//!
//! Core library for vouch, a safety-critical interception proxy for
//! AI-agent tool traffic.
//!
//! This crate provides the building blocks shared by the proxy daemon and
//! the CLI:
//!
//! - **Canonicalization**: deterministic RFC 8785 (JCS) JSON encoding used
//!   as the input to hashing and signing
//! - **Signing**: Ed25519 key management with atomic on-disk rotation
//! - **Ledger**: an append-only, hash-chained, per-event-signed store with
//!   a single-writer worker in front of it
//! - **Policy**: declarative rule evaluation deciding allow / stall /
//!   redact for each intercepted call
//! - **Approvals**: correlation of out-of-band approve/reject signals with
//!   stalled requests
//! - **Verification**: full chain replay with multi-key awareness across
//!   rotations

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod canonical;
pub mod crypto;
pub mod event;
pub mod gateway;
pub mod policy;
pub mod store;
pub mod verify;
pub mod worker;

pub use crypto::Signer;
pub use event::{Event, EventType, TaskState};
pub use gateway::ApprovalGateway;
pub use policy::{PolicyConfig, PolicyHandle};
pub use store::Store;
pub use verify::{VerifyReport, verify_run};
pub use worker::LedgerWorker;
