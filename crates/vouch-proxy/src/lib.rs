//! vouch-proxy - the interception proxy daemon.
//!
//! Sits on the wire between an agent and its tools, inspects every
//! JSON-RPC call, evaluates it against policy, optionally stalls pending
//! human approval, and commits a signed record of the interaction to the
//! append-only ledger before forwarding. A localhost control API resolves
//! stalls and rotates the signing key.

#![warn(clippy::all)]

pub mod config;
pub mod control;
pub mod interceptor;
pub mod state;
