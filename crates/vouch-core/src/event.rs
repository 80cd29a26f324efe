//! The ledger event record and its canonical hashing.
//!
//! An [`Event`] is immutable once committed. The interceptor fills in the
//! call-derived fields; `seq`, `prev_hash`, `hash`, `sig`, and `key_id` are
//! assigned exclusively by the ledger worker at commit time.

use chrono::{DateTime, SubsecRound, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::canonical::{self, CanonicalError};

/// Size of an event hash in bytes (SHA-256).
pub const HASH_SIZE: usize = 32;

/// Maximum accepted `task_id` length in bytes.
pub const MAX_TASK_ID_LEN: usize = 64;

/// Sentinel `prev_hash` of the genesis event.
pub const GENESIS_PREV_HASH: [u8; HASH_SIZE] = [0u8; HASH_SIZE];

/// The kind of a ledger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// First event of a run; `params` carries the initial public key.
    Genesis,
    /// A forwarded tool invocation (params already redacted).
    ToolCall,
    /// The upstream reply to a tool invocation.
    ToolResponse,
    /// A call paused by policy pending human approval.
    Blocked,
    /// A stall resolved by an approver.
    Approval,
    /// A stall resolved by rejection, timeout, or client cancellation.
    Rejection,
    /// A signing key rotation, signed by the outgoing key.
    Rekey,
}

impl EventType {
    /// Stable string form used in the store and the signable encoding.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Genesis => "genesis",
            Self::ToolCall => "tool_call",
            Self::ToolResponse => "tool_response",
            Self::Blocked => "blocked",
            Self::Approval => "approval",
            Self::Rejection => "rejection",
            Self::Rekey => "rekey",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "genesis" => Some(Self::Genesis),
            "tool_call" => Some(Self::ToolCall),
            "tool_response" => Some(Self::ToolResponse),
            "blocked" => Some(Self::Blocked),
            "approval" => Some(Self::Approval),
            "rejection" => Some(Self::Rejection),
            "rekey" => Some(Self::Rekey),
            _ => None,
        }
    }
}

/// Lifecycle state of the task an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// The task is progressing normally.
    #[default]
    Working,
    /// The task is paused pending approval.
    Stalled,
    /// The task reported completion.
    Completed,
    /// The task reported failure.
    Failed,
}

impl TaskState {
    /// Stable string form used in the store and the signable encoding.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Stalled => "stalled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses the stable string form, defaulting unknown states to
    /// `Working`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "stalled" => Self::Stalled,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Working,
        }
    }
}

/// One signed, hash-chained record in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Dense per-run sequence number starting at 0 (genesis).
    pub seq: u64,
    /// Opaque 8-byte identifier, hex-encoded, unique within the run.
    pub id: String,
    /// Identifier of the enclosing run.
    pub run_id: String,
    /// UTC timestamp, millisecond precision.
    pub ts: DateTime<Utc>,
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Dotted JSON-RPC method name; empty for non-call events.
    pub method: String,
    /// Call parameters, already redacted where policy demands it.
    pub params: Value,
    /// Upstream result, only for `tool_response` events.
    pub response: Value,
    /// Task correlation key; empty when the call carries none.
    pub task_id: String,
    /// Task state at the time of the event.
    pub task_state: TaskState,
    /// `id` of the previous event for the same task, if any.
    pub parent_id: String,
    /// Matched policy rule identifier, if any.
    pub policy_id: String,
    /// Matched rule risk level, if any.
    pub risk_level: String,
    /// True iff the event records a stall outcome.
    pub was_blocked: bool,
    /// Hash of the previous committed event (all zero for genesis).
    pub prev_hash: Vec<u8>,
    /// SHA-256 over the canonical encoding of every field above.
    pub hash: Vec<u8>,
    /// Ed25519 signature over `hash` by the key active at commit time.
    pub sig: Vec<u8>,
    /// Short identifier of the signing key.
    pub key_id: String,
}

impl Event {
    /// Creates a draft event with a fresh random id and the current
    /// timestamp. Chain fields stay empty until the worker commits it.
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self {
            seq: 0,
            id: random_event_id(),
            run_id: String::new(),
            ts: Utc::now().trunc_subsecs(3),
            event_type,
            method: String::new(),
            params: Value::Null,
            response: Value::Null,
            task_id: String::new(),
            task_state: TaskState::Working,
            parent_id: String::new(),
            policy_id: String::new(),
            risk_level: String::new(),
            was_blocked: false,
            prev_hash: Vec::new(),
            hash: Vec::new(),
            sig: Vec::new(),
            key_id: String::new(),
        }
    }

    /// Sets the method name.
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Sets the params object.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Sets the task correlation fields.
    #[must_use]
    pub fn with_task(mut self, task_id: impl Into<String>, state: TaskState) -> Self {
        self.task_id = task_id.into();
        self.task_state = state;
        self
    }

    /// The JSON object covered by the event hash: every field except
    /// `hash` and `sig`.
    #[must_use]
    pub fn signable_value(&self) -> Value {
        json!({
            "seq": self.seq,
            "id": self.id,
            "run_id": self.run_id,
            "ts": self.ts.timestamp_millis(),
            "type": self.event_type.as_str(),
            "method": self.method,
            "params": self.params,
            "response": self.response,
            "task_id": self.task_id,
            "task_state": self.task_state.as_str(),
            "parent_id": self.parent_id,
            "policy_id": self.policy_id,
            "risk_level": self.risk_level,
            "was_blocked": self.was_blocked,
            "prev_hash": hex::encode(&self.prev_hash),
            "key_id": self.key_id,
        })
    }

    /// Recomputes the event hash from the signable encoding.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError`] if `params` or `response` cannot be
    /// canonicalized.
    pub fn compute_hash(&self) -> Result<Vec<u8>, CanonicalError> {
        let bytes = canonical::canonical_bytes(&self.signable_value())?;
        Ok(Sha256::digest(&bytes).to_vec())
    }
}

/// Generates an opaque 8-byte identifier, hex-encoded.
#[must_use]
pub fn random_event_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
