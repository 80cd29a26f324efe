//! Policy evaluation for intercepted tool calls.
//!
//! A policy is an ordered list of rules loaded from YAML. Each rule names
//! the methods it matches (single-token globs over dotted names), an action
//! (`allow` or `stall`), an informational risk level, parameter keys to
//! redact, and an optional conjunction of parameter conditions.
//!
//! Evaluation picks the most specific matching rule: an exact method match
//! beats a prefix glob, which beats a bare `*`; declaration order breaks
//! ties. If nothing matches the default is allow with no redaction.
//!
//! The compiled policy sits behind a swappable handle so the proxy can
//! reload it on SIGHUP without pausing traffic.

use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Placeholder written over redacted parameter values.
pub const REDACTED: &str = "[REDACTED]";

/// Errors that can occur while loading a policy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// The policy file could not be read.
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),

    /// The policy file is not valid YAML of the expected shape.
    #[error("failed to parse policy: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// What to do with a matched call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Forward the call after committing it to the ledger.
    #[default]
    Allow,
    /// Pause the call pending human approval.
    Stall,
}

/// A single condition over the call parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Parameter key the condition inspects.
    pub key: String,
    /// Comparison operator.
    pub op: ConditionOp,
    /// Right-hand value.
    pub value: Value,
}

/// Supported condition operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    /// Equal.
    Eq,
    /// Not equal.
    Neq,
    /// Member of the rule's array value.
    In,
    /// Numerically greater than.
    Gt,
    /// Numerically less than.
    Lt,
    /// String contains substring, or array contains value.
    Contains,
}

/// One policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Rule identifier, recorded on matched events.
    pub id: String,
    /// Method patterns: exact names, `prefix.*` globs, or `*`.
    pub match_methods: Vec<String>,
    /// Action taken on match.
    #[serde(default)]
    pub action: Action,
    /// Informational risk level, recorded on matched events.
    #[serde(default)]
    pub risk_level: String,
    /// Parameter keys replaced with [`REDACTED`] before commit.
    #[serde(default)]
    pub redact: Vec<String>,
    /// Conjunction of parameter conditions; all must hold.
    #[serde(default)]
    pub conditions: Option<Vec<Condition>>,
}

/// An ordered policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Document version string.
    #[serde(default)]
    pub version: String,
    /// Rules in declaration order.
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}

impl PolicyConfig {
    /// Parses a policy from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Parse`] on malformed YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, PolicyError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Loads a policy from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Evaluates a call against the policy.
    ///
    /// Scans rules in declaration order and returns the most specific
    /// match whose conditions hold (exact > prefix > `*`; earlier rules
    /// win ties). Returns `None` when no rule matches, which callers treat
    /// as allow with no redaction.
    #[must_use]
    pub fn decide(&self, method: &str, params: &Value) -> Option<&PolicyRule> {
        let mut best: Option<(MatchKind, &PolicyRule)> = None;

        for rule in &self.policies {
            let Some(kind) = rule
                .match_methods
                .iter()
                .filter_map(|pattern| match_method(pattern, method))
                .max()
            else {
                continue;
            };
            if !conditions_hold(rule.conditions.as_deref(), params) {
                continue;
            }
            if best.map_or(true, |(prev, _)| kind > prev) {
                best = Some((kind, rule));
            }
        }

        best.map(|(_, rule)| rule)
    }
}

/// Specificity of a pattern match, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchKind {
    Wildcard,
    Prefix,
    Exact,
}

/// Matches a single-token glob against a dotted method name.
///
/// Supported forms: the bare `*` wildcard, `prefix*` (commonly written
/// `ns.*`), and exact names. No regex.
fn match_method(pattern: &str, method: &str) -> Option<MatchKind> {
    if pattern == "*" {
        return Some(MatchKind::Wildcard);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return method.starts_with(prefix).then_some(MatchKind::Prefix);
    }
    (pattern == method).then_some(MatchKind::Exact)
}

fn conditions_hold(conditions: Option<&[Condition]>, params: &Value) -> bool {
    let Some(conditions) = conditions else {
        return true;
    };
    conditions.iter().all(|c| condition_holds(c, params))
}

fn condition_holds(condition: &Condition, params: &Value) -> bool {
    let Some(actual) = params.get(&condition.key) else {
        return false;
    };

    match condition.op {
        ConditionOp::Eq => json_eq(actual, &condition.value),
        ConditionOp::Neq => !json_eq(actual, &condition.value),
        ConditionOp::In => condition
            .value
            .as_array()
            .map_or(false, |arr| arr.iter().any(|v| json_eq(actual, v))),
        ConditionOp::Gt => match (actual.as_f64(), condition.value.as_f64()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConditionOp::Lt => match (actual.as_f64(), condition.value.as_f64()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        ConditionOp::Contains => match actual {
            Value::String(s) => condition
                .value
                .as_str()
                .map_or(false, |needle| s.contains(needle)),
            Value::Array(arr) => arr.iter().any(|v| json_eq(v, &condition.value)),
            _ => false,
        },
    }
}

/// Value equality with numeric coercion, so `2` and `2.0` compare equal.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Replaces the listed keys in a params object with [`REDACTED`].
///
/// Non-object params and keys that are absent pass through untouched.
#[must_use]
pub fn redact_params(params: &Value, keys: &[String]) -> Value {
    let Value::Object(map) = params else {
        return params.clone();
    };
    let mut redacted = map.clone();
    for key in keys {
        if let Some(slot) = redacted.get_mut(key) {
            *slot = Value::String(REDACTED.to_string());
        }
    }
    Value::Object(redacted)
}

/// A compiled policy behind an atomically swappable pointer.
///
/// Readers take a cheap snapshot per request; `swap` installs a reloaded
/// policy for all subsequent requests.
pub struct PolicyHandle {
    inner: RwLock<Arc<PolicyConfig>>,
}

impl PolicyHandle {
    /// Wraps an initial policy.
    #[must_use]
    pub fn new(policy: PolicyConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(policy)),
        }
    }

    /// Snapshot of the current policy.
    #[must_use]
    pub fn load(&self) -> Arc<PolicyConfig> {
        Arc::clone(&self.inner.read().expect("policy lock poisoned"))
    }

    /// Installs a new policy for subsequent requests.
    pub fn swap(&self, policy: PolicyConfig) {
        *self.inner.write().expect("policy lock poisoned") = Arc::new(policy);
    }
}
