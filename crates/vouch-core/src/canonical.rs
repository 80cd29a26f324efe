//! Canonical JSON serialization for hashing and signing.
//!
//! Produces a deterministic byte encoding of a JSON value following
//! RFC 8785 (JCS - JSON Canonicalization Scheme): object keys sorted by
//! UTF-16 code units, no insignificant whitespace, minimal string escaping,
//! and numbers serialized by their shortest round-trip representation as
//! IEEE-754 doubles (integers below 2^53 emitted without a fraction).
//!
//! Two semantically equal values always canonicalize to identical bytes,
//! which is what makes the ledger's hashes and signatures reproducible by
//! an independent verifier.
//!
//! # Example
//!
//! ```
//! use vouch_core::canonical::to_canonical_string;
//!
//! let value = serde_json::json!({ "z": 1, "a": 2 });
//! assert_eq!(to_canonical_string(&value).unwrap(), r#"{"a":2,"z":1}"#);
//! ```

use std::fmt::Write as _;

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Largest double that still represents every integer exactly (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Maximum nesting depth accepted during canonicalization.
///
/// Deeper than anything `serde_json` will parse (its recursion limit is
/// 128), so any value that made it through parsing canonicalizes.
pub const MAX_DEPTH: usize = 256;

/// Errors that can occur during canonicalization.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// A number has no finite IEEE-754 double representation.
    #[error("invalid value: number is not a finite IEEE-754 double")]
    InvalidValue,

    /// The value is nested deeper than [`MAX_DEPTH`] levels.
    #[error("max depth exceeded: JSON nested deeper than {max_depth} levels")]
    MaxDepthExceeded {
        /// The depth limit that was exceeded.
        max_depth: usize,
    },
}

/// Canonicalizes a JSON value into its JCS string form.
///
/// # Errors
///
/// Returns [`CanonicalError::InvalidValue`] for non-finite numbers and
/// [`CanonicalError::MaxDepthExceeded`] for structures nested deeper than
/// [`MAX_DEPTH`] levels.
pub fn to_canonical_string(value: &Value) -> Result<String, CanonicalError> {
    let mut output = String::new();
    emit_value(value, &mut output, 0)?;
    Ok(output)
}

/// Canonicalizes a JSON value into bytes, the form fed to SHA-256.
///
/// # Errors
///
/// Same conditions as [`to_canonical_string`].
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    to_canonical_string(value).map(String::into_bytes)
}

fn emit_value(value: &Value, output: &mut String, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }

    match value {
        Value::Null => {
            output.push_str("null");
            Ok(())
        },
        Value::Bool(b) => {
            output.push_str(if *b { "true" } else { "false" });
            Ok(())
        },
        Value::Number(n) => emit_number(n, output),
        Value::String(s) => {
            emit_string(s, output);
            Ok(())
        },
        Value::Array(arr) => {
            output.push('[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                emit_value(item, output, depth + 1)?;
            }
            output.push(']');
            Ok(())
        },
        Value::Object(obj) => emit_object(obj, output, depth),
    }
}

/// Emits a number per RFC 8785 Section 3.2.2.3.
///
/// Integer-valued doubles below 2^53 print as plain decimals; everything
/// else uses the shortest representation that round-trips through an
/// IEEE-754 double.
fn emit_number(n: &Number, output: &mut String) -> Result<(), CanonicalError> {
    if let Some(i) = n.as_i64() {
        let _ = write!(output, "{i}");
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        let _ = write!(output, "{u}");
        return Ok(());
    }

    let f = n.as_f64().ok_or(CanonicalError::InvalidValue)?;
    if !f.is_finite() {
        return Err(CanonicalError::InvalidValue);
    }

    if f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER {
        // -0.0 truncates to 0 here, matching ECMAScript's "0".
        #[allow(clippy::cast_possible_truncation)]
        let _ = write!(output, "{}", f as i64);
    } else {
        // serde_json formats floats with ryu, which yields the shortest
        // round-trip decimal form.
        let _ = write!(output, "{n}");
    }
    Ok(())
}

/// Emits a string with minimal escaping per RFC 8785 Section 3.2.2.2.
///
/// Only `"` and `\` and the control characters U+0000..U+001F are escaped;
/// short escapes are used where JSON defines them.
fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            },
            c => output.push(c),
        }
    }
    output.push('"');
}

/// Emits an object with keys sorted by UTF-16 code units.
fn emit_object(
    obj: &Map<String, Value>,
    output: &mut String,
    depth: usize,
) -> Result<(), CanonicalError> {
    let mut sorted_keys: Vec<&String> = obj.keys().collect();
    sorted_keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

    output.push('{');
    for (i, key) in sorted_keys.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(&obj[*key], output, depth + 1)?;
    }
    output.push('}');
    Ok(())
}
