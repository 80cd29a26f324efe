//! Chain verification: a full replay of hash and signature checks.
//!
//! The verifier is read-only and may run while the ledger worker writes.
//! It pins the head sequence observed at scan start, so events appended
//! mid-scan are simply outside this verification.

use thiserror::Error;

use crate::canonical::CanonicalError;
use crate::crypto::Signer;
use crate::event::GENESIS_PREV_HASH;
use crate::store::{KeyRange, Store, StoreError};

/// Events fetched per store round-trip during the scan.
const SCAN_CHUNK: u64 = 256;

/// Which invariant a failing event violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailure {
    /// Recomputed content hash differs from the stored hash.
    Hash,
    /// `prev_hash` does not equal the previous event's hash.
    PrevHash,
    /// The signature does not verify under the key covering the seq.
    Signature,
    /// Sequence numbers are not dense from 0.
    SeqGap,
}

impl VerifyFailure {
    /// Stable lowercase name used in reports and CLI output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hash => "hash",
            Self::PrevHash => "prev_hash",
            Self::Signature => "signature",
            Self::SeqGap => "seq_gap",
        }
    }
}

/// Result of a chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// True iff every event up to the pinned head verified.
    pub valid: bool,
    /// Number of events checked.
    pub total_events: u64,
    /// Sequence of the earliest failing event, when invalid.
    pub failed_at_seq: Option<u64>,
    /// Violated invariant, when invalid.
    pub reason: Option<VerifyFailure>,
}

impl VerifyReport {
    fn ok(total_events: u64) -> Self {
        Self {
            valid: true,
            total_events,
            failed_at_seq: None,
            reason: None,
        }
    }

    fn failed(seq: u64, reason: VerifyFailure) -> Self {
        Self {
            valid: false,
            total_events: 0,
            failed_at_seq: Some(seq),
            reason: Some(reason),
        }
    }
}

/// Errors preventing verification from running at all (distinct from an
/// invalid chain, which is reported in [`VerifyReport`]).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerifyError {
    /// The store could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored public key is not valid hex.
    #[error("invalid public key in key range starting at seq {seq_first}: {reason}")]
    BadKey {
        /// First sequence of the offending range.
        seq_first: u64,
        /// Decode failure description.
        reason: String,
    },

    /// An event could not be re-canonicalized.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// The run has no key ranges to verify against.
    #[error("run {run_id} has no key ranges")]
    NoKeyRanges {
        /// The run missing key material.
        run_id: String,
    },
}

/// Verifies the full chain of a run: hash recomputation, `prev_hash`
/// links, sequence density, and per-event signatures under the run's
/// key-range table.
///
/// # Errors
///
/// Returns [`VerifyError`] for I/O and key-material problems. Chain
/// violations are not errors; they come back as an invalid
/// [`VerifyReport`] naming the earliest failing seq.
pub fn verify_run(store: &Store, run_id: &str) -> Result<VerifyReport, VerifyError> {
    let ranges = store.key_ranges(run_id)?;
    if ranges.is_empty() {
        return Err(VerifyError::NoKeyRanges {
            run_id: run_id.to_string(),
        });
    }
    let keys = decode_range_keys(&ranges)?;

    // Pin the scan at the head observed now; later appends are out of
    // scope for this verification.
    let Some(head) = store.last_event(run_id)? else {
        return Ok(VerifyReport::ok(0));
    };
    let head_seq = head.seq;

    let mut expected_seq: u64 = 0;
    let mut prev_hash = GENESIS_PREV_HASH.to_vec();
    let mut checked: u64 = 0;

    let mut cursor = 0u64;
    while cursor <= head_seq {
        let chunk = store.range(run_id, cursor, head_seq, SCAN_CHUNK)?;
        if chunk.is_empty() {
            // The store has fewer events than the head promised.
            return Ok(VerifyReport::failed(expected_seq, VerifyFailure::SeqGap));
        }

        for event in &chunk {
            if event.seq != expected_seq {
                return Ok(VerifyReport::failed(expected_seq, VerifyFailure::SeqGap));
            }

            let recomputed = event.compute_hash()?;
            if recomputed != event.hash {
                return Ok(VerifyReport::failed(event.seq, VerifyFailure::Hash));
            }

            if event.prev_hash != prev_hash {
                return Ok(VerifyReport::failed(event.seq, VerifyFailure::PrevHash));
            }

            let Some(public_key) = key_for_seq(&ranges, &keys, event.seq) else {
                return Ok(VerifyReport::failed(event.seq, VerifyFailure::Signature));
            };
            if !Signer::verify(public_key, &recomputed, &event.sig) {
                return Ok(VerifyReport::failed(event.seq, VerifyFailure::Signature));
            }

            prev_hash = event.hash.clone();
            expected_seq += 1;
            checked += 1;
        }

        cursor = expected_seq;
    }

    Ok(VerifyReport::ok(checked))
}

fn decode_range_keys(ranges: &[KeyRange]) -> Result<Vec<Vec<u8>>, VerifyError> {
    ranges
        .iter()
        .map(|range| {
            hex::decode(&range.public_key).map_err(|e| VerifyError::BadKey {
                seq_first: range.seq_first,
                reason: e.to_string(),
            })
        })
        .collect()
}

fn key_for_seq<'a>(ranges: &[KeyRange], keys: &'a [Vec<u8>], seq: u64) -> Option<&'a [u8]> {
    ranges
        .iter()
        .position(|range| range.covers(seq))
        .map(|idx| keys[idx].as_slice())
}
