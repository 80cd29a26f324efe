//! CLI command implementations.

pub mod events;
pub mod export;
pub mod rekey;
pub mod signal;
pub mod status;
pub mod verify;

use std::path::Path;

use anyhow::{Context, Result};
use vouch_core::Store;

/// Opens the ledger read-only and resolves the current run id.
///
/// Returns `Ok(None)` when the store holds no runs yet.
pub(crate) fn open_run(db: &Path) -> Result<Option<(Store, String)>> {
    let store = Store::open_read_only(db)
        .with_context(|| format!("failed to open ledger at {}", db.display()))?;
    let Some(run_id) = store.get_run_id().context("failed to read run metadata")? else {
        return Ok(None);
    };
    Ok(Some((store, run_id)))
}
