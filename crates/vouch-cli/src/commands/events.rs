//! `vouch events` - list recent ledger events.

use std::path::Path;

use anyhow::{Context, Result};

pub fn run(db: &Path, limit: u64) -> Result<()> {
    let Some((store, run_id)) = super::open_run(db)? else {
        println!("No runs found in database");
        return Ok(());
    };

    let events = store
        .recent_events(&run_id, limit)
        .context("failed to read events")?;

    println!("Recent Events (showing {})", events.len());
    println!("===========================");
    for event in &events {
        println!(
            "[{}] {} | {} | {}",
            event.seq,
            &event.id[..8.min(event.id.len())],
            event.event_type.as_str(),
            event.method,
        );
        if event.was_blocked {
            println!("    BLOCKED");
        }
    }
    Ok(())
}
