//! `vouch status` - current run information.

use std::path::Path;

use anyhow::{Context, Result};

pub fn run(db: &Path) -> Result<()> {
    let Some((store, run_id)) = super::open_run(db)? else {
        println!("No runs found in database");
        return Ok(());
    };

    let run = store
        .get_run(&run_id)
        .context("failed to read run")?
        .context("run metadata missing")?;
    let head = store
        .last_event(&run_id)
        .context("failed to read chain head")?;
    let ranges = store
        .key_ranges(&run_id)
        .context("failed to read key ranges")?;
    let active_key = ranges
        .iter()
        .find(|r| r.seq_last.is_none())
        .map_or("<none>", |r| r.public_key.as_str());

    println!("Current Run Status");
    println!("==================");
    println!("Run ID:       {}", &run_id[..8.min(run_id.len())]);
    println!("Agent:        {}", run.agent);
    println!("Genesis Hash: {}...", &hex::encode(&run.genesis_hash)[..16]);
    println!("Public Key:   {}...", &active_key[..32.min(active_key.len())]);
    println!("Head Seq:     {}", head.map_or(0, |e| e.seq));
    println!("Key Ranges:   {}", ranges.len());
    Ok(())
}
