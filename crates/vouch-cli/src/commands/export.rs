//! `vouch export` - write a forensic bundle.
//!
//! The bundle holds everything an auditor needs to re-check the chain
//! offline: the full ordered event dump (`events.jsonl`), the run
//! metadata with its key ranges (`run.json`), and the verification report
//! produced at export time (`report.json`).

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use vouch_core::event::Event;
use vouch_core::verify_run;

pub fn run(db: &Path, out_dir: &Path) -> Result<()> {
    let Some((store, run_id)) = super::open_run(db)? else {
        println!("No runs found in database");
        return Ok(());
    };

    let report = verify_run(&store, &run_id).context("verification error")?;
    if !report.valid {
        println!(
            "[WARN] exporting an invalid chain (failed at seq {:?})",
            report.failed_at_seq
        );
    }

    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    // events.jsonl: one canonical-shaped object per line, hashes in hex.
    let events_path = out_dir.join("events.jsonl");
    let mut events_file = fs::File::create(&events_path)
        .with_context(|| format!("failed to create {}", events_path.display()))?;
    let mut cursor = 0u64;
    let mut exported = 0u64;
    loop {
        let chunk = store
            .range(&run_id, cursor, u64::MAX >> 1, 256)
            .context("failed to read events")?;
        if chunk.is_empty() {
            break;
        }
        cursor = chunk.last().map_or(cursor, |e| e.seq + 1);
        for event in &chunk {
            serde_json::to_writer(&mut events_file, &export_event(event))?;
            events_file.write_all(b"\n")?;
            exported += 1;
        }
    }

    // run.json: run metadata plus the key-range table.
    let run = store
        .get_run(&run_id)
        .context("failed to read run")?
        .context("run metadata missing")?;
    let ranges: Vec<Value> = store
        .key_ranges(&run_id)
        .context("failed to read key ranges")?
        .iter()
        .map(|r| {
            json!({
                "seq_first": r.seq_first,
                "seq_last": r.seq_last,
                "public_key": r.public_key,
            })
        })
        .collect();
    let run_json = json!({
        "run_id": run.run_id,
        "agent": run.agent,
        "genesis_hash": hex::encode(&run.genesis_hash),
        "created_at": run.created_at.to_rfc3339(),
        "key_ranges": ranges,
    });
    fs::write(
        out_dir.join("run.json"),
        serde_json::to_string_pretty(&run_json)?,
    )?;

    // report.json: the verification result backing this bundle.
    let report_json = json!({
        "valid": report.valid,
        "total_events": report.total_events,
        "failed_at_seq": report.failed_at_seq,
        "reason": report.reason.map(|r| r.as_str()),
    });
    fs::write(
        out_dir.join("report.json"),
        serde_json::to_string_pretty(&report_json)?,
    )?;

    println!(
        "Exported {} events to {} (chain {})",
        exported,
        out_dir.display(),
        if report.valid { "valid" } else { "INVALID" },
    );
    Ok(())
}

/// The exported form of an event: the signed content plus hex hash and
/// signature.
fn export_event(event: &Event) -> Value {
    let mut value = event.signable_value();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("hash".to_string(), json!(hex::encode(&event.hash)));
        obj.insert("sig".to_string(), json!(hex::encode(&event.sig)));
    }
    value
}
