//! `vouch verify` - full hash chain and signature replay.
//!
//! Exit codes: 0 valid, 1 invalid chain, 2 I/O or key error.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use vouch_core::verify_run;

pub fn run(db: &Path) -> Result<ExitCode> {
    let Some((store, run_id)) = super::open_run(db)? else {
        println!("No runs found in database");
        return Ok(ExitCode::SUCCESS);
    };

    println!("Verifying chain for run: {}", &run_id[..8.min(run_id.len())]);

    let report = verify_run(&store, &run_id).context("verification error")?;

    if report.valid {
        println!("[OK] Chain is valid ({} events verified)", report.total_events);
        Ok(ExitCode::SUCCESS)
    } else {
        println!("[FAILED] Chain verification failed");
        if let Some(reason) = report.reason {
            println!("  Reason: {}", reason.as_str());
        }
        if let Some(seq) = report.failed_at_seq {
            println!("  Failed at sequence: {seq}");
        }
        Ok(ExitCode::from(1))
    }
}
