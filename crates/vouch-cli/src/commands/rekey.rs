//! `vouch rekey` - rotate the proxy's signing key.

use anyhow::{bail, Context, Result};
use serde_json::Value;

pub async fn run(control: &str) -> Result<()> {
    let url = format!("{}/api/rekey", control.trim_end_matches('/'));

    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach control API at {url}"))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("key rotation failed ({status}): {body}");
    }

    let keys: Value = response
        .json()
        .await
        .context("control API returned an unreadable rekey response")?;
    println!("Key rotated successfully");
    println!(
        "Old: {}",
        keys["old_public_key"].as_str().unwrap_or("<unknown>")
    );
    println!(
        "New: {}",
        keys["new_public_key"].as_str().unwrap_or("<unknown>")
    );
    Ok(())
}
