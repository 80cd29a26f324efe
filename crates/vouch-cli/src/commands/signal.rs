//! `vouch approve` / `vouch reject` - resolve a stalled action through the
//! proxy's control API.

use anyhow::{bail, Context, Result};

pub async fn run(control: &str, event_id: &str, approve: bool) -> Result<()> {
    let verb = if approve { "approve" } else { "reject" };
    let url = format!("{}/api/{verb}/{event_id}", control.trim_end_matches('/'));

    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach control API at {url}"))?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match status.as_u16() {
        200 => {
            print!("{body}");
            Ok(())
        },
        404 => bail!("event {event_id} not found or already processed"),
        409 => bail!("event {event_id} was already signaled"),
        _ => bail!("control API returned {status}: {body}"),
    }
}
