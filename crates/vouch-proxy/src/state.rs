//! Shared daemon state.
//!
//! Everything a request handler touches hangs off [`ProxyState`]; the
//! singletons (worker, signer, policy) are injected here at startup rather
//! than reached through globals.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;
use vouch_core::event::EventType;
use vouch_core::gateway::ApprovalGateway;
use vouch_core::policy::PolicyHandle;
use vouch_core::store::Store;
use vouch_core::worker::LedgerWorker;
use vouch_core::TaskState;

/// State shared by the interceptor and the control API.
pub struct ProxyState {
    /// The single-writer ledger worker.
    pub worker: LedgerWorker,
    /// Pending stall registry.
    pub gateway: ApprovalGateway,
    /// Swappable compiled policy.
    pub policy: PolicyHandle,
    /// Read handle on the ledger store (task failure counts, recovery).
    pub store: Store,
    /// Upstream HTTP client.
    pub upstream: reqwest::Client,
    /// Upstream base URL.
    pub upstream_url: String,
    /// task_id -> current state.
    pub active_tasks: DashMap<String, TaskState>,
    /// task_id -> id of the task's most recent event.
    pub last_event_by_task: DashMap<String, String>,
    /// Optional stall deadline.
    pub stall_timeout: Option<Duration>,
}

/// Cheaply cloneable handle on the daemon state.
pub type SharedState = Arc<ProxyState>;

impl ProxyState {
    /// Rebuilds the in-memory task maps from the committed events of the
    /// current run.
    ///
    /// # Errors
    ///
    /// Returns a store error if the scan fails.
    pub fn recover_tasks(&self) -> Result<(), vouch_core::store::StoreError> {
        let run_id = self.worker.run_id();
        let mut cursor = 0u64;
        let mut recovered = 0usize;
        loop {
            let chunk = self.store.range(run_id, cursor, u64::MAX >> 1, 256)?;
            if chunk.is_empty() {
                break;
            }
            cursor = chunk.last().map_or(cursor, |e| e.seq + 1);
            for event in chunk {
                if event.task_id.is_empty() {
                    continue;
                }
                self.active_tasks
                    .insert(event.task_id.clone(), event.task_state);
                if matches!(event.event_type, EventType::ToolCall) {
                    self.last_event_by_task.insert(event.task_id, event.id);
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!(tasks = recovered, "recovered task hierarchy from ledger");
        }
        Ok(())
    }
}
