//! The single-writer ledger worker.
//!
//! All components submit events through a bounded FIFO queue; one dedicated
//! thread assigns `seq`, `prev_hash`, `hash`, `sig`, and `key_id`, then
//! performs the atomic insert. Single-writer plus FIFO is what makes the
//! queue-acceptance order the canonical total order of the ledger.
//!
//! Any durable-write failure flips the worker to Unhealthy. The flag is
//! sticky: subsequent events are dropped and every caller that checks
//! [`LedgerWorker::is_healthy`] must fail closed until an operator
//! restarts the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::Utc;
use rand::RngCore;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::canonical::CanonicalError;
use crate::crypto::{KeyError, Signer};
use crate::event::{Event, EventType, GENESIS_PREV_HASH};
use crate::store::{Run, Store, StoreError};

/// Default bound of the event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Errors surfaced by the worker's public API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The bounded queue is full; callers must fail closed.
    #[error("ledger queue is full")]
    QueueFull,

    /// The worker is draining or stopped and accepts no more work.
    #[error("ledger worker is shutting down")]
    ShuttingDown,

    /// The worker flagged itself Unhealthy after a durable-write failure.
    #[error("ledger worker is unhealthy")]
    Unhealthy,

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A key operation failed.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Event content could not be canonicalized.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// Worker construction parameters.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bound of the event queue.
    pub queue_capacity: usize,
    /// Agent label recorded in the run metadata.
    pub agent: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            agent: "agent".to_string(),
        }
    }
}

enum Msg {
    Event(Box<Event>),
    Rekey(oneshot::Sender<Result<(String, String), WorkerError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the running ledger worker.
pub struct LedgerWorker {
    tx: mpsc::Sender<Msg>,
    healthy: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    run_id: String,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LedgerWorker {
    /// Resolves the chain head (creating the run and genesis event on an
    /// empty store) and starts the commit thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain head cannot be resolved or the
    /// genesis event cannot be committed.
    pub fn start(store: Store, signer: Signer, config: WorkerConfig) -> Result<Self, WorkerError> {
        let mut state = CommitState::resolve(store, signer, &config.agent)?;
        info!(
            run_id = %state.run_id,
            next_seq = state.next_seq,
            key_id = %state.signer.key_id(),
            "ledger worker starting"
        );

        let healthy = Arc::new(AtomicBool::new(true));
        let accepting = Arc::new(AtomicBool::new(true));
        let run_id = state.run_id.clone();
        let (tx, mut rx) = mpsc::channel(config.queue_capacity.max(1));

        let thread_healthy = Arc::clone(&healthy);
        let handle = std::thread::Builder::new()
            .name("vouch-ledger".to_string())
            .spawn(move || {
                while let Some(msg) = rx.blocking_recv() {
                    match msg {
                        Msg::Event(event) => {
                            if !thread_healthy.load(Ordering::Acquire) {
                                warn!(event_id = %event.id, "dropping event: ledger unhealthy");
                                continue;
                            }
                            if let Err(e) = state.commit(*event) {
                                error!(error = %e, "ledger append failed; flagging unhealthy");
                                thread_healthy.store(false, Ordering::Release);
                            }
                        },
                        Msg::Rekey(reply) => {
                            if !thread_healthy.load(Ordering::Acquire) {
                                let _ = reply.send(Err(WorkerError::Unhealthy));
                                continue;
                            }
                            let result = state.rekey();
                            if let Err(e) = &result {
                                error!(error = %e, "key rotation failed; flagging unhealthy");
                                thread_healthy.store(false, Ordering::Release);
                            }
                            let _ = reply.send(result);
                        },
                        Msg::Shutdown(reply) => {
                            let _ = reply.send(());
                            break;
                        },
                    }
                }
            })
            .expect("failed to spawn ledger worker thread");

        Ok(Self {
            tx,
            healthy,
            accepting,
            run_id,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Identifier of the run this worker writes to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Snapshot of the health flag. Once false it stays false.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Enqueues an event for commit.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::QueueFull`] when the bounded queue is full
    /// and [`WorkerError::ShuttingDown`] after shutdown began. Both are
    /// fail-closed conditions for the caller.
    pub fn submit(&self, event: Event) -> Result<(), WorkerError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(WorkerError::ShuttingDown);
        }
        self.tx
            .try_send(Msg::Event(Box::new(event)))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WorkerError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => WorkerError::ShuttingDown,
            })
    }

    /// Requests a key rotation and waits for it to commit.
    ///
    /// The rotation happens in the commit loop: a `rekey` event is written
    /// under the outgoing key, the key range is closed, and the new key
    /// takes over from the next sequence number. Returns the old and new
    /// public keys as hex.
    ///
    /// # Errors
    ///
    /// Returns queue errors like [`LedgerWorker::submit`], or the
    /// rotation failure reported by the commit loop.
    pub async fn rotate_key(&self) -> Result<(String, String), WorkerError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(WorkerError::ShuttingDown);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(Msg::Rekey(reply_tx))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WorkerError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => WorkerError::ShuttingDown,
            })?;
        reply_rx.await.map_err(|_| WorkerError::ShuttingDown)?
    }

    /// Drain-then-stop shutdown: stops accepting submissions, commits the
    /// queued events, then joins the commit thread.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Msg::Shutdown(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }

        let handle = self.handle.lock().expect("worker lock poisoned").take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        info!("ledger worker stopped");
    }
}

/// Chain-head state owned by the commit thread.
struct CommitState {
    store: Store,
    signer: Signer,
    run_id: String,
    next_seq: u64,
    prev_hash: Vec<u8>,
}

impl CommitState {
    /// Reads the chain head, committing genesis and creating the run when
    /// the store is empty or has no run metadata.
    fn resolve(store: Store, signer: Signer, agent: &str) -> Result<Self, WorkerError> {
        if let Some(run_id) = store.get_run_id()? {
            if let Some(last) = store.last_event(&run_id)? {
                let open_key = store
                    .key_ranges(&run_id)?
                    .into_iter()
                    .find(|r| r.seq_last.is_none());
                match open_key {
                    Some(range) if range.public_key == signer.public_key_hex() => {},
                    Some(range) => warn!(
                        ledger_key = %range.public_key,
                        active_key = %signer.public_key_hex(),
                        "key file does not match the open key range; \
                         verification of new events will fail"
                    ),
                    None => warn!(run_id = %run_id, "run has no open key range"),
                }

                return Ok(Self {
                    store,
                    signer,
                    run_id,
                    next_seq: last.seq + 1,
                    prev_hash: last.hash,
                });
            }
        }

        let mut run_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut run_bytes);
        let run_id = hex::encode(run_bytes);
        let public_key = signer.public_key_hex();

        let mut state = Self {
            store,
            signer,
            run_id: run_id.clone(),
            next_seq: 0,
            prev_hash: GENESIS_PREV_HASH.to_vec(),
        };

        let genesis = Event::new(EventType::Genesis)
            .with_params(json!({ "public_key": public_key }));
        state.commit(genesis)?;

        state.store.put_run(&Run {
            run_id: run_id.clone(),
            agent: agent.to_string(),
            genesis_hash: state.prev_hash.clone(),
            created_at: Utc::now(),
        })?;
        state.store.append_key_range(&run_id, 0, &public_key)?;
        info!(run_id = %run_id, "created run and committed genesis event");

        Ok(state)
    }

    /// Assigns the chain fields, signs, and durably appends one event.
    fn commit(&mut self, mut event: Event) -> Result<(), WorkerError> {
        event.seq = self.next_seq;
        event.run_id = self.run_id.clone();
        event.prev_hash = self.prev_hash.clone();
        event.key_id = self.signer.key_id();
        event.hash = event.compute_hash()?;
        event.sig = self.signer.sign(&event.hash).to_vec();

        self.store.append_event(&event)?;

        self.next_seq += 1;
        self.prev_hash = event.hash;
        Ok(())
    }

    /// Commits a `rekey` event under the outgoing key, then activates the
    /// incoming key and opens its range at the next sequence number.
    fn rekey(&mut self) -> Result<(String, String), WorkerError> {
        let pending = self.signer.begin_rotation();
        let old_public = self.signer.public_key_hex();
        let new_public = pending.new_public_key_hex();

        let event = Event::new(EventType::Rekey).with_params(json!({
            "old_public_key": old_public,
            "new_public_key": new_public,
        }));
        self.commit(event)?;
        let rekey_seq = self.next_seq - 1;

        self.signer.commit_rotation(pending)?;
        self.store
            .append_key_range(&self.run_id, rekey_seq + 1, &new_public)?;

        info!(
            seq = rekey_seq,
            old_key = %old_public,
            new_key = %new_public,
            "signing key rotated"
        );
        Ok((old_public, new_public))
    }
}
