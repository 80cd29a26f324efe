//! Correlation of out-of-band approval signals with waiting stalls.
//!
//! The interceptor registers a pending stall under its event id before it
//! blocks; the control API signals the outcome. Signals are single-use:
//! the first one wins, a second attempt on the same id reports
//! `AlreadySignaled`, and ids are forgotten once the waiter resolves.
//!
//! Raw channels never cross this module's boundary.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

/// Errors from registering or signaling a stall.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GatewayError {
    /// The event id is already registered.
    #[error("duplicate event id: {event_id}")]
    DuplicateEvent {
        /// The colliding event id.
        event_id: String,
    },

    /// The event id is not registered (never was, or already resolved).
    #[error("unknown event id: {event_id}")]
    UnknownEvent {
        /// The unrecognized event id.
        event_id: String,
    },

    /// The stall was already signaled and awaits pickup by its waiter.
    #[error("event already signaled: {event_id}")]
    AlreadySignaled {
        /// The already-signaled event id.
        event_id: String,
    },
}

/// Outcome of waiting on a stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallOutcome {
    /// An approver allowed the call.
    Approved,
    /// An approver rejected the call.
    Rejected,
    /// The configured deadline elapsed without a signal.
    TimedOut,
}

/// A registered stall, consumed by [`ApprovalGateway::wait`].
pub struct StallHandle {
    event_id: String,
    rx: oneshot::Receiver<bool>,
}

impl StallHandle {
    /// The event id this handle waits on.
    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event_id
    }
}

/// In-process registry mapping pending event ids to single-use approval
/// signals.
#[derive(Default)]
pub struct ApprovalGateway {
    pending: Mutex<HashMap<String, Option<oneshot::Sender<bool>>>>,
}

impl ApprovalGateway {
    /// Creates an empty gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending stall.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::DuplicateEvent`] if the id is already
    /// registered.
    pub fn register(&self, event_id: &str) -> Result<StallHandle, GatewayError> {
        let mut pending = self.pending.lock().expect("gateway lock poisoned");
        if pending.contains_key(event_id) {
            return Err(GatewayError::DuplicateEvent {
                event_id: event_id.to_string(),
            });
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(event_id.to_string(), Some(tx));
        Ok(StallHandle {
            event_id: event_id.to_string(),
            rx,
        })
    }

    /// Delivers an approval (`true`) or rejection (`false`) signal.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownEvent`] for unregistered ids and
    /// [`GatewayError::AlreadySignaled`] if a signal was already consumed
    /// for this id.
    pub fn signal(&self, event_id: &str, approved: bool) -> Result<(), GatewayError> {
        let mut pending = self.pending.lock().expect("gateway lock poisoned");
        let Some(slot) = pending.get_mut(event_id) else {
            return Err(GatewayError::UnknownEvent {
                event_id: event_id.to_string(),
            });
        };
        let Some(tx) = slot.take() else {
            return Err(GatewayError::AlreadySignaled {
                event_id: event_id.to_string(),
            });
        };

        // A dropped receiver means the waiter gave up (cancel or timeout);
        // its entry is on the way out, so report the id as gone.
        tx.send(approved).map_err(|_| GatewayError::UnknownEvent {
            event_id: event_id.to_string(),
        })
    }

    /// Blocks until the stall is signaled or the deadline elapses, then
    /// releases the registration.
    pub async fn wait(&self, handle: StallHandle, deadline: Option<Duration>) -> StallOutcome {
        let StallHandle { event_id, rx } = handle;

        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(Ok(true)) => StallOutcome::Approved,
                Ok(Ok(false)) | Ok(Err(_)) => StallOutcome::Rejected,
                Err(_) => StallOutcome::TimedOut,
            },
            None => match rx.await {
                Ok(true) => StallOutcome::Approved,
                Ok(false) | Err(_) => StallOutcome::Rejected,
            },
        };

        self.release(&event_id);
        outcome
    }

    /// Drops a registration without resolving it (client cancellation).
    pub fn release(&self, event_id: &str) {
        self.pending
            .lock()
            .expect("gateway lock poisoned")
            .remove(event_id);
    }

    /// Number of stalls currently pending.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("gateway lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn approve_wakes_the_waiter() {
        let gateway = ApprovalGateway::new();
        let handle = gateway.register("ev-1").unwrap();

        gateway.signal("ev-1", true).unwrap();
        assert_eq!(gateway.wait(handle, None).await, StallOutcome::Approved);
        assert_eq!(gateway.pending_count(), 0);
    }

    #[tokio::test]
    async fn reject_wakes_the_waiter() {
        let gateway = ApprovalGateway::new();
        let handle = gateway.register("ev-1").unwrap();

        gateway.signal("ev-1", false).unwrap();
        assert_eq!(gateway.wait(handle, None).await, StallOutcome::Rejected);
    }

    #[test]
    fn duplicate_registration_fails() {
        let gateway = ApprovalGateway::new();
        let _handle = gateway.register("ev-1").unwrap();

        assert!(matches!(
            gateway.register("ev-1"),
            Err(GatewayError::DuplicateEvent { .. })
        ));
    }

    #[test]
    fn unknown_event_fails() {
        let gateway = ApprovalGateway::new();
        assert_eq!(
            gateway.signal("nope", true),
            Err(GatewayError::UnknownEvent {
                event_id: "nope".to_string()
            })
        );
    }

    #[test]
    fn second_signal_reports_already_signaled() {
        let gateway = ApprovalGateway::new();
        let _handle = gateway.register("ev-1").unwrap();

        gateway.signal("ev-1", true).unwrap();
        assert_eq!(
            gateway.signal("ev-1", false),
            Err(GatewayError::AlreadySignaled {
                event_id: "ev-1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn wait_times_out_without_signal() {
        let gateway = ApprovalGateway::new();
        let handle = gateway.register("ev-1").unwrap();

        let outcome = gateway
            .wait(handle, Some(Duration::from_millis(10)))
            .await;
        assert_eq!(outcome, StallOutcome::TimedOut);
        assert_eq!(gateway.pending_count(), 0);

        // The id is reusable once released.
        assert!(gateway.register("ev-1").is_ok());
    }

    #[tokio::test]
    async fn signal_after_resolution_reports_unknown() {
        let gateway = ApprovalGateway::new();
        let handle = gateway.register("ev-1").unwrap();
        gateway.signal("ev-1", true).unwrap();
        gateway.wait(handle, None).await;

        assert_eq!(
            gateway.signal("ev-1", true),
            Err(GatewayError::UnknownEvent {
                event_id: "ev-1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn concurrent_waiter_is_woken() {
        use std::sync::Arc;

        let gateway = Arc::new(ApprovalGateway::new());
        let handle = gateway.register("ev-1").unwrap();

        let waiter = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.wait(handle, None).await })
        };

        // Give the waiter a chance to park before signaling.
        tokio::time::sleep(Duration::from_millis(5)).await;
        gateway.signal("ev-1", true).unwrap();

        assert_eq!(waiter.await.unwrap(), StallOutcome::Approved);
    }
}
