//! Lifecycle events and the observer capability.
//!
//! Components never log store lifecycle or admission outcomes through ambient
//! state; they are handed an [`Observer`] when they are built and report
//! [`Event`]s to it.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, warn};

/// Something observable that happened in the admission layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A connection to the shared store was established.
    StoreConnected { target: String },
    /// A live connection was lost.
    StoreDisconnected { target: String, reason: String },
    /// A connection attempt failed; another attempt is scheduled.
    StoreError {
        target: String,
        attempt: u32,
        retry_in_ms: u64,
        error: String,
    },
    /// The reconnect ceiling was reached. Terminal.
    StoreGivingUp { target: String, attempts: u32 },
    /// A request exceeded its window ceiling.
    AdmissionRejected {
        key: String,
        count: u64,
        retry_after_secs: u64,
    },
    /// The store could not be consulted and the degrade policy was applied.
    AdmissionDegraded {
        key: String,
        policy: String,
        error: String,
    },
}

impl Event {
    /// Dotted event name used as the log message.
    pub fn name(&self) -> &'static str {
        match self {
            Event::StoreConnected { .. } => "store.connected",
            Event::StoreDisconnected { .. } => "store.disconnected",
            Event::StoreError { .. } => "store.error",
            Event::StoreGivingUp { .. } => "store.giving_up",
            Event::AdmissionRejected { .. } => "admission.rejected",
            Event::AdmissionDegraded { .. } => "admission.degraded",
        }
    }
}

/// Receives lifecycle events.
pub trait Observer: Send + Sync {
    fn observe(&self, event: &Event);
}

/// Observer that writes each event to `tracing` at a matching severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn observe(&self, event: &Event) {
        let name = event.name();
        match event {
            Event::StoreConnected { target } => {
                info!(target_store = %target, "{}", name);
            }
            Event::StoreDisconnected { target, reason } => {
                warn!(target_store = %target, reason = %reason, "{}", name);
            }
            Event::StoreError {
                target,
                attempt,
                retry_in_ms,
                error,
            } => {
                warn!(
                    target_store = %target,
                    attempt = attempt,
                    retry_in_ms = retry_in_ms,
                    error = %error,
                    "{}", name
                );
            }
            Event::StoreGivingUp { target, attempts } => {
                error!(target_store = %target, attempts = attempts, "{}", name);
            }
            Event::AdmissionRejected {
                key,
                count,
                retry_after_secs,
            } => {
                info!(
                    key = %key,
                    count = count,
                    retry_after_secs = retry_after_secs,
                    "{}", name
                );
            }
            Event::AdmissionDegraded { key, policy, error } => {
                warn!(key = %key, policy = %policy, error = %error, "{}", name);
            }
        }
    }
}

/// Observer that logs like [`TracingObserver`] and also publishes every
/// event on a broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastObserver {
    sender: broadcast::Sender<Event>,
}

impl BroadcastObserver {
    /// Create an observer whose channel buffers up to `capacity` events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

impl Observer for BroadcastObserver {
    fn observe(&self, event: &Event) {
        TracingObserver.observe(event);
        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
    }
}

/// Shared default observer.
pub fn tracing_observer() -> Arc<dyn Observer> {
    Arc::new(TracingObserver)
}
