//! Event types and EventBus for the tutor services
//!
//! Events are broadcast in-process via [`EventBus`]. Subscribers that fall
//! behind lose the oldest events; nothing here is a durable queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Tutor event types
///
/// Plan and state fields are carried as their wire names so that this crate
/// stays independent of the services that define those enums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TutorEvent {
    /// An activation intent moved to a new state
    ///
    /// Triggers:
    /// - Banner refresh for the paying user
    ActivationStateChanged {
        external_payment_reference: String,
        state: String,
        timestamp: DateTime<Utc>,
    },

    /// One call into the activation core finished
    ///
    /// Triggers:
    /// - Banner progress ("attempt 2 of 3")
    ActivationAttempted {
        external_payment_reference: String,
        /// 1-based attempt number within the current retry run
        attempt: u32,
        /// "created", "already_existed", "transient_failure" or "terminal_failure"
        outcome: String,
        timestamp: DateTime<Utc>,
    },

    /// A new entitlement row was written
    EntitlementCreated {
        external_payment_reference: String,
        account_id: String,
        plan: String,
        /// "automatic" or "recovery"
        source: String,
        timestamp: DateTime<Utc>,
    },
}

impl TutorEvent {
    /// Event type name, used as the SSE event name and in logs
    pub fn event_type(&self) -> &'static str {
        match self {
            TutorEvent::ActivationStateChanged { .. } => "ActivationStateChanged",
            TutorEvent::ActivationAttempted { .. } => "ActivationAttempted",
            TutorEvent::EntitlementCreated { .. } => "EntitlementCreated",
        }
    }

    /// Payment reference the event belongs to
    pub fn reference(&self) -> &str {
        match self {
            TutorEvent::ActivationStateChanged {
                external_payment_reference,
                ..
            }
            | TutorEvent::ActivationAttempted {
                external_payment_reference,
                ..
            }
            | TutorEvent::EntitlementCreated {
                external_payment_reference,
                ..
            } => external_payment_reference,
        }
    }
}

/// Broadcast bus shared by all components of a service
///
/// Built on `tokio::sync::broadcast`: publishing never blocks, and each
/// subscriber sees only events emitted after it subscribed.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TutorEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<TutorEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: TutorEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
