//! # Event Bus System
//!
//! Event-driven notification for the Jellywatch core using
//! `tokio::sync::broadcast`. Hosts (a daemon status page, a TUI, a
//! notification hook) subscribe to learn about path changes, sweeps, and
//! consolidation progress without polling the database.
//!
//! ## Overview
//!
//! - **Event Types**: Strongly-typed enum hierarchies per domain
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, ReconcileEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Reconcile(ReconcileEvent::TaskDropped {
//!         asset: "series/foo/2019".to_string(),
//!         target: "sonarr".to_string(),
//!     }))
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "Sync task dropped, backlog full");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Emission is best-effort: publishers call `.ok()` on `emit` since having
//! no subscriber is normal.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Record store changes
    Library(LibraryEvent),
    /// Reconciliation engine activity
    Reconcile(ReconcileEvent),
    /// Consolidation activity
    Consolidation(ConsolidationEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Library(e) => e.description(),
            CoreEvent::Reconcile(e) => e.description(),
            CoreEvent::Consolidation(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Consolidation(ConsolidationEvent::OperationFailed { .. }) => {
                EventSeverity::Error
            }
            CoreEvent::Reconcile(ReconcileEvent::PushFailed { .. })
            | CoreEvent::Reconcile(ReconcileEvent::TaskDropped { .. })
            | CoreEvent::Library(LibraryEvent::AmbiguousClaim { .. }) => EventSeverity::Warning,
            CoreEvent::Library(LibraryEvent::PathChanged { .. })
            | CoreEvent::Library(LibraryEvent::ManualOverride { .. })
            | CoreEvent::Reconcile(ReconcileEvent::SweepCompleted { .. })
            | CoreEvent::Consolidation(ConsolidationEvent::Completed { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Library Events
// ============================================================================

/// Events raised by the record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum LibraryEvent {
    /// An asset's canonical path changed.
    PathChanged {
        /// Asset key, `kind/normalized-title/year`.
        asset: String,
        previous_path: Option<String>,
        new_path: String,
        /// Source that won the upsert.
        source: String,
    },
    /// Two sources of equal priority disagree about an asset's path.
    AmbiguousClaim {
        asset: String,
        stored_source: String,
        stored_path: String,
        claimed_source: String,
        claimed_path: String,
    },
    /// An operator forced a path.
    ManualOverride { asset: String, path: String },
}

impl LibraryEvent {
    fn description(&self) -> &str {
        match self {
            LibraryEvent::PathChanged { .. } => "Canonical path changed",
            LibraryEvent::AmbiguousClaim { .. } => "Conflicting top-priority claim",
            LibraryEvent::ManualOverride { .. } => "Path set by operator",
        }
    }
}

// ============================================================================
// Reconcile Events
// ============================================================================

/// Events raised by the reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ReconcileEvent {
    /// Immediate backlog was full; the dirty flag still covers the asset.
    TaskDropped { asset: String, target: String },
    /// A sweep started.
    SweepStarted {
        run_id: String,
        /// `scheduled`, `retry`, or `manual`
        trigger: String,
        dirty_count: u64,
    },
    /// A sweep finished.
    SweepCompleted {
        run_id: String,
        trigger: String,
        pushed: u64,
        failed: u64,
        skipped: u64,
        duration_ms: u64,
    },
    /// A manager accepted the canonical path.
    PushSucceeded {
        asset: String,
        target: String,
        attempts: u32,
    },
    /// Every attempt of one invocation failed; the record stays dirty.
    PushFailed {
        asset: String,
        target: String,
        attempts: u32,
        message: String,
    },
}

impl ReconcileEvent {
    fn description(&self) -> &str {
        match self {
            ReconcileEvent::TaskDropped { .. } => "Sync task dropped, backlog full",
            ReconcileEvent::SweepStarted { .. } => "Reconciliation sweep started",
            ReconcileEvent::SweepCompleted { .. } => "Reconciliation sweep completed",
            ReconcileEvent::PushSucceeded { .. } => "Manager path updated",
            ReconcileEvent::PushFailed { .. } => "Manager path update failed",
        }
    }
}

// ============================================================================
// Consolidation Events
// ============================================================================

/// Events raised while consolidating scattered assets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ConsolidationEvent {
    /// A move plan was generated for a conflict.
    PlanGenerated {
        conflict_id: i64,
        asset: String,
        target: String,
        operations: u64,
        skipped: u64,
    },
    /// A single move failed; the batch continues.
    OperationFailed {
        conflict_id: i64,
        source_path: String,
        message: String,
    },
    /// All operations of a plan were attempted.
    Completed {
        conflict_id: i64,
        succeeded: u64,
        failed: u64,
        skipped: u64,
        resolved: bool,
        dry_run: bool,
    },
}

impl ConsolidationEvent {
    fn description(&self) -> &str {
        match self {
            ConsolidationEvent::PlanGenerated { .. } => "Consolidation plan generated",
            ConsolidationEvent::OperationFailed { .. } => "Consolidation move failed",
            ConsolidationEvent::Completed { .. } => "Consolidation finished",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to core events.
///
/// Cloning is cheap; every clone publishes into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all active subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error when nobody is listening.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscription to the event bus.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A filtered stream of events.
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only yield events matching `predicate`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |f| f(event))
    }

    /// Receives the next event that passes the filter.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv). `None` means nothing is queued.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Some(Err(RecvError::Closed))
                }
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn dropped(asset: &str) -> CoreEvent {
        CoreEvent::Reconcile(ReconcileEvent::TaskDropped {
            asset: asset.to_string(),
            target: "sonarr".to_string(),
        })
    }

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::default();
        assert!(bus.emit(dropped("series/foo/2019")).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = CoreEvent::Library(LibraryEvent::PathChanged {
            asset: "series/foo/2019".to_string(),
            previous_path: Some("/tv1/Foo (2019)".to_string()),
            new_path: "/tv2/Foo (2019)".to_string(),
            source: "jellywatch".to_string(),
        });

        assert_eq!(bus.emit(event.clone()).unwrap(), 2);
        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, CoreEvent::Consolidation(_)));

        bus.emit(dropped("series/bar/2021")).ok();
        let done = CoreEvent::Consolidation(ConsolidationEvent::Completed {
            conflict_id: 3,
            succeeded: 2,
            failed: 0,
            skipped: 1,
            resolved: true,
            dry_run: false,
        });
        bus.emit(done.clone()).ok();

        assert_eq!(stream.recv().await.unwrap(), done);
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.emit(dropped(&format!("series/show{}/0", i))).ok();
        }

        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        let failed = CoreEvent::Consolidation(ConsolidationEvent::OperationFailed {
            conflict_id: 1,
            source_path: "/tv2/Bar (2021)/S01E01.mkv".to_string(),
            message: "No space left on device".to_string(),
        });
        assert_eq!(failed.severity(), EventSeverity::Error);
        assert_eq!(dropped("x").severity(), EventSeverity::Warning);

        let started = CoreEvent::Reconcile(ReconcileEvent::SweepStarted {
            run_id: "r".to_string(),
            trigger: "retry".to_string(),
            dirty_count: 0,
        });
        assert_eq!(started.severity(), EventSeverity::Debug);
        assert!(EventSeverity::Error > EventSeverity::Warning);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = CoreEvent::Reconcile(ReconcileEvent::PushFailed {
            asset: "movie/heat/1995".to_string(),
            target: "radarr".to_string(),
            attempts: 4,
            message: "HTTP 503 error".to_string(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Reconcile");
        assert_eq!(json["payload"]["event"], "PushFailed");
        assert_eq!(json["payload"]["attempts"], 4);

        let back: CoreEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
