//! Event bus for pub/sub messaging.
//!
//! Uses tokio broadcast channels for efficient pub/sub; subscribers that fall
//! behind lose messages (lagged) and the bus tracks a running drop count
//! instead of letting a slow subscriber block emitters (spec.md §5/§9).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Which stream a `CommandData` chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Events published on the engine's event stream (spec.md §3 "Events").
#[derive(Debug, Clone)]
pub enum Event {
    CommandStart { command: String, adapter: &'static str },
    CommandData { stream: StreamKind, chunk: Vec<u8> },
    CommandComplete { command: String, exit_code: Option<i32>, duration_ms: u64 },
    CommandError { command: String, message: String },

    ConnectionOpen { key: String },
    ConnectionReuse { key: String },
    ConnectionClose { key: String, reason: &'static str },
    ConnectionError { key: String, message: String },

    TunnelOpen { local_addr: String },
    TunnelClose { local_addr: String },

    CacheHit { key: String },
    CacheMiss { key: String },
    CacheEvict { key: String },
}

/// Event bus for broadcasting events to multiple subscribers.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    // Keep a receiver to prevent the channel from closing when the last
    // external subscriber drops.
    _receiver: broadcast::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Default capacity handles bursts of `CommandData` chunks without
    /// lagging under normal load.
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self {
            sender,
            _receiver,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers. Emission is best-effort and
    /// non-blocking; if there are no subscribers the event is dropped.
    pub fn publish(&self, event: Event) -> usize {
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn publish_command_start(&self, command: &str, adapter: &'static str) {
        debug!(command, adapter, "command:start");
        self.publish(Event::CommandStart {
            command: command.to_string(),
            adapter,
        });
    }

    pub fn publish_command_complete(&self, command: &str, exit_code: Option<i32>, duration_ms: u64) {
        debug!(command, ?exit_code, duration_ms, "command:complete");
        self.publish(Event::CommandComplete {
            command: command.to_string(),
            exit_code,
            duration_ms,
        });
    }

    pub fn publish_command_error(&self, command: &str, message: &str) {
        warn!(command, message, "command:error");
        self.publish(Event::CommandError {
            command: command.to_string(),
            message: message.to_string(),
        });
    }

    /// Count of events that were dropped because a broadcast send found no
    /// live receivers at the moment of publish. Surfaced for pool/cache
    /// stats the same way the teacher surfaces subscriber counts.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
            dropped: self.dropped.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_pubsub() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::CommandStart {
            command: "echo hi".into(),
            adapter: "local",
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::CommandStart { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish_command_start("echo hi", "local");

        let event1 = rx1.recv().await.unwrap();
        let event2 = rx2.recv().await.unwrap();
        assert!(matches!(event1, Event::CommandStart { .. }));
        assert!(matches!(event2, Event::CommandStart { .. }));
    }

    #[tokio::test]
    async fn test_command_complete_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish_command_complete("echo hi", Some(0), 12);

        let event = rx.recv().await.unwrap();
        if let Event::CommandComplete { exit_code, .. } = event {
            assert_eq!(exit_code, Some(0));
        } else {
            panic!("expected CommandComplete event");
        }
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _rx1 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_dropped_count_increments_when_no_subscribers() {
        let bus = EventBus::with_capacity(8);
        bus.publish(Event::CacheHit { key: "k".into() });
        assert_eq!(bus.dropped_count(), 1);
    }
}
