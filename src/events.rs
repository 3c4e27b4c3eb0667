//! Change Event types and the Event Broadcaster (components embedded in
//! the Content Service per spec §4.5/§4.6).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bounded capacity for a subscriber's event queue (spec §3).
const SUBSCRIBER_QUEUE_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    TreeUpdated,
    PageUpdated,
    Deleted,
    /// Never broadcast; exists only so the classifier has a sentinel
    /// value for ops that produce no visible notification.
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub path: String,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            timestamp: Utc::now(),
        }
    }
}

struct Subscriber {
    cancel: CancellationToken,
    tx: mpsc::Sender<ChangeEvent>,
}

/// Fan-out registry: a single writer (the Content Service, serialized
/// by the write mutex) broadcasting to N readers (SSE handlers), each
/// with its own bounded, non-blocking queue. A slow subscriber drops
/// events rather than stalling the others (spec §4.6).
pub struct Broadcaster {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new subscriber and returns the receiving half of its
    /// queue. `cancel` is the request-scoped cancellation token; the
    /// caller is responsible for dropping or cancelling it on
    /// disconnect so that [`Broadcaster::publish`] can reap it.
    pub fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .insert(id, Subscriber { cancel, tx });
        rx
    }

    /// Fans `event` out to every live subscriber, dropping it for any
    /// subscriber whose queue is full, then reaps subscribers whose
    /// cancellation token has fired.
    pub fn publish(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscriber registry poisoned");
        subscribers.retain(|_, sub| !sub.cancel.is_cancelled());
        for sub in subscribers.values() {
            // Non-blocking: a full queue means this subscriber is
            // lagging and misses the event, per the drop-on-lag contract.
            let _ = sub.tx.try_send(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .len()
    }

    /// Cancels every live subscriber, used on service shutdown.
    pub fn shutdown(&self) {
        let subscribers = self.subscribers.lock().expect("subscriber registry poisoned");
        for sub in subscribers.values() {
            sub.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_subscriber_does_not_block_fast_one() {
        let broadcaster = Broadcaster::new();
        let slow_cancel = CancellationToken::new();
        let fast_cancel = CancellationToken::new();
        let mut slow_rx = broadcaster.subscribe(slow_cancel.clone());
        let mut fast_rx = broadcaster.subscribe(fast_cancel.clone());

        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY + 4) {
            broadcaster.publish(ChangeEvent::new(ChangeKind::PageUpdated, format!("{i}.md")));
        }

        // The fast subscriber drains immediately and should see at
        // least the first event; the slow one overflowed and dropped
        // some, but the broadcaster never blocked publishing.
        assert!(fast_rx.try_recv().is_ok());
        let _ = slow_rx.try_recv();
    }

    #[test]
    fn cancelled_subscriber_is_reaped_on_next_publish() {
        let broadcaster = Broadcaster::new();
        let cancel = CancellationToken::new();
        let _rx = broadcaster.subscribe(cancel.clone());
        assert_eq!(broadcaster.subscriber_count(), 1);

        cancel.cancel();
        broadcaster.publish(ChangeEvent::new(ChangeKind::TreeUpdated, "x.md"));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn serializes_to_camel_case_wire_format() {
        let event = ChangeEvent {
            kind: ChangeKind::PageUpdated,
            path: "guides/getting_started.md".to_string(),
            timestamp: DateTime::parse_from_rfc3339("2024-01-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"pageUpdated\""));
        assert!(json.contains("\"path\":\"guides/getting_started.md\""));
    }
}
