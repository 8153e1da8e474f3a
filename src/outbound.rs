#![forbid(unsafe_code)]

// Per-connection outbound queue carrying pre-serialized JSON frames

use crate::signaling::protocol::ServerEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::warn;

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue was full; the connection has been told to disconnect
    Overflow,
    /// Connection already gone
    Closed,
}

/// Sending half held by rooms and the relay engine. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::Sender<Arc<String>>,
    overflow: Arc<Notify>,
}

/// Receiving half owned by the connection's writer task.
pub struct OutboundReceiver {
    pub rx: mpsc::Receiver<Arc<String>>,
    /// Fires once the queue overflowed; the connection must close
    pub overflow: Arc<Notify>,
}

impl Outbound {
    pub fn channel(capacity: usize) -> (Outbound, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let overflow = Arc::new(Notify::new());
        (
            Outbound {
                tx,
                overflow: overflow.clone(),
            },
            OutboundReceiver { rx, overflow },
        )
    }

    /// Enqueue an already serialized frame without waiting.
    ///
    /// A full queue means the peer cannot keep up; rather than silently
    /// dropping frames from the middle of a stream, the connection is asked
    /// to disconnect.
    pub fn deliver(&self, json: &Arc<String>) -> Delivery {
        match self.tx.try_send(json.clone()) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflow.notify_one();
                Delivery::Overflow
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Serialize and enqueue a single event.
    pub fn send(&self, event: &ServerEvent) -> Delivery {
        match encode(event) {
            Some(json) => self.deliver(&json),
            None => Delivery::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Serialize once so a broadcast shares one allocation across recipients.
pub fn encode(event: &ServerEvent) -> Option<Arc<String>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!("Failed to serialize {} event: {}", event.name(), e);
            None
        }
    }
}

#[cfg(test)]
impl OutboundReceiver {
    /// Drain everything queued so far and decode it.
    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(json) = self.rx.try_recv() {
            events.push(serde_json::from_str(&json).expect("queued frame is valid JSON"));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_preserves_order() {
        let (outbound, mut receiver) = Outbound::channel(8);
        for ts in [1, 2, 3] {
            assert_eq!(outbound.send(&ServerEvent::HeartbeatAck { timestamp: ts }), Delivery::Queued);
        }
        let stamps: Vec<u64> = receiver
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::HeartbeatAck { timestamp } => Some(timestamp),
                _ => None,
            })
            .collect();
        assert_eq!(stamps, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_overflow_notifies_connection() {
        let (outbound, receiver) = Outbound::channel(1);
        assert_eq!(outbound.send(&ServerEvent::HeartbeatAck { timestamp: 1 }), Delivery::Queued);
        assert_eq!(outbound.send(&ServerEvent::HeartbeatAck { timestamp: 2 }), Delivery::Overflow);

        // notify_one stores a permit, so a later waiter still observes it
        tokio::time::timeout(Duration::from_secs(1), receiver.overflow.notified())
            .await
            .expect("overflow notification");
    }

    #[tokio::test]
    async fn test_closed_receiver() {
        let (outbound, receiver) = Outbound::channel(4);
        drop(receiver);
        assert!(outbound.is_closed());
        assert_eq!(outbound.send(&ServerEvent::HeartbeatAck { timestamp: 1 }), Delivery::Closed);
    }
}
