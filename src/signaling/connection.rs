#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientEvent, ServerEvent};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::identity::Identity;
use crate::metrics::ServerMetrics;
use crate::outbound::Outbound;
use crate::relay::{RelayEngine, Session};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;

/// How long a closing connection may spend flushing queued events.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Token bucket over inbound events. Burst capacity equals one second of
/// the refill rate.
#[derive(Debug)]
pub struct RateLimiter {
    per_sec: u64,
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

impl RateLimiter {
    pub fn new(per_sec: u64, now: Instant) -> Self {
        let per_sec = per_sec.max(1);
        Self {
            per_sec,
            tokens_us: per_sec * TOKEN_US,
            last_refill: now,
            warned: false,
        }
    }

    fn max_tokens_us(&self) -> u64 {
        self.per_sec * TOKEN_US
    }

    /// Take one token. `Err(true)` means this is the first drop since the
    /// bucket last had room, so the client should be told once.
    pub fn acquire(&mut self, now: Instant) -> Result<(), bool> {
        let elapsed_us = now.saturating_duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(self.per_sec))
            .min(self.max_tokens_us());

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            Ok(())
        } else {
            let first = !self.warned;
            self.warned = true;
            Err(first)
        }
    }
}

/// Forward queued events to the socket until every sender is gone or the
/// socket fails.
fn spawn_writer<S>(mut rx: mpsc::Receiver<Arc<String>>, mut sink: S, identity_id: String) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if sink.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for {}", identity_id);
    })
}

/// Wait for the writer to flush what is already queued. Every sender must
/// have been dropped first.
async fn finish_writer(mut writer: JoinHandle<()>, identity_id: &str) {
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        warn!("Flushing events to {} timed out", identity_id);
        writer.abort();
    }
}

/// Handles a single WebSocket connection for an already resolved identity.
pub async fn handle_connection(
    socket: WebSocket,
    engine: Arc<RelayEngine>,
    identity: Identity,
    config: Arc<RelayConfig>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let identity_id = identity.id.clone();
    info!("New WebSocket connection: {} ({})", identity_id, identity.display_name);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (ws_sender, mut ws_receiver) = socket.split();
    let (outbound, receiver) = Outbound::channel(config.outbound_capacity);
    let overflow = receiver.overflow;

    // Spawn task to send events to client
    let send_task = spawn_writer(receiver.rx, ws_sender, identity_id.clone());

    let mut session = Session::new(identity_id.clone(), outbound);
    session.outbound.send(&ServerEvent::Connected { user: identity });

    let mut limiter = RateLimiter::new(config.rate_limit_per_sec, Instant::now());
    let mut overflowed = false;

    loop {
        let next = tokio::select! {
            _ = overflow.notified() => {
                metrics.inc_outbound_overflows();
                warn!("Outbound queue overflowed for {}, disconnecting", identity_id);
                overflowed = true;
                break;
            }
            next = tokio::time::timeout(config.heartbeat_timeout, ws_receiver.next()) => next,
        };

        let msg = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Heartbeat timeout for {}", identity_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if let Err(first) = limiter.acquire(Instant::now()) {
                    metrics.inc_rejections();
                    if first {
                        warn!("Rate limit exceeded for {}", identity_id);
                        let err = RelayError::Validation(format!(
                            "Rate limit exceeded: max {} events/second",
                            config.rate_limit_per_sec
                        ));
                        session.outbound.send(&ServerEvent::error(err.code(), err.to_string(), None));
                    }
                    continue;
                }

                match ClientEvent::parse(text.as_str()) {
                    Ok(event) => engine.dispatch(&mut session, event).await,
                    Err(e) => {
                        debug!("Invalid event from {}: {}", identity_id, e);
                        metrics.inc_rejections();
                        let err = RelayError::Validation(format!("Invalid event: {e}"));
                        session.outbound.send(&ServerEvent::error(err.code(), err.to_string(), None));
                    }
                }

                if session.outbound.is_closed() {
                    break;
                }
            }
            Message::Binary(_) => {
                metrics.inc_rejections();
                let err = RelayError::Validation("Binary frames are not supported".into());
                session.outbound.send(&ServerEvent::error(err.code(), err.to_string(), None));
            }
            Message::Close(_) => {
                info!("Client {} closed connection", identity_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Protocol-level ping/pong is answered by axum; it still counts as liveness
                engine.identities().touch(&identity_id);
            }
        }
    }

    engine.disconnect(&mut session).await;
    // Room departure released the room's copies of the queue; this is the last one
    drop(session);
    if overflowed {
        // The peer is not keeping up, so the backlog is dropped
        send_task.abort();
    } else {
        finish_writer(send_task, &identity_id).await;
    }
    info!("Connection closed: {}", identity_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Written = Arc<Mutex<Vec<String>>>;

    fn recording_sink(written: Written) -> impl Sink<Message> + Unpin + Send + 'static {
        Box::pin(futures_util::sink::unfold(written, |written: Written, msg: Message| async move {
            if let Message::Text(text) = msg {
                written.lock().unwrap().push(text.as_str().to_string());
            }
            Ok::<_, std::convert::Infallible>(written)
        }))
    }

    #[tokio::test]
    async fn test_queued_events_flushed_after_sender_dropped() {
        let written: Written = Arc::default();
        let (outbound, receiver) = Outbound::channel(8);
        let writer = spawn_writer(receiver.rx, recording_sink(written.clone()), "c1".into());

        outbound.send(&ServerEvent::Kicked {
            room_id: "abc".into(),
            by: "h".into(),
        });
        outbound.send(&ServerEvent::error("forbidden", "gone", None));
        drop(outbound);

        finish_writer(writer, "c1").await;
        let frames = written.lock().unwrap().clone();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("\"kicked\""));
        assert!(frames[1].contains("\"error\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_writer_is_aborted() {
        let (outbound, receiver) = Outbound::channel(8);
        let pending = Box::pin(futures_util::sink::unfold((), |_, _msg: Message| async move {
            std::future::pending::<()>().await;
            Ok::<_, std::convert::Infallible>(())
        }));
        let writer = spawn_writer(receiver.rx, pending, "c2".into());
        outbound.send(&ServerEvent::HeartbeatAck { timestamp: 1 });
        drop(outbound);

        // Returns once the flush timeout elapses
        finish_writer(writer, "c2").await;
    }

    #[test]
    fn test_burst_then_refill() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(5, start);
        for _ in 0..5 {
            assert_eq!(limiter.acquire(start), Ok(()));
        }
        assert_eq!(limiter.acquire(start), Err(true));
        // Only the first drop in a run asks for a warning
        assert_eq!(limiter.acquire(start), Err(false));

        let later = start + Duration::from_millis(200);
        assert_eq!(limiter.acquire(later), Ok(()));
        assert_eq!(limiter.acquire(later), Err(true));
    }

    #[test]
    fn test_refill_is_capped_at_burst() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(3, start);
        let much_later = start + Duration::from_secs(3600);
        for _ in 0..3 {
            assert_eq!(limiter.acquire(much_later), Ok(()));
        }
        assert!(limiter.acquire(much_later).is_err());
    }

    #[test]
    fn test_zero_rate_still_admits_one_per_second() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(0, start);
        assert_eq!(limiter.acquire(start), Ok(()));
        assert_eq!(limiter.acquire(start), Err(true));
        assert_eq!(limiter.acquire(start + Duration::from_secs(1)), Ok(()));
    }
}
