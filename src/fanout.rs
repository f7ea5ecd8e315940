//! Change-stream fan-out.
//!
//! The [`Broadcaster`] consumes the store's change stream and delivers
//! public payloads to every subscribed socket through per-socket bounded
//! queues. Back-pressure policy: position updates are absorptive (the
//! oldest pending update for the same bus yields to a newer event), status
//! transitions are never dropped, and a socket whose queue still overflows
//! is disconnected.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tracing::{debug, warn};

use crate::protocol::ServerEvent;
use crate::store::{BusChanged, BusStore};
use crate::subscriptions::SubscriptionRegistry;

/// Initial and maximum delay for resubscribing to a lost change stream.
const RESUBSCRIBE_BASE: Duration = Duration::from_secs(5);
const RESUBSCRIBE_CAP: Duration = Duration::from_secs(30);

/// The queue could not take the event even after coalescing.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueOverflow;

/// Bounded per-socket outbound queue, single consumer.
pub struct OutboundQueue {
    capacity: usize,
    items: Mutex<VecDeque<ServerEvent>>,
    closed: AtomicBool,
    notify: Notify,
}

impl OutboundQueue {
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn handle(self: &Arc<Self>) -> OutboundHandle {
        OutboundHandle(self.clone())
    }

    /// Enqueue an event, coalescing under back-pressure. When the queue is
    /// full, the oldest pending absorptive event for the same bus is
    /// evicted to make room; the incoming event is then appended, keeping
    /// per-bus delivery order. Fails when nothing can be evicted.
    pub async fn push(&self, event: ServerEvent) -> Result<(), QueueOverflow> {
        if self.closed.load(Ordering::Acquire) {
            // Socket already going away; its memberships are next.
            return Ok(());
        }

        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            let evictable = event.bus_id().and_then(|bus| {
                items
                    .iter()
                    .position(|e| e.absorptive() && e.bus_id() == Some(bus))
            });
            match evictable {
                Some(pos) => {
                    items.remove(pos);
                }
                None => return Err(QueueOverflow),
            }
        }
        items.push_back(event);
        drop(items);

        self.notify.notify_one();
        Ok(())
    }

    /// Next event, or `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<ServerEvent> {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(item) = items.pop_front() {
                    return Some(item);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Cloneable producer side of an [`OutboundQueue`].
#[derive(Clone)]
pub struct OutboundHandle(Arc<OutboundQueue>);

impl OutboundHandle {
    pub async fn push(&self, event: ServerEvent) -> Result<(), QueueOverflow> {
        self.0.push(event).await
    }

    pub fn close(&self) {
        self.0.close()
    }
}

/// Converts change-stream events into per-socket deliveries.
#[derive(Clone)]
pub struct Broadcaster {
    store: Arc<BusStore>,
    registry: Arc<SubscriptionRegistry>,
}

impl Broadcaster {
    pub fn new(store: Arc<BusStore>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Consume the change stream until shutdown. Lagged reads are logged
    /// and skipped (clients reconcile via snapshot-on-subscribe); a closed
    /// stream is reattached with exponential backoff.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = RESUBSCRIBE_BASE;
        loop {
            let mut rx = self.store.subscribe_changes();
            debug!("change stream consumer attached");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    result = rx.recv() => match result {
                        Ok(event) => {
                            backoff = RESUBSCRIBE_BASE;
                            self.fan_out(&event).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "change stream lagged, continuing");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }

            warn!(wait_secs = backoff.as_secs(), "change stream lost, resubscribing");
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RESUBSCRIBE_CAP);
        }
    }

    async fn fan_out(&self, event: &BusChanged) {
        let Some(payload) = ServerEvent::from_change(event) else {
            return;
        };
        self.deliver_to_rooms(&event.bus_id, &event.route_id, payload)
            .await;
    }

    /// Deliver an event to the union of a bus room and a route room. Also
    /// the direct path for events that do not flow through the change
    /// stream (ETA updates).
    pub async fn deliver_to_rooms(&self, bus_id: &str, route_id: &str, event: ServerEvent) {
        let members = self.registry.members_for(bus_id, route_id).await;
        for (socket_id, handle) in members {
            if handle.push(event.clone()).await.is_err() {
                warn!(socket_id, bus_id, "outbound queue overflow, dropping socket");
                self.registry.drop_socket(socket_id).await;
            }
        }
    }
}
