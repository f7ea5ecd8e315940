//! Subscription registry.
//!
//! Tracks which sockets want updates for which buses and routes, and holds
//! the delivery handle for every connected socket. Purely in-memory;
//! memberships die with the socket or the process.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::fanout::OutboundHandle;

pub type SocketId = u64;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct Inner {
    by_bus: HashMap<String, HashSet<SocketId>>,
    by_route: HashMap<String, HashSet<SocketId>>,
    sockets: HashMap<SocketId, OutboundHandle>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected socket and hand back its process-unique id.
    pub async fn register_socket(&self, handle: OutboundHandle) -> SocketId {
        let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
        self.inner.write().await.sockets.insert(id, handle);
        id
    }

    pub async fn subscribe_bus(&self, socket_id: SocketId, bus_id: &str) {
        let mut inner = self.inner.write().await;
        inner
            .by_bus
            .entry(bus_id.to_string())
            .or_default()
            .insert(socket_id);
    }

    pub async fn unsubscribe_bus(&self, socket_id: SocketId, bus_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(set) = inner.by_bus.get_mut(bus_id) {
            set.remove(&socket_id);
            if set.is_empty() {
                inner.by_bus.remove(bus_id);
            }
        }
    }

    pub async fn subscribe_route(&self, socket_id: SocketId, route_id: &str) {
        let mut inner = self.inner.write().await;
        inner
            .by_route
            .entry(route_id.to_string())
            .or_default()
            .insert(socket_id);
    }

    pub async fn unsubscribe_route(&self, socket_id: SocketId, route_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(set) = inner.by_route.get_mut(route_id) {
            set.remove(&socket_id);
            if set.is_empty() {
                inner.by_route.remove(route_id);
            }
        }
    }

    /// Remove every trace of a socket: both membership maps and the
    /// delivery handle. Called on disconnect and on queue overflow.
    pub async fn drop_socket(&self, socket_id: SocketId) {
        let mut inner = self.inner.write().await;
        if let Some(handle) = inner.sockets.remove(&socket_id) {
            handle.close();
        }
        inner.by_bus.retain(|_, set| {
            set.remove(&socket_id);
            !set.is_empty()
        });
        inner.by_route.retain(|_, set| {
            set.remove(&socket_id);
            !set.is_empty()
        });
    }

    /// Delivery handles for the union of a bus room and a route room,
    /// deduplicated so a socket subscribed to both gets one copy.
    pub async fn members_for(
        &self,
        bus_id: &str,
        route_id: &str,
    ) -> Vec<(SocketId, OutboundHandle)> {
        let inner = self.inner.read().await;
        let mut ids: HashSet<SocketId> = HashSet::new();
        if let Some(set) = inner.by_bus.get(bus_id) {
            ids.extend(set.iter().copied());
        }
        if let Some(set) = inner.by_route.get(route_id) {
            ids.extend(set.iter().copied());
        }
        ids.into_iter()
            .filter_map(|id| inner.sockets.get(&id).map(|h| (id, h.clone())))
            .collect()
    }

    #[cfg(test)]
    pub async fn socket_count(&self) -> usize {
        self.inner.read().await.sockets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::OutboundQueue;

    fn handle() -> OutboundHandle {
        OutboundQueue::with_capacity(8).handle()
    }

    #[tokio::test]
    async fn union_of_bus_and_route_members_is_deduplicated() {
        let reg = SubscriptionRegistry::new();
        let a = reg.register_socket(handle()).await;
        let b = reg.register_socket(handle()).await;
        let both = reg.register_socket(handle()).await;

        reg.subscribe_bus(a, "BUS001").await;
        reg.subscribe_route(b, "RT1").await;
        reg.subscribe_bus(both, "BUS001").await;
        reg.subscribe_route(both, "RT1").await;

        let members = reg.members_for("BUS001", "RT1").await;
        let mut ids: Vec<SocketId> = members.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![a, b, both]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_membership_only() {
        let reg = SubscriptionRegistry::new();
        let a = reg.register_socket(handle()).await;
        reg.subscribe_bus(a, "BUS001").await;
        reg.subscribe_route(a, "RT1").await;

        reg.unsubscribe_bus(a, "BUS001").await;
        let members = reg.members_for("BUS001", "other").await;
        assert!(members.is_empty());

        // Route membership survives and so does the socket itself.
        let members = reg.members_for("other", "RT1").await;
        assert_eq!(members.len(), 1);
        assert_eq!(reg.socket_count().await, 1);
    }

    #[tokio::test]
    async fn drop_socket_clears_everything() {
        let reg = SubscriptionRegistry::new();
        let a = reg.register_socket(handle()).await;
        reg.subscribe_bus(a, "BUS001").await;
        reg.subscribe_route(a, "RT1").await;

        reg.drop_socket(a).await;
        assert!(reg.members_for("BUS001", "RT1").await.is_empty());
        assert_eq!(reg.socket_count().await, 0);
    }

    #[tokio::test]
    async fn socket_ids_are_unique() {
        let reg = SubscriptionRegistry::new();
        let a = reg.register_socket(handle()).await;
        let b = reg.register_socket(handle()).await;
        assert_ne!(a, b);
    }
}
