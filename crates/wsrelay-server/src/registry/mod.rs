//! In-memory registry of downstream subscribers.
//!
//! Membership lives in a copy-on-write map: `add`/`remove` serialise on a
//! write lock and clone the map only while a snapshot of the previous version
//! is still alive, while `snapshot` just clones an `Arc`. Broadcasts iterate
//! a snapshot without holding any lock, so they never stall registration.

pub mod subscriber;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::error::RelayError;
use crate::transport::ConnectionId;

pub use subscriber::{Subscriber, SubscriberQueue};

type Members = HashMap<ConnectionId, Arc<Subscriber>>;

/// Thread-safe set of active subscribers, keyed by connection identity.
#[derive(Default)]
pub struct SubscriberRegistry {
    members: RwLock<Arc<Members>>,
}

/// Point-in-time view of the registry.
#[derive(Clone)]
pub struct RegistrySnapshot(Arc<Members>);

impl RegistrySnapshot {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.0.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Subscriber>> {
        self.0.values()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber.
    ///
    /// Identities are unique per handshake, so a second `add` for the same id
    /// is a logic error: it is logged and rejected, and the existing entry is
    /// left untouched.
    pub async fn add(&self, subscriber: Arc<Subscriber>) -> Result<(), RelayError> {
        let id = subscriber.id();
        let mut members = self.members.write().await;
        if members.contains_key(&id) {
            error!(conn = %id, peer = %subscriber.peer(), "Duplicate subscriber registration rejected");
            return Err(RelayError::DuplicateConnection(id));
        }
        Arc::make_mut(&mut *members).insert(id, Arc::clone(&subscriber));
        info!(
            conn = %id,
            peer = %subscriber.peer(),
            subscribers = members.len(),
            "Subscriber registered"
        );
        Ok(())
    }

    /// Remove a subscriber by identity.
    ///
    /// Absent ids are a no-op: removal races between a failed send and the
    /// connection's own close detection are expected. The removed handle is
    /// retired before this returns.
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Subscriber>> {
        let mut members = self.members.write().await;
        if !members.contains_key(&id) {
            debug!(conn = %id, "Subscriber already removed");
            return None;
        }
        let removed = Arc::make_mut(&mut *members).remove(&id);
        if let Some(subscriber) = &removed {
            subscriber.retire();
            info!(
                conn = %id,
                peer = %subscriber.peer(),
                connected_ms = subscriber.connected_for().as_millis(),
                subscribers = members.len(),
                "Subscriber removed"
            );
        }
        removed
    }

    /// Point-in-time copy of the membership for broadcasting.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot(Arc::clone(&*self.members.read().await))
    }

    /// Remove and retire every subscriber, returning them.
    pub async fn drain(&self) -> Vec<Arc<Subscriber>> {
        let drained = std::mem::take(&mut *self.members.write().await);
        let subscribers: Vec<_> = drained.values().cloned().collect();
        for subscriber in &subscribers {
            subscriber.retire();
        }
        if !subscribers.is_empty() {
            info!(count = subscribers.len(), "All subscribers removed");
        }
        subscribers
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.members.read().await.contains_key(&id)
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.members.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::transport::Payload;

    fn subscriber(raw: u64) -> (Arc<Subscriber>, SubscriberQueue) {
        let (sub, queue) = Subscriber::channel(ConnectionId::from_raw(raw), format!("peer-{raw}"), 8);
        (Arc::new(sub), queue)
    }

    #[tokio::test]
    async fn add_and_remove() {
        let registry = SubscriberRegistry::new();
        let (a, _qa) = subscriber(1);

        registry.add(Arc::clone(&a)).await.unwrap();
        assert!(registry.contains(a.id()).await);
        assert_eq!(registry.len().await, 1);

        let removed = registry.remove(a.id()).await.unwrap();
        assert_eq!(removed.id(), a.id());
        assert!(removed.is_retired());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let registry = SubscriberRegistry::new();
        let (a, _qa) = subscriber(1);
        let (dup, _qd) = subscriber(1);

        registry.add(a).await.unwrap();
        let err = registry.add(Arc::clone(&dup)).await.unwrap_err();

        assert!(matches!(err, RelayError::DuplicateConnection(id) if id == dup.id()));
        assert_eq!(registry.len().await, 1);
        assert!(!dup.is_retired());
    }

    #[tokio::test]
    async fn removing_absent_id_is_a_noop() {
        let registry = SubscriberRegistry::new();
        let (a, _qa) = subscriber(1);
        registry.add(Arc::clone(&a)).await.unwrap();

        assert!(registry.remove(ConnectionId::from_raw(99)).await.is_none());
        assert!(registry.remove(a.id()).await.is_some());
        assert!(registry.remove(a.id()).await.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_unaffected_by_later_changes() {
        let registry = SubscriberRegistry::new();
        let (a, _qa) = subscriber(1);
        let (b, _qb) = subscriber(2);
        registry.add(Arc::clone(&a)).await.unwrap();

        let before = registry.snapshot().await;
        registry.add(Arc::clone(&b)).await.unwrap();
        registry.remove(a.id()).await;
        let after = registry.snapshot().await;

        assert_eq!(before.len(), 1);
        assert!(before.contains(a.id()));
        assert_eq!(after.len(), 1);
        assert!(after.contains(b.id()));
    }

    #[tokio::test]
    async fn removed_member_of_old_snapshot_cannot_be_sent_to() {
        let registry = SubscriberRegistry::new();
        let (a, mut queue) = subscriber(1);
        registry.add(Arc::clone(&a)).await.unwrap();

        let snapshot = registry.snapshot().await;
        registry.remove(a.id()).await;

        for sub in snapshot.iter() {
            assert!(sub.send(Payload::text("late"), Duration::from_millis(10)).await.is_err());
        }
        assert_eq!(queue.recv().await, None);
    }

    #[tokio::test]
    async fn drain_retires_everyone() {
        let registry = SubscriberRegistry::new();
        let (a, _qa) = subscriber(1);
        let (b, _qb) = subscriber(2);
        registry.add(Arc::clone(&a)).await.unwrap();
        registry.add(Arc::clone(&b)).await.unwrap();

        let drained = registry.drain().await;

        assert_eq!(drained.len(), 2);
        assert!(a.is_retired() && b.is_retired());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn membership_matches_last_operation_for_any_sequence() {
        let registry = SubscriberRegistry::new();
        let mut model: HashSet<u64> = HashSet::new();
        let mut queues = Vec::new();
        // Deterministic LCG so the sequence is reproducible.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;

        for _ in 0..500 {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let raw = (seed >> 33) % 12;
            let id = ConnectionId::from_raw(raw);
            if (seed >> 20) & 1 == 0 {
                let (sub, queue) = subscriber(raw);
                queues.push(queue);
                let added = registry.add(sub).await.is_ok();
                assert_eq!(added, model.insert(raw), "add {raw}");
            } else {
                let removed = registry.remove(id).await.is_some();
                assert_eq!(removed, model.remove(&raw), "remove {raw}");
            }

            let mut ids: Vec<u64> = registry.ids().await.iter().map(|id| id.as_u64()).collect();
            ids.sort_unstable();
            let mut expected: Vec<u64> = model.iter().copied().collect();
            expected.sort_unstable();
            assert_eq!(ids, expected);
        }
    }

    #[tokio::test]
    async fn concurrent_add_remove_keeps_set_consistent() {
        let registry = Arc::new(SubscriberRegistry::new());
        let mut tasks = Vec::new();
        for raw in 0..64u64 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (sub, _queue) = subscriber(raw);
                registry.add(sub).await.unwrap();
                if raw % 2 == 0 {
                    registry.remove(ConnectionId::from_raw(raw)).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut ids: Vec<u64> = registry.ids().await.iter().map(|id| id.as_u64()).collect();
        ids.sort_unstable();
        let expected: Vec<u64> = (0..64).filter(|n| n % 2 == 1).collect();
        assert_eq!(ids, expected);
    }
}
