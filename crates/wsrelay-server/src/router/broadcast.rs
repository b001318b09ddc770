//! Broadcast router that delivers each payload to every current subscriber.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, trace};

use crate::events::{EventBus, EventKind};
use crate::registry::SubscriberRegistry;
use crate::transport::Payload;

/// Outcome of a single [`BroadcastRouter::dispatch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Subscribers the payload was handed to.
    pub delivered: usize,
    /// Subscribers that failed and were removed.
    pub failed: usize,
}

/// Fans payloads out to a registry snapshot.
#[derive(Clone)]
pub struct BroadcastRouter {
    registry: Arc<SubscriberRegistry>,
    events: EventBus,
    send_timeout: Duration,
}

impl BroadcastRouter {
    pub const fn new(
        registry: Arc<SubscriberRegistry>,
        events: EventBus,
        send_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            send_timeout,
        }
    }

    /// Deliver `payload` to every subscriber present at snapshot time.
    ///
    /// Sends run concurrently, each bounded by the send timeout, and all of
    /// them finish before this returns. Awaiting `dispatch` before handing in
    /// the next payload from the same source therefore preserves per-source
    /// order for every subscriber. A failing subscriber is removed from the
    /// registry; its failure never affects the others and is not returned.
    pub async fn dispatch(&self, payload: Payload) -> DeliveryReport {
        let snapshot = self.registry.snapshot().await;
        if snapshot.is_empty() {
            trace!(kind = payload.kind(), bytes = payload.len(), "No subscribers, payload dropped");
            return DeliveryReport::default();
        }

        let sends = snapshot
            .iter()
            .filter(|subscriber| !subscriber.is_retired())
            .map(|subscriber| {
                let payload = payload.clone();
                async move { (subscriber, subscriber.send(payload, self.send_timeout).await) }
            });
        let outcomes = join_all(sends).await;

        let mut report = DeliveryReport::default();
        for (subscriber, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                // Lost a race with a concurrent removal; not a send failure.
                Err(_) if subscriber.is_retired() => {}
                Err(e) => {
                    report.failed += 1;
                    self.events
                        .emit(EventKind::SendFailure, subscriber.id(), e.to_string());
                    self.registry.remove(subscriber.id()).await;
                }
            }
        }

        debug!(
            kind = payload.kind(),
            bytes = payload.len(),
            delivered = report.delivered,
            failed = report.failed,
            "Payload dispatched"
        );
        report
    }

    pub const fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub const fn send_timeout(&self) -> Duration {
        self.send_timeout
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events::RelayEvent;
    use crate::registry::{Subscriber, SubscriberQueue};
    use crate::transport::ConnectionId;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn router() -> (BroadcastRouter, Arc<SubscriberRegistry>, EventBus) {
        let registry = Arc::new(SubscriberRegistry::new());
        let events = EventBus::default();
        let router = BroadcastRouter::new(Arc::clone(&registry), events.clone(), TIMEOUT);
        (router, registry, events)
    }

    async fn join(
        registry: &SubscriberRegistry,
        capacity: usize,
    ) -> (Arc<Subscriber>, SubscriberQueue) {
        let (sub, queue) = Subscriber::channel(ConnectionId::next(), "test-peer", capacity);
        let sub = Arc::new(sub);
        registry.add(Arc::clone(&sub)).await.unwrap();
        (sub, queue)
    }

    fn drain_now(queue: &mut SubscriberQueue) -> Vec<Payload> {
        let mut out = Vec::new();
        while let Some(Some(p)) = futures_util::FutureExt::now_or_never(queue.recv()) {
            out.push(p);
        }
        out
    }

    #[tokio::test]
    async fn both_subscribers_receive_ping_exactly_once() {
        let (router, registry, _events) = router();
        let (_a, mut qa) = join(&registry, 8).await;
        let (_b, mut qb) = join(&registry, 8).await;

        let report = router.dispatch(Payload::text("ping")).await;

        assert_eq!(report, DeliveryReport { delivered: 2, failed: 0 });
        assert_eq!(drain_now(&mut qa), vec![Payload::text("ping")]);
        assert_eq!(drain_now(&mut qb), vec![Payload::text("ping")]);
    }

    #[tokio::test]
    async fn removed_subscriber_receives_nothing() {
        let (router, registry, _events) = router();
        let (a, mut qa) = join(&registry, 8).await;
        let (_b, mut qb) = join(&registry, 8).await;

        registry.remove(a.id()).await;
        router.dispatch(Payload::text("ping")).await;

        assert!(drain_now(&mut qa).is_empty());
        assert_eq!(drain_now(&mut qb), vec![Payload::text("ping")]);
    }

    #[tokio::test]
    async fn per_source_order_is_preserved() {
        let (router, registry, _events) = router();
        let (_a, mut qa) = join(&registry, 64).await;
        let (_b, mut qb) = join(&registry, 64).await;

        let sent: Vec<Payload> = (0..32).map(|i| Payload::text(format!("m{i}"))).collect();
        for payload in &sent {
            router.dispatch(payload.clone()).await;
        }

        assert_eq!(drain_now(&mut qa), sent);
        assert_eq!(drain_now(&mut qb), sent);
    }

    #[tokio::test]
    async fn failed_subscriber_is_removed_without_affecting_others() {
        let (router, registry, events) = router();
        let mut event_rx = events.subscribe();
        let (dead, dead_queue) = join(&registry, 8).await;
        let (_live, mut live_queue) = join(&registry, 8).await;
        drop(dead_queue);

        let report = router.dispatch(Payload::binary(vec![1u8, 2, 3])).await;

        assert_eq!(report, DeliveryReport { delivered: 1, failed: 1 });
        assert_eq!(drain_now(&mut live_queue), vec![Payload::binary(vec![1u8, 2, 3])]);
        assert!(!registry.contains(dead.id()).await);

        let event: RelayEvent = event_rx.recv().await.unwrap();
        assert_eq!(event.event_kind, EventKind::SendFailure);
        assert_eq!(event.connection_identity, dead.id().to_string());
    }

    #[tokio::test]
    async fn stalled_subscriber_times_out_and_responsive_one_keeps_receiving() {
        let (router, registry, _events) = router();
        // Capacity 1 and never drained: the second send blocks.
        let (stalled, _stalled_queue) = join(&registry, 1).await;
        let (_responsive, mut responsive_queue) = join(&registry, 8).await;

        router.dispatch(Payload::text("first")).await;
        let report = router.dispatch(Payload::text("second")).await;
        assert_eq!(report, DeliveryReport { delivered: 1, failed: 1 });
        assert!(!registry.contains(stalled.id()).await);

        let report = router.dispatch(Payload::text("third")).await;
        assert_eq!(report, DeliveryReport { delivered: 1, failed: 0 });
        assert_eq!(
            drain_now(&mut responsive_queue),
            vec![
                Payload::text("first"),
                Payload::text("second"),
                Payload::text("third")
            ]
        );
    }

    #[tokio::test]
    async fn dispatch_without_subscribers_is_a_noop() {
        let (router, _registry, _events) = router();
        assert_eq!(
            router.dispatch(Payload::text("nobody")).await,
            DeliveryReport::default()
        );
    }
}
