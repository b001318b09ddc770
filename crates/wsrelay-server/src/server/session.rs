//! Per-connection downstream session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use wsrelay_core::{RelaySettings, Role};

use crate::error::RelayError;
use crate::events::{EventBus, EventKind};
use crate::registry::{Subscriber, SubscriberQueue, SubscriberRegistry};
use crate::router::BroadcastRouter;
use crate::transport::{Connection, ConnectionId, Payload, PayloadSink};
use crate::upstream::UpstreamHandle;

/// Everything a session needs, shared by all sessions of one server run.
pub(super) struct SessionContext {
    pub registry: Arc<SubscriberRegistry>,
    pub router: Arc<BroadcastRouter>,
    pub events: EventBus,
    /// Set in bridge role only.
    pub upstream: Option<UpstreamHandle>,
    pub role: Role,
    pub greeting: Option<String>,
    pub rebroadcast_inbound: bool,
    pub loopback_publishers: bool,
    pub send_timeout: Duration,
    pub handshake_timeout: Duration,
    pub subscriber_queue: usize,
}

impl SessionContext {
    pub fn new(
        settings: &RelaySettings,
        registry: Arc<SubscriberRegistry>,
        router: Arc<BroadcastRouter>,
        events: EventBus,
        upstream: Option<UpstreamHandle>,
    ) -> Self {
        Self {
            registry,
            router,
            events,
            upstream,
            role: settings.role,
            greeting: settings.greeting.clone(),
            rebroadcast_inbound: settings.rebroadcast_inbound,
            loopback_publishers: settings.loopback_publishers,
            send_timeout: settings.send_timeout,
            handshake_timeout: settings.handshake_timeout,
            subscriber_queue: settings.subscriber_queue,
        }
    }

    /// Apply the role rules to one inbound payload.
    async fn handle_inbound(&self, id: ConnectionId, payload: Payload) {
        match self.role {
            Role::Bridge => {
                let Some(upstream) = &self.upstream else {
                    return;
                };
                if let Err(e) = upstream.forward(payload) {
                    warn!(conn = %id, upstream = upstream.url(), error = %e, "Dropped inbound payload");
                }
            }
            Role::Hub if self.rebroadcast_inbound => {
                let report = self.router.dispatch(payload).await;
                trace!(conn = %id, delivered = report.delivered, failed = report.failed, "Rebroadcast inbound payload");
            }
            Role::Hub => {
                trace!(conn = %id, kind = payload.kind(), len = payload.len(), "Ignoring inbound payload");
            }
        }
    }
}

/// Drive one accepted TCP stream from handshake to disconnect.
pub(super) async fn run(
    ctx: Arc<SessionContext>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws = match timeout(ctx.handshake_timeout, tokio_tungstenite::accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            reject(peer, &e.to_string());
            return;
        }
        Err(_) => {
            reject(
                peer,
                &format!("timed out after {}ms", ctx.handshake_timeout.as_millis()),
            );
            return;
        }
    };

    if *shutdown.borrow() {
        return;
    }

    let conn = Connection::from_websocket(peer.to_string(), ws);
    let id = conn.id();
    let (sink, mut stream) = conn.into_split();

    let publish_only = ctx.loopback_publishers && peer.ip().is_loopback();
    let mut writer: Option<JoinHandle<()>> = None;
    let mut idle_sink: Option<PayloadSink> = None;

    if publish_only {
        info!(conn = %id, %peer, "Publisher connected");
        ctx.events.emit(EventKind::Connect, id, format!("publisher {peer}"));
        idle_sink = Some(sink);
    } else {
        let (subscriber, queue) = Subscriber::channel(id, peer.to_string(), ctx.subscriber_queue);
        let subscriber = Arc::new(subscriber);
        if let Err(e) = ctx.registry.add(Arc::clone(&subscriber)).await {
            warn!(conn = %id, %peer, error = %e, "Could not register subscriber");
            return;
        }
        ctx.events.emit(EventKind::Connect, id, format!("subscriber {peer}"));
        writer = Some(tokio::spawn(write_loop(
            id,
            sink,
            queue,
            ctx.events.clone(),
            ctx.send_timeout,
        )));

        if let Some(greeting) = &ctx.greeting {
            if let Err(e) = subscriber.send(Payload::text(greeting.clone()), ctx.send_timeout).await {
                debug!(conn = %id, error = %e, "Greeting not delivered");
            }
        }
    }

    let reason = loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(payload)) => ctx.handle_inbound(id, payload).await,
                Some(Err(e)) => break e.to_string(),
                None => break "closed by peer".to_string(),
            },
            () = writer_finished(&mut writer) => {
                writer = None;
                break "writer stopped".to_string();
            }
            _ = shutdown.changed() => break "relay shutting down".to_string(),
        }
    };

    if ctx.registry.remove(id).await.is_some() {
        debug!(conn = %id, "Subscriber removed");
    }
    ctx.events.emit(EventKind::Disconnect, id, reason);

    if let Some(mut handle) = writer {
        // Retired queue lets the writer send its close frame and exit.
        if timeout(ctx.send_timeout, &mut handle).await.is_err() {
            handle.abort();
        }
    }
    if let Some(mut sink) = idle_sink {
        let _ = timeout(ctx.send_timeout, sink.close()).await;
    }
}

fn reject(peer: SocketAddr, reason: &str) {
    let err = RelayError::HandshakeFailure {
        peer: peer.to_string(),
        reason: reason.to_string(),
    };
    warn!(%peer, error = %err, "Rejected downstream connection");
}

async fn writer_finished(writer: &mut Option<JoinHandle<()>>) {
    match writer {
        Some(handle) => {
            let _ = handle.await;
        }
        None => std::future::pending().await,
    }
}

/// Drain a subscriber's queue into its socket.
///
/// Each write is bounded by `send_timeout`; a slow or failed write ends the
/// writer, which the session treats as the subscriber going away.
async fn write_loop(
    id: ConnectionId,
    mut sink: PayloadSink,
    mut queue: SubscriberQueue,
    events: EventBus,
    send_timeout: Duration,
) {
    while let Some(payload) = queue.recv().await {
        let result = match timeout(send_timeout, sink.send(payload)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::SendTimeout(send_timeout)),
        };
        if let Err(e) = result {
            if !matches!(e, RelayError::ConnectionClosed(_)) {
                events.emit(EventKind::SendFailure, id, e.to_string());
            }
            return;
        }
    }

    if let Ok(Err(e)) = timeout(send_timeout, sink.close()).await {
        trace!(conn = %id, error = %e, "Close frame not sent");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures_util::Sink;

    use super::*;

    /// Sink that accepts nothing, ever.
    struct StalledSink;

    impl Sink<Payload> for StalledSink {
        type Error = RelayError;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), RelayError>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Payload) -> Result<(), RelayError> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), RelayError>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), RelayError>> {
            Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_socket_write_is_reported_as_send_failure() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let id = ConnectionId::next();
        let (subscriber, queue) = Subscriber::channel(id, "10.0.0.9:4000", 4);

        let writer = tokio::spawn(write_loop(
            id,
            Box::pin(StalledSink),
            queue,
            events,
            Duration::from_millis(50),
        ));
        subscriber
            .send(Payload::text("stuck"), Duration::from_secs(1))
            .await
            .unwrap();

        writer.await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_kind, EventKind::SendFailure);
        assert_eq!(event.connection_identity, id.to_string());
    }

    #[tokio::test]
    async fn writer_exits_when_every_handle_is_gone() {
        let (mut local, remote) = crate::transport::memory::duplex(4);
        let (sink, _stream) = remote.into_split();
        let id = ConnectionId::next();
        let (subscriber, queue) = Subscriber::channel(id, "10.0.0.9:4000", 4);

        let writer = tokio::spawn(write_loop(
            id,
            sink,
            queue,
            EventBus::default(),
            Duration::from_secs(1),
        ));
        subscriber
            .send(Payload::text("last"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(local.recv().await.unwrap().unwrap(), Payload::text("last"));

        drop(subscriber);
        writer.await.unwrap();
    }
}
