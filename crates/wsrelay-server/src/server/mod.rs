//! Relay server: accepts downstream connections and runs the upstream links.

mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use wsrelay_core::{RelayConfig, RelaySettings, Role};

use crate::error::RelayError;
use crate::events::EventBus;
use crate::registry::SubscriberRegistry;
use crate::router::BroadcastRouter;
use crate::upstream::{Dialer, LinkConfig, UpstreamHandle, UpstreamLink, WsDialer};

use session::SessionContext;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A hub or bridge relay.
///
/// One [`UpstreamLink`] runs per configured upstream address; every accepted
/// downstream connection becomes a subscriber (unless it is a loopback
/// publisher) and is fed by the shared [`BroadcastRouter`].
pub struct RelayServer {
    settings: RelaySettings,
    registry: Arc<SubscriberRegistry>,
    router: Arc<BroadcastRouter>,
    events: EventBus,
    dialer: Arc<dyn Dialer>,
    upstreams: RwLock<Vec<UpstreamHandle>>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(settings: RelaySettings) -> Self {
        let registry = Arc::new(SubscriberRegistry::new());
        let events = EventBus::default();
        let router = Arc::new(BroadcastRouter::new(
            Arc::clone(&registry),
            events.clone(),
            settings.send_timeout,
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            registry,
            router,
            events,
            dialer: Arc::new(WsDialer),
            upstreams: RwLock::new(Vec::new()),
            shutdown,
        }
    }

    /// Validate `config` and build a server from it.
    pub fn from_config(config: &RelayConfig) -> Result<Self, RelayError> {
        Ok(Self::new(config.validate()?))
    }

    /// Replace the upstream dialer.
    #[must_use]
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub const fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub const fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub const fn router(&self) -> &Arc<BroadcastRouter> {
        &self.router
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Handles for the running upstream links (empty before `serve`).
    pub async fn upstreams(&self) -> Vec<UpstreamHandle> {
        self.upstreams.read().await.clone()
    }

    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        let listener = TcpListener::bind(self.settings.bind).await?;
        Ok(listener)
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn start(&self) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let local: SocketAddr = listener.local_addr()?;
        let mut shutdown = self.shutdown.subscribe();

        info!(
            addr = %local,
            role = %self.settings.role,
            upstreams = self.settings.upstreams.len(),
            "Relay server listening"
        );

        let mut links = JoinSet::new();
        let mut handles = Vec::with_capacity(self.settings.upstreams.len());
        for url in &self.settings.upstreams {
            let (link, handle) = UpstreamLink::new(
                LinkConfig::from_settings(url.clone(), &self.settings),
                Arc::clone(&self.dialer),
                Arc::clone(&self.router),
                self.events.clone(),
            );
            links.spawn(link.run(self.shutdown.subscribe()));
            handles.push(handle);
        }
        *self.upstreams.write().await = handles.clone();

        let bridge_upstream = match self.settings.role {
            Role::Bridge => handles.into_iter().next(),
            Role::Hub => None,
        };
        let ctx = Arc::new(SessionContext::new(
            &self.settings,
            Arc::clone(&self.registry),
            Arc::clone(&self.router),
            self.events.clone(),
            bridge_upstream,
        ));

        let mut sessions = JoinSet::new();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        sessions.spawn(session::run(
                            Arc::clone(&ctx),
                            stream,
                            peer,
                            self.shutdown.subscribe(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Session task failed");
                    }
                }
                _ = shutdown.changed() => {}
            }
        }

        info!("Relay server shutting down");
        drop(listener);
        drop(self.registry.drain().await);

        while let Some(joined) = links.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Upstream link task failed");
            }
        }
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Session task failed");
            }
        }

        info!("Relay server stopped");
        Ok(())
    }

    /// Ask a running [`serve`](Self::serve) to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("bind", &self.settings.bind)
            .field("role", &self.settings.role)
            .field("upstreams", &self.settings.upstreams)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn settings() -> RelaySettings {
        RelayConfig {
            bind_address: "127.0.0.1".into(),
            bind_port: 0,
            ..RelayConfig::default()
        }
        .validate()
        .unwrap()
    }

    #[test]
    fn invalid_config_is_a_config_error() {
        let config = RelayConfig {
            role: Role::Bridge,
            ..RelayConfig::default()
        };
        assert!(matches!(
            RelayServer::from_config(&config),
            Err(RelayError::Config(_))
        ));

        let config = RelayConfig {
            upstream_addresses: vec!["ws://10.0.0.5:20000".into()],
            ..RelayConfig::default()
        };
        let server = RelayServer::from_config(&config).unwrap();
        assert_eq!(server.settings().upstreams, vec!["ws://10.0.0.5:20000"]);
    }

    #[tokio::test]
    async fn shutdown_before_serve_returns_immediately() {
        let server = RelayServer::new(settings());
        let listener = server.bind().await.unwrap();
        server.shutdown();
        assert!(server.is_shutting_down());

        server.serve(listener).await.unwrap();
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn no_upstreams_means_no_links() {
        let server = Arc::new(RelayServer::new(settings()));
        let listener = server.bind().await.unwrap();
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(listener).await }
        });

        tokio::task::yield_now().await;
        assert!(server.upstreams().await.is_empty());
        server.shutdown();
        task.await.unwrap().unwrap();
    }
}
