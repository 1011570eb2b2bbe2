use crate::authz::{AuthorizationBridge, HttpPermissionClient, PermissionService, SessionStore};
use crate::broker::{BrokerCtx, Router};
use crate::config::Config;
use crate::lifecycle::LifecycleLogger;
use crate::net::{EdgeListener, Transport};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Addresses the enabled listeners actually bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundAddrs {
    pub mqtt: Option<SocketAddr>,
    pub websocket: Option<SocketAddr>,
}

/// Wires the permission client, session store, bridge, router and listeners, and owns shutdown.
pub struct Runtime {
    config: Config,
    bridge: AuthorizationBridge,
    router: Arc<Router>,
    listeners: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        let client = HttpPermissionClient::from_config(&config.remote)?;
        Self::with_service(config, Arc::new(client))
    }

    /// Build a runtime around any permission service.
    pub fn with_service(config: Config, service: Arc<dyn PermissionService>) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sessions = Arc::new(SessionStore::new(config.authz.max_cached_topics));
        let bridge = AuthorizationBridge::new(sessions, service, LifecycleLogger::new());
        Ok(Self {
            config,
            bridge,
            router: Arc::new(Router::new()),
            listeners: Vec::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bridge(&self) -> &AuthorizationBridge {
        &self.bridge
    }

    /// Bind the enabled listeners and start accepting.
    pub async fn start(&mut self) -> Result<BoundAddrs> {
        let listeners = &self.config.listeners;
        let mut bound = BoundAddrs::default();
        let mut pending = Vec::new();
        if listeners.mqtt.enabled {
            let listener = EdgeListener::bind(Transport::Tcp, &listeners.mqtt_bind()).await?;
            bound.mqtt = Some(listener.local_addr()?);
            pending.push(listener);
        }
        if listeners.websocket.enabled {
            let listener =
                EdgeListener::bind(Transport::WebSocket, &listeners.websocket_bind()).await?;
            bound.websocket = Some(listener.local_addr()?);
            pending.push(listener);
        }
        let ctx = BrokerCtx::new(self.bridge.clone(), self.router.clone());
        for listener in pending {
            self.listeners
                .push(listener.spawn(ctx.clone(), self.shutdown_rx.clone()));
        }
        tracing::info!(
            mqtt = ?bound.mqtt,
            websocket = ?bound.websocket,
            remote = %self.config.remote.base_url()?,
            "broker started"
        );
        Ok(bound)
    }

    /// Start, then block until Ctrl-C or a shutdown request.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for shutdown signal")?;
                tracing::warn!("shutdown signal received");
            }
            _ = self.shutdown_rx.changed() => {
                tracing::info!("shutdown requested");
            }
        }
        self.shutdown().await
    }

    /// Stop accepting new connections and wait for the accept loops to exit.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.shutdown_tx
            .send(true)
            .context("failed to broadcast shutdown")?;
        for handle in self.listeners.drain(..) {
            if let Err(err) = handle.await {
                tracing::warn!("listener task ended abnormally: {err:?}");
            }
        }
        Ok(())
    }
}
