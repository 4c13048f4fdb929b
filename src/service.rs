use std::sync::Arc;

use anyhow::{Context, Result};
use blob_store::{BlobStorage, RelocationClient, WarmupLease};
use rpc::{ClientRegistry, EmbeddedHandlerRegistry};
use tokio::{
    signal,
    sync::{oneshot, watch, Mutex},
};
use tracing::info;
use uuid::Uuid;

use crate::{
    config::ServerConfig,
    config_sync::{ConfigSync, ConnectorConfigProvider},
    health::ConnectorHealth,
    warmup::Warmup,
};

#[derive(Clone)]
#[allow(dead_code)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub blob_storage: Arc<BlobStorage>,
    pub registry: Arc<ClientRegistry>,
    pub handlers: Arc<EmbeddedHandlerRegistry>,
    pub health: Arc<ConnectorHealth>,
    pub config_sync: Arc<ConfigSync>,
    pub warmup: Arc<Warmup>,
    initialized_rx: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
}

impl Service {
    pub fn new(
        config: ServerConfig,
        provider: Arc<dyn ConnectorConfigProvider>,
        handlers: Arc<EmbeddedHandlerRegistry>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let blob_storage = Arc::new(
            BlobStorage::new(config.blob_storage.clone())
                .context("error initializing BlobStorage")?,
        );
        let relocation = Arc::new(RelocationClient::new(blob_storage.clone()));
        let registry = ClientRegistry::new(config.rpc.to_settings(), relocation, handlers.clone());
        let health = Arc::new(ConnectorHealth::new());

        let (config_sync, initialized_rx) = ConfigSync::new(
            provider,
            registry.clone(),
            health.clone(),
            config.config_sync.clone(),
        );

        let lease = WarmupLease::new(
            blob_storage.clone(),
            format!("geohub-{}", Uuid::new_v4()),
            std::time::Duration::from_secs(config.warmup.lease_ttl_secs),
        );
        let warmup = Warmup::new(
            registry.clone(),
            lease,
            health.clone(),
            config.warmup.clone(),
        );

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            blob_storage,
            registry,
            handlers,
            health,
            config_sync,
            warmup,
            initialized_rx: Arc::new(Mutex::new(Some(initialized_rx))),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let config_sync = self.config_sync.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move { config_sync.start(shutdown_rx).await });

        let warmup = self.warmup.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move { warmup.start(shutdown_rx).await });

        // Wait for the first successful reconciliation before reporting up.
        if let Some(initialized_rx) = self.initialized_rx.lock().await.take() {
            initialized_rx
                .await
                .context("config sync ended before initializing")?;
            info!("connector clients initialized");
        }

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("signal received, shutting down gracefully");
            let _ = shutdown_tx.send(());
        });

        let mut shutdown_rx = self.shutdown_rx.clone();
        let _ = shutdown_rx.changed().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
