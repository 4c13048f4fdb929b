use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use data_model::{ConnectorConfig, ConnectorId};
use rpc::ClientRegistry;
use tokio::{
    sync::{oneshot, watch},
    time::Instant,
};
use tracing::{error, info, warn};

use crate::{config::ConfigSyncConfig, health::ConnectorHealth};

/// Narrow interface to wherever connector configurations live. The sync loop
/// only ever asks for the full current list.
#[async_trait]
pub trait ConnectorConfigProvider: Send + Sync {
    async fn list_connectors(&self) -> Result<Vec<ConnectorConfig>>;
}

/// Reads the connector list from a YAML file on every tick.
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConnectorConfigProvider for FileConfigProvider {
    async fn list_connectors(&self) -> Result<Vec<ConnectorConfig>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading connector list from {:?}", self.path))?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

/// In-memory provider used by tests and embedded deployments.
#[derive(Default)]
pub struct StaticConfigProvider {
    connectors: Mutex<Vec<ConnectorConfig>>,
}

impl StaticConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, connectors: Vec<ConnectorConfig>) {
        *self.connectors.lock().expect("connector list lock poisoned") = connectors;
    }
}

#[async_trait]
impl ConnectorConfigProvider for StaticConfigProvider {
    async fn list_connectors(&self) -> Result<Vec<ConnectorConfig>> {
        Ok(self
            .connectors
            .lock()
            .expect("connector list lock poisoned")
            .clone())
    }
}

/// Background reconciliation of the client registry against the configured
/// connector list: creates clients lazily, hot-swaps changed configurations
/// in place and destroys clients for removed, deactivated or unhealthy
/// connectors. Runs for the life of the process; a failing tick is logged
/// and the loop carries on.
pub struct ConfigSync {
    provider: Arc<dyn ConnectorConfigProvider>,
    registry: Arc<ClientRegistry>,
    health: Arc<ConnectorHealth>,
    config: ConfigSyncConfig,
    initialized_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ConfigSync {
    pub fn new(
        provider: Arc<dyn ConnectorConfigProvider>,
        registry: Arc<ClientRegistry>,
        health: Arc<ConnectorHealth>,
        config: ConfigSyncConfig,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (initialized_tx, initialized_rx) = oneshot::channel();
        (
            Arc::new(Self {
                provider,
                registry,
                health,
                config,
                initialized_tx: Mutex::new(Some(initialized_tx)),
            }),
            initialized_rx,
        )
    }

    pub async fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        info!("starting connector config sync");
        let interval = Duration::from_secs(self.config.interval_secs);
        loop {
            let started = Instant::now();
            if let Err(e) = self.tick().await {
                error!("unexpected error during connector update: {e:?}");
            }
            // Self-pace to the configured interval minus our own runtime.
            let wait = interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.changed() => {
                    info!("config sync shutting down");
                    break;
                }
            }
        }
    }

    /// One reconciliation pass. Public so the test harness can drive the
    /// state machine tick by tick.
    pub async fn tick(&self) -> Result<()> {
        let connectors = self.provider.list_connectors().await?;

        let mut connector_map: HashMap<ConnectorId, ConnectorConfig> = HashMap::new();
        for connector in connectors {
            if connector.id.is_empty() {
                warn!("found connector entry without an id in the connector list, skipping");
                continue;
            }
            if !connector.active {
                continue;
            }
            connector_map.insert(connector.id.clone(), connector);
        }

        for config in connector_map.values() {
            if let Err(e) = self.registry.get_or_create(config) {
                error!(
                    connector = config.id.get(),
                    "error while trying to create connector client: {e:?}"
                );
            }
        }

        for client in self.registry.all() {
            let old_config = client.connector_config();
            let new_config = connector_map.get(&old_config.id).cloned();

            let unhealthy = match &new_config {
                Some(config) => {
                    self.config.enable_health_checks &&
                        !config.skip_auto_disable &&
                        self.health.consecutive_failures(&old_config.id) >=
                            self.config.unhealthy_threshold
                }
                None => false,
            };
            if unhealthy {
                warn!(
                    connector = old_config.id.get(),
                    "connector has {} consecutive failed health checks (threshold {}), disabling until the next sync round",
                    self.health.consecutive_failures(&old_config.id),
                    self.config.unhealthy_threshold
                );
            }

            if new_config.is_none() || unhealthy {
                if new_config.is_none() {
                    warn!(
                        connector = old_config.id.get(),
                        "connector was removed or deactivated, destroying the according client"
                    );
                }
                self.registry.destroy(&old_config.id).await;
                continue;
            }

            let new_config = new_config.expect("present and healthy");
            if *old_config != new_config {
                info!(
                    connector = new_config.id.get(),
                    "incoming connector config differs from the existing one, updating the client in place"
                );
                if let Err(e) = self.registry.update_config(&client, &new_config) {
                    error!(
                        connector = new_config.id.get(),
                        "unexpected error while updating connector configuration: {e:?}"
                    );
                }
            }
        }

        // Resolve the one-shot startup signal on the first successful pass.
        if let Some(tx) = self
            .initialized_tx
            .lock()
            .expect("initialized lock poisoned")
            .take()
        {
            let _ = tx.send(());
        }
        Ok(())
    }
}
