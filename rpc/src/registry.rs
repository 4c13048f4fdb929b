use std::{mem, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use blob_store::RelocationClient;
use dashmap::{mapref::entry::Entry, DashMap};
use data_model::{ConnectorConfig, ConnectorId, RemoteFunctionKind};
use metrics::rpc_stats;
use tracing::info;

use crate::{
    budgets::SharedBudgets,
    client::RpcClient,
    function_client::{RemoteFunctionClient, ResponseLimits},
    transport::{
        build_transport, cloud::DEFAULT_CLOUD_ENDPOINT_TEMPLATE, CloudClientPool,
        EmbeddedHandlerRegistry, TransportDeps,
    },
};

#[derive(Debug, Clone)]
pub struct RpcSettings {
    pub request_timeout: Duration,
    pub global_queue_byte_budget: u64,
    pub high_load_threshold: f64,
    pub response_limits: ResponseLimits,
    pub cloud_endpoint_template: String,
    pub cloud_client_grace: Duration,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(25),
            global_queue_byte_budget: 256 * 1024 * 1024,
            high_load_threshold: 0.8,
            response_limits: ResponseLimits::default(),
            cloud_endpoint_template: DEFAULT_CLOUD_ENDPOINT_TEMPLATE.to_string(),
            cloud_client_grace: Duration::from_secs(30),
        }
    }
}

/// Aggregated view over all live clients, for operational surfaces.
#[derive(Debug, Clone, Default)]
pub struct GlobalRpcStats {
    pub used_connections: i64,
    pub max_connections: i64,
    pub min_connections: i64,
    pub queued_bytes: u64,
    pub arrival_rate: f64,
    pub throughput: f64,
}

/// Maps connector ids to their singleton [`RpcClient`]. Creation is lazy and
/// idempotent, destruction explicit; every membership or configuration change
/// rebalances the queue byte budgets across the survivors.
pub struct ClientRegistry {
    clients: DashMap<ConnectorId, Arc<RpcClient>>,
    budgets: Arc<SharedBudgets>,
    deps: TransportDeps,
    relocation: Arc<RelocationClient>,
    settings: RpcSettings,
    metrics: Arc<rpc_stats::Metrics>,
}

impl ClientRegistry {
    pub fn new(
        settings: RpcSettings,
        relocation: Arc<RelocationClient>,
        handlers: Arc<EmbeddedHandlerRegistry>,
    ) -> Arc<Self> {
        let budgets = Arc::new(SharedBudgets::new(
            settings.global_queue_byte_budget,
            settings.high_load_threshold,
        ));
        let deps = TransportDeps {
            cloud_pool: Arc::new(CloudClientPool::new(
                settings.cloud_endpoint_template.clone(),
                settings.cloud_client_grace,
            )),
            handlers,
            request_timeout: settings.request_timeout,
        };
        Arc::new(Self {
            clients: DashMap::new(),
            budgets,
            deps,
            relocation,
            settings,
            metrics: Arc::new(rpc_stats::Metrics::new()),
        })
    }

    pub fn get(&self, id: &ConnectorId) -> Option<Arc<RpcClient>> {
        self.clients.get(id).map(|c| c.value().clone())
    }

    /// Returns the singleton client for the connector id, creating it when
    /// absent. Concurrent callers for the same id observe one instance.
    pub fn get_or_create(&self, config: &ConnectorConfig) -> Result<Arc<RpcClient>> {
        if config.id.is_empty() {
            return Err(anyhow!("cannot create a client without a connector id"));
        }
        if let Some(existing) = self.get(&config.id) {
            return Ok(existing);
        }
        let created = match self.clients.entry(config.id.clone()) {
            Entry::Occupied(entry) => return Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let config = Arc::new(config.clone());
                let transport = build_transport(&config, &self.deps)?;
                let function_client = RemoteFunctionClient::new(
                    config,
                    transport,
                    self.budgets.clone(),
                    self.settings.response_limits,
                );
                let client = Arc::new(RpcClient::new(
                    function_client,
                    self.relocation.clone(),
                    self.metrics.clone(),
                ));
                entry.insert(client.clone());
                client
            }
        };
        info!(connector = created.connector_config().id.get(), "created connector client");
        self.rebalance();
        Ok(created)
    }

    /// Destroys the client for the connector id, if any, and rebalances the
    /// budgets over the remaining clients.
    pub async fn destroy(&self, id: &ConnectorId) -> bool {
        let Some((_, client)) = self.clients.remove(id) else {
            return false;
        };
        info!(connector = id.get(), "destroying connector client");
        client.function_client().destroy().await;
        self.rebalance();
        true
    }

    /// Hot-swaps a live client's configuration in place: the instance keeps
    /// its identity and rate-measurement state. Only a change of the remote
    /// function kind forces a new transport adapter underneath it.
    pub fn update_config(&self, client: &RpcClient, new_config: &ConnectorConfig) -> Result<()> {
        let old_config = client.connector_config();
        let new_config = Arc::new(new_config.clone());
        let new_transport = if transport_kind_changed(
            &old_config.remote_function.kind,
            &new_config.remote_function.kind,
        ) {
            Some(build_transport(&new_config, &self.deps)?)
        } else {
            None
        };
        client
            .function_client()
            .update_config(new_config, new_transport)
            .map_err(|e| anyhow!("config update rejected: {e}"))?;
        self.rebalance();
        Ok(())
    }

    pub fn all(&self) -> Vec<Arc<RpcClient>> {
        self.clients.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn budgets(&self) -> &Arc<SharedBudgets> {
        &self.budgets
    }

    fn rebalance(&self) {
        for client in self.all() {
            client.function_client().rebalance_queue_budget();
        }
    }

    pub fn global_stats(&self) -> GlobalRpcStats {
        let mut stats = GlobalRpcStats {
            used_connections: self.budgets.used_connections(),
            max_connections: self.budgets.max_connection_sum(),
            min_connections: self.budgets.min_connection_sum(),
            ..Default::default()
        };
        for client in self.all() {
            let function_client = client.function_client();
            stats.queued_bytes += function_client.queue_byte_size();
            stats.arrival_rate += function_client.arrival_rate();
            stats.throughput += function_client.throughput();
        }
        stats
    }
}

fn transport_kind_changed(old: &RemoteFunctionKind, new: &RemoteFunctionKind) -> bool {
    if mem::discriminant(old) != mem::discriminant(new) {
        return true;
    }
    // An embedded connector pointing at another handler also needs a new
    // adapter; HTTP and cloud adapters re-target themselves in place.
    matches!(
        (old, new),
        (
            RemoteFunctionKind::Embedded { handler: old_handler },
            RemoteFunctionKind::Embedded { handler: new_handler },
        ) if old_handler != new_handler
    )
}

#[cfg(test)]
mod tests {
    use blob_store::{BlobStorage, BlobStorageConfig};
    use data_model::test_objects;

    use super::*;

    fn test_registry() -> (tempfile::TempDir, Arc<ClientRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            BlobStorage::new(BlobStorageConfig {
                path: Some(format!("file://{}", dir.path().to_str().unwrap())),
                region: "test".to_string(),
            })
            .unwrap(),
        );
        let registry = ClientRegistry::new(
            RpcSettings::default(),
            Arc::new(RelocationClient::new(storage)),
            Arc::new(EmbeddedHandlerRegistry::new()),
        );
        (dir, registry)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (_dir, registry) = test_registry();
        let config = test_objects::http_connector("c1", "http://localhost:1/");
        let first = registry.get_or_create(&config).unwrap();
        let second = registry.get_or_create(&config).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_removes_and_releases_budgets() {
        let (_dir, registry) = test_registry();
        let config = test_objects::http_connector("c1", "http://localhost:1/");
        registry.get_or_create(&config).unwrap();
        assert_eq!(registry.budgets().min_connection_sum(), 1);

        assert!(registry.destroy(&config.id).await);
        assert!(!registry.destroy(&config.id).await);
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.budgets().min_connection_sum(), 0);
    }

    #[tokio::test]
    async fn test_queue_budgets_rebalance_on_membership_change() {
        let (_dir, registry) = test_registry();
        let mut a = test_objects::http_connector("a", "http://localhost:1/");
        a.connection_settings.min_connections = 3;
        let mut b = test_objects::http_connector("b", "http://localhost:1/");
        b.connection_settings.min_connections = 1;

        let client_a = registry.get_or_create(&a).unwrap();
        let budget_alone = client_a.function_client().queue_max_byte_size();
        assert_eq!(
            budget_alone,
            registry.budgets().queue_byte_budget()
        );

        registry.get_or_create(&b).unwrap();
        let budget_shared = client_a.function_client().queue_max_byte_size();
        // a now owns 3/4 of the global byte budget.
        assert_eq!(
            budget_shared,
            (registry.budgets().queue_byte_budget() as f64 * 0.75) as u64
        );
    }

    #[tokio::test]
    async fn test_update_config_keeps_instance_identity() {
        let (_dir, registry) = test_registry();
        let config = test_objects::http_connector("c1", "http://localhost:8080/v1");
        let client = registry.get_or_create(&config).unwrap();

        let mut changed = config.clone();
        changed.connection_settings.max_connections = 64;
        registry.update_config(&client, &changed).unwrap();

        let after = registry.get(&config.id).unwrap();
        assert!(Arc::ptr_eq(&client, &after));
        assert_eq!(after.connector_config().max_connections(), 64);
    }
}
