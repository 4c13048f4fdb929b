use std::{sync::Arc, time::Duration};

use anyhow::Result;
use blob_store::WarmupLease;
use data_model::{ConnectorRequest, TypedResponse};
use rpc::ClientRegistry;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{config::WarmupConfig, health::ConnectorHealth};

/// Periodic best-effort pre-warming: for every connector with a configured
/// warm-instance count, fire that many priority health checks so the backend
/// keeps instances hot. A distributed lease keeps the fleet from stampeding;
/// if the lease service is down, warmup proceeds anyway.
pub struct Warmup {
    registry: Arc<ClientRegistry>,
    lease: WarmupLease,
    health: Arc<ConnectorHealth>,
    config: WarmupConfig,
}

impl Warmup {
    pub fn new(
        registry: Arc<ClientRegistry>,
        lease: WarmupLease,
        health: Arc<ConnectorHealth>,
        config: WarmupConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            lease,
            health,
            config,
        })
    }

    pub async fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        if !self.config.enabled {
            info!("connector warmup is disabled");
            return;
        }
        info!("starting connector warmup");
        let interval = Duration::from_secs(self.config.interval_secs);
        loop {
            if let Err(e) = self.tick().await {
                error!("unexpected error during connector warmup: {e:?}");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {
                    info!("warmup shutting down");
                    break;
                }
            }
        }
    }

    pub async fn tick(&self) -> Result<()> {
        match self.lease.try_acquire().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("another node performs warmup in this interval");
                return Ok(());
            }
            Err(e) => {
                warn!("warmup lease service unavailable, proceeding best-effort: {e:?}");
            }
        }

        let mut tasks = Vec::new();
        for client in self.registry.all() {
            let config = client.connector_config();
            let warm_up = config.remote_function.warm_up;
            for instance in 0..warm_up {
                let client = client.clone();
                let health = self.health.clone();
                let connector_id = config.id.clone();
                let min_response_time_ms = self.config.min_response_time_ms;
                tasks.push(tokio::spawn(async move {
                    let stream_id = format!("warmup-{connector_id}-{instance}");
                    let request =
                        ConnectorRequest::health_check(stream_id, min_response_time_ms);
                    match client.execute(&request, true).await {
                        Ok(TypedResponse::Health(status)) if !status.is_ok() => {
                            debug!(
                                connector = connector_id.get(),
                                "warmup health check reported status {}", status.status
                            );
                            health.report_failure(&connector_id);
                        }
                        Ok(_) => health.report_success(&connector_id),
                        Err(e) => {
                            debug!(
                                connector = connector_id.get(),
                                "warmup health check failed: {e}"
                            );
                            health.report_failure(&connector_id);
                        }
                    }
                }));
            }
        }
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}
