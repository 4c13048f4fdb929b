use std::sync::Arc;

use anyhow::Result;
use blob_store::BlobStorageConfig;
use rpc::{EmbeddedHandler, EmbeddedHandlerRegistry};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, config_sync::StaticConfigProvider, service::Service};

/// Echo-style embedded connector used by the integration tests: answers
/// every request with a generic success envelope, and health checks with a
/// healthy status.
pub struct HealthyHandler;

impl EmbeddedHandler for HealthyHandler {
    fn handle(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let request: serde_json::Value = serde_json::from_slice(payload)?;
        if request.get("type").and_then(|t| t.as_str()) == Some("HealthCheck") {
            return Ok(br#"{"type":"HealthStatus","status":"OK"}"#.to_vec());
        }
        Ok(br#"{"type":"SuccessResponse","status":"processed"}"#.to_vec())
    }
}

/// Embedded connector whose health checks always fail.
pub struct UnhealthyHandler;

impl EmbeddedHandler for UnhealthyHandler {
    fn handle(&self, _payload: &[u8]) -> Result<Vec<u8>> {
        Ok(br#"{"type":"ErrorResponse","error":"Exception","errorMessage":"storage down"}"#.to_vec())
    }
}

pub struct TestService {
    pub service: Service,
    pub provider: Arc<StaticConfigProvider>,
    _temp_dir: tempfile::TempDir,
}

impl TestService {
    pub fn new() -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let config = ServerConfig {
            blob_storage: BlobStorageConfig {
                path: Some(format!(
                    "file://{}",
                    temp_dir.path().join("blob_store").to_str().unwrap()
                )),
                region: "test".to_string(),
            },
            ..Default::default()
        };

        let handlers = Arc::new(EmbeddedHandlerRegistry::new());
        handlers.register("healthy", Arc::new(HealthyHandler));
        handlers.register("unhealthy", Arc::new(UnhealthyHandler));

        let provider = Arc::new(StaticConfigProvider::new());
        let service = Service::new(config, provider.clone(), handlers)?;
        Ok(Self {
            service,
            provider,
            _temp_dir: temp_dir,
        })
    }
}
