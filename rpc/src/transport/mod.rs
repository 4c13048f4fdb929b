pub mod cloud;
pub mod embedded;
pub mod http;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use data_model::{ConnectorConfig, RemoteFunctionKind};

use crate::{call::FunctionCall, error::RpcError};
pub use crate::transport::{
    cloud::{CloudClientPool, CloudFunctionClient},
    embedded::{EmbeddedFunctionClient, EmbeddedHandler, EmbeddedHandlerRegistry},
    http::HttpFunctionClient,
};

/// The one seam between the admission core and the wire. An adapter reports
/// exactly one outcome per invocation and classifies its own failures; it
/// must watch the call's cancel token and give up early when it trips.
#[async_trait]
pub trait FunctionTransport: Send + Sync {
    async fn invoke(&self, call: &FunctionCall) -> Result<Bytes, RpcError>;

    /// Reacts to a hot-swapped connector configuration.
    fn on_config_update(&self, _config: &ConnectorConfig) {}

    /// Releases transport resources when the owning client is destroyed.
    async fn close(&self) {}
}

/// Everything transports share across the process, owned by the registry.
pub struct TransportDeps {
    pub cloud_pool: Arc<CloudClientPool>,
    pub handlers: Arc<EmbeddedHandlerRegistry>,
    pub request_timeout: Duration,
}

pub fn build_transport(
    config: &ConnectorConfig,
    deps: &TransportDeps,
) -> Result<Arc<dyn FunctionTransport>> {
    match &config.remote_function.kind {
        RemoteFunctionKind::CloudFunction {
            function_arn,
            region,
            role,
        } => Ok(Arc::new(CloudFunctionClient::new(
            deps.cloud_pool.clone(),
            function_arn.clone(),
            region.clone(),
            role.clone(),
            deps.request_timeout,
        ))),
        RemoteFunctionKind::Http { url } => Ok(Arc::new(HttpFunctionClient::new(
            url.clone(),
            deps.request_timeout,
        )?)),
        RemoteFunctionKind::Embedded { handler } => {
            let handler_impl = deps.handlers.get(handler)?;
            Ok(Arc::new(EmbeddedFunctionClient::new(
                config.id.clone(),
                handler_impl,
                config.max_connections(),
                deps.request_timeout,
            )))
        }
    }
}
