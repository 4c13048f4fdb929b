use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use data_model::{ConnectorConfig, RemoteFunctionKind};
use tracing::{debug, warn};

use crate::{call::FunctionCall, error::RpcError, transport::FunctionTransport};

pub const DEFAULT_CLOUD_ENDPOINT_TEMPLATE: &str = "https://functions.{region}.geohub.cloud";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloudClientKey {
    pub region: String,
    pub role: Option<String>,
}

struct PoolEntry {
    client: reqwest::Client,
    refs: usize,
}

/// Underlying cloud-function clients shared by credentials: connectors with
/// the same (region, assumed role) reuse one client instance. An entry is
/// only dropped after a grace period with zero references, so a connector
/// that is destroyed and immediately recreated does not rebuild connections.
pub struct CloudClientPool {
    entries: Mutex<HashMap<CloudClientKey, PoolEntry>>,
    endpoint_template: String,
    grace: Duration,
}

impl CloudClientPool {
    pub fn new(endpoint_template: String, grace: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            endpoint_template,
            grace,
        }
    }

    pub fn invocation_url(&self, region: &str, function_arn: &str) -> String {
        let base = self.endpoint_template.replace("{region}", region);
        format!("{base}/v1/functions/{function_arn}/invocations")
    }

    pub fn acquire(&self, key: &CloudClientKey) -> reqwest::Client {
        let mut entries = self.entries.lock().expect("pool lock poisoned");
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            debug!(region = %key.region, "creating shared cloud function client");
            PoolEntry {
                client: reqwest::Client::builder()
                    .connect_timeout(Duration::from_secs(5))
                    .build()
                    .expect("failed to build cloud function client"),
                refs: 0,
            }
        });
        entry.refs += 1;
        entry.client.clone()
    }

    pub fn release(self: &Arc<Self>, key: &CloudClientKey) {
        let mut entries = self.entries.lock().expect("pool lock poisoned");
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        // In-flight requests hold their own clone of the client, so dropping
        // the pooled entry after the grace period never interrupts them.
        let pool = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(pool.grace).await;
            let mut entries = pool.entries.lock().expect("pool lock poisoned");
            if entries.get(&key).is_some_and(|e| e.refs == 0) {
                debug!(region = %key.region, "dropping unreferenced cloud function client");
                entries.remove(&key);
            }
        });
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

struct CloudTarget {
    key: CloudClientKey,
    function_arn: String,
    client: reqwest::Client,
}

pub struct CloudFunctionClient {
    pool: Arc<CloudClientPool>,
    target: RwLock<CloudTarget>,
    timeout: Duration,
}

impl CloudFunctionClient {
    pub fn new(
        pool: Arc<CloudClientPool>,
        function_arn: String,
        region: String,
        role: Option<String>,
        timeout: Duration,
    ) -> Self {
        let key = CloudClientKey { region, role };
        let client = pool.acquire(&key);
        Self {
            pool,
            target: RwLock::new(CloudTarget {
                key,
                function_arn,
                client,
            }),
            timeout,
        }
    }

    fn snapshot(&self) -> (CloudClientKey, String, reqwest::Client) {
        let target = self.target.read().expect("target lock poisoned");
        (
            target.key.clone(),
            target.function_arn.clone(),
            target.client.clone(),
        )
    }
}

#[async_trait]
impl FunctionTransport for CloudFunctionClient {
    async fn invoke(&self, call: &FunctionCall) -> Result<Bytes, RpcError> {
        let (key, function_arn, client) = self.snapshot();
        let url = self.pool.invocation_url(&key.region, &function_arn);

        let mut request = client
            .post(&url)
            .header("Content-Type", "application/json")
            .header(crate::transport::http::STREAM_ID_HEADER, call.stream_id.as_str())
            .timeout(self.timeout)
            .body(call.payload.clone());
        if let Some(role) = &key.role {
            request = request.header("X-Function-Role", role);
        }

        let result = tokio::select! {
            _ = call.cancel_token().cancelled() => {
                // Best-effort upstream cancel; the remote side may ignore it.
                let cancel_request = client
                    .post(&url)
                    .header("X-Invocation-Action", "cancel")
                    .header(crate::transport::http::STREAM_ID_HEADER, call.stream_id.as_str())
                    .timeout(Duration::from_secs(2));
                let stream_id = call.stream_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = cancel_request.send().await {
                        debug!(stream_id = %stream_id, "cloud function cancel hint failed: {e}");
                    }
                });
                return Err(RpcError::Cancelled);
            }
            r = request.send() => r,
        };

        match result {
            Ok(response) => {
                let status = response.status();
                let body = response.bytes().await.map_err(|e| {
                    RpcError::BadGateway(format!("failed reading cloud function response: {e}"))
                })?;
                if body.is_empty() && !status.is_success() {
                    return Err(RpcError::BadGateway(format!(
                        "cloud function responded with status {status} and an empty body"
                    )));
                }
                Ok(body)
            }
            Err(e) if e.is_timeout() => Err(RpcError::GatewayTimeout(format!(
                "cloud function did not respond within {:?}",
                self.timeout
            ))),
            Err(e) => Err(RpcError::BadGateway(format!(
                "cloud function invocation failed: {e}"
            ))),
        }
    }

    fn on_config_update(&self, config: &ConnectorConfig) {
        let RemoteFunctionKind::CloudFunction {
            function_arn,
            region,
            role,
        } = &config.remote_function.kind
        else {
            warn!(
                connector = config.id.get(),
                "cloud function client received a non-cloud configuration"
            );
            return;
        };
        let new_key = CloudClientKey {
            region: region.clone(),
            role: role.clone(),
        };
        let mut target = self.target.write().expect("target lock poisoned");
        target.function_arn = function_arn.clone();
        if target.key != new_key {
            let old_key = std::mem::replace(&mut target.key, new_key);
            target.client = self.pool.acquire(&target.key);
            self.pool.release(&old_key);
        }
    }

    async fn close(&self) {
        let key = self.target.read().expect("target lock poisoned").key.clone();
        self.pool.release(&key);
    }
}
