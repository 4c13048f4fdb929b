use std::{error::Error as StdError, io, sync::RwLock, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use data_model::{ConnectorConfig, RemoteFunctionKind};
use tracing::warn;

use crate::{call::FunctionCall, error::RpcError, transport::FunctionTransport};

pub const STREAM_ID_HEADER: &str = "Stream-Id";

/// Invokes a connector behind a plain HTTP endpoint with a single POST per
/// call. A request that dies on a connection the server already closed is
/// retried exactly once; the retry is invisible to the caller.
pub struct HttpFunctionClient {
    client: reqwest::Client,
    url: RwLock<String>,
    timeout: Duration,
}

impl HttpFunctionClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: RwLock::new(url),
            timeout,
        })
    }

    fn url(&self) -> String {
        self.url.read().expect("url lock poisoned").clone()
    }
}

#[async_trait]
impl FunctionTransport for HttpFunctionClient {
    async fn invoke(&self, call: &FunctionCall) -> Result<Bytes, RpcError> {
        let url = self.url();
        let mut attempt = 0;
        loop {
            let request = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .header(STREAM_ID_HEADER, call.stream_id.as_str())
                .timeout(self.timeout)
                .body(call.payload.clone());

            let result = tokio::select! {
                _ = call.cancel_token().cancelled() => return Err(RpcError::Cancelled),
                r = request.send() => r,
            };

            match result {
                Ok(response) => {
                    let status = response.status();
                    let body = response.bytes().await.map_err(|e| {
                        RpcError::BadGateway(format!("failed reading connector response: {e}"))
                    })?;
                    if body.is_empty() && !status.is_success() {
                        return Err(RpcError::BadGateway(format!(
                            "connector responded with status {status} and an empty body"
                        )));
                    }
                    // Connector-level errors travel in-band as an
                    // ErrorResponse body and are mapped by the protocol layer.
                    return Ok(body);
                }
                Err(e) if e.is_timeout() => {
                    return Err(RpcError::GatewayTimeout(format!(
                        "remote function did not respond within {:?}",
                        self.timeout
                    )));
                }
                Err(e) if attempt == 0 && is_connection_closed(&e) => {
                    warn!(
                        stream_id = %call.stream_id,
                        "connection already closed, retrying once: {e}"
                    );
                    attempt += 1;
                }
                Err(e) => {
                    return Err(RpcError::BadGateway(format!(
                        "connection to remote function failed: {e}"
                    )));
                }
            }
        }
    }

    fn on_config_update(&self, config: &ConnectorConfig) {
        if let RemoteFunctionKind::Http { url } = &config.remote_function.kind {
            *self.url.write().expect("url lock poisoned") = url.clone();
        }
    }
}

/// The "connection already closed" class: the server (or a middlebox) tore
/// the connection down under a request that was otherwise fine. Distinct
/// from a timeout and safe to retry once.
fn is_connection_closed(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() || hyper_err.is_canceled() {
                return true;
            }
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}
