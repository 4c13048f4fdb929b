use std::sync::Arc;

use blob_store::RelocationClient;
use bytes::Bytes;
use data_model::{
    payload, BinaryEnvelope, ConnectorConfig, ConnectorRequest, TypedPayload, TypedResponse,
};
use metrics::{rpc_stats, Timer};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::{
    call::{CallResult, FunctionCall, RpcContext},
    error::RpcError,
    function_client::RemoteFunctionClient,
};

const REQUEST_PREVIEW_LENGTH: usize = 4092;

/// Protocol layer over one connector: payload relocation on the way out,
/// decompression / envelope decoding / error mapping on the way back. All
/// failures surface as [`RpcError`] through the same completion as success.
pub struct RpcClient {
    function_client: Arc<RemoteFunctionClient>,
    relocation: Arc<RelocationClient>,
    metrics: Arc<rpc_stats::Metrics>,
}

impl RpcClient {
    pub fn new(
        function_client: Arc<RemoteFunctionClient>,
        relocation: Arc<RelocationClient>,
        metrics: Arc<rpc_stats::Metrics>,
    ) -> Self {
        Self {
            function_client,
            relocation,
            metrics,
        }
    }

    pub fn function_client(&self) -> &Arc<RemoteFunctionClient> {
        &self.function_client
    }

    pub fn connector_config(&self) -> Arc<ConnectorConfig> {
        self.function_client.config()
    }

    /// Low-level submission: relocates the payload if needed and hands the
    /// call to the admission core. Returns the context for cancellation plus
    /// the completion receiver.
    pub async fn submit(
        &self,
        request: &ConnectorRequest,
        fire_and_forget: bool,
        priority: bool,
    ) -> Result<(RpcContext, oneshot::Receiver<CallResult>), RpcError> {
        let config = self.connector_config();
        let mut bytes = request.body.clone();
        info!(
            connector = config.id.get(),
            stream_id = %request.stream_id,
            protocol_version = %config.remote_function.protocol_version,
            "invoking remote function, total uncompressed event size: {}",
            bytes.len()
        );

        if bytes.len() > config.capabilities.max_payload_size {
            if !config.capabilities.relocation_support {
                // Too large and nowhere to park it: fail before invocation.
                return Err(RpcError::PayloadTooLarge(
                    "the request entity size is over the limit for this connector".to_string(),
                ));
            }
            let pointer = self
                .relocation
                .relocate(&request.stream_id, bytes)
                .await
                .map_err(|e| RpcError::BadGateway(format!("payload relocation failed: {e}")))?;
            bytes = Bytes::from(
                serde_json::to_vec(&TypedPayload::RelocatedPayload(pointer))
                    .expect("relocation pointer is always serializable"),
            );
            self.metrics.relocated_payloads.add(1, &[]);
        }

        self.metrics.invocations.add(1, &[]);
        self.metrics.request_bytes.add(bytes.len() as u64, &[]);
        let (call, rx) = FunctionCall::new(&request.stream_id, bytes, fire_and_forget, priority);
        let context = self.function_client.submit(call);
        Ok((context, rx))
    }

    /// Request/response invocation with full decoding and validation.
    pub async fn execute(
        &self,
        request: &ConnectorRequest,
        priority: bool,
    ) -> Result<TypedResponse, RpcError> {
        let _timer = Timer::start(&self.metrics.invocation_duration);
        let result = self.execute_inner(request, priority).await;
        if result.is_err() {
            self.metrics.invocation_errors.add(1, &[]);
        }
        result
    }

    async fn execute_inner(
        &self,
        request: &ConnectorRequest,
        priority: bool,
    ) -> Result<TypedResponse, RpcError> {
        let (_context, rx) = self.submit(request, false, priority).await?;
        let bytes = rx
            .await
            .map_err(|_| RpcError::BadGateway("the invocation was dropped".to_string()))??;
        self.metrics.response_bytes.add(bytes.len() as u64, &[]);
        self.decode_response(bytes, request).await
    }

    /// Fire-and-forget: informs the connector rather than calling it. The
    /// submission and relocation path is the same as `execute`; response
    /// bytes are only ever used for failure logging.
    pub async fn send(&self, request: &ConnectorRequest) -> Result<(), RpcError> {
        let (_context, rx) = self.submit(request, true, false).await?;
        let connector = self.connector_config().id.clone();
        let stream_id = request.stream_id.clone();
        let preview = payload::preview(&request.body, REQUEST_PREVIEW_LENGTH);
        tokio::spawn(async move {
            if let Ok(Err(e)) = rx.await {
                error!(
                    connector = connector.get(),
                    stream_id = %stream_id,
                    "failed to send event to remote function: {e}; request preview: {preview}"
                );
            }
        });
        Ok(())
    }

    async fn decode_response(
        &self,
        bytes: Bytes,
        request: &ConnectorRequest,
    ) -> Result<TypedResponse, RpcError> {
        let config = self.connector_config();
        let mut bytes = bytes;
        let mut try_binary = request.expect_binary && config.capabilities.binary_tile_support;
        // The relocation chase is a loop, not recursion.
        loop {
            if bytes.is_empty() {
                return Err(RpcError::BadGateway(
                    "received an empty response from the connector".to_string(),
                ));
            }
            if payload::is_gzipped(&bytes) {
                bytes = Bytes::from(payload::decompress(&bytes).map_err(|e| {
                    RpcError::BadGateway(format!("failed to decompress connector response: {e}"))
                })?);
            }

            if try_binary {
                if let Ok(envelope) = BinaryEnvelope::from_cbor(&bytes) {
                    if envelope.is_json() {
                        // Only a wrapper; decode the inner bytes as JSON.
                        bytes = envelope.bytes;
                        try_binary = false;
                        continue;
                    }
                    return Ok(TypedResponse::Binary(envelope));
                }
                // Not a binary envelope after all (legacy or error body):
                // fall back to JSON decoding of the same bytes.
                try_binary = false;
            }

            let typed: TypedPayload = match serde_json::from_slice(&bytes) {
                Ok(typed) => typed,
                Err(e) => return Err(self.undecodable(&bytes, request, e)),
            };
            match typed {
                TypedPayload::RelocatedPayload(pointer) => {
                    bytes = self.relocation.resolve(&pointer).await.map_err(|e| {
                        RpcError::BadGateway(format!("unable to load the relocated response: {e}"))
                    })?;
                    try_binary = request.expect_binary && config.capabilities.binary_tile_support;
                }
                TypedPayload::ErrorResponse(response) => {
                    info!(
                        connector = config.id.get(),
                        stream_id = %request.stream_id,
                        "the connector responded with an error of type {}: {}",
                        response.error.as_ref(),
                        response.error_message
                    );
                    return Err(RpcError::from_error_response(response));
                }
                other => {
                    return other.into_response().map_err(|e| {
                        info!(
                            connector = config.id.get(),
                            stream_id = %request.stream_id,
                            "the connector responded with an unexpected response type"
                        );
                        RpcError::BadGateway(format!(
                            "the connector responded with an unexpected response type: {e}"
                        ))
                    });
                }
            }
        }
    }

    /// Degrades an undecodable body to a generic upstream error, keeping a
    /// truncated preview of the original request for diagnostics. Raw bodies
    /// that are still JSON with an `errorMessage` field keep that message; a
    /// task-timeout message maps to gateway-timeout instead.
    fn undecodable(
        &self,
        bytes: &[u8],
        request: &ConnectorRequest,
        decode_error: serde_json::Error,
    ) -> RpcError {
        error!(
            connector = self.connector_config().id.get(),
            stream_id = %request.stream_id,
            "invalid content provided by the connector: {decode_error}; request preview: {}",
            payload::preview(&request.body, REQUEST_PREVIEW_LENGTH)
        );
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) {
            if let Some(message) = value.get("errorMessage").and_then(|m| m.as_str()) {
                if message.contains("Task timed out after") {
                    return RpcError::GatewayTimeout("connector timeout error".to_string());
                }
                return RpcError::BadGateway(message.to_string());
            }
        }
        RpcError::BadGateway(format!(
            "invalid content provided by the connector: {decode_error}"
        ))
    }
}
