pub mod payload;
pub mod test_objects;

use std::fmt::{self, Display};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct ConnectorId(String);

impl ConnectorId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Transport-specific part of a remote function descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum RemoteFunctionKind {
    /// A function hosted by a managed cloud-function service, addressed by
    /// its fully qualified name within a region.
    CloudFunction {
        #[serde(rename = "functionArn")]
        function_arn: String,
        region: String,
        #[serde(default)]
        role: Option<String>,
    },
    /// A plain HTTP endpoint accepting the serialized request as a POST body.
    Http { url: String },
    /// A handler running inside this process, looked up by name.
    Embedded { handler: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFunction {
    #[serde(flatten)]
    pub kind: RemoteFunctionKind,
    /// Number of backend instances to keep warm, 0 disables warmup.
    #[serde(default)]
    pub warm_up: u32,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

fn default_protocol_version() -> String {
    "0.6".to_string()
}

pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 6 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Largest request payload the connector accepts in-band.
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    #[serde(default)]
    pub relocation_support: bool,
    #[serde(default)]
    pub binary_tile_support: bool,
}

fn default_max_payload_size() -> usize {
    DEFAULT_MAX_PAYLOAD_SIZE
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            relocation_support: false,
            binary_tile_support: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_min_connections() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    32
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
        }
    }
}

/// An immutable snapshot of a connector's configuration. A changed
/// configuration always arrives as a whole new snapshot; clients compare
/// snapshots for equality to detect updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    pub id: ConnectorId,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Exempts this connector from health-based auto-disable.
    #[serde(default)]
    pub skip_auto_disable: bool,
    pub remote_function: RemoteFunction,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub connection_settings: ConnectionSettings,
}

fn default_active() -> bool {
    true
}

impl ConnectorConfig {
    pub fn min_connections(&self) -> u32 {
        self.connection_settings.min_connections
    }

    pub fn max_connections(&self) -> u32 {
        self.connection_settings.max_connections.max(1)
    }
}

/// Semantic error kinds a connector may report in-band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, AsRefStr)]
pub enum ErrorKind {
    NotImplemented,
    Conflict,
    Forbidden,
    TooManyRequests,
    IllegalArgument,
    Timeout,
    Exception,
    BadGateway,
    PayloadTooLarge,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: ErrorKind,
    #[serde(default)]
    pub error_message: String,
}

/// Pointer to a payload that was moved to the out-of-band blob store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelocationPointer {
    pub region: String,
    pub key: String,
}

/// Envelope for binary tile responses, carried as CBOR on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BinaryEnvelope {
    pub mime_type: String,
    pub bytes: Bytes,
    #[serde(default)]
    pub etag: Option<String>,
}

pub const JSON_MIME_TYPE: &str = "application/json";

impl BinaryEnvelope {
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        Ok(ciborium::from_reader(bytes)?)
    }

    /// A binary envelope whose content is itself JSON is only a wrapper; the
    /// inner bytes go through the regular JSON decoding.
    pub fn is_json(&self) -> bool {
        self.mime_type
            .split(';')
            .next()
            .map(|m| m.trim().eq_ignore_ascii_case(JSON_MIME_TYPE))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    /// Absent in the legacy status-only shape.
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("OK") || self.status.eq_ignore_ascii_case("HEALTHY")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse {
    #[serde(flatten)]
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckRequest {
    /// Hint for the backend to keep the instance busy at least this long,
    /// used by warmup to hold instances hot.
    #[serde(default)]
    pub min_response_time: u64,
}

/// The polymorphic wire envelope. Requests and responses share one tag space;
/// decoding verifies that what came back actually belongs to the response
/// family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum TypedPayload {
    ErrorResponse(ErrorResponse),
    RelocatedPayload(RelocationPointer),
    HealthStatus(HealthStatus),
    SuccessResponse(SuccessResponse),
    HealthCheck(HealthCheckRequest),
}

/// What a caller of `execute` can actually get back.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedResponse {
    Success(SuccessResponse),
    Health(HealthStatus),
    Binary(BinaryEnvelope),
}

impl TypedPayload {
    /// Verifies the payload belongs to the response family.
    pub fn into_response(self) -> Result<TypedResponse> {
        match self {
            TypedPayload::HealthStatus(h) => Ok(TypedResponse::Health(h)),
            TypedPayload::SuccessResponse(s) => Ok(TypedResponse::Success(s)),
            other => Err(anyhow!(
                "unexpected payload type {} where a response was expected",
                other.type_name()
            )),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            TypedPayload::ErrorResponse(_) => "ErrorResponse",
            TypedPayload::RelocatedPayload(_) => "RelocatedPayload",
            TypedPayload::HealthStatus(_) => "HealthStatus",
            TypedPayload::SuccessResponse(_) => "SuccessResponse",
            TypedPayload::HealthCheck(_) => "HealthCheck",
        }
    }
}

/// A request handed to the RPC layer: the geodata side serializes its event
/// and passes only bytes plus the trace id across this boundary.
#[derive(Debug, Clone)]
pub struct ConnectorRequest {
    pub stream_id: String,
    pub body: Bytes,
    /// Whether the caller expects a binary tile response.
    pub expect_binary: bool,
}

impl ConnectorRequest {
    pub fn new(stream_id: impl Into<String>, body: Bytes) -> Self {
        Self {
            stream_id: stream_id.into(),
            body,
            expect_binary: false,
        }
    }

    pub fn with_binary_response(mut self) -> Self {
        self.expect_binary = true;
        self
    }

    pub fn health_check(stream_id: impl Into<String>, min_response_time_ms: u64) -> Self {
        let body = serde_json::to_vec(&TypedPayload::HealthCheck(HealthCheckRequest {
            min_response_time: min_response_time_ms,
        }))
        .expect("health check request is always serializable");
        Self::new(stream_id, Bytes::from(body))
    }
}
