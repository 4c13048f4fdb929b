use std::time::Duration;

use anyhow::Result;
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use rpc::{ResponseLimits, RpcSettings};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub blob_storage: BlobStorageConfig,
    /// YAML file with the connector list consumed by the sync loop.
    #[serde(default)]
    pub connectors_path: Option<String>,
    #[serde(default)]
    pub structured_logging: bool,
    #[serde(default)]
    pub config_sync: ConfigSyncConfig,
    #[serde(default)]
    pub warmup: WarmupConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSyncConfig {
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    /// Consecutive failed health checks before a connector is auto-disabled.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_true")]
    pub enable_health_checks: bool,
}

fn default_sync_interval_secs() -> u64 {
    120
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for ConfigSyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
            unhealthy_threshold: default_unhealthy_threshold(),
            enable_health_checks: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_warmup_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    /// Minimum-response-time hint carried by warmup health checks.
    #[serde(default = "default_min_response_time_ms")]
    pub min_response_time_ms: u64,
}

fn default_warmup_interval_secs() -> u64 {
    60
}

fn default_lease_ttl_secs() -> u64 {
    55
}

fn default_min_response_time_ms() -> u64 {
    200
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_warmup_interval_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            min_response_time_ms: default_min_response_time_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_global_queue_mb")]
    pub global_queue_mb: u64,
    #[serde(default = "default_high_load_threshold")]
    pub high_load_threshold: f64,
    #[serde(default = "default_max_response_mb")]
    pub max_response_mb: usize,
    #[serde(default = "default_max_compressed_response_mb")]
    pub max_compressed_response_mb: usize,
    #[serde(default = "default_cloud_endpoint_template")]
    pub cloud_endpoint_template: String,
    #[serde(default = "default_cloud_client_grace_secs")]
    pub cloud_client_grace_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    25
}

fn default_global_queue_mb() -> u64 {
    256
}

fn default_high_load_threshold() -> f64 {
    0.8
}

fn default_max_response_mb() -> usize {
    100
}

fn default_max_compressed_response_mb() -> usize {
    10
}

fn default_cloud_endpoint_template() -> String {
    rpc::transport::cloud::DEFAULT_CLOUD_ENDPOINT_TEMPLATE.to_string()
}

fn default_cloud_client_grace_secs() -> u64 {
    30
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            global_queue_mb: default_global_queue_mb(),
            high_load_threshold: default_high_load_threshold(),
            max_response_mb: default_max_response_mb(),
            max_compressed_response_mb: default_max_compressed_response_mb(),
            cloud_endpoint_template: default_cloud_endpoint_template(),
            cloud_client_grace_secs: default_cloud_client_grace_secs(),
        }
    }
}

impl RpcConfig {
    pub fn to_settings(&self) -> RpcSettings {
        RpcSettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            global_queue_byte_budget: self.global_queue_mb * 1024 * 1024,
            high_load_threshold: self.high_load_threshold,
            response_limits: ResponseLimits {
                max_response_size: self.max_response_mb * 1024 * 1024,
                max_compressed_response_size: self.max_compressed_response_mb * 1024 * 1024,
            },
            cloud_endpoint_template: self.cloud_endpoint_template.clone(),
            cloud_client_grace: Duration::from_secs(self.cloud_client_grace_secs),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("rpc.request_timeout_secs must be positive"));
        }
        if !(0.0..=1.0).contains(&self.rpc.high_load_threshold) {
            return Err(anyhow::anyhow!(
                "rpc.high_load_threshold must be within (0, 1], got {}",
                self.rpc.high_load_threshold
            ));
        }
        if self.config_sync.interval_secs == 0 {
            return Err(anyhow::anyhow!("config_sync.interval_secs must be positive"));
        }
        Ok(())
    }
}
