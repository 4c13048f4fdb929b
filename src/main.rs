use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use rpc::EmbeddedHandlerRegistry;
use tracing::warn;

use crate::{
    config::ServerConfig,
    config_sync::{ConnectorConfigProvider, FileConfigProvider, StaticConfigProvider},
    service::Service,
};

mod config;
mod config_sync;
mod health;
mod service;
mod telemetry;
mod warmup;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => ServerConfig::from_path(path.to_str().unwrap())?,
        None => ServerConfig::default(),
    };
    telemetry::setup_logging(&config);

    let provider: Arc<dyn ConnectorConfigProvider> = match &config.connectors_path {
        Some(path) => Arc::new(FileConfigProvider::new(path)),
        None => {
            warn!("no connectors_path configured, starting with an empty connector list");
            Arc::new(StaticConfigProvider::new())
        }
    };

    // Embedded handlers are registered by the deployment before start; the
    // plain binary ships without any.
    let handlers = Arc::new(EmbeddedHandlerRegistry::new());

    let service = Service::new(config, provider, handlers)?;
    service.start().await
}
