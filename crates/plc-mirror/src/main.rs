//! PLC mirror: pages the PLC directory's operation log into an embedded
//! store and serves DID-document and reverse-lookup queries over HTTP.

mod config;
mod supervisor;

use std::sync::Arc;

use clap::Parser;
use prometheus::Registry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use ingest_store::Store;
use supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let default_filter = if config.debug { "plc_mirror=debug,info" } else { "plc_mirror=info,warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = Arc::new(Store::connect(config.sqlite_path()).await?);
    let registry = Registry::new();

    let supervisor = Supervisor::new(config, store, registry);
    supervisor.run().await
}
