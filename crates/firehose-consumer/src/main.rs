//! Firehose consumer: ingests `com.atproto.sync.subscribeRepos` into an
//! embedded store, with an optional BigQuery fan-out.

mod commit;
mod config;
mod error;
mod identity;
mod metrics;
mod supervisor;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use ingest_store::Store;
use metrics::Metrics;
use supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let default_filter = if config.debug { "firehose_consumer=debug,info" } else { "firehose_consumer=info,warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = Store::connect_with_options(&config.sqlite_path, 50, config.migrate_db).await?;
    let store = Arc::new(store);

    let resolver = Arc::new(identity::IdentityResolver::new(
        config.plc_host.clone(),
        config.plc_rate_limit,
        Arc::clone(&store),
    ));

    let metrics = Metrics::new();

    #[cfg_attr(not(feature = "warehouse"), allow(unused_mut))]
    let mut supervisor = Supervisor::new(config.clone(), store, resolver, metrics);

    #[cfg(feature = "warehouse")]
    if config.warehouse_configured() {
        let warehouse_config = warehouse_sink::WarehouseConfig {
            project_id: config.bigquery_project_id.clone().expect("checked by warehouse_configured"),
            dataset: config.bigquery_dataset.clone().expect("checked by warehouse_configured"),
            table_prefix: config.bigquery_table_prefix.clone(),
        };
        let sa_key_path = config.bigquery_sa_key_path.clone().expect("checked by warehouse_configured");
        let warehouse = warehouse_sink::WarehouseSink::new(warehouse_config, &sa_key_path).await?;
        supervisor = supervisor.with_warehouse(Arc::new(warehouse));
    }

    supervisor.run().await
}
