//! Wires the directory paginator, the local store, and the mirror's query
//! HTTP surface into one process.
//!
//! Shutdown shape follows `firehose-consumer`'s supervisor (itself grounded
//! in `crates/winter/src/daemon.rs::run_event_loop`): a shared
//! `watch::channel(false)` flag flipped by a `ctrl_c()` task, with every
//! background loop selecting on it first (`biased`).

use std::sync::Arc;

use ingest_store::Store;
use plc_directory::{Paginator, PaginatorConfig, Resolver};
use prometheus::Registry;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;

pub struct Supervisor {
    config: Config,
    store: Arc<Store>,
    registry: Registry,
}

impl Supervisor {
    pub fn new(config: Config, store: Arc<Store>, registry: Registry) -> Self {
        Self { config, store, registry }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shutdown_tx_signal = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("received shutdown signal");
            let _ = shutdown_tx_signal.send(true);
        });

        let paginator = Paginator::new(
            PaginatorConfig {
                host: self.config.plc_host.clone(),
                page_size: self.config.page_size,
                check_interval: self.config.check_interval(),
            },
            Arc::clone(&self.store),
        );

        let paginator_loop = paginator.run(shutdown_rx.clone());
        let http_server = self.run_http_server(shutdown_rx.clone());

        tokio::pin!(paginator_loop);
        tokio::pin!(http_server);

        tokio::select! {
            result = &mut paginator_loop => {
                if let Err(e) = result {
                    error!(error = %e, "directory paginator exited with an error");
                }
            }
            _ = &mut http_server => {}
        }

        let _ = shutdown_tx.send(true);
        info!("plc-mirror shut down gracefully");
        Ok(())
    }

    async fn run_http_server(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let resolver = Arc::new(Resolver::new(Arc::clone(&self.store)));
        let state = query_http::MirrorState { resolver, registry: self.registry.clone() };
        let app = query_http::mirror_router(state);
        let listener = match tokio::net::TcpListener::bind(&self.config.listen_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %self.config.listen_addr, error = %e, "failed to bind mirror query surface");
                let _ = shutdown_rx.changed().await;
                return;
            }
        };
        info!(addr = %self.config.listen_addr, "mirror query surface listening");
        let shutdown_signal = async move {
            let _ = shutdown_rx.changed().await;
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal).await {
            error!(error = %e, "mirror HTTP server error");
        }
    }
}
