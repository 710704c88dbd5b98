//! Wires the firehose client, the per-repository scheduler, the local
//! store, the identity resolver, background timers, and the query HTTP
//! surface into one process.
//!
//! Shutdown shape follows `crates/winter/src/daemon.rs::run_event_loop`: a
//! shared `watch::channel(false)` flag flipped by a `ctrl_c()` task, with
//! every background loop selecting on it first (`biased`).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use atproto_core::{Frame, FirehoseClient};
use ingest_store::{NewEvent, Store};
use repo_scheduler::{Scheduler, SchedulerConfig};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::commit::decode_commit;
use crate::config::Config;
use crate::identity::IdentityResolver;
use crate::metrics::Metrics;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const CURSOR_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const LIVENESS_THRESHOLD_MS: i64 = 15_000;

pub struct Supervisor {
    config: Config,
    store: Arc<Store>,
    resolver: Arc<IdentityResolver>,
    metrics: Metrics,
    #[cfg(feature = "warehouse")]
    warehouse: Option<Arc<warehouse_sink::WarehouseSink>>,
}

impl Supervisor {
    pub fn new(config: Config, store: Arc<Store>, resolver: Arc<IdentityResolver>, metrics: Metrics) -> Self {
        Self {
            config,
            store,
            resolver,
            metrics,
            #[cfg(feature = "warehouse")]
            warehouse: None,
        }
    }

    #[cfg(feature = "warehouse")]
    pub fn with_warehouse(mut self, warehouse: Arc<warehouse_sink::WarehouseSink>) -> Self {
        self.warehouse = Some(warehouse);
        self
    }

    /// Runs until shutdown. Returns `Err` only when the liveness monitor
    /// fires, so `main` can translate that into a non-zero exit code.
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shutdown_tx_signal = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("received shutdown signal");
            let _ = shutdown_tx_signal.send(true);
        });

        let last_seq = Arc::new(AtomicI64::new(self.store.stream_cursor().await?.unwrap_or(0)));

        let scheduler = {
            let store = Arc::clone(&self.store);
            let resolver = Arc::clone(&self.resolver);
            let metrics = self.metrics.clone();
            let lookup_on_commit = self.config.lookup_on_commit;
            #[cfg(feature = "warehouse")]
            let warehouse = self.warehouse.clone();
            Scheduler::spawn(
                SchedulerConfig { workers: self.config.workers, queue_depth: self.config.queue_depth },
                move |frame: Frame| {
                    let store = Arc::clone(&store);
                    let resolver = Arc::clone(&resolver);
                    let metrics = metrics.clone();
                    #[cfg(feature = "warehouse")]
                    let warehouse = warehouse.clone();
                    async move {
                        #[cfg(feature = "warehouse")]
                        {
                            handle_frame(frame, &store, &resolver, &metrics, lookup_on_commit, warehouse.as_ref()).await;
                        }
                        #[cfg(not(feature = "warehouse"))]
                        {
                            handle_frame(frame, &store, &resolver, &metrics, lookup_on_commit).await;
                        }
                    }
                },
            )
        };

        #[cfg(feature = "warehouse")]
        if let Some(warehouse) = self.warehouse.clone() {
            let warehouse_shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                warehouse.run(warehouse_shutdown).await;
            });
        }

        let firehose = Arc::new(FirehoseClient::new(self.config.ws_url.clone()));

        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(self.config.queue_depth);
        let ingest_handle = {
            let scheduler_ref = &scheduler;
            let last_seq = Arc::clone(&last_seq);
            let metrics = self.metrics.clone();
            async move {
                while let Some(frame) = frame_rx.recv().await {
                    last_seq.store(frame.seq(), Ordering::Relaxed);
                    metrics.frames_received.inc();
                    metrics.last_seq.set(frame.seq());
                    if scheduler_ref.submit(frame.repo(), frame).await.is_err() {
                        break;
                    }
                }
            }
        };

        let connection_loop = self.run_connection_loop(Arc::clone(&firehose), frame_tx, shutdown_rx.clone());
        let cursor_flusher = self.run_cursor_flusher(Arc::clone(&last_seq), shutdown_rx.clone());
        let retention_sweeper = self.run_retention_sweeper(shutdown_rx.clone());
        let http_server = self.run_http_server(shutdown_rx.clone());

        tokio::pin!(ingest_handle);
        tokio::pin!(connection_loop);
        tokio::pin!(cursor_flusher);
        tokio::pin!(retention_sweeper);
        tokio::pin!(http_server);

        let liveness = firehose.liveness();
        let mut liveness_rx = shutdown_rx.clone();
        let liveness_monitor = async move {
            let mut ticker = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = liveness_rx.changed() => {
                        if *liveness_rx.borrow() {
                            return Ok(());
                        }
                    }
                    _ = ticker.tick() => {
                        let stalled = liveness.millis_since_last();
                        if stalled > LIVENESS_THRESHOLD_MS {
                            error!(stalled_ms = stalled, "firehose connection stalled, signalling shutdown");
                            return Err(stalled);
                        }
                    }
                }
            }
        };
        tokio::pin!(liveness_monitor);

        let liveness_result = tokio::select! {
            _ = &mut ingest_handle => Ok(()),
            _ = &mut connection_loop => Ok(()),
            _ = &mut cursor_flusher => Ok(()),
            _ = &mut retention_sweeper => Ok(()),
            _ = &mut http_server => Ok(()),
            result = &mut liveness_monitor => result,
        };

        let _ = shutdown_tx.send(true);
        self.store.set_stream_cursor(last_seq.load(Ordering::Relaxed)).await.ok();

        match liveness_result {
            Ok(()) => {
                info!("firehose consumer shut down gracefully");
                Ok(())
            }
            Err(stalled_ms) => Err(anyhow::anyhow!("liveness threshold exceeded: {}ms since last frame", stalled_ms)),
        }
    }

    async fn run_connection_loop(
        &self,
        firehose: Arc<FirehoseClient>,
        frame_tx: mpsc::Sender<Frame>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown_rx.borrow() {
                return;
            }
            let resume_seq = self.store.stream_cursor().await.ok().flatten();
            match firehose.connect_and_run(resume_seq, frame_tx.clone(), &mut shutdown_rx).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, "firehose connection dropped, reconnecting");
                }
            }
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => { if *shutdown_rx.borrow() { return; } }
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            }
        }
    }

    async fn run_cursor_flusher(&self, last_seq: Arc<AtomicI64>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(CURSOR_FLUSH_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => { if *shutdown_rx.borrow() { return; } }
                _ = ticker.tick() => {
                    let seq = last_seq.load(Ordering::Relaxed);
                    if let Err(e) = self.store.set_stream_cursor(seq).await {
                        warn!(error = %e, "failed to flush stream cursor");
                    }
                }
            }
        }
    }

    async fn run_retention_sweeper(&self, mut shutdown_rx: watch::Receiver<bool>) {
        if self.config.evt_record_ttl == 0 {
            let _ = shutdown_rx.changed().await;
            return;
        }
        let ttl = Duration::from_secs(self.config.evt_record_ttl);
        let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => { if *shutdown_rx.borrow() { return; } }
                _ = ticker.tick() => {
                    match self.store.sweep_retention(ttl).await {
                        Ok((events, records)) => info!(events, records, "retention sweep complete"),
                        Err(e) => warn!(error = %e, "retention sweep failed"),
                    }
                }
            }
        }
    }

    async fn run_http_server(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let state = query_http::StreamState { store: Arc::clone(&self.store), registry: self.metrics.registry.clone() };
        let app = query_http::stream_router(state);
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %addr, error = %e, "failed to bind query HTTP surface");
                let _ = shutdown_rx.changed().await;
                return;
            }
        };
        info!(addr = %addr, "query HTTP surface listening");
        let shutdown_signal = async move {
            let _ = shutdown_rx.changed().await;
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal).await {
            error!(error = %e, "query HTTP server error");
        }
    }
}

async fn handle_frame(
    frame: Frame,
    store: &Arc<Store>,
    resolver: &Arc<IdentityResolver>,
    metrics: &Metrics,
    lookup_on_commit: bool,
    #[cfg(feature = "warehouse")] warehouse: Option<&Arc<warehouse_sink::WarehouseSink>>,
) {
    match frame {
        Frame::Commit(commit) => {
            let repo = commit.repo.clone();
            let (records, event) = decode_commit(&commit).await;
            if !records.is_empty() {
                if let Err(e) = store.insert_records_batch(&records).await {
                    error!(repo = %repo, error = %e, "failed to write records batch");
                }
                metrics.records_written.inc_by(records.len() as u64);

                #[cfg(feature = "warehouse")]
                if let Some(warehouse) = warehouse {
                    for record in &records {
                        let payload = serde_json::from_str(&record.payload).unwrap_or(serde_json::Value::Null);
                        warehouse
                            .enqueue(warehouse_sink::WarehouseRow {
                                seq: record.seq,
                                repo: record.repo.clone(),
                                collection: Some(record.collection.clone()),
                                rkey: Some(record.rkey.clone()),
                                action: record.action.clone(),
                                payload,
                                event_time: chrono::Utc::now(),
                            })
                            .await;
                    }
                }
            }
            if let Err(e) = store.insert_event(&event).await {
                error!(repo = %repo, error = %e, "failed to write event row");
            }
            if lookup_on_commit {
                metrics.identity_lookups.inc();
                resolver.resolve(&repo, metrics).await;
            }
        }
        Frame::Identity(f) => handle_identity_frame(f, "identity", store, resolver, metrics).await,
        Frame::Account(f) => handle_identity_frame(f, "account", store, resolver, metrics).await,
        Frame::Handle(f) => handle_identity_frame(f, "handle", store, resolver, metrics).await,
        Frame::Tombstone(f) => handle_identity_frame(f, "tombstone", store, resolver, metrics).await,
        Frame::Migrate(f) => handle_identity_frame(f, "migrate", store, resolver, metrics).await,
    }
}

async fn handle_identity_frame(
    f: atproto_core::IdentityFrame,
    kind: &str,
    store: &Arc<Store>,
    resolver: &Arc<IdentityResolver>,
    metrics: &Metrics,
) {
    resolver.invalidate(&f.did);
    metrics.identity_lookups.inc();
    resolver.resolve(&f.did, metrics).await;

    let event = NewEvent {
        seq: f.seq,
        repo: f.did.clone(),
        kind: kind.to_string(),
        event_time: Some(f.time.clone()),
        prev_rev: None,
        error: None,
    };
    if let Err(e) = store.insert_event(&event).await {
        error!(did = %f.did, error = %e, "failed to write identity event row");
    }
}
