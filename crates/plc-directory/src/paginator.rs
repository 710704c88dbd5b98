//! Cursor-driven ingestion of the directory's append-only operation log.

use std::sync::Arc;
use std::time::Duration;

use ingest_store::{DirectoryCursor, NewOperation, Store};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::PlcError;
use crate::projector::{derive_handle, derive_pds_endpoint};
use crate::rate_limiter::TokenBucket;

const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(120);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PaginatorConfig {
    pub host: String,
    pub page_size: u32,
    pub check_interval: Duration,
}

impl Default for PaginatorConfig {
    fn default() -> Self {
        Self {
            host: "https://plc.directory".to_string(),
            page_size: 1000,
            check_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawOp {
    did: String,
    cid: String,
    #[serde(default)]
    nullified: bool,
    #[serde(rename = "createdAt")]
    created_at: String,
    operation: serde_json::Value,
}

pub struct Paginator {
    client: reqwest::Client,
    config: PaginatorConfig,
    store: Arc<Store>,
    limiter: TokenBucket,
}

enum PageOutcome {
    Ops(Vec<RawOp>),
    RateLimited,
    Error,
}

impl Paginator {
    pub fn new(config: PaginatorConfig, store: Arc<Store>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            store,
            limiter: TokenBucket::new(1.0, 1.0),
        }
    }

    /// Run the paginator loop until `shutdown_rx` fires.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), PlcError> {
        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }

            let cursor = self.store.directory_cursor().await?.unwrap_or_default();
            let outcome = self.fetch_page(cursor.last_created_at.as_deref()).await;

            let sleep_for = match outcome {
                Ok(PageOutcome::Ops(ops)) => {
                    let count = ops.len();
                    if !ops.is_empty() {
                        self.ingest_page(&ops, cursor).await?;
                    }
                    if (count as u32) < self.config.page_size {
                        Some(self.config.check_interval)
                    } else {
                        None
                    }
                }
                Ok(PageOutcome::RateLimited) => {
                    warn!("directory export rate limited, backing off");
                    Some(RATE_LIMIT_BACKOFF)
                }
                Ok(PageOutcome::Error) | Err(_) => {
                    warn!("directory export request failed, backing off");
                    Some(ERROR_BACKOFF)
                }
            };

            if let Some(delay) = sleep_for {
                tokio::select! {
                    _ = shutdown_rx.changed() => { if *shutdown_rx.borrow() { return Ok(()); } }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn fetch_page(&self, after: Option<&str>) -> Result<PageOutcome, PlcError> {
        self.limiter.acquire().await;

        let mut url = format!(
            "{}/export?count={}",
            self.config.host.trim_end_matches('/'),
            self.config.page_size
        );
        if let Some(after) = after {
            url.push_str(&format!("&after={}", after));
        }

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "directory export transport error");
                return Ok(PageOutcome::Error);
            }
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::TOO_MANY_REQUESTS => return Ok(PageOutcome::RateLimited),
            status => {
                warn!(status = %status, "directory export non-200 response");
                return Ok(PageOutcome::Error);
            }
        }

        let body = response.text().await?;
        let mut ops = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<RawOp>(line) {
                Ok(op) => ops.push(op),
                Err(e) => warn!(error = %e, "failed to decode directory export line"),
            }
        }
        Ok(PageOutcome::Ops(ops))
    }

    async fn ingest_page(&self, ops: &[RawOp], mut cursor: DirectoryCursor) -> Result<(), PlcError> {
        let new_ops: Vec<NewOperation> = ops
            .iter()
            .map(|op| {
                let operation_json = op.operation.to_string();
                NewOperation {
                    subject: op.did.clone(),
                    cid: op.cid.clone(),
                    created_at: op.created_at.clone(),
                    nullified: op.nullified,
                    handle: derive_handle(&operation_json),
                    pds_endpoint: derive_pds_endpoint(&operation_json),
                    operation_json,
                }
            })
            .collect();

        self.store.insert_operations_batch(&new_ops).await?;

        if let Some(last) = ops.last() {
            cursor.last_subject = Some(last.did.clone());
            cursor.last_cid = Some(last.cid.clone());
            cursor.last_created_at = Some(last.created_at.clone());
            cursor.total_ops += ops.len() as i64;
            self.store.set_directory_cursor(&cursor).await?;
        }

        debug!(count = ops.len(), "ingested directory page");
        Ok(())
    }
}
