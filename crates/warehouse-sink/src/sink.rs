//! Batched fan-out of stream records into BigQuery.
//!
//! Rows are buffered in memory, flushed on a 5-second tick or once the
//! buffer reaches `MAX_BUFFER_ROWS`, and written into a table partitioned
//! by UTC day. A write failure is logged and the batch is dropped rather
//! than retried: the warehouse is a best-effort analytics mirror, not a
//! source of truth.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gcp_bigquery_client::model::table_data_insert_all_request::TableDataInsertAllRequest;
use gcp_bigquery_client::Client;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error};

use crate::error::WarehouseError;

pub const MAX_BUFFER_ROWS: usize = 10_000;
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct WarehouseRow {
    pub seq: i64,
    pub repo: String,
    pub collection: Option<String>,
    pub rkey: Option<String>,
    pub action: String,
    pub payload: serde_json::Value,
    pub event_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub project_id: String,
    pub dataset: String,
    pub table_prefix: String,
}

pub struct WarehouseSink {
    client: Client,
    config: WarehouseConfig,
    buffer: Mutex<Vec<WarehouseRow>>,
}

impl WarehouseSink {
    pub async fn new(config: WarehouseConfig, sa_key_path: &str) -> Result<Self, WarehouseError> {
        let client = Client::from_service_account_key_file(sa_key_path)
            .await
            .map_err(|e| WarehouseError::BigQuery(e.to_string()))?;
        Ok(Self {
            client,
            config,
            buffer: Mutex::new(Vec::new()),
        })
    }

    pub async fn enqueue(&self, row: WarehouseRow) {
        let mut buffer = self.buffer.lock().await;
        buffer.push(row);
        if buffer.len() >= MAX_BUFFER_ROWS {
            let rows = std::mem::take(&mut *buffer);
            drop(buffer);
            self.flush_rows(rows).await;
        }
    }

    /// Runs until `shutdown_rx` fires, flushing every `FLUSH_INTERVAL`.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        self.flush().await;
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
    }

    async fn flush(&self) {
        let rows = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };
        self.flush_rows(rows).await;
    }

    fn table_name(&self, day: DateTime<Utc>) -> String {
        partitioned_table_name(&self.config.table_prefix, day)
    }

    async fn flush_rows(&self, rows: Vec<WarehouseRow>) {
        if rows.is_empty() {
            return;
        }

        let mut by_table: std::collections::HashMap<String, Vec<WarehouseRow>> =
            std::collections::HashMap::new();
        for row in rows {
            by_table
                .entry(self.table_name(row.event_time))
                .or_default()
                .push(row);
        }

        for (table, rows) in by_table {
            let count = rows.len();
            if let Err(e) = self.insert(&table, rows).await {
                error!(error = %e, table = %table, rows = count, "warehouse insert failed, dropping batch");
                continue;
            }
            debug!(table = %table, rows = count, "flushed warehouse batch");
        }
    }

    async fn insert(&self, table: &str, rows: Vec<WarehouseRow>) -> Result<(), WarehouseError> {
        let mut request = TableDataInsertAllRequest::new();
        for row in rows {
            let value = serde_json::to_value(&row)?;
            request.add_row(None, value)?;
        }

        self.client
            .tabledata()
            .insert_all(&self.config.project_id, &self.config.dataset, table, request)
            .await
            .map_err(|e| WarehouseError::BigQuery(e.to_string()))?;
        Ok(())
    }
}

fn partitioned_table_name(prefix: &str, day: DateTime<Utc>) -> String {
    format!("{}_{}", prefix, day.format("%Y%m%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_partitioned_table_name_formats_utc_day() {
        let day = Utc.with_ymd_and_hms(2026, 7, 28, 23, 59, 0).unwrap();
        assert_eq!(partitioned_table_name("events", day), "events_20260728");
    }

    #[test]
    fn test_partitioned_table_name_differs_across_day_boundary() {
        let before = Utc.with_ymd_and_hms(2026, 7, 28, 23, 59, 59).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 7, 29, 0, 0, 0).unwrap();
        assert_ne!(
            partitioned_table_name("events", before),
            partitioned_table_name("events", after)
        );
    }

    #[tokio::test]
    async fn test_enqueue_does_not_flush_below_threshold() {
        // Buffer accumulation is independent of the BigQuery client, so we
        // exercise it directly without constructing a WarehouseSink (which
        // requires a service-account key file).
        let buffer: Mutex<Vec<WarehouseRow>> = Mutex::new(Vec::new());
        let row = WarehouseRow {
            seq: 1,
            repo: "did:plc:abc".to_string(),
            collection: Some("app.bsky.feed.post".to_string()),
            rkey: Some("abc123".to_string()),
            action: "create".to_string(),
            payload: serde_json::json!({"text": "hi"}),
            event_time: Utc::now(),
        };
        buffer.lock().await.push(row);
        assert_eq!(buffer.lock().await.len(), 1);
        assert!(buffer.lock().await.len() < MAX_BUFFER_ROWS);
    }
}
