//! Command-line configuration, each option also readable from the
//! environment under a `FIREHOSE_` prefix.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "firehose-consumer")]
#[command(about = "Ingests the AT Protocol firehose into an embedded store", long_about = None)]
pub struct Config {
    /// Relay WebSocket base URL (the consumer appends the subscribeRepos path)
    #[arg(long, env = "FIREHOSE_WS_URL", default_value_t = atproto_core::DEFAULT_FIREHOSE_URL.to_string())]
    pub ws_url: String,

    /// Port for the query HTTP surface (/records, /events, /identities, /healthz, /metrics)
    #[arg(long, env = "FIREHOSE_PORT", default_value = "8081")]
    pub port: u16,

    /// Enable debug-level logging
    #[arg(long, env = "FIREHOSE_DEBUG", default_value = "false")]
    pub debug: bool,

    /// Path to the embedded SQLite database file
    #[arg(long, env = "FIREHOSE_SQLITE_PATH", default_value = "firehose.sqlite3")]
    pub sqlite_path: String,

    /// Run pending migrations on startup (disable only for read-only replicas)
    #[arg(long, env = "FIREHOSE_MIGRATE_DB", default_value = "true")]
    pub migrate_db: bool,

    /// Retention for stream events/records, in seconds; 0 disables the sweeper
    #[arg(long, env = "FIREHOSE_EVT_RECORD_TTL", default_value = "0")]
    pub evt_record_ttl: u64,

    /// Worker pool size for the per-repository scheduler
    #[arg(long, env = "FIREHOSE_WORKERS", default_value = "10")]
    pub workers: usize,

    /// Per-worker pending queue depth
    #[arg(long, env = "FIREHOSE_QUEUE_DEPTH", default_value = "100")]
    pub queue_depth: usize,

    /// GCP project id for the optional BigQuery warehouse sink
    #[arg(long, env = "FIREHOSE_BIGQUERY_PROJECT_ID")]
    pub bigquery_project_id: Option<String>,

    /// BigQuery dataset for the optional warehouse sink
    #[arg(long, env = "FIREHOSE_BIGQUERY_DATASET")]
    pub bigquery_dataset: Option<String>,

    /// Table name prefix for the optional warehouse sink (day-partitioned suffix is appended)
    #[arg(long, env = "FIREHOSE_BIGQUERY_TABLE_PREFIX", default_value = "firehose_events")]
    pub bigquery_table_prefix: String,

    /// Path to a GCP service account key file, required if the warehouse sink is enabled
    #[arg(long, env = "FIREHOSE_BIGQUERY_SA_KEY_PATH")]
    pub bigquery_sa_key_path: Option<String>,

    /// Requests per second allowed against the PLC directory for identity lookups
    #[arg(long, env = "FIREHOSE_PLC_RATE_LIMIT", default_value = "1.0")]
    pub plc_rate_limit: f64,

    /// PLC directory host used for point identity lookups
    #[arg(long, env = "FIREHOSE_PLC_HOST", default_value = "https://plc.directory")]
    pub plc_host: String,

    /// Opportunistically resolve identity on ordinary commit processing
    #[arg(long, env = "FIREHOSE_LOOKUP_ON_COMMIT", default_value = "false")]
    pub lookup_on_commit: bool,
}

impl Config {
    pub fn warehouse_configured(&self) -> bool {
        self.bigquery_project_id.is_some()
            && self.bigquery_dataset.is_some()
            && self.bigquery_sa_key_path.is_some()
    }
}
