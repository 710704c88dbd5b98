//! Row types read from and written to the store.

use serde::Serialize;
use sqlx::FromRow;

/// A single directory operation, ready to insert. `created_at` is RFC3339
/// with nanosecond precision, matching the directory's own ordering.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub subject: String,
    pub cid: String,
    pub created_at: String,
    pub nullified: bool,
    pub operation_json: String,
    pub handle: Option<String>,
    pub pds_endpoint: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OperationRow {
    pub subject: String,
    pub cid: String,
    pub created_at: String,
    pub nullified: bool,
    pub operation_json: String,
    pub handle: Option<String>,
    pub pds_endpoint: Option<String>,
}

/// The directory paginator's resume point.
#[derive(Debug, Clone, Default, FromRow)]
pub struct DirectoryCursor {
    pub last_subject: Option<String>,
    pub last_cid: Option<String>,
    pub last_created_at: Option<String>,
    pub total_ops: i64,
}

/// One firehose event row (per frame).
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub seq: i64,
    pub repo: String,
    pub kind: String,
    pub event_time: Option<String>,
    pub prev_rev: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EventRow {
    pub seq: i64,
    pub repo: String,
    pub kind: String,
    pub event_time: Option<String>,
    pub prev_rev: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
}

/// One extracted record, ready to insert.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub seq: i64,
    pub repo: String,
    pub collection: String,
    pub rkey: String,
    pub action: String,
    pub payload: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RecordRow {
    pub seq: i64,
    pub repo: String,
    pub collection: String,
    pub rkey: String,
    pub action: String,
    pub payload: String,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct IdentityRow {
    pub subject: String,
    pub handle: Option<String>,
    pub pds_endpoint: Option<String>,
    pub updated_at: String,
}

/// Filters accepted by [`crate::Store::query_records`]. `None` means
/// unfiltered on that column.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub did: Option<String>,
    pub collection: Option<String>,
    pub rkey: Option<String>,
    pub since_seq: Option<i64>,
    pub limit: i64,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub did: Option<String>,
    pub event_type: Option<String>,
    pub since_seq: Option<i64>,
    pub limit: i64,
}

#[derive(Debug, Clone, Default)]
pub struct IdentityFilter {
    pub did: Option<String>,
    pub handle: Option<String>,
    pub pds: Option<String>,
    pub limit: i64,
}
