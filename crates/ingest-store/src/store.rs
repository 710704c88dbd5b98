//! Embedded single-file SQL store: one writer connection, many readers.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::QueryBuilder;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{
    DirectoryCursor, EventFilter, EventRow, IdentityFilter, IdentityRow, NewEvent, NewOperation,
    NewRecord, OperationRow, RecordFilter, RecordRow,
};

/// Rows are written in batches no larger than this, per the store's
/// contract with its callers.
const MAX_BATCH_ROWS: usize = 100;

/// Minimum reader pool size; writer pool is always exactly 1 connection.
const DEFAULT_READER_CONNECTIONS: u32 = 50;

pub struct Store {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl Store {
    /// Open (creating if absent) the SQLite file at `path`, run embedded
    /// migrations, and configure WAL journaling with normal-durability sync
    /// on every connection.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::connect_with_reader_capacity(path, DEFAULT_READER_CONNECTIONS).await
    }

    /// Like [`Store::connect`], but with an explicit reader pool size.
    /// Always runs pending migrations; use [`Store::connect_with_options`]
    /// to skip migrations on a read-only replica.
    pub async fn connect_with_reader_capacity(
        path: impl AsRef<Path>,
        reader_connections: u32,
    ) -> Result<Self, StoreError> {
        Self::connect_with_options(path, reader_connections, true).await
    }

    /// Open (creating if absent) the SQLite file at `path`, configure WAL
    /// journaling with normal-durability sync on every connection, and run
    /// embedded migrations only when `run_migrations` is set. Set it to
    /// `false` on a read-only replica pointed at a database another process
    /// already migrates.
    pub async fn connect_with_options(
        path: impl AsRef<Path>,
        reader_connections: u32,
        run_migrations: bool,
    ) -> Result<Self, StoreError> {
        let url = format!("sqlite://{}", path.as_ref().display());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts.clone())
            .await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(reader_connections)
            .connect_with(opts)
            .await?;

        if run_migrations {
            sqlx::migrate!("./migrations").run(&writer).await?;
        }

        info!(path = %path.as_ref().display(), reader_connections, run_migrations, "store opened");
        Ok(Self { writer, reader })
    }

    // ---- stream cursor --------------------------------------------------

    pub async fn stream_cursor(&self) -> Result<Option<i64>, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT seq FROM stream_cursor WHERE id = 1")
            .fetch_optional(&self.reader)
            .await?;
        Ok(row.map(|(seq,)| seq))
    }

    pub async fn set_stream_cursor(&self, seq: i64) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO stream_cursor (id, seq) VALUES (1, ?) ON CONFLICT(id) DO UPDATE SET seq = excluded.seq")
            .bind(seq)
            .execute(&self.writer)
            .await?;
        Ok(())
    }

    // ---- directory cursor -------------------------------------------------

    pub async fn directory_cursor(&self) -> Result<Option<DirectoryCursor>, StoreError> {
        let row = sqlx::query_as::<_, DirectoryCursor>(
            "SELECT last_subject, last_cid, last_created_at, total_ops FROM directory_cursor WHERE id = 1",
        )
        .fetch_optional(&self.reader)
        .await?;
        Ok(row)
    }

    pub async fn set_directory_cursor(&self, cursor: &DirectoryCursor) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO directory_cursor (id, last_subject, last_cid, last_created_at, total_ops)
             VALUES (1, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                last_subject = excluded.last_subject,
                last_cid = excluded.last_cid,
                last_created_at = excluded.last_created_at,
                total_ops = excluded.total_ops",
        )
        .bind(&cursor.last_subject)
        .bind(&cursor.last_cid)
        .bind(&cursor.last_created_at)
        .bind(cursor.total_ops)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    // ---- operations (PLC mirror) -----------------------------------------

    /// Insert a page of operations, ignoring rows that already exist for
    /// `(subject, created_at)` — re-ingestion after a restart is expected.
    pub async fn insert_operations_batch(&self, ops: &[NewOperation]) -> Result<(), StoreError> {
        for chunk in ops.chunks(MAX_BATCH_ROWS) {
            if chunk.is_empty() {
                continue;
            }
            let mut qb: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO operations (subject, cid, created_at, nullified, operation_json, handle, pds_endpoint) ",
            );
            qb.push_values(chunk, |mut b, op| {
                b.push_bind(&op.subject)
                    .push_bind(&op.cid)
                    .push_bind(&op.created_at)
                    .push_bind(op.nullified)
                    .push_bind(&op.operation_json)
                    .push_bind(&op.handle)
                    .push_bind(&op.pds_endpoint);
            });
            qb.push(" ON CONFLICT(subject, created_at) DO NOTHING");
            qb.build().execute(&self.writer).await?;
        }
        debug!(count = ops.len(), "inserted operations batch");
        Ok(())
    }

    /// Most recent non-null operation for `subject`, used to project a DID
    /// document.
    pub async fn latest_operation(&self, subject: &str) -> Result<Option<OperationRow>, StoreError> {
        let row = sqlx::query_as::<_, OperationRow>(
            "SELECT subject, cid, created_at, nullified, operation_json, handle, pds_endpoint
             FROM operations
             WHERE subject = ? AND nullified = 0
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(subject)
        .fetch_optional(&self.reader)
        .await?;
        Ok(row)
    }

    pub async fn subject_for_handle(&self, handle: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT subject FROM operations WHERE handle = ? AND nullified = 0 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(handle)
        .fetch_optional(&self.reader)
        .await?;
        Ok(row.map(|(s,)| s))
    }

    pub async fn handle_for_subject(&self, subject: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT handle FROM operations WHERE subject = ? AND nullified = 0 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(subject)
        .fetch_optional(&self.reader)
        .await?;
        Ok(row.and_then(|(h,)| h))
    }

    // ---- firehose events/records/identities -------------------------------

    pub async fn insert_event(&self, event: &NewEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO stream_events (seq, repo, kind, event_time, prev_rev, error) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event.seq)
        .bind(&event.repo)
        .bind(&event.kind)
        .bind(&event.event_time)
        .bind(&event.prev_rev)
        .bind(&event.error)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn insert_records_batch(&self, records: &[NewRecord]) -> Result<(), StoreError> {
        for chunk in records.chunks(MAX_BATCH_ROWS) {
            if chunk.is_empty() {
                continue;
            }
            let mut qb: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO stream_records (seq, repo, collection, rkey, action, payload) ");
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.seq)
                    .push_bind(&r.repo)
                    .push_bind(&r.collection)
                    .push_bind(&r.rkey)
                    .push_bind(&r.action)
                    .push_bind(&r.payload);
            });
            qb.build().execute(&self.writer).await?;
        }
        debug!(count = records.len(), "inserted records batch");
        Ok(())
    }

    pub async fn upsert_identity(
        &self,
        subject: &str,
        handle: Option<&str>,
        pds_endpoint: Option<&str>,
    ) -> Result<(), StoreError> {
        let updated_at = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO stream_identities (subject, handle, pds_endpoint, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(subject) DO UPDATE SET
                handle = excluded.handle,
                pds_endpoint = excluded.pds_endpoint,
                updated_at = excluded.updated_at",
        )
        .bind(subject)
        .bind(handle)
        .bind(pds_endpoint)
        .bind(updated_at)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<RecordRow>, StoreError> {
        if filter.collection.is_some() && filter.did.is_none() {
            return Err(StoreError::InvalidQuery(
                "collection filter requires did".to_string(),
            ));
        }
        if filter.rkey.is_some() && (filter.did.is_none() || filter.collection.is_none()) {
            return Err(StoreError::InvalidQuery(
                "rkey filter requires did and collection".to_string(),
            ));
        }

        let mut qb: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT seq, repo, collection, rkey, action, payload, created_at FROM stream_records WHERE 1=1",
        );
        if let Some(did) = &filter.did {
            qb.push(" AND repo = ").push_bind(did.clone());
        }
        if let Some(collection) = &filter.collection {
            qb.push(" AND collection = ").push_bind(collection.clone());
        }
        if let Some(rkey) = &filter.rkey {
            qb.push(" AND rkey = ").push_bind(rkey.clone());
        }
        if let Some(seq) = filter.since_seq {
            qb.push(" AND seq >= ").push_bind(seq);
        }
        qb.push(" ORDER BY seq DESC LIMIT ").push_bind(filter.limit.clamp(1, 1000));

        let rows = qb.build_query_as::<RecordRow>().fetch_all(&self.reader).await?;
        Ok(rows)
    }

    pub async fn query_events(&self, filter: &EventFilter) -> Result<Vec<EventRow>, StoreError> {
        let mut qb: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT seq, repo, kind, event_time, prev_rev, error, created_at FROM stream_events WHERE 1=1",
        );
        if let Some(did) = &filter.did {
            qb.push(" AND repo = ").push_bind(did.clone());
        }
        if let Some(kind) = &filter.event_type {
            qb.push(" AND kind = ").push_bind(kind.clone());
        }
        if let Some(seq) = filter.since_seq {
            qb.push(" AND seq >= ").push_bind(seq);
        }
        qb.push(" ORDER BY seq DESC LIMIT ").push_bind(filter.limit.clamp(1, 1000));

        let rows = qb.build_query_as::<EventRow>().fetch_all(&self.reader).await?;
        Ok(rows)
    }

    pub async fn query_identities(&self, filter: &IdentityFilter) -> Result<Vec<IdentityRow>, StoreError> {
        let mut qb: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT subject, handle, pds_endpoint, updated_at FROM stream_identities WHERE 1=1",
        );
        if let Some(did) = &filter.did {
            qb.push(" AND subject = ").push_bind(did.clone());
        }
        if let Some(handle) = &filter.handle {
            qb.push(" AND handle = ").push_bind(handle.clone());
        }
        if let Some(pds) = &filter.pds {
            qb.push(" AND pds_endpoint = ").push_bind(pds.clone());
        }
        qb.push(" ORDER BY updated_at DESC LIMIT ").push_bind(filter.limit.clamp(1, 1000));

        let rows = qb.build_query_as::<IdentityRow>().fetch_all(&self.reader).await?;
        Ok(rows)
    }

    /// Delete events and records older than `now - ttl`. No-op when `ttl` is
    /// zero (retention disabled).
    pub async fn sweep_retention(&self, ttl: Duration) -> Result<(u64, u64), StoreError> {
        if ttl.is_zero() {
            return Ok((0, 0));
        }
        let cutoff = (Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_default()).to_rfc3339();

        let events = sqlx::query("DELETE FROM stream_events WHERE created_at < ?")
            .bind(&cutoff)
            .execute(&self.writer)
            .await?
            .rows_affected();
        let records = sqlx::query("DELETE FROM stream_records WHERE created_at < ?")
            .bind(&cutoff)
            .execute(&self.writer)
            .await?
            .rows_affected();

        if events > 0 || records > 0 {
            info!(events, records, cutoff = %cutoff, "retention sweep removed rows");
        }
        Ok((events, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventFilter, NewEvent, NewRecord, RecordFilter};

    async fn test_store() -> Store {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sqlite3");
        // Leak the tempdir so the file survives for the life of the test.
        std::mem::forget(dir);
        Store::connect_with_reader_capacity(path, 4).await.unwrap()
    }

    #[tokio::test]
    async fn test_stream_cursor_roundtrip() {
        let store = test_store().await;
        assert_eq!(store.stream_cursor().await.unwrap(), None);
        store.set_stream_cursor(42).await.unwrap();
        assert_eq!(store.stream_cursor().await.unwrap(), Some(42));
        store.set_stream_cursor(100).await.unwrap();
        assert_eq!(store.stream_cursor().await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_insert_and_query_records() {
        let store = test_store().await;
        let records = vec![NewRecord {
            seq: 1,
            repo: "did:plc:abc".into(),
            collection: "app.bsky.feed.post".into(),
            rkey: "r1".into(),
            action: "create".into(),
            payload: "{}".into(),
        }];
        store.insert_records_batch(&records).await.unwrap();

        let rows = store
            .query_records(&RecordFilter {
                did: Some("did:plc:abc".into()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rkey, "r1");
    }

    #[tokio::test]
    async fn test_query_records_rejects_collection_without_did() {
        let store = test_store().await;
        let result = store
            .query_records(&RecordFilter {
                collection: Some("app.bsky.feed.post".into()),
                limit: 10,
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(StoreError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn test_query_records_rejects_rkey_without_collection() {
        let store = test_store().await;
        let result = store
            .query_records(&RecordFilter {
                did: Some("did:plc:abc".into()),
                rkey: Some("r1".into()),
                limit: 10,
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(StoreError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn test_insert_event_and_query() {
        let store = test_store().await;
        store
            .insert_event(&NewEvent {
                seq: 7,
                repo: "did:plc:abc".into(),
                kind: "commit".into(),
                event_time: Some("2026-01-01T00:00:00Z".into()),
                prev_rev: None,
                error: None,
            })
            .await
            .unwrap();

        let rows = store
            .query_events(&EventFilter {
                did: Some("did:plc:abc".into()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].seq, 7);
    }

    #[tokio::test]
    async fn test_upsert_identity_overwrites() {
        let store = test_store().await;
        store
            .upsert_identity("did:plc:abc", Some("alice.test"), Some("https://pds.example"))
            .await
            .unwrap();
        store
            .upsert_identity("did:plc:abc", Some("alice2.test"), Some("https://pds.example"))
            .await
            .unwrap();

        let rows = store
            .query_identities(&crate::models::IdentityFilter {
                did: Some("did:plc:abc".into()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].handle.as_deref(), Some("alice2.test"));
    }

    #[tokio::test]
    async fn test_sweep_retention_noop_when_ttl_zero() {
        let store = test_store().await;
        let (events, records) = store.sweep_retention(Duration::ZERO).await.unwrap();
        assert_eq!((events, records), (0, 0));
    }

    #[tokio::test]
    async fn test_connect_with_options_skips_migrations_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unmigrated.sqlite3");

        let store = Store::connect_with_options(&path, 4, false).await.unwrap();
        let result = store.stream_cursor().await;
        assert!(result.is_err(), "queries against an unmigrated database should fail");

        drop(store);
        let migrated = Store::connect_with_options(&path, 4, true).await.unwrap();
        assert_eq!(migrated.stream_cursor().await.unwrap(), None);
    }
}
