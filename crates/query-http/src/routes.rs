//! Read-only HTTP surface over the ingested firehose stream and the
//! mirrored PLC directory.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use ingest_store::{EventFilter, IdentityFilter, RecordFilter, Store};
use plc_directory::Resolver;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Deserialize;

use crate::error::ApiError;

const DEFAULT_LIMIT: i64 = 100;

/// Shared state for the firehose-consumer's query surface.
#[derive(Clone)]
pub struct StreamState {
    pub store: Arc<Store>,
    pub registry: Registry,
}

/// Shared state for the PLC mirror's query surface.
#[derive(Clone)]
pub struct MirrorState {
    pub resolver: Arc<Resolver>,
    pub registry: Registry,
}

pub fn stream_router(state: StreamState) -> Router {
    Router::new()
        .route("/records", get(get_records))
        .route("/events", get(get_events))
        .route("/identities", get(get_identities))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics::<StreamState>))
        .with_state(state)
}

pub fn mirror_router(state: MirrorState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics::<MirrorState>))
        .route("/reverse/{query}", get(reverse_lookup))
        .route("/{subject}", get(did_document))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

trait HasRegistry {
    fn registry(&self) -> &Registry;
}

impl HasRegistry for StreamState {
    fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl HasRegistry for MirrorState {
    fn registry(&self) -> &Registry {
        &self.registry
    }
}

async fn metrics<S: HasRegistry + Clone + Send + Sync + 'static>(
    State(state): State<S>,
) -> impl IntoResponse {
    let metric_families = state.registry().gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (
        axum::http::StatusCode::OK,
        String::from_utf8_lossy(&buffer).into_owned(),
    )
}

#[derive(Debug, Deserialize)]
struct RecordQuery {
    did: Option<String>,
    collection: Option<String>,
    rkey: Option<String>,
    seq: Option<i64>,
    limit: Option<i64>,
}

/// `GET /records?did=&collection=&rkey=&seq=&limit=`
///
/// `collection` requires `did`; `rkey` requires both `did` and `collection`.
/// The store enforces this and we surface its rejection as 400.
async fn get_records(
    State(state): State<StreamState>,
    Query(q): Query<RecordQuery>,
) -> Result<Response, ApiError> {
    let filter = RecordFilter {
        did: q.did,
        collection: q.collection,
        rkey: q.rkey,
        since_seq: q.seq,
        limit: q.limit.unwrap_or(DEFAULT_LIMIT),
    };
    let rows = state.store.query_records(&filter).await?;
    Ok(Json(rows).into_response())
}

#[derive(Debug, Deserialize)]
struct EventQuery {
    did: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    seq: Option<i64>,
    limit: Option<i64>,
}

/// `GET /events?did=&type=&seq=&limit=`
async fn get_events(
    State(state): State<StreamState>,
    Query(q): Query<EventQuery>,
) -> Result<Response, ApiError> {
    let filter = EventFilter {
        did: q.did,
        event_type: q.event_type,
        since_seq: q.seq,
        limit: q.limit.unwrap_or(DEFAULT_LIMIT),
    };
    let rows = state.store.query_events(&filter).await?;
    Ok(Json(rows).into_response())
}

#[derive(Debug, Deserialize)]
struct IdentityQuery {
    did: Option<String>,
    handle: Option<String>,
    pds: Option<String>,
    limit: Option<i64>,
}

/// `GET /identities?did=&handle=&pds=&limit=`
async fn get_identities(
    State(state): State<StreamState>,
    Query(q): Query<IdentityQuery>,
) -> Result<Response, ApiError> {
    let filter = IdentityFilter {
        did: q.did,
        handle: q.handle,
        pds: q.pds,
        limit: q.limit.unwrap_or(DEFAULT_LIMIT),
    };
    let rows = state.store.query_identities(&filter).await?;
    Ok(Json(rows).into_response())
}

/// `GET /{subject}` — projects the latest operation for a `did:plc:` or
/// `did:web:` subject into a DID document.
async fn did_document(
    State(state): State<MirrorState>,
    Path(subject): Path<String>,
) -> Result<Response, ApiError> {
    let doc = state.resolver.did_document(&subject).await?;
    Ok(Json(doc).into_response())
}

/// `GET /reverse/{query}` — resolves a handle to its DID or a DID to its
/// current handle, whichever direction `query` looks like.
async fn reverse_lookup(
    State(state): State<MirrorState>,
    Path(query): Path<String>,
) -> Result<Response, ApiError> {
    if query.starts_with("did:") {
        let handle = state.resolver.handle_for_subject(&query).await?;
        Ok(Json(serde_json::json!({ "did": query, "handle": handle })).into_response())
    } else {
        let did = state.resolver.subject_for_handle(&query).await?;
        Ok(Json(serde_json::json!({ "handle": query, "did": did })).into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ingest_store::NewRecord;
    use tower::ServiceExt;

    async fn test_store() -> Store {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sqlite3");
        std::mem::forget(dir);
        Store::connect_with_reader_capacity(path, 4).await.unwrap()
    }

    #[tokio::test]
    async fn test_records_rejects_collection_without_did() {
        let state = StreamState {
            store: Arc::new(test_store().await),
            registry: Registry::new(),
        };
        let app = stream_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/records?collection=app.bsky.feed.post")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_records_returns_inserted_row() {
        let store = test_store().await;
        store
            .insert_records_batch(&[NewRecord {
                seq: 1,
                repo: "did:plc:abc".to_string(),
                collection: "app.bsky.feed.post".to_string(),
                rkey: "r1".to_string(),
                action: "create".to_string(),
                payload: "{}".to_string(),
            }])
            .await
            .unwrap();

        let state = StreamState {
            store: Arc::new(store),
            registry: Registry::new(),
        };
        let app = stream_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/records?did=did:plc:abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let rows: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["repo"], "did:plc:abc");
    }

    #[tokio::test]
    async fn test_healthz_ok() {
        let state = StreamState {
            store: Arc::new(test_store().await),
            registry: Registry::new(),
        };
        let app = stream_router(state);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    async fn mirror_state_with(subject: &str, handle: &str, operation_json: &str) -> MirrorState {
        let store = test_store().await;
        store
            .insert_operations_batch(&[ingest_store::NewOperation {
                subject: subject.to_string(),
                cid: "cid1".to_string(),
                created_at: "2026-01-01T00:00:00.000Z".to_string(),
                nullified: false,
                operation_json: operation_json.to_string(),
                handle: Some(handle.to_string()),
                pds_endpoint: Some("https://pds.example".to_string()),
            }])
            .await
            .unwrap();
        MirrorState {
            resolver: Arc::new(Resolver::new(Arc::new(store))),
            registry: Registry::new(),
        }
    }

    #[tokio::test]
    async fn test_did_document_projects_latest_operation() {
        let operation_json = serde_json::json!({
            "type": "plc_operation",
            "alsoKnownAs": ["at://alice.test"],
            "services": {"atproto_pds": {"type": "AtprotoPersonalDataServer", "endpoint": "https://pds.example"}},
        })
        .to_string();
        let state = mirror_state_with("did:plc:abc", "alice.test", &operation_json).await;
        let app = mirror_router(state);

        let response = app
            .oneshot(Request::builder().uri("/did:plc:abc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc["id"], "did:plc:abc");
        assert_eq!(doc["alsoKnownAs"][0], "at://alice.test");
    }

    #[tokio::test]
    async fn test_did_document_missing_subject_is_404() {
        let state = mirror_state_with("did:plc:abc", "alice.test", "{}").await;
        let app = mirror_router(state);

        let response = app
            .oneshot(Request::builder().uri("/did:plc:missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reverse_lookup_handle_to_did() {
        let state = mirror_state_with("did:plc:abc", "alice.test", "{}").await;
        let app = mirror_router(state);

        let response = app
            .oneshot(Request::builder().uri("/reverse/alice.test").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["did"], "did:plc:abc");
    }
}
