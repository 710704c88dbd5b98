//! Bounded identity cache over subject → (handle, PDS endpoint), backed by a
//! live point lookup against the PLC directory on cache miss.
//!
//! Positive and negative outcomes are cached separately with different
//! lifetimes (12h / 2min) rather than through one cache with per-entry
//! expiry, following `atrium-oauth-identity`'s `MaybeCachedResolver` (a
//! plain `moka::future::Cache` builder, no custom `Expiry` implementation).
//! Concurrent lookups for the same subject are coalesced into a single HTTP
//! call, following `atrium-common`'s `ThrottledResolver`: a `DashMap` of
//! per-key broadcast senders that late arrivals subscribe to instead of
//! issuing their own request.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use ingest_store::Store;
use moka::future::Cache;
use plc_directory::TokenBucket;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::metrics::Metrics;

const POSITIVE_TTL: Duration = Duration::from_secs(12 * 60 * 60);
const NEGATIVE_TTL: Duration = Duration::from_secs(2 * 60);
const STALE_ON_ERROR_TTL: Duration = Duration::from_secs(12 * 60 * 60);
const CACHE_CAPACITY: u64 = 250_000;

#[derive(Debug, Clone)]
pub struct IdentityOutcome {
    pub handle: Option<String>,
    pub pds_endpoint: Option<String>,
}

pub struct IdentityResolver {
    host: String,
    client: reqwest::Client,
    limiter: TokenBucket,
    store: Arc<Store>,
    positive: Cache<String, IdentityOutcome>,
    negative: Cache<String, ()>,
    stale: Cache<String, IdentityOutcome>,
    inflight: DashMap<String, Arc<broadcast::Sender<Option<IdentityOutcome>>>>,
}

impl IdentityResolver {
    pub fn new(host: String, rate_per_sec: f64, store: Arc<Store>) -> Self {
        Self {
            host,
            client: reqwest::Client::new(),
            limiter: TokenBucket::new(rate_per_sec, 1.0),
            store,
            positive: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(POSITIVE_TTL)
                .build(),
            negative: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(NEGATIVE_TTL)
                .build(),
            stale: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(STALE_ON_ERROR_TTL)
                .build(),
            inflight: DashMap::new(),
        }
    }

    /// Drop any cached outcome for `subject`. Called unconditionally on
    /// handle/identity/account/tombstone frames, regardless of
    /// `lookup_on_commit`, so those subjects never serve a stale cache hit.
    pub fn invalidate(&self, subject: &str) {
        self.positive.invalidate(subject);
        self.negative.invalidate(subject);
    }

    /// Resolve `subject`, consulting the cache first and coalescing
    /// concurrent misses for the same subject into one HTTP call.
    pub async fn resolve(&self, subject: &str, metrics: &Metrics) -> Option<IdentityOutcome> {
        if let Some(hit) = self.positive.get(subject).await {
            metrics.identity_cache_hits.inc();
            return Some(hit);
        }
        if self.negative.get(subject).await.is_some() {
            metrics.identity_cache_hits.inc();
            return None;
        }

        match self.pending_entry(subject) {
            Pending::Join(tx) => tx.subscribe().recv().await.unwrap_or(None),
            Pending::Lead(tx) => {
                let result = self.fetch(subject).await;
                let _ = tx.send(result.clone());
                self.inflight.remove(subject);
                result
            }
        }
    }

    fn pending_entry(&self, subject: &str) -> Pending {
        match self.inflight.entry(subject.to_string()) {
            Entry::Occupied(existing) => Pending::Join(Arc::clone(existing.get())),
            Entry::Vacant(vacant) => {
                let (tx, _) = broadcast::channel(1);
                let tx = Arc::new(tx);
                vacant.insert(Arc::clone(&tx));
                Pending::Lead(tx)
            }
        }
    }

    async fn fetch(&self, subject: &str) -> Option<IdentityOutcome> {
        self.limiter.acquire().await;

        // `/data` returns the subject's latest raw operation, the same shape
        // the paginator stores from `/export`.
        let url = format!("{}/{}/data", self.host.trim_end_matches('/'), subject);
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(subject = %subject, error = %e, "identity lookup transport error, falling back to stale cache");
                return self.stale.get(subject).await;
            }
        };

        if !response.status().is_success() {
            debug!(subject = %subject, status = %response.status(), "identity lookup returned non-success");
            self.negative.insert(subject.to_string(), ()).await;
            return None;
        }

        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(subject = %subject, error = %e, "identity lookup body decode failed, falling back to stale cache");
                return self.stale.get(subject).await;
            }
        };

        let operation_json = body.to_string();
        let outcome = IdentityOutcome {
            handle: plc_directory::derive_handle(&operation_json),
            pds_endpoint: plc_directory::derive_pds_endpoint(&operation_json),
        };

        self.positive.insert(subject.to_string(), outcome.clone()).await;
        self.stale.insert(subject.to_string(), outcome.clone()).await;

        if let Err(e) = self
            .store
            .upsert_identity(subject, outcome.handle.as_deref(), outcome.pds_endpoint.as_deref())
            .await
        {
            warn!(subject = %subject, error = %e, "failed to persist resolved identity");
        }

        Some(outcome)
    }
}

enum Pending {
    Join(Arc<broadcast::Sender<Option<IdentityOutcome>>>),
    Lead(Arc<broadcast::Sender<Option<IdentityOutcome>>>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_store() -> Arc<Store> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.sqlite3");
        std::mem::forget(dir);
        Arc::new(Store::connect(path).await.unwrap())
    }

    fn raw_operation_body(handle: &str, pds: &str) -> serde_json::Value {
        serde_json::json!({
            "type": "plc_operation",
            "alsoKnownAs": [format!("at://{handle}")],
            "services": {"atproto_pds": {"type": "AtprotoPersonalDataServer", "endpoint": pds}},
        })
    }

    #[tokio::test]
    async fn test_invalidate_clears_positive_and_negative() {
        let store = test_store().await;
        let resolver = IdentityResolver::new("https://plc.directory".to_string(), 10.0, store);

        resolver
            .positive
            .insert(
                "did:plc:abc".to_string(),
                IdentityOutcome { handle: Some("a.bsky.social".to_string()), pds_endpoint: None },
            )
            .await;
        assert!(resolver.resolve("did:plc:abc", &Metrics::new()).await.is_some());

        resolver.invalidate("did:plc:abc");
        assert!(resolver.positive.get("did:plc:abc").await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_populates_positive_cache_and_persists_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(raw_operation_body(
                "alice.bsky.social",
                "https://pds.example",
            )))
            .mount(&server)
            .await;

        let store = test_store().await;
        let resolver = IdentityResolver::new(server.uri(), 100.0, Arc::clone(&store));

        let outcome = resolver.resolve("did:plc:abc", &Metrics::new()).await.expect("resolves successfully");
        assert_eq!(outcome.handle.as_deref(), Some("alice.bsky.social"));
        assert_eq!(outcome.pds_endpoint.as_deref(), Some("https://pds.example"));

        assert!(resolver.positive.get("did:plc:abc").await.is_some());
        let rows = store
            .query_identities(&ingest_store::IdentityFilter { did: Some("did:plc:abc".to_string()), limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].handle.as_deref(), Some("alice.bsky.social"));
    }

    #[tokio::test]
    async fn test_fetch_negative_caches_on_non_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

        let store = test_store().await;
        let resolver = IdentityResolver::new(server.uri(), 100.0, store);

        assert!(resolver.resolve("did:plc:missing", &Metrics::new()).await.is_none());
        assert!(resolver.negative.get("did:plc:missing").await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_resolves_for_same_subject_share_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(raw_operation_body(
                "alice.bsky.social",
                "https://pds.example",
            )))
            .mount(&server)
            .await;

        let store = test_store().await;
        let resolver = Arc::new(IdentityResolver::new(server.uri(), 100.0, store));

        let a = Arc::clone(&resolver);
        let b = Arc::clone(&resolver);
        let metrics_a = Metrics::new();
        let metrics_b = Metrics::new();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.resolve("did:plc:abc", &metrics_a).await }),
            tokio::spawn(async move { b.resolve("did:plc:abc", &metrics_b).await }),
        );

        assert!(ra.unwrap().is_some());
        assert!(rb.unwrap().is_some());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
