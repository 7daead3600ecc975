//! Bounded object-presence checks against candidate servers
//!
//! The redirect engine asks "which of these caches already hold the
//! object?" with a deadline measured in hundreds of milliseconds, so
//! results (positive and negative alike) are cached per server with a
//! TTL and a bounded capacity.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use perch_core::ServerAd;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, trace};

/// Metadata learned about an object on one server
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    /// Object size in bytes
    pub size: u64,
    /// Last modification time, when the server reported one
    pub mtime: Option<DateTime<Utc>>,
    /// Digest name to hex value, from the `Digest` header
    pub checksums: HashMap<String, String>,
    /// Seconds the copy has sat in the cache. May be `-1` (unknown) or
    /// `0` when presence was learned via GET rather than HEAD; that
    /// imprecision is inherent to the backend and preserved as-is.
    pub age_seconds: i64,
}

/// Result of a presence query across candidates
#[derive(Debug, Clone, PartialEq)]
pub enum StatOutcome {
    /// First server that answered positively
    Found {
        /// Data URL of the answering server
        server_url: String,
        /// What it reported
        meta: ObjectMeta,
    },
    /// Every candidate answered, none has the object
    NotFound,
    /// The deadline lapsed before a positive answer
    Timeout,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    /// `None` is a cached negative: the server said 404 recently
    meta: Option<ObjectMeta>,
    cached_at: Instant,
}

/// Per-server presence state: result cache plus a concurrency bound
#[derive(Debug)]
pub struct ServerStatUtil {
    cache: Mutex<LruCache<String, CacheEntry>>,
    semaphore: Arc<Semaphore>,
}

impl ServerStatUtil {
    fn new(capacity: usize, concurrency: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is nonzero");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    fn cached(&self, object: &str, ttl: Duration) -> Option<Option<ObjectMeta>> {
        let mut cache = self.cache.lock();
        match cache.get(object) {
            Some(entry) if entry.cached_at.elapsed() < ttl => Some(entry.meta.clone()),
            Some(_) => {
                cache.pop(object);
                None
            }
            None => None,
        }
    }

    fn remember(&self, object: &str, meta: Option<ObjectMeta>) {
        self.cache.lock().put(
            object.to_string(),
            CacheEntry {
                meta,
                cached_at: Instant::now(),
            },
        );
    }

    async fn stat(
        &self,
        http: &reqwest::Client,
        base_url: &str,
        object: &str,
        ttl: Duration,
    ) -> Result<Option<ObjectMeta>, String> {
        if let Some(hit) = self.cached(object, ttl) {
            trace!(server = %base_url, object = %object, "presence cache hit");
            return Ok(hit);
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| "stat pool closed".to_string())?;

        let url = format!("{}{}", base_url.trim_end_matches('/'), object);
        let resp = http.head(&url).send().await.map_err(|e| e.to_string())?;

        let (resp, via_get) = if resp.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            // Some backends never implemented HEAD
            let resp = http
                .get(&url)
                .header(reqwest::header::RANGE, "bytes=0-0")
                .send()
                .await
                .map_err(|e| e.to_string())?;
            (resp, true)
        } else {
            (resp, false)
        };

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            self.remember(object, None);
            return Ok(None);
        }
        if !status.is_success() {
            return Err(format!("unexpected status {status}"));
        }

        let meta = parse_meta(resp.headers(), via_get);
        self.remember(object, Some(meta.clone()));
        Ok(Some(meta))
    }
}

fn parse_meta(headers: &reqwest::header::HeaderMap, via_get: bool) -> ObjectMeta {
    let size = headers
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|total| total.parse::<u64>().ok())
        .or_else(|| {
            headers
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
        })
        .unwrap_or(0);

    let mtime = headers
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let mut checksums = HashMap::new();
    if let Some(digest) = headers.get("digest").and_then(|v| v.to_str().ok()) {
        for pair in digest.split(',') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                checksums.insert(name.to_ascii_lowercase(), value.to_string());
            }
        }
    }

    let age_seconds = headers
        .get(reqwest::header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(if via_get { 0 } else { -1 });

    ObjectMeta {
        size,
        mtime,
        checksums,
        age_seconds,
    }
}

/// Registry of per-server stat utilities, created lazily at ingest and
/// dropped at ad eviction.
pub struct StatRegistry {
    utils: DashMap<String, Arc<ServerStatUtil>>,
    http: reqwest::Client,
    cache_ttl: Duration,
    cache_capacity: usize,
    concurrency: usize,
}

impl std::fmt::Debug for StatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatRegistry")
            .field("servers", &self.utils.len())
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl StatRegistry {
    /// Create a registry with the director's stat settings
    pub fn new(cache_ttl: Duration, cache_capacity: usize, concurrency: usize) -> Self {
        Self {
            utils: DashMap::new(),
            http: reqwest::Client::new(),
            cache_ttl,
            cache_capacity,
            concurrency,
        }
    }

    /// Ensure a stat utility exists for the server
    pub fn arm(&self, url_key: &str) {
        self.utils
            .entry(url_key.to_string())
            .or_insert_with(|| {
                debug!(url = %url_key, capacity = self.cache_capacity, "creating stat cache");
                Arc::new(ServerStatUtil::new(self.cache_capacity, self.concurrency))
            });
    }

    /// Drop the stat utility of an evicted server
    pub fn disarm(&self, url_key: &str) {
        self.utils.remove(url_key);
    }

    /// Number of armed servers
    pub fn len(&self) -> usize {
        self.utils.len()
    }

    /// Whether no server is armed
    pub fn is_empty(&self) -> bool {
        self.utils.is_empty()
    }

    /// Query candidates in parallel; first positive answer wins.
    pub async fn query(
        &self,
        object: &str,
        candidates: &[ServerAd],
        timeout: Duration,
    ) -> StatOutcome {
        if candidates.is_empty() {
            return StatOutcome::NotFound;
        }

        let mut set = tokio::task::JoinSet::new();
        for ad in candidates {
            let util = Arc::clone(
                self.utils
                    .entry(ad.url_key().to_string())
                    .or_insert_with(|| {
                        Arc::new(ServerStatUtil::new(self.cache_capacity, self.concurrency))
                    })
                    .value(),
            );
            let http = self.http.clone();
            let base_url = ad.data_url.clone();
            let object = object.to_string();
            let ttl = self.cache_ttl;
            set.spawn(async move {
                let result = util.stat(&http, &base_url, &object, ttl).await;
                (base_url, result)
            });
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    set.abort_all();
                    return StatOutcome::Timeout;
                }
                next = set.join_next() => match next {
                    None => return StatOutcome::NotFound,
                    Some(Ok((server_url, Ok(Some(meta))))) => {
                        set.abort_all();
                        return StatOutcome::Found { server_url, meta };
                    }
                    Some(Ok((server_url, Ok(None)))) => {
                        trace!(server = %server_url, object = %object, "object absent");
                    }
                    Some(Ok((server_url, Err(reason)))) => {
                        debug!(server = %server_url, reason = %reason, "stat attempt failed");
                    }
                    Some(Err(_)) => {}
                }
            }
        }
    }

    /// Cached positive result for one (server, object), if fresh
    pub fn cached_positive(&self, url_key: &str, object: &str) -> Option<ObjectMeta> {
        let util = self.utils.get(url_key)?;
        util.cached(object, self.cache_ttl).flatten()
    }

    /// Fresh cached verdict for one (server, object): `Some(true)` the
    /// server holds it, `Some(false)` a cached not-found, `None` unknown.
    pub fn cached_verdict(&self, url_key: &str, object: &str) -> Option<bool> {
        let util = self.utils.get(url_key)?;
        util.cached(object, self.cache_ttl).map(|m| m.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_core::{Capabilities, ServerKind, StorageKind};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ad_for(url: &str) -> ServerAd {
        ServerAd {
            name: "c1".to_string(),
            registry_prefix: "/caches/c1".to_string(),
            kind: ServerKind::Cache,
            data_url: url.to_string(),
            web_url: url.to_string(),
            broker_url: None,
            auth_url: None,
            storage_kind: StorageKind::Posix,
            capabilities: Capabilities::default(),
            namespaces: vec![],
            downtimes: vec![],
            disable_health_probe: false,
            from_topology: false,
            version: String::new(),
            expiration: None,
            ewma_load: 0.0,
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    fn registry() -> StatRegistry {
        StatRegistry::new(Duration::from_secs(60), 100, 4)
    }

    #[tokio::test]
    async fn test_found_via_head() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/ns/hello_world.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "13")
                    .insert_header("digest", "crc32c=4d551068"),
            )
            .mount(&server)
            .await;

        let stats = registry();
        let outcome = stats
            .query(
                "/ns/hello_world.txt",
                &[ad_for(&server.uri())],
                Duration::from_secs(2),
            )
            .await;
        match outcome {
            StatOutcome::Found { meta, .. } => {
                assert_eq!(meta.size, 13);
                assert_eq!(meta.checksums.get("crc32c").map(String::as_str), Some("4d551068"));
                assert_eq!(meta.age_seconds, -1);
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_fallback_when_head_unsupported() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-range", "bytes 0-0/17"))
            .mount(&server)
            .await;

        let stats = registry();
        let outcome = stats
            .query("/ns/obj", &[ad_for(&server.uri())], Duration::from_secs(2))
            .await;
        match outcome {
            StatOutcome::Found { meta, .. } => {
                assert_eq!(meta.size, 17);
                // GET-derived presence reports an imprecise age
                assert_eq!(meta.age_seconds, 0);
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_not_found_cached() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let stats = registry();
        let candidates = [ad_for(&server.uri())];
        let first = stats
            .query("/ns/missing", &candidates, Duration::from_secs(2))
            .await;
        assert_eq!(first, StatOutcome::NotFound);

        // Second query is served by the negative cache; the mock's
        // expect(1) fails on drop if a second HEAD goes out.
        let second = stats
            .query("/ns/missing", &candidates, Duration::from_secs(2))
            .await;
        assert_eq!(second, StatOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let stats = registry();
        let outcome = stats
            .query(
                "/ns/slow",
                &[ad_for(&server.uri())],
                Duration::from_millis(100),
            )
            .await;
        assert_eq!(outcome, StatOutcome::Timeout);
    }

    #[tokio::test]
    async fn test_first_positive_wins_across_candidates() {
        let missing = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&missing)
            .await;
        let holding = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-length", "17"))
            .mount(&holding)
            .await;

        let stats = registry();
        let outcome = stats
            .query(
                "/ns/obj",
                &[ad_for(&missing.uri()), ad_for(&holding.uri())],
                Duration::from_secs(2),
            )
            .await;
        match outcome {
            StatOutcome::Found { server_url, .. } => assert_eq!(server_url, holding.uri()),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disarm_drops_cache() {
        let stats = registry();
        stats.arm("https://c1.example.org");
        assert_eq!(stats.len(), 1);
        stats.disarm("https://c1.example.org");
        assert!(stats.is_empty());
    }
}
