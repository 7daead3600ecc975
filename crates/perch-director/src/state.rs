//! Process-wide director state and background task wiring
//!
//! Everything long-lived hangs off [`DirectorState`]: the ad store, the
//! filter set, the geo resolver, the probe and stat managers, and the
//! ingestor. There is no hidden initialization; a process creates the
//! state and calls [`DirectorState::init`], which returns only after all
//! background tasks are armed against the shutdown signal.

use crate::config::DirectorConfig;
use crate::ingest::Ingestor;
use crate::probe::ProbeManager;
use crate::shutdown::ShutdownSignal;
use crate::sort::AdaptiveStats;
use crate::stat::StatRegistry;
use crate::tokens::DirectorTokens;
use chrono::Utc;
use parking_lot::Mutex;
use perch_ads::{AdEvent, AdStore, FilterSet, UpsertOutcome};
use perch_core::{Downtime, ServerAd};
use perch_geo::GeoResolver;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shared state of a running director
pub struct DirectorState {
    /// Loaded configuration
    pub config: DirectorConfig,
    /// Advertisement store
    pub store: Arc<AdStore>,
    /// Disqualification map
    pub filters: Arc<FilterSet>,
    /// Hostname-to-coordinate resolution
    pub geo: Arc<GeoResolver>,
    /// Per-server presence checks
    pub stats: Arc<StatRegistry>,
    /// Per-server health probes
    pub probes: Arc<ProbeManager>,
    /// Adaptive-sort score table
    pub adaptive: Arc<AdaptiveStats>,
    /// Advertisement verification
    pub ingestor: Ingestor,
    /// The director's own token signer
    pub tokens: Arc<DirectorTokens>,
    /// Shutdown fan-out
    pub shutdown: ShutdownSignal,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    http: reqwest::Client,
}

impl std::fmt::Debug for DirectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorState")
            .field("ads", &self.store.len())
            .field("external_url", &self.config.external_url)
            .finish()
    }
}

impl DirectorState {
    /// Assemble the state from configuration. No tasks run yet.
    pub fn new(config: DirectorConfig) -> Arc<Self> {
        let store = Arc::new(AdStore::with_ttl(config.advertisement_ttl));
        let filters = Arc::new(FilterSet::with_permanent(
            config.filtered_servers.iter().cloned(),
        ));
        let geo = Arc::new(GeoResolver::new(
            config.geoip_db.as_deref(),
            &config.geo_overrides,
            config.advertisement_ttl,
        ));
        let adaptive = Arc::new(AdaptiveStats::new());
        let tokens = Arc::new(DirectorTokens::new(config.external_url.clone()));
        let stats = Arc::new(StatRegistry::new(
            config.stat_cache_ttl,
            config.stat_cache_capacity,
            config.effective_stat_concurrency(),
        ));
        let probes = Arc::new(ProbeManager::new(
            Arc::clone(&store),
            Arc::clone(&tokens),
            Arc::clone(&adaptive),
            config.effective_probe_interval(),
            config.timeouts.health_probe,
            config.probe_concurrency,
        ));
        let ingestor = Ingestor::new(
            config.registry_url.clone(),
            config.allowed_cache_prefixes.clone(),
            semver::Version::parse(&config.minimum_server_version)
                .unwrap_or_else(|_| semver::Version::new(7, 0, 0)),
        );

        Arc::new(Self {
            config,
            store,
            filters,
            geo,
            stats,
            probes,
            adaptive,
            ingestor,
            tokens,
            shutdown: ShutdownSignal::new(),
            tasks: Mutex::new(Vec::new()),
            http: reqwest::Client::new(),
        })
    }

    /// Start the background task group: the ad reaper, the eviction
    /// listener tearing down per-server state, and the registry downtime
    /// reconciler.
    pub fn init(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        tasks.push(self.store.start_reaper(self.shutdown.subscribe()));
        tasks.push(self.spawn_eviction_listener());
        tasks.push(self.spawn_downtime_reconciler());

        info!(
            external_url = %self.config.external_url,
            registry = %self.config.registry_url,
            sort = ?self.config.sort_method,
            "director state initialized"
        );
    }

    /// Trigger shutdown and wait for the task group to drain
    pub async fn drain(&self) {
        self.shutdown.trigger();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!("background tasks did not drain before the shutdown deadline");
        }
        self.probes.disarm_all();
    }

    /// Record a verified advertisement: resolve its coordinate, run
    /// downtime synthesis, store it, and arm the per-server utilities.
    pub async fn record_ad(&self, mut ad: ServerAd) -> UpsertOutcome {
        // Downtime synthesis first: it must be observable promptly and
        // does not depend on the (potentially slow) geo lookup.
        self.filters
            .sync_server_reported(&ad.name, &ad.downtimes, Utc::now());

        if let Some(host) = ad.data_host() {
            let (coord, failure) = self.geo.resolve(&host).await;
            if let Some(failure) = failure {
                debug!(host = %host, error = %failure, "geo lookup failed; ad sorts last by distance");
            }
            ad.latitude = coord.lat;
            ad.longitude = coord.lon;
        }

        let key = ad.url_key().to_string();
        let probe_wanted = ad.probe_enabled();
        let outcome = self.store.upsert(ad);

        if matches!(outcome, UpsertOutcome::Inserted | UpsertOutcome::Refreshed) {
            self.stats.arm(&key);
            if probe_wanted {
                self.probes.arm(&key);
            }
        }
        outcome
    }

    /// Drop all soft state (test support)
    pub fn reset(&self) {
        self.store.delete_all();
        self.filters.reset();
        self.adaptive.reset();
        self.ingestor.reset();
        self.probes.disarm_all();
    }

    fn spawn_eviction_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let state = Arc::clone(self);
        let mut events = self.store.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(AdEvent::Evicted { url, name }) => {
                            debug!(server = %name, url = %url, "tearing down per-server state");
                            state.probes.disarm(&url);
                            state.stats.disarm(&url);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "eviction listener lagged; resyncing");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    fn spawn_downtime_reconciler(self: &Arc<Self>) -> JoinHandle<()> {
        let state = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(state.config.downtime_reconcile_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        state.reconcile_downtimes().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    /// One reconciliation pass against the registry's federation-wide
    /// downtime list.
    pub async fn reconcile_downtimes(&self) {
        let url = format!("{}/api/v1.0/downtime", self.config.registry_url);
        let downtimes: Vec<Downtime> = match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %e, "malformed downtime list from registry");
                    return;
                }
            },
            Ok(resp) => {
                debug!(status = %resp.status(), "registry downtime endpoint unavailable");
                return;
            }
            Err(e) => {
                debug!(error = %e, "cannot reach registry for downtimes");
                return;
            }
        };
        self.filters
            .reconcile_federation_downtimes(downtimes, Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_core::{Capabilities, ServerKind, StorageKind};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_ad(name: &str, url: &str) -> ServerAd {
        ServerAd {
            name: name.to_string(),
            registry_prefix: format!("/origins/{name}"),
            kind: ServerKind::Origin,
            data_url: url.to_string(),
            web_url: url.to_string(),
            broker_url: None,
            auth_url: None,
            storage_kind: StorageKind::Posix,
            capabilities: Capabilities::default(),
            namespaces: vec![],
            downtimes: vec![],
            disable_health_probe: true,
            from_topology: false,
            version: "7.5.0".to_string(),
            expiration: None,
            ewma_load: 0.0,
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    #[tokio::test]
    async fn test_record_ad_arms_stat_util() {
        let state = DirectorState::new(DirectorConfig::for_tests("https://registry.test"));
        let outcome = state
            .record_ad(test_ad("o1", "https://o1.example.org"))
            .await;
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(state.stats.len(), 1);
        assert!(state.store.get_by_url("https://o1.example.org").is_some());
    }

    #[tokio::test]
    async fn test_eviction_tears_down_stat_util() {
        let state = DirectorState::new(DirectorConfig::for_tests("https://registry.test"));
        state.init();
        state
            .record_ad(test_ad("o1", "https://o1.example.org"))
            .await;
        assert_eq!(state.stats.len(), 1);

        state.store.delete("https://o1.example.org");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(state.stats.is_empty());
        state.drain().await;
    }

    #[tokio::test]
    async fn test_downtime_reconciliation_round_trip() {
        let registry = MockServer::start().await;
        let now = Utc::now();
        let body = serde_json::json!([{
            "serverName": "s1",
            "startTime": now - chrono::Duration::hours(1),
            "endTime": now + chrono::Duration::hours(1),
            "source": "registry"
        }]);
        Mock::given(method("GET"))
            .and(path("/api/v1.0/downtime"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&registry)
            .await;

        let state = DirectorState::new(DirectorConfig::for_tests(registry.uri()));
        state.reconcile_downtimes().await;
        assert!(state.filters.is_excluded("s1"));
        assert_eq!(state.filters.federation_downtimes().len(), 1);

        // Registry now reports an empty list: the filter clears
        registry.reset().await;
        Mock::given(method("GET"))
            .and(path("/api/v1.0/downtime"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&registry)
            .await;
        state.reconcile_downtimes().await;
        assert!(!state.filters.is_excluded("s1"));
        assert!(state.filters.federation_downtimes().is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_soft_state() {
        let state = DirectorState::new(DirectorConfig::for_tests("https://registry.test"));
        state
            .record_ad(test_ad("o1", "https://o1.example.org"))
            .await;
        state.filters.set("o1", perch_core::FilterReason::AdminTemporary);
        state.reset();
        assert!(state.store.is_empty());
        assert!(state.filters.snapshot().is_empty());
    }
}
