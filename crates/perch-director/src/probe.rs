//! Per-server background health probes
//!
//! Every live (Pelican-sourced, POSIX-backed, probe-enabled) server gets
//! one probe task. The task holds only the ad's URL key and re-reads the
//! store each cycle, so ad eviction tears the task down on its next tick
//! without any cross-reference bookkeeping.

use crate::sort::AdaptiveStats;
use crate::tokens::DirectorTokens;
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use perch_ads::AdStore;
use perch_core::HealthStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Namespace prefix under which servers synthesize monitoring objects
pub const MONITORING_PREFIX: &str = "/pelican/monitoring/directorTest";

/// File-name prefix of a synthetic probe object
pub const PROBE_FILE_PREFIX: &str = "director-test-";

/// Build the object path for one probe cycle, stamped with the probe time
pub fn probe_object_path(now: chrono::DateTime<Utc>) -> String {
    format!(
        "{MONITORING_PREFIX}/{PROBE_FILE_PREFIX}{}.txt",
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Manages the fleet of probe tasks
pub struct ProbeManager {
    store: Arc<AdStore>,
    tokens: Arc<DirectorTokens>,
    adaptive: Arc<AdaptiveStats>,
    statuses: Arc<DashMap<String, HealthStatus>>,
    tasks: DashMap<String, JoinHandle<()>>,
    semaphore: Arc<Semaphore>,
    interval: Duration,
    timeout: Duration,
    http: reqwest::Client,
}

impl std::fmt::Debug for ProbeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeManager")
            .field("tasks", &self.tasks.len())
            .field("interval", &self.interval)
            .finish()
    }
}

impl ProbeManager {
    /// Create a manager; `interval` should already carry the 1s floor.
    pub fn new(
        store: Arc<AdStore>,
        tokens: Arc<DirectorTokens>,
        adaptive: Arc<AdaptiveStats>,
        interval: Duration,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            store,
            tokens,
            adaptive,
            statuses: Arc::new(DashMap::new()),
            tasks: DashMap::new(),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            interval,
            timeout,
            http,
        }
    }

    /// Health status of a server, by ad URL key
    pub fn status(&self, url_key: &str) -> HealthStatus {
        self.statuses
            .get(url_key)
            .map(|s| *s.value())
            .unwrap_or_default()
    }

    /// Snapshot of every tracked status
    pub fn statuses(&self) -> Vec<(String, HealthStatus)> {
        self.statuses
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Ensure a probe task runs for the given ad URL.
    ///
    /// A refresh with identical identity leaves the running task alone;
    /// a task that has already completed is replaced.
    pub fn arm(&self, url_key: &str) {
        if let Some(existing) = self.tasks.get(url_key) {
            if !existing.is_finished() {
                debug!(url = %url_key, "probe task already running");
                return;
            }
        }
        self.statuses
            .insert(url_key.to_string(), HealthStatus::Init);
        let handle = self.spawn_probe(url_key.to_string());
        self.tasks.insert(url_key.to_string(), handle);
    }

    /// Cancel the probe task for an evicted ad
    pub fn disarm(&self, url_key: &str) {
        if let Some((_, handle)) = self.tasks.remove(url_key) {
            handle.abort();
        }
        self.statuses.remove(url_key);
        debug!(url = %url_key, "probe task disarmed");
    }

    /// Cancel every probe task
    pub fn disarm_all(&self) {
        let keys: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.disarm(&key);
        }
    }

    fn spawn_probe(&self, url_key: String) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let tokens = Arc::clone(&self.tokens);
        let adaptive = Arc::clone(&self.adaptive);
        let statuses = Arc::clone(&self.statuses);
        let semaphore = Arc::clone(&self.semaphore);
        let http = self.http.clone();
        let interval = self.interval;
        let timeout = self.timeout;

        tokio::spawn(async move {
            let mut consecutive_failures: u32 = 0;
            loop {
                tokio::time::sleep(interval).await;

                // The store is the source of truth: once the ad is gone,
                // this task is done.
                let ad = match store.get_by_url(&url_key) {
                    Some(ad) => ad,
                    None => break,
                };

                let permit = match semaphore.acquire().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let started = Instant::now();
                let outcome = probe_once(&http, &tokens, &ad.data_url, timeout).await;
                let latency = started.elapsed();
                drop(permit);

                let current = statuses
                    .get(&url_key)
                    .map(|s| *s.value())
                    .unwrap_or_default();
                let next = match outcome {
                    Ok(()) => {
                        consecutive_failures = 0;
                        adaptive.record_success(&ad.name, latency);
                        HealthStatus::Ok
                    }
                    Err(reason) => {
                        consecutive_failures += 1;
                        adaptive.record_failure(&ad.name);
                        warn!(
                            server = %ad.name,
                            url = %url_key,
                            failures = consecutive_failures,
                            reason = %reason,
                            "health probe failed"
                        );
                        if consecutive_failures >= 2 {
                            HealthStatus::Failed
                        } else if current == HealthStatus::Ok {
                            HealthStatus::Degraded
                        } else {
                            current
                        }
                    }
                };
                if next != current {
                    debug!(server = %ad.name, from = %current, to = %next, "health status change");
                }
                statuses.insert(url_key.clone(), next);
            }
            statuses.remove(&url_key);
        })
    }
}

/// One probe: fetch the synthetic monitoring object with a short-lived
/// director credential.
async fn probe_once(
    http: &reqwest::Client,
    tokens: &DirectorTokens,
    data_url: &str,
    timeout: Duration,
) -> Result<(), String> {
    let object_path = probe_object_path(Utc::now());
    let url = format!("{}{}", data_url.trim_end_matches('/'), object_path);
    let token = tokens
        .mint_probe_token(data_url, MONITORING_PREFIX)
        .map_err(|e| e.to_string())?;

    let resp = tokio::time::timeout(
        timeout,
        http.get(&url).bearer_auth(token).send(),
    )
    .await
    .map_err(|_| format!("timeout after {timeout:?}"))?
    .map_err(|e| e.to_string())?;

    if resp.status().is_success() {
        Ok(())
    } else {
        Err(format!("unexpected status {}", resp.status()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_core::{Capabilities, ServerAd, ServerKind, StorageKind};
    use wiremock::matchers::{method, path_regex};
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
            disable_health_probe: false,
            from_topology: false,
            version: String::new(),
            expiration: None,
            ewma_load: 0.0,
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    fn manager(store: Arc<AdStore>) -> ProbeManager {
        ProbeManager::new(
            store,
            Arc::new(DirectorTokens::new("https://director.test")),
            Arc::new(AdaptiveStats::new()),
            Duration::from_millis(50),
            Duration::from_secs(1),
            10,
        )
    }

    #[test]
    fn test_probe_object_path_shape() {
        let path = probe_object_path(Utc::now());
        assert!(path.starts_with("/pelican/monitoring/directorTest/director-test-"));
        assert!(path.ends_with(".txt"));
    }

    #[tokio::test]
    async fn test_probe_reaches_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/pelican/monitoring/directorTest/.*\.txt$"))
            .respond_with(ResponseTemplate::new(200).set_body_string("test file content"))
            .mount(&server)
            .await;

        let store = Arc::new(AdStore::new());
        store.upsert(test_ad("o1", &server.uri()));
        let probes = manager(Arc::clone(&store));
        probes.arm(&server.uri());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(probes.status(&server.uri()), HealthStatus::Ok);
        probes.disarm_all();
    }

    #[tokio::test]
    async fn test_two_failures_reach_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Arc::new(AdStore::new());
        store.upsert(test_ad("o1", &server.uri()));
        let probes = manager(Arc::clone(&store));
        probes.arm(&server.uri());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(probes.status(&server.uri()), HealthStatus::Failed);
        probes.disarm_all();
    }

    #[tokio::test]
    async fn test_probe_exits_when_ad_evicted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(AdStore::new());
        store.upsert(test_ad("o1", &server.uri()));
        let probes = manager(Arc::clone(&store));
        probes.arm(&server.uri());
        tokio::time::sleep(Duration::from_millis(150)).await;

        store.delete(&server.uri());
        tokio::time::sleep(Duration::from_millis(200)).await;
        // The task saw the missing ad and cleaned up its status
        assert_eq!(probes.status(&server.uri()), HealthStatus::Init);
    }

    #[tokio::test]
    async fn test_arm_is_idempotent_for_running_task() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(AdStore::new());
        store.upsert(test_ad("o1", &server.uri()));
        let probes = manager(Arc::clone(&store));
        probes.arm(&server.uri());
        tokio::time::sleep(Duration::from_millis(120)).await;
        let status_before = probes.status(&server.uri());
        probes.arm(&server.uri());
        // Re-arming does not reset an established status to Init
        assert_eq!(probes.status(&server.uri()), status_before);
        probes.disarm_all();
    }
}
