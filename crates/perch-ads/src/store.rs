//! TTL'd in-memory store of server advertisements
//!
//! Keyed by the advertisement's data URL. Two invariants the rest of the
//! director leans on:
//!
//! - at most one entry per host:port, regardless of http/https scheme;
//! - a live (Pelican-sourced) ad is never displaced by a topology ad.

use chrono::Utc;
use dashmap::DashMap;
use perch_core::ServerAd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default lifetime of an advertisement without an explicit expiration
pub const DEFAULT_AD_TTL: Duration = Duration::from_secs(15 * 60);

/// Sweep cadence of the expiry reaper
const REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Emitted on the store's event channel when an entry leaves the store
#[derive(Debug, Clone)]
pub enum AdEvent {
    /// The ad was evicted (TTL lapse, replacement across schemes, or
    /// administrative delete); per-server probe and stat state must be
    /// torn down.
    Evicted {
        /// Store key of the evicted ad
        url: String,
        /// Server name of the evicted ad
        name: String,
    },
}

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry created
    Inserted,
    /// Existing entry replaced in place
    Refreshed,
    /// Topology ad ignored because a Pelican ad already holds the slot
    IgnoredTopology,
    /// Ad arrived already expired and was dropped
    AlreadyExpired,
}

#[derive(Debug, Clone)]
struct Entry {
    ad: ServerAd,
    expires_at: Instant,
}

impl Entry {
    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// The director's advertisement store
#[derive(Debug)]
pub struct AdStore {
    entries: DashMap<String, Entry>,
    ad_ttl: Duration,
    events: broadcast::Sender<AdEvent>,
}

impl AdStore {
    /// Create a store with the default advertisement TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_AD_TTL)
    }

    /// Create a store with a custom advertisement TTL
    pub fn with_ttl(ad_ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            entries: DashMap::new(),
            ad_ttl,
            events,
        }
    }

    /// Subscribe to eviction events
    pub fn subscribe(&self) -> broadcast::Receiver<AdEvent> {
        self.events.subscribe()
    }

    /// Insert or refresh an advertisement.
    ///
    /// The entry's lifetime is `min(explicit expiration, ad TTL)`. The
    /// http/https sibling key is removed first so one host:port never
    /// appears twice across schemes.
    pub fn upsert(&self, mut ad: ServerAd) -> UpsertOutcome {
        let key = ad.url_key().to_string();
        if key.is_empty() {
            warn!(name = %ad.name, "advertisement with empty data URL dropped");
            return UpsertOutcome::AlreadyExpired;
        }

        let ttl = match self.ttl_for(&ad) {
            Some(ttl) => ttl,
            None => {
                debug!(name = %ad.name, url = %key, "advertisement expired on arrival");
                return UpsertOutcome::AlreadyExpired;
            }
        };

        // Resolve the scheme-sibling identity before inserting.
        let sibling = sibling_url(&key);
        let existing = self
            .live_entry(&key)
            .map(|e| (key.clone(), e))
            .or_else(|| sibling.and_then(|s| self.live_entry(&s).map(|e| (s, e))));

        if let Some((existing_key, entry)) = existing {
            let existing = entry.ad;
            if ad.from_topology && !existing.from_topology {
                debug!(
                    name = %ad.name,
                    url = %key,
                    "topology ad ignored; a live server already advertises this identity"
                );
                return UpsertOutcome::IgnoredTopology;
            }
            if !ad.from_topology && existing.from_topology {
                info!(
                    topology = %existing.name,
                    server = %ad.name,
                    url = %key,
                    "topology ad replaced by live server advertisement"
                );
            }
            // An eviction event fires only when a key actually leaves
            // the store; an in-place replacement is invisible to the
            // probe and stat machinery, which look entries up by key.
            if existing_key != key {
                self.evict(&existing_key);
            }
            if !ad.from_topology && !existing.from_topology {
                // Carry the load estimate across refreshes so sorting
                // does not reset on every keep-alive.
                ad.ewma_load = existing.ewma_load;
            }
            let refreshed = existing_key == key;
            self.entries.insert(
                key,
                Entry {
                    ad,
                    expires_at: Instant::now() + ttl,
                },
            );
            return if refreshed {
                UpsertOutcome::Refreshed
            } else {
                UpsertOutcome::Inserted
            };
        }

        self.entries.insert(
            key,
            Entry {
                ad,
                expires_at: Instant::now() + ttl,
            },
        );
        UpsertOutcome::Inserted
    }

    /// Look up a live advertisement by its data URL
    pub fn get_by_url(&self, url: &str) -> Option<ServerAd> {
        self.live_entry(url).map(|e| e.ad.clone())
    }

    /// Snapshot of every live advertisement.
    ///
    /// Requests operate on the snapshot taken at entry, so concurrent
    /// upserts never change a request's view mid-flight.
    pub fn snapshot(&self) -> Vec<ServerAd> {
        self.entries
            .iter()
            .filter(|e| !e.value().expired())
            .map(|e| e.value().ad.clone())
            .collect()
    }

    /// Number of live advertisements
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.value().expired()).count()
    }

    /// Whether the store holds no live advertisements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove one advertisement, emitting an eviction event
    pub fn delete(&self, url: &str) -> bool {
        self.evict(url)
    }

    /// Remove every advertisement, emitting eviction events
    pub fn delete_all(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.evict(&key);
        }
    }

    /// Background task sweeping expired entries once a second. Eviction
    /// events fire from here, so probe/stat teardown follows expiry by
    /// at most one sweep.
    pub fn start_reaper(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        store.sweep();
                    }
                    _ = shutdown.recv() => {
                        debug!("ad store reaper stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Remove expired entries, firing events for each
    pub fn sweep(&self) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().expired())
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            if self.evict(&key) {
                debug!(url = %key, "advertisement expired");
            }
        }
    }

    fn live_entry(&self, key: &str) -> Option<Entry> {
        self.entries
            .get(key)
            .filter(|e| !e.expired())
            .map(|e| e.value().clone())
    }

    fn evict(&self, key: &str) -> bool {
        if let Some((url, entry)) = self.entries.remove(key) {
            let _ = self.events.send(AdEvent::Evicted {
                url,
                name: entry.ad.name,
            });
            true
        } else {
            false
        }
    }

    fn ttl_for(&self, ad: &ServerAd) -> Option<Duration> {
        match ad.expiration {
            None => Some(self.ad_ttl),
            Some(expiration) => {
                let remaining = expiration.signed_duration_since(Utc::now());
                let remaining = remaining.to_std().ok()?;
                if remaining.is_zero() {
                    None
                } else {
                    Some(remaining.min(self.ad_ttl))
                }
            }
        }
    }
}

impl Default for AdStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The http/https sibling of a URL, or `None` for other schemes
fn sibling_url(url: &str) -> Option<String> {
    if let Some(rest) = url.strip_prefix("https://") {
        Some(format!("http://{rest}"))
    } else {
        url.strip_prefix("http://")
            .map(|rest| format!("https://{rest}"))
    }
}
