//! Runtime disqualification of servers from redirect candidacy
//!
//! The filter set is independent of the ad store: an operator's decision
//! to disable a server must survive the server's ad expiring and being
//! re-advertised.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use perch_core::{Downtime, FilterReason};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Process-wide map of disqualified servers, keyed by server name
#[derive(Debug, Default)]
pub struct FilterSet {
    reasons: RwLock<HashMap<String, FilterReason>>,
    /// Names whose current filter entry came from the registry's
    /// federation-wide downtime list; reconciliation clears these when
    /// the registry stops reporting them.
    registry_applied: RwLock<HashSet<String>>,
    federation_downtimes: RwLock<Vec<Downtime>>,
}

impl FilterSet {
    /// Empty filter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed permanent filters from director configuration
    pub fn with_permanent(names: impl IntoIterator<Item = String>) -> Self {
        let set = Self::new();
        {
            let mut reasons = set.reasons.write();
            for name in names {
                reasons.insert(name, FilterReason::Permanent);
            }
        }
        set
    }

    /// Current filter reason for a server, if any
    pub fn get(&self, name: &str) -> Option<FilterReason> {
        self.reasons.read().get(name).copied()
    }

    /// Whether the server must be excluded from candidates.
    ///
    /// An `AdminAllowed` entry overrides exclusion.
    pub fn is_excluded(&self, name: &str) -> bool {
        match self.get(name) {
            Some(reason) => reason.excludes(),
            None => false,
        }
    }

    /// Set a filter reason by operator action
    pub fn set(&self, name: &str, reason: FilterReason) {
        info!(server = %name, reason = %reason, "server filter updated");
        self.reasons.write().insert(name.to_string(), reason);
    }

    /// Remove a filter entry
    pub fn clear(&self, name: &str) -> bool {
        self.reasons.write().remove(name).is_some()
    }

    /// Snapshot of the whole map, for the admin surface and tests
    pub fn snapshot(&self) -> HashMap<String, FilterReason> {
        self.reasons.read().clone()
    }

    /// Ingest-time downtime synthesis: a server whose own advertisement
    /// carries an active downtime window is filtered as `ServerReported`;
    /// once its windows no longer cover now, that entry (and only that
    /// entry) is cleared.
    pub fn sync_server_reported(&self, name: &str, downtimes: &[Downtime], now: DateTime<Utc>) {
        let active = perch_core::downtime::any_active(downtimes, now);
        let mut reasons = self.reasons.write();
        match reasons.get(name) {
            None if active => {
                info!(server = %name, "server advertises an active downtime; filtering");
                reasons.insert(name.to_string(), FilterReason::ServerReported);
            }
            Some(FilterReason::ServerReported) if !active => {
                info!(server = %name, "server downtime ended; unfiltering");
                reasons.remove(name);
            }
            Some(FilterReason::Topology) if active => {
                // Both the topology feed and the server itself declare a
                // downtime; the server's own declaration wins.
                warn!(
                    server = %name,
                    "topology and server-reported downtimes overlap; preferring the server's declaration"
                );
                reasons.insert(name.to_string(), FilterReason::ServerReported);
            }
            _ => {}
        }
    }

    /// Reconcile the registry's federation-wide downtime list.
    ///
    /// Active entries are applied as temporary filters; previously
    /// applied entries the registry no longer reports are cleared.
    pub fn reconcile_federation_downtimes(&self, downtimes: Vec<Downtime>, now: DateTime<Utc>) {
        let active_names: HashSet<String> = downtimes
            .iter()
            .filter(|d| d.is_active(now))
            .map(|d| d.server_name.clone())
            .collect();

        let mut applied = self.registry_applied.write();
        let mut reasons = self.reasons.write();

        for stale in applied.difference(&active_names).cloned().collect::<Vec<_>>() {
            if matches!(reasons.get(&stale), Some(FilterReason::AdminTemporary)) {
                debug!(server = %stale, "registry downtime ended; unfiltering");
                reasons.remove(&stale);
            }
            applied.remove(&stale);
        }

        for name in &active_names {
            if !reasons.contains_key(name) {
                info!(server = %name, "registry reports downtime; filtering");
                reasons.insert(name.clone(), FilterReason::AdminTemporary);
            }
            applied.insert(name.clone());
        }

        *self.federation_downtimes.write() = downtimes;
    }

    /// The most recent federation-wide downtime list
    pub fn federation_downtimes(&self) -> Vec<Downtime> {
        self.federation_downtimes.read().clone()
    }

    /// Clear everything (test support)
    pub fn reset(&self) {
        self.reasons.write().clear();
        self.registry_applied.write().clear();
        self.federation_downtimes.write().clear();
    }
}
