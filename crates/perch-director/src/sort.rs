//! Candidate ordering strategies for the redirect engine
//!
//! Four strategies form a closed set selected by [`SortMethod`]; adding
//! a strategy means adding a variant plus its comparator here. Whatever
//! the strategy, the result is a total order for a given (request,
//! snapshot): every comparator falls back to the server name.

use dashmap::DashMap;
use perch_core::{ServerAd, SortMethod};
use perch_geo::Coordinate;
use rand::seq::SliceRandom;
use std::time::Duration;

/// Weight given to the newest observation in the adaptive EWMA
const EWMA_WEIGHT: f64 = 0.25;

/// Neutral score assigned to servers with no history
const NEUTRAL_SCORE: f64 = 0.5;

/// EWMA success/latency scores per server name, fed by probe outcomes
#[derive(Debug, Default)]
pub struct AdaptiveStats {
    scores: DashMap<String, f64>,
}

impl AdaptiveStats {
    /// Empty score table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful interaction; faster is better.
    pub fn record_success(&self, name: &str, latency: Duration) {
        let observation = 1.0 / (1.0 + latency.as_secs_f64());
        self.update(name, observation);
    }

    /// Record a failed interaction
    pub fn record_failure(&self, name: &str) {
        self.update(name, 0.0);
    }

    /// Current score; higher is better, 0.5 when unknown
    pub fn score(&self, name: &str) -> f64 {
        self.scores.get(name).map(|s| *s).unwrap_or(NEUTRAL_SCORE)
    }

    fn update(&self, name: &str, observation: f64) {
        let mut entry = self.scores.entry(name.to_string()).or_insert(NEUTRAL_SCORE);
        *entry = *entry * (1.0 - EWMA_WEIGHT) + observation * EWMA_WEIGHT;
    }

    /// Clear all history (test support)
    pub fn reset(&self) {
        self.scores.clear();
    }
}

fn server_coord(ad: &ServerAd) -> Coordinate {
    Coordinate {
        lat: ad.latitude,
        lon: ad.longitude,
    }
}

/// Distance from the client; null coordinates (either side) sort last
fn distance_km(ad: &ServerAd, client: Coordinate) -> f64 {
    let coord = server_coord(ad);
    if coord.is_null() || client.is_null() {
        f64::INFINITY
    } else {
        client.haversine_km(&coord)
    }
}

/// Order candidates in place according to the configured strategy.
///
/// `alpha` is `1 / AdaptiveSortEWMATimeConstant` in seconds and scales
/// how strongly load repels traffic under `DistanceAndLoad`.
pub fn sort_candidates(
    method: SortMethod,
    ads: &mut [ServerAd],
    client: Coordinate,
    alpha: f64,
    adaptive: &AdaptiveStats,
) {
    match method {
        SortMethod::Distance => {
            ads.sort_by(|a, b| {
                distance_km(a, client)
                    .total_cmp(&distance_km(b, client))
                    .then_with(|| a.name.cmp(&b.name))
            });
        }
        SortMethod::DistanceAndLoad => {
            // exp(-alpha * load) discounts a server's attractiveness as
            // its reported load rises; dividing distance by the weight
            // pushes loaded servers outward.
            let weighted = |ad: &ServerAd| {
                let d = distance_km(ad, client);
                if d.is_infinite() {
                    d
                } else {
                    d / (-alpha * ad.ewma_load).exp()
                }
            };
            ads.sort_by(|a, b| {
                weighted(a)
                    .total_cmp(&weighted(b))
                    .then_with(|| a.name.cmp(&b.name))
            });
        }
        SortMethod::Random => {
            ads.shuffle(&mut rand::thread_rng());
        }
        SortMethod::Adaptive => {
            ads.sort_by(|a, b| {
                adaptive
                    .score(&b.name)
                    .total_cmp(&adaptive.score(&a.name))
                    .then_with(|| distance_km(a, client).total_cmp(&distance_km(b, client)))
                    .then_with(|| a.name.cmp(&b.name))
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_core::{Capabilities, ServerKind, StorageKind};

    fn ad_at(name: &str, lat: f64, lon: f64, load: f64) -> ServerAd {
        ServerAd {
            name: name.to_string(),
            registry_prefix: format!("/caches/{name}"),
            kind: ServerKind::Cache,
            data_url: format!("https://{name}.example.org"),
            web_url: format!("https://{name}.example.org"),
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
            ewma_load: load,
            latitude: lat,
            longitude: lon,
        }
    }

    // Client in Madison, WI
    const CLIENT: Coordinate = Coordinate {
        lat: 43.0731,
        lon: -89.4012,
    };

    #[test]
    fn test_distance_sort_nearest_first() {
        let mut ads = vec![
            ad_at("amsterdam", 52.37, 4.90, 0.0),
            ad_at("chicago", 41.88, -87.63, 0.0),
            ad_at("denver", 39.74, -104.99, 0.0),
        ];
        sort_candidates(
            SortMethod::Distance,
            &mut ads,
            CLIENT,
            0.01,
            &AdaptiveStats::new(),
        );
        let names: Vec<_> = ads.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["chicago", "denver", "amsterdam"]);
    }

    #[test]
    fn test_null_coordinates_sort_last() {
        let mut ads = vec![
            ad_at("nowhere", 0.0, 0.0, 0.0),
            ad_at("chicago", 41.88, -87.63, 0.0),
        ];
        sort_candidates(
            SortMethod::Distance,
            &mut ads,
            CLIENT,
            0.01,
            &AdaptiveStats::new(),
        );
        assert_eq!(ads.last().unwrap().name, "nowhere");
    }

    #[test]
    fn test_distance_tie_broken_by_name() {
        let mut ads = vec![
            ad_at("zeta", 41.88, -87.63, 0.0),
            ad_at("alpha", 41.88, -87.63, 0.0),
        ];
        sort_candidates(
            SortMethod::Distance,
            &mut ads,
            CLIENT,
            0.01,
            &AdaptiveStats::new(),
        );
        assert_eq!(ads[0].name, "alpha");
    }

    #[test]
    fn test_load_pushes_nearer_server_back() {
        // Chicago is closer but heavily loaded; Denver takes the front.
        let mut ads = vec![
            ad_at("chicago", 41.88, -87.63, 500.0),
            ad_at("denver", 39.74, -104.99, 0.0),
        ];
        sort_candidates(
            SortMethod::DistanceAndLoad,
            &mut ads,
            CLIENT,
            0.01,
            &AdaptiveStats::new(),
        );
        assert_eq!(ads[0].name, "denver");
    }

    #[test]
    fn test_adaptive_prefers_history() {
        let adaptive = AdaptiveStats::new();
        for _ in 0..10 {
            adaptive.record_success("reliable", Duration::from_millis(50));
            adaptive.record_failure("flaky");
        }
        // flaky is nearer but has a bad record
        let mut ads = vec![
            ad_at("flaky", 41.88, -87.63, 0.0),
            ad_at("reliable", 39.74, -104.99, 0.0),
        ];
        sort_candidates(SortMethod::Adaptive, &mut ads, CLIENT, 0.01, &adaptive);
        assert_eq!(ads[0].name, "reliable");
    }

    #[test]
    fn test_adaptive_unknown_servers_fall_back_to_distance() {
        let adaptive = AdaptiveStats::new();
        let mut ads = vec![
            ad_at("denver", 39.74, -104.99, 0.0),
            ad_at("chicago", 41.88, -87.63, 0.0),
        ];
        sort_candidates(SortMethod::Adaptive, &mut ads, CLIENT, 0.01, &adaptive);
        assert_eq!(ads[0].name, "chicago");
    }

    #[test]
    fn test_random_is_a_permutation() {
        let mut ads = vec![
            ad_at("a", 1.0, 1.0, 0.0),
            ad_at("b", 2.0, 2.0, 0.0),
            ad_at("c", 3.0, 3.0, 0.0),
        ];
        sort_candidates(
            SortMethod::Random,
            &mut ads,
            CLIENT,
            0.01,
            &AdaptiveStats::new(),
        );
        let mut names: Vec<_> = ads.iter().map(|a| a.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ewma_score_moves() {
        let adaptive = AdaptiveStats::new();
        assert_eq!(adaptive.score("s"), 0.5);
        adaptive.record_success("s", Duration::from_millis(0));
        assert!(adaptive.score("s") > 0.5);
        for _ in 0..20 {
            adaptive.record_failure("s");
        }
        assert!(adaptive.score("s") < 0.1);
    }
}
