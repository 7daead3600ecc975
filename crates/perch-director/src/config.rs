//! Director configuration

use perch_core::{Error, Result, SortMethod, TimeoutConfig};
use perch_geo::GeoOverride;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level director configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectorConfig {
    /// Listen address
    pub listen: SocketAddr,

    /// Externally reachable URL of this director
    pub external_url: String,

    /// Federation registry base URL
    pub registry_url: String,

    /// Hostnames that resolve default paths to origin-serving mode
    #[serde(default)]
    pub origin_hosts: Vec<String>,

    /// Hostnames that resolve default paths to cache-serving mode
    #[serde(default)]
    pub cache_hosts: Vec<String>,

    /// Candidate ordering strategy
    #[serde(default)]
    pub sort_method: SortMethod,

    /// Maximum servers listed in a redirect's Link header
    #[serde(default = "default_max_stat_response")]
    pub max_stat_response: usize,

    /// Guaranteed floor of listed servers when that many exist
    #[serde(default = "default_min_stat_response")]
    pub min_stat_response: usize,

    /// Lifetime of an advertisement without an explicit expiration
    #[serde(default = "default_ad_ttl", with = "humantime_serde")]
    pub advertisement_ttl: Duration,

    /// Interval between health probes of one server
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub probe_interval: Duration,

    /// Fleet-wide cap on concurrent health probes
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,

    /// Per-server cap on concurrent presence checks
    #[serde(default = "default_stat_concurrency")]
    pub stat_concurrency: usize,

    /// Presence-result cache TTL
    #[serde(default = "default_stat_cache_ttl", with = "humantime_serde")]
    pub stat_cache_ttl: Duration,

    /// Presence-result cache capacity per server
    #[serde(default = "default_stat_cache_capacity")]
    pub stat_cache_capacity: usize,

    /// Time constant of the adaptive-sort load weighting
    #[serde(default = "default_ewma_time_constant", with = "humantime_serde")]
    pub adaptive_sort_ewma_time_constant: Duration,

    /// Servers permanently excluded from redirects, by name
    #[serde(default)]
    pub filtered_servers: Vec<String>,

    /// Namespace prefixes each cache may serve; a cache absent from the
    /// map may serve anything
    #[serde(default)]
    pub allowed_cache_prefixes: HashMap<String, Vec<String>>,

    /// GeoIP database path (GeoLite2-City format)
    #[serde(default)]
    pub geoip_db: Option<PathBuf>,

    /// Coordinate overrides applied before the database
    #[serde(default)]
    pub geo_overrides: Vec<GeoOverride>,

    /// Interval between registry downtime reconciliations
    #[serde(default = "default_downtime_interval", with = "humantime_serde")]
    pub downtime_reconcile_interval: Duration,

    /// Drain deadline at shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Oldest server version whose advertisements are accepted
    #[serde(default = "default_min_version")]
    pub minimum_server_version: String,

    /// Shared control-plane timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_max_stat_response() -> usize {
    6
}
fn default_min_stat_response() -> usize {
    2
}
fn default_ad_ttl() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_probe_interval() -> Duration {
    Duration::from_secs(15)
}
fn default_probe_concurrency() -> usize {
    100
}
fn default_stat_concurrency() -> usize {
    100
}
fn default_stat_cache_ttl() -> Duration {
    Duration::from_secs(60)
}
fn default_stat_cache_capacity() -> usize {
    100
}
fn default_ewma_time_constant() -> Duration {
    Duration::from_secs(300)
}
fn default_downtime_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_min_version() -> String {
    "7.0.0".to_string()
}

impl DirectorConfig {
    /// A configuration suitable for tests: everything local, defaults
    /// everywhere else.
    pub fn for_tests(registry_url: impl Into<String>) -> Self {
        Self {
            listen: "127.0.0.1:0".parse().expect("literal addr"),
            external_url: "https://director.test".to_string(),
            registry_url: registry_url.into(),
            origin_hosts: Vec::new(),
            cache_hosts: Vec::new(),
            sort_method: SortMethod::Distance,
            max_stat_response: default_max_stat_response(),
            min_stat_response: default_min_stat_response(),
            advertisement_ttl: default_ad_ttl(),
            probe_interval: Duration::from_secs(1),
            probe_concurrency: default_probe_concurrency(),
            stat_concurrency: 1,
            stat_cache_ttl: default_stat_cache_ttl(),
            stat_cache_capacity: default_stat_cache_capacity(),
            adaptive_sort_ewma_time_constant: default_ewma_time_constant(),
            filtered_servers: Vec::new(),
            allowed_cache_prefixes: HashMap::new(),
            geoip_db: None,
            geo_overrides: Vec::new(),
            downtime_reconcile_interval: default_downtime_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            minimum_server_version: default_min_version(),
            timeouts: TimeoutConfig::default(),
        }
    }

    /// Load configuration from a YAML file, applying field defaults and
    /// validating the result.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.external_url.is_empty() {
            return Err(Error::Config("external_url is required".to_string()));
        }
        if self.registry_url.is_empty() {
            return Err(Error::Config("registry_url is required".to_string()));
        }
        if self.max_stat_response == 0 {
            return Err(Error::Config(
                "max_stat_response must be positive".to_string(),
            ));
        }
        if self.min_stat_response > self.max_stat_response {
            return Err(Error::Config(
                "min_stat_response cannot exceed max_stat_response".to_string(),
            ));
        }
        if semver::Version::parse(&self.minimum_server_version).is_err() {
            return Err(Error::Config(format!(
                "minimum_server_version {} is not a semantic version",
                self.minimum_server_version
            )));
        }
        Ok(())
    }

    /// Probe interval with the one-second floor applied
    pub fn effective_probe_interval(&self) -> Duration {
        self.probe_interval.max(Duration::from_secs(1))
    }

    /// Concurrency limits must be positive; fall back to a modest
    /// default rather than an unbounded pool.
    pub fn effective_stat_concurrency(&self) -> usize {
        if self.stat_concurrency == 0 {
            tracing::warn!("stat_concurrency must be positive; using 100");
            100
        } else {
            self.stat_concurrency
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_from_minimal_yaml() {
        let yaml = r#"
listen: "0.0.0.0:8443"
external_url: "https://director.example.org"
registry_url: "https://registry.example.org"
"#;
        let config: DirectorConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_stat_response, 6);
        assert_eq!(config.probe_interval, Duration::from_secs(15));
        assert_eq!(config.advertisement_ttl, Duration::from_secs(900));
        assert_eq!(config.sort_method, SortMethod::Distance);
    }

    #[test]
    fn test_validation_rejects_bad_bounds() {
        let mut config = DirectorConfig::for_tests("https://registry.test");
        config.min_stat_response = 10;
        assert!(config.validate().is_err());

        let mut config = DirectorConfig::for_tests("https://registry.test");
        config.minimum_server_version = "not-a-version".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_probe_interval_floor() {
        let mut config = DirectorConfig::for_tests("https://registry.test");
        config.probe_interval = Duration::from_millis(10);
        assert_eq!(config.effective_probe_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_humantime_durations() {
        let yaml = r#"
listen: "0.0.0.0:8443"
external_url: "https://director.example.org"
registry_url: "https://registry.example.org"
probe_interval: "30s"
advertisement_ttl: "5m"
"#;
        let config: DirectorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.probe_interval, Duration::from_secs(30));
        assert_eq!(config.advertisement_ttl, Duration::from_secs(300));
    }
}
