//! Common types used throughout Perch

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Role a federation server plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// Owns and serves the original bytes of a namespace
    Origin,
    /// Stores copies of objects to accelerate reads
    Cache,
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Origin => write!(f, "origin"),
            Self::Cache => write!(f, "cache"),
        }
    }
}

impl ServerKind {
    /// Registry prefix segment for this kind (`/origins/<name>` or `/caches/<name>`)
    pub fn registry_segment(&self) -> &'static str {
        match self {
            Self::Origin => "origins",
            Self::Cache => "caches",
        }
    }
}

/// Storage backend behind a server's data endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// POSIX filesystem backend
    #[default]
    Posix,
    /// S3-compatible object store
    S3,
    /// Plain HTTPS backend
    Https,
    /// XRootD backend
    Xroot,
    /// Globus collection
    Globus,
}

impl StorageKind {
    /// Non-POSIX backends do not serve the synthetic monitoring tree, so
    /// the director must not probe them.
    pub fn supports_health_probe(&self) -> bool {
        matches!(self, Self::Posix)
    }
}

/// What a server has told the federation it can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    /// Objects may be read without a token
    pub public_reads: bool,
    /// Objects may be read with a token
    pub reads: bool,
    /// Objects may be written
    pub writes: bool,
    /// Collections may be listed
    pub listings: bool,
    /// Clients may bypass caches and read the origin directly
    pub direct_reads: bool,
}

impl Capabilities {
    /// Whether these capabilities satisfy the requirement of an operation
    pub fn satisfies(&self, required: RequiredCapability) -> bool {
        match required {
            RequiredCapability::Read => self.reads || self.public_reads,
            RequiredCapability::PublicRead => self.public_reads,
            RequiredCapability::Write => self.writes,
            RequiredCapability::Listing => self.listings,
            RequiredCapability::DirectRead => self.direct_reads,
        }
    }
}

/// Capability an operation requires of a candidate server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredCapability {
    /// Token-bearing or anonymous read
    Read,
    /// Anonymous read only
    PublicRead,
    /// Object creation or deletion
    Write,
    /// Collection listing
    Listing,
    /// Cache-bypassing read
    DirectRead,
}

/// Candidate ordering strategy used by the redirect engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortMethod {
    /// Ascending haversine distance from the client
    #[default]
    Distance,
    /// Distance weighted by `exp(-alpha * load)`
    DistanceAndLoad,
    /// Uniform shuffle
    Random,
    /// EWMA of prior success/latency, distance tiebreak
    Adaptive,
}

/// Health classification produced by the director's periodic probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Not yet probed
    #[default]
    Init,
    /// Last probe succeeded
    Ok,
    /// One probe failed; not yet conclusive
    Degraded,
    /// Two consecutive probes failed
    Failed,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Ok => write!(f, "ok"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why a server is excluded from redirect candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterReason {
    /// Permanently disabled via director configuration
    Permanent,
    /// Temporarily disabled by a federation admin
    AdminTemporary,
    /// The server's own advertisement declared an active downtime
    ServerReported,
    /// Disabled via the topology feed
    Topology,
    /// Admin override: serve despite other filters
    AdminAllowed,
}

impl FilterReason {
    /// Whether this entry actually excludes the server (the admin override
    /// is stored in the same map but has the opposite effect)
    pub fn excludes(&self) -> bool {
        !matches!(self, Self::AdminAllowed)
    }
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permanent => write!(f, "permanently disabled via the director configuration"),
            Self::AdminTemporary => write!(f, "temporarily disabled via the admin website"),
            Self::ServerReported => write!(f, "temporarily disabled by the server admin"),
            Self::Topology => write!(f, "disabled via the topology policy"),
            Self::AdminAllowed => write!(f, "temporarily enabled via the admin website"),
        }
    }
}

/// Token scopes understood by the federation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenScope {
    /// A server advertising itself to the director
    #[serde(rename = "pelican.advertise")]
    Advertise,
    /// Scraping the director's service-discovery endpoint
    #[serde(rename = "pelican.directorServiceDiscovery")]
    DirectorServiceDiscovery,
    /// Reading an object
    #[serde(rename = "storage.read")]
    StorageRead,
    /// Overwriting or deleting an object
    #[serde(rename = "storage.modify")]
    StorageModify,
    /// Creating an object
    #[serde(rename = "storage.create")]
    StorageCreate,
    /// Staging an object from tape or cold storage
    #[serde(rename = "storage.stage")]
    StorageStage,
}

impl TokenScope {
    /// The scope string as it appears in a token's `scope` claim
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advertise => "pelican.advertise",
            Self::DirectorServiceDiscovery => "pelican.directorServiceDiscovery",
            Self::StorageRead => "storage.read",
            Self::StorageModify => "storage.modify",
            Self::StorageCreate => "storage.create",
            Self::StorageStage => "storage.stage",
        }
    }

    /// Render the scope with a resource path suffix, e.g. `storage.read:/foo`
    pub fn with_path(&self, path: &str) -> String {
        format!("{}:{}", self.as_str(), path)
    }
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeouts shared by the control-plane HTTP clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    /// Per-attempt director query deadline
    #[serde(with = "humantime_serde")]
    pub director_request: Duration,

    /// Health probe deadline
    #[serde(with = "humantime_serde")]
    pub health_probe: Duration,

    /// Object presence (stat) deadline
    #[serde(with = "humantime_serde")]
    pub stat: Duration,

    /// Federation metadata discovery deadline
    #[serde(with = "humantime_serde")]
    pub discovery: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            director_request: Duration::from_secs(5),
            health_probe: Duration::from_secs(10),
            stat: Duration::from_millis(300),
            discovery: Duration::from_secs(5),
        }
    }
}

impl TimeoutConfig {
    /// Stat deadlines are rounded up to a 100ms floor so a misconfigured
    /// near-zero value cannot starve every presence check.
    pub fn effective_stat(&self) -> Duration {
        self.stat.max(Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_satisfies() {
        let caps = Capabilities {
            public_reads: true,
            reads: false,
            writes: false,
            listings: true,
            direct_reads: false,
        };
        assert!(caps.satisfies(RequiredCapability::Read));
        assert!(caps.satisfies(RequiredCapability::PublicRead));
        assert!(caps.satisfies(RequiredCapability::Listing));
        assert!(!caps.satisfies(RequiredCapability::Write));
        assert!(!caps.satisfies(RequiredCapability::DirectRead));

        let auth_only = Capabilities {
            reads: true,
            ..Default::default()
        };
        assert!(auth_only.satisfies(RequiredCapability::Read));
        assert!(!auth_only.satisfies(RequiredCapability::PublicRead));
    }

    #[test]
    fn test_storage_kind_probe_support() {
        assert!(StorageKind::Posix.supports_health_probe());
        assert!(!StorageKind::S3.supports_health_probe());
        assert!(!StorageKind::Globus.supports_health_probe());
    }

    #[test]
    fn test_sort_method_serde() {
        let json = serde_json::to_string(&SortMethod::DistanceAndLoad).unwrap();
        assert_eq!(json, "\"distance_and_load\"");
        let back: SortMethod = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SortMethod::DistanceAndLoad);
    }

    #[test]
    fn test_filter_reason_excludes() {
        assert!(FilterReason::Permanent.excludes());
        assert!(FilterReason::ServerReported.excludes());
        assert!(!FilterReason::AdminAllowed.excludes());
    }

    #[test]
    fn test_scope_with_path() {
        assert_eq!(
            TokenScope::StorageRead.with_path("/foo/bar"),
            "storage.read:/foo/bar"
        );
    }

    #[test]
    fn test_stat_timeout_floor() {
        let mut t = TimeoutConfig::default();
        t.stat = Duration::from_millis(10);
        assert_eq!(t.effective_stat(), Duration::from_millis(100));
        t.stat = Duration::from_millis(300);
        assert_eq!(t.effective_stat(), Duration::from_millis(300));
    }
}
