//! # Perch Geo
//!
//! Maps server hostnames and client IPs to coordinates for the
//! director's distance-aware sorting.
//!
//! Resolution is DNS first (IPv4 preferred), then a GeoIP city lookup.
//! Failure is never fatal: a host that cannot be located gets the null
//! coordinate, which every distance ordering sorts last.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Latitude/longitude pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Coordinate {
    /// Degrees north
    pub lat: f64,
    /// Degrees east
    pub lon: f64,
}

impl Coordinate {
    /// The null coordinate assigned when resolution fails
    pub const NULL: Coordinate = Coordinate { lat: 0.0, lon: 0.0 };

    /// Whether this is the null coordinate
    pub fn is_null(&self) -> bool {
        self.lat == 0.0 && self.lon == 0.0
    }

    /// Great-circle distance to another coordinate, in kilometers
    pub fn haversine_km(&self, other: &Coordinate) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Why a lookup failed; used as the label on the failure counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum GeoFailure {
    /// DNS returned no usable address
    #[error("DNS resolution failed")]
    DnsResolution,
    /// No GeoIP database is loaded
    #[error("no GeoIP database available")]
    DatabaseMissing,
    /// The database has no entry (or a null entry) for the address
    #[error("address not found in GeoIP database")]
    NotFound,
}

impl GeoFailure {
    fn label(&self) -> &'static str {
        match self {
            Self::DnsResolution => "dns_resolution",
            Self::DatabaseMissing => "database_missing",
            Self::NotFound => "not_found",
        }
    }
}

/// A coordinate override for an address range; lets operators place
/// private-range clients without a database entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoOverride {
    /// CIDR, e.g. `192.168.0.0/16`
    pub cidr: String,
    /// Coordinate assigned to the range
    pub coordinate: Coordinate,
}

#[derive(Debug, Clone, Copy)]
struct CachedCoord {
    coord: Coordinate,
    resolved_at: Instant,
}

/// Hostname/IP to coordinate resolver with a per-host TTL cache
pub struct GeoResolver {
    resolver: TokioAsyncResolver,
    db: Option<maxminddb::Reader<Vec<u8>>>,
    overrides: Vec<(Cidr, Coordinate)>,
    cache: Arc<DashMap<String, CachedCoord>>,
    cache_ttl: Duration,
    failures: DashMap<&'static str, AtomicU64>,
}

impl std::fmt::Debug for GeoResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoResolver")
            .field("has_db", &self.db.is_some())
            .field("overrides", &self.overrides.len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl GeoResolver {
    /// Create a resolver; a missing or unreadable database is tolerated
    /// (every lookup will fail non-fatally until one is provided).
    pub fn new(db_path: Option<&Path>, overrides: &[GeoOverride], cache_ttl: Duration) -> Self {
        let db = db_path.and_then(|p| match maxminddb::Reader::open_readfile(p) {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!(path = %p.display(), error = %e, "cannot open GeoIP database");
                None
            }
        });
        let overrides = overrides
            .iter()
            .filter_map(|o| match Cidr::parse(&o.cidr) {
                Some(cidr) => Some((cidr, o.coordinate)),
                None => {
                    warn!(cidr = %o.cidr, "ignoring unparseable geo override");
                    None
                }
            })
            .collect();
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            db,
            overrides,
            cache: Arc::new(DashMap::new()),
            cache_ttl,
            failures: DashMap::new(),
        }
    }

    /// Resolve a hostname to a coordinate.
    ///
    /// Returns the coordinate plus the failure, if any; callers publish
    /// the ad either way.
    pub async fn resolve(&self, host: &str) -> (Coordinate, Option<GeoFailure>) {
        if let Some(cached) = self.cache.get(host) {
            if cached.resolved_at.elapsed() < self.cache_ttl {
                return (cached.coord, None);
            }
        }

        let (coord, failure) = self.resolve_uncached(host).await;
        if failure.is_none() {
            self.cache.insert(
                host.to_string(),
                CachedCoord {
                    coord,
                    resolved_at: Instant::now(),
                },
            );
        } else if let Some(f) = failure {
            self.count_failure(f);
        }
        (coord, failure)
    }

    /// Resolve an already-known IP address (client addresses)
    pub fn resolve_ip(&self, ip: IpAddr) -> (Coordinate, Option<GeoFailure>) {
        for (cidr, coord) in &self.overrides {
            if cidr.contains(ip) {
                return (*coord, None);
            }
        }
        let result = self.lookup_db(ip);
        if let (_, Some(f)) = result {
            self.count_failure(f);
        }
        result
    }

    /// Per-label failure counts since process start
    pub fn failure_counts(&self) -> Vec<(&'static str, u64)> {
        self.failures
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect()
    }

    async fn resolve_uncached(&self, host: &str) -> (Coordinate, Option<GeoFailure>) {
        // A literal IP skips DNS entirely.
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.lookup_with_overrides(ip);
        }

        let ips = match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().collect::<Vec<_>>(),
            Err(e) => {
                debug!(host = %host, error = %e, "DNS lookup failed");
                return (Coordinate::NULL, Some(GeoFailure::DnsResolution));
            }
        };
        let ip = ips
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| ips.first())
            .copied();
        match ip {
            Some(ip) => self.lookup_with_overrides(ip),
            None => (Coordinate::NULL, Some(GeoFailure::DnsResolution)),
        }
    }

    fn lookup_with_overrides(&self, ip: IpAddr) -> (Coordinate, Option<GeoFailure>) {
        for (cidr, coord) in &self.overrides {
            if cidr.contains(ip) {
                return (*coord, None);
            }
        }
        self.lookup_db(ip)
    }

    fn lookup_db(&self, ip: IpAddr) -> (Coordinate, Option<GeoFailure>) {
        let db = match &self.db {
            Some(db) => db,
            None => return (Coordinate::NULL, Some(GeoFailure::DatabaseMissing)),
        };
        match db.lookup::<maxminddb::geoip2::City<'_>>(ip) {
            Ok(city) => {
                let loc = city.location.as_ref();
                let lat = loc.and_then(|l| l.latitude);
                let lon = loc.and_then(|l| l.longitude);
                match (lat, lon) {
                    (Some(lat), Some(lon)) => {
                        let coord = Coordinate { lat, lon };
                        if coord.is_null() {
                            (Coordinate::NULL, Some(GeoFailure::NotFound))
                        } else {
                            (coord, None)
                        }
                    }
                    _ => (Coordinate::NULL, Some(GeoFailure::NotFound)),
                }
            }
            Err(e) => {
                debug!(ip = %ip, error = %e, "GeoIP lookup failed");
                (Coordinate::NULL, Some(GeoFailure::NotFound))
            }
        }
    }

    fn count_failure(&self, failure: GeoFailure) {
        self.failures
            .entry(failure.label())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Minimal CIDR matcher for override ranges
#[derive(Debug, Clone, Copy)]
struct Cidr {
    net: IpAddr,
    prefix: u8,
}

impl Cidr {
    fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let net: IpAddr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        let max = match net {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return None;
        }
        Some(Self { net, prefix })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.net, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_coordinate() {
        assert!(Coordinate::NULL.is_null());
        assert!(!Coordinate { lat: 43.0, lon: -89.4 }.is_null());
    }

    #[test]
    fn test_haversine_known_distance() {
        // Madison, WI to Chicago, IL: roughly 196 km
        let madison = Coordinate { lat: 43.0731, lon: -89.4012 };
        let chicago = Coordinate { lat: 41.8781, lon: -87.6298 };
        let d = madison.haversine_km(&chicago);
        assert!((d - 196.0).abs() < 10.0, "got {d}");
    }

    #[test]
    fn test_haversine_zero_for_same_point() {
        let p = Coordinate { lat: 10.0, lon: 20.0 };
        assert!(p.haversine_km(&p) < 1e-9);
    }

    #[test]
    fn test_cidr_contains_v4() {
        let cidr = Cidr::parse("10.0.0.0/8").unwrap();
        assert!(cidr.contains("10.1.2.3".parse().unwrap()));
        assert!(!cidr.contains("11.0.0.1".parse().unwrap()));

        let narrow = Cidr::parse("192.168.1.0/24").unwrap();
        assert!(narrow.contains("192.168.1.200".parse().unwrap()));
        assert!(!narrow.contains("192.168.2.1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_parse_errors() {
        assert!(Cidr::parse("not-a-cidr").is_none());
        assert!(Cidr::parse("10.0.0.0/33").is_none());
        assert!(Cidr::parse("10.0.0.0").is_none());
    }

    #[tokio::test]
    async fn test_override_applies_without_database() {
        let resolver = GeoResolver::new(
            None,
            &[GeoOverride {
                cidr: "192.168.0.0/16".to_string(),
                coordinate: Coordinate { lat: 43.0, lon: -89.4 },
            }],
            Duration::from_secs(60),
        );
        let (coord, failure) = resolver.resolve_ip("192.168.5.5".parse().unwrap());
        assert!(failure.is_none());
        assert_eq!(coord.lat, 43.0);

        // Outside the override with no database: null, labeled failure
        let (coord, failure) = resolver.resolve_ip("1.1.1.1".parse().unwrap());
        assert!(coord.is_null());
        assert_eq!(failure, Some(GeoFailure::DatabaseMissing));
        let counts = resolver.failure_counts();
        assert_eq!(counts, vec![("database_missing", 1)]);
    }
}
