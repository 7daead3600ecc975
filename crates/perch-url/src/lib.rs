//! # Perch URL
//!
//! Parsing of federation-qualified object URLs.
//!
//! A federation URL names an object inside a federation:
//! `pelican://<discovery-host>/<namespace>/<object>[?<options>]`. The
//! legacy `osdf://` scheme is an alias that resolves through the OSDF
//! discovery host, and schemeless paths are accepted when the caller
//! supplies a discovery endpoint out of band.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod options;

use options::{PackMode, QueryOptions};
use perch_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

/// Discovery host backing the legacy `osdf://` scheme
pub const OSDF_DISCOVERY_HOST: &str = "osg-htc.org";

/// Federation service endpoints learned from the discovery document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FederationInfo {
    /// The discovery URL this metadata was fetched from
    #[serde(default)]
    pub discovery_endpoint: String,

    /// The federation's director
    #[serde(default, rename = "director_endpoint")]
    pub director_endpoint: String,

    /// The federation's namespace registry
    #[serde(default, rename = "namespace_registration_endpoint")]
    pub registry_endpoint: String,

    /// Connection broker, if the federation runs one
    #[serde(default, rename = "broker_endpoint")]
    pub broker_endpoint: String,

    /// JWKS document for the federation issuer
    #[serde(default)]
    pub jwks_uri: String,
}

impl FederationInfo {
    /// Fill in any empty field from `discovered`, keeping configured
    /// values where they exist. Merging is field-by-field so operators
    /// can pin a single endpoint without overriding the whole document.
    pub fn merge_missing(&mut self, discovered: &FederationInfo) {
        if self.discovery_endpoint.is_empty() {
            self.discovery_endpoint = discovered.discovery_endpoint.clone();
        }
        if self.director_endpoint.is_empty() {
            self.director_endpoint = discovered.director_endpoint.clone();
        }
        if self.registry_endpoint.is_empty() {
            self.registry_endpoint = discovered.registry_endpoint.clone();
        }
        if self.broker_endpoint.is_empty() {
            self.broker_endpoint = discovered.broker_endpoint.clone();
        }
        if self.jwks_uri.is_empty() {
            self.jwks_uri = discovered.jwks_uri.clone();
        }
    }
}

/// Parse behavior switches
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Log-and-keep unknown query keys instead of rejecting them, to
    /// stay forward compatible with newer directors
    pub tolerate_unknown_query: bool,
}

/// Out-of-band discovery configuration
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// Discovery URL to use for schemeless paths
    pub discovery_url: Option<String>,
}

/// A parsed federation URL plus any attached federation metadata
#[derive(Debug, Clone, PartialEq)]
pub struct PelicanUrl {
    /// Hostname of the federation discovery endpoint
    pub discovery_host: String,

    /// Canonical object path (always starts with `/`)
    pub path: String,

    /// Recognized query options
    pub options: QueryOptions,

    /// Raw query string as received, preserved for redirect targets
    pub raw_query: String,

    /// Federation metadata, once discovery has run
    pub fed_info: Option<FederationInfo>,
}

impl PelicanUrl {
    /// Parse a federation URL.
    ///
    /// Accepts `pelican://host/path`, `osdf://path` (the host component,
    /// if present, is part of the namespace path), and schemeless paths
    /// when `discovery` carries an endpoint.
    pub fn parse(raw: &str, opts: ParseOptions, discovery: &DiscoveryOptions) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::BadUrl("empty URL".to_string()));
        }

        if let Some(rest) = trimmed.strip_prefix("pelican://") {
            Self::parse_pelican(trimmed, rest, opts, discovery)
        } else if let Some(rest) = trimmed
            .strip_prefix("osdf://")
            .or_else(|| trimmed.strip_prefix("stash://"))
        {
            Self::parse_osdf(rest, opts)
        } else if trimmed.contains("://") {
            Err(Error::BadUrl(format!("unsupported scheme in {trimmed}")))
        } else {
            Self::parse_schemeless(trimmed, opts, discovery)
        }
    }

    fn parse_pelican(
        raw: &str,
        rest: &str,
        opts: ParseOptions,
        discovery: &DiscoveryOptions,
    ) -> Result<Self> {
        let parsed =
            Url::parse(raw).map_err(|e| Error::BadUrl(format!("cannot parse {raw}: {e}")))?;
        let host = parsed.host_str().unwrap_or("").to_string();
        if host.is_empty() {
            // pelican:///path is legal when discovery comes from options
            let discovery_url = discovery
                .discovery_url
                .as_deref()
                .ok_or_else(|| Error::NoDiscovery(raw.to_string()))?;
            let host = host_of(discovery_url)?;
            return Self::build(host, rest, opts);
        }
        let mut path_and_query = parsed.path().to_string();
        if let Some(q) = parsed.query() {
            path_and_query.push('?');
            path_and_query.push_str(q);
        }
        Self::build(host, &path_and_query, opts)
    }

    fn parse_osdf(rest: &str, opts: ParseOptions) -> Result<Self> {
        // The OSDF scheme has no discovery host; what parses as a host
        // is really the first component of the namespace path.
        Self::build(OSDF_DISCOVERY_HOST.to_string(), &format!("/{rest}"), opts)
    }

    fn parse_schemeless(
        raw: &str,
        opts: ParseOptions,
        discovery: &DiscoveryOptions,
    ) -> Result<Self> {
        let discovery_url = discovery
            .discovery_url
            .as_deref()
            .ok_or_else(|| Error::NoDiscovery(raw.to_string()))?;
        let host = host_of(discovery_url)?;
        Self::build(host, raw, opts)
    }

    fn build(discovery_host: String, path_and_query: &str, opts: ParseOptions) -> Result<Self> {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, q),
            None => (path_and_query, ""),
        };
        let path = clean_path(path);
        if path == "/" {
            return Err(Error::BadUrl("URL names no object path".to_string()));
        }
        let options = QueryOptions::parse(query, opts.tolerate_unknown_query)?;
        Ok(Self {
            discovery_host,
            path,
            options,
            raw_query: query.to_string(),
            fed_info: None,
        })
    }

    /// Discovery endpoint URL for this federation
    pub fn discovery_url(&self) -> String {
        format!("https://{}", self.discovery_host)
    }

    /// Pack mode requested by the `pack` query option, if any
    pub fn pack_mode(&self) -> Option<PackMode> {
        self.options.pack
    }
}

fn host_of(url: &str) -> Result<String> {
    let with_scheme = if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{url}")
    };
    let parsed = Url::parse(&with_scheme)
        .map_err(|e| Error::BadUrl(format!("cannot parse discovery URL {url}: {e}")))?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| Error::BadUrl(format!("discovery URL {url} has no host")))
}

/// Collapse duplicate slashes and strip a trailing slash (except root)
fn clean_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        out.push('/');
    }
    let mut prev_slash = out.ends_with('/');
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Warn-level note used when tolerating unknown query keys
pub(crate) fn note_unknown_query(key: &str) {
    warn!(key = %key, "ignoring unrecognized query option");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_discovery() -> DiscoveryOptions {
        DiscoveryOptions::default()
    }

    #[test]
    fn test_parse_pelican_url() {
        let u = PelicanUrl::parse(
            "pelican://fed.example.org/foo/bar/baz.txt",
            ParseOptions::default(),
            &no_discovery(),
        )
        .unwrap();
        assert_eq!(u.discovery_host, "fed.example.org");
        assert_eq!(u.path, "/foo/bar/baz.txt");
        assert!(u.fed_info.is_none());
    }

    #[test]
    fn test_parse_osdf_host_is_path() {
        let u = PelicanUrl::parse(
            "osdf://chtc/staging/file.root",
            ParseOptions::default(),
            &no_discovery(),
        )
        .unwrap();
        assert_eq!(u.discovery_host, OSDF_DISCOVERY_HOST);
        assert_eq!(u.path, "/chtc/staging/file.root");
    }

    #[test]
    fn test_parse_schemeless_requires_discovery() {
        let err =
            PelicanUrl::parse("/foo/bar", ParseOptions::default(), &no_discovery()).unwrap_err();
        assert!(matches!(err, Error::NoDiscovery(_)));

        let disc = DiscoveryOptions {
            discovery_url: Some("https://fed.example.org".to_string()),
        };
        let u = PelicanUrl::parse("/foo/bar", ParseOptions::default(), &disc).unwrap();
        assert_eq!(u.discovery_host, "fed.example.org");
        assert_eq!(u.path, "/foo/bar");
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = PelicanUrl::parse(
            "gopher://fed.example.org/foo",
            ParseOptions::default(),
            &no_discovery(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadUrl(_)));
    }

    #[test]
    fn test_query_options_attached() {
        let u = PelicanUrl::parse(
            "pelican://fed.example.org/foo/bar?directread&pack=auto",
            ParseOptions::default(),
            &no_discovery(),
        )
        .unwrap();
        assert!(u.options.direct_read);
        assert_eq!(u.pack_mode(), Some(PackMode::Auto));
        assert_eq!(u.raw_query, "directread&pack=auto");
    }

    #[test]
    fn test_mutually_exclusive_options() {
        let err = PelicanUrl::parse(
            "pelican://fed.example.org/foo/bar?directread&prefercached",
            ParseOptions::default(),
            &no_discovery(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadUrl(_)));
    }

    #[test]
    fn test_unknown_query_strict_vs_tolerant() {
        let err = PelicanUrl::parse(
            "pelican://fed.example.org/foo/bar?frobnicate=1",
            ParseOptions::default(),
            &no_discovery(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownQuery(_)));

        let u = PelicanUrl::parse(
            "pelican://fed.example.org/foo/bar?frobnicate=1",
            ParseOptions {
                tolerate_unknown_query: true,
            },
            &no_discovery(),
        )
        .unwrap();
        assert_eq!(u.path, "/foo/bar");
    }

    #[test]
    fn test_path_cleaning() {
        let u = PelicanUrl::parse(
            "pelican://fed.example.org//foo///bar/",
            ParseOptions::default(),
            &no_discovery(),
        )
        .unwrap();
        assert_eq!(u.path, "/foo/bar");
    }

    #[test]
    fn test_empty_path_rejected() {
        let err = PelicanUrl::parse(
            "pelican://fed.example.org/",
            ParseOptions::default(),
            &no_discovery(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadUrl(_)));
    }

    #[test]
    fn test_federation_info_merge() {
        let mut configured = FederationInfo {
            director_endpoint: "https://director.pinned.org".to_string(),
            ..Default::default()
        };
        let discovered = FederationInfo {
            discovery_endpoint: "https://fed.example.org".to_string(),
            director_endpoint: "https://director.example.org".to_string(),
            registry_endpoint: "https://registry.example.org".to_string(),
            broker_endpoint: String::new(),
            jwks_uri: "https://fed.example.org/.well-known/issuer.jwks".to_string(),
        };
        configured.merge_missing(&discovered);
        // Pinned value wins; the rest fill in
        assert_eq!(configured.director_endpoint, "https://director.pinned.org");
        assert_eq!(configured.registry_endpoint, "https://registry.example.org");
        assert_eq!(
            configured.jwks_uri,
            "https://fed.example.org/.well-known/issuer.jwks"
        );
    }
}
