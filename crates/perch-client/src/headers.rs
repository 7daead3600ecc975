//! Parsing of the director's sidecar headers
//!
//! The redirect carries its routing decisions in headers: `Link` lists
//! the prioritized servers, and the `X-Pelican-*` family describes the
//! namespace, required credentials, and issuance rules.

use tracing::debug;
use url::Url;

/// One `Link` entry with its priority
#[derive(Debug, Clone)]
struct ServerPriority {
    url: Url,
    priority: i32,
}

/// Parse a `Link` header into servers ordered by the `pri` attribute.
///
/// The director probably already sends entries in order, but nothing in
/// the Metalink RFC promises that, so the `pri` tag is authoritative.
pub fn parse_link_header(link: &str) -> Vec<Url> {
    let mut servers: Vec<ServerPriority> = Vec::new();
    for entry in link.split(',') {
        let mut endpoint = None;
        let mut priority = 0;
        for part in entry.split(';').map(str::trim) {
            if part.starts_with('<') && part.ends_with('>') {
                endpoint = Some(&part[1..part.len() - 1]);
            } else if let Some(value) = part.strip_prefix("pri=") {
                priority = value.parse().unwrap_or(0);
            }
        }
        let Some(endpoint) = endpoint else { continue };
        match Url::parse(endpoint) {
            Ok(url) => servers.push(ServerPriority { url, priority }),
            Err(e) => debug!(endpoint = %endpoint, error = %e, "unparseable Link endpoint"),
        }
    }
    servers.sort_by_key(|s| s.priority);
    servers.into_iter().map(|s| s.url).collect()
}

/// Parsed `X-Pelican-Namespace` header
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Namespace {
    /// Namespace path prefix
    pub path: String,
    /// Whether reads require a credential
    pub require_token: bool,
    /// Origin endpoint supporting collection listings
    pub collections_url: Option<String>,
}

impl Namespace {
    /// Parse `namespace=<path>; require-token=<bool>; collections-url=<url>`
    pub fn parse(value: &str) -> Self {
        let mut ns = Self::default();
        for part in value.split(';').map(str::trim) {
            if let Some(path) = part.strip_prefix("namespace=") {
                ns.path = path.to_string();
            } else if let Some(required) = part.strip_prefix("require-token=") {
                ns.require_token = required.eq_ignore_ascii_case("true");
            } else if let Some(url) = part.strip_prefix("collections-url=") {
                ns.collections_url = Some(url.to_string());
            }
        }
        ns
    }
}

/// Parsed `X-Pelican-Token-Generation` header
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenGeneration {
    /// Issuer to request credentials from
    pub issuer: String,
    /// Issuance strategy (`OAuth2`, `Vault`)
    pub strategy: String,
    /// Maximum directory depth a requested scope may cover
    pub max_scope_depth: u32,
}

impl TokenGeneration {
    /// Parse `issuer=<url>; strategy=<s>; max-scope-depth=<n>`
    pub fn parse(value: &str) -> Self {
        let mut gen = Self::default();
        for part in value.split(';').map(str::trim) {
            if let Some(issuer) = part.strip_prefix("issuer=") {
                gen.issuer = issuer.to_string();
            } else if let Some(strategy) = part.strip_prefix("strategy=") {
                gen.strategy = strategy.to_string();
            } else if let Some(depth) = part.strip_prefix("max-scope-depth=") {
                gen.max_scope_depth = depth.parse().unwrap_or(0);
            }
        }
        gen
    }
}
