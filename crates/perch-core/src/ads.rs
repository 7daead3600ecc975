//! Server and namespace advertisement model
//!
//! The wire formats (`OriginAdvertiseV1`, `OriginAdvertiseV2`) are what
//! servers POST to the director; [`ServerAd`] is the normalized internal
//! record the director stores and routes against.

use crate::downtime::Downtime;
use crate::types::{Capabilities, ServerKind, StorageKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Token issuer trusted for a namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenIssuer {
    /// Issuer base URL
    pub issuer_url: String,

    /// Path prefixes the issuer may sign for
    #[serde(default)]
    pub base_paths: Vec<String>,
}

/// How a client should obtain a credential for a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenStrategy {
    /// OAuth2 device-code flow against the credential issuer
    #[serde(rename = "OAuth2")]
    OAuth2,
    /// Vault-brokered issuance
    #[serde(rename = "Vault")]
    Vault,
}

/// Credential-issuance rule attached to a namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGenRule {
    /// Acquisition strategy
    pub strategy: TokenStrategy,

    /// Maximum directory depth a requested scope may cover
    #[serde(default)]
    pub max_scope_depth: u32,

    /// Issuer to request the credential from
    pub credential_issuer: String,
}

/// A path prefix with capabilities and issuer policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceAd {
    /// Namespace path prefix
    pub path: String,

    /// Capabilities granted under this prefix
    #[serde(default)]
    pub capabilities: Capabilities,

    /// Trusted token issuers
    #[serde(default)]
    pub issuers: Vec<TokenIssuer>,

    /// Credential-issuance rules
    #[serde(default)]
    pub token_generation: Vec<TokenGenRule>,

    /// Imported from the legacy topology feed
    #[serde(default)]
    pub from_topology: bool,
}

impl NamespaceAd {
    /// Whether access to this namespace requires a token
    pub fn requires_token(&self) -> bool {
        !self.capabilities.public_reads
    }
}

/// Normalized advertisement record held by the director's ad store.
///
/// `data_url`, `name`, and `kind` are identity fields and never mutated
/// after insert; a refresh replaces the whole record atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAd {
    /// Human-readable server name (unique per federation)
    pub name: String,

    /// Registry prefix vouching for this server, e.g. `/origins/my-origin`
    pub registry_prefix: String,

    /// Origin or cache
    pub kind: ServerKind,

    /// Endpoint serving object bytes
    pub data_url: String,

    /// Endpoint serving the server's web API
    pub web_url: String,

    /// Connection broker, when the server sits behind one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_url: Option<String>,

    /// Issuer endpoint for server-local tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,

    /// Storage backend kind
    #[serde(default)]
    pub storage_kind: StorageKind,

    /// Server-wide capabilities
    #[serde(default)]
    pub capabilities: Capabilities,

    /// Namespaces exported by this server
    #[serde(default)]
    pub namespaces: Vec<NamespaceAd>,

    /// Downtime windows declared in the advertisement
    #[serde(default)]
    pub downtimes: Vec<Downtime>,

    /// Server asked not to be health-probed
    #[serde(default)]
    pub disable_health_probe: bool,

    /// Sourced from the legacy topology feed rather than a live server
    #[serde(default)]
    pub from_topology: bool,

    /// Advertised software version
    #[serde(default)]
    pub version: String,

    /// Explicit expiration; `None` falls back to the director's ad TTL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,

    /// Exponentially weighted moving average of the server's I/O load
    #[serde(default)]
    pub ewma_load: f64,

    /// Geo coordinate, filled in at ingest; 0.0/0.0 when lookup failed
    #[serde(default)]
    pub latitude: f64,
    /// See `latitude`
    #[serde(default)]
    pub longitude: f64,
}

impl ServerAd {
    /// Store key: the data URL string
    pub fn url_key(&self) -> &str {
        &self.data_url
    }

    /// Hostname of the data endpoint, for geo resolution
    pub fn data_host(&self) -> Option<String> {
        Url::parse(&self.data_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }

    /// Non-POSIX backends implicitly disable health probing
    pub fn probe_enabled(&self) -> bool {
        !self.disable_health_probe && !self.from_topology && self.storage_kind.supports_health_probe()
    }

    /// Whether any declared downtime window covers `now`
    pub fn in_downtime(&self, now: DateTime<Utc>) -> bool {
        crate::downtime::any_active(&self.downtimes, now)
    }
}

/// Legacy (V1) advertisement body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginAdvertiseV1 {
    /// Server name
    pub name: String,

    /// Single URL serving both data and web API
    pub url: String,

    /// Web API endpoint, when distinct from `url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,

    /// Exported namespaces
    #[serde(default)]
    pub namespaces: Vec<NamespaceAdV1>,

    /// Objects may be written
    #[serde(default)]
    pub enable_write: bool,

    /// Objects may be read without a token
    #[serde(default)]
    pub enable_fallback_read: bool,
}

/// Legacy (V1) namespace entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceAdV1 {
    /// Namespace path prefix
    pub path: String,

    /// Single trusted issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    /// Reads require a token
    #[serde(default)]
    pub require_token: bool,
}

/// Current (V2) advertisement body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginAdvertiseV2 {
    /// Server name
    #[serde(default)]
    pub name: String,

    /// Registry prefix; derived from name and role when absent
    #[serde(default)]
    pub registry_prefix: String,

    /// Endpoint serving object bytes
    pub data_url: String,

    /// Endpoint serving the server's web API
    #[serde(default)]
    pub web_url: String,

    /// Connection broker URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_url: Option<String>,

    /// Issuer endpoint for server-local tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,

    /// Storage backend kind
    #[serde(default)]
    pub storage_type: StorageKind,

    /// Server-wide capabilities
    #[serde(default)]
    pub caps: Capabilities,

    /// Exported namespaces
    #[serde(default)]
    pub namespaces: Vec<NamespaceAd>,

    /// Declared downtime windows
    #[serde(default)]
    pub downtimes: Vec<Downtime>,

    /// Server asked not to be health-probed
    #[serde(default)]
    pub disable_director_test: bool,

    /// Advertised software version
    #[serde(default)]
    pub version: String,
}

impl OriginAdvertiseV2 {
    /// Normalize into the internal record.
    ///
    /// `kind` comes from the ingestion endpoint (registerOrigin vs
    /// registerCache), never from the body.
    pub fn into_server_ad(self, kind: ServerKind) -> ServerAd {
        let registry_prefix = if self.registry_prefix.is_empty() {
            format!("/{}/{}", kind.registry_segment(), self.name)
        } else {
            self.registry_prefix
        };
        let web_url = if self.web_url.is_empty() {
            self.data_url.clone()
        } else {
            self.web_url
        };
        ServerAd {
            name: self.name,
            registry_prefix,
            kind,
            data_url: self.data_url,
            web_url,
            broker_url: self.broker_url,
            auth_url: self.auth_url,
            storage_kind: self.storage_type,
            capabilities: self.caps,
            namespaces: self.namespaces,
            downtimes: self.downtimes,
            disable_health_probe: self.disable_director_test,
            from_topology: false,
            version: self.version,
            expiration: None,
            ewma_load: 0.0,
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

impl OriginAdvertiseV1 {
    /// Upgrade the legacy body to the V2 shape before normalizing
    pub fn into_v2(self) -> OriginAdvertiseV2 {
        let caps = Capabilities {
            public_reads: self.enable_fallback_read,
            reads: true,
            writes: self.enable_write,
            listings: false,
            direct_reads: false,
        };
        let namespaces = self
            .namespaces
            .into_iter()
            .map(|ns| NamespaceAd {
                path: ns.path,
                capabilities: Capabilities {
                    public_reads: !ns.require_token,
                    reads: true,
                    writes: caps.writes,
                    listings: false,
                    direct_reads: false,
                },
                issuers: ns
                    .issuer
                    .into_iter()
                    .map(|iss| TokenIssuer {
                        issuer_url: iss,
                        base_paths: Vec::new(),
                    })
                    .collect(),
                token_generation: Vec::new(),
                from_topology: false,
            })
            .collect();
        OriginAdvertiseV2 {
            name: self.name,
            registry_prefix: String::new(),
            data_url: self.url.clone(),
            web_url: self.web_url.unwrap_or(self.url),
            broker_url: None,
            auth_url: None,
            storage_type: StorageKind::Posix,
            caps,
            namespaces,
            downtimes: Vec::new(),
            disable_director_test: false,
            version: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v2_ad() -> OriginAdvertiseV2 {
        serde_json::from_value(serde_json::json!({
            "name": "test-origin",
            "dataUrl": "https://or-url.org",
            "webUrl": "https://or-url.org:8443",
            "caps": {"publicReads": true, "reads": true},
            "namespaces": [{
                "path": "/foo/bar",
                "capabilities": {"publicReads": true, "reads": true},
                "issuers": [{"issuerUrl": "https://issuer.org", "basePaths": ["/foo"]}]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_v2_normalization() {
        let ad = v2_ad().into_server_ad(ServerKind::Origin);
        assert_eq!(ad.name, "test-origin");
        assert_eq!(ad.registry_prefix, "/origins/test-origin");
        assert_eq!(ad.data_url, "https://or-url.org");
        assert_eq!(ad.kind, ServerKind::Origin);
        assert!(!ad.from_topology);
        assert_eq!(ad.namespaces.len(), 1);
        assert_eq!(ad.namespaces[0].path, "/foo/bar");
    }

    #[test]
    fn test_v1_upgrade() {
        let v1 = OriginAdvertiseV1 {
            name: "legacy".to_string(),
            url: "https://legacy.org".to_string(),
            web_url: None,
            namespaces: vec![NamespaceAdV1 {
                path: "/old/ns".to_string(),
                issuer: Some("https://issuer.org".to_string()),
                require_token: true,
            }],
            enable_write: false,
            enable_fallback_read: false,
        };
        let ad = v1.into_v2().into_server_ad(ServerKind::Origin);
        assert_eq!(ad.web_url, "https://legacy.org");
        assert_eq!(ad.namespaces[0].issuers[0].issuer_url, "https://issuer.org");
        assert!(ad.namespaces[0].requires_token());
    }

    #[test]
    fn test_probe_enabled() {
        let mut ad = v2_ad().into_server_ad(ServerKind::Origin);
        assert!(ad.probe_enabled());
        ad.storage_kind = StorageKind::S3;
        assert!(!ad.probe_enabled());
        ad.storage_kind = StorageKind::Posix;
        ad.from_topology = true;
        assert!(!ad.probe_enabled());
    }

    #[test]
    fn test_data_host() {
        let ad = v2_ad().into_server_ad(ServerKind::Origin);
        assert_eq!(ad.data_host().as_deref(), Some("or-url.org"));
    }

    #[test]
    fn test_requires_token() {
        let ns = NamespaceAd {
            path: "/sec".to_string(),
            capabilities: Capabilities {
                reads: true,
                ..Default::default()
            },
            issuers: vec![],
            token_generation: vec![],
            from_topology: false,
        };
        assert!(ns.requires_token());
    }
}
