//! Verified ingestion of server advertisements
//!
//! A server becomes routable by POSTing a signed advertisement. The
//! director trusts the federation registry to vouch for the server: the
//! bearer token must verify against the JWKS the registry publishes for
//! the server's prefix, and the prefix itself must be approved.
//!
//! Verification failures are never silently dropped; the 403 message
//! names which of {token-issuer-mismatch, scope-missing,
//! signature-invalid, key-not-found} applied so operators can debug
//! registrations from the server side.

use dashmap::DashMap;
use http::StatusCode;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use perch_core::{OriginAdvertiseV1, OriginAdvertiseV2, ServerAd, ServerKind, TokenScope};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lifetime of a cached JWKS document
const JWKS_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Lifetime of a cached namespace-approval verdict
const APPROVAL_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Signature algorithms accepted on advertisement tokens
const ALGORITHM_WHITELIST: &[Algorithm] = &[Algorithm::ES256, Algorithm::RS256];

/// Audience required on advertisement tokens
const ADVERTISE_AUDIENCE: &str = "director";

/// A rejected registration: HTTP status plus operator-readable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Status to answer with
    pub status: StatusCode,
    /// Explanation included in the response body
    pub message: String,
}

impl Rejection {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn forbidden(kind: &str, detail: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            format!("Authorization token verification failed: {kind}: {detail}"),
        )
    }
}

#[derive(Debug, Deserialize)]
struct AdvertiseClaims {
    #[serde(default)]
    iss: String,
    #[serde(default)]
    sub: String,
    #[serde(default)]
    scope: String,
}

#[derive(Debug, serde::Serialize)]
struct CheckNamespaceStatusReq<'a> {
    prefix: &'a str,
}

#[derive(Debug, Deserialize)]
struct CheckNamespaceStatusRes {
    #[serde(default)]
    approved: bool,
}

/// Verifies and normalizes incoming advertisements
pub struct Ingestor {
    registry_url: String,
    http: reqwest::Client,
    jwks_cache: DashMap<String, (JwkSet, Instant)>,
    approval_cache: DashMap<String, (bool, Instant)>,
    allowed_cache_prefixes: HashMap<String, Vec<String>>,
    minimum_version: semver::Version,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("registry_url", &self.registry_url)
            .field("cached_jwks", &self.jwks_cache.len())
            .finish()
    }
}

impl Ingestor {
    /// Create an ingestor trusting the given registry
    pub fn new(
        registry_url: impl Into<String>,
        allowed_cache_prefixes: HashMap<String, Vec<String>>,
        minimum_version: semver::Version,
    ) -> Self {
        Self {
            registry_url: registry_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            jwks_cache: DashMap::new(),
            approval_cache: DashMap::new(),
            allowed_cache_prefixes,
            minimum_version,
        }
    }

    /// Verify one registration request and produce the normalized ad.
    ///
    /// `kind` comes from the endpoint (registerOrigin vs registerCache).
    pub async fn ingest(
        &self,
        kind: ServerKind,
        authorization: Option<&str>,
        user_agent: Option<&str>,
        body: &[u8],
    ) -> Result<ServerAd, Rejection> {
        let mut ad = decode_body(kind, body)?;

        if ad.name.is_empty() {
            return Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                "advertisement carries no server name",
            ));
        }

        self.apply_version_policy(&mut ad, kind, user_agent)?;

        let token = authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or_else(|| {
                Rejection::new(StatusCode::FORBIDDEN, "missing bearer token")
            })?;

        let jwks = self.fetch_jwks(&ad.registry_prefix).await?;
        self.verify_token(token, &jwks, &ad.registry_prefix)?;

        if !self.check_approval(&ad.registry_prefix).await? {
            return Err(Rejection::new(
                StatusCode::FORBIDDEN,
                format!(
                    "the registry has not approved the prefix {}",
                    ad.registry_prefix
                ),
            ));
        }

        if kind == ServerKind::Cache {
            self.intersect_cache_namespaces(&mut ad)?;
        }

        Ok(ad)
    }

    /// Version policy: an absent version falls back to the User-Agent;
    /// below the federation minimum the ad is rejected, a role mismatch
    /// only logs.
    fn apply_version_policy(
        &self,
        ad: &mut ServerAd,
        kind: ServerKind,
        user_agent: Option<&str>,
    ) -> Result<(), Rejection> {
        if ad.version.is_empty() {
            if let Some((role, version)) = parse_user_agent(user_agent.unwrap_or_default()) {
                if role != kind.to_string() {
                    warn!(
                        server = %ad.name,
                        advertised = %role,
                        endpoint = %kind,
                        "user-agent role does not match the registration endpoint"
                    );
                }
                ad.version = version;
            }
        }
        if ad.version.is_empty() {
            return Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                "cannot determine server version from advertisement or User-Agent",
            ));
        }
        match semver::Version::parse(&ad.version) {
            Ok(v) if v < self.minimum_version => Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                format!(
                    "server version {} is below the minimum supported version {}",
                    v, self.minimum_version
                ),
            )),
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(server = %ad.name, version = %ad.version, "unparseable server version");
                Ok(())
            }
        }
    }

    fn verify_token(
        &self,
        token: &str,
        jwks: &JwkSet,
        prefix: &str,
    ) -> Result<(), Rejection> {
        let header = decode_header(token)
            .map_err(|e| Rejection::forbidden("signature-invalid", e))?;

        if !ALGORITHM_WHITELIST.contains(&header.alg) {
            return Err(Rejection::forbidden(
                "signature-invalid",
                format!("algorithm {:?} not permitted", header.alg),
            ));
        }

        let jwk = match &header.kid {
            Some(kid) => jwks
                .keys
                .iter()
                .find(|k| k.common.key_id.as_deref() == Some(kid)),
            None => jwks.keys.first(),
        }
        .ok_or_else(|| {
            Rejection::forbidden(
                "key-not-found",
                format!(
                    "no key {} in the registry JWKS for {prefix}",
                    header.kid.as_deref().unwrap_or("(unnamed)")
                ),
            )
        })?;

        let key = DecodingKey::from_jwk(jwk)
            .map_err(|e| Rejection::forbidden("key-not-found", e))?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[ADVERTISE_AUDIENCE]);
        let data = decode::<AdvertiseClaims>(token, &key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::InvalidSignature => Rejection::forbidden("signature-invalid", e),
                ErrorKind::InvalidAudience => {
                    Rejection::forbidden("token-issuer-mismatch", "audience is not director")
                }
                _ => Rejection::forbidden("signature-invalid", e),
            }
        })?;
        let claims = data.claims;

        // The token must come from the registry's issuer space for this
        // prefix; anything else is a confused (or hostile) deputy.
        if !claims.iss.starts_with(&self.registry_url) {
            return Err(Rejection::forbidden(
                "token-issuer-mismatch",
                format!("issuer {} is not under {}", claims.iss, self.registry_url),
            ));
        }

        let has_scope = claims
            .scope
            .split_whitespace()
            .any(|s| s == TokenScope::Advertise.as_str());
        if !has_scope {
            return Err(Rejection::forbidden(
                "scope-missing",
                format!("token for {} lacks {}", claims.sub, TokenScope::Advertise),
            ));
        }

        Ok(())
    }

    async fn fetch_jwks(&self, prefix: &str) -> Result<JwkSet, Rejection> {
        if let Some(entry) = self.jwks_cache.get(prefix) {
            if entry.1.elapsed() < JWKS_CACHE_TTL {
                return Ok(entry.0.clone());
            }
        }

        let url = format!(
            "{}/api/v1.0/registry{}/.well-known/issuer.jwks",
            self.registry_url, prefix
        );
        let resp = self.http.get(&url).send().await.map_err(|e| {
            Rejection::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("cannot reach registry for JWKS: {e}"),
            )
        })?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Rejection::new(
                StatusCode::NOT_FOUND,
                format!("registry prefix {prefix} is not registered"),
            ));
        }
        if !resp.status().is_success() {
            return Err(Rejection::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("registry JWKS fetch returned {}", resp.status()),
            ));
        }
        let jwks: JwkSet = resp.json().await.map_err(|e| {
            Rejection::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("malformed JWKS from registry: {e}"),
            )
        })?;
        self.jwks_cache
            .insert(prefix.to_string(), (jwks.clone(), Instant::now()));
        debug!(prefix = %prefix, keys = jwks.keys.len(), "registry JWKS cached");
        Ok(jwks)
    }

    async fn check_approval(&self, prefix: &str) -> Result<bool, Rejection> {
        if let Some(entry) = self.approval_cache.get(prefix) {
            if entry.1.elapsed() < APPROVAL_CACHE_TTL {
                return Ok(entry.0);
            }
        }

        let url = format!("{}/api/v1.0/registry/checkNamespaceStatus", self.registry_url);
        let resp = self
            .http
            .post(&url)
            .json(&CheckNamespaceStatusReq { prefix })
            .send()
            .await
            .map_err(|e| {
                Rejection::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("cannot reach registry for namespace status: {e}"),
                )
            })?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Rejection::new(
                StatusCode::NOT_FOUND,
                format!("registry prefix {prefix} is not registered"),
            ));
        }
        if !resp.status().is_success() {
            return Err(Rejection::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("registry namespace status returned {}", resp.status()),
            ));
        }
        let verdict: CheckNamespaceStatusRes = resp.json().await.map_err(|e| {
            Rejection::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("malformed namespace status from registry: {e}"),
            )
        })?;
        self.approval_cache
            .insert(prefix.to_string(), (verdict.approved, Instant::now()));
        Ok(verdict.approved)
    }

    /// Caches may only export namespaces the admin allow-list grants
    /// them. A cache with no allow-list entry may export anything.
    fn intersect_cache_namespaces(&self, ad: &mut ServerAd) -> Result<(), Rejection> {
        let allowed = match self.allowed_cache_prefixes.get(&ad.name) {
            Some(prefixes) => prefixes,
            None => return Ok(()),
        };
        let before = ad.namespaces.len();
        ad.namespaces.retain(|ns| {
            allowed
                .iter()
                .any(|prefix| perch_ads::path_has_prefix(&ns.path, prefix))
        });
        let dropped = before - ad.namespaces.len();
        if dropped > 0 {
            info!(
                cache = %ad.name,
                dropped = dropped,
                "namespaces outside the cache allow-list were dropped"
            );
        }
        if before > 0 && ad.namespaces.is_empty() {
            return Err(Rejection::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!(
                    "cache {} claims no namespace the federation allows it to serve",
                    ad.name
                ),
            ));
        }
        Ok(())
    }

    /// Drop all caches (test support)
    pub fn reset(&self) {
        self.jwks_cache.clear();
        self.approval_cache.clear();
    }
}

/// Decode the body, preferring the V2 shape and falling back to V1
fn decode_body(kind: ServerKind, body: &[u8]) -> Result<ServerAd, Rejection> {
    if let Ok(v2) = serde_json::from_slice::<OriginAdvertiseV2>(body) {
        if !v2.data_url.is_empty() {
            return Ok(v2.into_server_ad(kind));
        }
    }
    match serde_json::from_slice::<OriginAdvertiseV1>(body) {
        Ok(v1) if !v1.url.is_empty() => Ok(v1.into_v2().into_server_ad(kind)),
        _ => Err(Rejection::new(
            StatusCode::BAD_REQUEST,
            "body is neither a V1 nor a V2 advertisement",
        )),
    }
}

/// Parse `pelican-<role>/<semver>` out of a User-Agent header
fn parse_user_agent(user_agent: &str) -> Option<(String, String)> {
    let rest = user_agent.strip_prefix("pelican-")?;
    let (role, version) = rest.split_once('/')?;
    if role.is_empty() || version.is_empty() {
        return None;
    }
    Some((role.to_string(), version.to_string()))
}
