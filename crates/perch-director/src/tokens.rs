//! Tokens minted and verified by the director itself
//!
//! The director issues short-lived credentials for its own health
//! probes and accepts local-issuer tokens on the service-discovery
//! endpoint. Server advertisement tokens are a different trust path and
//! are verified against the registry's JWKS in [`crate::ingest`].

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use perch_core::{Error, Result, TokenScope};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lifetime of a probe credential
const PROBE_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

/// Claims carried by director-issued tokens
#[derive(Debug, Serialize, Deserialize)]
pub struct DirectorClaims {
    /// Issuer (the director's external URL)
    pub iss: String,
    /// Subject
    pub sub: String,
    /// Audience
    pub aud: String,
    /// Expiration (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Space-separated scopes
    pub scope: String,
}

/// Mints and verifies the director's own HS256 tokens
pub struct DirectorTokens {
    issuer: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for DirectorTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorTokens")
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl DirectorTokens {
    /// Create a signer with a process-local random secret
    pub fn new(issuer: impl Into<String>) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::with_secret(issuer, &secret)
    }

    /// Create a signer with an explicit secret (shared across replicas)
    pub fn with_secret(issuer: impl Into<String>, secret: &[u8]) -> Self {
        Self {
            issuer: issuer.into(),
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Mint a short-lived token for a health probe against `audience`
    pub fn mint_probe_token(&self, audience: &str, object_path: &str) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Internal(format!("clock before epoch: {e}")))?;
        let claims = DirectorClaims {
            iss: self.issuer.clone(),
            sub: "director".to_string(),
            aud: audience.to_string(),
            exp: (now + PROBE_TOKEN_LIFETIME).as_secs(),
            iat: now.as_secs(),
            scope: TokenScope::StorageRead.with_path(object_path),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("cannot sign probe token: {e}")))
    }

    /// Verify a local-issuer token and require a scope on it
    pub fn verify_scoped(&self, token: &str, required: TokenScope) -> Result<DirectorClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        let data = decode::<DirectorClaims>(token, &self.decoding, &validation)
            .map_err(|e| Error::Forbidden(format!("token verification failed: {e}")))?;
        let claims = data.claims;
        let has_scope = claims
            .scope
            .split_whitespace()
            .any(|s| s == required.as_str() || s.starts_with(&format!("{}:", required.as_str())));
        if !has_scope {
            return Err(Error::Forbidden(format!(
                "scope-missing: token lacks {required}"
            )));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_token_round_trip() {
        let tokens = DirectorTokens::new("https://director.test");
        let token = tokens
            .mint_probe_token("https://origin.test", "/pelican/monitoring")
            .unwrap();
        let claims = tokens
            .verify_scoped(&token, TokenScope::StorageRead)
            .unwrap();
        assert_eq!(claims.sub, "director");
        assert_eq!(claims.aud, "https://origin.test");
        assert!(claims.scope.starts_with("storage.read:"));
    }

    #[test]
    fn test_scope_enforced() {
        let tokens = DirectorTokens::new("https://director.test");
        let token = tokens
            .mint_probe_token("https://origin.test", "/pelican/monitoring")
            .unwrap();
        let err = tokens
            .verify_scoped(&token, TokenScope::DirectorServiceDiscovery)
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let minter = DirectorTokens::with_secret("https://director.test", b"secret-a");
        let verifier = DirectorTokens::with_secret("https://director.test", b"secret-b");
        let token = minter
            .mint_probe_token("https://origin.test", "/pelican/monitoring")
            .unwrap();
        assert!(verifier
            .verify_scoped(&token, TokenScope::StorageRead)
            .is_err());
    }
}
