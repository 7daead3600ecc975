//! Credential acquisition for authenticated namespaces
//!
//! The ladder, in order: an explicit token value, a token file, the
//! `BEARER_TOKEN` / `BEARER_TOKEN_FILE` environment, and finally an
//! OAuth2 device-code flow against the namespace's credential issuer.

use crate::director::DirectorResponse;
use perch_core::{Error, Result, TokenScope};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Client identifier presented during device-code flows
const DEVICE_CLIENT_ID: &str = "pelican-client";

/// Overall deadline for a device-code authorization
const DEVICE_FLOW_DEADLINE: Duration = Duration::from_secs(300);

/// Caller-supplied credential sources
#[derive(Debug, Clone, Default)]
pub struct TokenOptions {
    /// Token passed verbatim (e.g. `--token`)
    pub value: Option<String>,
    /// File holding the token (e.g. `--token-location`)
    pub location: Option<PathBuf>,
}

/// Derive the scope path for an object under its namespace, clamped to
/// the issuer's maximum scope depth.
pub fn scope_path(object_path: &str, namespace_path: &str, max_depth: u32) -> String {
    let rel = object_path
        .strip_prefix(namespace_path.trim_end_matches('/'))
        .unwrap_or(object_path);
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        return "/".to_string();
    }
    let components: Vec<&str> = rel.split('/').collect();
    let keep = if max_depth == 0 {
        components.len()
    } else {
        components.len().min(max_depth as usize)
    };
    format!("/{}", components[..keep].join("/"))
}

/// Acquire a credential for an operation on an authenticated namespace.
///
/// Returns `Ok(None)` when the namespace is public and no token is
/// needed; errors with `CredentialRequired` when the namespace demands
/// one and every rung of the ladder came up empty.
pub async fn acquire_token(
    http: &reqwest::Client,
    dir_resp: &DirectorResponse,
    object_path: &str,
    scope: TokenScope,
    opts: &TokenOptions,
) -> Result<Option<String>> {
    if !dir_resp.namespace.require_token {
        return Ok(None);
    }

    if let Some(value) = &opts.value {
        debug!("using explicitly provided token");
        return Ok(Some(value.trim().to_string()));
    }

    if let Some(location) = &opts.location {
        let token = std::fs::read_to_string(location).map_err(|e| {
            Error::CredentialRequired(format!(
                "{object_path} (cannot read token file {}: {e})",
                location.display()
            ))
        })?;
        return Ok(Some(token.trim().to_string()));
    }

    if let Ok(token) = std::env::var("BEARER_TOKEN") {
        if !token.trim().is_empty() {
            debug!("using token from BEARER_TOKEN");
            return Ok(Some(token.trim().to_string()));
        }
    }
    if let Ok(path) = std::env::var("BEARER_TOKEN_FILE") {
        if let Ok(token) = std::fs::read_to_string(&path) {
            debug!(path = %path, "using token from BEARER_TOKEN_FILE");
            return Ok(Some(token.trim().to_string()));
        }
    }

    if let Some(generation) = &dir_resp.token_generation {
        if generation.strategy == "OAuth2" && !generation.issuer.is_empty() {
            let path = scope_path(
                object_path,
                &dir_resp.namespace.path,
                generation.max_scope_depth,
            );
            let requested = scope.with_path(&path);
            return device_code_flow(http, &generation.issuer, &requested)
                .await
                .map(Some);
        }
        warn!(
            strategy = %generation.strategy,
            "unsupported token issuance strategy"
        );
    }

    Err(Error::CredentialRequired(object_path.to_string()))
}

#[derive(Debug, Deserialize)]
struct OidcConfiguration {
    device_authorization_endpoint: String,
    token_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct DeviceAuthorization {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    #[serde(default = "default_poll_interval")]
    interval: u64,
}

fn default_poll_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// OAuth2 device-code flow: request a user code, tell the user where to
/// go, poll until the grant completes.
async fn device_code_flow(
    http: &reqwest::Client,
    issuer: &str,
    scope: &str,
) -> Result<String> {
    let config_url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    let config: OidcConfiguration = http
        .get(&config_url)
        .send()
        .await
        .map_err(|e| Error::CredentialRequired(format!("issuer unreachable: {e}")))?
        .json()
        .await
        .map_err(|e| Error::CredentialRequired(format!("malformed issuer metadata: {e}")))?;

    let auth: DeviceAuthorization = http
        .post(&config.device_authorization_endpoint)
        .form(&[("client_id", DEVICE_CLIENT_ID), ("scope", scope)])
        .send()
        .await
        .map_err(|e| Error::CredentialRequired(format!("device authorization failed: {e}")))?
        .json()
        .await
        .map_err(|e| Error::CredentialRequired(format!("malformed device authorization: {e}")))?;

    let destination = auth
        .verification_uri_complete
        .as_deref()
        .unwrap_or(&auth.verification_uri);
    info!(
        url = %destination,
        code = %auth.user_code,
        "to approve this transfer, visit the URL and enter the code"
    );

    let mut interval = Duration::from_secs(auth.interval.max(1));
    let deadline = tokio::time::Instant::now() + DEVICE_FLOW_DEADLINE;
    loop {
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::CredentialRequired(
                "device authorization was not approved in time".to_string(),
            ));
        }
        tokio::time::sleep(interval).await;

        let resp: TokenEndpointResponse = http
            .post(&config.token_endpoint)
            .form(&[
                ("client_id", DEVICE_CLIENT_ID),
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("device_code", auth.device_code.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::CredentialRequired(format!("token endpoint failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::CredentialRequired(format!("malformed token response: {e}")))?;

        if let Some(token) = resp.access_token {
            return Ok(token);
        }
        match resp.error.as_deref() {
            Some("authorization_pending") => continue,
            Some("slow_down") => {
                interval += Duration::from_secs(5);
            }
            Some(other) => {
                return Err(Error::CredentialRequired(format!(
                    "device authorization failed: {other}"
                )));
            }
            None => {
                return Err(Error::CredentialRequired(
                    "token endpoint answered without a token or an error".to_string(),
                ));
            }
        }
    }
}
