//! Director queries with disciplined retry
//!
//! The director sits behind ingress proxies in most federations, so the
//! retry loop must tell "the director said no" apart from "something in
//! front of the director is answering while it reboots". The `Server`
//! header is the discriminator: a federation process stamps
//! `pelican/<version>` on every response.

use crate::headers::{parse_link_header, Namespace, TokenGeneration};
use perch_core::{backoff_with_jitter, Error, Result, SERVER_HEADER_PREFIX};
use perch_url::PelicanUrl;
use rand::Rng;
use reqwest::header::{HeaderMap, AUTHORIZATION, LINK, RETRY_AFTER, SERVER, USER_AGENT};
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

/// Default number of director query attempts
pub const DEFAULT_DIRECTOR_RETRIES: u32 = 3;

/// What the director told us about an object
#[derive(Debug, Clone, Default)]
pub struct DirectorResponse {
    /// Servers that can satisfy the request, best first
    pub object_servers: Vec<Url>,
    /// The matched namespace
    pub namespace: Namespace,
    /// Issuer to present tokens from, when access is authenticated
    pub auth_issuer: Option<String>,
    /// Credential-issuance rule, when the namespace specifies one
    pub token_generation: Option<TokenGeneration>,
    /// Connection broker of the top candidate
    pub broker_url: Option<String>,
    /// `Retry-After` propagated verbatim from a 429
    pub retry_after: Option<String>,
    /// Directory document proxied through by a newer director instead
    /// of a redirect (PROPFIND only)
    pub multistatus_body: Option<String>,
}

/// Tunables for the query loop
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Maximum director query attempts
    pub retries: u32,
    /// Treat every response as coming from a director, skipping the
    /// `Server` header check (for federations behind header-stripping
    /// proxies)
    pub assume_director_server_header: bool,
    /// User agent presented to the director
    pub user_agent: String,
    /// Per-attempt deadline
    pub timeout: std::time::Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_DIRECTOR_RETRIES,
            assume_director_server_header: false,
            user_agent: format!("pelican-client/{}", env!("CARGO_PKG_VERSION")),
            timeout: std::time::Duration::from_secs(5),
        }
    }
}

/// Whether a response came from a federation process rather than a
/// proxy in front of one.
fn from_pelican(headers: &HeaderMap, opts: &QueryOptions) -> bool {
    if opts.assume_director_server_header {
        return true;
    }
    headers
        .get(SERVER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with(SERVER_HEADER_PREFIX))
        .unwrap_or(false)
}

/// Query the director for a verb on an object; returns the parsed
/// response once a `307` (or a PROPFIND `207`) arrives.
pub async fn query_director(
    http: &reqwest::Client,
    method: Method,
    url: &PelicanUrl,
    token: Option<&str>,
    opts: &QueryOptions,
) -> Result<DirectorResponse> {
    let fed = url
        .fed_info
        .as_ref()
        .ok_or_else(|| Error::NoDiscovery(url.path.clone()))?;
    if fed.director_endpoint.is_empty() {
        return Err(Error::NoDiscovery(format!(
            "no director endpoint known for {}",
            url.path
        )));
    }

    let mut resource = Url::parse(&fed.director_endpoint)
        .map_err(|e| Error::BadUrl(format!("director endpoint: {e}")))?;
    resource.set_path(&url.path);
    if !url.raw_query.is_empty() {
        resource.set_query(Some(&url.raw_query));
    }

    let retries = opts.retries.max(1);
    let mut last_err: Option<Error> = None;

    for attempt in 0..retries {
        let mut req = http
            .request(method.clone(), resource.clone())
            .header(USER_AGENT, &opts.user_agent)
            .timeout(opts.timeout);
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                // Transport errors never reached the director; retrying
                // the same endpoint is the only option.
                warn!(attempt, error = %e, "director unreachable");
                last_err = Some(Error::DirectorUnreachable(e.to_string()));
                sleep_backoff(attempt).await;
                continue;
            }
        };

        let status = resp.status();
        let headers = resp.headers().clone();
        let is_pelican = from_pelican(&headers, opts);
        let body = resp.text().await.unwrap_or_default();

        if status == StatusCode::TEMPORARY_REDIRECT {
            if !body.is_empty() {
                debug!(body = %body, "director redirect choice information");
            }
            return parse_director_response(&headers);
        }

        // A director newer than 7.9 answers PROPFIND with the directory
        // document directly instead of a redirect.
        if status == StatusCode::MULTI_STATUS && method.as_str() == "PROPFIND" {
            let mut parsed = parse_director_response(&headers)?;
            parsed.multistatus_body = Some(body);
            return Ok(parsed);
        }

        // Older directors have no DELETE endpoint and answer with their
        // router's plain 404 page.
        if status == StatusCode::NOT_FOUND
            && method == Method::DELETE
            && body.to_lowercase().contains("page not found")
        {
            warn!("director appears to predate the DELETE endpoint; retrying with PUT");
            return Box::pin(query_director(http, Method::PUT, url, token, opts)).await;
        }

        let not_pelican_transient = !is_pelican
            && matches!(
                status,
                StatusCode::BAD_GATEWAY | StatusCode::NOT_FOUND | StatusCode::INTERNAL_SERVER_ERROR
            );
        let pelican_rebooting = is_pelican && status == StatusCode::TOO_MANY_REQUESTS;

        if not_pelican_transient || pelican_rebooting {
            if attempt == 0 {
                if not_pelican_transient {
                    warn!(
                        retries,
                        "response not from a federation process; the director may be rebooting"
                    );
                } else {
                    warn!("the director has just rebooted and is still discovering federation services");
                }
            }
            last_err = Some(Error::DirectorTransient {
                status: status.as_u16(),
                message: error_message(&headers, &body),
            });
            sleep_backoff(attempt).await;
            continue;
        }

        return Err(terminal_error(status, &headers, &body, is_pelican, url));
    }

    Err(last_err.unwrap_or_else(|| Error::DirectorUnreachable("retries exhausted".to_string())))
}

/// Sleep `3*attempt + 3` seconds plus up to a second of jitter
async fn sleep_backoff(attempt: u32) {
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    let delay = backoff_with_jitter(attempt, jitter);
    warn!(seconds = delay.as_secs(), "sleeping before retrying the director");
    tokio::time::sleep(delay).await;
}

/// Extract the message from a `{"msg": ...}` body, falling back to the
/// raw text.
fn error_message(headers: &HeaderMap, body: &str) -> String {
    let is_json = headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);
    if is_json {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) {
            if let Some(msg) = parsed.get("msg").and_then(|m| m.as_str()) {
                return msg.to_string();
            }
        }
    }
    body.to_string()
}

fn terminal_error(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    is_pelican: bool,
    url: &PelicanUrl,
) -> Error {
    let message = error_message(headers, body);
    match status {
        StatusCode::NOT_FOUND if is_pelican => Error::NotFound(format!(
            "{}: {}",
            url.path,
            if message.is_empty() {
                "namespace not registered".to_string()
            } else {
                message
            }
        )),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Forbidden(message),
        StatusCode::METHOD_NOT_ALLOWED => Error::Transfer(format!(
            "the director could not find a server supporting this operation for {}: {}",
            url.path, message
        )),
        _ => Error::DirectorTransient {
            status: status.as_u16(),
            message,
        },
    }
}

/// Parse the ordered server list and sidecar headers of a redirect
pub fn parse_director_response(headers: &HeaderMap) -> Result<DirectorResponse> {
    let object_servers = match headers.get(LINK).and_then(|v| v.to_str().ok()) {
        Some(link) => parse_link_header(link),
        None => Vec::new(),
    };

    let namespace = headers
        .get("x-pelican-namespace")
        .and_then(|v| v.to_str().ok())
        .map(Namespace::parse)
        .unwrap_or_default();

    let auth_issuer = headers
        .get("x-pelican-authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.split(';')
                .map(str::trim)
                .find_map(|kv| kv.strip_prefix("issuer="))
        })
        .map(str::to_string);

    let token_generation = headers
        .get("x-pelican-token-generation")
        .and_then(|v| v.to_str().ok())
        .map(TokenGeneration::parse);

    let broker_url = headers
        .get("x-pelican-broker")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let retry_after = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok(DirectorResponse {
        object_servers,
        namespace,
        auth_issuer,
        token_generation,
        broker_url,
        retry_after,
        multistatus_body: None,
    })
}
