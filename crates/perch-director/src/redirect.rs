//! The redirect engine
//!
//! Turns one object request into an ordered candidate list and a single
//! `307` target. The whole computation runs against the ad-store
//! snapshot taken at entry; concurrent upserts never change a request's
//! view mid-flight.

use crate::sort::sort_candidates;
use crate::state::DirectorState;
use crate::stat::StatOutcome;
use bytes::Bytes;
use chrono::Utc;
use http::{header, Method, Response, StatusCode};
use http_body_util::Full;
use perch_ads::{link_depth, longest_prefix_namespace, servers_for_object};
use perch_core::{
    HealthStatus, NamespaceAd, RequiredCapability, ServerAd, ServerKind, SortMethod,
};
use perch_geo::Coordinate;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Literal answered to a PROPFIND that no origin can satisfy
pub const LISTINGS_UNSUPPORTED_MSG: &str =
    "object listings are not supported by the discovered origin";

/// One parsed redirect request
#[derive(Debug, Clone)]
pub struct RedirectRequest {
    /// HTTP method (GET, HEAD, PUT, DELETE, PROPFIND)
    pub method: Method,
    /// Object path, absolute within the federation
    pub object_path: String,
    /// Raw query string, preserved onto the redirect target
    pub raw_query: String,
    /// Client address for distance sorting
    pub client_ip: Option<IpAddr>,
    /// Host (or X-Forwarded-Host) the request arrived on
    pub host: Option<String>,
    /// Mode forced by the endpoint (`/origin/` vs `/object/`); `None`
    /// for host-resolved default paths
    pub explicit_mode: Option<ServerKind>,
    /// The `skipstat` query option
    pub skip_stat: bool,
    /// The `directread` query option
    pub direct_read: bool,
}

impl RedirectRequest {
    /// Which server kind serves this request.
    ///
    /// Mutating methods and PROPFIND always go to the origin, whatever
    /// host the request arrived on.
    pub fn mode(&self, origin_hosts: &[String], cache_hosts: &[String]) -> ServerKind {
        if self.method == Method::PUT
            || self.method == Method::DELETE
            || self.method.as_str() == "PROPFIND"
        {
            return ServerKind::Origin;
        }
        if self.direct_read {
            return ServerKind::Origin;
        }
        if let Some(mode) = self.explicit_mode {
            return mode;
        }
        if let Some(host) = &self.host {
            let bare = host.split(':').next().unwrap_or(host);
            if origin_hosts.iter().any(|h| h == bare) {
                return ServerKind::Origin;
            }
            if cache_hosts.iter().any(|h| h == bare) {
                return ServerKind::Cache;
            }
        }
        ServerKind::Cache
    }

    /// Capability the candidate must advertise for this request
    pub fn required_capability(&self) -> RequiredCapability {
        if self.method.as_str() == "PROPFIND" {
            RequiredCapability::Listing
        } else if self.method == Method::PUT || self.method == Method::DELETE {
            RequiredCapability::Write
        } else if self.direct_read {
            RequiredCapability::DirectRead
        } else {
            RequiredCapability::Read
        }
    }
}

/// Produce the redirect (or error) response for one request
pub async fn handle_redirect(state: &DirectorState, req: &RedirectRequest) -> Response<Full<Bytes>> {
    let snapshot = state.store.snapshot();
    let now = Utc::now();

    let namespace = match longest_prefix_namespace(&snapshot, &req.object_path) {
        Some(ns) => ns,
        None => {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("namespace not registered for path {}", req.object_path),
            );
        }
    };

    let mode = req.mode(&state.config.origin_hosts, &state.config.cache_hosts);
    let required = req.required_capability();

    let mut candidates: Vec<ServerAd> = servers_for_object(&snapshot, &req.object_path, mode)
        .into_iter()
        .filter(|ad| {
            server_capabilities_for(ad, &req.object_path).satisfies(required)
        })
        .filter(|ad| {
            if state.filters.is_excluded(&ad.name) {
                debug!(server = %ad.name, "candidate excluded by filter");
                return false;
            }
            true
        })
        .filter(|ad| {
            if ad.in_downtime(now) {
                debug!(server = %ad.name, "candidate in active downtime");
                return false;
            }
            true
        })
        .filter(|ad| {
            // Probe status is advisory except under adaptive sorting,
            // where a conclusively failed server is dropped.
            if state.config.sort_method == SortMethod::Adaptive
                && state.probes.status(ad.url_key()) == HealthStatus::Failed
            {
                warn!(server = %ad.name, "candidate dropped: failed health probes");
                return false;
            }
            true
        })
        .cloned()
        .collect();

    if req.method.as_str() == "PROPFIND" && candidates.is_empty() {
        // The namespace exists but no origin supports listings
        let any_origin = servers_for_object(&snapshot, &req.object_path, ServerKind::Origin)
            .into_iter()
            .next()
            .is_some();
        if any_origin {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, LISTINGS_UNSUPPORTED_MSG);
        }
    }

    if candidates.is_empty() {
        return error_response(
            StatusCode::BAD_GATEWAY,
            format!("no suitable server found for {}", req.object_path),
        );
    }

    let client_coord = client_coordinate(state, req.client_ip);
    let alpha = 1.0
        / state
            .config
            .adaptive_sort_ewma_time_constant
            .as_secs_f64()
            .max(1.0);
    sort_candidates(
        state.config.sort_method,
        &mut candidates,
        client_coord,
        alpha,
        &state.adaptive,
    );

    // Presence pass for cache-served reads: a positively answering
    // server jumps the queue, a cached negative sinks (but stays).
    if mode == ServerKind::Cache && !req.skip_stat && req.method != Method::PUT {
        let timeout = state.config.timeouts.effective_stat();
        match state
            .stats
            .query(&req.object_path, &candidates, timeout)
            .await
        {
            StatOutcome::Found { .. } | StatOutcome::NotFound => {}
            StatOutcome::Timeout => {
                debug!(object = %req.object_path, "presence pass hit its deadline");
            }
        }
        candidates = partition_by_presence(state, &req.object_path, candidates);
    }

    let shortlist_len = state.config.max_stat_response.min(candidates.len());
    let shortlist = &candidates[..shortlist_len];

    build_redirect(state, req, &namespace, shortlist, &snapshot)
}

/// Capabilities that govern this request on this server: the server's
/// own namespace entry wins over the server-wide defaults.
fn server_capabilities_for(ad: &ServerAd, object_path: &str) -> perch_core::Capabilities {
    ad.namespaces
        .iter()
        .filter(|ns| perch_ads::path_has_prefix(object_path, &ns.path))
        .max_by_key(|ns| ns.path.trim_end_matches('/').len())
        .map(|ns| ns.capabilities)
        .unwrap_or(ad.capabilities)
}

fn client_coordinate(state: &DirectorState, client_ip: Option<IpAddr>) -> Coordinate {
    match client_ip {
        Some(ip) => {
            let (coord, _) = state.geo.resolve_ip(ip);
            coord
        }
        None => Coordinate::NULL,
    }
}

/// Stable three-way partition: known-present, unknown, known-absent
fn partition_by_presence(
    state: &DirectorState,
    object: &str,
    candidates: Vec<ServerAd>,
) -> Vec<ServerAd> {
    let mut present = Vec::new();
    let mut unknown = Vec::new();
    let mut absent = Vec::new();
    for ad in candidates {
        match state.stats.cached_verdict(ad.url_key(), object) {
            Some(true) => present.push(ad),
            None => unknown.push(ad),
            Some(false) => absent.push(ad),
        }
    }
    present.extend(unknown);
    present.extend(absent);
    present
}

fn build_redirect(
    state: &DirectorState,
    req: &RedirectRequest,
    namespace: &NamespaceAd,
    shortlist: &[ServerAd],
    snapshot: &[ServerAd],
) -> Response<Full<Bytes>> {
    let top = &shortlist[0];

    let mut location = format!(
        "{}{}",
        top.data_url.trim_end_matches('/'),
        req.object_path
    );
    if !req.raw_query.is_empty() {
        location.push('?');
        location.push_str(&req.raw_query);
    }

    let depth = link_depth(&req.object_path, &namespace.path).unwrap_or(0);
    let link = shortlist
        .iter()
        .enumerate()
        .map(|(i, ad)| {
            format!(
                "<{}{}>; rel=\"duplicate\"; pri={}; depth={}",
                ad.data_url.trim_end_matches('/'),
                req.object_path,
                i + 1,
                depth
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    // An origin with listings enabled anchors collection browsing
    let collections_url = servers_for_object(snapshot, &req.object_path, ServerKind::Origin)
        .into_iter()
        .find(|ad| server_capabilities_for(ad, &req.object_path).listings)
        .map(|ad| ad.web_url.clone());

    let require_token = namespace.requires_token();
    let mut ns_header = format!(
        "namespace={}; require-token={}",
        namespace.path, require_token
    );
    if let Some(url) = collections_url {
        ns_header.push_str(&format!("; collections-url={url}"));
    }

    let mut builder = Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(header::LOCATION, location)
        .header(header::LINK, link)
        .header("X-Pelican-Namespace", ns_header)
        .header(header::SERVER, perch_core::server_header());

    if require_token {
        if let Some(issuer) = namespace.issuers.first() {
            builder = builder.header(
                "X-Pelican-Authorization",
                format!("issuer={}", issuer.issuer_url),
            );
        }
        if let Some(rule) = namespace.token_generation.first() {
            let strategy = match rule.strategy {
                perch_core::TokenStrategy::OAuth2 => "OAuth2",
                perch_core::TokenStrategy::Vault => "Vault",
            };
            builder = builder.header(
                "X-Pelican-Token-Generation",
                format!(
                    "issuer={}; strategy={}; max-scope-depth={}",
                    rule.credential_issuer, strategy, rule.max_scope_depth
                ),
            );
        }
    }

    if let Some(broker) = &top.broker_url {
        builder = builder.header("X-Pelican-Broker", broker.clone());
    }

    builder
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("cannot build redirect: {e}"),
            )
        })
}

/// JSON error body in the federation's `{"msg": ...}` shape
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let message = message.into();
    let body = serde_json::json!({ "msg": message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::SERVER, perch_core::server_header())
        .body(Full::new(Bytes::from(body)))
        .expect("static error response")
}
