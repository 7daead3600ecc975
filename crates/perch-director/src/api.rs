//! Director HTTP API
//!
//! Request dispatch, the registration endpoints, the synthetic health
//! test object, service discovery for telemetry scrapers, and the
//! accept loop with graceful drain.

use crate::ingest::Rejection;
use crate::redirect::{handle_redirect, RedirectRequest};
use crate::state::DirectorState;
use bytes::Bytes;
use chrono::DateTime;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use perch_core::{ServerKind, TokenScope};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// API prefix every director route lives under
pub const API_PREFIX: &str = "/api/v1.0/director";

/// Body served for synthetic health test objects
pub const HEALTH_TEST_BODY: &str = "test file content";

/// File extensions a health-test object may carry
const HEALTH_TEST_EXTENSIONS: &[&str] = &["txt"];

/// Request handler for the director API
#[derive(Clone)]
pub struct DirectorApi {
    state: Arc<DirectorState>,
}

impl std::fmt::Debug for DirectorApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorApi").finish()
    }
}

impl DirectorApi {
    /// Wrap the shared state in a request handler
    pub fn new(state: Arc<DirectorState>) -> Self {
        Self { state }
    }

    /// Dispatch one request
    pub async fn handle(
        &self,
        req: Request<Full<Bytes>>,
        remote_addr: Option<SocketAddr>,
    ) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();

        trace!(method = %method, path = %path, "director API request");

        if let Some(object) = strip_route(&path, "/object") {
            return self
                .redirect(req, remote_addr, object, query, Some(ServerKind::Cache))
                .await;
        }
        if let Some(object) = strip_route(&path, "/origin") {
            return self
                .redirect(req, remote_addr, object, query, Some(ServerKind::Origin))
                .await;
        }

        match (method, path.as_str()) {
            (Method::POST, p) if p == route("/registerOrigin") => {
                self.register(req, ServerKind::Origin).await
            }
            (Method::POST, p) if p == route("/registerCache") => {
                self.register(req, ServerKind::Cache).await
            }
            (Method::GET, p) if p == route("/discoverServers") => self.discover_servers(&req),
            (Method::GET, p) if p == route("/listNamespaces") => self.list_namespaces(),
            (Method::GET, p) if p.starts_with(&route("/healthTest/")) => {
                let object = p[route("/healthTest").len()..].to_string();
                self.health_test(&object)
            }
            (_, p) if p.starts_with("/api/") => {
                json_error(StatusCode::NOT_FOUND, "endpoint not found")
            }
            // Default paths: an object request straight at the director
            // root, with origin-vs-cache mode resolved from the Host.
            (_, p) => {
                let object = p.to_string();
                self.redirect(req, remote_addr, object, query, None).await
            }
        }
    }

    async fn redirect(
        &self,
        req: Request<Full<Bytes>>,
        remote_addr: Option<SocketAddr>,
        object: String,
        query: String,
        explicit_mode: Option<ServerKind>,
    ) -> Response<Full<Bytes>> {
        let headers = req.headers();
        let client_ip = client_ip(headers, remote_addr);
        let host = headers
            .get("x-forwarded-host")
            .or_else(|| headers.get(header::HOST))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let redirect = RedirectRequest {
            method: req.method().clone(),
            object_path: object,
            raw_query: query.clone(),
            client_ip,
            host,
            explicit_mode,
            skip_stat: has_query_flag(&query, "skipstat"),
            direct_read: has_query_flag(&query, "directread"),
        };
        handle_redirect(&self.state, &redirect).await
    }

    async fn register(
        &self,
        req: Request<Full<Bytes>>,
        kind: ServerKind,
    ) -> Response<Full<Bytes>> {
        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return json_error(StatusCode::BAD_REQUEST, "cannot read request body"),
        };

        let ad = match self
            .state
            .ingestor
            .ingest(kind, authorization.as_deref(), user_agent.as_deref(), &body)
            .await
        {
            Ok(ad) => ad,
            Err(Rejection { status, message }) => {
                warn!(kind = %kind, status = %status, message = %message, "registration rejected");
                return json_error(status, message);
            }
        };

        info!(kind = %kind, server = %ad.name, url = %ad.data_url, "advertisement accepted");
        self.state.record_ad(ad).await;
        json_response(
            StatusCode::OK,
            &serde_json::json!({ "msg": "advertisement accepted" }),
        )
    }

    /// Service-discovery listing for telemetry scrapers. Requires a
    /// token scoped `pelican.directorServiceDiscovery`.
    fn discover_servers(&self, req: &Request<Full<Bytes>>) -> Response<Full<Bytes>> {
        let token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "));
        let token = match token {
            Some(t) => t,
            None => return json_error(StatusCode::FORBIDDEN, "missing bearer token"),
        };
        if let Err(e) = self
            .state
            .tokens
            .verify_scoped(token, TokenScope::DirectorServiceDiscovery)
        {
            return json_error(StatusCode::FORBIDDEN, e.to_string());
        }

        let servers: Vec<serde_json::Value> = self
            .state
            .store
            .snapshot()
            .into_iter()
            .map(|ad| {
                serde_json::json!({
                    "name": ad.name,
                    "type": ad.kind.to_string(),
                    "serverUrl": ad.web_url,
                    "dataUrl": ad.data_url,
                    "healthStatus": self.state.probes.status(&ad.data_url).to_string(),
                    "fromTopology": ad.from_topology,
                    "latitude": ad.latitude,
                    "longitude": ad.longitude,
                })
            })
            .collect();
        json_response(StatusCode::OK, &servers)
    }

    fn list_namespaces(&self) -> Response<Full<Bytes>> {
        let namespaces = perch_ads::namespaces_from_origins(&self.state.store.snapshot());
        json_response(StatusCode::OK, &namespaces)
    }

    /// Synthetic test object endpoint. The path must end in a known
    /// extension and embed an RFC 3339 timestamp.
    fn health_test(&self, object: &str) -> Response<Full<Bytes>> {
        let file_name = object.rsplit('/').next().unwrap_or("");
        let (stem, extension) = match file_name.rsplit_once('.') {
            Some(parts) => parts,
            None => {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    "health test object must carry a filename extension",
                )
            }
        };
        if !HEALTH_TEST_EXTENSIONS.contains(&extension) {
            return json_error(
                StatusCode::BAD_REQUEST,
                format!("unsupported health test extension .{extension}"),
            );
        }

        // The timestamp trails the last prefix segment, e.g.
        // `director-test-2024-01-01T00:00:00Z`.
        let timestamp = stem
            .strip_prefix(crate::probe::PROBE_FILE_PREFIX)
            .or_else(|| stem.strip_prefix("self-test-"))
            .unwrap_or(stem);
        if DateTime::parse_from_rfc3339(timestamp).is_err() {
            return json_error(
                StatusCode::BAD_REQUEST,
                format!("cannot parse timestamp {timestamp} as RFC 3339"),
            );
        }

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::SERVER, perch_core::server_header())
            .body(Full::new(Bytes::from(HEALTH_TEST_BODY)))
            .expect("static response")
    }
}

fn route(suffix: &str) -> String {
    format!("{API_PREFIX}{suffix}")
}

/// Object path for redirect routes: `/api/v1.0/director/object/<path>`
fn strip_route(path: &str, kind: &str) -> Option<String> {
    let prefix = route(kind);
    let rest = path.strip_prefix(&prefix)?;
    if rest.is_empty() || !rest.starts_with('/') {
        return None;
    }
    Some(rest.to_string())
}

fn has_query_flag(query: &str, flag: &str) -> bool {
    query
        .split('&')
        .any(|pair| pair == flag || pair.starts_with(&format!("{flag}=")))
}

fn client_ip(headers: &header::HeaderMap, remote_addr: Option<SocketAddr>) -> Option<IpAddr> {
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse().ok())
        })
        .or_else(|| remote_addr.map(|a| a.ip()))
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::SERVER, perch_core::server_header())
        .body(Full::new(Bytes::from(json)))
        .expect("static response")
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    crate::redirect::error_response(status, message)
}

/// The director's HTTP server: accept loop plus graceful drain
pub struct DirectorServer {
    state: Arc<DirectorState>,
    api: DirectorApi,
    request_count: Arc<AtomicUsize>,
}

impl std::fmt::Debug for DirectorServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorServer")
            .field("in_flight", &self.request_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl DirectorServer {
    /// Create a server over initialized state
    pub fn new(state: Arc<DirectorState>) -> Self {
        let api = DirectorApi::new(Arc::clone(&state));
        Self {
            state,
            api,
            request_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run until the shutdown signal fires, then drain in-flight
    /// requests within the configured deadline.
    pub async fn run(&self) -> perch_core::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.state.config.listen)
            .await
            .map_err(|e| {
                perch_core::Error::Config(format!(
                    "failed to bind {}: {e}",
                    self.state.config.listen
                ))
            })?;
        let local_addr = listener.local_addr().map_err(perch_core::Error::Io)?;
        info!(listen = %local_addr, "director listening");

        let mut shutdown_rx = self.state.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            trace!("accepted connection from {addr}");
                            self.spawn_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("failed to accept connection: {e}");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let api = self.api.clone();
        let request_count = Arc::clone(&self.request_count);

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
                let api = api.clone();
                let request_count = Arc::clone(&request_count);
                async move {
                    request_count.fetch_add(1, Ordering::Relaxed);
                    let (parts, body) = req.into_parts();
                    let body = match body.collect().await {
                        Ok(collected) => Full::new(collected.to_bytes()),
                        Err(_) => Full::new(Bytes::new()),
                    };
                    let req = Request::from_parts(parts, body);
                    let resp = api.handle(req, Some(addr)).await;
                    request_count.fetch_sub(1, Ordering::Relaxed);
                    Ok::<_, std::convert::Infallible>(resp)
                }
            });

            let io = TokioIo::new(stream);
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                debug!("connection error: {e}");
            }
        });
    }

    async fn drain(&self) {
        let deadline = self.state.config.shutdown_timeout;
        let start = std::time::Instant::now();
        info!(
            timeout_secs = deadline.as_secs(),
            "waiting for in-flight requests to complete"
        );
        loop {
            let active = self.request_count.load(Ordering::Relaxed);
            if active == 0 {
                info!("all requests completed, shutting down cleanly");
                break;
            }
            if start.elapsed() >= deadline {
                warn!(active_requests = active, "shutdown deadline reached, forcing shutdown");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
