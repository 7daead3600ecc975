//! # Perch Client
//!
//! Client-side orchestration of federation transfers: parse the
//! federation URL, discover the federation, ask the director for
//! candidates, acquire a credential when the namespace demands one, and
//! drive the transfer through the bounded worker pool.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod director;
pub mod engine;
pub mod headers;
pub mod prefs;
pub mod token;

pub use director::{query_director, DirectorResponse, QueryOptions, DEFAULT_DIRECTOR_RETRIES};
pub use engine::{
    Attempt, CancelToken, Direction, TransferEngine, TransferJob, TransferResult, DEFAULT_WORKERS,
};
pub use headers::{Namespace, TokenGeneration};
pub use prefs::PreferredServers;
pub use token::{acquire_token, scope_path, TokenOptions};

use chrono::{DateTime, Utc};
use perch_core::{Error, Result, TokenScope};
use perch_url::{DiscoveryOptions, FederationInfo, ParseOptions, PelicanUrl};
use reqwest::Method;
use std::path::Path;
use tracing::debug;
use url::Url;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Director query attempts
    pub director_retries: u32,
    /// Skip the `Server` header check on director responses
    pub assume_director_server_header: bool,
    /// Transfer worker count
    pub workers: usize,
    /// Tolerate unknown federation URL query options
    pub tolerate_unknown_query: bool,
    /// Discovery endpoint for schemeless paths
    pub discovery_url: Option<String>,
    /// Endpoints pinned out of band, overriding discovery field-by-field
    pub federation_overrides: Option<FederationInfo>,
    /// Preferred servers (`--preferred-caches`), `+` sentinel included
    pub preferred_caches: Vec<String>,
    /// Credential sources
    pub token: TokenOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            director_retries: DEFAULT_DIRECTOR_RETRIES,
            assume_director_server_header: false,
            workers: DEFAULT_WORKERS,
            tolerate_unknown_query: false,
            discovery_url: None,
            federation_overrides: None,
            preferred_caches: Vec::new(),
            token: TokenOptions::default(),
        }
    }
}

/// Metadata learned by `stat`
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStat {
    /// Object size in bytes
    pub size: u64,
    /// Last modification time, when the server reported one
    pub mtime: Option<DateTime<Utc>>,
    /// Server that answered
    pub server: String,
}

/// A federation client
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    http: reqwest::Client,
    discovery: perch_discovery::DiscoveryClient,
    engine: TransferEngine,
    cancel: CancelToken,
}

impl Client {
    /// Build a client; transfer workers start immediately.
    pub fn new(config: ClientConfig) -> Self {
        let user_agent = format!("pelican-client/{}", env!("CARGO_PKG_VERSION"));
        let http = reqwest::Client::builder()
            .user_agent(user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        let cancel = CancelToken::new();
        let engine = TransferEngine::new(config.workers, reqwest::Client::new(), cancel.clone());
        Self {
            config,
            http,
            discovery: perch_discovery::DiscoveryClient::new(user_agent),
            engine,
            cancel,
        }
    }

    /// The cancellation handle for this client's operations
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Cancel everything and wait for workers to stop
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.engine.shutdown().await;
    }

    /// Parse a federation URL and attach federation metadata.
    ///
    /// Endpoints pinned out of band override discovery field-by-field;
    /// when the director endpoint itself is pinned, no discovery fetch
    /// happens at all.
    pub async fn resolve(&self, raw: &str) -> Result<PelicanUrl> {
        let mut url = PelicanUrl::parse(
            raw,
            ParseOptions {
                tolerate_unknown_query: self.config.tolerate_unknown_query,
            },
            &DiscoveryOptions {
                discovery_url: self.config.discovery_url.clone(),
            },
        )?;
        let configured = self.config.federation_overrides.clone().unwrap_or_default();
        if configured.director_endpoint.is_empty() {
            self.discovery
                .discover_for_url(&mut url, Some(&configured))
                .await?;
        } else {
            url.fed_info = Some(configured);
        }
        Ok(url)
    }

    /// Download an object to a local path
    pub async fn get(&self, remote: &str, local: &Path) -> Result<TransferResult> {
        let url = self.resolve(remote).await?;
        let dir_resp = self.query(Method::GET, &url).await?;
        let token = acquire_token(
            &self.http,
            &dir_resp,
            &url.path,
            TokenScope::StorageRead,
            &self.config.token,
        )
        .await?;
        let candidates = self.merge_preferred(&url, dir_resp.object_servers)?;
        self.engine
            .submit(TransferJob {
                direction: Direction::Get,
                local: local.to_path_buf(),
                remote_path: url.path.clone(),
                candidates,
                token,
            })
            .await
    }

    /// Upload a local file to an object path
    pub async fn put(&self, local: &Path, remote: &str) -> Result<TransferResult> {
        let url = self.resolve(remote).await?;
        let dir_resp = self.query(Method::PUT, &url).await?;
        let token = acquire_token(
            &self.http,
            &dir_resp,
            &url.path,
            TokenScope::StorageCreate,
            &self.config.token,
        )
        .await?;
        let candidates = self.merge_preferred(&url, dir_resp.object_servers)?;
        self.engine
            .submit(TransferJob {
                direction: Direction::Put,
                local: local.to_path_buf(),
                remote_path: url.path.clone(),
                candidates,
                token,
            })
            .await
    }

    /// Copy between a local path and a federation URL, inferring the
    /// direction from which argument parses as a federation URL.
    pub async fn copy(&self, source: &str, destination: &str) -> Result<TransferResult> {
        let source_is_remote = looks_remote(source);
        let destination_is_remote = looks_remote(destination);
        match (source_is_remote, destination_is_remote) {
            (true, false) => self.get(source, Path::new(destination)).await,
            (false, true) => self.put(Path::new(source), destination).await,
            (true, true) => Err(Error::BadUrl(
                "copy between two federation URLs is not supported".to_string(),
            )),
            (false, false) => Err(Error::BadUrl(
                "neither side of the copy is a federation URL".to_string(),
            )),
        }
    }

    /// Stat an object: size and modification time from the best server
    pub async fn stat(&self, remote: &str) -> Result<ClientStat> {
        let url = self.resolve(remote).await?;
        let dir_resp = self.query(Method::GET, &url).await?;
        let token = acquire_token(
            &self.http,
            &dir_resp,
            &url.path,
            TokenScope::StorageRead,
            &self.config.token,
        )
        .await?;

        let mut last_err: Option<Error> = None;
        for server in &dir_resp.object_servers {
            let mut req = self.http.head(server.clone());
            if let Some(token) = &token {
                req = req.bearer_auth(token);
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let size = resp
                        .headers()
                        .get(reqwest::header::CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    let mtime = resp
                        .headers()
                        .get(reqwest::header::LAST_MODIFIED)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                        .map(|dt| dt.with_timezone(&Utc));
                    return Ok(ClientStat {
                        size,
                        mtime,
                        server: server.host_str().unwrap_or_default().to_string(),
                    });
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    last_err = Some(Error::NotFound(url.path.clone()));
                }
                Ok(resp) => {
                    last_err = Some(Error::Transfer(format!(
                        "{}: status {}",
                        server,
                        resp.status()
                    )));
                }
                Err(e) => {
                    last_err = Some(Error::Transfer(format!("{server}: {e}")));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::NoCandidates(url.path)))
    }

    /// List a collection. The director either redirects to a
    /// listings-capable origin or proxies the directory document.
    pub async fn list(&self, remote: &str) -> Result<Vec<String>> {
        let url = self.resolve(remote).await?;
        let method = Method::from_bytes(b"PROPFIND").expect("static method");
        let dir_resp = self.query(method.clone(), &url).await?;

        // Newer directors proxy the directory document themselves
        if let Some(body) = &dir_resp.multistatus_body {
            return Ok(parse_propfind_hrefs(body, &url.path));
        }

        let token = acquire_token(
            &self.http,
            &dir_resp,
            &url.path,
            TokenScope::StorageRead,
            &self.config.token,
        )
        .await?;

        let target = dir_resp
            .object_servers
            .first()
            .cloned()
            .ok_or_else(|| Error::NoCandidates(url.path.clone()))?;
        let mut req = self
            .http
            .request(method, target.clone())
            .header("Depth", "1");
        if let Some(token) = &token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Transfer(format!("{target}: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Transfer(format!(
                "{target}: status {}",
                resp.status()
            )));
        }
        let body = resp.text().await.map_err(|e| Error::Transfer(e.to_string()))?;
        Ok(parse_propfind_hrefs(&body, &url.path))
    }

    /// Delete an object
    pub async fn remove(&self, remote: &str) -> Result<()> {
        let url = self.resolve(remote).await?;
        let dir_resp = self.query(Method::DELETE, &url).await?;
        let token = acquire_token(
            &self.http,
            &dir_resp,
            &url.path,
            TokenScope::StorageModify,
            &self.config.token,
        )
        .await?;

        let target = dir_resp
            .object_servers
            .first()
            .cloned()
            .ok_or_else(|| Error::NoCandidates(url.path.clone()))?;
        let mut req = self.http.delete(target.clone());
        if let Some(token) = &token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Transfer(format!("{target}: {e}")))?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::NOT_FOUND => Err(Error::NotFound(url.path)),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(Error::Forbidden(format!("{target}")))
            }
            s => Err(Error::Transfer(format!("{target}: status {s}"))),
        }
    }

    /// Download a collection tree under a local directory.
    ///
    /// Collections are told apart from objects by probing them with
    /// PROPFIND; an entry that cannot be listed is fetched as a file.
    pub async fn get_recursive(&self, remote: &str, local_dir: &Path) -> Result<Vec<TransferResult>> {
        let root = self.resolve(remote).await?;
        let root_path = root.path.clone();
        let mut results = Vec::new();
        let mut pending = vec![remote.to_string()];
        let mut depth = 0;

        while let Some(dir) = pending.pop() {
            depth += 1;
            if depth > 4096 {
                return Err(Error::Transfer(
                    "recursive transfer exceeded the collection limit".to_string(),
                ));
            }
            let entries = self.list(&dir).await?;
            for entry in entries {
                let entry_url = rebase_remote(remote, &entry)?;
                match self.list(&entry_url).await {
                    Ok(children) if !children.is_empty() => pending.push(entry_url),
                    _ => {
                        let rel = entry
                            .strip_prefix(root_path.trim_end_matches('/'))
                            .unwrap_or(&entry)
                            .trim_start_matches('/');
                        let target = local_dir.join(rel);
                        if let Some(parent) = target.parent() {
                            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
                        }
                        results.push(self.get(&entry_url, &target).await?);
                    }
                }
            }
        }
        Ok(results)
    }

    /// Upload a local directory tree under a collection
    pub async fn put_recursive(&self, local_dir: &Path, remote: &str) -> Result<Vec<TransferResult>> {
        let mut results = Vec::new();
        let mut pending = vec![local_dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(Error::Io)?;
            while let Some(entry) = read_dir.next_entry().await.map_err(Error::Io)? {
                let path = entry.path();
                if entry.file_type().await.map_err(Error::Io)?.is_dir() {
                    pending.push(path);
                } else {
                    let rel = path
                        .strip_prefix(local_dir)
                        .map_err(|e| Error::Internal(e.to_string()))?;
                    let remote_file = format!(
                        "{}/{}",
                        remote.trim_end_matches('/'),
                        rel.to_string_lossy().replace('\\', "/")
                    );
                    results.push(self.put(&path, &remote_file).await?);
                }
            }
        }
        Ok(results)
    }

    async fn query(&self, method: Method, url: &PelicanUrl) -> Result<DirectorResponse> {
        let opts = QueryOptions {
            retries: self.config.director_retries,
            assume_director_server_header: self.config.assume_director_server_header,
            ..Default::default()
        };
        debug!(path = %url.path, method = %method, "querying director");
        query_director(&self.http, method, url, None, &opts).await
    }

    fn merge_preferred(&self, url: &PelicanUrl, director_list: Vec<Url>) -> Result<Vec<Url>> {
        let prefs = PreferredServers::parse(&self.config.preferred_caches)?;
        let merged = match prefs {
            Some(prefs) => {
                // Pinned entries are bare server URLs; give each the
                // object path so they line up with the director's list.
                let mut with_path = prefs.clone();
                for server in &mut with_path.servers {
                    server.set_path(&url.path);
                }
                with_path.merge(director_list)
            }
            None => director_list,
        };
        Ok(merged)
    }
}

/// Rewrite the original remote URL so its path names `entry` instead.
///
/// `osdf://` URLs carry no discovery host (what parses as one is the
/// first path component), so the entry becomes the whole remainder.
fn rebase_remote(original: &str, entry: &str) -> Result<String> {
    match original.split_once("://") {
        None => Ok(entry.to_string()),
        Some((scheme, _)) if scheme == "osdf" || scheme == "stash" => {
            Ok(format!("{scheme}://{}", entry.trim_start_matches('/')))
        }
        Some((scheme, rest)) => {
            let host = &rest[..rest.find('/').unwrap_or(rest.len())];
            Ok(format!("{scheme}://{host}{entry}"))
        }
    }
}

/// A remote argument is one carrying a federation scheme
fn looks_remote(arg: &str) -> bool {
    arg.starts_with("pelican://") || arg.starts_with("osdf://") || arg.starts_with("stash://")
}

/// Pull `<href>` values out of a WebDAV multistatus document, dropping
/// the collection itself.
fn parse_propfind_hrefs(body: &str, own_path: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(":href>").or_else(|| rest.find("<href>")) {
        let after = &rest[start..];
        let open_end = match after.find('>') {
            Some(i) => i + 1,
            None => break,
        };
        let content = &after[open_end..];
        let close = match content.find('<') {
            Some(i) => i,
            None => break,
        };
        let href = content[..close].trim();
        let normalized = href.trim_end_matches('/');
        if !normalized.is_empty() && normalized != own_path.trim_end_matches('/') {
            entries.push(normalized.to_string());
        }
        rest = &content[close..];
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebase_remote() {
        assert_eq!(
            rebase_remote("pelican://fed.org/ns/dir", "/ns/dir/a.txt").unwrap(),
            "pelican://fed.org/ns/dir/a.txt"
        );
        assert_eq!(
            rebase_remote("osdf://chtc/staging", "/chtc/staging/a.txt").unwrap(),
            "osdf://chtc/staging/a.txt"
        );
        assert_eq!(rebase_remote("/ns/dir", "/ns/dir/a.txt").unwrap(), "/ns/dir/a.txt");
    }

    #[test]
    fn test_looks_remote() {
        assert!(looks_remote("pelican://fed.org/ns/f"));
        assert!(looks_remote("osdf://ns/f"));
        assert!(!looks_remote("/tmp/local.txt"));
        assert!(!looks_remote("relative/path"));
    }

    #[test]
    fn test_parse_propfind_hrefs() {
        let body = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response><D:href>/ns/dir/</D:href></D:response>
  <D:response><D:href>/ns/dir/a.txt</D:href></D:response>
  <D:response><D:href>/ns/dir/b.txt</D:href></D:response>
</D:multistatus>"#;
        let entries = parse_propfind_hrefs(body, "/ns/dir");
        assert_eq!(entries, vec!["/ns/dir/a.txt", "/ns/dir/b.txt"]);
    }

    #[test]
    fn test_parse_propfind_empty() {
        assert!(parse_propfind_hrefs("", "/ns").is_empty());
        assert!(parse_propfind_hrefs("<not-xml>", "/ns").is_empty());
    }

    #[tokio::test]
    async fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.director_retries, 3);
        assert_eq!(config.workers, 5);
        assert!(!config.assume_director_server_header);
    }
}
