//! The transfer engine: a bounded worker pool walking candidate lists
//!
//! Jobs enter a queue; a fixed set of workers (default 5) drains it.
//! Each worker walks its job's candidate list in order, falling through
//! to the next server on eligible failures and recording every attempt.

use futures::StreamExt;
use perch_core::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Default number of transfer workers
pub const DEFAULT_WORKERS: usize = 5;

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Download from the federation
    Get,
    /// Upload into the federation
    Put,
}

/// A queued transfer
#[derive(Debug)]
pub struct TransferJob {
    /// Direction of the transfer
    pub direction: Direction,
    /// Local file path
    pub local: PathBuf,
    /// Federation object path, for messages and results
    pub remote_path: String,
    /// Candidate servers, best first; each already carries the object path
    pub candidates: Vec<Url>,
    /// Credential to present, when the namespace requires one
    pub token: Option<String>,
}

/// One attempt against one server
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Server the attempt went to
    pub server: String,
    /// Bytes moved before success or failure
    pub bytes: u64,
    /// Wall time of the attempt
    pub duration: Duration,
    /// Why it failed, when it did
    pub error: Option<String>,
}

/// Final outcome of one job
#[derive(Debug)]
pub struct TransferResult {
    /// The job's remote path
    pub remote_path: String,
    /// Bytes moved by the successful attempt
    pub bytes_transferred: u64,
    /// Every attempt, in order
    pub attempts: Vec<Attempt>,
    /// Terminal error; `None` on success
    pub error: Option<Error>,
}

impl TransferResult {
    /// Whether the transfer succeeded
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Cooperative cancellation handle shared by the engine and its callers
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Fresh, uncancelled token
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signal cancellation to every holder
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether cancellation has been signalled
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is signalled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // An error means the sender is gone, which only happens at
        // engine teardown; treat it as cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

type QueuedJob = (TransferJob, oneshot::Sender<TransferResult>);

/// The worker pool
#[derive(Debug)]
pub struct TransferEngine {
    queue: mpsc::Sender<QueuedJob>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancelToken,
}

impl TransferEngine {
    /// Start an engine with the given worker count
    pub fn new(workers: usize, http: reqwest::Client, cancel: CancelToken) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<QueuedJob>(workers * 4);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers)
            .map(|id| {
                let rx = Arc::clone(&rx);
                let http = http.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    debug!(worker = id, "transfer worker started");
                    loop {
                        let job = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                job = rx.recv() => job,
                                _ = cancel.cancelled() => None,
                            }
                        };
                        let Some((job, reply)) = job else { break };
                        let result = run_job(&http, job, &cancel).await;
                        let _ = reply.send(result);
                    }
                    debug!(worker = id, "transfer worker stopped");
                })
            })
            .collect();

        Self {
            queue: tx,
            workers: handles,
            cancel,
        }
    }

    /// Engine with default worker count and a fresh HTTP client
    pub fn with_defaults(cancel: CancelToken) -> Self {
        Self::new(DEFAULT_WORKERS, reqwest::Client::new(), cancel)
    }

    /// Submit a job and wait for its result
    pub async fn submit(&self, job: TransferJob) -> Result<TransferResult> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (tx, rx) = oneshot::channel();
        self.queue
            .send((job, tx))
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Stop accepting jobs and wait for workers to finish
    pub async fn shutdown(self) {
        drop(self.queue);
        self.cancel.cancel();
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

/// Walk the candidate list until one attempt succeeds or the list is
/// exhausted.
async fn run_job(http: &reqwest::Client, job: TransferJob, cancel: &CancelToken) -> TransferResult {
    let mut attempts: Vec<Attempt> = Vec::new();

    if job.candidates.is_empty() {
        return TransferResult {
            remote_path: job.remote_path.clone(),
            bytes_transferred: 0,
            attempts,
            error: Some(Error::NoCandidates(job.remote_path)),
        };
    }

    for candidate in &job.candidates {
        if cancel.is_cancelled() {
            return TransferResult {
                remote_path: job.remote_path,
                bytes_transferred: 0,
                attempts,
                error: Some(Error::Cancelled),
            };
        }

        let started = Instant::now();
        let server = candidate
            .host_str()
            .map(str::to_string)
            .unwrap_or_else(|| candidate.to_string());
        let outcome = match job.direction {
            Direction::Get => attempt_get(http, candidate, &job.local, job.token.as_deref(), cancel).await,
            Direction::Put => attempt_put(http, candidate, &job.local, job.token.as_deref()).await,
        };
        let duration = started.elapsed();

        match outcome {
            Ok(bytes) => {
                info!(
                    object = %job.remote_path,
                    server = %server,
                    bytes,
                    ms = duration.as_millis() as u64,
                    "transfer complete"
                );
                attempts.push(Attempt {
                    server,
                    bytes,
                    duration,
                    error: None,
                });
                return TransferResult {
                    remote_path: job.remote_path,
                    bytes_transferred: bytes,
                    attempts,
                    error: None,
                };
            }
            Err(AttemptError::Fatal(error)) => {
                // A credential problem is not the server's fault; the
                // next candidate would reject it the same way.
                attempts.push(Attempt {
                    server,
                    bytes: 0,
                    duration,
                    error: Some(error.to_string()),
                });
                return TransferResult {
                    remote_path: job.remote_path,
                    bytes_transferred: 0,
                    attempts,
                    error: Some(error),
                };
            }
            Err(AttemptError::Eligible(reason)) => {
                warn!(
                    object = %job.remote_path,
                    server = %server,
                    reason = %reason,
                    "attempt failed; trying the next candidate"
                );
                attempts.push(Attempt {
                    server,
                    bytes: 0,
                    duration,
                    error: Some(reason),
                });
            }
        }
    }

    // Exhausted. A single failed attempt surfaces its own error
    // unwrapped; multiple attempts aggregate.
    let error = if attempts.len() == 1 {
        Error::Transfer(attempts[0].error.clone().unwrap_or_default())
    } else {
        let summary = attempts
            .iter()
            .map(|a| {
                format!(
                    "{}: {}",
                    a.server,
                    a.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        Error::Transfer(format!(
            "all {} attempts failed ({summary})",
            attempts.len()
        ))
    };
    TransferResult {
        remote_path: job.remote_path,
        bytes_transferred: 0,
        attempts,
        error: Some(error),
    }
}

/// Why an attempt failed, split by whether the next candidate is worth
/// trying.
enum AttemptError {
    /// Per-server failure; fall through to the next candidate
    Eligible(String),
    /// Failure that no other candidate can fix
    Fatal(Error),
}

async fn attempt_get(
    http: &reqwest::Client,
    url: &Url,
    local: &std::path::Path,
    token: Option<&str>,
    cancel: &CancelToken,
) -> std::result::Result<u64, AttemptError> {
    let mut req = http.get(url.clone());
    if let Some(token) = token {
        req = req.bearer_auth(token);
    }
    let resp = req
        .send()
        .await
        .map_err(|e| AttemptError::Eligible(format!("connection failed: {e}")))?;

    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(AttemptError::Fatal(Error::Forbidden(format!(
            "{url}: {status}"
        ))));
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unspecified");
        return Err(AttemptError::Eligible(format!(
            "server throttling, Retry-After: {retry_after}"
        )));
    }
    if !status.is_success() {
        return Err(AttemptError::Eligible(format!("status {status}")));
    }

    let expected_crc = resp
        .headers()
        .get("digest")
        .and_then(|v| v.to_str().ok())
        .and_then(|digest| {
            digest.split(',').find_map(|pair| {
                pair.trim()
                    .strip_prefix("crc32c=")
                    .map(|v| v.trim().to_string())
            })
        });

    let mut file = tokio::fs::File::create(local)
        .await
        .map_err(|e| AttemptError::Fatal(Error::Io(e)))?;
    let mut stream = resp.bytes_stream();
    let mut bytes: u64 = 0;
    let mut crc: u32 = 0;
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(AttemptError::Fatal(Error::Cancelled));
        }
        let chunk = chunk.map_err(|e| AttemptError::Eligible(format!("read failed: {e}")))?;
        crc = crc32c::crc32c_append(crc, &chunk);
        bytes += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| AttemptError::Fatal(Error::Io(e)))?;
    }
    file.flush()
        .await
        .map_err(|e| AttemptError::Fatal(Error::Io(e)))?;

    if let Some(expected) = expected_crc {
        let actual = format!("{crc:08x}");
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(AttemptError::Eligible(format!(
                "checksum mismatch: server reported crc32c={expected}, received {actual}"
            )));
        }
    }

    Ok(bytes)
}

async fn attempt_put(
    http: &reqwest::Client,
    url: &Url,
    local: &std::path::Path,
    token: Option<&str>,
) -> std::result::Result<u64, AttemptError> {
    let file = tokio::fs::File::open(local)
        .await
        .map_err(|e| AttemptError::Fatal(Error::Io(e)))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| AttemptError::Fatal(Error::Io(e)))?
        .len();

    let stream = tokio_util::io::ReaderStream::new(file);
    let body = reqwest::Body::wrap_stream(stream);

    let mut req = http
        .put(url.clone())
        .header(reqwest::header::CONTENT_LENGTH, size)
        .body(body);
    if let Some(token) = token {
        req = req.bearer_auth(token);
    }
    let resp = req
        .send()
        .await
        .map_err(|e| AttemptError::Eligible(format!("connection failed: {e}")))?;

    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(AttemptError::Fatal(Error::Forbidden(format!(
            "{url}: {status}"
        ))));
    }
    if !status.is_success() {
        return Err(AttemptError::Eligible(format!("status {status}")));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine() -> TransferEngine {
        TransferEngine::new(2, reqwest::Client::new(), CancelToken::new())
    }

    fn get_job(dir: &tempfile::TempDir, candidates: Vec<Url>) -> TransferJob {
        TransferJob {
            direction: Direction::Get,
            local: dir.path().join("out.txt"),
            remote_path: "/ns/hello_world.txt".to_string(),
            candidates,
            token: None,
        }
    }

    #[tokio::test]
    async fn test_get_success_with_checksum() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ns/hello_world.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("digest", "crc32c=4d551068")
                    .set_body_string("Hello, World!"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url = Url::parse(&format!("{}/ns/hello_world.txt", server.uri())).unwrap();
        let result = engine().submit(get_job(&dir, vec![url])).await.unwrap();
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.bytes_transferred, 13);
        assert_eq!(result.attempts.len(), 1);
        let content = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(content, "Hello, World!");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_falls_through() {
        let bad = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("digest", "crc32c=deadbeef")
                    .set_body_string("Hello, World!"),
            )
            .mount(&bad)
            .await;
        let good = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Hello, World!"))
            .mount(&good)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let candidates = vec![
            Url::parse(&format!("{}/ns/hello_world.txt", bad.uri())).unwrap(),
            Url::parse(&format!("{}/ns/hello_world.txt", good.uri())).unwrap(),
        ];
        let result = engine().submit(get_job(&dir, candidates)).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.attempts.len(), 2);
        assert!(result.attempts[0]
            .error
            .as_deref()
            .unwrap()
            .contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_fall_through_on_5xx() {
        let failing = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&failing)
            .await;
        let working = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("test file content"))
            .mount(&working)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let candidates = vec![
            Url::parse(&format!("{}/ns/f", failing.uri())).unwrap(),
            Url::parse(&format!("{}/ns/f", working.uri())).unwrap(),
        ];
        let result = engine().submit(get_job(&dir, candidates)).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.bytes_transferred, 17);
        assert_eq!(result.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_forbidden_aborts_candidate_walk() {
        let denying = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&denying)
            .await;
        let never_reached = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&never_reached)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let candidates = vec![
            Url::parse(&format!("{}/sec/f", denying.uri())).unwrap(),
            Url::parse(&format!("{}/sec/f", never_reached.uri())).unwrap(),
        ];
        let result = engine().submit(get_job(&dir, candidates)).await.unwrap();
        assert!(matches!(result.error, Some(Error::Forbidden(_))));
        assert_eq!(result.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_aggregates_attempts() {
        let a = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&a)
            .await;
        let b = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&b)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let candidates = vec![
            Url::parse(&format!("{}/ns/f", a.uri())).unwrap(),
            Url::parse(&format!("{}/ns/f", b.uri())).unwrap(),
        ];
        let result = engine().submit(get_job(&dir, candidates)).await.unwrap();
        assert!(!result.is_success());
        assert_eq!(result.attempts.len(), 2);
        let message = result.error.unwrap().to_string();
        assert!(message.contains("all 2 attempts failed"), "{message}");
    }

    #[tokio::test]
    async fn test_put_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/ns/up.txt"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("up.txt");
        std::fs::write(&local, "test file content").unwrap();

        let job = TransferJob {
            direction: Direction::Put,
            local,
            remote_path: "/ns/up.txt".to_string(),
            candidates: vec![Url::parse(&format!("{}/ns/up.txt", server.uri())).unwrap()],
            token: None,
        };
        let result = engine().submit(job).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.bytes_transferred, 17);
    }

    #[tokio::test]
    async fn test_cancelled_engine_rejects_jobs() {
        let cancel = CancelToken::new();
        let engine = TransferEngine::new(1, reqwest::Client::new(), cancel.clone());
        cancel.cancel();
        let dir = tempfile::tempdir().unwrap();
        let err = engine.submit(get_job(&dir, vec![])).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_candidates_is_no_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let result = engine().submit(get_job(&dir, vec![])).await.unwrap();
        assert!(matches!(result.error, Some(Error::NoCandidates(_))));
    }
}
