//! Write-once snapshot files, rate-limited HTTP fetching and the storage
//! gateway for pull-request records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod gateway;

pub use gateway::{
    ContactUpdate, KeySchema, MemoryStore, MigrationOutcome, Page, PgStore, Store, StoreError,
    StoreResult, UpsertOutcome, WindowQuery,
};

pub const CRATE_NAME: &str = "prh-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    /// The file existed before this call and was left untouched.
    pub already_present: bool,
}

/// Directory of export artifacts. Every file is written at most once.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub async fn exists(&self, file_name: &str) -> anyhow::Result<bool> {
        let path = self.path_for(file_name);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking snapshot path {}", path.display()))
    }

    /// Publish `bytes` under `file_name` unless the file already exists.
    ///
    /// The content is staged in a temp file and hard-linked into place, so a
    /// concurrent writer either loses cleanly or wins with a complete file.
    pub async fn write_once(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredSnapshot> {
        let content_hash = sha256_hex(bytes);
        let absolute_path = self.path_for(file_name);
        let stored = |already_present| StoredSnapshot {
            file_name: file_name.to_string(),
            absolute_path: absolute_path.clone(),
            content_hash: content_hash.clone(),
            byte_size: bytes.len(),
            already_present,
        };

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating snapshot directory {}", self.root.display()))?;

        if self.exists(file_name).await? {
            return Ok(stored(true));
        }

        let temp_path = self.root.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        let linked = fs::hard_link(&temp_path, &absolute_path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(stored(true)),
            Err(err) => Err(err).with_context(|| {
                format!(
                    "publishing snapshot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            }),
        }
    }

    pub async fn read(&self, file_name: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(file_name);
        fs::read(&path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))
    }

    /// Returns whether a file was removed.
    pub async fn remove(&self, file_name: &str) -> anyhow::Result<bool> {
        let path = self.path_for(file_name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing snapshot {}", path.display())),
        }
    }

    /// File names in the directory, sorted. A missing directory is empty.
    pub async fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("listing snapshots in {}", self.root.display()))
            }
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing snapshots in {}", self.root.display()))?
        {
            if entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Honors a server-provided `Retry-After` (seconds), still capped.
    pub fn delay_with_hint(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_delay),
            None => self.delay_for_attempt(attempt_index),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub global_concurrency: usize,
    pub per_scope_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            global_concurrency: 4,
            per_scope_concurrency: 2,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Token bucket refilled by one token per `refill_every`.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<(u32, Instant)>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new((config.capacity.max(1), Instant::now())),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let mut guard = self.state.lock().await;
            let (tokens, last_refill) = &mut *guard;
            let interval_ms = self.refill_every.as_millis();
            if interval_ms > 0 {
                let refills = last_refill.elapsed().as_millis() / interval_ms;
                if refills > 0 {
                    let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                    *tokens = tokens.saturating_add(refills).min(self.capacity);
                    *last_refill = Instant::now();
                }
            } else {
                *tokens = self.capacity;
            }

            if *tokens > 0 {
                *tokens -= 1;
                return;
            }
            drop(guard);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 404, .. })
    }
}

/// Authenticated GET client bounded by concurrency limits, an optional token
/// bucket and exponential backoff. The request timeout bounds every call.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    bearer_token: Option<String>,
    global_limit: Arc<Semaphore>,
    per_scope_limit: usize,
    per_scope: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            bearer_token: config.bearer_token.filter(|t| !t.is_empty()),
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_scope_limit: config.per_scope_concurrency.max(1),
            per_scope: Mutex::new(HashMap::new()),
            rate_limiter: config.rate_limit.map(|c| Arc::new(RateLimiter::new(c))),
            backoff: config.backoff,
        })
    }

    async fn scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        let mut map = self.per_scope.lock().await;
        map.entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
            .clone()
    }

    /// GET `url` with the configured credential, retrying transient failures.
    ///
    /// `scope` groups requests sharing a per-scope concurrency bound (for
    /// example one repository).
    pub async fn fetch_bytes(
        &self,
        scope: &str,
        url: &str,
        accept: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", scope, url);
        self.fetch_with_retries(scope, url, accept).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        scope: &str,
        url: &str,
        accept: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_scope = self.scope_semaphore(scope).await;
        let _scope = per_scope.acquire().await.map_err(|_| FetchError::LimiterClosed)?;

        let mut attempt = 0usize;
        loop {
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            let mut request = self.client.get(url).header(ACCEPT, accept);
            if let Some(token) = &self.bearer_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let hint = resp
                            .headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(Duration::from_secs);
                        let delay = self.backoff.delay_with_hint(attempt, hint);
                        debug!(status = status.as_u16(), ?delay, attempt, "retrying request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(error = %err, ?delay, attempt, "retrying request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn second_write_leaves_the_first_snapshot_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("exports"));

        let first = store
            .write_once("export_prs_2024-06-10.json", b"[1]")
            .await
            .expect("first write");
        let second = store
            .write_once("export_prs_2024-06-10.json", b"[1,2]")
            .await
            .expect("second write");

        assert!(!first.already_present);
        assert!(second.already_present);
        let on_disk = store.read("export_prs_2024-06-10.json").await.expect("read");
        assert_eq!(on_disk, b"[1]");
        assert_eq!(
            store.list().await.expect("list"),
            vec!["export_prs_2024-06-10.json".to_string()]
        );
    }

    #[tokio::test]
    async fn remove_and_list_tolerate_missing_files() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("never-created"));
        assert!(store.list().await.expect("list").is_empty());
        assert!(!store.remove("rapport_2024-06-10.md").await.expect("remove"));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_secs(60))),
            Duration::from_millis(350)
        );
    }

    #[test]
    fn rate_limited_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert!(FetchError::HttpStatus {
            status: 404,
            url: "https://api.github.com/x".into()
        }
        .is_not_found());
    }

    #[tokio::test]
    async fn rate_limiter_hands_out_capacity_without_waiting() {
        let limiter = RateLimiter::new(RateLimitConfig {
            capacity: 3,
            refill_every: Duration::from_secs(3600),
        });
        let started = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
