//! Processed-file ledger backends + the resilient HTTP client used for lead dispatch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use leadrelay_core::{NormalizedLead, Secret};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadrelay-storage";

pub const DEFAULT_LEDGER_BUCKET: &str = "automatic_processes_bucket";
pub const DEFAULT_LEDGER_PREFIX: &str = "KWF_leads/processed_files/";
pub const DEFAULT_GCS_BASE_URL: &str = "https://storage.googleapis.com";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ledger returned http status {status} for {key}")]
    HttpStatus { status: u16, key: String },
    #[error("invalid ledger url {0}")]
    InvalidUrl(String),
    #[error("ledger io error for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Durable file-name -> processed marker store.
///
/// A marker's existence is the only record that a file was forwarded in full.
/// Writing an existing marker again is an overwrite, never an error.
#[async_trait]
pub trait ProcessedLedger: Send + Sync {
    async fn exists(&self, file_name: &str) -> Result<bool, LedgerError>;
    async fn record(&self, file_name: &str) -> Result<(), LedgerError>;
}

/// Namespaced object key for a file's marker.
pub fn marker_key(prefix: &str, file_name: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        format!("{prefix}{file_name}")
    } else {
        format!("{prefix}/{file_name}")
    }
}

/// Zero-byte marker files under a local directory.
#[derive(Debug, Clone)]
pub struct LocalLedger {
    root: PathBuf,
    prefix: String,
}

impl LocalLedger {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    pub fn marker_path(&self, file_name: &str) -> PathBuf {
        self.root.join(marker_key(&self.prefix, file_name))
    }
}

#[async_trait]
impl ProcessedLedger for LocalLedger {
    async fn exists(&self, file_name: &str) -> Result<bool, LedgerError> {
        let path = self.marker_path(file_name);
        fs::try_exists(&path)
            .await
            .map_err(|source| LedgerError::Io { path, source })
    }

    /// Create the marker through a temp file + rename so a crash never leaves a partial marker.
    async fn record(&self, file_name: &str) -> Result<(), LedgerError> {
        let marker_path = self.marker_path(file_name);
        let parent = marker_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .map_err(|source| LedgerError::Io {
                path: parent.clone(),
                source,
            })?;

        let temp_path = parent.join(format!(".{}.marker.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|source| LedgerError::Io {
                path: temp_path.clone(),
                source,
            })?;
        file.flush().await.map_err(|source| LedgerError::Io {
            path: temp_path.clone(),
            source,
        })?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &marker_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(LedgerError::Io {
                path: marker_path,
                source,
            });
        }
        debug!(marker = %marker_path.display(), "recorded processed marker");
        Ok(())
    }
}

/// Markers stored as empty objects in a Google Cloud Storage bucket (JSON API).
#[derive(Debug, Clone)]
pub struct GcsLedger {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    prefix: String,
    access_token: Option<Secret>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcsLedgerConfig {
    #[serde(default = "default_gcs_base_url")]
    pub base_url: String,
    #[serde(default = "default_ledger_bucket")]
    pub bucket: String,
    #[serde(default = "default_ledger_prefix")]
    pub prefix: String,
}

impl Default for GcsLedgerConfig {
    fn default() -> Self {
        Self {
            base_url: default_gcs_base_url(),
            bucket: default_ledger_bucket(),
            prefix: default_ledger_prefix(),
        }
    }
}

fn default_gcs_base_url() -> String {
    DEFAULT_GCS_BASE_URL.to_string()
}

fn default_ledger_bucket() -> String {
    DEFAULT_LEDGER_BUCKET.to_string()
}

fn default_ledger_prefix() -> String {
    DEFAULT_LEDGER_PREFIX.to_string()
}

impl GcsLedger {
    pub fn new(
        client: reqwest::Client,
        config: GcsLedgerConfig,
        access_token: Option<Secret>,
    ) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bucket: config.bucket,
            prefix: config.prefix,
            access_token,
        }
    }

    fn url_with_segments(&self, segments: &[&str]) -> Result<Url, LedgerError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|_| LedgerError::InvalidUrl(self.base_url.clone()))?;
        url.path_segments_mut()
            .map_err(|_| LedgerError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) if !token.is_empty() => req.bearer_auth(token.expose()),
            _ => req,
        }
    }
}

#[async_trait]
impl ProcessedLedger for GcsLedger {
    async fn exists(&self, file_name: &str) -> Result<bool, LedgerError> {
        let key = marker_key(&self.prefix, file_name);
        let url = self.url_with_segments(&["storage", "v1", "b", self.bucket.as_str(), "o", key.as_str()])?;
        let resp = self.authorize(self.client.get(url)).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(LedgerError::HttpStatus {
                status: s.as_u16(),
                key,
            }),
        }
    }

    async fn record(&self, file_name: &str) -> Result<(), LedgerError> {
        let key = marker_key(&self.prefix, file_name);
        let url = self.url_with_segments(&["upload", "storage", "v1", "b", self.bucket.as_str(), "o"])?;
        let req = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", key.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(Vec::new());
        let resp = self.authorize(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(LedgerError::HttpStatus {
                status: status.as_u16(),
                key,
            });
        }
        debug!(bucket = %self.bucket, key = %key, "recorded processed marker");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only gateway-style server errors are worth another attempt.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn method_allows_retry(method: &Method) -> bool {
    *method == Method::GET || *method == Method::POST
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub timeout_secs: u64,
    pub user_agent: Option<String>,
    pub pool_max_idle_per_host: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            user_agent: Some(format!("leadrelay/{}", env!("CARGO_PKG_VERSION"))),
            pool_max_idle_per_host: 50,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    /// One pooled client, shared by every worker for the life of the process.
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(self.timeout_secs))
            .pool_max_idle_per_host(self.pool_max_idle_per_host);

        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        builder.build().context("building reqwest client")
    }
}

/// Raw status/body of an ingestion call that produced a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResponse {
    pub status: StatusCode,
    pub body: String,
}

impl DispatchResponse {
    /// 2xx and no application error marker in the body.
    pub fn is_accepted(&self) -> bool {
        self.status.is_success() && !self.body.contains("ERROR")
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request failed after {attempts} attempt(s): {source}")]
    Request {
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} after {attempts} attempt(s)")]
    RetriesExhausted { status: u16, attempts: usize },
}

/// Issues one ingestion call per lead with bounded retry/backoff.
#[derive(Debug, Clone)]
pub struct DispatchClient {
    client: reqwest::Client,
    api_url: String,
    backoff: BackoffPolicy,
}

impl DispatchClient {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            backoff,
        }
    }

    /// Send the lead's parameters as a GET query string.
    ///
    /// A response that arrives is returned as-is, even when it carries an
    /// application error; only transport errors and retryable 5xx statuses
    /// are retried.
    pub async fn send(&self, lead: &NormalizedLead) -> Result<DispatchResponse, DispatchError> {
        let span = info_span!("dispatch_lead", url = %self.api_url, fields = lead.len());
        self.send_with_retry(Method::GET, lead).instrument(span).await
    }

    async fn send_with_retry(
        &self,
        method: Method,
        lead: &NormalizedLead,
    ) -> Result<DispatchResponse, DispatchError> {
        let may_retry = method_allows_retry(&method);
        let mut attempt = 0usize;

        loop {
            let attempts = attempt + 1;
            let can_retry = may_retry && attempt < self.backoff.max_retries;
            let resp_result = self
                .client
                .request(method.clone(), &self.api_url)
                .query(&lead.params)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable {
                        if can_retry {
                            warn!(status = status.as_u16(), attempt = attempts, "retryable status from ingestion endpoint");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(DispatchError::RetriesExhausted {
                            status: status.as_u16(),
                            attempts,
                        });
                    }

                    let body = resp
                        .text()
                        .await
                        .map_err(|source| DispatchError::Request {
                            attempts,
                            source: source.without_url(),
                        })?;
                    debug!(status = status.as_u16(), body = %body, "ingestion response");
                    return Ok(DispatchResponse { status, body });
                }
                Err(err) => {
                    // The request URL carries the API key in its query string.
                    let err = err.without_url();
                    if can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable {
                        warn!(error = %err, attempt = attempts, "transport error calling ingestion endpoint");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(DispatchError::Request {
                        attempts,
                        source: err,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path as AxumPath, Query, State};
    use axum::routing::{get, post};
    use axum::Router;
    use tempfile::tempdir;

    use super::*;

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn lead(pairs: &[(&str, &str)]) -> NormalizedLead {
        NormalizedLead {
            params: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn marker_key_joins_prefix_once() {
        assert_eq!(marker_key("KWF_leads/processed_files/", "a.csv"), "KWF_leads/processed_files/a.csv");
        assert_eq!(marker_key("processed", "a.csv"), "processed/a.csv");
        assert_eq!(marker_key("", "a.csv"), "a.csv");
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
    }

    #[test]
    fn only_gateway_errors_are_retryable() {
        for code in [500u16, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status), RetryDisposition::Retryable);
        }
        for code in [200u16, 400, 404, 429, 501] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status), RetryDisposition::NonRetryable);
        }
        assert!(method_allows_retry(&Method::GET));
        assert!(method_allows_retry(&Method::POST));
        assert!(!method_allows_retry(&Method::DELETE));
    }

    #[test]
    fn acceptance_requires_2xx_without_error_marker() {
        let ok = DispatchResponse { status: StatusCode::OK, body: "OK".into() };
        let logical = DispatchResponse { status: StatusCode::OK, body: "ERROR - DUPLICATE".into() };
        let rejected = DispatchResponse { status: StatusCode::BAD_REQUEST, body: "bad".into() };
        assert!(ok.is_accepted());
        assert!(!logical.is_accepted());
        assert!(!rejected.is_accepted());
    }

    #[tokio::test]
    async fn local_ledger_records_idempotently() {
        let dir = tempdir().expect("tempdir");
        let ledger = LocalLedger::new(dir.path(), DEFAULT_LEDGER_PREFIX);

        assert!(!ledger.exists("export.csv").await.unwrap());
        ledger.record("export.csv").await.unwrap();
        assert!(ledger.exists("export.csv").await.unwrap());
        ledger.record("export.csv").await.unwrap();
        assert!(ledger.exists("export.csv").await.unwrap());

        let marker = ledger.marker_path("export.csv");
        assert_eq!(std::fs::metadata(&marker).unwrap().len(), 0);
        assert!(marker.starts_with(dir.path().join("KWF_leads/processed_files")));
    }

    #[tokio::test]
    async fn dispatch_retries_server_errors_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new().route(
            "/ingest",
            get({
                let hits = hits.clone();
                move |Query(q): Query<HashMap<String, String>>| {
                    let hits = hits.clone();
                    async move {
                        let n = hits.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy".to_string())
                        } else {
                            (axum::http::StatusCode::OK, format!("OK {}", q["phone_number"]))
                        }
                    }
                }
            }),
        );
        let base = spawn_server(router).await;
        let client = DispatchClient::new(reqwest::Client::new(), format!("{base}/ingest"), fast_backoff());

        let resp = client.send(&lead(&[("phone_number", "0612345678")])).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, "OK 0612345678");
        assert!(resp.is_accepted());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dispatch_gives_up_after_retry_budget() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new().route(
            "/ingest",
            get({
                let hits = hits.clone();
                move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        (axum::http::StatusCode::BAD_GATEWAY, "down".to_string())
                    }
                }
            }),
        );
        let base = spawn_server(router).await;
        let client = DispatchClient::new(reqwest::Client::new(), format!("{base}/ingest"), fast_backoff());

        let err = client.send(&lead(&[])).await.unwrap_err();
        assert!(matches!(err, DispatchError::RetriesExhausted { status: 502, attempts: 4 }));
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn dispatch_does_not_retry_logical_errors() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new().route(
            "/ingest",
            get({
                let hits = hits.clone();
                move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "ERROR - DUPLICATE - phone exists"
                    }
                }
            }),
        );
        let base = spawn_server(router).await;
        let client = DispatchClient::new(reqwest::Client::new(), format!("{base}/ingest"), fast_backoff());

        let resp = client.send(&lead(&[])).await.unwrap();
        assert!(!resp.is_accepted());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_errors_do_not_leak_query_credentials() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = DispatchClient::new(reqwest::Client::new(), format!("http://{addr}/ingest"), fast_backoff());

        let err = client.send(&lead(&[("api_key", "s3cret")])).await.unwrap_err();
        assert!(matches!(err, DispatchError::Request { attempts: 4, .. }));
        let debug = format!("{err:?}");
        let chain = format!("{:#}", anyhow::Error::from(err));
        let rendered = format!("{debug} {chain}");
        assert!(!rendered.contains("s3cret"), "{rendered}");
    }

    #[derive(Clone, Default)]
    struct FakeBucket {
        objects: Arc<Mutex<HashSet<String>>>,
    }

    async fn fake_get_object(
        State(bucket): State<FakeBucket>,
        AxumPath((_bucket, object)): AxumPath<(String, String)>,
    ) -> axum::http::StatusCode {
        if bucket.objects.lock().unwrap().contains(&object) {
            axum::http::StatusCode::OK
        } else {
            axum::http::StatusCode::NOT_FOUND
        }
    }

    async fn fake_upload_object(
        State(bucket): State<FakeBucket>,
        Query(q): Query<HashMap<String, String>>,
        body: axum::body::Bytes,
    ) -> axum::http::StatusCode {
        assert_eq!(q.get("uploadType").map(String::as_str), Some("media"));
        assert!(body.is_empty());
        bucket.objects.lock().unwrap().insert(q["name"].clone());
        axum::http::StatusCode::OK
    }

    #[tokio::test]
    async fn gcs_ledger_checks_and_records_namespaced_markers() {
        let bucket = FakeBucket::default();
        let router = Router::new()
            .route("/storage/v1/b/{bucket}/o/{object}", get(fake_get_object))
            .route("/upload/storage/v1/b/{bucket}/o", post(fake_upload_object))
            .with_state(bucket.clone());
        let base = spawn_server(router).await;

        let ledger = GcsLedger::new(
            reqwest::Client::new(),
            GcsLedgerConfig {
                base_url: base,
                ..GcsLedgerConfig::default()
            },
            Some(Secret::new("token")),
        );

        assert!(!ledger.exists("KWF-D2D-KWFexport.csv").await.unwrap());
        ledger.record("KWF-D2D-KWFexport.csv").await.unwrap();
        assert!(ledger.exists("KWF-D2D-KWFexport.csv").await.unwrap());
        assert!(bucket
            .objects
            .lock()
            .unwrap()
            .contains("KWF_leads/processed_files/KWF-D2D-KWFexport.csv"));
    }
}
