//! Source locator contracts + drive, SFTP and local-directory implementations,
//! and decoding of export bytes into raw records.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadrelay_core::{ExportFile, RawRecord, RawValue, Secret, SourceOrigin};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "leadrelay-adapters";

pub const DEFAULT_DRIVE_BASE_URL: &str = "https://www.googleapis.com/drive/v3";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid file pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("io error for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[cfg(feature = "sftp")]
    #[error("sftp error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("sftp worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed export content: {0}")]
    Csv(#[from] csv::Error),
    #[error("export has no header row")]
    MissingHeader,
}

/// Finds the newest export at one source and buffers its content.
#[async_trait]
pub trait SourceLocator: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch_latest(&self) -> Result<Option<ExportFile>, SourceError>;

    /// Connectivity, auth and listing failures all read as "no file".
    async fn locate_latest(&self) -> Option<ExportFile> {
        match self.fetch_latest().await {
            Ok(Some(file)) => {
                info!(source = %self.describe(), file = %file.name, bytes = file.content.len(), "located export file");
                Some(file)
            }
            Ok(None) => {
                warn!(source = %self.describe(), "no matching export file found");
                None
            }
            Err(err) => {
                warn!(source = %self.describe(), error = %err, "source unavailable; treating as no file");
                None
            }
        }
    }
}

/// File-name rule: substring prefix match or shell glob.
#[derive(Debug, Clone)]
pub enum NameMatcher {
    Contains(String),
    Glob(glob::Pattern),
}

impl NameMatcher {
    pub fn contains(prefix: impl Into<String>) -> Self {
        Self::Contains(prefix.into())
    }

    pub fn glob(pattern: &str) -> Result<Self, SourceError> {
        glob::Pattern::new(pattern)
            .map(Self::Glob)
            .map_err(|e| SourceError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })
    }

    /// Glob when the rule carries glob metacharacters, substring otherwise.
    pub fn parse(rule: &str) -> Result<Self, SourceError> {
        if rule.contains(['*', '?', '[']) {
            Self::glob(rule)
        } else {
            Ok(Self::contains(rule))
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Contains(prefix) => name.contains(prefix.as_str()),
            Self::Glob(pattern) => pattern.matches(name),
        }
    }
}

/// One listed directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub modified_at: Option<DateTime<Utc>>,
    pub location: PathBuf,
}

/// Newest matching entry; entries without a timestamp sort oldest, name breaks ties.
pub fn select_newest(candidates: Vec<Candidate>, matcher: &NameMatcher) -> Option<Candidate> {
    candidates
        .into_iter()
        .filter(|c| matcher.matches(&c.name))
        .max_by(|a, b| {
            a.modified_at
                .cmp(&b.modified_at)
                .then_with(|| a.name.cmp(&b.name))
        })
}

#[derive(Debug, Clone)]
pub struct DriveSettings {
    pub base_url: String,
    pub folder_id: String,
    pub prefix: String,
}

/// Drive v3 REST locator: newest non-trashed file in a folder whose name contains the prefix.
#[derive(Debug, Clone)]
pub struct DriveLocator {
    client: reqwest::Client,
    settings: DriveSettings,
    access_token: Option<Secret>,
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    modified_time: Option<DateTime<Utc>>,
}

fn escape_drive_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

impl DriveLocator {
    pub fn new(client: reqwest::Client, settings: DriveSettings, access_token: Option<Secret>) -> Self {
        Self {
            client,
            settings: DriveSettings {
                base_url: settings.base_url.trim_end_matches('/').to_string(),
                ..settings
            },
            access_token,
        }
    }

    pub fn query(&self) -> String {
        format!(
            "'{}' in parents and name contains '{}' and trashed = false",
            escape_drive_literal(&self.settings.folder_id),
            escape_drive_literal(&self.settings.prefix)
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) if !token.is_empty() => req.bearer_auth(token.expose()),
            _ => req,
        }
    }

    async fn newest_file(&self) -> Result<Option<DriveFile>, SourceError> {
        let url = format!("{}/files", self.settings.base_url);
        let query = self.query();
        let req = self.client.get(&url).query(&[
            ("q", query.as_str()),
            ("spaces", "drive"),
            ("fields", "files(id, name, modifiedTime)"),
            ("orderBy", "modifiedTime desc"),
            ("pageSize", "1"),
            ("supportsAllDrives", "true"),
            ("includeItemsFromAllDrives", "true"),
        ]);
        let resp = self.authorize(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let list: DriveFileList = resp.json().await?;
        Ok(list.files.into_iter().next())
    }

    async fn download(&self, file_id: &str) -> Result<Vec<u8>, SourceError> {
        let url = format!("{}/files/{}", self.settings.base_url, file_id);
        let req = self
            .client
            .get(&url)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")]);
        let resp = self.authorize(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl SourceLocator for DriveLocator {
    fn describe(&self) -> String {
        format!("drive folder {}", self.settings.folder_id)
    }

    async fn fetch_latest(&self) -> Result<Option<ExportFile>, SourceError> {
        let Some(file) = self.newest_file().await? else {
            return Ok(None);
        };
        info!(file = %file.name, file_id = %file.id, "latest drive file");
        let content = self.download(&file.id).await?;
        Ok(Some(ExportFile {
            name: file.name,
            modified_at: file.modified_time,
            origin: SourceOrigin::DriveFolder {
                folder_id: self.settings.folder_id.clone(),
                file_id: file.id,
            },
            content,
        }))
    }
}

/// Newest matching file in a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDirLocator {
    directory: PathBuf,
    matcher: NameMatcher,
}

impl LocalDirLocator {
    pub fn new(directory: impl Into<PathBuf>, matcher: NameMatcher) -> Self {
        Self {
            directory: directory.into(),
            matcher,
        }
    }

    async fn list(&self) -> Result<Vec<Candidate>, SourceError> {
        let io_err = |source: std::io::Error| SourceError::Io {
            path: self.directory.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.directory).await.map_err(io_err)?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let metadata = entry.metadata().await.map_err(io_err)?;
            if !metadata.is_file() {
                continue;
            }
            out.push(Candidate {
                name: entry.file_name().to_string_lossy().into_owned(),
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
                location: entry.path(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceLocator for LocalDirLocator {
    fn describe(&self) -> String {
        format!("local directory {}", self.directory.display())
    }

    async fn fetch_latest(&self) -> Result<Option<ExportFile>, SourceError> {
        let Some(newest) = select_newest(self.list().await?, &self.matcher) else {
            return Ok(None);
        };
        let content = tokio::fs::read(&newest.location)
            .await
            .map_err(|source| SourceError::Io {
                path: newest.location.clone(),
                source,
            })?;
        Ok(Some(ExportFile {
            name: newest.name,
            modified_at: newest.modified_at,
            origin: SourceOrigin::LocalDir {
                path: newest.location.display().to_string(),
            },
            content,
        }))
    }
}

/// Connection parameters for the SFTP drop, normally injected from the secret store.
#[derive(Debug, Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Secret,
    pub directory: String,
    pub timeout_secs: u64,
}

#[cfg(feature = "sftp")]
pub use sftp::SftpLocator;

#[cfg(feature = "sftp")]
mod sftp {
    use std::io::Read;
    use std::net::TcpStream;
    use std::path::Path;
    use std::time::Duration;

    use super::*;

    /// Newest file matching a glob in a remote SFTP directory.
    #[derive(Debug, Clone)]
    pub struct SftpLocator {
        settings: SftpSettings,
        matcher: NameMatcher,
    }

    impl SftpLocator {
        pub fn new(settings: SftpSettings, matcher: NameMatcher) -> Self {
            Self { settings, matcher }
        }
    }

    fn fetch_blocking(
        settings: &SftpSettings,
        matcher: &NameMatcher,
    ) -> Result<Option<ExportFile>, SourceError> {
        let remote_dir = Path::new(&settings.directory);
        let tcp = TcpStream::connect((settings.host.as_str(), settings.port)).map_err(|source| {
            SourceError::Io {
                path: remote_dir.to_path_buf(),
                source,
            }
        })?;
        let timeout = Duration::from_secs(settings.timeout_secs);
        tcp.set_read_timeout(Some(timeout))
            .map_err(|source| SourceError::Io {
                path: remote_dir.to_path_buf(),
                source,
            })?;

        let mut session = ssh2::Session::new()?;
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session.set_tcp_stream(tcp);
        session.handshake()?;
        session.userauth_password(&settings.username, settings.password.expose())?;

        let sftp = session.sftp()?;
        let candidates = sftp
            .readdir(remote_dir)?
            .into_iter()
            .filter(|(_, stat)| stat.is_file())
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                Some(Candidate {
                    name,
                    modified_at: stat
                        .mtime
                        .and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
                    location: path,
                })
            })
            .collect::<Vec<_>>();

        let Some(newest) = select_newest(candidates, matcher) else {
            return Ok(None);
        };

        let mut remote = sftp.open(&newest.location)?;
        let mut content = Vec::new();
        remote
            .read_to_end(&mut content)
            .map_err(|source| SourceError::Io {
                path: newest.location.clone(),
                source,
            })?;

        Ok(Some(ExportFile {
            name: newest.name,
            modified_at: newest.modified_at,
            origin: SourceOrigin::Sftp {
                path: newest.location.display().to_string(),
            },
            content,
        }))
    }

    #[async_trait]
    impl SourceLocator for SftpLocator {
        fn describe(&self) -> String {
            format!(
                "sftp {}@{}:{}{}",
                self.settings.username, self.settings.host, self.settings.port, self.settings.directory
            )
        }

        async fn fetch_latest(&self) -> Result<Option<ExportFile>, SourceError> {
            let settings = self.settings.clone();
            let matcher = self.matcher.clone();
            tokio::task::spawn_blocking(move || fetch_blocking(&settings, &matcher))
                .await
                .map_err(|e| SourceError::Worker(e.to_string()))?
        }
    }
}

/// UTF-8 (BOM stripped) with a Latin-1 fallback for legacy exports.
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Repeated header names get a `.N` suffix (`Email`, `Email.1`, ...) so no column is shadowed.
fn unique_headers(headers: &csv::StringRecord) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut counters: HashMap<&str, usize> = HashMap::new();
    let mut out = Vec::with_capacity(headers.len());
    for header in headers {
        let mut name = header.to_string();
        if seen.contains(&name) {
            let counter = counters.entry(header).or_insert(0);
            loop {
                *counter += 1;
                let candidate = format!("{header}.{counter}");
                if !seen.contains(&candidate) {
                    name = candidate;
                    break;
                }
            }
        }
        seen.insert(name.clone());
        out.push(name);
    }
    out
}

/// Parse delimiter-separated export content with a header row.
///
/// Empty cells become `RawValue::Null`; rows with no values at all are skipped.
pub fn parse_records(bytes: &[u8], delimiter: u8) -> Result<Vec<RawRecord>, DecodeError> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = unique_headers(reader.headers()?);
    if headers.is_empty() {
        return Err(DecodeError::MissingHeader);
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let record = headers
            .iter()
            .enumerate()
            .map(|(idx, header)| {
                let value = match row.get(idx) {
                    Some(cell) if !cell.trim().is_empty() => RawValue::text(cell),
                    _ => RawValue::Null,
                };
                (header.clone(), value)
            })
            .collect::<RawRecord>();
        if record.values().all(RawValue::is_null) {
            continue;
        }
        records.push(record);
    }
    Ok(records)
}
