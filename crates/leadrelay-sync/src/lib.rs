//! Lead relay pipeline: locate -> ledger guard -> normalize -> batch upload -> commit.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use leadrelay_adapters::{
    parse_records, DriveLocator, DriveSettings, LocalDirLocator, NameMatcher, SftpSettings,
    SourceLocator, DEFAULT_DRIVE_BASE_URL,
};
use leadrelay_core::{
    BatchRunSummary, DispatchResult, NormalizedLead, RawRecord, RawValue, RunOutcome, Secret,
    SkipReason, EXCEPTION_CATEGORY,
};
use leadrelay_storage::{
    DispatchClient, GcsLedger, GcsLedgerConfig, HttpClientConfig, LocalLedger, ProcessedLedger,
    DEFAULT_LEDGER_PREFIX,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadrelay-sync";

/// Derived field that always carries the canonical phone number.
pub const PHONE_NUMBER_FIELD: &str = "phone_number";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Constant request parameter as written in the config file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConstParam {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ConstParam {
    pub fn to_param(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OptInMapping {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneMode {
    /// Zero-padded to the configured width.
    ZeroPadded,
    /// Digits only, country code or trunk zero stripped.
    National,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSettings {
    Drive {
        #[serde(default = "default_drive_base_url")]
        base_url: String,
    },
    Sftp {
        #[serde(default)]
        pattern: Option<String>,
    },
    Local {
        directory: PathBuf,
    },
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self::Drive {
            base_url: default_drive_base_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerSettings {
    Gcs(GcsLedgerConfig),
    Local {
        root: PathBuf,
        #[serde(default = "default_ledger_prefix")]
        prefix: String,
    },
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self::Gcs(GcsLedgerConfig::default())
    }
}

/// Process configuration, loaded once at start-up and read-only afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub api_url: String,
    #[serde(default)]
    pub common_api_params: BTreeMap<String, ConstParam>,
    #[serde(default)]
    pub allowed_fields: BTreeSet<String>,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default)]
    pub log_file_prefix: Option<String>,
    #[serde(default = "default_api_key_param")]
    pub api_key_param: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_chunk_pause_ms")]
    pub chunk_pause_ms: u64,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_phone_field")]
    pub phone_field: String,
    #[serde(default = "default_phone_width")]
    pub phone_width: usize,
    #[serde(default = "default_phone_placeholder")]
    pub phone_placeholder: String,
    #[serde(default)]
    pub phone_mode: Option<PhoneMode>,
    #[serde(default = "default_contract_amount_field")]
    pub contract_amount_field: String,
    #[serde(default = "default_legacy_amount_field")]
    pub legacy_amount_field: String,
    #[serde(default = "default_opt_in_fields")]
    pub opt_in_fields: Vec<OptInMapping>,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub http: HttpClientConfig,
}

fn default_drive_base_url() -> String {
    DEFAULT_DRIVE_BASE_URL.to_string()
}

fn default_ledger_prefix() -> String {
    DEFAULT_LEDGER_PREFIX.to_string()
}

fn default_file_prefix() -> String {
    "KWF-D2D-KWFexport".to_string()
}

fn default_api_key_param() -> String {
    "api_key".to_string()
}

fn default_chunk_size() -> usize {
    20
}

fn default_max_workers() -> usize {
    50
}

fn default_chunk_pause_ms() -> u64 {
    1000
}

fn default_delimiter() -> char {
    ';'
}

fn default_phone_field() -> String {
    "TelefoonnrPrive1".to_string()
}

fn default_phone_width() -> usize {
    10
}

fn default_phone_placeholder() -> String {
    "0000000000".to_string()
}

fn default_contract_amount_field() -> String {
    "OvereenkomstBedragPerPeriode".to_string()
}

fn default_legacy_amount_field() -> String {
    "Oudbedragcustom".to_string()
}

fn default_opt_in_fields() -> Vec<OptInMapping> {
    [
        ("OptInTelefoon", "OptOutTelefoon"),
        ("OptInSMS", "OptOutSMS"),
        ("OptInEmail", "OptOutEmail"),
    ]
    .into_iter()
    .map(|(source, target)| OptInMapping {
        source: source.to_string(),
        target: target.to_string(),
    })
    .collect()
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str_at(&text, path)
    }

    /// Parse JSON or YAML config text.
    pub fn from_str_at(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("LEADRELAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./config.json"));
        Self::load(path)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid("api_url must not be empty".into()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1".into()));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if !self.delimiter.is_ascii() {
            return Err(ConfigError::Invalid(format!(
                "delimiter {:?} must be a single ASCII character",
                self.delimiter
            )));
        }
        if matches!(self.source, SourceSettings::Drive { .. }) && self.folder_id.is_none() {
            return Err(ConfigError::Invalid("folder_id is required for the drive source".into()));
        }
        Ok(())
    }

    /// SFTP exports arrive with international/float-mangled numbers, so they default to national form.
    pub fn effective_phone_mode(&self) -> PhoneMode {
        self.phone_mode.unwrap_or(match self.source {
            SourceSettings::Sftp { .. } => PhoneMode::National,
            _ => PhoneMode::ZeroPadded,
        })
    }

    pub fn normalizer_settings(&self) -> NormalizerSettings {
        NormalizerSettings {
            phone_field: self.phone_field.clone(),
            phone_width: self.phone_width,
            phone_placeholder: self.phone_placeholder.clone(),
            phone_mode: self.effective_phone_mode(),
            contract_amount_field: self.contract_amount_field.clone(),
            legacy_amount_field: self.legacy_amount_field.clone(),
            opt_in_fields: self.opt_in_fields.clone(),
        }
    }

    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            chunk_size: self.chunk_size,
            max_workers: self.max_workers,
            chunk_pause: Duration::from_millis(self.chunk_pause_ms),
        }
    }

    /// Config constants plus the API credential; this is the base every lead is merged onto.
    pub fn common_params(&self, secrets: &Secrets) -> BTreeMap<String, String> {
        let mut params = self
            .common_api_params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_param()))
            .collect::<BTreeMap<_, _>>();
        if let Some(api_key) = &secrets.api_key {
            params.insert(self.api_key_param.clone(), api_key.expose().to_string());
        }
        params
    }
}

/// Credentials injected by the secret store at start-up. Never logged in cleartext.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub api_key: Option<Secret>,
    pub google_access_token: Option<Secret>,
    pub sftp: Option<SftpSettings>,
}

/// `SFTP_PORT`; unset means 22, anything that is not a port number is rejected.
pub fn sftp_port(raw: Option<&str>) -> Result<u16, ConfigError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(22),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("SFTP_PORT {value:?} is not a valid port"))),
    }
}

impl Secrets {
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .map(Secret::new)
        };
        let sftp = match std::env::var("SFTP_HOST") {
            Ok(host) => Some(SftpSettings {
                host,
                port: sftp_port(std::env::var("SFTP_PORT").ok().as_deref())?,
                username: std::env::var("SFTP_USERNAME").unwrap_or_default(),
                password: secret("SFTP_PASSWORD").unwrap_or_default(),
                directory: std::env::var("SFTP_DIRECTORY").unwrap_or_else(|_| "/".to_string()),
                timeout_secs: 20,
            }),
            Err(_) => None,
        };
        Ok(Self {
            api_key: secret("LEADRELAY_API_KEY"),
            google_access_token: secret("GOOGLE_ACCESS_TOKEN"),
            sftp,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NormalizerSettings {
    pub phone_field: String,
    pub phone_width: usize,
    pub phone_placeholder: String,
    pub phone_mode: PhoneMode,
    pub contract_amount_field: String,
    pub legacy_amount_field: String,
    pub opt_in_fields: Vec<OptInMapping>,
}

/// Left-pad with zeros; restores a leading zero lost to numeric parsing upstream.
pub fn zero_pad(phone: &str, width: usize) -> String {
    format!("{phone:0>width$}")
}

/// Digits-only national form: float artifact, country code `31` or one trunk `0` removed.
pub fn national_phone(phone: &str) -> String {
    let trimmed = phone.trim();
    let trimmed = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    let digits = trimmed
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>();
    if let Some(rest) = digits.strip_prefix("31") {
        rest.to_string()
    } else if let Some(rest) = digits.strip_prefix('0') {
        rest.to_string()
    } else {
        digits
    }
}

/// `"Yes"` opts in (opt-out `"N"`), `"No"` opts out (`"Y"`); anything else is left alone.
pub fn opt_out_flag(opt_in: &RawValue) -> Option<&'static str> {
    match opt_in {
        RawValue::Text(s) if s == "Yes" => Some("N"),
        RawValue::Text(s) if s == "No" => Some("Y"),
        _ => None,
    }
}

/// Maps one raw export row onto the parameter set the ingestion API accepts.
///
/// Pure: output depends only on the row, the allow-list and the common params.
#[derive(Debug, Clone)]
pub struct Normalizer {
    settings: NormalizerSettings,
    allowed_fields: BTreeSet<String>,
    common_params: BTreeMap<String, String>,
}

impl Normalizer {
    pub fn new(
        settings: NormalizerSettings,
        allowed_fields: BTreeSet<String>,
        common_params: BTreeMap<String, String>,
    ) -> Self {
        Self {
            settings,
            allowed_fields,
            common_params,
        }
    }

    pub fn normalize(&self, raw: &RawRecord) -> NormalizedLead {
        let mut record = strip_field_name_spaces(raw);
        let phone = self.apply_phone(&mut record);
        self.apply_contract_amount(&mut record);
        self.apply_opt_outs(&mut record);

        let mut params = self.common_params.clone();
        params.extend(self.filter_allowed(&record));
        if let Some(phone) = phone {
            params.insert(PHONE_NUMBER_FIELD.to_string(), phone);
        }
        NormalizedLead { params }
    }

    fn apply_phone(&self, record: &mut RawRecord) -> Option<String> {
        let raw_phone = record.get(&self.settings.phone_field)?;
        let phone = raw_phone
            .to_param()
            .unwrap_or_else(|| self.settings.phone_placeholder.clone());
        let phone = zero_pad(&phone, self.settings.phone_width);
        let phone = match self.settings.phone_mode {
            PhoneMode::ZeroPadded => phone,
            PhoneMode::National => national_phone(&phone),
        };
        record.insert(self.settings.phone_field.clone(), RawValue::text(phone.clone()));
        record.insert(PHONE_NUMBER_FIELD.to_string(), RawValue::text(phone.clone()));
        Some(phone)
    }

    fn apply_contract_amount(&self, record: &mut RawRecord) {
        if let Some(amount) = record.get(&self.settings.contract_amount_field).cloned() {
            record.insert(self.settings.legacy_amount_field.clone(), amount);
        }
    }

    fn apply_opt_outs(&self, record: &mut RawRecord) {
        for mapping in &self.settings.opt_in_fields {
            let flag = record.get(&mapping.source).and_then(opt_out_flag);
            if let Some(flag) = flag {
                record.insert(mapping.target.clone(), RawValue::text(flag));
            }
        }
    }

    fn filter_allowed(&self, record: &RawRecord) -> BTreeMap<String, String> {
        record
            .iter()
            .filter(|(key, _)| self.allowed_fields.contains(key.as_str()))
            .filter_map(|(key, value)| value.to_param().map(|v| (key.clone(), v)))
            .collect()
    }
}

fn strip_field_name_spaces(raw: &RawRecord) -> RawRecord {
    raw.iter()
        .map(|(key, value)| (key.replace(' ', ""), value.clone()))
        .collect()
}

/// Performs the remote call for one lead.
#[async_trait]
pub trait LeadDispatcher: Send + Sync {
    async fn dispatch(&self, lead: NormalizedLead) -> Result<DispatchResult>;
}

#[async_trait]
impl LeadDispatcher for DispatchClient {
    async fn dispatch(&self, lead: NormalizedLead) -> Result<DispatchResult> {
        let response = self.send(&lead).await?;
        if response.is_accepted() {
            Ok(DispatchResult::accepted(lead))
        } else {
            Ok(DispatchResult::rejected(lead, response.body))
        }
    }
}

/// Split `"CATEGORY - detail"` on the first separator; text without one is its own category.
pub fn split_error_text(raw: &str) -> (String, String) {
    match raw.split_once(" - ") {
        Some((category, detail)) => (category.trim().to_string(), detail.trim().to_string()),
        None => (raw.trim().to_string(), raw.trim().to_string()),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UploadSettings {
    pub chunk_size: usize,
    pub max_workers: usize,
    pub chunk_pause: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_size: 20,
            max_workers: 50,
            chunk_pause: Duration::from_secs(1),
        }
    }
}

/// Uploads leads chunk by chunk; each chunk fully resolves before the next starts.
pub struct BatchUploader {
    dispatcher: Arc<dyn LeadDispatcher>,
    settings: UploadSettings,
}

impl BatchUploader {
    pub fn new(dispatcher: Arc<dyn LeadDispatcher>, settings: UploadSettings) -> Self {
        Self {
            dispatcher,
            settings,
        }
    }

    /// Per-lead failures are counted, never raised. A task that dies (panic or
    /// cancellation) aborts the whole batch.
    pub async fn upload(&self, leads: Vec<NormalizedLead>) -> Result<BatchRunSummary> {
        let chunk_size = self.settings.chunk_size.max(1);
        let workers = Arc::new(Semaphore::new(self.settings.max_workers.max(1)));
        let chunk_count = leads.len().div_ceil(chunk_size);
        let mut summary = BatchRunSummary::default();

        for (index, chunk) in leads.chunks(chunk_size).enumerate() {
            if index > 0 && !self.settings.chunk_pause.is_zero() {
                tokio::time::sleep(self.settings.chunk_pause).await;
            }
            info!(chunk = index + 1, chunks = chunk_count, leads = chunk.len(), "uploading chunk");

            let mut tasks = JoinSet::new();
            for lead in chunk.iter().cloned() {
                let permit = Arc::clone(&workers)
                    .acquire_owned()
                    .await
                    .context("worker pool closed")?;
                let dispatcher = Arc::clone(&self.dispatcher);
                tasks.spawn(async move {
                    let _permit = permit;
                    dispatcher.dispatch(lead).await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let outcome = joined.context("dispatch task aborted")?;
                Self::tally(&mut summary, outcome);
            }
        }

        Ok(summary)
    }

    fn tally(summary: &mut BatchRunSummary, outcome: Result<DispatchResult>) {
        match outcome {
            Ok(result) if result.success => summary.record_success(),
            Ok(result) => {
                let raw = result.error.unwrap_or_default();
                let (category, detail) = split_error_text(&raw);
                warn!(category = %category, detail = %detail, "lead upload failed");
                summary.record_failure(category, detail);
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "lead upload raised");
                summary.record_failure(EXCEPTION_CATEGORY, format!("{err:#}"));
            }
        }
    }
}

/// Composes locator, ledger, normalizer and uploader into one invocation.
pub struct Pipeline {
    locator: Arc<dyn SourceLocator>,
    ledger: Arc<dyn ProcessedLedger>,
    normalizer: Normalizer,
    uploader: BatchUploader,
    delimiter: u8,
}

impl Pipeline {
    pub fn new(
        locator: Arc<dyn SourceLocator>,
        ledger: Arc<dyn ProcessedLedger>,
        normalizer: Normalizer,
        uploader: BatchUploader,
        delimiter: u8,
    ) -> Self {
        Self {
            locator,
            ledger,
            normalizer,
            uploader,
            delimiter,
        }
    }

    /// Wire the production collaborators; one pooled HTTP client is shared by all of them.
    pub fn from_config(config: &PipelineConfig, secrets: &Secrets) -> Result<Self> {
        let client = config.http.build_client()?;
        let dispatcher = DispatchClient::new(client.clone(), config.api_url.clone(), config.http.backoff);

        let locator: Arc<dyn SourceLocator> = match &config.source {
            SourceSettings::Drive { base_url } => Arc::new(DriveLocator::new(
                client.clone(),
                DriveSettings {
                    base_url: base_url.clone(),
                    folder_id: config
                        .folder_id
                        .clone()
                        .context("folder_id is required for the drive source")?,
                    prefix: config.file_prefix.clone(),
                },
                secrets.google_access_token.clone(),
            )),
            SourceSettings::Sftp { pattern } => sftp_locator(config, secrets, pattern.as_deref())?,
            SourceSettings::Local { directory } => Arc::new(LocalDirLocator::new(
                directory.clone(),
                NameMatcher::parse(&config.file_prefix)?,
            )),
        };

        let ledger: Arc<dyn ProcessedLedger> = match &config.ledger {
            LedgerSettings::Gcs(gcs) => Arc::new(GcsLedger::new(
                client,
                gcs.clone(),
                secrets.google_access_token.clone(),
            )),
            LedgerSettings::Local { root, prefix } => {
                Arc::new(LocalLedger::new(root.clone(), prefix.clone()))
            }
        };

        let normalizer = Normalizer::new(
            config.normalizer_settings(),
            config.allowed_fields.clone(),
            config.common_params(secrets),
        );
        let uploader = BatchUploader::new(Arc::new(dispatcher), config.upload_settings());

        Ok(Self::new(locator, ledger, normalizer, uploader, config.delimiter as u8))
    }

    pub async fn run_once(&self) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<RunOutcome> {
        info!(source = %self.locator.describe(), "starting pipeline run");

        let Some(file) = self.locator.locate_latest().await else {
            return Ok(RunOutcome::Skipped {
                reason: SkipReason::NoFileFound,
                file_name: None,
            });
        };
        if file.is_empty() {
            warn!(file = %file.name, "export file is empty; skipping");
            return Ok(RunOutcome::Skipped {
                reason: SkipReason::EmptyFile,
                file_name: Some(file.name),
            });
        }

        if self
            .ledger
            .exists(&file.name)
            .await
            .with_context(|| format!("checking ledger for {}", file.name))?
        {
            error!(file = %file.name, "file has already been processed");
            return Ok(RunOutcome::Skipped {
                reason: SkipReason::AlreadyProcessed,
                file_name: Some(file.name),
            });
        }

        let records = parse_records(&file.content, self.delimiter)
            .with_context(|| format!("parsing export {}", file.name))?;
        if records.is_empty() {
            warn!(file = %file.name, "export file has no data rows; skipping");
            return Ok(RunOutcome::Skipped {
                reason: SkipReason::EmptyFile,
                file_name: Some(file.name),
            });
        }

        let leads = records
            .iter()
            .map(|record| self.normalizer.normalize(record))
            .collect::<Vec<_>>();
        info!(file = %file.name, leads = leads.len(), "normalized export rows");

        let summary = self.uploader.upload(leads).await?;

        self.ledger
            .record(&file.name)
            .await
            .with_context(|| format!("recording {} as processed", file.name))?;

        info!(
            file = %file.name,
            succeeded = summary.success_count,
            failed = summary.failure_count,
            "total leads uploaded"
        );
        for (category, details) in &summary.errors_by_category {
            warn!(category = %category, count = details.len(), details = ?details, "upload failures by category");
        }

        Ok(RunOutcome::Completed {
            file_name: file.name,
            summary,
        })
    }
}

#[cfg(feature = "sftp")]
fn sftp_locator(
    config: &PipelineConfig,
    secrets: &Secrets,
    pattern: Option<&str>,
) -> Result<Arc<dyn SourceLocator>> {
    let settings = secrets
        .sftp
        .clone()
        .context("SFTP connection settings missing from the secret store")?;
    let matcher = match pattern {
        Some(pattern) => NameMatcher::parse(pattern)?,
        None => NameMatcher::glob(&format!("{}*", config.file_prefix))?,
    };
    Ok(Arc::new(leadrelay_adapters::SftpLocator::new(settings, matcher)))
}

#[cfg(not(feature = "sftp"))]
fn sftp_locator(
    _config: &PipelineConfig,
    _secrets: &Secrets,
    _pattern: Option<&str>,
) -> Result<Arc<dyn SourceLocator>> {
    anyhow::bail!("sftp source configured but this build has no sftp support")
}
