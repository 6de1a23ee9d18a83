//! Core data model shared by the lead relay crates.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "leadrelay-core";

/// Category used for calls that never produced a response (timeouts, exhausted retries).
pub const EXCEPTION_CATEGORY: &str = "Exception occurred";

/// Credential wrapper that never prints its contents.
#[derive(Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("********")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("********")
    }
}

/// One scalar cell of an export row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Text(String),
    Number(f64),
    Null,
}

impl RawValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// `NaN` counts as null, matching how numeric columns with gaps arrive.
    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Number(n) => n.is_nan(),
            Self::Text(_) => false,
        }
    }

    /// Render the value the way it is sent on the wire; `None` for null.
    pub fn to_param(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(s) => Some(s.clone()),
            Self::Number(n) if n.is_nan() => None,
            Self::Number(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 => {
                Some(format!("{}", *n as i64))
            }
            Self::Number(n) => Some(n.to_string()),
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_param() {
            Some(s) => f.write_str(&s),
            None => f.write_str("null"),
        }
    }
}

/// A source row keyed by header name. Header names may contain spaces until normalized.
pub type RawRecord = BTreeMap<String, RawValue>;

/// Where an export file was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceOrigin {
    DriveFolder { folder_id: String, file_id: String },
    Sftp { path: String },
    LocalDir { path: String },
}

/// The newest export located at a source, with its full content buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFile {
    pub name: String,
    pub modified_at: Option<DateTime<Utc>>,
    pub origin: SourceOrigin,
    pub content: Vec<u8>,
}

impl ExportFile {
    pub fn is_empty(&self) -> bool {
        self.content.iter().all(u8::is_ascii_whitespace)
    }
}

/// Flat parameter mapping sent as the query string of one ingestion call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizedLead {
    pub params: BTreeMap<String, String>,
}

impl NormalizedLead {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Outcome of one lead's remote call. Transient; only used for aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    pub success: bool,
    pub lead: NormalizedLead,
    pub error: Option<String>,
}

impl DispatchResult {
    pub fn accepted(lead: NormalizedLead) -> Self {
        Self {
            success: true,
            lead,
            error: None,
        }
    }

    pub fn rejected(lead: NormalizedLead, error: impl Into<String>) -> Self {
        Self {
            success: false,
            lead,
            error: Some(error.into()),
        }
    }
}

/// Per-invocation success/failure accounting.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchRunSummary {
    pub success_count: usize,
    pub failure_count: usize,
    pub errors_by_category: BTreeMap<String, Vec<String>>,
}

impl BatchRunSummary {
    pub fn record_success(&mut self) {
        self.success_count += 1;
    }

    pub fn record_failure(&mut self, category: impl Into<String>, detail: impl Into<String>) {
        self.failure_count += 1;
        self.errors_by_category
            .entry(category.into())
            .or_default()
            .push(detail.into());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoFileFound,
    EmptyFile,
    AlreadyProcessed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoFileFound => "no export file found",
            Self::EmptyFile => "export file is empty",
            Self::AlreadyProcessed => "export file already processed",
        };
        f.write_str(text)
    }
}

/// Terminal state of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Skipped {
        reason: SkipReason,
        file_name: Option<String>,
    },
    Completed {
        file_name: String,
        summary: BatchRunSummary,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_numbers_render_without_fraction() {
        assert_eq!(RawValue::Number(612345678.0).to_param().as_deref(), Some("612345678"));
        assert_eq!(RawValue::Number(12.5).to_param().as_deref(), Some("12.5"));
        assert_eq!(RawValue::Number(f64::NAN).to_param(), None);
        assert!(RawValue::Number(f64::NAN).is_null());
        assert!(!RawValue::text("").is_null());
    }

    #[test]
    fn summary_groups_details_by_category() {
        let mut summary = BatchRunSummary::default();
        summary.record_success();
        summary.record_failure("DUPLICATE", "phone exists");
        summary.record_failure("DUPLICATE", "email exists");
        summary.record_failure(EXCEPTION_CATEGORY, "timed out");

        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.failure_count, 3);
        assert_eq!(
            summary.errors_by_category["DUPLICATE"],
            vec!["phone exists".to_string(), "email exists".to_string()]
        );
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = RunOutcome::Skipped {
            reason: SkipReason::AlreadyProcessed,
            file_name: Some("export.csv".into()),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "already_processed");
        assert_eq!(json["file_name"], "export.csv");
    }

    #[test]
    fn secrets_are_redacted_in_debug_and_display() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "********");
        assert_eq!(secret.to_string(), "********");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn whitespace_only_content_is_empty() {
        let file = ExportFile {
            name: "a.csv".into(),
            modified_at: None,
            origin: SourceOrigin::LocalDir { path: "/tmp/a.csv".into() },
            content: b" \n\r\n".to_vec(),
        };
        assert!(file.is_empty());
    }
}
