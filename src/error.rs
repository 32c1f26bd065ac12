// 🚨 Error taxonomy
// Pass-level failures (SyncError) abort one pass; row-level failures
// (RowError) are collected and the batch keeps going.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// PASS-LEVEL ERRORS
// ============================================================================

/// Failures that end the current pass. The orchestrator records them and
/// moves on to the next pass.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Required columns are missing from the input. Raised before any row
    /// is read, so nothing is written.
    #[error("{feed}: missing required columns: {}", missing.join(", "))]
    Schema { feed: String, missing: Vec<String> },

    /// The store rejected a read or write. The pass transaction is rolled back.
    #[error("store error: {0}")]
    Structural(String),

    /// The remote feed did not answer within the configured timeout.
    #[error("remote feed timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The remote feed answered with an error or an unreadable body.
    #[error("remote feed error: {0}")]
    Remote(String),

    /// The input could not be opened or decoded at all.
    #[error("source error: {0}")]
    Source(String),
}

impl SyncError {
    pub fn schema(feed: impl Into<String>, missing: Vec<String>) -> Self {
        Self::Schema {
            feed: feed.into(),
            missing,
        }
    }

    /// Short machine-readable label used in reports and audit events.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Schema { .. } => "schema",
            SyncError::Structural(_) => "structural",
            SyncError::Timeout { .. } => "timeout",
            SyncError::Remote(_) => "remote",
            SyncError::Source(_) => "source",
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Structural(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Remote(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

// ============================================================================
// ROW-LEVEL ERRORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorKind {
    /// A required field is absent or blank.
    MissingField,
    /// The record could not be decoded, or a required value did not parse.
    Parse,
    /// A child row could not be built; the parent entity is still written.
    Child,
}

/// A skipped row, with enough context to find it in the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    /// 1-based row number in the source, header row included for files.
    pub line: usize,
    /// Natural key of the row when it could be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub kind: RowErrorKind,
    pub message: String,
}

impl RowError {
    pub fn missing_field(line: usize, field: &str) -> Self {
        RowError {
            line,
            key: None,
            field: Some(field.to_string()),
            kind: RowErrorKind::MissingField,
            message: format!("{} is required", field),
        }
    }

    pub fn parse(line: usize, field: Option<&str>, message: impl Into<String>) -> Self {
        RowError {
            line,
            key: None,
            field: field.map(str::to_string),
            kind: RowErrorKind::Parse,
            message: message.into(),
        }
    }

    pub fn child(line: usize, key: &str, message: impl Into<String>) -> Self {
        RowError {
            line,
            key: Some(key.to_string()),
            field: None,
            kind: RowErrorKind::Child,
            message: message.into(),
        }
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }
}

impl std::fmt::Display for RowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.key {
            Some(key) => write!(f, "Row {} [{}]: {}", self.line, key, self.message),
            None => write!(f, "Row {}: {}", self.line, self.message),
        }
    }
}

impl std::error::Error for RowError {}
