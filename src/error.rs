//! Error types for convsift
//!
//! `PipelineError` covers everything that can stop a stage of the pipeline.
//! `AnalysisError` is the per-item contract with the external analyzer and is
//! never raised past the scheduler: it ends up in the failed-id ledger.

use std::path::PathBuf;
use thiserror::Error;

use crate::scheduler::progress::RunTotals;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A top-level record that could not be parsed. Counted and skipped by the
    /// chunker; only surfaced when reading a single record on demand.
    #[error("Malformed record at byte offset {offset}: {reason}")]
    MalformedRecord { offset: u64, reason: String },

    /// Reading the input stream failed. Chunking is aborted.
    #[error("Stream I/O error after {bytes_read} bytes: {source}")]
    StreamIo {
        bytes_read: u64,
        #[source]
        source: std::io::Error,
    },

    /// The input does not start with a JSON array or a wrapper object.
    #[error("Input is not a JSON array of records (unexpected {found:?} at byte offset {offset})")]
    NotAnArray { found: char, offset: u64 },

    /// An unexpected failure inside a checkpoint unit. Progress up to the
    /// failure has been saved.
    #[error("Checkpoint unit {unit} aborted: {reason} ({totals})")]
    CheckpointUnitAbort {
        unit: usize,
        reason: String,
        totals: RunTotals,
    },

    /// The consolidation collaborator is missing or failed
    #[error("Consolidation unavailable: {0}")]
    ConsolidationUnavailable(String),

    /// Checkpoint file could not be read or written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Another run holds the progress lock
    #[error("Progress store is locked by another run: {}", .0.display())]
    Locked(PathBuf),

    /// Chunk index errors
    #[error("Index error: {0}")]
    Index(String),

    /// A work item id that no source knows about
    #[error("Work item not found: {0}")]
    ItemNotFound(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Background task failures
    #[error("Task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::Task(err.to_string())
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure of a single `analyze(item)` call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// Timeouts, rate limits, transient server errors. Retried with backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Anything retrying cannot fix. Recorded as failed immediately.
    #[error("non-retryable: {0}")]
    NonRetryable(String),
}

impl AnalysisError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalysisError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            AnalysisError::Retryable(msg) | AnalysisError::NonRetryable(msg) => msg,
        }
    }

    /// Classify a free-form error message from a collaborator
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        let retryable = lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("connection")
            || lower.contains("temporarily")
            || lower.contains("service unavailable")
            || lower.contains("bad gateway")
            || lower.contains("internal server error");

        if retryable {
            AnalysisError::Retryable(message)
        } else {
            AnalysisError::NonRetryable(message)
        }
    }

    /// Map an HTTP status code onto the retry taxonomy
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body.trim());
        match status {
            408 | 425 | 429 | 500..=599 => AnalysisError::Retryable(message),
            _ => AnalysisError::NonRetryable(message),
        }
    }
}

impl From<reqwest::Error> for AnalysisError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return AnalysisError::Retryable(err.to_string());
        }
        if let Some(status) = err.status() {
            return AnalysisError::from_status(status.as_u16(), &err.to_string());
        }
        if err.is_decode() {
            return AnalysisError::NonRetryable(format!("undecodable response: {}", err));
        }
        AnalysisError::classify(err.to_string())
    }
}
