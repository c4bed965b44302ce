// Error types for aggregation runs
use std::path::PathBuf;

/// Failure classes a caller can act on. Recoverable per-record problems
/// (bad timestamps, rejected links, failed metadata lookups) never surface
/// here; they are counted in `RunSummary` instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Termination,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum AggError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("configuration error: schema of {left} does not match {right}: {detail}")]
    SchemaMismatch {
        left: String,
        right: String,
        detail: String,
    },

    #[error("termination error: {live} relations still live after round {round} (expected exactly 1)")]
    Termination { round: usize, live: usize },

    #[error("termination error: expected a single terminal relation, found {found:?}")]
    MissingTerminal { found: Vec<String> },

    #[error("malformed relation {path}: {message}")]
    Relation { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AggError {
    pub fn config(message: impl Into<String>) -> Self {
        AggError::Configuration { message: message.into() }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            AggError::Configuration { .. } | AggError::SchemaMismatch { .. } => ErrorCategory::Configuration,
            AggError::Termination { .. } | AggError::MissingTerminal { .. } => ErrorCategory::Termination,
            AggError::Relation { .. } | AggError::Io(_) | AggError::Json(_) => ErrorCategory::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, AggError>;
