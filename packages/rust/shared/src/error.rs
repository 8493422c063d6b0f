//! Error types for tgkb.
//!
//! Library crates use [`TgkbError`] via `thiserror` for run-level failures.
//! Row- and record-local failures have their own enums in `tgkb-ingest` and
//! `tgkb-openrouter` and never escape as a `TgkbError`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for run-level (fatal) failures.
#[derive(Debug, thiserror::Error)]
pub enum TgkbError {
    /// Configuration loading or validation error (missing API key, bad TOML, ...).
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while setting up a client.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed input that cannot be interpreted at all.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Enrichment stage could not be set up.
    #[error("enrichment error: {0}")]
    Enrichment(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, empty input, pending records, ...).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The run was stopped before every record reached a terminal status.
    #[error("run cancelled: {completed} of {total} records enriched")]
    Cancelled { completed: usize, total: usize },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TgkbError>;

impl TgkbError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
