//! Error types for GridHarvest.
//!
//! Library crates use [`HarvestError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Per-item fetch failures are not errors at this level: the worker pool turns
//! them into failure records so one bad coordinate never aborts a run.

use std::path::PathBuf;

/// Top-level error type for all GridHarvest operations.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// HTTP client construction or transport error.
    #[error("network error: {0}")]
    Network(String),

    /// Raster or filename parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The mask cannot produce a required set (e.g. zero true cells).
    #[error("invalid mask: {message}")]
    InvalidMask { message: String },

    /// The cache log is unusable and could not be rebuilt.
    #[error("cache corruption: {0}")]
    CacheCorruption(String),

    /// Appending to the cache log or persisting a payload failed.
    #[error("disk write failed for {entry}: {source}")]
    DiskWrite {
        entry: String,
        source: std::io::Error,
    },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
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

    /// Create an invalid-mask error from any displayable message.
    pub fn invalid_mask(msg: impl Into<String>) -> Self {
        Self::InvalidMask {
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

    /// Wrap a `std::io::Error` raised while writing a cache entry.
    pub fn disk_write(entry: impl Into<String>, source: std::io::Error) -> Self {
        Self::DiskWrite {
            entry: entry.into(),
            source,
        }
    }
}
