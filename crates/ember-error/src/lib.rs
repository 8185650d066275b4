#![forbid(unsafe_code)]
//! Error types for EmberFS.
//!
//! Defines `EmberError` and a `Result<T>` alias used throughout the
//! workspace.

use thiserror::Error;

/// Unified error type for all EmberFS operations.
#[derive(Debug, Error)]
pub enum EmberError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt summary for segment {segno}: {detail}")]
    SummaryCorrupt { segno: u32, detail: String },

    #[error(transparent)]
    Geometry(#[from] ember_types::GeometryError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("no space left on device")]
    NoSpace,
}

/// Result alias using `EmberError`.
pub type Result<T> = std::result::Result<T, EmberError>;
