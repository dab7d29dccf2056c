//! Engine error types.
//!
//! These cover caller mistakes at the public API (bad paths, unknown fields,
//! unreadable configuration). Rule violations and suite faults never surface
//! here; they are folded into the aggregated state instead.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormSyncError {
    #[error("Invalid field path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("No control registered for field '{0}'")]
    UnknownField(String),

    #[error("Failed to read configuration file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    #[error("Form engine has been shut down")]
    Closed,
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, FormSyncError>;
