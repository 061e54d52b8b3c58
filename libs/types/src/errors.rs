//! Error types for descriptor loading and validation
//!
//! Every failure that can happen before an adapter starts lands here. A
//! descriptor that produces a `ConfigError` never reaches the lifecycle
//! controller.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while parsing or validating an event source descriptor
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML (or JSON, which YAML accepts) could not be decoded
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON-only entry point could not decode the document
    #[error("failed to parse JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field is absent or empty
    #[error("missing required field: {field}")]
    MissingField {
        /// Dotted path of the missing field
        field: String,
    },

    /// A field is present but holds an unusable value
    #[error("invalid value for {field}: {reason}")]
    InvalidField {
        /// Dotted path of the offending field
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Configuration file could not be read
    #[error("failed to read configuration file {path:?}: {source}")]
    Io {
        /// File that was being read
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::MissingField`]
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Shorthand for [`ConfigError::InvalidField`]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
