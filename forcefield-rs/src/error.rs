//! Error types for forcefield-rs.
//!
//! Fatal conditions (unsupported model families, invalid configuration,
//! checkpoint identifier mismatches) surface as distinct variants so callers
//! can match on them. Degraded checkpoint restores are not errors; see
//! [`crate::checkpoint::RestoreReport`].
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use forcefield_rs::{ForceFieldError, SelectionMetric};
//!
//! match SelectionMetric::from_name("val_accuracy") {
//!     Ok(metric) => println!("selecting on {metric:?}"),
//!     Err(ForceFieldError::InvalidConfig(msg)) => eprintln!("bad metric: {msg}"),
//!     Err(e) => eprintln!("other error: {e}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for forcefield-rs operations.
pub type Result<T> = std::result::Result<T, ForceFieldError>;

/// Errors that can occur in forcefield-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ForceFieldError {
    /// The requested model family or derived quantity is not implemented.
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// A checkpoint was written for a different model identifier.
    #[error("checkpoint model mismatch: requested `{requested}`, found `{found}`")]
    CheckpointMismatch {
        /// Model identifier the caller asked for.
        requested: String,
        /// Model identifier stored in the checkpoint.
        found: String,
    },

    /// Checkpoint read/write error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A requested quantity was not produced or has no ground truth.
    #[error("missing quantity: {0}")]
    MissingQuantity(String),

    /// Batch fields are inconsistent.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Dataset or shard error.
    #[error("data error: {0}")]
    Data(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Safetensors container error.
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl ForceFieldError {
    /// Create an unsupported-model error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedModel(msg.into())
    }

    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a checkpoint error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a training error.
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a data error.
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create an invalid batch error.
    pub fn invalid_batch(msg: impl Into<String>) -> Self {
        Self::InvalidBatch(msg.into())
    }
}

impl From<indicatif::style::TemplateError> for ForceFieldError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        ForceFieldError::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_unsupported_model_display() {
        let error = ForceFieldError::unsupported("graphormer");
        assert_eq!(error.to_string(), "unsupported model: graphormer");
    }

    #[test]
    fn test_checkpoint_mismatch_display() {
        let error = ForceFieldError::CheckpointMismatch {
            requested: "morse".into(),
            found: "m3gnet".into(),
        };
        assert_eq!(
            error.to_string(),
            "checkpoint model mismatch: requested `morse`, found `m3gnet`"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "best_model.safetensors");
        let error: ForceFieldError = io_error.into();
        assert!(matches!(error, ForceFieldError::Io(_)));
        assert!(error.to_string().contains("best_model.safetensors"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F64, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F64, &Device::Cpu).unwrap();
        let candle_error = a.broadcast_add(&b).unwrap_err();
        let error: ForceFieldError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("a: b: :::").unwrap_err();
        let error: ForceFieldError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let error: ForceFieldError = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert!(error.source().is_some());
    }
}
