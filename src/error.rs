// src/error.rs
// Error taxonomy for the panel engine, the providers and the SSR pipeline.

use thiserror::Error;

use crate::provider::ProviderError;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum SsrError {
    /// Malformed input: bad population spec, share sum above one, unknown
    /// persona group, empty panel, invalid anchor bank.
    #[error("validation error: {0}")]
    Validation(String),

    /// Strict-mode raking hit a target category with zero persona mass.
    #[error("raking error: {0}")]
    Raking(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Too few valid respondents for a question to report an aggregate.
    #[error("insufficient sample for question '{question_id}': {valid} valid respondents, {required} required")]
    InsufficientSample {
        question_id: String,
        valid: usize,
        required: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl SsrError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn raking(message: impl Into<String>) -> Self {
        Self::Raking(message.into())
    }
}

pub type Result<T> = std::result::Result<T, SsrError>;
