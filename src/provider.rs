// src/provider.rs
// PROVIDER CAPABILITIES
// The seams between the engine and whatever LLM / embedding backend is plugged in.
// The engine never knows which vendor sits behind these traits.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::concept::ConceptArtifact;
use crate::persona::Persona;
use crate::question::Question;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Timeout,
    RateLimited,
    Unavailable,
    /// Empty body or JSON that does not carry a rationale.
    MalformedPayload,
    /// The model declined to answer in character.
    Refusal,
    /// The rationale leaked a numeric Likert rating.
    ForbiddenLabel,
    /// Authentication, bad request, unknown model: retrying cannot help.
    Fatal,
}

impl ProviderErrorKind {
    pub fn is_transient(self) -> bool {
        !matches!(self, ProviderErrorKind::Fatal)
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::RateLimited => "rate limited",
            ProviderErrorKind::Unavailable => "unavailable",
            ProviderErrorKind::MalformedPayload => "malformed payload",
            ProviderErrorKind::Refusal => "refusal",
            ProviderErrorKind::ForbiddenLabel => "forbidden likert label",
            ProviderErrorKind::Fatal => "fatal",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
#[error("provider error ({kind}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Fatal, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::MalformedPayload, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Everything a provider needs to produce one rationale.
#[derive(Clone, Debug)]
pub struct ElicitRequest {
    pub persona: Arc<Persona>,
    pub concept: Arc<ConceptArtifact>,
    pub question: Question,
    /// Per-run model override; `None` uses the provider's configured model.
    pub model: Option<String>,
    pub temperature: f32,
    pub seed: u64,
}

/// `persona + concept + question + temperature + seed -> rationale text`.
///
/// Implementations return the raw model text; validation and unwrapping of
/// `{"rationale": ...}` payloads happens in the coordinator.
#[async_trait]
pub trait ElicitationProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    async fn elicit(&self, request: &ElicitRequest) -> Result<String, ProviderError>;
}

/// `texts -> vectors`, one vector per input text, in order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Optional capability used by the `llm` persona generation strategy.
/// Returns raw text expected to contain a JSON array of persona objects.
#[async_trait]
pub trait PersonaWriter: Send + Sync {
    async fn write_personas(&self, prompt: &str) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fatal_is_terminal() {
        for kind in [
            ProviderErrorKind::Timeout,
            ProviderErrorKind::RateLimited,
            ProviderErrorKind::Unavailable,
            ProviderErrorKind::MalformedPayload,
            ProviderErrorKind::Refusal,
            ProviderErrorKind::ForbiddenLabel,
        ] {
            assert!(kind.is_transient(), "{kind} should be retryable");
        }
        assert!(!ProviderError::fatal("bad key").is_transient());
    }

    #[test]
    fn error_message_names_the_kind() {
        let err = ProviderError::timeout("elicit took 60s");
        assert_eq!(err.to_string(), "provider error (timeout): elicit took 60s");
    }
}
