// src/bridge.rs
// INFERENCE BRIDGE
// HTTP client for an external inference worker that hosts the chat and
// embedding models. One worker serves all three provider capabilities.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::elicitation::build_elicitation_prompt;
use crate::provider::{
    ElicitRequest, ElicitationProvider, EmbeddingProvider, PersonaWriter, ProviderError, ProviderErrorKind,
};

const RATIONALE_MAX_TOKENS: usize = 200;
const PERSONA_MAX_TOKENS: usize = 1500;

#[derive(Serialize)]
struct InferenceRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Deserialize, Debug)]
struct InferenceResponse {
    status: String,
    text: Option<String>,
    message: Option<String>,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    texts: &'a [String],
}

#[derive(Deserialize, Debug)]
struct EmbedResponse {
    status: String,
    vectors: Option<Vec<Vec<f32>>>,
    message: Option<String>,
}

pub struct InferenceBridge {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
}

/// HTTP status -> error class.
pub fn classify_status(status: StatusCode) -> ProviderErrorKind {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderErrorKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderErrorKind::Timeout,
        s if s.is_server_error() => ProviderErrorKind::Unavailable,
        _ => ProviderErrorKind::Fatal,
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::timeout(err.to_string())
    } else if err.is_connect() {
        ProviderError::new(ProviderErrorKind::Unavailable, err.to_string())
    } else if err.is_decode() {
        ProviderError::malformed(err.to_string())
    } else {
        ProviderError::fatal(err.to_string())
    }
}

// Some worker models emit "[Thinking] ... [Verdict] ..."; keep only the verdict.
fn strip_thinking(raw: &str) -> String {
    match raw.find("[Verdict]") {
        Some(start) => raw[start + "[Verdict]".len()..].trim().to_string(),
        None => raw.replace("[Thinking]", "").trim().to_string(),
    }
}

impl InferenceBridge {
    pub fn new(base_url: &str, model: &str, embedding_model: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::fatal(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            embedding_model: embedding_model.to_string(),
        })
    }

    async fn post<T: Serialize, R: for<'de> Deserialize<'de>>(&self, path: &str, body: &T) -> Result<R, ProviderError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                classify_status(status),
                format!("{} returned {}: {}", url, status, detail.chars().take(200).collect::<String>()),
            ));
        }
        response.json::<R>().await.map_err(|e| ProviderError::malformed(e.to_string()))
    }

    async fn generate(
        &self,
        path: &str,
        model: &str,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
        seed: Option<u64>,
    ) -> Result<String, ProviderError> {
        let request = InferenceRequest {
            model,
            prompt,
            max_tokens,
            temperature,
            seed,
        };
        let response: InferenceResponse = self.post(path, &request).await?;
        match response.status.as_str() {
            "success" | "ok" => {
                let text = response.text.unwrap_or_default();
                debug!(chars = text.len(), path, "bridge generation complete");
                Ok(strip_thinking(&text))
            }
            "refused" => Err(ProviderError::new(
                ProviderErrorKind::Refusal,
                response.message.unwrap_or_else(|| "worker reported a refusal".into()),
            )),
            "busy" | "overloaded" => Err(ProviderError::new(
                ProviderErrorKind::RateLimited,
                response.message.unwrap_or_else(|| "worker busy".into()),
            )),
            other => Err(ProviderError::fatal(format!(
                "worker status '{}': {}",
                other,
                response.message.unwrap_or_default()
            ))),
        }
    }
}

#[async_trait]
impl ElicitationProvider for InferenceBridge {
    fn name(&self) -> &str {
        "bridge"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn elicit(&self, request: &ElicitRequest) -> Result<String, ProviderError> {
        let prompt = build_elicitation_prompt(&request.persona, &request.concept, &request.question);
        let model = request.model.as_deref().unwrap_or(&self.model);
        self.generate("elicit", model, &prompt, RATIONALE_MAX_TOKENS, request.temperature, Some(request.seed))
            .await
    }
}

#[async_trait]
impl EmbeddingProvider for InferenceBridge {
    fn model(&self) -> &str {
        &self.embedding_model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let request = EmbedRequest {
            model: &self.embedding_model,
            texts,
        };
        let response: EmbedResponse = self.post("embed", &request).await?;
        if response.status != "success" && response.status != "ok" {
            return Err(ProviderError::new(
                ProviderErrorKind::Unavailable,
                response.message.unwrap_or_else(|| format!("embed status '{}'", response.status)),
            ));
        }
        response
            .vectors
            .ok_or_else(|| ProviderError::malformed("embed response carries no vectors"))
    }
}

#[async_trait]
impl PersonaWriter for InferenceBridge {
    async fn write_personas(&self, prompt: &str) -> Result<String, ProviderError> {
        self.generate("generate", &self.model, prompt, PERSONA_MAX_TOKENS, 0.7, None).await
    }
}
