// src/demo.rs
// DEMO MODE: instant, offline providers with realistic variation.
// Canned rationales are picked by respondent seed; embeddings come from a
// feature-hashing bag of words, so the whole pipeline runs without a worker.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::provider::{ElicitRequest, ElicitationProvider, EmbeddingProvider, ProviderError};

pub const DEMO_EMBEDDING_DIM: usize = 256;

const DEMO_RATIONALES: [&str; 12] = [
    "The product looks like good quality and the price feels affordable for what it offers.",
    "I really like this, it feels premium and I would happily try it.",
    "Not worth it for me, the price point seems too expensive for everyday use.",
    "Seems useful and convenient, I would probably pick it up on my next shopping trip.",
    "I am not interested, I already have something similar that works fine.",
    "It could be nice but I would want to read some reviews before deciding.",
    "This fits my routine well and solves a problem I deal with often.",
    "The concept is fine, though nothing about it really stands out to me.",
    "I doubt it works as promised, the claims sound exaggerated.",
    "Love the idea, I would definitely buy it as soon as it is available.",
    "Maybe if it were on sale, otherwise I would stick to my usual brand.",
    "It does not match what I need, so I would skip it.",
];

/// Offline elicitation provider.
pub struct DemoProvider {
    model: String,
}

impl DemoProvider {
    pub fn new() -> Self {
        Self {
            model: "demo-rationales".to_string(),
        }
    }
}

impl Default for DemoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ElicitationProvider for DemoProvider {
    fn name(&self) -> &str {
        "demo"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn elicit(&self, request: &ElicitRequest) -> Result<String, ProviderError> {
        let template = DEMO_RATIONALES[(request.seed % DEMO_RATIONALES.len() as u64) as usize];
        Ok(serde_json::json!({ "rationale": template }).to_string())
    }
}

/// Signed feature hashing of lower-cased word tokens.
pub fn hash_embed(text: &str, dim: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dim.max(1)];
    let lowered = text.to_lowercase();
    for token in lowered.split(|c: char| !c.is_alphanumeric()).filter(|t| t.len() > 1) {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % vector.len();
        let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
    vector
}

/// Offline embedding provider backed by [`hash_embed`].
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEMO_EMBEDDING_DIM)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model(&self) -> &str {
        "feature-hashing"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| hash_embed(t, self.dim)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::ConceptArtifact;
    use crate::elicitation::validate_rationale;
    use crate::persona::Persona;
    use crate::question::Question;
    use crate::ssr::cosine;
    use std::sync::Arc;

    #[test]
    fn hashing_is_stable_and_similarity_tracks_overlap() {
        let a = hash_embed("definitely buy this", 256);
        assert_eq!(a, hash_embed("Definitely BUY this!", 256));
        let near = hash_embed("would definitely buy", 256);
        let far = hash_embed("never interested whatsoever", 256);
        assert!(cosine(&a, &near) > cosine(&a, &far));
    }

    #[test]
    fn canned_rationales_pass_validation() {
        for text in DEMO_RATIONALES {
            assert!(validate_rationale(text).is_ok(), "{text}");
        }
    }

    #[tokio::test]
    async fn demo_provider_is_seeded() {
        let provider = DemoProvider::new();
        let request = ElicitRequest {
            persona: Arc::new(Persona::new("A")),
            concept: Arc::new(ConceptArtifact::from_text("x")),
            question: Question {
                id: "primary".into(),
                text: "?".into(),
                intent: "purchase_intent".into(),
            },
            model: None,
            temperature: 1.0,
            seed: 5,
        };
        let first = provider.elicit(&request).await.unwrap();
        assert_eq!(first, provider.elicit(&request).await.unwrap());
        assert!(first.contains(DEMO_RATIONALES[5]));
    }
}
