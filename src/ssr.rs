// src/ssr.rs
// SSR MAPPER (semantic similarity rating)
// Embeds rationales and anchor statements and turns cosine similarities into
// a five-point Likert pmf, averaged over the bank's anchor variants.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use crate::anchors::{AnchorBank, LIKERT_POINTS};
use crate::cache::CacheStore;
use crate::provider::{EmbeddingProvider, ProviderError};

pub const DEFAULT_SSR_EPSILON: f64 = 1e-6;

pub type Pmf = [f64; LIKERT_POINTS];

/// Embedded anchor statements: one row of five vectors per variant.
pub type AnchorVectors = Vec<Vec<Arc<Vec<f32>>>>;

/// Cosine similarity; zero-norm input gives 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Pure mapping from a rationale vector and the anchor vectors to a pmf.
pub fn similarity_pmf(rationale: &[f32], anchors: &AnchorVectors, epsilon: f64) -> Result<Pmf, ProviderError> {
    if anchors.is_empty() {
        return Err(ProviderError::malformed("no anchor variants to compare against"));
    }
    let mut pmf = [0.0; LIKERT_POINTS];
    for variant in anchors {
        if variant.len() != LIKERT_POINTS {
            return Err(ProviderError::malformed("anchor variant without five statements"));
        }
        let mut scores = [0.0; LIKERT_POINTS];
        for (k, anchor) in variant.iter().enumerate() {
            if anchor.len() != rationale.len() {
                return Err(ProviderError::malformed(format!(
                    "embedding dimension mismatch: {} vs {}",
                    rationale.len(),
                    anchor.len()
                )));
            }
            scores[k] = cosine(rationale, anchor).max(0.0) + epsilon;
        }
        let total: f64 = scores.iter().sum();
        for k in 0..LIKERT_POINTS {
            pmf[k] += scores[k] / total;
        }
    }
    let variants = anchors.len() as f64;
    pmf.iter_mut().for_each(|p| *p /= variants);
    let total: f64 = pmf.iter().sum();
    pmf.iter_mut().for_each(|p| *p /= total);
    Ok(pmf)
}

pub struct SsrMapper {
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Arc<dyn CacheStore<Arc<Vec<f32>>>>,
    epsilon: f64,
    max_concurrency: usize,
}

impl SsrMapper {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        cache: Arc<dyn CacheStore<Arc<Vec<f32>>>>,
        epsilon: f64,
        max_concurrency: usize,
    ) -> Self {
        Self {
            embedder,
            cache,
            epsilon,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn embedding_model(&self) -> &str {
        self.embedder.model()
    }

    fn cache_key(&self, text: &str) -> String {
        format!("{}\u{1f}{}", self.embedder.model(), text)
    }

    /// Embeds `texts` in order, calling the provider only for cache misses.
    async fn embed_cached(&self, texts: &[String]) -> Result<Vec<Arc<Vec<f32>>>, ProviderError> {
        let mut found: Vec<Option<Arc<Vec<f32>>>> =
            texts.iter().map(|t| self.cache.get(&self.cache_key(t))).collect();
        let missing: Vec<String> = texts
            .iter()
            .zip(&found)
            .filter(|(_, hit)| hit.is_none())
            .map(|(text, _)| text.clone())
            .collect();

        if !missing.is_empty() {
            let vectors = self.embedder.embed(&missing).await?;
            if vectors.len() != missing.len() {
                return Err(ProviderError::malformed(format!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    missing.len()
                )));
            }
            let mut fresh = missing.iter().zip(vectors);
            for slot in found.iter_mut().filter(|slot| slot.is_none()) {
                if let Some((text, vector)) = fresh.next() {
                    *slot = Some(self.cache.insert(&self.cache_key(text), Arc::new(vector)));
                }
            }
        }

        found
            .into_iter()
            .map(|v| v.ok_or_else(|| ProviderError::malformed("missing embedding")))
            .collect()
    }

    /// Embeds every variant of `bank`. Failure here fails the whole question.
    pub async fn prepare_anchors(&self, bank: &AnchorBank) -> Result<AnchorVectors, ProviderError> {
        let mut rows = Vec::with_capacity(bank.anchor_sets.len());
        for set in &bank.anchor_sets {
            let statements: Vec<String> = set.anchors.values().cloned().collect();
            rows.push(self.embed_cached(&statements).await?);
        }
        debug!(intent = %bank.intent, variants = rows.len(), "anchor vectors ready");
        Ok(rows)
    }

    pub async fn map_rationale(&self, rationale: &str, anchors: &AnchorVectors) -> Result<Pmf, ProviderError> {
        let vectors = self.embed_cached(&[rationale.to_string()]).await?;
        let vector = vectors
            .first()
            .ok_or_else(|| ProviderError::malformed("missing rationale embedding"))?;
        similarity_pmf(vector, anchors, self.epsilon)
    }

    /// Maps many rationales with bounded concurrency, keyed like the input.
    pub async fn map_batch<K>(
        &self,
        rationales: Vec<(K, String)>,
        anchors: &AnchorVectors,
    ) -> BTreeMap<K, Result<Pmf, ProviderError>>
    where
        K: Ord + Send,
    {
        let total = rationales.len();
        let mapped: BTreeMap<K, Result<Pmf, ProviderError>> = stream::iter(rationales)
            .map(|(key, text)| async move { (key, self.map_rationale(&text, anchors).await) })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;
        let failed = mapped.values().filter(|r| r.is_err()).count();
        info!(rationales = total, failed, "ssr mapping finished");
        mapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchors::AnchorRegistry;
    use crate::cache::EmbeddingCache;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn axis(i: usize) -> Arc<Vec<f32>> {
        let mut v = vec![0.0; LIKERT_POINTS];
        v[i] = 1.0;
        Arc::new(v)
    }

    fn orthogonal_anchors() -> AnchorVectors {
        vec![(0..LIKERT_POINTS).map(axis).collect()]
    }

    #[test]
    fn cosine_handles_zero_vectors() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn pmf_peaks_at_most_similar_anchor_and_sums_to_one() {
        let pmf = similarity_pmf(&[0.0, 0.0, 0.0, 0.2, 1.0], &orthogonal_anchors(), DEFAULT_SSR_EPSILON).unwrap();
        assert!((pmf.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(pmf[4] > pmf[3] && pmf[3] > pmf[0]);
    }

    #[test]
    fn zero_norm_rationale_is_uniform() {
        let pmf = similarity_pmf(&[0.0; 5], &orthogonal_anchors(), DEFAULT_SSR_EPSILON).unwrap();
        assert!(pmf.iter().all(|p| (p - 0.2).abs() < 1e-12));
    }

    #[test]
    fn negative_similarity_is_clipped() {
        let pmf = similarity_pmf(&[-1.0, 0.0, 0.0, 0.0, 1.0], &orthogonal_anchors(), DEFAULT_SSR_EPSILON).unwrap();
        assert!(pmf[0] < 1e-5);
    }

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        fn model(&self) -> &str {
            "count"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn embeddings_are_cached_by_text() {
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let mapper = SsrMapper::new(embedder.clone(), Arc::new(EmbeddingCache::unbounded()), DEFAULT_SSR_EPSILON, 4);
        let bank = AnchorRegistry::with_defaults().unwrap().get("relevance").unwrap().clone();
        let anchors = mapper.prepare_anchors(&bank).await.unwrap();
        let before = embedder.calls.load(Ordering::SeqCst);
        mapper.prepare_anchors(&bank).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), before);

        let batch = mapper
            .map_batch(vec![(0usize, "same".to_string()), (1, "same".to_string())], &anchors)
            .await;
        assert_eq!(batch.len(), 2);
        assert!(batch.values().all(|r| r.is_ok()));
    }
}
