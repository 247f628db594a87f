// src/elicitation.rs
// ELICITATION COORDINATOR
// Fans one question out over every allocated respondent through a bounded
// worker pool, with a fingerprint cache in front of the provider and a single
// lower-temperature retry for transient failures.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::allocator::Allocation;
use crate::cache::CacheStore;
use crate::concept::ConceptArtifact;
use crate::persona::{Panel, Persona};
use crate::provider::{ElicitRequest, ElicitationProvider, ProviderError, ProviderErrorKind};
use crate::question::Question;
use crate::seeds::respondent_seed;

pub const DEFAULT_MAX_CONCURRENCY: usize = 64;
pub const DEFAULT_RETRY_TEMPERATURE_FACTOR: f32 = 0.5;

static NUMERIC_ONLY: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[\s\d.,/:%-]+$").ok());

static LIKERT_LABELS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b[1-5]\s*(/|out\s+of)\s*5\b",
        r"(?i)\b(rating|score|likert)\s*(of|is|:|=)?\s*[1-5]\b",
        r"(?i)\b[1-5]\s*stars?\b",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

const REFUSAL_MARKERS: [&str; 11] = [
    "as an ai",
    "i'm sorry, but",
    "i am sorry, but",
    "i can't help with",
    "i can't help you",
    "i cannot help with",
    "i cannot help you",
    "i can't assist",
    "i cannot assist",
    "i am unable to",
    "i'm unable to",
];

// --- OUTPUT CONTRACT ---

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.strip_prefix("```") {
        Some(rest) => rest
            .trim_start_matches("json")
            .trim_end()
            .trim_end_matches("```")
            .trim(),
        None => trimmed,
    }
}

/// Unwraps `{"rationale": ...}` payloads, collapses whitespace and rejects
/// empty, numeric-only, refusal or Likert-labelled output.
pub fn validate_rationale(raw: &str) -> Result<String, ProviderError> {
    let body = strip_code_fence(raw);
    if body.is_empty() {
        return Err(ProviderError::malformed("empty rationale"));
    }

    let text = if body.starts_with('{') {
        let payload: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| ProviderError::malformed(format!("invalid JSON payload: {}", e)))?;
        payload
            .get("rationale")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::malformed("JSON payload carries no rationale"))?
    } else {
        body.to_string()
    };

    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return Err(ProviderError::malformed("empty rationale"));
    }
    if NUMERIC_ONLY.as_ref().is_some_and(|re| re.is_match(&text)) {
        return Err(ProviderError::malformed(format!("numeric-only rationale '{}'", text)));
    }

    let lowered = text.to_lowercase();
    if REFUSAL_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return Err(ProviderError::new(ProviderErrorKind::Refusal, "model declined to answer in character"));
    }
    if LIKERT_LABELS.iter().any(|re| re.is_match(&text)) {
        return Err(ProviderError::new(
            ProviderErrorKind::ForbiddenLabel,
            "rationale contains a numeric Likert rating",
        ));
    }
    Ok(text)
}

/// Prompt shown to the model for one respondent.
pub fn build_elicitation_prompt(persona: &Persona, concept: &ConceptArtifact, question: &Question) -> String {
    let background = if persona.context.is_empty() {
        String::new()
    } else {
        let lines: Vec<String> = persona.context.iter().map(|c| format!("- {}", c)).collect();
        format!("Background you are aware of:\n{}\n\n", lines.join("\n"))
    };
    format!(
        "You are roleplaying as a consumer in a concept test. \
        Answer concisely in 1-2 sentences. Be realistic and grounded. \
        Avoid numerical ratings or Likert numbers. \
        Always respond with valid JSON of the form {{\"rationale\": \"...\"}}.\n\n\
        Persona: {} ({}).\n\
        {}Stimulus:\n{}\n\n\
        Question: {}\n\
        Return only the JSON object.",
        persona.name,
        persona.describe(),
        background,
        concept.as_prompt_block(),
        question.text
    )
}

/// Cache key for one elicitation attempt.
pub fn fingerprint(
    persona: &Persona,
    concept: &ConceptArtifact,
    question: &Question,
    model: &str,
    temperature: f32,
    seed: u64,
) -> String {
    let identity = persona.identity();
    let stimulus = concept.as_prompt_block();
    let temperature = format!("{:.4}", temperature);
    let seed = seed.to_string();

    let mut hasher = Sha256::new();
    for part in [
        identity.as_str(),
        stimulus.as_str(),
        question.id.as_str(),
        question.intent.as_str(),
        question.text.as_str(),
        model,
        temperature.as_str(),
        seed.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

// --- RETRY POLICY ---

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub retry_temperature_factor: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            retry_temperature_factor: DEFAULT_RETRY_TEMPERATURE_FACTOR,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetryDecision {
    Retry { temperature: f32 },
    Exclude,
}

impl RetryPolicy {
    pub fn decide(&self, error: &ProviderError, retries_used: usize, temperature: f32) -> RetryDecision {
        if error.is_transient() && retries_used < self.max_retries {
            RetryDecision::Retry {
                temperature: (temperature * self.retry_temperature_factor).max(0.0),
            }
        } else {
            RetryDecision::Exclude
        }
    }
}

// --- COORDINATOR ---

/// What happened to one respondent for one question.
#[derive(Clone, Debug)]
pub struct RespondentElicitation {
    pub persona_index: usize,
    pub draw: usize,
    pub seed: u64,
    /// Provider calls made (cache hits do not count).
    pub attempts: usize,
    pub retried: bool,
    pub cache_hit: bool,
    /// Temperature of the attempt that produced the outcome.
    pub temperature: f32,
    pub outcome: Result<String, ProviderError>,
}

impl RespondentElicitation {
    pub fn is_accepted(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub type ElicitationBatch = BTreeMap<(usize, usize), RespondentElicitation>;

#[derive(Clone)]
pub struct ElicitationCoordinator {
    provider: Arc<dyn ElicitationProvider>,
    cache: Arc<dyn CacheStore<String>>,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
    request_timeout: Option<Duration>,
    model_override: Option<String>,
}

impl ElicitationCoordinator {
    pub fn new(
        provider: Arc<dyn ElicitationProvider>,
        cache: Arc<dyn CacheStore<String>>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            provider,
            cache,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            policy: RetryPolicy::default(),
            request_timeout: None,
            model_override: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Copy that asks the provider for `model` instead of its default.
    /// Blank names keep the default.
    pub fn for_model(&self, model: Option<&str>) -> Self {
        let mut coordinator = self.clone();
        coordinator.model_override = model.map(str::trim).filter(|m| !m.is_empty()).map(str::to_string);
        coordinator
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        self.model_override.as_deref().unwrap_or_else(|| self.provider.model())
    }

    async fn call_provider(&self, request: &ElicitRequest) -> Result<String, ProviderError> {
        // Slot is held only for the duration of the provider call.
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::fatal("elicitation pool closed"))?;
        let call = self.provider.elicit(request);
        let raw = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                ProviderError::timeout(format!("no response within {:.1}s", limit.as_secs_f32()))
            })??,
            None => call.await?,
        };
        validate_rationale(&raw)
    }

    async fn elicit_respondent(
        self,
        persona: Arc<Persona>,
        concept: Arc<ConceptArtifact>,
        question: Question,
        base_temperature: f32,
        seed: u64,
        key: (usize, usize),
    ) -> RespondentElicitation {
        let (persona_index, draw) = key;
        let mut temperature = base_temperature;
        let mut attempts = 0;
        let mut retries = 0;

        loop {
            let cache_key = fingerprint(&persona, &concept, &question, self.model(), temperature, seed);
            if let Some(rationale) = self.cache.get(&cache_key) {
                debug!(persona_index, draw, question = %question.id, "rationale cache hit");
                return RespondentElicitation {
                    persona_index,
                    draw,
                    seed,
                    attempts,
                    retried: retries > 0,
                    cache_hit: true,
                    temperature,
                    outcome: Ok(rationale),
                };
            }

            attempts += 1;
            let request = ElicitRequest {
                persona: persona.clone(),
                concept: concept.clone(),
                question: question.clone(),
                model: self.model_override.clone(),
                temperature,
                seed,
            };
            match self.call_provider(&request).await {
                Ok(rationale) => {
                    let stored = self.cache.insert(&cache_key, rationale);
                    return RespondentElicitation {
                        persona_index,
                        draw,
                        seed,
                        attempts,
                        retried: retries > 0,
                        cache_hit: false,
                        temperature,
                        outcome: Ok(stored),
                    };
                }
                Err(err) => match self.policy.decide(&err, retries, temperature) {
                    RetryDecision::Retry { temperature: lowered } => {
                        warn!(
                            persona = %persona.name,
                            draw,
                            question = %question.id,
                            error = %err,
                            temperature = lowered,
                            "elicitation failed, retrying at lower temperature"
                        );
                        retries += 1;
                        temperature = lowered;
                    }
                    RetryDecision::Exclude => {
                        warn!(
                            persona = %persona.name,
                            draw,
                            question = %question.id,
                            error = %err,
                            "respondent excluded from question"
                        );
                        return RespondentElicitation {
                            persona_index,
                            draw,
                            seed,
                            attempts,
                            retried: retries > 0,
                            cache_hit: false,
                            temperature,
                            outcome: Err(err),
                        };
                    }
                },
            }
        }
    }

    /// Elicits one rationale per allocated respondent for `question`.
    /// Results come back keyed by `(persona_index, draw)` whatever order the
    /// tasks finished in.
    pub async fn elicit_question(
        &self,
        panel: &Panel,
        allocation: &Allocation,
        concept: &Arc<ConceptArtifact>,
        question: &Question,
        temperature: f32,
        run_seed: u64,
    ) -> ElicitationBatch {
        let mut tasks = JoinSet::new();
        for (persona_index, draw) in allocation.respondents() {
            let Some(persona) = panel.get(persona_index) else { continue };
            let worker = self.clone();
            tasks.spawn(worker.elicit_respondent(
                persona.clone(),
                concept.clone(),
                question.clone(),
                temperature,
                respondent_seed(run_seed, persona_index, draw),
                (persona_index, draw),
            ));
        }

        let mut batch = ElicitationBatch::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    batch.insert((result.persona_index, result.draw), result);
                }
                Err(err) => error!(error = %err, "elicitation task aborted"),
            }
        }

        // Tasks that died without reporting are excluded like any other failure.
        for (persona_index, draw) in allocation.respondents() {
            batch.entry((persona_index, draw)).or_insert_with(|| RespondentElicitation {
                persona_index,
                draw,
                seed: respondent_seed(run_seed, persona_index, draw),
                attempts: 0,
                retried: false,
                cache_hit: false,
                temperature,
                outcome: Err(ProviderError::fatal("elicitation task aborted")),
            });
        }

        let accepted = batch.values().filter(|r| r.is_accepted()).count();
        info!(
            question = %question.id,
            respondents = batch.len(),
            accepted,
            excluded = batch.len() - accepted,
            retried = batch.values().filter(|r| r.retried).count(),
            cache_hits = batch.values().filter(|r| r.cache_hit).count(),
            "elicitation pass finished"
        );
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::allocate_per_persona;
    use crate::cache::ResponseCache;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowProvider {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ElicitationProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        fn model(&self) -> &str {
            "slow-1"
        }

        async fn elicit(&self, request: &ElicitRequest) -> Result<String, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("{{\"rationale\": \"seed {} sounds fine\"}}", request.seed % 7))
        }
    }

    struct FatalProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ElicitationProvider for FatalProvider {
        fn name(&self) -> &str {
            "fatal"
        }

        fn model(&self) -> &str {
            "fatal-1"
        }

        async fn elicit(&self, _request: &ElicitRequest) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::fatal("invalid api key"))
        }
    }

    fn panel() -> Panel {
        Panel::new(vec![
            Persona::new("A").with_weight(0.5),
            Persona::new("B").with_weight(0.5),
        ])
        .unwrap()
    }

    fn question() -> Question {
        Question {
            id: "primary".into(),
            text: "Would you buy it?".into(),
            intent: "purchase_intent".into(),
        }
    }

    #[test]
    fn rationale_payloads_are_unwrapped_and_normalized() {
        assert_eq!(
            validate_rationale("```json\n{\"rationale\": \"Looks  useful\\nfor me\"}\n```").unwrap(),
            "Looks useful for me"
        );
        assert_eq!(validate_rationale("  plain\n text ").unwrap(), "plain text");
    }

    #[test]
    fn invalid_rationales_are_classified() {
        let kind = |raw: &str| validate_rationale(raw).unwrap_err().kind;
        assert_eq!(kind(""), ProviderErrorKind::MalformedPayload);
        assert_eq!(kind("{\"answer\": \"x\"}"), ProviderErrorKind::MalformedPayload);
        assert_eq!(kind("{not json"), ProviderErrorKind::MalformedPayload);
        assert_eq!(kind("4"), ProviderErrorKind::MalformedPayload);
        assert_eq!(kind("I'm sorry, but I can't roleplay that."), ProviderErrorKind::Refusal);
        assert_eq!(kind("I would rate it 4/5 overall."), ProviderErrorKind::ForbiddenLabel);
        assert_eq!(kind("Score: 5, great value."), ProviderErrorKind::ForbiddenLabel);
        assert_eq!(kind("I can't help with that request."), ProviderErrorKind::Refusal);
        assert!(validate_rationale("I can't wait to try it with my 2 kids.").is_ok());
        assert!(validate_rationale("I can't help but love how convenient this looks.").is_ok());
    }

    #[test]
    fn retry_is_one_shot_and_lowers_temperature() {
        let policy = RetryPolicy::default();
        let timeout = ProviderError::timeout("slow");
        assert_eq!(policy.decide(&timeout, 0, 1.0), RetryDecision::Retry { temperature: 0.5 });
        assert_eq!(policy.decide(&timeout, 1, 0.5), RetryDecision::Exclude);
        assert_eq!(policy.decide(&ProviderError::fatal("bad"), 0, 1.0), RetryDecision::Exclude);
    }

    #[test]
    fn fingerprint_depends_on_temperature_and_seed() {
        let persona = Persona::new("A");
        let concept = ConceptArtifact::from_text("bottle");
        let q = question();
        let base = fingerprint(&persona, &concept, &q, "m", 1.0, 1);
        assert_eq!(base, fingerprint(&persona, &concept, &q, "m", 1.0, 1));
        assert_ne!(base, fingerprint(&persona, &concept, &q, "m", 0.5, 1));
        assert_ne!(base, fingerprint(&persona, &concept, &q, "m", 1.0, 2));
        assert_ne!(base, fingerprint(&persona, &concept, &q, "m2", 1.0, 1));
    }

    #[test]
    fn fingerprint_depends_on_question_wording_and_intent() {
        let persona = Persona::new("A");
        let concept = ConceptArtifact::from_text("bottle");
        let q = question();
        let base = fingerprint(&persona, &concept, &q, "m", 1.0, 1);
        let reworded = Question {
            text: "Would you recommend it?".into(),
            ..q.clone()
        };
        let other_intent = Question {
            intent: "relevance".into(),
            ..q.clone()
        };
        assert_ne!(base, fingerprint(&persona, &concept, &reworded, "m", 1.0, 1));
        assert_ne!(base, fingerprint(&persona, &concept, &other_intent, "m", 1.0, 1));
    }

    #[tokio::test]
    async fn in_flight_requests_respect_the_bound() {
        let provider = Arc::new(SlowProvider {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let cache = Arc::new(ResponseCache::unbounded());
        let coordinator = ElicitationCoordinator::new(provider.clone(), cache, 3);
        let panel = panel();
        let allocation = allocate_per_persona(&panel, 5);
        let concept = Arc::new(ConceptArtifact::from_text("bottle"));

        let batch = coordinator
            .elicit_question(&panel, &allocation, &concept, &question(), 1.0, 11)
            .await;
        assert_eq!(batch.len(), 10);
        assert!(batch.values().all(|r| r.is_accepted()));
        assert!(provider.peak.load(Ordering::SeqCst) <= 3);
        let keys: Vec<(usize, usize)> = batch.keys().copied().collect();
        assert_eq!(keys, allocation.respondents().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn fatal_errors_exclude_without_retry() {
        let provider = Arc::new(FatalProvider {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(ResponseCache::unbounded());
        let coordinator = ElicitationCoordinator::new(provider.clone(), cache.clone(), 4);
        let panel = panel();
        let allocation = allocate_per_persona(&panel, 1);
        let concept = Arc::new(ConceptArtifact::from_text("bottle"));

        let batch = coordinator
            .elicit_question(&panel, &allocation, &concept, &question(), 1.0, 3)
            .await;
        assert!(batch.values().all(|r| !r.is_accepted() && !r.retried));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }
}
