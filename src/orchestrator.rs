// src/orchestrator.rs
// SIMULATION ENGINE
// Runs one survey end to end: compose -> rake -> context -> allocate, then
// for every question: elicit -> map -> aggregate over the same panel snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use crate::aggregator::{
    aggregate_question, expected_rating, persona_distributions, top_themes, AggregateResult, AggregationOptions,
    LikertDistribution, ScoredRespondent,
};
use crate::allocator::{allocate, Allocation};
use crate::anchors::AnchorRegistry;
use crate::audience_builder::{build_audience, AudiencePanel, AudienceTask};
use crate::bridge::InferenceBridge;
use crate::cache::{CacheStore, EmbeddingCache, ResponseCache};
use crate::composer::{CompositionReport, PanelInputs, PersonaComposer};
use crate::concept::{ingest_concept, ConceptArtifact, ConceptInput};
use crate::config::AppSettings;
use crate::demo::{DemoProvider, HashingEmbedder};
use crate::elicitation::{ElicitationCoordinator, RetryPolicy};
use crate::error::{Result, SsrError};
use crate::panel_context::{apply_panel_context, PanelContextSpec};
use crate::persona::Panel;
use crate::persona_library::PersonaLibrary;
use crate::provider::{ElicitationProvider, EmbeddingProvider, PersonaWriter};
use crate::question::{build_questions, Question, QuestionInput};
use crate::raking::{rake, RakingReport};
use crate::seeds::random_seed;
use crate::ssr::{Pmf, SsrMapper};

pub const DEFAULT_INTENT: &str = "purchase_intent";
const THEMES_PER_PERSONA: usize = 3;

fn default_intent() -> String {
    DEFAULT_INTENT.to_string()
}

// --- REQUEST ---

/// Sizing, sampling and reproducibility knobs. Unset fields fall back to settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SimulationOptions {
    /// Draws per persona (per-persona mode) or total draws when `stratified`.
    #[serde(default)]
    pub n: Option<usize>,
    /// Total respondents apportioned by weight; overrides `n`.
    #[serde(default)]
    pub total_n: Option<usize>,
    #[serde(default)]
    pub stratified: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub bootstrap_samples: Option<usize>,
    #[serde(default)]
    pub min_valid_samples: Option<usize>,
    /// Elicitation model for this run; unset uses the configured model.
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub concept: ConceptInput,
    #[serde(default = "default_intent")]
    pub intent: String,
    /// Overrides the default wording of the primary question.
    #[serde(default)]
    pub intent_question: Option<String>,
    #[serde(default)]
    pub questions: Vec<QuestionInput>,
    #[serde(flatten)]
    pub panel: PanelInputs,
    #[serde(default)]
    pub panel_context: Option<PanelContextSpec>,
    #[serde(flatten)]
    pub options: SimulationOptions,
}

impl SimulationRequest {
    pub fn new(concept: ConceptInput) -> Self {
        Self {
            concept,
            intent: default_intent(),
            intent_question: None,
            questions: Vec::new(),
            panel: PanelInputs::default(),
            panel_context: None,
            options: SimulationOptions::default(),
        }
    }
}

// --- RESULT ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionStage {
    Elicitation,
    Mapping,
}

/// Per-question lifecycle of one respondent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RespondentState {
    Allocated,
    Elicited,
    Mapped,
    Aggregated,
    Excluded { stage: ExclusionStage, reason: String },
}

impl RespondentState {
    pub fn is_excluded(&self) -> bool {
        matches!(self, RespondentState::Excluded { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RespondentRecord {
    pub question_id: String,
    pub persona_index: usize,
    pub persona_name: String,
    pub draw: usize,
    pub seed: u64,
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub attempts: usize,
    pub retried: bool,
    pub cache_hit: bool,
    pub rationale: Option<String>,
    pub pmf: Option<Pmf>,
    pub expected_rating: Option<f64>,
    pub state: RespondentState,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonaOutcome {
    pub persona_index: usize,
    pub name: String,
    pub weight: f64,
    pub draws: usize,
    pub distribution: Option<LikertDistribution>,
    pub rationales: Vec<String>,
    pub themes: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionDiagnostics {
    pub respondents: usize,
    pub elicited: usize,
    pub mapped: usize,
    pub excluded_elicitation: usize,
    pub excluded_mapping: usize,
    pub retried: usize,
    pub cache_hits: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Reported,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuestionOutcome {
    pub question: Question,
    pub status: QuestionStatus,
    pub aggregate: Option<AggregateResult>,
    pub error: Option<String>,
    pub personas: Vec<PersonaOutcome>,
    pub diagnostics: QuestionDiagnostics,
    pub respondents: Vec<RespondentRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationMetadata {
    pub seed: u64,
    pub intent: String,
    pub provider: String,
    pub model: String,
    pub embedding_model: String,
    pub concept: ConceptArtifact,
    pub composition: CompositionReport,
    pub raking: Option<RakingReport>,
    pub context_chunks: usize,
    pub allocation: Allocation,
    pub persona_summary: String,
    pub excluded_elicitation: usize,
    pub excluded_mapping: usize,
    pub question_sample_sizes: BTreeMap<String, usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub questions: Vec<QuestionOutcome>,
    pub metadata: SimulationMetadata,
}

impl SimulationResult {
    pub fn question(&self, id: &str) -> Option<&QuestionOutcome> {
        self.questions.iter().find(|q| q.question.id == id)
    }

    pub fn primary(&self) -> Option<&QuestionOutcome> {
        self.questions.first()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreviewPersona {
    pub name: String,
    pub weight: f64,
    pub draws: usize,
    pub source: Option<String>,
    pub description: String,
}

/// Composition and allocation without any elicitation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PanelPreview {
    pub seed: u64,
    pub composition: CompositionReport,
    pub raking: Option<RakingReport>,
    pub context_chunks: usize,
    pub allocation: Allocation,
    pub personas: Vec<PreviewPersona>,
}

// --- WIRING ---

/// Provider capabilities for one engine; a run uses exactly one of each.
#[derive(Clone)]
pub struct Providers {
    pub elicitation: Arc<dyn ElicitationProvider>,
    pub embedding: Arc<dyn EmbeddingProvider>,
    pub writer: Option<Arc<dyn PersonaWriter>>,
}

impl Providers {
    pub fn demo() -> Self {
        Self {
            elicitation: Arc::new(DemoProvider::new()),
            embedding: Arc::new(HashingEmbedder::default()),
            writer: None,
        }
    }

    pub fn from_settings(settings: &AppSettings) -> Result<Self> {
        let url = match (&settings.bridge_url, settings.demo_mode) {
            (Some(url), false) => url,
            (None, false) => {
                warn!("no bridge_url configured, running with demo providers");
                return Ok(Self::demo());
            }
            (_, true) => {
                info!("demo mode enabled");
                return Ok(Self::demo());
            }
        };
        let bridge = Arc::new(InferenceBridge::new(
            url,
            &settings.model,
            &settings.embedding_model,
            settings.request_timeout(),
        )?);
        info!(%url, model = %settings.model, "inference bridge configured");
        Ok(Self {
            elicitation: bridge.clone(),
            embedding: bridge.clone(),
            writer: Some(bridge as Arc<dyn PersonaWriter>),
        })
    }
}

/// Process-wide caches, shared by every run of an engine.
#[derive(Clone)]
pub struct Caches {
    pub responses: Arc<dyn CacheStore<String>>,
    pub embeddings: Arc<dyn CacheStore<Arc<Vec<f32>>>>,
}

impl Caches {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            responses: Arc::new(ResponseCache::new(settings.cache_ttl(), settings.cache_capacity)),
            embeddings: Arc::new(EmbeddingCache::new(settings.cache_ttl(), settings.cache_capacity)),
        }
    }
}

// Panel snapshot and draws shared by every question of a run.
struct PreparedPanel {
    panel: Panel,
    composition: CompositionReport,
    raking: Option<RakingReport>,
    context_chunks: usize,
    allocation: Allocation,
}

pub struct SimulationEngine {
    settings: AppSettings,
    library: PersonaLibrary,
    anchors: AnchorRegistry,
    coordinator: ElicitationCoordinator,
    mapper: SsrMapper,
    writer: Option<Arc<dyn PersonaWriter>>,
    http: reqwest::Client,
}

impl SimulationEngine {
    pub fn new(
        settings: AppSettings,
        library: PersonaLibrary,
        anchors: AnchorRegistry,
        providers: Providers,
        caches: Caches,
    ) -> Result<Self> {
        settings.validate()?;
        let coordinator = ElicitationCoordinator::new(providers.elicitation, caches.responses, settings.max_concurrency)
            .with_policy(RetryPolicy {
                max_retries: 1,
                retry_temperature_factor: settings.retry_temperature_factor,
            })
            .with_request_timeout(Some(settings.request_timeout()));
        let mapper = SsrMapper::new(
            providers.embedding,
            caches.embeddings,
            settings.ssr_epsilon,
            settings.max_concurrency,
        );
        let http = reqwest::Client::builder().timeout(settings.request_timeout()).build()?;
        Ok(Self {
            settings,
            library,
            anchors,
            coordinator,
            mapper,
            writer: providers.writer,
            http,
        })
    }

    /// Loads the persona library and anchor banks from the configured paths.
    pub fn from_settings(settings: AppSettings) -> Result<Self> {
        let library = PersonaLibrary::load_dir(&settings.persona_library_path)?;
        let anchors = AnchorRegistry::load_dir(&settings.anchor_bank_path)?;
        let providers = Providers::from_settings(&settings)?;
        let caches = Caches::from_settings(&settings);
        Self::new(settings, library, anchors, providers, caches)
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn library(&self) -> &PersonaLibrary {
        &self.library
    }

    pub fn anchors(&self) -> &AnchorRegistry {
        &self.anchors
    }

    /// Composition + allocation only. No provider is called unless a
    /// generation source uses the `llm` strategy.
    pub async fn preview(
        &self,
        inputs: &PanelInputs,
        context: Option<&PanelContextSpec>,
        options: &SimulationOptions,
    ) -> Result<PanelPreview> {
        let seed = options.seed.unwrap_or_else(random_seed);
        let prepared = self.prepare_panel(inputs, context, options, seed).await?;
        let personas = prepared
            .panel
            .personas()
            .iter()
            .zip(&prepared.allocation.draws)
            .map(|(persona, draws)| PreviewPersona {
                name: persona.name.clone(),
                weight: persona.weight,
                draws: *draws,
                source: persona.source.clone(),
                description: persona.describe(),
            })
            .collect();
        Ok(PanelPreview {
            seed,
            composition: prepared.composition,
            raking: prepared.raking,
            context_chunks: prepared.context_chunks,
            allocation: prepared.allocation,
            personas,
        })
    }

    /// Evidence-driven segments on their own, for review before a run.
    pub async fn synthesize_audience(&self, task: &AudienceTask, seed: Option<u64>) -> Result<AudiencePanel> {
        let seed = seed.unwrap_or_else(random_seed);
        build_audience(task, seed, self.writer.as_deref()).await
    }

    pub async fn run(&self, request: &SimulationRequest) -> Result<SimulationResult> {
        self.run_with_progress(request, |_, _| {}).await
    }

    /// Runs the simulation, reporting `(stage, fraction)` as it goes.
    pub async fn run_with_progress<F>(&self, request: &SimulationRequest, progress: F) -> Result<SimulationResult>
    where
        F: Fn(&str, f32) + Send + Sync,
    {
        let started_at = Utc::now();
        let seed = request.options.seed.unwrap_or_else(random_seed);
        let span = info_span!("simulation", seed, intent = %request.intent);

        async move {
            // 1. Validate everything that can fail before a provider is touched
            let questions = build_questions(
                &request.intent,
                request.intent_question.as_deref(),
                &request.questions,
            )?;
            for question in &questions {
                self.anchors.get(&question.intent)?;
            }
            let temperature = request.options.temperature.unwrap_or(self.settings.base_temperature);
            if !(0.0..=2.0).contains(&temperature) {
                return Err(SsrError::validation(format!("temperature {} must lie in [0, 2]", temperature)));
            }
            let aggregation = AggregationOptions {
                bootstrap_samples: request.options.bootstrap_samples.unwrap_or(self.settings.bootstrap_samples),
                min_valid_samples: request
                    .options
                    .min_valid_samples
                    .unwrap_or(self.settings.min_valid_samples)
                    .max(1),
                seed,
            };
            let coordinator = self.coordinator.for_model(request.options.model.as_deref());
            let concept = Arc::new(ingest_concept(&self.http, &request.concept).await?);
            progress("concept", 0.05);

            // 2. Panel snapshot and draws, fixed for every question
            let prepared = self
                .prepare_panel(&request.panel, request.panel_context.as_ref(), &request.options, seed)
                .await?;
            progress("panel", 0.15);

            // 3. Question loop
            let mut outcomes = Vec::with_capacity(questions.len());
            for (index, question) in questions.iter().enumerate() {
                let outcome = self
                    .run_question(&coordinator, &prepared, &concept, question, temperature, seed, &aggregation)
                    .instrument(info_span!("question", id = %question.id))
                    .await;
                outcomes.push(outcome);
                progress("questions", 0.15 + 0.85 * (index + 1) as f32 / questions.len() as f32);
            }

            let metadata = SimulationMetadata {
                seed,
                intent: request.intent.trim().to_string(),
                provider: coordinator.provider_name().to_string(),
                model: coordinator.model().to_string(),
                embedding_model: self.mapper.embedding_model().to_string(),
                concept: ConceptArtifact::clone(&concept),
                persona_summary: prepared.panel.summary(),
                composition: prepared.composition,
                raking: prepared.raking,
                context_chunks: prepared.context_chunks,
                allocation: prepared.allocation,
                excluded_elicitation: outcomes.iter().map(|q| q.diagnostics.excluded_elicitation).sum(),
                excluded_mapping: outcomes.iter().map(|q| q.diagnostics.excluded_mapping).sum(),
                question_sample_sizes: outcomes
                    .iter()
                    .map(|q| (q.question.id.clone(), q.diagnostics.mapped))
                    .collect(),
                started_at,
                finished_at: Utc::now(),
            };
            info!(
                questions = outcomes.len(),
                reported = outcomes.iter().filter(|q| q.status == QuestionStatus::Reported).count(),
                "simulation complete"
            );
            Ok(SimulationResult {
                questions: outcomes,
                metadata,
            })
        }
        .instrument(span)
        .await
    }

    async fn prepare_panel(
        &self,
        inputs: &PanelInputs,
        context: Option<&PanelContextSpec>,
        options: &SimulationOptions,
        seed: u64,
    ) -> Result<PreparedPanel> {
        // Compose
        let composer = PersonaComposer::new(&self.library, seed).with_writer(self.writer.as_deref());
        let composition = composer.compose(&inputs.sources()).await?;
        let mut panel = composition.panel;

        // Rake
        let mut raking = None;
        if let Some(marginals) = inputs.marginals() {
            let config = inputs
                .raking()
                .cloned()
                .unwrap_or_default()
                .with_default_tolerance(self.settings.raking_tolerance);
            config.validate()?;
            if config.enabled {
                let (raked, report) = rake(&panel, marginals, &config)?;
                panel = raked;
                raking = Some(report);
            } else {
                info!("marginals supplied but raking disabled");
            }
        }

        // Context
        let mut context_chunks = 0;
        if let Some(spec) = context {
            let (with_context, chunks) = apply_panel_context(&panel, spec, seed)?;
            panel = with_context;
            context_chunks = chunks;
        }

        // Allocate
        let n = options.n.unwrap_or(self.settings.default_sample_size);
        let allocation = allocate(&panel, n, options.total_n, options.stratified)?;

        Ok(PreparedPanel {
            panel,
            composition: composition.report,
            raking,
            context_chunks,
            allocation,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_question(
        &self,
        coordinator: &ElicitationCoordinator,
        prepared: &PreparedPanel,
        concept: &Arc<ConceptArtifact>,
        question: &Question,
        temperature: f32,
        seed: u64,
        aggregation: &AggregationOptions,
    ) -> QuestionOutcome {
        let panel = &prepared.panel;

        // Elicit
        let batch = coordinator
            .elicit_question(panel, &prepared.allocation, concept, question, temperature, seed)
            .await;

        let mut records: BTreeMap<(usize, usize), RespondentRecord> = BTreeMap::new();
        let mut accepted: Vec<((usize, usize), String)> = Vec::new();
        for (key, elicited) in batch {
            let (state, rationale) = match elicited.outcome {
                Ok(text) => {
                    accepted.push((key, text.clone()));
                    (RespondentState::Elicited, Some(text))
                }
                Err(err) => (
                    RespondentState::Excluded {
                        stage: ExclusionStage::Elicitation,
                        reason: err.to_string(),
                    },
                    None,
                ),
            };
            records.insert(
                key,
                RespondentRecord {
                    question_id: question.id.clone(),
                    persona_index: key.0,
                    persona_name: panel.get(key.0).map(|p| p.name.clone()).unwrap_or_default(),
                    draw: key.1,
                    seed: elicited.seed,
                    provider: coordinator.provider_name().to_string(),
                    model: coordinator.model().to_string(),
                    temperature: elicited.temperature,
                    attempts: elicited.attempts,
                    retried: elicited.retried,
                    cache_hit: elicited.cache_hit,
                    rationale,
                    pmf: None,
                    expected_rating: None,
                    state,
                },
            );
        }

        // Map
        let mut scored = Vec::with_capacity(accepted.len());
        let mut failure = None;
        let bank_result = self.anchors.get(&question.intent);
        let anchor_vectors = match bank_result {
            Ok(bank) => self.mapper.prepare_anchors(bank).await.map_err(SsrError::from),
            Err(err) => Err(err),
        };
        match anchor_vectors {
            Ok(anchor_vectors) => {
                for (key, mapped) in self.mapper.map_batch(accepted, &anchor_vectors).await {
                    let Some(record) = records.get_mut(&key) else { continue };
                    match mapped {
                        Ok(pmf) => {
                            record.pmf = Some(pmf);
                            record.expected_rating = Some(expected_rating(&pmf));
                            record.state = RespondentState::Mapped;
                            scored.push(ScoredRespondent {
                                persona_index: key.0,
                                pmf,
                            });
                        }
                        Err(err) => {
                            record.state = RespondentState::Excluded {
                                stage: ExclusionStage::Mapping,
                                reason: err.to_string(),
                            };
                        }
                    }
                }
            }
            Err(err) => {
                warn!(question = %question.id, error = %err, "anchor bank could not be embedded");
                for record in records.values_mut().filter(|r| r.state == RespondentState::Elicited) {
                    record.state = RespondentState::Excluded {
                        stage: ExclusionStage::Mapping,
                        reason: format!("anchor embedding failed: {}", err),
                    };
                }
                failure = Some(err.to_string());
            }
        }

        // Aggregate
        let mut aggregate = None;
        let distributions = if failure.is_some() {
            persona_distributions(panel, &scored)
        } else {
            match aggregate_question(&question.id, panel, &scored, aggregation) {
                Ok((distributions, result)) => {
                    for record in records.values_mut().filter(|r| r.state == RespondentState::Mapped) {
                        record.state = RespondentState::Aggregated;
                    }
                    aggregate = Some(result);
                    distributions
                }
                Err(err) => {
                    warn!(question = %question.id, error = %err, "question not reportable");
                    failure = Some(err.to_string());
                    persona_distributions(panel, &scored)
                }
            }
        };

        let respondents: Vec<RespondentRecord> = records.into_values().collect();
        let personas = persona_outcomes(panel, &prepared.allocation, &respondents, distributions);
        let diagnostics = diagnostics(&respondents);
        QuestionOutcome {
            question: question.clone(),
            status: if aggregate.is_some() {
                QuestionStatus::Reported
            } else {
                QuestionStatus::Failed
            },
            aggregate,
            error: failure,
            personas,
            diagnostics,
            respondents,
        }
    }
}

fn persona_outcomes(
    panel: &Panel,
    allocation: &Allocation,
    respondents: &[RespondentRecord],
    distributions: Vec<Option<LikertDistribution>>,
) -> Vec<PersonaOutcome> {
    panel
        .personas()
        .iter()
        .zip(distributions)
        .enumerate()
        .map(|(index, (persona, distribution))| {
            let rationales: Vec<String> = respondents
                .iter()
                .filter(|r| r.persona_index == index)
                .filter_map(|r| r.rationale.clone())
                .collect();
            PersonaOutcome {
                persona_index: index,
                name: persona.name.clone(),
                weight: persona.weight,
                draws: allocation.draws.get(index).copied().unwrap_or(0),
                distribution,
                themes: top_themes(&rationales, THEMES_PER_PERSONA),
                rationales,
            }
        })
        .collect()
}

fn diagnostics(respondents: &[RespondentRecord]) -> QuestionDiagnostics {
    let excluded_at = |stage: ExclusionStage| {
        respondents
            .iter()
            .filter(|r| matches!(&r.state, RespondentState::Excluded { stage: s, .. } if *s == stage))
            .count()
    };
    QuestionDiagnostics {
        respondents: respondents.len(),
        elicited: respondents.iter().filter(|r| r.rationale.is_some()).count(),
        mapped: respondents.iter().filter(|r| r.pmf.is_some()).count(),
        excluded_elicitation: excluded_at(ExclusionStage::Elicitation),
        excluded_mapping: excluded_at(ExclusionStage::Mapping),
        retried: respondents.iter().filter(|r| r.retried).count(),
        cache_hits: respondents.iter().filter(|r| r.cache_hit).count(),
    }
}
