// src/composer.rs
// PERSONA COMPOSER
// Evaluates every persona source into a bucket, reserves the declared weight
// shares and folds the buckets into one normalized Panel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audience_builder::{build_audience, AudienceTask};
use crate::error::{Result, SsrError};
use crate::persona::{normalize_weights, Panel, Persona, WEIGHT_TOLERANCE};
use crate::persona_generator::{generate_personas, GenerationTask};
use crate::persona_library::{
    personas_from_csv_path, personas_from_csv_str, validate_share, PersonaFilter, PersonaLibrary,
};
use crate::provider::PersonaWriter;
use crate::raking::RakingConfig;
use crate::seeds::derive_seed;

pub const DEFAULT_PERSONA_NAME: &str = "General Consumer";

/// Personas supplied verbatim, optionally with a reserved share.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersonaInjection {
    #[serde(default)]
    pub label: Option<String>,
    pub personas: Vec<Persona>,
    #[serde(default)]
    pub weight_share: Option<f64>,
}

/// One input to the composer. Each variant yields zero or more personas.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersonaSource {
    Explicit {
        personas: Vec<Persona>,
        #[serde(default)]
        weight_share: Option<f64>,
    },
    CsvBlock {
        #[serde(default)]
        csv: Option<String>,
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        weight_share: Option<f64>,
    },
    LibraryGroup {
        group: String,
        #[serde(default)]
        weight_share: Option<f64>,
    },
    Filter(PersonaFilter),
    Generation(GenerationTask),
    Audience(AudienceTask),
    Injection(PersonaInjection),
}

impl PersonaSource {
    pub fn weight_share(&self) -> Option<f64> {
        match self {
            PersonaSource::Explicit { weight_share, .. }
            | PersonaSource::CsvBlock { weight_share, .. }
            | PersonaSource::LibraryGroup { weight_share, .. } => *weight_share,
            PersonaSource::Filter(filter) => filter.weight_share,
            PersonaSource::Generation(task) => task.weight_share,
            PersonaSource::Audience(task) => task.weight_share,
            PersonaSource::Injection(injection) => injection.weight_share,
        }
    }

    pub fn label(&self, index: usize) -> String {
        match self {
            PersonaSource::Explicit { .. } => "explicit".to_string(),
            PersonaSource::CsvBlock { path: Some(path), .. } => format!("csv:{}", path.display()),
            PersonaSource::CsvBlock { .. } => "csv".to_string(),
            PersonaSource::LibraryGroup { group, .. } => format!("group:{}", group),
            PersonaSource::Filter(filter) => match &filter.group {
                Some(group) => format!("filter#{}:{}", index + 1, group),
                None => format!("filter#{}", index + 1),
            },
            PersonaSource::Generation(task) => {
                let prompt: String = task.prompt.chars().take(40).collect();
                format!("generation#{}:{}", index + 1, prompt.trim())
            }
            PersonaSource::Audience(task) => format!("audience#{}:{}", index + 1, task.label()),
            PersonaSource::Injection(injection) => match &injection.label {
                Some(label) => format!("injection:{}", label),
                None => format!("injection#{}", index + 1),
            },
        }
    }
}

/// Population definition loadable from YAML or JSON.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PopulationSpec {
    #[serde(default)]
    pub base_group: Option<String>,
    #[serde(default)]
    pub persona_csv: Option<PathBuf>,
    #[serde(default)]
    pub filters: Vec<PersonaFilter>,
    #[serde(default)]
    pub generations: Vec<GenerationTask>,
    #[serde(default)]
    pub injections: Vec<PersonaInjection>,
    /// attribute -> category -> target proportion
    #[serde(default)]
    pub marginals: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    pub raking: Option<RakingConfig>,
}

impl PopulationSpec {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn sources(&self) -> Vec<PersonaSource> {
        let mut sources = Vec::new();
        if let Some(group) = &self.base_group {
            sources.push(PersonaSource::LibraryGroup {
                group: group.clone(),
                weight_share: None,
            });
        }
        if let Some(path) = &self.persona_csv {
            sources.push(PersonaSource::CsvBlock {
                csv: None,
                path: Some(path.clone()),
                weight_share: None,
            });
        }
        sources.extend(self.filters.iter().cloned().map(PersonaSource::Filter));
        sources.extend(self.generations.iter().cloned().map(PersonaSource::Generation));
        sources.extend(self.injections.iter().cloned().map(PersonaSource::Injection));
        sources
    }
}

/// Persona-related fields of a simulation request, before ordering.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PanelInputs {
    #[serde(default)]
    pub personas: Vec<Persona>,
    /// Inline CSV block.
    #[serde(default)]
    pub persona_csv: Option<String>,
    #[serde(default)]
    pub persona_group: Option<String>,
    #[serde(default)]
    pub persona_filters: Vec<PersonaFilter>,
    #[serde(default)]
    pub persona_generations: Vec<GenerationTask>,
    /// Evidence-driven segments.
    #[serde(default)]
    pub persona_audiences: Vec<AudienceTask>,
    #[serde(default)]
    pub persona_injections: Vec<PersonaInjection>,
    #[serde(default)]
    pub population_spec: Option<PopulationSpec>,
}

impl PanelInputs {
    /// Sources in precedence order: explicit, CSV, library group, runtime
    /// filters/generations/audiences/injections, then the population spec buckets.
    pub fn sources(&self) -> Vec<PersonaSource> {
        let mut sources = Vec::new();
        if !self.personas.is_empty() {
            sources.push(PersonaSource::Explicit {
                personas: self.personas.clone(),
                weight_share: None,
            });
        }
        if let Some(csv) = self.persona_csv.as_deref().filter(|c| !c.trim().is_empty()) {
            sources.push(PersonaSource::CsvBlock {
                csv: Some(csv.to_string()),
                path: None,
                weight_share: None,
            });
        }
        if let Some(group) = self.persona_group.as_deref().filter(|g| !g.trim().is_empty()) {
            sources.push(PersonaSource::LibraryGroup {
                group: group.trim().to_string(),
                weight_share: None,
            });
        }
        sources.extend(self.persona_filters.iter().cloned().map(PersonaSource::Filter));
        sources.extend(self.persona_generations.iter().cloned().map(PersonaSource::Generation));
        sources.extend(self.persona_audiences.iter().cloned().map(PersonaSource::Audience));
        sources.extend(self.persona_injections.iter().cloned().map(PersonaSource::Injection));
        if let Some(spec) = &self.population_spec {
            sources.extend(spec.sources());
        }
        sources
    }

    pub fn marginals(&self) -> Option<&BTreeMap<String, BTreeMap<String, f64>>> {
        self.population_spec
            .as_ref()
            .map(|spec| &spec.marginals)
            .filter(|m| !m.is_empty())
    }

    pub fn raking(&self) -> Option<&RakingConfig> {
        self.population_spec.as_ref().and_then(|spec| spec.raking.as_ref())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketReport {
    pub label: String,
    pub persona_count: usize,
    pub declared_share: Option<f64>,
    pub allocated_share: f64,
    /// Empty bucket whose share was redistributed.
    pub dropped: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositionReport {
    pub buckets: Vec<BucketReport>,
    pub reserved_share: f64,
    pub persona_total: usize,
    pub used_default_persona: bool,
}

#[derive(Clone, Debug)]
pub struct Composition {
    pub panel: Panel,
    pub report: CompositionReport,
}

struct Bucket {
    label: String,
    personas: Vec<Persona>,
    share: Option<f64>,
}

pub fn default_persona() -> Persona {
    Persona::new(DEFAULT_PERSONA_NAME)
        .with_descriptors(&["typical shopper"])
        .with_weight(1.0)
}

/// Builds panels from persona sources.
pub struct PersonaComposer<'a> {
    library: &'a PersonaLibrary,
    writer: Option<&'a dyn PersonaWriter>,
    seed: u64,
}

impl<'a> PersonaComposer<'a> {
    pub fn new(library: &'a PersonaLibrary, seed: u64) -> Self {
        Self {
            library,
            writer: None,
            seed,
        }
    }

    pub fn with_writer(mut self, writer: Option<&'a dyn PersonaWriter>) -> Self {
        self.writer = writer;
        self
    }

    async fn evaluate(&self, index: usize, source: &PersonaSource) -> Result<Vec<Persona>> {
        validate_share(source.weight_share(), &source.label(index))?;
        match source {
            PersonaSource::Explicit { personas, .. } => Ok(personas.clone()),
            PersonaSource::CsvBlock { csv, path, .. } => match (csv, path) {
                (Some(text), _) => personas_from_csv_str(text),
                (None, Some(path)) => personas_from_csv_path(path),
                (None, None) => Err(SsrError::validation("CSV source needs inline text or a path")),
            },
            PersonaSource::LibraryGroup { group, .. } => {
                Ok(self.library.get_group(group)?.personas.clone())
            }
            PersonaSource::Filter(filter) => self.library.filter(filter),
            PersonaSource::Generation(task) => {
                let seed = derive_seed(self.seed, &["generation", &index.to_string()]);
                generate_personas(task, seed, self.writer).await
            }
            PersonaSource::Audience(task) => {
                let seed = derive_seed(self.seed, &["audience", &index.to_string()]);
                Ok(build_audience(task, seed, self.writer).await?.personas)
            }
            PersonaSource::Injection(injection) => Ok(injection.personas.clone()),
        }
    }

    /// Composes `sources` into one Panel. An empty source list yields the
    /// single default persona.
    pub async fn compose(&self, sources: &[PersonaSource]) -> Result<Composition> {
        if sources.is_empty() {
            info!("no persona sources supplied, using default persona");
            let persona = default_persona();
            let report = CompositionReport {
                buckets: vec![BucketReport {
                    label: "default".to_string(),
                    persona_count: 1,
                    declared_share: None,
                    allocated_share: 1.0,
                    dropped: false,
                }],
                reserved_share: 0.0,
                persona_total: 1,
                used_default_persona: true,
            };
            return Ok(Composition {
                panel: Panel::new(vec![persona])?,
                report,
            });
        }

        // 1. Evaluate every source, preserving order
        let mut buckets = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let label = source.label(index);
            let mut personas = self.evaluate(index, source).await?;
            for persona in personas.iter_mut() {
                persona.source.get_or_insert_with(|| label.clone());
            }
            debug!(%label, personas = personas.len(), share = ?source.weight_share(), "evaluated persona source");
            buckets.push(Bucket {
                label,
                personas,
                share: source.weight_share(),
            });
        }

        let (panel_personas, report) = allocate_buckets(buckets)?;
        info!(
            personas = report.persona_total,
            buckets = report.buckets.len(),
            reserved = report.reserved_share,
            "panel composed"
        );
        Ok(Composition {
            panel: Panel::new(panel_personas)?,
            report,
        })
    }
}

fn raw_mass(personas: &[Persona]) -> f64 {
    personas
        .iter()
        .map(|p| if p.weight.is_finite() && p.weight > 0.0 { p.weight } else { 0.0 })
        .sum()
}

fn allocate_buckets(buckets: Vec<Bucket>) -> Result<(Vec<Persona>, CompositionReport)> {
    // 2. Reserved mass over non-empty buckets
    let reserved: f64 = buckets
        .iter()
        .filter(|b| !b.personas.is_empty())
        .filter_map(|b| b.share)
        .sum();
    if reserved > 1.0 + WEIGHT_TOLERANCE {
        return Err(SsrError::validation(format!(
            "declared weight shares sum to {:.6}, which exceeds 1.0",
            reserved
        )));
    }

    for bucket in buckets.iter().filter(|b| b.personas.is_empty()) {
        warn!(label = %bucket.label, share = ?bucket.share, "persona source produced no personas, dropping it");
    }

    let live: Vec<usize> = (0..buckets.len()).filter(|&i| !buckets[i].personas.is_empty()).collect();
    if live.is_empty() {
        return Err(SsrError::validation("persona composition produced no personas"));
    }
    let unshared: Vec<usize> = live.iter().copied().filter(|&i| buckets[i].share.is_none()).collect();

    // 3. Allocate a share to every live bucket
    let mut allocated = vec![0.0; buckets.len()];
    if !unshared.is_empty() {
        for &i in &live {
            if let Some(share) = buckets[i].share {
                allocated[i] = share;
            }
        }
        let mut split: Vec<f64> = unshared.iter().map(|&i| raw_mass(&buckets[i].personas)).collect();
        normalize_weights(&mut split, (1.0 - reserved).max(0.0));
        for (slot, &i) in unshared.iter().enumerate() {
            allocated[i] = split[slot];
        }
    } else {
        // Nothing can absorb the remainder: scale the declared shares up.
        let mut shares: Vec<f64> = live.iter().map(|&i| buckets[i].share.unwrap_or(0.0)).collect();
        normalize_weights(&mut shares, 1.0);
        for (slot, &i) in live.iter().enumerate() {
            allocated[i] = shares[slot];
        }
    }

    // 4. Within-bucket normalization, 5. union in bucket order
    let mut personas = Vec::new();
    let mut reports = Vec::with_capacity(buckets.len());
    for (i, bucket) in buckets.into_iter().enumerate() {
        let dropped = bucket.personas.is_empty();
        reports.push(BucketReport {
            label: bucket.label,
            persona_count: bucket.personas.len(),
            declared_share: bucket.share,
            allocated_share: allocated[i],
            dropped,
        });
        if dropped {
            continue;
        }
        let mut weights: Vec<f64> = bucket.personas.iter().map(|p| p.weight).collect();
        normalize_weights(&mut weights, allocated[i]);
        personas.extend(
            bucket
                .personas
                .into_iter()
                .zip(weights)
                .map(|(persona, weight)| persona.with_weight(weight)),
        );
    }

    // Absorb floating point drift so the panel invariant holds exactly.
    let mut weights: Vec<f64> = personas.iter().map(|p| p.weight).collect();
    normalize_weights(&mut weights, 1.0);
    for (persona, weight) in personas.iter_mut().zip(weights) {
        persona.weight = weight.min(1.0);
    }

    let report = CompositionReport {
        persona_total: personas.len(),
        buckets: reports,
        reserved_share: reserved,
        used_default_persona: false,
    };
    Ok((personas, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona_library::PersonaGroup;

    fn base_library() -> PersonaLibrary {
        PersonaLibrary::from_groups(vec![PersonaGroup {
            name: "base".into(),
            description: String::new(),
            source: None,
            personas: vec![
                Persona::new("A").with_weight(0.5).with_attribute("age", "25-44"),
                Persona::new("B").with_weight(0.5).with_attribute("age", "45-64"),
            ],
        }])
    }

    fn weights(composition: &Composition) -> Vec<f64> {
        composition.panel.weights()
    }

    #[tokio::test]
    async fn reserved_shares_and_remnant_split() {
        let library = base_library();
        let mut generation = GenerationTask::new("C", 1);
        generation.weight_share = Some(0.3);
        let sources = vec![
            PersonaSource::LibraryGroup {
                group: "base".into(),
                weight_share: None,
            },
            PersonaSource::Filter(PersonaFilter {
                group: Some("base".into()),
                include: BTreeMap::from([("name".into(), vec!["A".into()])]),
                weight_share: Some(0.4),
                ..Default::default()
            }),
            PersonaSource::Generation(generation),
            PersonaSource::Injection(PersonaInjection {
                label: None,
                personas: vec![Persona::new("D")],
                weight_share: Some(0.2),
            }),
        ];

        let composition = PersonaComposer::new(&library, 9).compose(&sources).await.unwrap();
        let names: Vec<&str> = composition.panel.personas().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["A", "B", "A", "C #1", "D"]);
        let expected = [0.05, 0.05, 0.4, 0.3, 0.2];
        for (got, want) in weights(&composition).iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{got} vs {want}");
        }
        assert!((weights(&composition).iter().sum::<f64>() - 1.0).abs() < 1e-6);
        assert!((composition.report.reserved_share - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn shares_above_one_are_rejected() {
        let library = base_library();
        let sources = vec![
            PersonaSource::Injection(PersonaInjection {
                label: None,
                personas: vec![Persona::new("X")],
                weight_share: Some(0.7),
            }),
            PersonaSource::Injection(PersonaInjection {
                label: None,
                personas: vec![Persona::new("Y")],
                weight_share: Some(0.6),
            }),
        ];
        let err = PersonaComposer::new(&library, 1).compose(&sources).await.unwrap_err();
        assert!(matches!(err, SsrError::Validation(_)));
    }

    #[tokio::test]
    async fn empty_bucket_share_is_redistributed_and_reported() {
        let library = base_library();
        let sources = vec![
            PersonaSource::LibraryGroup {
                group: "base".into(),
                weight_share: None,
            },
            PersonaSource::Filter(PersonaFilter {
                keywords: vec!["nobody matches this".into()],
                weight_share: Some(0.5),
                ..Default::default()
            }),
        ];
        let composition = PersonaComposer::new(&library, 1).compose(&sources).await.unwrap();
        assert_eq!(weights(&composition), vec![0.5, 0.5]);
        assert!(composition.report.buckets[1].dropped);
        assert_eq!(composition.report.buckets[1].declared_share, Some(0.5));
    }

    #[tokio::test]
    async fn only_shared_buckets_are_scaled_to_one() {
        let library = base_library();
        let sources = vec![
            PersonaSource::Injection(PersonaInjection {
                label: Some("x".into()),
                personas: vec![Persona::new("X")],
                weight_share: Some(0.2),
            }),
            PersonaSource::Injection(PersonaInjection {
                label: Some("y".into()),
                personas: vec![Persona::new("Y"), Persona::new("Y")],
                weight_share: Some(0.2),
            }),
        ];
        let composition = PersonaComposer::new(&library, 1).compose(&sources).await.unwrap();
        let w = weights(&composition);
        assert!((w[0] - 0.5).abs() < 1e-9);
        assert!((w[1] - 0.25).abs() < 1e-9);
        assert_eq!(composition.panel.len(), 3, "duplicate names stay distinct");
    }

    #[tokio::test]
    async fn no_sources_uses_default_persona_but_empty_sources_fail() {
        let library = base_library();
        let composer = PersonaComposer::new(&library, 1);
        let composition = composer.compose(&[]).await.unwrap();
        assert_eq!(composition.panel.personas()[0].name, DEFAULT_PERSONA_NAME);
        assert!(composition.report.used_default_persona);

        let sources = vec![PersonaSource::Explicit {
            personas: Vec::new(),
            weight_share: None,
        }];
        assert!(matches!(composer.compose(&sources).await, Err(SsrError::Validation(_))));
    }

    #[tokio::test]
    async fn unknown_group_fails_fast() {
        let library = base_library();
        let sources = vec![PersonaSource::LibraryGroup {
            group: "missing".into(),
            weight_share: None,
        }];
        let err = PersonaComposer::new(&library, 1).compose(&sources).await.unwrap_err();
        assert!(matches!(err, SsrError::Validation(_)));
    }

    #[tokio::test]
    async fn audience_source_reserves_its_share() {
        let library = base_library();
        let mut audience = AudienceTask::new(vec![crate::audience_builder::EvidenceFile::new(
            "survey.csv",
            "age,region\n25-44,North\n25-44,South\n25-44,North\n65+,North\n",
        )]);
        audience.weight_share = Some(0.5);
        let inputs = PanelInputs {
            persona_group: Some("base".into()),
            persona_audiences: vec![audience],
            ..Default::default()
        };
        let sources = inputs.sources();
        assert_eq!(sources[1].label(1), "audience#2:survey.csv");

        let composition = PersonaComposer::new(&library, 4).compose(&sources).await.unwrap();
        let names: Vec<&str> = composition.panel.personas().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["A", "B", "Age 25-44 Segment", "Age 65+ Segment"]);
        let expected = [0.25, 0.25, 0.375, 0.125];
        for (got, want) in weights(&composition).iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{got} vs {want}");
        }
        assert_eq!(composition.panel.personas()[2].category("region"), Some("North"));
    }

    #[test]
    fn panel_inputs_follow_precedence() {
        let inputs = PanelInputs {
            personas: vec![Persona::new("E")],
            persona_csv: Some("name\nZ\n".into()),
            persona_group: Some("base".into()),
            population_spec: Some(PopulationSpec {
                base_group: Some("other".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let labels: Vec<String> = inputs.sources().iter().enumerate().map(|(i, s)| s.label(i)).collect();
        assert_eq!(labels, ["explicit", "csv", "group:base", "group:other"]);
    }

    #[test]
    fn population_spec_parses_from_yaml() {
        let spec = PopulationSpec::from_yaml_str(
            "base_group: base\nfilters:\n  - include: {age: [25-44]}\n    weight_share: 0.3\nmarginals:\n  age: {'25-44': 0.6, '45-64': 0.4}\nraking:\n  enabled: true\n  mode: strict\n",
        )
        .unwrap();
        assert_eq!(spec.sources().len(), 2);
        assert_eq!(spec.marginals["age"]["25-44"], 0.6);
        assert!(spec.raking.unwrap().enabled);
    }
}
