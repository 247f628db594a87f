// src/persona_generator.rs
// GENERATION SOURCE: synthesises personas for an audience slice described in free text.
// Heuristic mode is offline and seeded; LLM mode asks a PersonaWriter for JSON and
// falls back to the heuristic generator on any failure.

use std::collections::{BTreeMap, HashSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SsrError};
use crate::persona::{canonical_field, Persona};
use crate::persona_library::{persona_from_yaml, validate_share};
use crate::provider::PersonaWriter;
use crate::seeds::derive_seed;

pub const MAX_GENERATED_PERSONAS: usize = 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStrategy {
    #[default]
    Heuristic,
    #[serde(alias = "openai")]
    Llm,
}

/// Partial persona used to seed generation; missing values are filled in.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersonaTemplate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub traits: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub descriptors: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub weight: Option<f64>,
}

impl PersonaTemplate {
    fn to_persona(&self, fallback_name: &str) -> Persona {
        let mut persona = Persona::new(self.name.as_deref().unwrap_or(fallback_name));
        for (field, value) in &self.attributes {
            persona.set_attribute(field, value);
        }
        for (field, values) in &self.traits {
            persona.traits.insert(canonical_field(field), values.clone());
        }
        persona.descriptors = self.descriptors.clone();
        persona.notes = self.notes.clone();
        persona.source = self.source.clone();
        persona.weight = self.weight.filter(|w| *w > 0.0).unwrap_or(1.0);
        persona
    }
}

fn default_count() -> usize {
    3
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationTask {
    pub prompt: String,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default)]
    pub strategy: GenerationStrategy,
    #[serde(default)]
    pub weight_share: Option<f64>,
    /// Overrides applied to every generated persona (e.g. region=US).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub templates: Vec<PersonaTemplate>,
}

impl GenerationTask {
    pub fn new(prompt: &str, count: usize) -> Self {
        Self {
            prompt: prompt.to_string(),
            count,
            strategy: GenerationStrategy::Heuristic,
            weight_share: None,
            attributes: BTreeMap::new(),
            templates: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_GENERATED_PERSONAS).contains(&self.count) {
            return Err(SsrError::validation(format!(
                "generation count {} must lie in [1, {}]",
                self.count, MAX_GENERATED_PERSONAS
            )));
        }
        validate_share(self.weight_share, "persona generation")
    }
}

// --- ARCHETYPE STRATEGY ---
// Generated slices rotate through these outlooks so a batch is not uniform.
const ARCHETYPES: [&str; 4] = [
    "early adopter",
    "budget-conscious",
    "quality-focused",
    "skeptic",
];

const CHANNEL_POOL: [&str; 6] = [
    "social media",
    "word of mouth",
    "email",
    "online reviews",
    "in-store displays",
    "video platforms",
];

const AGE_KEYWORDS: [(&str, &[&str]); 4] = [
    ("18-24", &["gen z", "student", "students", "campus", "college", "youth", "teen", "teens"]),
    ("25-44", &["millennial", "millennials", "parent", "parents", "young professional", "career"]),
    ("45-64", &["midlife", "caregiver", "manager", "managers", "established"]),
    ("65+", &["senior", "seniors", "retiree", "retirees", "older"]),
];

pub(crate) fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let Ok(word) = Regex::new(r"[A-Za-z][A-Za-z\-']{2,}") else {
        return Vec::new();
    };
    let mut deduped: Vec<String> = Vec::new();
    for m in word.find_iter(&text.to_lowercase()) {
        let w = m.as_str().to_string();
        if !deduped.contains(&w) {
            deduped.push(w);
        }
    }
    deduped.truncate(limit);
    deduped
}

fn fallback_name(prompt: &str, index: usize) -> String {
    let cleaned: String = prompt
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect();
    let titled: String = cleaned
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ");
    let base: String = titled.chars().take(40).collect();
    let base = base.trim();
    let base = if base.is_empty() { "Generated Persona" } else { base };
    format!("{} #{}", base, index + 1)
}

fn infer_age(descriptors: &[String], prompt: &str) -> Option<&'static str> {
    let haystack = format!("{} {}", descriptors.join(" "), prompt).to_lowercase();
    let words: HashSet<&str> = haystack.split(|c: char| !c.is_alphanumeric() && c != '-').collect();
    AGE_KEYWORDS.iter().find_map(|(band, keywords)| {
        keywords
            .iter()
            .any(|k| if k.contains(' ') { haystack.contains(k) } else { words.contains(k) })
            .then_some(*band)
    })
}

fn split_values(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Applies task-level overrides. List traits are merged, scalars replaced.
fn apply_attributes(persona: &mut Persona, attributes: &BTreeMap<String, String>) {
    for (field, raw) in attributes {
        let key = canonical_field(field);
        if let Some(current) = persona.traits.get_mut(&key) {
            for value in split_values(raw) {
                if !current.contains(&value) {
                    current.push(value);
                }
            }
        } else if key == "descriptors" {
            for value in split_values(raw) {
                if !persona.descriptors.contains(&value) {
                    persona.descriptors.push(value);
                }
            }
        } else {
            let first = split_values(raw).into_iter().next().unwrap_or_else(|| raw.clone());
            persona.set_attribute(&key, &first);
        }
    }
}

/// Offline generator: keyword extraction, age-band inference and a seeded
/// choice of channels. Deterministic for a given `(task, seed)`.
pub fn generate_heuristic(task: &GenerationTask, seed: u64) -> Vec<Persona> {
    let descriptors = extract_keywords(&task.prompt, 6);
    let focus = descriptors
        .first()
        .cloned()
        .unwrap_or_else(|| {
            let trimmed = task.prompt.trim();
            if trimmed.is_empty() { "audience".to_string() } else { trimmed.to_string() }
        });
    let mut personas: Vec<Persona> = Vec::new();

    for (idx, template) in task.templates.iter().enumerate() {
        let mut persona = template.to_persona(&fallback_name(&task.prompt, idx));
        if persona.descriptors.is_empty() && !descriptors.is_empty() {
            persona.descriptors = descriptors.iter().take(3).cloned().collect();
        }
        if persona.trait_values("motivations").is_empty() && !descriptors.is_empty() {
            persona.traits.insert(
                "motivations".into(),
                vec![
                    format!("Seeks better {} solutions", focus),
                    format!("Values {}-driven benefits", focus),
                ],
            );
        }
        if persona.trait_values("pain_points").is_empty() && !descriptors.is_empty() {
            persona
                .traits
                .insert("pain_points".into(), vec![format!("Frustrated by limited {} options", focus)]);
        }
        if persona.category("age").is_none() {
            if let Some(age) = infer_age(&persona.descriptors, "") {
                persona.set_attribute("age", age);
            }
        }
        apply_attributes(&mut persona, &task.attributes);
        personas.push(persona);
    }

    let remaining = task.count.saturating_sub(personas.len());
    for _ in 0..remaining {
        let index = personas.len();
        let mut rng = StdRng::seed_from_u64(derive_seed(seed, &[task.prompt.as_str(), &index.to_string()]));
        let mut channels = CHANNEL_POOL.to_vec();
        channels.shuffle(&mut rng);

        let mut persona = Persona::new(&fallback_name(&task.prompt, index));
        persona.descriptors = if descriptors.is_empty() {
            vec![focus.clone()]
        } else {
            descriptors.iter().take(3).cloned().collect()
        };
        persona.traits.insert(
            "habits".into(),
            vec![
                format!("Engages with {} content weekly", focus),
                format!("Researches {} recommendations online", focus),
            ],
        );
        persona.traits.insert(
            "motivations".into(),
            vec![
                format!("Wants trustworthy {} solutions", focus),
                format!("Cares about authentic {} experiences", focus),
            ],
        );
        persona.traits.insert(
            "pain_points".into(),
            vec![format!("Overwhelmed by inconsistent {} messaging", focus)],
        );
        persona.traits.insert(
            "preferred_channels".into(),
            channels.iter().take(2).map(|c| c.to_string()).collect(),
        );
        persona.set_attribute("outlook", ARCHETYPES[index % ARCHETYPES.len()]);
        if let Some(age) = infer_age(&descriptors, &task.prompt) {
            persona.set_attribute("age", age);
        }
        persona.source = Some("generated:heuristic".to_string());
        apply_attributes(&mut persona, &task.attributes);
        personas.push(persona);
    }

    personas.truncate(task.count.max(1));
    personas
}

fn build_writer_prompt(task: &GenerationTask) -> String {
    let payload = serde_json::json!({
        "prompt": task.prompt,
        "count": task.count,
        "templates": task.templates,
        "attributes": task.attributes,
    });
    format!(
        "Synthesize realistic consumer personas for the described audience. \
        Return a JSON array where each persona is an object with keys \
        name, age, gender, income, region, occupation, education, household, \
        purchase_frequency, usage, background, habits, motivations, pain_points, \
        preferred_channels, descriptors, notes, weight. \
        Weights should be proportional but do not need to sum to one. \
        Use the provided prompt, attribute hints and optional templates. \
        Return ONLY JSON. Input context:\n{}",
        payload
    )
}

// Strips code fences and chatter around the JSON array.
fn clean_json_text(text: &str) -> String {
    let start = text.find('[').unwrap_or(0);
    let end = text.rfind(']').map(|i| i + 1).unwrap_or(text.len());
    if start < end {
        text[start..end].replace("```json", "").replace("```", "").trim().to_string()
    } else {
        text.to_string()
    }
}

fn parse_written_personas(task: &GenerationTask, raw: &str) -> Result<Vec<Persona>> {
    let parsed: serde_json::Value = serde_json::from_str(&clean_json_text(raw))?;
    let entries = parsed
        .as_array()
        .ok_or_else(|| SsrError::validation("persona writer must return a JSON array"))?;

    let mut used_names = HashSet::new();
    let mut personas = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        let Ok(value) = serde_yaml::to_value(entry) else { continue };
        let Some(mut persona) = persona_from_yaml(&value) else { continue };
        if entry.get("name").and_then(|n| n.as_str()).map_or(true, |n| n.trim().is_empty()) {
            persona.name = fallback_name(&task.prompt, idx);
        }
        // Fallback duplicate handler
        if !used_names.insert(persona.name.clone()) {
            persona.name = format!("{} {}", persona.name, idx + 1);
            used_names.insert(persona.name.clone());
        }
        persona.source.get_or_insert_with(|| "generated:llm".to_string());
        apply_attributes(&mut persona, &task.attributes);
        personas.push(persona);
        if personas.len() >= task.count {
            break;
        }
    }

    if personas.is_empty() {
        return Err(SsrError::validation("persona writer produced no usable personas"));
    }
    Ok(personas)
}

/// Generates the personas for one generation source.
pub async fn generate_personas(
    task: &GenerationTask,
    seed: u64,
    writer: Option<&dyn PersonaWriter>,
) -> Result<Vec<Persona>> {
    task.validate()?;

    if task.strategy == GenerationStrategy::Llm {
        match writer {
            Some(writer) => {
                let outcome = match writer.write_personas(&build_writer_prompt(task)).await {
                    Ok(raw) => parse_written_personas(task, &raw),
                    Err(err) => Err(SsrError::from(err)),
                };
                match outcome {
                    Ok(personas) => {
                        info!(prompt = %task.prompt, count = personas.len(), "generated personas via writer");
                        return Ok(personas);
                    }
                    Err(err) => {
                        warn!(prompt = %task.prompt, error = %err, "persona writer failed, using heuristic generator");
                    }
                }
            }
            None => warn!(prompt = %task.prompt, "no persona writer configured, using heuristic generator"),
        }
    }

    let personas = generate_heuristic(task, seed);
    info!(prompt = %task.prompt, count = personas.len(), "generated personas heuristically");
    Ok(personas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use async_trait::async_trait;

    struct CannedWriter(std::result::Result<String, ProviderError>);

    #[async_trait]
    impl PersonaWriter for CannedWriter {
        async fn write_personas(&self, _prompt: &str) -> std::result::Result<String, ProviderError> {
            self.0.clone()
        }
    }

    #[test]
    fn heuristic_generation_is_seeded_and_sized() {
        let task = GenerationTask::new("Eco-conscious parents in urban areas", 2);
        let first = generate_heuristic(&task, 7);
        let again = generate_heuristic(&task, 7);
        assert_eq!(first.len(), 2);
        assert_eq!(first, again);
        assert!(first.iter().all(|p| !p.descriptors.is_empty()));
        assert_eq!(first[0].name, "Ecoconscious Parents In Urban Areas #1");
        assert_eq!(first[0].category("age"), Some("25-44"));
        assert_eq!(first[1].category("outlook"), Some("budget-conscious"));
    }

    #[test]
    fn attributes_override_generated_values() {
        let mut task = GenerationTask::new("Seniors who garden", 1);
        task.attributes.insert("region".into(), "US".into());
        task.attributes.insert("habits".into(), "composting; farmers markets".into());
        let personas = generate_heuristic(&task, 1);
        assert_eq!(personas[0].category("region"), Some("US"));
        assert_eq!(personas[0].category("age"), Some("65+"));
        assert!(personas[0].trait_values("habits").contains(&"composting".to_string()));
    }

    #[test]
    fn templates_are_filled_in() {
        let mut task = GenerationTask::new("budget travelers", 1);
        task.templates.push(PersonaTemplate {
            name: Some("Backpacker".into()),
            ..Default::default()
        });
        let personas = generate_heuristic(&task, 3);
        assert_eq!(personas[0].name, "Backpacker");
        assert_eq!(personas[0].descriptors, ["budget", "travelers"]);
        assert_eq!(personas[0].trait_values("pain_points").len(), 1);
    }

    #[test]
    fn count_outside_range_is_rejected() {
        assert!(GenerationTask::new("x", 0).validate().is_err());
        assert!(GenerationTask::new("x", 21).validate().is_err());
    }

    #[tokio::test]
    async fn llm_strategy_parses_fenced_json() {
        let mut task = GenerationTask::new("luxury travelers", 2);
        task.strategy = GenerationStrategy::Llm;
        let writer = CannedWriter(Ok(
            "Sure!\n```json\n[{\"name\": \"Ava\", \"age\": \"45-64\", \"habits\": [\"first class\"]}, {\"name\": \"Ava\"}]\n```".into(),
        ));
        let personas = generate_personas(&task, 1, Some(&writer)).await.unwrap();
        assert_eq!(personas.len(), 2);
        assert_eq!(personas[0].category("age"), Some("45-64"));
        assert_eq!(personas[1].name, "Ava 2");
        assert_eq!(personas[0].source.as_deref(), Some("generated:llm"));
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_heuristic() {
        let mut task = GenerationTask::new("luxury travelers", 1);
        task.strategy = GenerationStrategy::Llm;
        let writer = CannedWriter(Err(ProviderError::fatal("no key")));
        let personas = generate_personas(&task, 1, Some(&writer)).await.unwrap();
        assert_eq!(personas.len(), 1);
        assert_eq!(personas[0].source.as_deref(), Some("generated:heuristic"));
    }
}
