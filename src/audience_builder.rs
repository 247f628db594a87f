// src/audience_builder.rs
// AUDIENCE BUILDER
// Turns uploaded evidence (survey exports, JSON dumps, interview notes) into a
// persona source. A PersonaWriter drafts the segments when one is configured;
// otherwise segments are read straight off the evidence rows.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SsrError};
use crate::persona::{canonical_field, Persona};
use crate::persona_generator::{extract_keywords, generate_heuristic, GenerationStrategy, GenerationTask, MAX_GENERATED_PERSONAS};
use crate::persona_library::{persona_from_yaml, validate_share};
use crate::provider::PersonaWriter;

pub const DEFAULT_AUDIENCE_SEGMENTS: usize = 4;

const MAX_SUMMARY_ROWS: usize = 50;
const MAX_SUMMARY_COLUMNS: usize = 10;
const MAX_COLUMN_SAMPLES: usize = 10;
const MAX_JSON_ITEMS: usize = 10;
const MAX_JSON_KEYS: usize = 20;
const MAX_TEXT_CHARS: usize = 5000;
const EVIDENCE_SEPARATOR: &str = "\n\n---\n\n";

// Column names read as the age band of an evidence row.
const AGE_COLUMNS: [&str; 3] = ["age", "age_band", "age_group"];
// Modal value of each of these is copied onto a heuristic segment.
const SEGMENT_FIELDS: [&str; 4] = ["gender", "region", "income", "occupation"];

// --- EVIDENCE PARSING ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvidenceFormat {
    Csv,
    Json,
    Text,
}

/// One uploaded evidence document. The file name's extension picks the parser.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvidenceFile {
    pub name: String,
    pub content: String,
}

impl EvidenceFile {
    pub fn new(name: &str, content: &str) -> Self {
        Self {
            name: name.to_string(),
            content: content.to_string(),
        }
    }

    pub fn format(&self) -> EvidenceFormat {
        let extension = Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);
        match extension.as_deref() {
            Some("csv") => EvidenceFormat::Csv,
            Some("json") => EvidenceFormat::Json,
            _ => EvidenceFormat::Text,
        }
    }

    pub fn summarize(&self) -> String {
        match self.format() {
            EvidenceFormat::Csv => summarize_csv(&self.name, &self.content),
            EvidenceFormat::Json => summarize_json(&self.name, &self.content),
            EvidenceFormat::Text => summarize_text(&self.name, &self.content),
        }
    }
}

fn csv_reader(content: &str) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(content.as_bytes())
}

fn summarize_csv(name: &str, content: &str) -> String {
    let mut rdr = csv_reader(content);
    let headers: Vec<String> = match rdr.headers() {
        Ok(headers) => headers.iter().map(str::to_string).collect(),
        Err(err) => return format!("[{}] Failed to parse CSV: {}", name, err),
    };
    let mut rows = Vec::new();
    for record in rdr.records().take(MAX_SUMMARY_ROWS) {
        match record {
            Ok(record) => rows.push(record),
            Err(err) => return format!("[{}] Failed to parse CSV: {}", name, err),
        }
    }
    if rows.is_empty() {
        return format!("[{}] Empty CSV file.", name);
    }

    let mut lines = vec![
        format!("[{}] CSV with {} rows (showing up to {}).", name, rows.len(), MAX_SUMMARY_ROWS),
        format!("Columns: {}", headers.join(", ")),
    ];
    for (column, header) in headers.iter().enumerate().take(MAX_SUMMARY_COLUMNS) {
        let mut samples: Vec<&str> = Vec::new();
        for value in rows.iter().filter_map(|row| row.get(column)) {
            if !value.is_empty() && !samples.contains(&value) {
                samples.push(value);
            }
            if samples.len() == MAX_COLUMN_SAMPLES {
                break;
            }
        }
        if !samples.is_empty() {
            lines.push(format!("  - {}: {}", header, samples.join(", ")));
        }
    }
    lines.join("\n")
}

fn summarize_json(name: &str, content: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(content) {
        Ok(serde_json::Value::Array(items)) => {
            let sample: Vec<&serde_json::Value> = items.iter().take(MAX_JSON_ITEMS).collect();
            let rendered = serde_json::to_string_pretty(&sample).unwrap_or_default();
            format!("[{}] JSON array with {} items. Sample:\n{}", name, items.len(), rendered)
        }
        Ok(serde_json::Value::Object(map)) => {
            let keys: Vec<&str> = map.keys().take(MAX_JSON_KEYS).map(String::as_str).collect();
            format!("[{}] JSON object with keys: {}", name, keys.join(", "))
        }
        Ok(other) => format!("[{}] JSON primitive: {}", name, other),
        Err(err) => format!("[{}] Failed to parse JSON: {}", name, err),
    }
}

fn summarize_text(name: &str, content: &str) -> String {
    if content.chars().count() > MAX_TEXT_CHARS {
        let head: String = content.chars().take(MAX_TEXT_CHARS).collect();
        format!("[{}] Text (truncated to {} chars):\n{}...", name, MAX_TEXT_CHARS, head)
    } else {
        format!("[{}] Text:\n{}", name, content)
    }
}

/// Combined text summary of every evidence file, in upload order.
pub fn parse_evidence(files: &[EvidenceFile]) -> String {
    files
        .iter()
        .map(EvidenceFile::summarize)
        .collect::<Vec<_>>()
        .join(EVIDENCE_SEPARATOR)
}

// --- TASK ---

fn default_segments() -> usize {
    DEFAULT_AUDIENCE_SEGMENTS
}

/// Evidence-driven persona source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AudienceTask {
    #[serde(default)]
    pub evidence: Vec<EvidenceFile>,
    #[serde(default)]
    pub target_description: Option<String>,
    #[serde(default = "default_segments")]
    pub segments: usize,
    #[serde(default)]
    pub weight_share: Option<f64>,
}

impl AudienceTask {
    pub fn new(evidence: Vec<EvidenceFile>) -> Self {
        Self {
            evidence,
            target_description: None,
            segments: DEFAULT_AUDIENCE_SEGMENTS,
            weight_share: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let described = self
            .target_description
            .as_deref()
            .is_some_and(|d| !d.trim().is_empty());
        if self.evidence.is_empty() && !described {
            return Err(SsrError::validation(
                "audience source needs evidence files or a target description",
            ));
        }
        if !(1..=MAX_GENERATED_PERSONAS).contains(&self.segments) {
            return Err(SsrError::validation(format!(
                "audience segments {} must lie in [1, {}]",
                self.segments, MAX_GENERATED_PERSONAS
            )));
        }
        validate_share(self.weight_share, "audience")
    }

    pub fn label(&self) -> String {
        match self.target_description.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            Some(description) => description.chars().take(40).collect(),
            None => self
                .evidence
                .iter()
                .map(|f| f.name.as_str())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Segments built for one audience task plus how they were derived.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudiencePanel {
    pub personas: Vec<Persona>,
    pub reasoning: String,
    pub strategy: GenerationStrategy,
    pub evidence_summary: String,
}

// --- WRITER PATH ---

fn build_synthesis_prompt(task: &AudienceTask, summary: &str) -> String {
    let mut context = Vec::new();
    if let Some(description) = task.target_description.as_deref().filter(|d| !d.trim().is_empty()) {
        context.push(format!("Target Audience Description:\n{}", description.trim()));
    }
    if !summary.is_empty() {
        context.push(format!("Evidence:\n{}", summary));
    }
    format!(
        "You are an expert market researcher. Analyze the evidence about a target \
        audience and define a representative panel of {} synthetic personas. \
        For each persona give name, age, gender, region, income, occupation, \
        3-5 behavioural descriptors and a weight proportional to its share of the \
        population. Base every persona on the evidence and do not invent \
        unsupported demographics. Return ONLY a JSON object of the form \
        {{\"injections\": [{{\"persona\": {{...}}, \"weight_share\": 0.25}}], \
        \"reasoning\": \"...\"}}.\n\n{}",
        task.segments,
        context.join("\n\n")
    )
}

// Strips code fences and chatter around the JSON object.
fn clean_json_object(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text.trim(),
    }
}

fn parse_synthesized_panel(task: &AudienceTask, raw: &str) -> Result<(Vec<Persona>, String)> {
    let parsed: serde_json::Value = serde_json::from_str(clean_json_object(raw))?;
    let entries = parsed
        .get("injections")
        .and_then(|i| i.as_array())
        .ok_or_else(|| SsrError::validation("audience writer returned no injections"))?;

    let mut personas = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        let body = entry.get("persona").unwrap_or(entry);
        let Ok(value) = serde_yaml::to_value(body) else { continue };
        let Some(mut persona) = persona_from_yaml(&value) else { continue };
        if body.get("name").and_then(|n| n.as_str()).map_or(true, |n| n.trim().is_empty()) {
            persona.name = format!("Segment {}", idx + 1);
        }
        if let Some(share) = entry
            .get("weight_share")
            .and_then(|s| s.as_f64())
            .filter(|s| s.is_finite() && *s > 0.0)
        {
            persona.weight = share;
        }
        persona.source = Some("evidence:llm".to_string());
        personas.push(persona);
        if personas.len() >= task.segments {
            break;
        }
    }
    if personas.is_empty() {
        return Err(SsrError::validation("audience writer produced no usable personas"));
    }

    let reasoning = parsed
        .get("reasoning")
        .and_then(|r| r.as_str())
        .unwrap_or("No reasoning provided.")
        .to_string();
    Ok((personas, reasoning))
}

// --- HEURISTIC PATH ---

#[derive(Default)]
struct Band {
    rows: usize,
    fields: BTreeMap<&'static str, BTreeMap<String, usize>>,
}

// Most frequent value; ties go to the alphabetically first.
fn modal(counts: &BTreeMap<String, usize>) -> Option<&str> {
    let mut best: Option<(&str, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, top)| *count > top) {
            best = Some((value.as_str(), *count));
        }
    }
    best.map(|(value, _)| value)
}

fn age_bands(files: &[EvidenceFile]) -> BTreeMap<String, Band> {
    let mut bands: BTreeMap<String, Band> = BTreeMap::new();
    for file in files.iter().filter(|f| f.format() == EvidenceFormat::Csv) {
        let mut rdr = csv_reader(&file.content);
        let Ok(headers) = rdr.headers() else { continue };
        let headers: Vec<String> = headers.iter().map(canonical_field).collect();
        let Some(age_column) = headers.iter().position(|h| AGE_COLUMNS.contains(&h.as_str())) else {
            continue;
        };
        for record in rdr.records().flatten() {
            let Some(age) = record.get(age_column).filter(|a| !a.is_empty()) else { continue };
            let band = bands.entry(age.to_string()).or_default();
            band.rows += 1;
            for field in SEGMENT_FIELDS {
                let value = headers
                    .iter()
                    .position(|h| h == field)
                    .and_then(|column| record.get(column))
                    .filter(|v| !v.is_empty());
                if let Some(value) = value {
                    *band
                        .fields
                        .entry(field)
                        .or_default()
                        .entry(value.to_string())
                        .or_insert(0) += 1;
                }
            }
        }
    }
    bands
}

fn free_text(task: &AudienceTask) -> String {
    let mut parts: Vec<&str> = task.target_description.iter().map(String::as_str).collect();
    parts.extend(
        task.evidence
            .iter()
            .filter(|f| f.format() == EvidenceFormat::Text)
            .map(|f| f.content.as_str()),
    );
    parts.join(" ")
}

/// Offline segmentation: one persona per most common age band in the CSV
/// evidence, weighted by row count. Without age data the audience description
/// is handed to the heuristic persona generator.
pub fn segments_from_evidence(task: &AudienceTask, seed: u64) -> (Vec<Persona>, String) {
    let text = free_text(task);
    let descriptors = extract_keywords(&text, 3);
    let bands = age_bands(&task.evidence);

    if bands.is_empty() {
        let prompt = match task.target_description.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            Some(description) => description.to_string(),
            None => {
                let keywords = extract_keywords(&parse_evidence(&task.evidence), 6);
                if keywords.is_empty() { "evidence audience".to_string() } else { keywords.join(" ") }
            }
        };
        let mut personas = generate_heuristic(&GenerationTask::new(&prompt, task.segments), seed);
        for persona in personas.iter_mut() {
            persona.source = Some("evidence:heuristic".to_string());
        }
        let reasoning = "Evidence carries no age column; segments were generated from the audience description.".to_string();
        return (personas, reasoning);
    }

    let total_rows: usize = bands.values().map(|b| b.rows).sum();
    let mut ranked: Vec<(&String, &Band)> = bands.iter().collect();
    // Stable sort keeps ties in band order.
    ranked.sort_by(|a, b| b.1.rows.cmp(&a.1.rows));
    ranked.truncate(task.segments);

    let personas = ranked
        .into_iter()
        .map(|(age, band)| {
            let mut persona = Persona::new(&format!("Age {} Segment", age)).with_weight(band.rows as f64);
            persona.set_attribute("age", age);
            for (field, counts) in &band.fields {
                if let Some(value) = modal(counts) {
                    persona.set_attribute(field, value);
                }
            }
            persona.descriptors = descriptors.clone();
            persona.notes = Some(format!("{} of {} evidence rows", band.rows, total_rows));
            persona.source = Some("evidence:heuristic".to_string());
            persona
        })
        .collect::<Vec<_>>();
    let reasoning = format!(
        "Segmented {} evidence rows into {} age bands, keeping the {} largest.",
        total_rows,
        bands.len(),
        personas.len()
    );
    (personas, reasoning)
}

/// Builds the personas for one audience task.
pub async fn build_audience(
    task: &AudienceTask,
    seed: u64,
    writer: Option<&dyn PersonaWriter>,
) -> Result<AudiencePanel> {
    task.validate()?;
    let evidence_summary = parse_evidence(&task.evidence);

    match writer {
        Some(writer) => {
            let outcome = match writer.write_personas(&build_synthesis_prompt(task, &evidence_summary)).await {
                Ok(raw) => parse_synthesized_panel(task, &raw),
                Err(err) => Err(SsrError::from(err)),
            };
            match outcome {
                Ok((personas, reasoning)) => {
                    info!(audience = %task.label(), count = personas.len(), "audience synthesized via writer");
                    return Ok(AudiencePanel {
                        personas,
                        reasoning,
                        strategy: GenerationStrategy::Llm,
                        evidence_summary,
                    });
                }
                Err(err) => {
                    warn!(audience = %task.label(), error = %err, "audience synthesis failed, segmenting evidence directly");
                }
            }
        }
        None => info!(audience = %task.label(), "no persona writer configured, segmenting evidence directly"),
    }

    let (personas, reasoning) = segments_from_evidence(task, seed);
    info!(audience = %task.label(), count = personas.len(), "audience segmented heuristically");
    Ok(AudiencePanel {
        personas,
        reasoning,
        strategy: GenerationStrategy::Heuristic,
        evidence_summary,
    })
}
