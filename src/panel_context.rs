// src/panel_context.rs
// PANEL CONTEXT
// Splits caller-supplied background material into chunks and hands them out
// to personas, producing a new panel snapshot before dispatch.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::persona::{Panel, Persona};
use crate::seeds::derive_seed;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Every persona gets the first `chunks_per_persona` chunks.
    #[default]
    Shared,
    /// Chunks are dealt out in order, wrapping around.
    RoundRobin,
    /// Seeded sample per persona.
    #[serde(alias = "sample")]
    Random,
}

fn default_chunks_per_persona() -> usize {
    2
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PanelContextSpec {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub chunks: Vec<String>,
    #[serde(default = "default_chunks_per_persona")]
    pub chunks_per_persona: usize,
    #[serde(default)]
    pub mode: ContextMode,
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapses whitespace, drops blanks and case-insensitive duplicates.
fn dedupe_chunks<I, S>(chunks: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut cleaned = Vec::new();
    for chunk in chunks {
        let text = collapse(chunk.as_ref());
        if text.is_empty() || !seen.insert(text.to_lowercase()) {
            continue;
        }
        cleaned.push(text);
    }
    cleaned
}

/// Splits free text into chunks. Tries, in order: a JSON list, blank-line
/// paragraphs, bullet lines, `;` separated parts, then the whole text.
pub fn chunk_context_text(text: &str) -> Vec<String> {
    let candidate = text.trim();
    if candidate.is_empty() {
        return Vec::new();
    }

    if candidate.starts_with('[') {
        if let Ok(items) = serde_json::from_str::<Vec<serde_json::Value>>(candidate) {
            let parsed = dedupe_chunks(items.iter().map(|item| match item {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }));
            if !parsed.is_empty() {
                return parsed;
            }
        }
    }

    if let Ok(blank_line) = Regex::new(r"\n\s*\n+") {
        let paragraphs: Vec<&str> = blank_line
            .split(candidate)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if paragraphs.len() > 1 {
            return dedupe_chunks(paragraphs);
        }
    }

    if let Ok(bullet) = Regex::new(r"^([-*•]|\d+[.)])\s+") {
        let lines: Vec<&str> = candidate.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if lines.iter().any(|line| bullet.is_match(line)) {
            return dedupe_chunks(lines.iter().map(|line| bullet.replace(line, "").trim().to_string()));
        }
    }

    if candidate.contains(';') {
        return dedupe_chunks(candidate.split(';'));
    }

    dedupe_chunks([candidate])
}

/// Explicit chunks first, then chunks parsed from `text`.
pub fn panel_context_chunks(spec: &PanelContextSpec) -> Vec<String> {
    let mut chunks = spec.chunks.clone();
    if let Some(text) = &spec.text {
        chunks.extend(chunk_context_text(text));
    }
    dedupe_chunks(chunks)
}

fn with_context(persona: &Persona, picks: &[String]) -> Persona {
    let mut next = persona.clone();
    next.context = dedupe_chunks(persona.context.iter().chain(picks.iter()));
    next
}

/// Returns the panel with context appended to each persona, plus the number
/// of chunks that were available.
pub fn apply_panel_context(panel: &Panel, spec: &PanelContextSpec, seed: u64) -> Result<(Panel, usize)> {
    let chunks = panel_context_chunks(spec);
    let per_persona = spec.chunks_per_persona;
    if chunks.is_empty() || per_persona == 0 {
        return Ok((panel.clone(), chunks.len()));
    }

    let next = match spec.mode {
        ContextMode::Shared => {
            let assigned: Vec<String> = chunks.iter().take(per_persona).cloned().collect();
            panel.map_personas(|_, persona| with_context(persona, &assigned))?
        }
        ContextMode::RoundRobin => {
            let mut cursor = 0;
            panel.map_personas(|_, persona| {
                let picks: Vec<String> = (0..per_persona)
                    .map(|offset| chunks[(cursor + offset) % chunks.len()].clone())
                    .collect();
                cursor += per_persona;
                with_context(persona, &picks)
            })?
        }
        ContextMode::Random => panel.map_personas(|idx, persona| {
            if chunks.len() <= per_persona {
                return with_context(persona, &chunks);
            }
            let mut rng = StdRng::seed_from_u64(derive_seed(
                seed,
                &["context", &idx.to_string(), &persona.name],
            ));
            let mut indices = rand::seq::index::sample(&mut rng, chunks.len(), per_persona).into_vec();
            indices.sort_unstable();
            let picks: Vec<String> = indices.into_iter().map(|i| chunks[i].clone()).collect();
            with_context(persona, &picks)
        })?,
    };

    info!(chunks = chunks.len(), mode = ?spec.mode, per_persona, "panel context allocated");
    Ok((next, chunks.len()))
}
