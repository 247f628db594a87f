// src/persona.rs
// Persona Record & Panel
// The canonical respondent record and the immutable weighted panel built from it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SsrError};

/// Tolerance used for every "weights sum to one" check in the crate.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

// Scalar attributes rendered first, in this order, by `Persona::describe`.
const ATTRIBUTE_ORDER: [&str; 10] = [
    "age",
    "gender",
    "region",
    "income",
    "usage",
    "occupation",
    "education",
    "household",
    "purchase_frequency",
    "background",
];

// List-valued traits with their display labels.
pub const TRAIT_FIELDS: [(&str, &str); 4] = [
    ("habits", "habits"),
    ("motivations", "motivations"),
    ("pain_points", "pain points"),
    ("preferred_channels", "preferred channels"),
];

fn default_weight() -> f64 {
    1.0
}

/// One simulated respondent profile.
///
/// `attributes` is an open map of scalar demographic/behavioural values
/// (age, region, income, ...); `traits` holds list-valued fields such as
/// habits and motivations. Field names are canonicalised with
/// [`canonical_field`] when personas are loaded from YAML or CSV.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Persona {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub traits: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub descriptors: Vec<String>,
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl Persona {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attributes: BTreeMap::new(),
            traits: BTreeMap::new(),
            descriptors: Vec::new(),
            context: Vec::new(),
            notes: None,
            source: None,
            weight: 1.0,
        }
    }

    pub fn with_attribute(mut self, field: &str, value: &str) -> Self {
        self.set_attribute(field, value);
        self
    }

    pub fn with_trait(mut self, field: &str, values: &[&str]) -> Self {
        self.traits.insert(
            canonical_field(field),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn with_descriptors(mut self, descriptors: &[&str]) -> Self {
        self.descriptors = descriptors.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Sets a scalar attribute; blank values remove it.
    pub fn set_attribute(&mut self, field: &str, value: &str) {
        let key = canonical_field(field);
        let value = value.trim();
        if value.is_empty() {
            self.attributes.remove(&key);
        } else {
            self.attributes.insert(key, value.to_string());
        }
    }

    /// Trimmed, non-empty scalar value of `field`, used as the raking category.
    pub fn category(&self, field: &str) -> Option<&str> {
        self.attributes
            .get(&canonical_field(field))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn trait_values(&self, field: &str) -> &[String] {
        self.traits
            .get(&canonical_field(field))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Lower-cased values of any field (scalar attribute, trait list,
    /// descriptors, name or notes), used by library filters.
    pub fn field_values(&self, field: &str) -> Vec<String> {
        let key = canonical_field(field);
        let raw: Vec<&str> = match key.as_str() {
            "name" => vec![self.name.as_str()],
            "notes" => self.notes.iter().map(|n| n.as_str()).collect(),
            "source" => self.source.iter().map(|s| s.as_str()).collect(),
            "descriptors" | "traits" => self.descriptors.iter().map(|d| d.as_str()).collect(),
            _ => match self.attributes.get(&key) {
                Some(value) => vec![value.as_str()],
                None => self.trait_values(&key).iter().map(|v| v.as_str()).collect(),
            },
        };
        raw.into_iter()
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// Human readable one-line description used in prompts and filters.
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        for field in ATTRIBUTE_ORDER {
            if let Some(value) = self.category(field) {
                parts.push(match field {
                    "age" => format!("age {}", value),
                    "gender" | "background" => value.to_string(),
                    "region" => format!("based in {}", value),
                    "income" => format!("income: {}", value),
                    "usage" => format!("usage context: {}", value),
                    "purchase_frequency" => format!("purchase cadence: {}", value),
                    other => format!("{}: {}", other, value),
                });
            }
        }
        for (field, value) in &self.attributes {
            if !ATTRIBUTE_ORDER.contains(&field.as_str()) && !value.trim().is_empty() {
                parts.push(format!("{}: {}", field.replace('_', " "), value.trim()));
            }
        }

        let mut push_list = |label: &str, values: &[String]| {
            if !values.is_empty() {
                let trimmed: Vec<&str> = values.iter().take(3).map(|v| v.as_str()).collect();
                parts.push(format!("{}: {}", label, trimmed.join(", ")));
            }
        };
        for (field, label) in TRAIT_FIELDS {
            push_list(label, self.trait_values(field));
        }
        for (field, values) in &self.traits {
            if !TRAIT_FIELDS.iter().any(|(known, _)| known == field) {
                push_list(&field.replace('_', " "), values);
            }
        }
        push_list("additional traits", &self.descriptors);

        if let Some(notes) = self.notes.as_deref().filter(|n| !n.trim().is_empty()) {
            parts.push(notes.trim().to_string());
        }

        if parts.is_empty() {
            "a representative consumer".to_string()
        } else {
            parts.join(", ")
        }
    }

    /// Lower-cased blob searched by filter keywords.
    pub fn search_blob(&self) -> String {
        let mut parts = vec![self.name.clone(), self.describe()];
        parts.extend(self.descriptors.iter().cloned());
        parts.extend(self.traits.values().flatten().cloned());
        parts.extend(self.notes.iter().cloned());
        parts.join(" ").to_lowercase()
    }

    /// Stable identity hash: everything that shapes a prompt, but not the weight.
    pub fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.describe().as_bytes());
        for chunk in &self.context {
            hasher.update([0u8]);
            hasher.update(chunk.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Short highlights for the panel summary.
    pub fn highlights(&self) -> Vec<String> {
        let mut highlights = Vec::new();
        if let Some(age) = self.category("age") {
            highlights.push(format!("age {}", age));
        }
        for field in ["gender", "region"] {
            if let Some(value) = self.category(field) {
                highlights.push(value.to_string());
            }
        }
        if let Some(income) = self.category("income") {
            highlights.push(format!("income {}", income));
        }
        if let Some(occupation) = self.category("occupation") {
            highlights.push(occupation.to_string());
        }
        for (field, label) in [("habits", "habits"), ("motivations", "motivations"), ("preferred_channels", "channels")] {
            let values = self.trait_values(field);
            if !values.is_empty() {
                let shown: Vec<&str> = values.iter().take(2).map(|v| v.as_str()).collect();
                highlights.push(format!("{}: {}", label, shown.join(", ")));
            }
        }
        highlights.truncate(4);
        highlights
    }
}

/// Canonical key for an attribute/trait name: lower-case snake case with the
/// historical aliases folded in.
pub fn canonical_field(field: &str) -> String {
    let key: String = field
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect();
    match key.as_str() {
        "purchase_freq" => "purchase_frequency".to_string(),
        "usage_context" => "usage".to_string(),
        "persona_source" => "source".to_string(),
        _ => key,
    }
}

/// Rescales `weights` so they sum to `target`. Negative or non-finite values
/// count as zero; an all-zero vector is split equally.
pub fn normalize_weights(weights: &mut [f64], target: f64) {
    if weights.is_empty() {
        return;
    }
    for w in weights.iter_mut() {
        if !w.is_finite() || *w < 0.0 {
            *w = 0.0;
        }
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        let equal = target.max(0.0) / weights.len() as f64;
        weights.iter_mut().for_each(|w| *w = equal);
        return;
    }
    let scale = target.max(0.0) / total;
    weights.iter_mut().for_each(|w| *w *= scale);
}

/// Ordered, weighted persona population. Weights sum to one and the
/// personas are shared read-only with every dispatch task.
#[derive(Clone, Debug)]
pub struct Panel {
    personas: Vec<Arc<Persona>>,
}

impl Panel {
    pub fn new(personas: Vec<Persona>) -> Result<Self> {
        if personas.is_empty() {
            return Err(SsrError::validation("panel must contain at least one persona"));
        }
        for persona in &personas {
            if !persona.weight.is_finite()
                || persona.weight < -WEIGHT_TOLERANCE
                || persona.weight > 1.0 + WEIGHT_TOLERANCE
            {
                return Err(SsrError::validation(format!(
                    "persona '{}' has weight {} outside [0, 1]",
                    persona.name, persona.weight
                )));
            }
        }
        let total: f64 = personas.iter().map(|p| p.weight).sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(SsrError::validation(format!(
                "panel weights sum to {:.8}, expected 1.0",
                total
            )));
        }
        Ok(Self {
            personas: personas.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn personas(&self) -> &[Arc<Persona>] {
        &self.personas
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Persona>> {
        self.personas.get(index)
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.personas.iter().map(|p| p.weight).collect()
    }

    /// New snapshot with the same personas and replacement weights.
    pub fn reweighted(&self, weights: &[f64]) -> Result<Panel> {
        if weights.len() != self.personas.len() {
            return Err(SsrError::validation(format!(
                "expected {} weights, got {}",
                self.personas.len(),
                weights.len()
            )));
        }
        let personas = self
            .personas
            .iter()
            .zip(weights)
            .map(|(p, w)| Persona {
                weight: *w,
                ..Persona::clone(p)
            })
            .collect();
        Panel::new(personas)
    }

    /// New snapshot built by transforming each persona (weights must still sum to one).
    pub fn map_personas<F>(&self, mut f: F) -> Result<Panel>
    where
        F: FnMut(usize, &Persona) -> Persona,
    {
        let personas = self
            .personas
            .iter()
            .enumerate()
            .map(|(i, p)| f(i, p))
            .collect();
        Panel::new(personas)
    }

    /// "Name: highlight; highlight | Name ..." summary for result metadata.
    pub fn summary(&self) -> String {
        self.personas
            .iter()
            .map(|p| {
                let highlights = p.highlights();
                if highlights.is_empty() {
                    p.name.clone()
                } else {
                    format!("{}: {}", p.name, highlights.join("; "))
                }
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }
}
