// src/anchors.rs
// ANCHOR BANKS
// Reference statements for Likert points 1-5, one bank per intent, each with
// several paraphrased variants. Loaded once and shared read-only.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SsrError};

pub const LIKERT_POINTS: usize = 5;

const BUILTIN_BANKS: [(&str, &str); 2] = [
    ("purchase_intent", include_str!("../anchors/purchase_intent.yml")),
    ("relevance", include_str!("../anchors/relevance.yml")),
];

fn default_locale() -> String {
    "en-US".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchorSet {
    pub id: String,
    pub anchors: BTreeMap<u8, String>,
}

impl AnchorSet {
    /// Anchor texts ordered by rating 1..=5.
    pub fn statements(&self) -> Vec<&str> {
        self.anchors.values().map(|s| s.as_str()).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchorBank {
    pub version: String,
    pub intent: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    pub anchor_sets: Vec<AnchorSet>,
}

impl AnchorBank {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let bank: AnchorBank = serde_yaml::from_str(text)?;
        bank.validate()?;
        Ok(bank)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text).map_err(|err| match err {
            SsrError::Validation(msg) => SsrError::validation(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Every variant must carry exactly one non-blank statement per point 1..=5.
    pub fn validate(&self) -> Result<()> {
        if self.intent.trim().is_empty() {
            return Err(SsrError::validation("anchor bank has no intent"));
        }
        if self.anchor_sets.is_empty() {
            return Err(SsrError::validation(format!(
                "anchor bank '{}' contains no anchor sets",
                self.intent
            )));
        }
        let expected: Vec<u8> = (1..=LIKERT_POINTS as u8).collect();
        for set in &self.anchor_sets {
            let keys: Vec<u8> = set.anchors.keys().copied().collect();
            if keys != expected {
                return Err(SsrError::validation(format!(
                    "anchor set '{}' of '{}' must define ratings 1-5, found {:?}",
                    set.id, self.intent, keys
                )));
            }
            if set.anchors.values().any(|s| s.trim().is_empty()) {
                return Err(SsrError::validation(format!(
                    "anchor set '{}' of '{}' has a blank statement",
                    set.id, self.intent
                )));
            }
        }
        Ok(())
    }

    pub fn ratings(&self) -> [u8; LIKERT_POINTS] {
        [1, 2, 3, 4, 5]
    }

    /// All distinct statements, for warming the embedding cache in one call.
    pub fn all_statements(&self) -> Vec<String> {
        let mut statements: Vec<String> = Vec::new();
        for set in &self.anchor_sets {
            for text in set.anchors.values() {
                if !statements.contains(text) {
                    statements.push(text.clone());
                }
            }
        }
        statements
    }
}

/// Banks indexed by intent.
#[derive(Clone, Debug, Default)]
pub struct AnchorRegistry {
    banks: BTreeMap<String, AnchorBank>,
}

impl AnchorRegistry {
    /// The built-in `purchase_intent` and `relevance` banks.
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::default();
        for (name, text) in BUILTIN_BANKS {
            let bank = AnchorBank::from_yaml_str(text)
                .map_err(|err| SsrError::validation(format!("built-in anchor bank '{}': {}", name, err)))?;
            registry.insert(bank);
        }
        Ok(registry)
    }

    /// Built-in banks overlaid with every `*.yml`/`*.yaml` bank in `directory`.
    pub fn load_dir(directory: &Path) -> Result<Self> {
        let mut registry = Self::with_defaults()?;
        if !directory.is_dir() {
            warn!(path = %directory.display(), "anchor directory not found, using built-in banks");
            return Ok(registry);
        }
        let mut files: Vec<_> = std::fs::read_dir(directory)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yml") | Some("yaml")
                )
            })
            .collect();
        files.sort();
        for file in files {
            let bank = AnchorBank::from_path(&file)?;
            debug!(intent = %bank.intent, variants = bank.anchor_sets.len(), "loaded anchor bank");
            registry.insert(bank);
        }
        info!(path = %directory.display(), intents = registry.banks.len(), "anchor banks loaded");
        Ok(registry)
    }

    pub fn insert(&mut self, bank: AnchorBank) {
        self.banks.insert(bank.intent.clone(), bank);
    }

    pub fn get(&self, intent: &str) -> Result<&AnchorBank> {
        self.banks
            .get(intent)
            .ok_or_else(|| SsrError::validation(format!("no anchor bank for intent '{}'", intent)))
    }

    pub fn intents(&self) -> impl Iterator<Item = &str> {
        self.banks.keys().map(|k| k.as_str())
    }
}
