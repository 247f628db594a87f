// src/persona_library.rs
// PERSONA LIBRARY: named groups loaded from YAML, CSV persona blocks, and the
// filter rules that slice the library into runtime segments.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, SsrError};
use crate::persona::{canonical_field, Persona, TRAIT_FIELDS};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersonaGroup {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: Option<String>,
    pub personas: Vec<Persona>,
}

/// Rules for selecting personas from the library.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersonaFilter {
    /// Restrict the search to one group; the whole library when omitted.
    #[serde(default)]
    pub group: Option<String>,
    /// Field -> allowed values (case-insensitive, any of).
    #[serde(default)]
    pub include: BTreeMap<String, Vec<String>>,
    /// Field -> banned values (case-insensitive).
    #[serde(default)]
    pub exclude: BTreeMap<String, Vec<String>>,
    /// Every keyword must appear in the persona's search blob.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub weight_share: Option<f64>,
}

impl PersonaFilter {
    pub fn validate(&self) -> Result<()> {
        if self.limit == Some(0) {
            return Err(SsrError::validation("persona filter limit must be at least 1"));
        }
        validate_share(self.weight_share, "persona filter")
    }
}

pub(crate) fn validate_share(share: Option<f64>, what: &str) -> Result<()> {
    match share {
        Some(s) if !(0.0..=1.0).contains(&s) || !s.is_finite() => Err(SsrError::validation(
            format!("{} weight_share {} must lie in [0, 1]", what, s),
        )),
        _ => Ok(()),
    }
}

#[derive(Debug, Default)]
pub struct PersonaLibrary {
    directory: Option<PathBuf>,
    groups: BTreeMap<String, PersonaGroup>,
}

impl PersonaLibrary {
    pub fn from_groups(groups: Vec<PersonaGroup>) -> Self {
        Self {
            directory: None,
            groups: groups.into_iter().map(|g| (g.name.clone(), g)).collect(),
        }
    }

    /// Loads every `*.yml`/`*.yaml` file in `directory`, sorted by file name.
    /// A missing directory yields an empty library.
    pub fn load_dir(directory: &Path) -> Result<Self> {
        let mut groups = BTreeMap::new();
        if !directory.is_dir() {
            warn!(path = %directory.display(), "persona library directory not found, library is empty");
            return Ok(Self {
                directory: Some(directory.to_path_buf()),
                groups,
            });
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(directory)?
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
            let group = load_persona_group(&file)?;
            debug!(group = %group.name, personas = group.personas.len(), "loaded persona group");
            groups.insert(group.name.clone(), group);
        }
        info!(path = %directory.display(), groups = groups.len(), "persona library loaded");

        Ok(Self {
            directory: Some(directory.to_path_buf()),
            groups,
        })
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn groups(&self) -> impl Iterator<Item = &PersonaGroup> {
        self.groups.values()
    }

    pub fn get_group(&self, name: &str) -> Result<&PersonaGroup> {
        self.groups
            .get(name)
            .ok_or_else(|| SsrError::validation(format!("unknown persona group '{}'", name)))
    }

    pub fn list_personas(&self, group: Option<&str>) -> Result<Vec<Persona>> {
        match group {
            Some(name) => Ok(self.get_group(name)?.personas.clone()),
            None => Ok(self
                .groups
                .values()
                .flat_map(|g| g.personas.iter().cloned())
                .collect()),
        }
    }

    /// Personas satisfying `filter`, in library order.
    pub fn filter(&self, filter: &PersonaFilter) -> Result<Vec<Persona>> {
        filter.validate()?;
        let candidates = self.list_personas(filter.group.as_deref())?;

        let include = normalise_rules(&filter.include);
        let exclude = normalise_rules(&filter.exclude);
        let keywords: Vec<String> = filter
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        let mut matches: Vec<Persona> = candidates
            .into_iter()
            .filter(|persona| {
                include.iter().all(|(field, allowed)| {
                    persona.field_values(field).iter().any(|v| allowed.contains(v))
                })
            })
            .filter(|persona| {
                !exclude.iter().any(|(field, banned)| {
                    persona.field_values(field).iter().any(|v| banned.contains(v))
                })
            })
            .filter(|persona| {
                if keywords.is_empty() {
                    return true;
                }
                let blob = persona.search_blob();
                keywords.iter().all(|k| blob.contains(k.as_str()))
            })
            .collect();

        if let Some(limit) = filter.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }
}

fn normalise_rules(rules: &BTreeMap<String, Vec<String>>) -> Vec<(String, Vec<String>)> {
    rules
        .iter()
        .map(|(field, values)| {
            let values = values
                .iter()
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .collect();
            (canonical_field(field), values)
        })
        .collect()
}

/// Reads one library group file.
pub fn load_persona_group(path: &Path) -> Result<PersonaGroup> {
    let text = std::fs::read_to_string(path)?;
    let raw: Value = serde_yaml::from_str(&text)?;

    let fallback_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("personas")
        .to_string();
    let name = raw
        .get("group")
        .and_then(scalar_text)
        .unwrap_or(fallback_name);
    let description = raw.get("description").and_then(scalar_text).unwrap_or_default();
    let source = raw.get("source").and_then(scalar_text);

    let personas: Vec<Persona> = raw
        .get("personas")
        .and_then(|v| v.as_sequence())
        .map(|entries| entries.iter().filter_map(persona_from_yaml).collect())
        .unwrap_or_default();

    if personas.is_empty() {
        return Err(SsrError::validation(format!(
            "persona file {} contains no personas",
            path.display()
        )));
    }

    Ok(PersonaGroup {
        name,
        description,
        source,
        personas,
    })
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn list_values(value: &Value) -> Vec<String> {
    match value {
        Value::Sequence(items) => items.iter().filter_map(scalar_text).collect(),
        other => scalar_text(other)
            .map(|text| split_list(&text))
            .unwrap_or_default(),
    }
}

fn split_list(text: &str) -> Vec<String> {
    text.split(';')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect()
}

fn is_list_field(key: &str) -> bool {
    TRAIT_FIELDS.iter().any(|(field, _)| *field == key)
}

pub(crate) fn persona_from_yaml(entry: &Value) -> Option<Persona> {
    let mapping = entry.as_mapping()?;
    let mut persona = Persona::new("Persona");

    for (key, value) in mapping {
        let Some(key) = key.as_str() else { continue };
        let key = canonical_field(key);
        match key.as_str() {
            "name" => {
                if let Some(name) = scalar_text(value) {
                    persona.name = name;
                }
            }
            "weight" => {
                persona.weight = coerce_weight(scalar_text(value).as_deref());
            }
            "descriptors" | "traits" => persona.descriptors = list_values(value),
            "context" => persona.context = list_values(value),
            "notes" => persona.notes = scalar_text(value),
            "source" => persona.source = scalar_text(value),
            _ if is_list_field(&key) || value.is_sequence() => {
                let values = list_values(value);
                if !values.is_empty() {
                    persona.traits.insert(key, values);
                }
            }
            _ => {
                if let Some(text) = scalar_text(value) {
                    persona.attributes.insert(key, text);
                }
            }
        }
    }
    Some(persona)
}

// Missing, unparsable, zero or negative weights fall back to 1.0.
fn coerce_weight(raw: Option<&str>) -> f64 {
    raw.and_then(|w| w.trim().parse::<f64>().ok())
        .filter(|w| w.is_finite() && *w > 0.0)
        .unwrap_or(1.0)
}

/// Parses a persona CSV block. Every unrecognised, non-empty column becomes
/// a scalar attribute.
pub fn personas_from_csv_reader<R: Read>(reader: R) -> Result<Vec<Persona>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let headers: Vec<String> = rdr.headers()?.iter().map(canonical_field).collect();

    let mut personas = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let mut persona = Persona::new(&format!("Persona {}", personas.len() + 1));
        for (key, value) in headers.iter().zip(record.iter()) {
            if value.is_empty() {
                continue;
            }
            match key.as_str() {
                "name" => persona.name = value.to_string(),
                "weight" => persona.weight = coerce_weight(Some(value)),
                "descriptors" | "traits" => persona.descriptors = split_list(value),
                "context" => persona.context = split_list(value),
                "notes" => persona.notes = Some(value.to_string()),
                "source" => persona.source = Some(value.to_string()),
                k if is_list_field(k) => {
                    persona.traits.insert(k.to_string(), split_list(value));
                }
                k => {
                    persona.attributes.insert(k.to_string(), value.to_string());
                }
            }
        }
        personas.push(persona);
    }

    if personas.is_empty() {
        return Err(SsrError::validation("CSV did not yield any personas"));
    }
    Ok(personas)
}

pub fn personas_from_csv_str(text: &str) -> Result<Vec<Persona>> {
    personas_from_csv_reader(text.as_bytes())
}

pub fn personas_from_csv_path(path: &Path) -> Result<Vec<Persona>> {
    if !path.exists() {
        return Err(SsrError::validation(format!(
            "persona CSV not found: {}",
            path.display()
        )));
    }
    let file = std::fs::File::open(path)?;
    personas_from_csv_reader(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_library() -> PersonaLibrary {
        PersonaLibrary::from_groups(vec![PersonaGroup {
            name: "us_toothpaste_buyers".to_string(),
            description: String::new(),
            source: None,
            personas: vec![
                Persona::new("Busy Parent")
                    .with_attribute("age", "25-44")
                    .with_trait("motivations", &["protect family teeth"]),
                Persona::new("Student")
                    .with_attribute("age", "18-24")
                    .with_attribute("region", "US"),
                Persona::new("Retiree")
                    .with_attribute("age", "65+")
                    .with_descriptors(&["sensitive teeth"]),
            ],
        }])
    }

    #[test]
    fn filter_by_include_and_keyword() {
        let library = sample_library();
        let filter = PersonaFilter {
            group: Some("us_toothpaste_buyers".into()),
            include: BTreeMap::from([("age".into(), vec!["25-44".into(), "18-24".into()])]),
            keywords: vec!["Family".into()],
            ..Default::default()
        };
        let personas = library.filter(&filter).unwrap();
        assert_eq!(personas.len(), 1);
        assert_eq!(personas[0].name, "Busy Parent");
    }

    #[test]
    fn filter_exclude_and_limit() {
        let library = sample_library();
        let filter = PersonaFilter {
            exclude: BTreeMap::from([("age".into(), vec!["65+".into()])]),
            limit: Some(1),
            ..Default::default()
        };
        let personas = library.filter(&filter).unwrap();
        assert_eq!(personas.len(), 1);
        assert_eq!(personas[0].name, "Busy Parent");
    }

    #[test]
    fn unknown_group_is_a_validation_error() {
        let library = sample_library();
        assert!(matches!(library.get_group("nope"), Err(SsrError::Validation(_))));
    }

    #[test]
    fn csv_rows_become_personas() {
        let csv = "name,age,habits,weight,segment\n\
                   Ana,25-44,gym; meal prep,2,urban\n\
                   ,65+,,,\n";
        let personas = personas_from_csv_str(csv).unwrap();
        assert_eq!(personas.len(), 2);
        assert_eq!(personas[0].trait_values("habits"), ["gym", "meal prep"]);
        assert_eq!(personas[0].weight, 2.0);
        assert_eq!(personas[0].category("segment"), Some("urban"));
        assert_eq!(personas[1].name, "Persona 2");
        assert_eq!(personas[1].weight, 1.0);
    }

    #[test]
    fn empty_csv_is_rejected() {
        assert!(personas_from_csv_str("name,age\n").is_err());
    }

    #[test]
    fn library_loads_yaml_groups() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("snackers.yml")).unwrap();
        writeln!(
            file,
            "group: snackers\nsource: survey-2024\npersonas:\n  - name: Neha\n    age: 28\n    habits: quick commerce; late snacks\n    weight: 0.5\n  - name: Rohan\n    preferred_channels: [instagram, whatsapp]\n"
        )
        .unwrap();

        let library = PersonaLibrary::load_dir(dir.path()).unwrap();
        let group = library.get_group("snackers").unwrap();
        assert_eq!(group.source.as_deref(), Some("survey-2024"));
        assert_eq!(group.personas[0].category("age"), Some("28"));
        assert_eq!(group.personas[0].trait_values("habits").len(), 2);
        assert_eq!(group.personas[1].trait_values("preferred_channels"), ["instagram", "whatsapp"]);
        assert_eq!(group.personas[1].weight, 1.0);
    }
}
