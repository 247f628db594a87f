// src/raking.rs
// RAKING ENGINE (iterative proportional fitting)
// Adjusts panel weights so the weighted share of each category matches the
// supplied marginal targets. Always returns a valid Panel snapshot.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SsrError};
use crate::persona::{normalize_weights, Panel};

pub const DEFAULT_RAKING_ITERATIONS: usize = 20;
pub const DEFAULT_RAKING_TOLERANCE: f64 = 1e-6;
pub const MAX_RAKING_ITERATIONS: usize = 200;

pub type Marginals = BTreeMap<String, BTreeMap<String, f64>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RakingMode {
    #[default]
    Lenient,
    Strict,
}

fn default_true() -> bool {
    true
}

fn default_iterations() -> usize {
    DEFAULT_RAKING_ITERATIONS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RakingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: RakingMode,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Unset means the service-wide default applies.
    #[serde(default)]
    pub tolerance: Option<f64>,
}

impl Default for RakingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: RakingMode::Lenient,
            iterations: DEFAULT_RAKING_ITERATIONS,
            tolerance: None,
        }
    }
}

impl RakingConfig {
    pub fn tolerance(&self) -> f64 {
        self.tolerance.unwrap_or(DEFAULT_RAKING_TOLERANCE)
    }

    /// Fills an unset tolerance with `fallback`.
    pub fn with_default_tolerance(mut self, fallback: f64) -> Self {
        self.tolerance.get_or_insert(fallback);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_RAKING_ITERATIONS).contains(&self.iterations) {
            return Err(SsrError::validation(format!(
                "raking iterations {} must lie in [1, {}]",
                self.iterations, MAX_RAKING_ITERATIONS
            )));
        }
        let tolerance = self.tolerance();
        if !tolerance.is_finite() || tolerance <= 0.0 {
            return Err(SsrError::validation("raking tolerance must be a positive number"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SkippedCategory {
    pub dimension: String,
    pub category: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RakingReport {
    pub iterations_run: usize,
    pub converged: bool,
    pub max_deviation: f64,
    pub skipped: Vec<SkippedCategory>,
}

// One marginal dimension resolved against the panel.
struct Dimension<'a> {
    name: &'a str,
    targets: &'a BTreeMap<String, f64>,
    // Category of each persona, None when the attribute is absent.
    categories: Vec<Option<String>>,
}

impl Dimension<'_> {
    fn masses(&self, weights: &[f64]) -> BTreeMap<&str, f64> {
        let mut masses: BTreeMap<&str, f64> = BTreeMap::new();
        for (category, weight) in self.categories.iter().zip(weights) {
            if let Some(category) = category {
                *masses.entry(category.as_str()).or_insert(0.0) += weight;
            }
        }
        masses
    }

    // Target share of every category carrying mass, renormalized over the
    // present categories. Untargeted categories get share 0.
    fn shares(&self, masses: &BTreeMap<&str, f64>) -> Option<Vec<(String, f64, f64)>> {
        let present: Vec<(&str, f64)> = masses
            .iter()
            .filter(|(_, mass)| **mass > 0.0)
            .map(|(category, mass)| (*category, *mass))
            .collect();
        let target_total: f64 = present
            .iter()
            .map(|(category, _)| self.targets.get(*category).copied().unwrap_or(0.0))
            .sum();
        if present.is_empty() || target_total <= 0.0 {
            return None;
        }
        let field_total: f64 = present.iter().map(|(_, mass)| mass).sum();
        Some(
            present
                .into_iter()
                .map(|(category, mass)| {
                    let target = self.targets.get(category).copied().unwrap_or(0.0) / target_total;
                    (category.to_string(), target, mass / field_total)
                })
                .collect(),
        )
    }

    fn deviation(&self, weights: &[f64]) -> f64 {
        let masses = self.masses(weights);
        match self.shares(&masses) {
            Some(shares) => shares
                .iter()
                .map(|(_, target, actual)| (actual - target).abs())
                .fold(0.0, f64::max),
            None => 0.0,
        }
    }

    fn apply(&self, weights: &mut [f64]) {
        let masses = self.masses(weights);
        let Some(shares) = self.shares(&masses) else {
            return;
        };
        let scales: BTreeMap<String, f64> = shares
            .into_iter()
            .map(|(category, target, actual)| (category, target / actual))
            .collect();
        for (weight, category) in weights.iter_mut().zip(&self.categories) {
            if let Some(scale) = category.as_deref().and_then(|c| scales.get(c)) {
                *weight *= scale;
            }
        }
        normalize_weights(weights, 1.0);
    }
}

/// Rakes `panel` towards `marginals`, returning a new snapshot and a report.
pub fn rake(panel: &Panel, marginals: &Marginals, config: &RakingConfig) -> Result<(Panel, RakingReport)> {
    config.validate()?;
    for (dimension, targets) in marginals {
        if let Some((category, target)) = targets.iter().find(|(_, t)| !t.is_finite() || **t < 0.0) {
            return Err(SsrError::validation(format!(
                "marginal target {}={} for '{}' must be a non-negative number",
                category, target, dimension
            )));
        }
    }

    let dimensions: Vec<Dimension> = marginals
        .iter()
        .map(|(name, targets)| Dimension {
            name,
            targets,
            categories: panel
                .personas()
                .iter()
                .map(|p| p.category(name).map(str::to_string))
                .collect(),
        })
        .collect();

    let mut weights = panel.weights();

    // Target categories with no persona mass never gain any, so check once.
    let mut skipped = BTreeSet::new();
    for dimension in &dimensions {
        let masses = dimension.masses(&weights);
        for (category, target) in dimension.targets {
            let mass = masses.get(category.as_str()).copied().unwrap_or(0.0);
            if *target > 0.0 && mass <= 0.0 {
                if config.mode == RakingMode::Strict {
                    return Err(SsrError::raking(format!(
                        "target category '{}' of '{}' has no persona mass",
                        category, dimension.name
                    )));
                }
                warn!(dimension = %dimension.name, %category, "raking target has no personas, skipping category");
                skipped.insert(SkippedCategory {
                    dimension: dimension.name.to_string(),
                    category: category.clone(),
                });
            }
        }
    }

    let max_deviation = |weights: &[f64]| {
        dimensions
            .iter()
            .map(|d| d.deviation(weights))
            .fold(0.0, f64::max)
    };

    let tolerance = config.tolerance();
    let mut deviation = max_deviation(&weights);
    let mut iterations_run = 0;
    while iterations_run < config.iterations && deviation >= tolerance {
        iterations_run += 1;
        for dimension in &dimensions {
            dimension.apply(&mut weights);
        }
        deviation = max_deviation(&weights);
        debug!(iteration = iterations_run, deviation, "raking pass");
    }

    let report = RakingReport {
        iterations_run,
        converged: deviation < tolerance,
        max_deviation: deviation,
        skipped: skipped.into_iter().collect(),
    };
    info!(
        iterations = report.iterations_run,
        converged = report.converged,
        max_deviation = report.max_deviation,
        skipped = report.skipped.len(),
        "raking finished"
    );
    Ok((panel.reweighted(&weights)?, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::Persona;

    fn marginals(entries: &[(&str, &[(&str, f64)])]) -> Marginals {
        entries
            .iter()
            .map(|(dim, targets)| {
                (
                    dim.to_string(),
                    targets.iter().map(|(c, t)| (c.to_string(), *t)).collect(),
                )
            })
            .collect()
    }

    fn four_cell_panel() -> Panel {
        Panel::new(vec![
            Persona::new("A").with_attribute("age", "young").with_attribute("region", "north").with_weight(0.25),
            Persona::new("B").with_attribute("age", "young").with_attribute("region", "south").with_weight(0.25),
            Persona::new("C").with_attribute("age", "old").with_attribute("region", "north").with_weight(0.25),
            Persona::new("D").with_attribute("age", "old").with_attribute("region", "south").with_weight(0.25),
        ])
        .unwrap()
    }

    #[test]
    fn strict_mode_fails_on_missing_category() {
        let panel = four_cell_panel();
        let targets = marginals(&[("age", &[("65+", 0.2)])]);
        let config = RakingConfig {
            mode: RakingMode::Strict,
            ..Default::default()
        };
        assert!(matches!(rake(&panel, &targets, &config), Err(SsrError::Raking(_))));
    }

    #[test]
    fn lenient_mode_skips_and_reports_missing_category() {
        let panel = four_cell_panel();
        let targets = marginals(&[("age", &[("65+", 0.2)])]);
        let (raked, report) = rake(&panel, &targets, &RakingConfig::default()).unwrap();
        assert_eq!(raked.weights(), panel.weights());
        assert_eq!(
            report.skipped,
            vec![SkippedCategory {
                dimension: "age".into(),
                category: "65+".into()
            }]
        );
    }

    #[test]
    fn matching_marginals_are_left_alone() {
        let panel = Panel::new(vec![
            Persona::new("A").with_attribute("age", "18-24").with_weight(0.3),
            Persona::new("B").with_attribute("age", "25-44").with_weight(0.7),
        ])
        .unwrap();
        let targets = marginals(&[("age", &[("18-24", 0.3), ("25-44", 0.7)])]);
        let (raked, report) = rake(&panel, &targets, &RakingConfig::default()).unwrap();
        assert_eq!(raked.weights(), panel.weights());
        assert_eq!(report.iterations_run, 0);
        assert!(report.converged);
    }

    #[test]
    fn two_dimensions_converge() {
        let panel = four_cell_panel();
        let targets = marginals(&[
            ("age", &[("young", 0.6), ("old", 0.4)]),
            ("region", &[("north", 0.3), ("south", 0.7)]),
        ]);
        let (raked, report) = rake(&panel, &targets, &RakingConfig::default()).unwrap();
        assert!(report.converged);
        let w = raked.weights();
        assert!((w[0] + w[1] - 0.6).abs() < 1e-6);
        assert!((w[0] + w[2] - 0.3).abs() < 1e-6);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn untargeted_categories_are_driven_to_zero() {
        let panel = Panel::new(vec![
            Persona::new("A").with_attribute("age", "x").with_weight(0.5),
            Persona::new("B").with_attribute("age", "y").with_weight(0.25),
            Persona::new("C").with_attribute("age", "z").with_weight(0.25),
        ])
        .unwrap();
        let targets = marginals(&[("age", &[("x", 0.6), ("y", 0.4)])]);
        let (raked, report) = rake(&panel, &targets, &RakingConfig::default()).unwrap();
        let w = raked.weights();
        assert!(report.converged);
        assert!((w[0] - 0.6).abs() < 1e-9);
        assert!((w[1] - 0.4).abs() < 1e-9);
        assert!(w[2].abs() < 1e-12);
    }

    #[test]
    fn personas_without_the_attribute_keep_their_weight() {
        let panel = Panel::new(vec![
            Persona::new("A").with_attribute("age", "x").with_weight(0.4),
            Persona::new("B").with_attribute("age", "y").with_weight(0.2),
            Persona::new("C").with_attribute("age", "z").with_weight(0.2),
            Persona::new("D").with_weight(0.2),
        ])
        .unwrap();
        let targets = marginals(&[("age", &[("x", 0.6), ("y", 0.4)])]);
        let (raked, report) = rake(&panel, &targets, &RakingConfig::default()).unwrap();
        let w = raked.weights();
        assert!(report.converged);
        assert!((w[0] - 0.48).abs() < 1e-9);
        assert!((w[1] - 0.32).abs() < 1e-9);
        assert!(w[2].abs() < 1e-12);
        assert!((w[3] - 0.2).abs() < 1e-9);
        // targeted shares are measured over everyone carrying the attribute
        assert!((w[0] / (w[0] + w[1] + w[2]) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn missing_tolerance_takes_the_fallback() {
        let config: RakingConfig = serde_json::from_str(r#"{"mode": "strict"}"#).unwrap();
        assert_eq!(config.tolerance, None);
        assert_eq!(config.tolerance(), DEFAULT_RAKING_TOLERANCE);
        let config = config.with_default_tolerance(0.01);
        assert_eq!(config.tolerance(), 0.01);
        assert_eq!(config.mode, RakingMode::Strict);

        let explicit: RakingConfig = serde_json::from_str(r#"{"tolerance": 0.2}"#).unwrap();
        assert_eq!(explicit.with_default_tolerance(0.01).tolerance(), 0.2);
    }

    #[test]
    fn iteration_bounds_are_validated() {
        let config = RakingConfig {
            iterations: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = RakingConfig {
            iterations: 201,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
