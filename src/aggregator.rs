// src/aggregator.rs
// AGGREGATOR
// Persona-level and panel-level Likert distributions plus a weighted
// bootstrap confidence interval for the panel mean.

use std::collections::HashMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::anchors::LIKERT_POINTS;
use crate::error::{Result, SsrError};
use crate::persona::Panel;
use crate::seeds::derive_seed;
use crate::ssr::Pmf;

pub const MIN_BOOTSTRAP_SAMPLES: usize = 1000;
pub const CONFIDENCE_LEVEL: f64 = 0.95;

const RATINGS: [u8; LIKERT_POINTS] = [1, 2, 3, 4, 5];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LikertDistribution {
    pub ratings: [u8; LIKERT_POINTS],
    pub pmf: Pmf,
    pub mean: f64,
    pub top2box: f64,
    pub sample_n: usize,
}

impl LikertDistribution {
    /// Builds the distribution from a (possibly unnormalized) pmf.
    pub fn from_pmf(pmf: Pmf, sample_n: usize) -> Self {
        let total: f64 = pmf.iter().sum();
        let pmf = if total > 0.0 {
            pmf.map(|p| p / total)
        } else {
            [1.0 / LIKERT_POINTS as f64; LIKERT_POINTS]
        };
        Self {
            ratings: RATINGS,
            pmf,
            mean: expected_rating(&pmf),
            top2box: pmf[3] + pmf[4],
            sample_n,
        }
    }

    /// Arithmetic mean of `pmfs`; `None` when there are none.
    pub fn average(pmfs: &[Pmf]) -> Option<Self> {
        if pmfs.is_empty() {
            return None;
        }
        let mut sum = [0.0; LIKERT_POINTS];
        for pmf in pmfs {
            for (acc, p) in sum.iter_mut().zip(pmf) {
                *acc += p;
            }
        }
        Some(Self::from_pmf(sum.map(|s| s / pmfs.len() as f64), pmfs.len()))
    }
}

pub fn expected_rating(pmf: &Pmf) -> f64 {
    RATINGS.iter().zip(pmf).map(|(k, p)| *k as f64 * p).sum()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
    pub resamples: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub distribution: LikertDistribution,
    pub mean_ci: ConfidenceInterval,
    pub valid_respondents: usize,
    pub personas_reporting: usize,
}

/// One mapped respondent: its persona and pmf.
#[derive(Clone, Debug)]
pub struct ScoredRespondent {
    pub persona_index: usize,
    pub pmf: Pmf,
}

#[derive(Clone, Copy, Debug)]
pub struct AggregationOptions {
    pub bootstrap_samples: usize,
    pub min_valid_samples: usize,
    pub seed: u64,
}

/// Persona distributions in panel order; `None` for personas with no valid respondents.
pub fn persona_distributions(panel: &Panel, respondents: &[ScoredRespondent]) -> Vec<Option<LikertDistribution>> {
    let mut grouped: Vec<Vec<Pmf>> = vec![Vec::new(); panel.len()];
    for respondent in respondents {
        if let Some(bucket) = grouped.get_mut(respondent.persona_index) {
            bucket.push(respondent.pmf);
        }
    }
    grouped.iter().map(|pmfs| LikertDistribution::average(pmfs)).collect()
}

/// Weighted panel pmf, renormalized over personas that reported.
pub fn panel_distribution(
    panel: &Panel,
    personas: &[Option<LikertDistribution>],
) -> Option<LikertDistribution> {
    let reporting: Vec<(f64, &LikertDistribution)> = panel
        .weights()
        .into_iter()
        .zip(personas)
        .filter_map(|(w, d)| d.as_ref().map(|d| (w, d)))
        .collect();
    if reporting.is_empty() {
        return None;
    }
    let total_weight: f64 = reporting.iter().map(|(w, _)| w).sum();
    let mut pmf = [0.0; LIKERT_POINTS];
    for (weight, dist) in &reporting {
        let share = if total_weight > 0.0 {
            weight / total_weight
        } else {
            1.0 / reporting.len() as f64
        };
        for (acc, p) in pmf.iter_mut().zip(dist.pmf) {
            *acc += share * p;
        }
    }
    let sample_n = reporting.iter().map(|(_, d)| d.sample_n).sum();
    Some(LikertDistribution::from_pmf(pmf, sample_n))
}

/// Linear-interpolation percentile of sorted `values`, `q` in [0, 1].
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Weighted bootstrap of the panel mean. Each respondent is drawn with
/// probability `persona weight / persona valid count`.
pub fn bootstrap_mean_ci(
    panel: &Panel,
    respondents: &[ScoredRespondent],
    resamples: usize,
    seed: u64,
) -> ConfidenceInterval {
    let resamples = resamples.max(MIN_BOOTSTRAP_SAMPLES);
    if respondents.is_empty() {
        return ConfidenceInterval {
            lower: f64::NAN,
            upper: f64::NAN,
            level: CONFIDENCE_LEVEL,
            resamples,
        };
    }

    let scores: Vec<f64> = respondents.iter().map(|r| expected_rating(&r.pmf)).collect();
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for r in respondents {
        *counts.entry(r.persona_index).or_insert(0) += 1;
    }
    let weights = panel.weights();
    let probabilities: Vec<f64> = respondents
        .iter()
        .map(|r| {
            let weight = weights.get(r.persona_index).copied().unwrap_or(0.0);
            weight / counts[&r.persona_index] as f64
        })
        .collect();
    // All-zero weights fall back to a plain bootstrap.
    let sampler = WeightedIndex::new(&probabilities).ok();
    let n = scores.len();

    let mut means: Vec<f64> = (0..resamples)
        .into_par_iter()
        .map(|b| {
            let mut rng = StdRng::seed_from_u64(derive_seed(seed, &["bootstrap", &b.to_string()]));
            let total: f64 = (0..n)
                .map(|_| {
                    let pick = match &sampler {
                        Some(sampler) => sampler.sample(&mut rng),
                        None => rng.gen_range(0..n),
                    };
                    scores[pick]
                })
                .sum();
            total / n as f64
        })
        .collect();
    means.sort_by(|a, b| a.total_cmp(b));

    let alpha = 1.0 - CONFIDENCE_LEVEL;
    ConfidenceInterval {
        lower: percentile(&means, alpha / 2.0),
        upper: percentile(&means, 1.0 - alpha / 2.0),
        level: CONFIDENCE_LEVEL,
        resamples,
    }
}

/// Panel aggregate for one question, or `InsufficientSample` when fewer than
/// `min_valid_samples` respondents survived.
pub fn aggregate_question(
    question_id: &str,
    panel: &Panel,
    respondents: &[ScoredRespondent],
    options: &AggregationOptions,
) -> Result<(Vec<Option<LikertDistribution>>, AggregateResult)> {
    let required = options.min_valid_samples.max(1);
    if respondents.len() < required {
        return Err(SsrError::InsufficientSample {
            question_id: question_id.to_string(),
            valid: respondents.len(),
            required,
        });
    }

    let personas = persona_distributions(panel, respondents);
    let distribution = panel_distribution(panel, &personas).ok_or_else(|| SsrError::InsufficientSample {
        question_id: question_id.to_string(),
        valid: 0,
        required,
    })?;
    let mean_ci = bootstrap_mean_ci(
        panel,
        respondents,
        options.bootstrap_samples,
        derive_seed(options.seed, &["ci", question_id]),
    );
    debug!(question = question_id, lower = mean_ci.lower, upper = mean_ci.upper, "bootstrap interval");

    let result = AggregateResult {
        valid_respondents: respondents.len(),
        personas_reporting: personas.iter().filter(|d| d.is_some()).count(),
        distribution,
        mean_ci,
    };
    info!(
        question = question_id,
        mean = result.distribution.mean,
        top2box = result.distribution.top2box,
        valid = result.valid_respondents,
        "question aggregated"
    );
    Ok((personas, result))
}

/// Most frequent alphabetic words longer than three letters, first seen wins ties.
pub fn top_themes(rationales: &[String], limit: usize) -> Vec<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for text in rationales {
        for raw in text.to_lowercase().split_whitespace() {
            let word = raw.trim_matches(|c: char| ".,!?()".contains(c));
            if word.chars().count() <= 3 || !word.chars().all(char::is_alphabetic) {
                continue;
            }
            match counts.iter_mut().find(|(w, _)| w == word) {
                Some((_, count)) => *count += 1,
                None => counts.push((word.to_string(), 1)),
            }
        }
    }
    // Stable sort keeps first-appearance order among equal counts.
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.into_iter().take(limit).map(|(w, _)| w).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::Persona;

    fn panel(weights: &[f64]) -> Panel {
        Panel::new(
            weights
                .iter()
                .enumerate()
                .map(|(i, w)| Persona::new(&format!("P{i}")).with_weight(*w))
                .collect(),
        )
        .unwrap()
    }

    fn point(k: usize) -> Pmf {
        let mut pmf = [0.0; LIKERT_POINTS];
        pmf[k] = 1.0;
        pmf
    }

    fn respondent(persona_index: usize, pmf: Pmf) -> ScoredRespondent {
        ScoredRespondent { persona_index, pmf }
    }

    #[test]
    fn distribution_metrics_follow_the_pmf() {
        let dist = LikertDistribution::from_pmf([0.1, 0.1, 0.2, 0.3, 0.3], 4);
        assert!((dist.pmf.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!((dist.top2box - (dist.pmf[3] + dist.pmf[4])).abs() < 1e-12);
        assert!((dist.mean - 3.6).abs() < 1e-9);
    }

    #[test]
    fn panel_pmf_is_weighted_over_reporting_personas() {
        let panel = panel(&[0.5, 0.3, 0.2]);
        let respondents = vec![respondent(0, point(4)), respondent(0, point(4)), respondent(1, point(0))];
        let personas = persona_distributions(&panel, &respondents);
        assert!(personas[2].is_none());
        let dist = panel_distribution(&panel, &personas).unwrap();
        assert!((dist.pmf[4] - 0.625).abs() < 1e-9);
        assert!((dist.pmf[0] - 0.375).abs() < 1e-9);
        assert_eq!(dist.sample_n, 3);
    }

    #[test]
    fn bootstrap_is_deterministic_and_brackets_the_mean() {
        let panel = panel(&[0.5, 0.5]);
        let respondents: Vec<ScoredRespondent> = (0..20)
            .map(|i| respondent(i % 2, point(if i % 2 == 0 { 4 } else { i % 4 })))
            .collect();
        let a = bootstrap_mean_ci(&panel, &respondents, 10, 7);
        let b = bootstrap_mean_ci(&panel, &respondents, 10, 7);
        assert_eq!(a, b);
        assert_eq!(a.resamples, MIN_BOOTSTRAP_SAMPLES);
        assert!(a.lower <= a.upper);
        let (_, aggregate) = aggregate_question(
            "primary",
            &panel,
            &respondents,
            &AggregationOptions {
                bootstrap_samples: 1000,
                min_valid_samples: 1,
                seed: 7,
            },
        )
        .unwrap();
        assert!(aggregate.mean_ci.lower <= aggregate.distribution.mean);
        assert!(aggregate.distribution.mean <= aggregate.mean_ci.upper);
    }

    #[test]
    fn too_few_valid_respondents_is_insufficient() {
        let panel = panel(&[1.0]);
        let options = AggregationOptions {
            bootstrap_samples: 1000,
            min_valid_samples: 2,
            seed: 1,
        };
        let err = aggregate_question("q1", &panel, &[respondent(0, point(2))], &options).unwrap_err();
        assert!(matches!(err, SsrError::InsufficientSample { valid: 1, required: 2, .. }));
    }

    #[test]
    fn percentile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 1.0), 4.0);
        assert!((percentile(&values, 0.5) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn themes_count_long_alphabetic_words() {
        let rationales = vec![
            "Great price, great taste!".to_string(),
            "The taste is great but price is high.".to_string(),
            "Love 100% natural taste".to_string(),
        ];
        assert_eq!(top_themes(&rationales, 3), ["great", "taste", "price"]);
    }
}
