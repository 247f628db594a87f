// src/reporter.rs
// Respondent-level CSV export, full JSON export and a logged run summary.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use csv::Writer;
use tracing::info;

use crate::error::Result;
use crate::orchestrator::{QuestionStatus, RespondentState, SimulationResult};

pub struct Reporter;

fn state_label(state: &RespondentState) -> (&'static str, &str) {
    match state {
        RespondentState::Allocated => ("allocated", ""),
        RespondentState::Elicited => ("elicited", ""),
        RespondentState::Mapped => ("mapped", ""),
        RespondentState::Aggregated => ("aggregated", ""),
        RespondentState::Excluded { reason, .. } => ("excluded", reason.as_str()),
    }
}

impl Reporter {
    /// One row per (question, persona, draw).
    pub fn write_csv<W: Write>(writer: W, result: &SimulationResult) -> Result<()> {
        let mut wtr = Writer::from_writer(writer);

        wtr.write_record([
            "question_id",
            "persona_index",
            "persona_name",
            "draw",
            "seed",
            "provider",
            "model",
            "temperature",
            "attempts",
            "retried",
            "cache_hit",
            "state",
            "reason",
            "rationale",
            "p1",
            "p2",
            "p3",
            "p4",
            "p5",
            "expected_rating",
        ])?;

        for question in &result.questions {
            for r in &question.respondents {
                let (state, reason) = state_label(&r.state);
                let mut row = vec![
                    r.question_id.clone(),
                    r.persona_index.to_string(),
                    r.persona_name.clone(),
                    r.draw.to_string(),
                    r.seed.to_string(),
                    r.provider.clone(),
                    r.model.clone(),
                    format!("{:.3}", r.temperature),
                    r.attempts.to_string(),
                    r.retried.to_string(),
                    r.cache_hit.to_string(),
                    state.to_string(),
                    reason.to_string(),
                    r.rationale.clone().unwrap_or_default(),
                ];
                match &r.pmf {
                    Some(pmf) => row.extend(pmf.iter().map(|p| format!("{:.6}", p))),
                    None => row.extend(std::iter::repeat(String::new()).take(5)),
                }
                row.push(r.expected_rating.map(|m| format!("{:.4}", m)).unwrap_or_default());
                wtr.write_record(&row)?;
            }
        }

        wtr.flush()?;
        Ok(())
    }

    pub fn export_csv(path: &Path, result: &SimulationResult) -> Result<()> {
        Self::write_csv(File::create(path)?, result)?;
        info!(path = %path.display(), "respondent CSV exported");
        Ok(())
    }

    pub fn export_json(path: &Path, result: &SimulationResult) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_json::to_string_pretty(result)?.as_bytes())?;
        info!(path = %path.display(), "simulation JSON exported");
        Ok(())
    }

    pub fn log_summary(result: &SimulationResult) {
        let meta = &result.metadata;
        info!(
            seed = meta.seed,
            provider = %meta.provider,
            model = %meta.model,
            personas = meta.allocation.draws.len(),
            respondents = meta.allocation.total(),
            excluded_elicitation = meta.excluded_elicitation,
            excluded_mapping = meta.excluded_mapping,
            "simulation summary"
        );
        for question in &result.questions {
            match (&question.status, &question.aggregate) {
                (QuestionStatus::Reported, Some(aggregate)) => info!(
                    question = %question.question.id,
                    mean = format!("{:.2}", aggregate.distribution.mean),
                    top2box = format!("{:.1}%", aggregate.distribution.top2box * 100.0),
                    ci = format!("[{:.2}, {:.2}]", aggregate.mean_ci.lower, aggregate.mean_ci.upper),
                    valid = aggregate.valid_respondents,
                    "question result"
                ),
                _ => info!(
                    question = %question.question.id,
                    error = question.error.as_deref().unwrap_or("not reported"),
                    "question failed"
                ),
            }
        }
    }
}
