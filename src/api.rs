// src/api.rs
// HTTP JOB API
// Simulations run as background jobs tracked in an in-memory job store;
// panel previews and library listings answer synchronously.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::audience_builder::AudienceTask;
use crate::composer::PanelInputs;
use crate::error::SsrError;
use crate::orchestrator::{SimulationEngine, SimulationOptions, SimulationRequest, SimulationResult};
use crate::panel_context::PanelContextSpec;
use crate::reporter::Reporter;

// Shared state for every worker
pub struct AppState {
    pub engine: Arc<SimulationEngine>,
    pub jobs: Arc<DashMap<String, JobStatus>>,
    pub job_retention: Duration,
}

impl AppState {
    pub fn new(engine: SimulationEngine) -> Self {
        let job_retention = engine.settings().job_retention();
        Self {
            engine: Arc::new(engine),
            jobs: Arc::new(DashMap::new()),
            job_retention,
        }
    }

    /// Drops finished jobs older than the retention window. Running jobs stay.
    pub fn prune_jobs(&self, now: DateTime<Utc>) -> usize {
        let retention =
            chrono::Duration::from_std(self.job_retention).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| job.finished_at.map_or(true, |finished| now - finished < retention));
        let pruned = before.saturating_sub(self.jobs.len());
        if pruned > 0 {
            debug!(pruned, "expired jobs removed");
        }
        pruned
    }
}

// 1. Response formats
#[derive(Serialize, Deserialize)]
pub struct JobCreatedResponse {
    pub job_id: String,
    pub status: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct JobStatus {
    pub id: String,
    pub status: String,
    pub stage: String,
    pub progress: f32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<SimulationResult>,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// 2. Preview payload: the panel half of a simulation request
#[derive(Deserialize)]
pub struct PreviewRequest {
    #[serde(flatten)]
    pub panel: PanelInputs,
    #[serde(default)]
    pub panel_context: Option<PanelContextSpec>,
    #[serde(flatten)]
    pub options: SimulationOptions,
}

#[derive(Deserialize)]
pub struct AudienceRequest {
    #[serde(flatten)]
    pub task: AudienceTask,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Serialize, Deserialize)]
pub struct PersonaGroupSummary {
    pub name: String,
    pub description: String,
    pub source: Option<String>,
    pub persona_count: usize,
}

fn error_response(err: &SsrError) -> HttpResponse {
    let body = ErrorResponse { error: err.to_string() };
    match err {
        SsrError::Validation(_) | SsrError::Raking(_) | SsrError::InsufficientSample { .. } => {
            HttpResponse::BadRequest().json(body)
        }
        _ => HttpResponse::InternalServerError().json(body),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/simulate", web::post().to(start_simulation))
        .route("/api/status/{id}", web::get().to(get_job_status))
        .route("/api/panel/preview", web::post().to(preview_panel))
        .route("/api/audience/build", web::post().to(build_audience))
        .route("/api/persona-groups", web::get().to(list_persona_groups));
}

// POST /api/simulate
pub async fn start_simulation(data: web::Data<AppState>, req: web::Json<SimulationRequest>) -> impl Responder {
    data.prune_jobs(Utc::now());
    let job_id = Uuid::new_v4().to_string();
    let engine = data.engine.clone();
    let jobs = data.jobs.clone();

    jobs.insert(
        job_id.clone(),
        JobStatus {
            id: job_id.clone(),
            status: "processing".to_string(),
            stage: "queued".to_string(),
            progress: 0.0,
            created_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        },
    );

    let request = req.into_inner();
    let id = job_id.clone();
    actix_web::rt::spawn(async move {
        info!(job = %id, "simulation job started");
        let progress_jobs = jobs.clone();
        let progress_id = id.clone();
        let outcome = engine
            .run_with_progress(&request, move |stage, fraction| {
                if let Some(mut job) = progress_jobs.get_mut(&progress_id) {
                    job.stage = stage.to_string();
                    job.progress = fraction;
                }
            })
            .await;

        if let Some(mut job) = jobs.get_mut(&id) {
            job.finished_at = Some(Utc::now());
            match outcome {
                Ok(result) => {
                    Reporter::log_summary(&result);
                    job.status = "completed".to_string();
                    job.stage = "done".to_string();
                    job.progress = 1.0;
                    job.result = Some(result);
                }
                Err(err) => {
                    error!(job = %id, error = %err, "simulation job failed");
                    job.status = "failed".to_string();
                    job.error = Some(err.to_string());
                }
            }
        }
    });

    HttpResponse::Ok().json(JobCreatedResponse {
        job_id,
        status: "processing".to_string(),
    })
}

// GET /api/status/{id}
pub async fn get_job_status(data: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    match data.jobs.get(&id) {
        Some(job) => HttpResponse::Ok().json(job.value().clone()),
        None => HttpResponse::NotFound().json(ErrorResponse {
            error: format!("job '{}' not found", id),
        }),
    }
}

// POST /api/panel/preview
pub async fn preview_panel(data: web::Data<AppState>, req: web::Json<PreviewRequest>) -> impl Responder {
    let req = req.into_inner();
    match data
        .engine
        .preview(&req.panel, req.panel_context.as_ref(), &req.options)
        .await
    {
        Ok(preview) => HttpResponse::Ok().json(preview),
        Err(err) => error_response(&err),
    }
}

// POST /api/audience/build
pub async fn build_audience(data: web::Data<AppState>, req: web::Json<AudienceRequest>) -> impl Responder {
    let req = req.into_inner();
    match data.engine.synthesize_audience(&req.task, req.seed).await {
        Ok(panel) => HttpResponse::Ok().json(panel),
        Err(err) => error_response(&err),
    }
}

// GET /api/persona-groups
pub async fn list_persona_groups(data: web::Data<AppState>) -> impl Responder {
    let groups: Vec<PersonaGroupSummary> = data
        .engine
        .library()
        .groups()
        .map(|g| PersonaGroupSummary {
            name: g.name.clone(),
            description: g.description.clone(),
            source: g.source.clone(),
            persona_count: g.personas.len(),
        })
        .collect();
    HttpResponse::Ok().json(groups)
}
