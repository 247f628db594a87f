// src/main.rs
// ORACULUM SSR - API SERVER
// Loads settings, builds the simulation engine once and serves the job API.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use oraculum_ssr::api::{self, AppState};
use oraculum_ssr::config::AppSettings;
use oraculum_ssr::orchestrator::SimulationEngine;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // 1. Settings (defaults -> oraculum.toml -> ORACULUM_* env)
    let settings = match AppSettings::load(None) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("invalid configuration: {}", err);
            std::process::exit(2);
        }
    };

    // 2. Logging, RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level)))
        .init();

    // 3. Engine (persona library, anchor banks, providers, caches)
    let bind_addr = settings.bind_addr.clone();
    let engine = match SimulationEngine::from_settings(settings) {
        Ok(engine) => engine,
        Err(err) => {
            error!(error = %err, "engine initialization failed");
            std::process::exit(1);
        }
    };
    let app_state = web::Data::new(AppState::new(engine));

    info!(addr = %bind_addr, "Oraculum SSR server starting");

    // 4. HTTP server
    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(app_state.clone())
            .app_data(web::JsonConfig::default().limit(4 * 1024 * 1024))
            .configure(api::configure)
    })
    .bind(bind_addr)?
    .run()
    .await
}
