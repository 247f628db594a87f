// src/config.rs
// SETTINGS LOADER
// Layered configuration: embedded defaults, then an optional oraculum.toml,
// then ORACULUM_* environment variables (highest priority).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SsrError};

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const CONFIG_FILE: &str = "oraculum";

pub const MAX_CONCURRENCY_LIMIT: usize = 512;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    pub bind_addr: String,
    /// Base URL of the inference worker. Without it the demo providers run.
    #[serde(default)]
    pub bridge_url: Option<String>,
    pub model: String,
    pub embedding_model: String,
    pub max_concurrency: usize,
    pub default_sample_size: usize,
    pub anchor_bank_path: PathBuf,
    pub persona_library_path: PathBuf,
    pub log_level: String,
    pub base_temperature: f32,
    pub retry_temperature_factor: f32,
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    /// 0 = unbounded.
    pub cache_capacity: usize,
    pub bootstrap_samples: usize,
    pub min_valid_samples: usize,
    pub ssr_epsilon: f64,
    pub raking_tolerance: f64,
    /// How long finished jobs stay queryable.
    pub job_retention_secs: u64,
    pub demo_mode: bool,
}

impl AppSettings {
    /// Reads `.env` if present, then the layered sources. `path` replaces the
    /// default `oraculum.toml` lookup and must exist when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(path) => File::from(path.to_path_buf()).required(true),
            None => File::with_name(CONFIG_FILE).required(false),
        };
        let config = Config::builder()
            // 1. Embedded defaults
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            // 2. Optional file overrides
            .add_source(file)
            // 3. Environment (ORACULUM_MAX_CONCURRENCY=..., single _ after the prefix)
            .add_source(
                Environment::with_prefix("ORACULUM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: AppSettings = config.try_deserialize()?;
        settings.validate()?;
        debug!(?settings, "settings loaded");
        Ok(settings)
    }

    /// Defaults overlaid with a TOML document, no file or environment lookup.
    pub fn from_toml_str(overrides: &str) -> Result<Self> {
        let settings: AppSettings = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::from_str(overrides, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_CONCURRENCY_LIMIT).contains(&self.max_concurrency) {
            return Err(SsrError::validation(format!(
                "max_concurrency {} must lie in [1, {}]",
                self.max_concurrency, MAX_CONCURRENCY_LIMIT
            )));
        }
        if self.default_sample_size == 0 {
            return Err(SsrError::validation("default_sample_size must be at least 1"));
        }
        if !(0.0..=2.0).contains(&self.base_temperature) {
            return Err(SsrError::validation(format!(
                "base_temperature {} must lie in [0, 2]",
                self.base_temperature
            )));
        }
        if !(self.retry_temperature_factor > 0.0 && self.retry_temperature_factor <= 1.0) {
            return Err(SsrError::validation(format!(
                "retry_temperature_factor {} must lie in (0, 1]",
                self.retry_temperature_factor
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(SsrError::validation("request_timeout_secs must be at least 1"));
        }
        if self.job_retention_secs == 0 {
            return Err(SsrError::validation("job_retention_secs must be at least 1"));
        }
        if self.cache_ttl_secs == Some(0) {
            return Err(SsrError::validation("cache_ttl_secs must be positive when set"));
        }
        if self.min_valid_samples == 0 {
            return Err(SsrError::validation("min_valid_samples must be at least 1"));
        }
        if self.bootstrap_samples == 0 {
            return Err(SsrError::validation("bootstrap_samples must be at least 1"));
        }
        for (name, value) in [("ssr_epsilon", self.ssr_epsilon), ("raking_tolerance", self.raking_tolerance)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(SsrError::validation(format!("{} must be a positive number", name)));
            }
        }
        if let Some(url) = &self.bridge_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(SsrError::validation(format!("bridge_url '{}' is not an http(s) URL", url)));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }

    /// Demo providers run when asked for, or when no worker is configured.
    pub fn use_demo_providers(&self) -> bool {
        self.demo_mode || self.bridge_url.is_none()
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            bridge_url: None,
            model: "qwen2.5-7b-instruct".to_string(),
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            max_concurrency: 64,
            default_sample_size: 200,
            anchor_bank_path: PathBuf::from("anchors"),
            persona_library_path: PathBuf::from("personas"),
            log_level: "info".to_string(),
            base_temperature: 1.0,
            retry_temperature_factor: 0.5,
            request_timeout_secs: 60,
            cache_ttl_secs: None,
            cache_capacity: 50_000,
            bootstrap_samples: 1000,
            min_valid_samples: 1,
            ssr_epsilon: 1e-6,
            raking_tolerance: 1e-6,
            job_retention_secs: 3600,
            demo_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_match_default_impl() {
        assert_eq!(AppSettings::from_toml_str("").unwrap(), AppSettings::default());
    }

    #[test]
    fn toml_overrides_apply_on_top_of_defaults() {
        let settings = AppSettings::from_toml_str(
            "max_concurrency = 8\nbridge_url = \"http://localhost:9000\"\ncache_ttl_secs = 30",
        )
        .unwrap();
        assert_eq!(settings.max_concurrency, 8);
        assert_eq!(settings.cache_ttl(), Some(Duration::from_secs(30)));
        assert!(!settings.use_demo_providers());
        assert_eq!(settings.min_valid_samples, 1);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for bad in [
            "max_concurrency = 0",
            "max_concurrency = 513",
            "retry_temperature_factor = 0.0",
            "ssr_epsilon = 0.0",
            "job_retention_secs = 0",
            "bridge_url = \"localhost:9000\"",
        ] {
            assert!(
                matches!(AppSettings::from_toml_str(bad), Err(SsrError::Validation(_))),
                "{bad} should fail validation"
            );
        }
    }

    #[test]
    fn config_file_is_read_when_given() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "default_sample_size = 25\ndemo_mode = true\n").unwrap();
        let settings = AppSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.default_sample_size, 25);
        assert!(settings.use_demo_providers());
    }
}
