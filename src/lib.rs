// src/lib.rs
// ORACULUM SSR
// Synthetic consumer surveys: weighted persona panels, bounded-concurrency
// elicitation and semantic-similarity rating onto a five-point Likert scale.

pub mod error;
pub mod seeds;

// Panel
pub mod persona;
pub mod persona_library;
pub mod persona_generator;
pub mod audience_builder;
pub mod composer;
pub mod raking;
pub mod allocator;
pub mod panel_context;

// Elicitation
pub mod provider;
pub mod cache;
pub mod question;
pub mod concept;
pub mod elicitation;

// Rating
pub mod anchors;
pub mod ssr;
pub mod aggregator;

// Adapters
pub mod bridge;
pub mod demo;

// Service
pub mod config;
pub mod orchestrator;
pub mod reporter;
pub mod api;

pub use error::{Result, SsrError};
pub use orchestrator::{SimulationEngine, SimulationRequest, SimulationResult};
pub use persona::{Panel, Persona};
pub use provider::{ElicitRequest, ElicitationProvider, EmbeddingProvider, PersonaWriter, ProviderError, ProviderErrorKind};
