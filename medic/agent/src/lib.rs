#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Medical question answering that routes each query to a literature or web
//! backend, validates the evidence, refines the query when needed and returns
//! a cited summary.

/// Queries, evidence and verdicts.
#[path = "../model.rs"]
pub mod model;

/// Error taxonomy.
#[path = "../error.rs"]
pub mod error;

/// Environment-driven configuration.
#[path = "../config.rs"]
pub mod config;

/// Language-model collaborator.
#[path = "../llm.rs"]
pub mod llm;

/// Search backends and the category router.
#[path = "../sources.rs"]
pub mod sources;

/// Research/general classifier.
#[path = "../classifier.rs"]
pub mod classifier;

/// Evidence quality gate.
#[path = "../gate.rs"]
pub mod gate;

/// Query refinement.
#[path = "../refiner.rs"]
pub mod refiner;

/// Cited summaries.
#[path = "../summarizer.rs"]
pub mod summarizer;

/// Per-request session state.
#[path = "../session.rs"]
pub mod session;

/// Session persistence and writer leases.
#[path = "../checkpoint.rs"]
pub mod checkpoint;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Request state machine.
#[path = "../orchestrator.rs"]
pub mod orchestrator;

/// High-level entry point.
#[path = "../runtime.rs"]
pub mod runtime;

pub use checkpoint::{
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, NoopCheckpointStore,
    SessionClaim, WriterLease, WriterLeases, DEFAULT_STALE_CLAIM,
};
pub use classifier::{ClassifierOutcome, QueryClassifier};
pub use config::{AgentConfig, GateConfig, LlmConfig, LlmProvider, SourcesConfig, Timeouts};
pub use error::{
    AgentError, AgentResult, BackendError, CheckpointError, ConfigError, ModelError,
};
pub use gate::QualityGate;
pub use llm::{CompletionOptions, HttpLanguageModel, LanguageModel, ScriptedLanguageModel};
pub use model::{
    Decision, EvidenceItem, EvidenceSet, EvidenceSource, QualityVerdict, Query, QueryCategory,
    QueryClassification, QueryOrigin, Summary,
};
pub use orchestrator::{AgentComponents, AgentOutcome, FailureReport, Orchestrator};
pub use refiner::QueryRefiner;
pub use runtime::{AgentReply, AgentRequest, MedicalAgent};
pub use session::{AgentStage, FailureReason, SessionKey, SessionState, SessionStatus};
pub use sources::{
    EvidenceSourceAdapter, PubMedClient, SearchBackend, SearchHit, StaticSearchBackend,
    TavilyClient,
};
pub use summarizer::{Summarizer, DISCLAIMER};
pub use telemetry::{AgentTelemetry, AgentTelemetryBuilder};
