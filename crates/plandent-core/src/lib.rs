//! Plandent Core - Turning dental quotes into treatment plans
//!
//! This crate contains the extraction pipeline behind Plandent:
//! - Prompt catalog and model gateways (Gemini over SSE, scripted replay)
//! - Partial JSON extraction while a response streams in
//! - Structural repair of truncated JSON
//! - Streaming sessions with progress, cancellation and timeouts
//! - Reconciliation of the known model output shapes into one plan record
//! - Plan persistence (in-memory and JSON files)

pub mod config;
pub mod document;
pub mod error;
pub mod extract;
pub(crate) mod fields;
pub mod gateway;
pub mod pipeline;
pub mod plan;
pub mod prompts;
pub mod reconcile;
pub mod repair;
pub mod session;
pub mod store;

pub use config::{Config, ModelSettings, SessionOptions, SettingsHandle};
pub use document::SourceDocument;
pub use error::{ErrorReport, ExtractionError, GatewayError, Remedy};
pub use extract::{extract_partial, PartialJsonExtractor};
pub use gateway::{
    ExtractionMode, ExtractionRequest, FinishReason, GeminiGateway, ModelGateway, ScriptedGateway,
};
pub use pipeline::{ExtractionPipeline, PipelineOutcome};
pub use plan::{PartialPlanSnapshot, ReconciledTreatmentPlan};
pub use prompts::PromptVariant;
pub use reconcile::{PlanContext, PlanReconciler};
pub use session::{
    ChannelObserver, ExtractionEvent, ExtractionObserver, ExtractionSession, NoOpObserver,
    OutputQuality, SessionHandle, SessionState,
};
pub use store::{JsonFilePlanStore, MemoryPlanStore, PlanId, PlanStore};
