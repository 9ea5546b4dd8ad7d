//! Alpha Engine: budgeted research client for x402 payment-gated APIs
//!
//! Provides:
//! - Paid HTTP client running the 402 → sign → retry cycle
//! - Budget guard with a rolling spend ceiling and per-cycle caps
//! - Cancellable periodic scheduler
//! - Research pipeline chaining priced endpoints into trade/alert signals
//! - Keyword sentiment evaluator, endpoint catalog and cost estimates

pub mod actions;
pub mod api;
pub mod budget;
pub mod catalog;
pub mod client;
pub mod config;
pub mod evaluator;
pub mod intel;
pub mod payment;
pub mod pipeline;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use actions::{route, Action};
pub use api::{ReqwestTransport, ResearchApi, Transport};
pub use budget::{BudgetGuard, Clock, Reservation, SystemClock};
pub use catalog::{atomic_to_usd, Catalog, CatalogError, DecisionEstimate, MonitorEstimate};
pub use client::{CallOptions, PaidHttpClient};
pub use config::{AgentConfig, ConfigError, QuoteSelection};
pub use evaluator::{classify, Classifier, KeywordClassifier, Thresholds};
pub use intel::{gather_intelligence, TokenIntelligence};
pub use payment::{CommandSigner, PaymentProofProvider, QuoteSelector, SigningError};
pub use pipeline::{CycleReport, PipelineAborted, PipelineConfig, ResearchPipeline, SubjectOutcome};
pub use scheduler::{CycleContext, CycleEvent, RunSummary, ScheduleOptions, SchedulerHandle};
pub use types::*;
