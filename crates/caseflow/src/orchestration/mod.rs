//! Event-driven recommendation orchestration.
//!
//! The pipeline runs one direction: intake validates and records an event,
//! the scoring engine evaluates the configured indicator rules for the
//! event's type, the builder turns an above-threshold score into a
//! recommendation with an ordered action plan, and the lifecycle store holds
//! it for caseworker review. Approval hands the plan to the executor, which
//! drives the downstream adapters step by step. The sync layer exposes every
//! committed transition to pollers and push subscribers.

pub mod builder;
pub mod engine;
pub mod events;
pub mod executor;
pub mod recommendation;
pub mod router;
pub mod scoring;
pub mod store;
pub mod sync;

#[cfg(test)]
mod tests;

pub use builder::{
    BuildError, ImpactCalculator, PlanTemplate, PlannedStep, RecommendationBuilder,
};
pub use engine::{
    Engine, EngineBuilder, EngineStatistics, EventOutcome, EventTypeDefinition, SubmitError,
};
pub use events::{Event, EventId, EventIntake, EventLog, EventSubmission, ValidationError};
pub use executor::{
    AdapterError, ExecuteError, ExecutionOrchestrator, ExecutionOutcome, StepExecutionError,
    TargetSystemAdapter,
};
pub use recommendation::{
    ActionStep, EstimatedImpact, Recommendation, RecommendationId, RecommendationStatus,
    RecommendationView, StepStatus,
};
pub use scoring::{
    ContextProvider, IndicatorRule, IndicatorSet, InMemoryContextProvider, PredicateError,
    ScoringEngine, ScoringResult, SubjectContext,
};
pub use store::{
    InMemoryRecommendationRepository, LifecycleError, LifecycleEvent, LifecycleEventKind,
    LifecycleStore, RecommendationRepository, RepositoryError,
};
pub use router::engine_router;
pub use sync::ChangePage;

/// Startup-fatal configuration problems. Nothing in the scoring or building
/// path raises this at runtime; a registry that passes [`EngineBuilder`]
/// validation cannot produce these later.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("no event types registered")]
    NoEventTypes,
    #[error("approval threshold {0} must lie within [0, 1]")]
    InvalidThreshold(f64),
    #[error("clock-skew tolerance {0:?} does not fit in a signed duration")]
    ClockSkewOutOfRange(std::time::Duration),
    #[error("duplicate indicator key '{key}' for event type '{event_type}'")]
    DuplicateIndicator { event_type: String, key: String },
    #[error("indicator '{key}' for event type '{event_type}' has non-positive weight {weight}")]
    NonPositiveWeight {
        event_type: String,
        key: String,
        weight: f64,
    },
    #[error("event type '{0}' has no impact calculator registered")]
    MissingImpactCalculator(String),
    #[error("event type '{0}' has no action-plan template registered")]
    MissingPlanTemplate(String),
    #[error("plan template for event type '{event_type}' targets unregistered system '{target_system}'")]
    UnknownTargetSystem {
        event_type: String,
        target_system: String,
    },
}
