use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::EngineSettings;

use super::builder::{BuildError, ImpactCalculator, PlanTemplate, RecommendationBuilder};
use super::events::{Event, EventId, EventIntake, EventLog, EventSubmission, ValidationError};
use super::executor::{ExecutionOrchestrator, TargetSystemAdapter};
use super::recommendation::{Recommendation, RecommendationId, RecommendationStatus};
use super::scoring::{
    ContextProvider, IndicatorRule, IndicatorSet, ScoringEngine, SubjectContext,
};
use super::store::{
    InMemoryRecommendationRepository, LifecycleError, LifecycleEvent, LifecycleStore,
    RecommendationRepository,
};
use super::sync::ChangePage;
use super::ConfigurationError;

/// Everything the engine needs to know about one event type: its indicator
/// rules, required metadata keys, impact calculator, and plan template.
pub struct EventTypeDefinition {
    name: String,
    rules: Vec<IndicatorRule>,
    required_metadata: Vec<String>,
    calculator: Option<Arc<dyn ImpactCalculator>>,
    template: Option<Arc<dyn PlanTemplate>>,
}

impl EventTypeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
            required_metadata: Vec::new(),
            calculator: None,
            template: None,
        }
    }

    pub fn rule(mut self, rule: IndicatorRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn requires_metadata(mut self, key: impl Into<String>) -> Self {
        self.required_metadata.push(key.into());
        self
    }

    pub fn impact_calculator(mut self, calculator: Arc<dyn ImpactCalculator>) -> Self {
        self.calculator = Some(calculator);
        self
    }

    pub fn plan_template(mut self, template: Arc<dyn PlanTemplate>) -> Self {
        self.template = Some(template);
        self
    }
}

/// Assembles and validates the engine configuration surface: rule sets per
/// event type, the approval threshold, calculators, templates, downstream
/// adapters, and retry/backoff parameters. All of it is fixed at startup.
pub struct EngineBuilder {
    settings: EngineSettings,
    repository: Arc<dyn RecommendationRepository>,
    context: Arc<dyn ContextProvider>,
    adapters: BTreeMap<String, Arc<dyn TargetSystemAdapter>>,
    event_types: Vec<EventTypeDefinition>,
}

struct NullContextProvider;

impl ContextProvider for NullContextProvider {
    fn context_for(&self, _event: &Event) -> SubjectContext {
        SubjectContext::new()
    }
}

impl EngineBuilder {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            repository: Arc::new(InMemoryRecommendationRepository::default()),
            context: Arc::new(NullContextProvider),
            adapters: BTreeMap::new(),
            event_types: Vec::new(),
        }
    }

    pub fn repository(mut self, repository: Arc<dyn RecommendationRepository>) -> Self {
        self.repository = repository;
        self
    }

    pub fn context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context = provider;
        self
    }

    pub fn adapter(
        mut self,
        target_system: impl Into<String>,
        adapter: Arc<dyn TargetSystemAdapter>,
    ) -> Self {
        self.adapters.insert(target_system.into(), adapter);
        self
    }

    pub fn event_type(mut self, definition: EventTypeDefinition) -> Self {
        self.event_types.push(definition);
        self
    }

    pub fn build(self) -> Result<Arc<Engine>, ConfigurationError> {
        if self.event_types.is_empty() {
            return Err(ConfigurationError::NoEventTypes);
        }
        let threshold = self.settings.approval_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigurationError::InvalidThreshold(threshold));
        }
        let clock_skew_tolerance =
            chrono::Duration::from_std(self.settings.clock_skew_tolerance).map_err(|_| {
                ConfigurationError::ClockSkewOutOfRange(self.settings.clock_skew_tolerance)
            })?;

        let mut sets = BTreeMap::new();
        let mut known_types = BTreeMap::new();
        let mut calculators = BTreeMap::new();
        let mut templates = BTreeMap::new();
        let mut reasons = BTreeMap::new();

        for definition in self.event_types {
            let name = definition.name;
            for rule in &definition.rules {
                reasons.insert(rule.key.clone(), rule.reason.clone());
            }
            let set = IndicatorSet::new(&name, definition.rules)?;
            let calculator = definition
                .calculator
                .ok_or_else(|| ConfigurationError::MissingImpactCalculator(name.clone()))?;
            let template = definition
                .template
                .ok_or_else(|| ConfigurationError::MissingPlanTemplate(name.clone()))?;
            for target_system in template.target_systems() {
                if !self.adapters.contains_key(&target_system) {
                    return Err(ConfigurationError::UnknownTargetSystem {
                        event_type: name.clone(),
                        target_system,
                    });
                }
            }
            sets.insert(name.clone(), set);
            calculators.insert(name.clone(), calculator);
            templates.insert(name.clone(), template);
            known_types.insert(name, definition.required_metadata);
        }

        let event_log = Arc::new(EventLog::default());
        let store = Arc::new(LifecycleStore::new(self.repository));
        let executor = Arc::new(ExecutionOrchestrator::new(
            self.adapters,
            self.settings.retry.clone(),
            self.settings.step_call_timeout,
            Arc::clone(&store),
        ));

        Ok(Arc::new(Engine {
            intake: EventIntake::new(known_types, clock_skew_tolerance, Arc::clone(&event_log)),
            event_log,
            scoring: ScoringEngine::new(sets),
            builder: RecommendationBuilder::new(threshold, calculators, templates, reasons),
            store,
            executor,
            context: self.context,
            counters: EngineCounters::default(),
        }))
    }
}

/// Failure submitting an event through the full intake-score-build path.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// What came out of one event submission.
#[derive(Debug, Clone)]
pub struct EventOutcome {
    pub event: Event,
    /// `None` when confidence stayed below the approval threshold.
    pub recommendation: Option<Recommendation>,
}

#[derive(Default)]
struct EngineCounters {
    events_accepted: AtomicU64,
    events_rejected: AtomicU64,
    events_below_threshold: AtomicU64,
    recommendations_created: AtomicU64,
    approvals: AtomicU64,
    rejections: AtomicU64,
    executions_completed: AtomicU64,
    executions_failed: AtomicU64,
}

/// Operational counters for the statistics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatistics {
    pub events_accepted: u64,
    pub events_rejected: u64,
    pub events_below_threshold: u64,
    pub recommendations_created: u64,
    pub approvals: u64,
    pub rejections: u64,
    pub executions_completed: u64,
    pub executions_failed: u64,
}

/// Facade wiring intake, scoring, building, the lifecycle store, and the
/// executor together. External components consume the engine through this
/// type or the router in [`super::router`].
pub struct Engine {
    intake: EventIntake,
    event_log: Arc<EventLog>,
    scoring: ScoringEngine,
    builder: RecommendationBuilder,
    store: Arc<LifecycleStore>,
    executor: Arc<ExecutionOrchestrator>,
    context: Arc<dyn ContextProvider>,
    counters: EngineCounters,
}

impl Engine {
    /// Validate and record an event, score it, and create a recommendation
    /// when the score clears the threshold. Unrelated events may be
    /// submitted concurrently; no ordering is guaranteed between them.
    pub fn submit_event(&self, submission: EventSubmission) -> Result<EventOutcome, SubmitError> {
        let event = self.intake.submit(submission).inspect_err(|_| {
            self.counters.events_rejected.fetch_add(1, Ordering::Relaxed);
        })?;
        self.counters.events_accepted.fetch_add(1, Ordering::Relaxed);

        let context = self.context.context_for(&event);
        let scoring = self.scoring.score(&event, &context);
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            confidence = scoring.confidence,
            matched = scoring.matched_indicators.len(),
            "event scored"
        );

        match self.builder.build(&scoring, &event)? {
            None => {
                self.counters
                    .events_below_threshold
                    .fetch_add(1, Ordering::Relaxed);
                Ok(EventOutcome {
                    event,
                    recommendation: None,
                })
            }
            Some(recommendation) => {
                let stored = self.store.insert_pending(recommendation)?;
                self.counters
                    .recommendations_created
                    .fetch_add(1, Ordering::Relaxed);
                Ok(EventOutcome {
                    event,
                    recommendation: Some(stored),
                })
            }
        }
    }

    /// Approve a pending recommendation and start executing its plan in a
    /// background task. The returned record is already `executing`; callers
    /// observe the terminal state via `get`, `poll`, or `subscribe`.
    pub fn approve(
        self: &Arc<Self>,
        id: &RecommendationId,
        actor: &str,
    ) -> Result<Recommendation, LifecycleError> {
        let record = self.store.approve(id, actor)?;
        self.counters.approvals.fetch_add(1, Ordering::Relaxed);

        let engine = Arc::clone(self);
        let id = id.clone();
        tokio::spawn(async move {
            engine.run_execution(&id).await;
        });
        Ok(record)
    }

    /// Drive one recommendation's plan to its terminal state. `approve`
    /// spawns this; tests and the demo may await it directly.
    pub async fn run_execution(&self, id: &RecommendationId) {
        match self.executor.execute(id).await {
            Ok(outcome) => {
                let counter = if outcome.status == RecommendationStatus::Completed {
                    &self.counters.executions_completed
                } else {
                    &self.counters.executions_failed
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                error!(recommendation_id = %id, error = %err, "execution could not run");
            }
        }
    }

    pub fn reject(
        &self,
        id: &RecommendationId,
        actor: &str,
    ) -> Result<Recommendation, LifecycleError> {
        let record = self.store.reject(id, actor)?;
        self.counters.rejections.fetch_add(1, Ordering::Relaxed);
        Ok(record)
    }

    pub fn get(
        &self,
        id: &RecommendationId,
    ) -> Result<Option<Recommendation>, super::store::RepositoryError> {
        self.store.get(id)
    }

    pub fn list(
        &self,
        status: Option<RecommendationStatus>,
    ) -> Result<Vec<Recommendation>, super::store::RepositoryError> {
        self.store.list(status)
    }

    pub fn poll(
        &self,
        status: Option<RecommendationStatus>,
        since_cursor: u64,
    ) -> Result<ChangePage, super::store::RepositoryError> {
        self.store.poll(status, since_cursor)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.store.subscribe()
    }

    pub fn event(&self, id: &EventId) -> Option<Event> {
        self.event_log.get(id)
    }

    pub fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            events_accepted: self.counters.events_accepted.load(Ordering::Relaxed),
            events_rejected: self.counters.events_rejected.load(Ordering::Relaxed),
            events_below_threshold: self
                .counters
                .events_below_threshold
                .load(Ordering::Relaxed),
            recommendations_created: self
                .counters
                .recommendations_created
                .load(Ordering::Relaxed),
            approvals: self.counters.approvals.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
            executions_completed: self.counters.executions_completed.load(Ordering::Relaxed),
            executions_failed: self.counters.executions_failed.load(Ordering::Relaxed),
        }
    }
}
