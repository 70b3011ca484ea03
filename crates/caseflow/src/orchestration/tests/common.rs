use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use crate::config::{EngineSettings, RetryPolicy};
use crate::orchestration::builder::{ImpactCalculator, PlanTemplate, PlannedStep};
use crate::orchestration::engine::{Engine, EngineBuilder, EventTypeDefinition};
use crate::orchestration::events::{Event, EventId, EventSubmission};
use crate::orchestration::executor::{AdapterError, TargetSystemAdapter};
use crate::orchestration::recommendation::{
    ActionStep, EstimatedImpact, Recommendation, RecommendationId, RecommendationStatus,
    StepStatus,
};
use crate::orchestration::scoring::{
    ContextProvider, IndicatorRule, ScoringResult, SubjectContext,
};

pub(super) const SCHEDULING: &str = "provider_scheduling";
pub(super) const NOTIFICATIONS: &str = "notifications";

/// Settings with retry delays short enough for tests.
pub(super) fn fast_settings(threshold: f64) -> EngineSettings {
    EngineSettings {
        approval_threshold: threshold,
        clock_skew_tolerance: Duration::from_secs(300),
        step_call_timeout: Duration::from_millis(250),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
    }
}

/// Adapter that records every payload it receives and always succeeds.
#[derive(Default)]
pub(super) struct RecordingAdapter {
    pub(super) calls: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl TargetSystemAdapter for RecordingAdapter {
    async fn invoke(&self, step: &ActionStep) -> Result<Value, AdapterError> {
        let mut guard = self.calls.lock().expect("calls mutex poisoned");
        guard.push((step.target_system.clone(), step.payload.clone()));
        Ok(json!({ "status": "ok" }))
    }
}

impl RecordingAdapter {
    pub(super) fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }
}

/// Adapter that fails transiently `failures` times, then succeeds.
pub(super) struct FlakyAdapter {
    remaining_failures: AtomicU32,
}

impl FlakyAdapter {
    pub(super) fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl TargetSystemAdapter for FlakyAdapter {
    async fn invoke(&self, _step: &ActionStep) -> Result<Value, AdapterError> {
        let remaining = self.remaining_failures.load(Ordering::Relaxed);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::Relaxed);
            return Err(AdapterError::Transient("downstream busy".to_string()));
        }
        Ok(json!({ "status": "ok" }))
    }
}

/// Adapter that always fails transiently.
pub(super) struct AlwaysFailingAdapter;

#[async_trait]
impl TargetSystemAdapter for AlwaysFailingAdapter {
    async fn invoke(&self, _step: &ActionStep) -> Result<Value, AdapterError> {
        Err(AdapterError::Transient("downstream unreachable".to_string()))
    }
}

/// Adapter that fails permanently on the first call.
pub(super) struct RejectingAdapter;

#[async_trait]
impl TargetSystemAdapter for RejectingAdapter {
    async fn invoke(&self, _step: &ActionStep) -> Result<Value, AdapterError> {
        Err(AdapterError::Permanent("payload rejected".to_string()))
    }
}

/// Adapter that never answers within a test-sized call timeout.
pub(super) struct StalledAdapter;

#[async_trait]
impl TargetSystemAdapter for StalledAdapter {
    async fn invoke(&self, _step: &ActionStep) -> Result<Value, AdapterError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!({ "status": "late" }))
    }
}

pub(super) struct FixedImpact;

impl ImpactCalculator for FixedImpact {
    fn estimate(&self, _event: &Event, _scoring: &ScoringResult) -> EstimatedImpact {
        EstimatedImpact {
            monetary_savings_cents: 12_000,
            time_saved_minutes: 45,
            notes: vec!["avoids a wasted appointment slot".to_string()],
        }
    }
}

/// Two-step plan: rebook the slot, then notify the client.
pub(super) struct RebookPlan;

impl PlanTemplate for RebookPlan {
    fn target_systems(&self) -> Vec<String> {
        vec![SCHEDULING.to_string(), NOTIFICATIONS.to_string()]
    }

    fn plan(&self, event: &Event) -> Vec<PlannedStep> {
        vec![
            PlannedStep {
                target_system: SCHEDULING.to_string(),
                payload: json!({
                    "action": "book_appointment",
                    "slot": event.metadata_str("appointment_time"),
                }),
            },
            PlannedStep {
                target_system: NOTIFICATIONS.to_string(),
                payload: json!({
                    "action": "send_sms",
                    "client": event.subject_ids.get("client"),
                }),
            },
        ]
    }
}

/// Context provider returning the same attribute bag for every event.
pub(super) struct FixedContext(pub(super) SubjectContext);

impl ContextProvider for FixedContext {
    fn context_for(&self, _event: &Event) -> SubjectContext {
        self.0.clone()
    }
}

/// Rule pair for the cancellation scenario: overlapping slot (0.6) and
/// shared transport route (0.4), both reading subject-context flags.
pub(super) fn slot_rules() -> Vec<IndicatorRule> {
    vec![
        IndicatorRule::new("overlap_slot", 0.6, |_event, context: &SubjectContext| {
            Ok(context.flag("overlap_slot"))
        })
        .with_reason("another client can take the freed appointment slot"),
        IndicatorRule::new("same_route", 0.4, |_event, context: &SubjectContext| {
            Ok(context.flag("same_route"))
        })
        .with_tag("eligibility-relevant")
        .with_reason("replacement client lives on the existing transport route"),
    ]
}

pub(super) fn matching_context() -> SubjectContext {
    SubjectContext::new()
        .with("overlap_slot", true)
        .with("same_route", true)
}

pub(super) fn cancellation_definition() -> EventTypeDefinition {
    let mut definition = EventTypeDefinition::new("appointment_cancelled")
        .requires_metadata("appointment_time")
        .impact_calculator(Arc::new(FixedImpact))
        .plan_template(Arc::new(RebookPlan));
    for rule in slot_rules() {
        definition = definition.rule(rule);
    }
    definition
}

/// Engine with the cancellation event type, recording adapters, and a fully
/// matching context. Returns the adapters for call assertions.
pub(super) fn engine(
    threshold: f64,
) -> (Arc<Engine>, Arc<RecordingAdapter>, Arc<RecordingAdapter>) {
    let scheduling = Arc::new(RecordingAdapter::default());
    let notifications = Arc::new(RecordingAdapter::default());
    let engine = EngineBuilder::new(fast_settings(threshold))
        .context_provider(Arc::new(FixedContext(matching_context())))
        .adapter(SCHEDULING, scheduling.clone())
        .adapter(NOTIFICATIONS, notifications.clone())
        .event_type(cancellation_definition())
        .build()
        .expect("engine configuration is valid");
    (engine, scheduling, notifications)
}

pub(super) fn submission() -> EventSubmission {
    let mut subject_ids = BTreeMap::new();
    subject_ids.insert("client".to_string(), "c1".to_string());

    let mut metadata = BTreeMap::new();
    metadata.insert(
        "appointment_time".to_string(),
        Value::String("2026-03-02T14:00:00Z".to_string()),
    );
    metadata.insert("provider_id".to_string(), Value::String("p9".to_string()));

    EventSubmission {
        event_type: "appointment_cancelled".to_string(),
        subject_ids,
        occurred_at: Utc::now() - ChronoDuration::minutes(5),
        metadata,
    }
}

/// A pending two-step recommendation for store-level tests.
pub(super) fn pending_recommendation(id: &str) -> Recommendation {
    Recommendation {
        id: RecommendationId(id.to_string()),
        source_event_id: EventId("evt-000001".to_string()),
        summary: "rebook the freed slot".to_string(),
        reasoning: vec!["another client can take the freed appointment slot".to_string()],
        confidence: 1.0,
        estimated_impact: EstimatedImpact::default(),
        action_plan: vec![
            ActionStep {
                sequence_no: 1,
                target_system: SCHEDULING.to_string(),
                payload: json!({ "action": "book_appointment" }),
                status: StepStatus::Pending,
                last_error: None,
                attempt_count: 0,
            },
            ActionStep {
                sequence_no: 2,
                target_system: NOTIFICATIONS.to_string(),
                payload: json!({ "action": "send_sms" }),
                status: StepStatus::Pending,
                last_error: None,
                attempt_count: 0,
            },
        ],
        status: RecommendationStatus::PendingApproval,
        created_at: Utc::now(),
        decided_at: None,
        decided_by: None,
        completed_at: None,
    }
}

/// Await the next lifecycle event of the given kind, with a test timeout.
pub(super) async fn await_status(
    receiver: &mut tokio::sync::broadcast::Receiver<crate::orchestration::store::LifecycleEvent>,
    wanted: RecommendationStatus,
) -> Recommendation {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = receiver.recv().await.expect("lifecycle channel open");
            if event.recommendation.status == wanted {
                return event.recommendation;
            }
        }
    })
    .await
    .expect("status reached before timeout")
}
