use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use caseflow::config::EngineSettings;
use caseflow::orchestration::{
    ActionStep, AdapterError, ConfigurationError, Engine, EngineBuilder, EstimatedImpact, Event,
    EventSubmission, EventTypeDefinition, ImpactCalculator, IndicatorRule,
    InMemoryContextProvider, PlanTemplate, PlannedStep, ScoringResult, SubjectContext,
    TargetSystemAdapter,
};
use chrono::{Duration, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use tracing::info;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

pub(crate) const PROVIDER_SCHEDULING: &str = "provider_scheduling";
pub(crate) const TRANSPORTATION: &str = "transportation";
pub(crate) const NOTIFICATIONS: &str = "notifications";
pub(crate) const PROVIDER_API: &str = "provider_api";
pub(crate) const CASE_MANAGEMENT: &str = "case_management";

/// Stand-in adapter for deployments without live downstream credentials:
/// logs the call and acknowledges it.
pub(crate) struct LoggingAdapter {
    target_system: &'static str,
}

impl LoggingAdapter {
    pub(crate) fn new(target_system: &'static str) -> Arc<Self> {
        Arc::new(Self { target_system })
    }
}

#[async_trait]
impl TargetSystemAdapter for LoggingAdapter {
    async fn invoke(&self, step: &ActionStep) -> Result<Value, AdapterError> {
        info!(
            target_system = self.target_system,
            step = step.sequence_no,
            payload = %step.payload,
            "dispatching action step"
        );
        Ok(json!({ "status": "acknowledged", "system": self.target_system }))
    }
}

/// Impact model for filling a cancelled appointment slot: the slot is not
/// wasted and the waiting client is seen roughly two weeks sooner.
pub(crate) struct BumpAppointmentImpact;

impl ImpactCalculator for BumpAppointmentImpact {
    fn estimate(&self, _event: &Event, scoring: &ScoringResult) -> EstimatedImpact {
        EstimatedImpact {
            monetary_savings_cents: 12_000,
            time_saved_minutes: 20_160,
            notes: vec![
                "recovers the value of an otherwise unused provider slot".to_string(),
                format!(
                    "confidence {:.0}% across {} matched indicators",
                    scoring.confidence * 100.0,
                    scoring.matched_indicators.len()
                ),
            ],
        }
    }
}

/// Plan for moving a waiting client into a freed appointment slot: hold the
/// slot, rebook transport, tell both parties, confirm with the provider, and
/// leave a case note.
pub(crate) struct BumpAppointmentPlan;

impl PlanTemplate for BumpAppointmentPlan {
    fn target_systems(&self) -> Vec<String> {
        vec![
            PROVIDER_SCHEDULING.to_string(),
            TRANSPORTATION.to_string(),
            NOTIFICATIONS.to_string(),
            PROVIDER_API.to_string(),
            CASE_MANAGEMENT.to_string(),
        ]
    }

    fn plan(&self, event: &Event) -> Vec<PlannedStep> {
        let slot = event.metadata_str("appointment_time");
        let provider = event.metadata_str("provider_id");
        let replacement = event.metadata_str("replacement_client_id");
        vec![
            PlannedStep {
                target_system: PROVIDER_SCHEDULING.to_string(),
                payload: json!({
                    "action": "hold_slot",
                    "provider_id": provider,
                    "slot": slot,
                }),
            },
            PlannedStep {
                target_system: PROVIDER_SCHEDULING.to_string(),
                payload: json!({
                    "action": "book_appointment",
                    "provider_id": provider,
                    "slot": slot,
                    "client_id": replacement,
                }),
            },
            PlannedStep {
                target_system: TRANSPORTATION.to_string(),
                payload: json!({
                    "action": "rebook_ride",
                    "client_id": replacement,
                    "pickup_for": slot,
                }),
            },
            PlannedStep {
                target_system: NOTIFICATIONS.to_string(),
                payload: json!({
                    "action": "send_sms",
                    "client_id": replacement,
                    "template": "appointment_moved_up",
                    "slot": slot,
                }),
            },
            PlannedStep {
                target_system: PROVIDER_API.to_string(),
                payload: json!({
                    "action": "confirm_attendance",
                    "provider_id": provider,
                    "slot": slot,
                }),
            },
            PlannedStep {
                target_system: CASE_MANAGEMENT.to_string(),
                payload: json!({
                    "action": "append_case_note",
                    "client_id": replacement,
                    "note": "appointment moved up into a cancelled slot",
                }),
            },
        ]
    }
}

fn flag_rule(
    key: &'static str,
    weight: f64,
    reason: &'static str,
) -> IndicatorRule {
    IndicatorRule::new(key, weight, move |_event, context: &SubjectContext| {
        Ok(context.flag(key))
    })
    .with_reason(reason)
}

/// The appointment-cancellation event type: who is urgent enough, ready
/// enough, and compatible enough to take over the freed slot.
pub(crate) fn appointment_cancelled_definition() -> EventTypeDefinition {
    EventTypeDefinition::new("appointment_cancelled")
        .requires_metadata("appointment_time")
        .requires_metadata("provider_id")
        .rule(flag_rule(
            "higher_urgency",
            0.4,
            "a waiting client has a higher clinical urgency than the cancelled one",
        ))
        .rule(flag_rule(
            "documents_ready",
            0.2,
            "the waiting client's referral documents are complete",
        ))
        .rule(flag_rule(
            "transport_compatible",
            0.2,
            "existing transport arrangements cover the new slot",
        ))
        .rule(flag_rule(
            "no_schedule_conflict",
            0.2,
            "the waiting client has no conflicting appointment",
        ))
        .impact_calculator(Arc::new(BumpAppointmentImpact))
        .plan_template(Arc::new(BumpAppointmentPlan))
}

/// Context provider seeded with one waiting client who satisfies every
/// indicator, for the demo and for local exploration.
pub(crate) fn demo_context() -> Arc<InMemoryContextProvider> {
    let provider = Arc::new(InMemoryContextProvider::default());
    for key in [
        "higher_urgency",
        "documents_ready",
        "transport_compatible",
        "no_schedule_conflict",
    ] {
        provider.set_attribute("client-1024", key, true);
    }
    provider
}

/// Build the engine with the demo event registry and logging adapters.
pub(crate) fn build_engine(settings: EngineSettings) -> Result<Arc<Engine>, ConfigurationError> {
    EngineBuilder::new(settings)
        .context_provider(demo_context())
        .adapter(PROVIDER_SCHEDULING, LoggingAdapter::new(PROVIDER_SCHEDULING))
        .adapter(TRANSPORTATION, LoggingAdapter::new(TRANSPORTATION))
        .adapter(NOTIFICATIONS, LoggingAdapter::new(NOTIFICATIONS))
        .adapter(PROVIDER_API, LoggingAdapter::new(PROVIDER_API))
        .adapter(CASE_MANAGEMENT, LoggingAdapter::new(CASE_MANAGEMENT))
        .event_type(appointment_cancelled_definition())
        .build()
}

/// Canned cancellation event naming the seeded waiting client.
pub(crate) fn demo_submission() -> EventSubmission {
    let mut subject_ids = BTreeMap::new();
    subject_ids.insert("cancelling_client".to_string(), "client-0007".to_string());
    subject_ids.insert("waiting_client".to_string(), "client-1024".to_string());

    let mut metadata = BTreeMap::new();
    metadata.insert(
        "appointment_time".to_string(),
        Value::String((Utc::now() + Duration::days(2)).to_rfc3339()),
    );
    metadata.insert(
        "provider_id".to_string(),
        Value::String("provider-314".to_string()),
    );
    metadata.insert(
        "replacement_client_id".to_string(),
        Value::String("client-1024".to_string()),
    );

    EventSubmission {
        event_type: "appointment_cancelled".to_string(),
        subject_ids,
        occurred_at: Utc::now(),
        metadata,
    }
}
