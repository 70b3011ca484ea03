use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use super::events::Event;
use super::recommendation::{
    ActionStep, EstimatedImpact, Recommendation, RecommendationId, RecommendationStatus,
    StepStatus,
};
use super::scoring::ScoringResult;

/// Computes the estimated impact of acting on an event. One calculator per
/// event type, injected at startup so new event types are additive.
pub trait ImpactCalculator: Send + Sync {
    fn estimate(&self, event: &Event, scoring: &ScoringResult) -> EstimatedImpact;
}

/// A step as a plan template emits it, before the builder numbers it.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub target_system: String,
    pub payload: Value,
}

/// Enumerates the concrete downstream steps for an event. One template per
/// event type, registered at startup alongside the calculator.
pub trait PlanTemplate: Send + Sync {
    /// Every target system this template can emit; checked against the
    /// registered adapters during startup validation.
    fn target_systems(&self) -> Vec<String>;

    fn plan(&self, event: &Event) -> Vec<PlannedStep>;
}

/// Raised when a registration gap surfaces while building. With a validated
/// registry these indicate a template misbehaving at runtime, not caller
/// error.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no impact calculator registered for event type '{0}'")]
    MissingCalculator(String),
    #[error("no action-plan template registered for event type '{0}'")]
    MissingTemplate(String),
    #[error("plan template for event type '{0}' produced no steps")]
    EmptyPlan(String),
}

/// Turns an above-threshold scoring result into a reviewable recommendation.
/// Sub-threshold results are a defined "no recommendation" outcome, never
/// stored anywhere.
pub struct RecommendationBuilder {
    threshold: f64,
    calculators: BTreeMap<String, Arc<dyn ImpactCalculator>>,
    templates: BTreeMap<String, Arc<dyn PlanTemplate>>,
    /// Indicator key mapped to its fixed reasoning line.
    reasons: BTreeMap<String, String>,
    sequence: AtomicU64,
}

impl RecommendationBuilder {
    pub(crate) fn new(
        threshold: f64,
        calculators: BTreeMap<String, Arc<dyn ImpactCalculator>>,
        templates: BTreeMap<String, Arc<dyn PlanTemplate>>,
        reasons: BTreeMap<String, String>,
    ) -> Self {
        Self {
            threshold,
            calculators,
            templates,
            reasons,
            sequence: AtomicU64::new(1),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Returns `Ok(None)` when confidence sits below the threshold.
    pub fn build(
        &self,
        scoring: &ScoringResult,
        event: &Event,
    ) -> Result<Option<Recommendation>, BuildError> {
        if scoring.confidence < self.threshold {
            debug!(
                event_id = %event.id,
                confidence = scoring.confidence,
                threshold = self.threshold,
                "confidence below threshold; no recommendation"
            );
            return Ok(None);
        }

        let calculator = self
            .calculators
            .get(&event.event_type)
            .ok_or_else(|| BuildError::MissingCalculator(event.event_type.clone()))?;
        let template = self
            .templates
            .get(&event.event_type)
            .ok_or_else(|| BuildError::MissingTemplate(event.event_type.clone()))?;

        let planned = template.plan(event);
        if planned.is_empty() {
            return Err(BuildError::EmptyPlan(event.event_type.clone()));
        }

        let action_plan = planned
            .into_iter()
            .enumerate()
            .map(|(index, step)| ActionStep {
                sequence_no: index as u32 + 1,
                target_system: step.target_system,
                payload: step.payload,
                status: StepStatus::Pending,
                last_error: None,
                attempt_count: 0,
            })
            .collect();

        let reasoning = scoring
            .matched_indicators
            .iter()
            .map(|key| {
                self.reasons
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| format!("matched indicator '{key}'"))
            })
            .collect();

        let recommendation = Recommendation {
            id: self.next_recommendation_id(),
            source_event_id: event.id.clone(),
            summary: summarize(event, scoring),
            reasoning,
            confidence: scoring.confidence,
            estimated_impact: calculator.estimate(event, scoring),
            action_plan,
            status: RecommendationStatus::PendingApproval,
            created_at: Utc::now(),
            decided_at: None,
            decided_by: None,
            completed_at: None,
        };

        Ok(Some(recommendation))
    }

    fn next_recommendation_id(&self) -> RecommendationId {
        let id = self.sequence.fetch_add(1, Ordering::Relaxed);
        RecommendationId(format!("rec-{id:06}"))
    }
}

fn summarize(event: &Event, scoring: &ScoringResult) -> String {
    let subjects = event
        .subject_ids
        .iter()
        .map(|(role, id)| format!("{role} {id}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Coordination opportunity from '{}' affecting {} (confidence {:.0}%)",
        event.event_type,
        subjects,
        scoring.confidence * 100.0
    )
}
