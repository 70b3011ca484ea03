use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::EventId;

/// Opaque recommendation identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecommendationId(pub String);

impl fmt::Display for RecommendationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-step execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn label(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// One step of an action plan: a target system and the payload it receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    pub sequence_no: u32,
    pub target_system: String,
    pub payload: Value,
    pub status: StepStatus,
    pub last_error: Option<String>,
    pub attempt_count: u32,
}

/// Recommendation lifecycle states. `Rejected`, `Completed`, and `Failed`
/// are terminal; no transition skips `PendingApproval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    PendingApproval,
    Approved,
    Executing,
    Completed,
    Failed,
    Rejected,
}

impl RecommendationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RecommendationStatus::PendingApproval => "pending_approval",
            RecommendationStatus::Approved => "approved",
            RecommendationStatus::Executing => "executing",
            RecommendationStatus::Completed => "completed",
            RecommendationStatus::Failed => "failed",
            RecommendationStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecommendationStatus::Rejected
                | RecommendationStatus::Completed
                | RecommendationStatus::Failed
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "pending_approval" => Some(Self::PendingApproval),
            "approved" => Some(Self::Approved),
            "executing" => Some(Self::Executing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for RecommendationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Estimated effect of executing the plan, produced by the per-event-type
/// impact calculator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimatedImpact {
    pub monetary_savings_cents: i64,
    pub time_saved_minutes: u32,
    pub notes: Vec<String>,
}

/// A reviewable coordination proposal. Created once by the builder and
/// mutated only through the lifecycle store's transition operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: RecommendationId,
    pub source_event_id: EventId,
    pub summary: String,
    /// Human-readable statements derived from the matched indicators.
    pub reasoning: Vec<String>,
    pub confidence: f64,
    pub estimated_impact: EstimatedImpact,
    pub action_plan: Vec<ActionStep>,
    pub status: RecommendationStatus,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Recommendation {
    pub fn view(&self) -> RecommendationView {
        RecommendationView {
            id: self.id.clone(),
            source_event_id: self.source_event_id.clone(),
            summary: self.summary.clone(),
            confidence: self.confidence,
            status: self.status.label(),
            steps_total: self.action_plan.len(),
            steps_succeeded: self
                .action_plan
                .iter()
                .filter(|step| step.status == StepStatus::Succeeded)
                .count(),
            created_at: self.created_at,
            decided_by: self.decided_by.clone(),
        }
    }
}

/// Sanitized summary exposed to dashboards; carries no execution internals
/// beyond step counts.
#[derive(Debug, Clone, Serialize)]
pub struct RecommendationView {
    pub id: RecommendationId,
    pub source_event_id: EventId,
    pub summary: String,
    pub confidence: f64,
    pub status: &'static str,
    pub steps_total: usize,
    pub steps_succeeded: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
}
