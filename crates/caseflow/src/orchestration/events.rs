use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque, process-unique event identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied event payload, before validation and id assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSubmission {
    pub event_type: String,
    /// Role (e.g. "client", "provider") mapped to the subject's identifier.
    pub subject_ids: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// A validated, recorded domain event. Immutable once created; the event log
/// never mutates or deletes entries, so events remain available for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: String,
    pub subject_ids: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, Value>,
    pub received_at: DateTime<Utc>,
}

impl Event {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Malformed input, the caller's fault. Maps to a 400 at the HTTP surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),
    #[error("subject_ids must contain at least one identifier")]
    MissingSubjects,
    #[error("occurred_at {occurred_at} is further in the future than the {tolerance_secs}s clock-skew tolerance")]
    FutureTimestamp {
        occurred_at: DateTime<Utc>,
        tolerance_secs: i64,
    },
    #[error("event type '{event_type}' requires metadata key '{key}'")]
    MissingMetadata { event_type: String, key: String },
}

/// Append-only record of every accepted event.
#[derive(Default)]
pub struct EventLog {
    events: RwLock<Vec<Event>>,
}

impl EventLog {
    pub fn get(&self, id: &EventId) -> Option<Event> {
        let guard = self.events.read().expect("event log lock poisoned");
        guard.iter().find(|event| &event.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.events.read().expect("event log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, event: Event) {
        let mut guard = self.events.write().expect("event log lock poisoned");
        guard.push(event);
    }
}

/// Validates submissions against the configured event types and records the
/// accepted ones. Intake never produces a recommendation itself; the engine
/// facade feeds accepted events onward to scoring.
pub struct EventIntake {
    /// Event type name mapped to the metadata keys it requires.
    known_types: BTreeMap<String, Vec<String>>,
    clock_skew_tolerance: Duration,
    log: Arc<EventLog>,
    sequence: AtomicU64,
}

impl EventIntake {
    pub(crate) fn new(
        known_types: BTreeMap<String, Vec<String>>,
        clock_skew_tolerance: Duration,
        log: Arc<EventLog>,
    ) -> Self {
        Self {
            known_types,
            clock_skew_tolerance,
            log,
            sequence: AtomicU64::new(1),
        }
    }

    pub fn submit(&self, submission: EventSubmission) -> Result<Event, ValidationError> {
        let required = self
            .known_types
            .get(&submission.event_type)
            .ok_or_else(|| ValidationError::UnknownEventType(submission.event_type.clone()))?;

        if submission.subject_ids.is_empty() {
            return Err(ValidationError::MissingSubjects);
        }

        let now = Utc::now();
        if submission.occurred_at > now + self.clock_skew_tolerance {
            return Err(ValidationError::FutureTimestamp {
                occurred_at: submission.occurred_at,
                tolerance_secs: self.clock_skew_tolerance.num_seconds(),
            });
        }

        for key in required {
            if !submission.metadata.contains_key(key) {
                return Err(ValidationError::MissingMetadata {
                    event_type: submission.event_type.clone(),
                    key: key.clone(),
                });
            }
        }

        let id = self.next_event_id();
        let event = Event {
            id,
            event_type: submission.event_type,
            subject_ids: submission.subject_ids,
            occurred_at: submission.occurred_at,
            metadata: submission.metadata,
            received_at: now,
        };
        self.log.append(event.clone());
        Ok(event)
    }

    fn next_event_id(&self) -> EventId {
        let id = self.sequence.fetch_add(1, Ordering::Relaxed);
        EventId(format!("evt-{id:06}"))
    }
}
