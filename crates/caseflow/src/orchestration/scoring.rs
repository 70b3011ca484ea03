use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use super::events::{Event, EventId};
use super::ConfigurationError;

/// Ancillary subject data a predicate may consult alongside the event.
/// Kept as a flat attribute bag so predicates stay pure functions of their
/// two inputs.
#[derive(Debug, Clone, Default)]
pub struct SubjectContext {
    attributes: BTreeMap<String, Value>,
}

impl SubjectContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.attributes
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(Value::as_f64)
    }
}

/// Supplies the subject context for an event before scoring. Injected into
/// the engine so deployments can back it with whatever case data they hold.
pub trait ContextProvider: Send + Sync {
    fn context_for(&self, event: &Event) -> SubjectContext;
}

/// Context provider backed by per-subject attribute maps. The context for an
/// event is the union of the attributes of every subject it names.
#[derive(Default)]
pub struct InMemoryContextProvider {
    subjects: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryContextProvider {
    pub fn set_attribute(
        &self,
        subject_id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) {
        let mut guard = self.subjects.write().expect("context lock poisoned");
        guard
            .entry(subject_id.into())
            .or_default()
            .insert(key.into(), value.into());
    }
}

impl ContextProvider for InMemoryContextProvider {
    fn context_for(&self, event: &Event) -> SubjectContext {
        let guard = self.subjects.read().expect("context lock poisoned");
        let mut context = SubjectContext::new();
        for subject_id in event.subject_ids.values() {
            if let Some(attributes) = guard.get(subject_id) {
                for (key, value) in attributes {
                    context.insert(key.clone(), value.clone());
                }
            }
        }
        context
    }
}

/// Failure raised by a single indicator predicate. Swallowed and logged by
/// the scoring engine; treated as a non-match.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PredicateError(pub String);

type Predicate = Arc<dyn Fn(&Event, &SubjectContext) -> Result<bool, PredicateError> + Send + Sync>;

/// A named, weighted boolean rule evaluated against an event and its subject
/// context. Rules are configuration, registered per event type at startup
/// and read-only per evaluation.
#[derive(Clone)]
pub struct IndicatorRule {
    pub key: String,
    pub weight: f64,
    pub tag: Option<String>,
    /// Fixed human-readable line emitted into a recommendation's reasoning
    /// when this indicator matches.
    pub reason: String,
    predicate: Predicate,
}

impl IndicatorRule {
    pub fn new<F>(key: impl Into<String>, weight: f64, predicate: F) -> Self
    where
        F: Fn(&Event, &SubjectContext) -> Result<bool, PredicateError> + Send + Sync + 'static,
    {
        let key = key.into();
        Self {
            reason: format!("matched indicator '{key}'"),
            key,
            weight,
            tag: None,
            predicate: Arc::new(predicate),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    fn evaluate(&self, event: &Event, context: &SubjectContext) -> Result<bool, PredicateError> {
        (self.predicate)(event, context)
    }
}

impl std::fmt::Debug for IndicatorRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorRule")
            .field("key", &self.key)
            .field("weight", &self.weight)
            .field("tag", &self.tag)
            .finish()
    }
}

/// The active rule set for one event type. Duplicate keys and non-positive
/// weights are rejected at construction, not at scoring time.
#[derive(Debug)]
pub struct IndicatorSet {
    rules: Vec<IndicatorRule>,
    total_weight: f64,
}

impl IndicatorSet {
    pub fn new(event_type: &str, rules: Vec<IndicatorRule>) -> Result<Self, ConfigurationError> {
        let mut seen = BTreeMap::new();
        for rule in &rules {
            if !(rule.weight.is_finite() && rule.weight > 0.0) {
                return Err(ConfigurationError::NonPositiveWeight {
                    event_type: event_type.to_string(),
                    key: rule.key.clone(),
                    weight: rule.weight,
                });
            }
            if seen.insert(rule.key.clone(), ()).is_some() {
                return Err(ConfigurationError::DuplicateIndicator {
                    event_type: event_type.to_string(),
                    key: rule.key.clone(),
                });
            }
        }
        let total_weight = rules.iter().map(|rule| rule.weight).sum();
        Ok(Self {
            rules,
            total_weight,
        })
    }

    pub fn rules(&self) -> &[IndicatorRule] {
        &self.rules
    }
}

/// Normalized [0, 1] scoring outcome for one event. Not persisted on its
/// own; embedded in the recommendation when one is created.
#[derive(Debug, Clone, Serialize)]
pub struct ScoringResult {
    pub event_id: EventId,
    pub matched_indicators: Vec<String>,
    pub confidence: f64,
}

/// Deterministic evaluator over the per-event-type indicator sets. Same
/// event and context always produce the same result; no model calls, no
/// randomness.
pub struct ScoringEngine {
    sets: BTreeMap<String, IndicatorSet>,
}

impl ScoringEngine {
    pub(crate) fn new(sets: BTreeMap<String, IndicatorSet>) -> Self {
        Self { sets }
    }

    /// Confidence is the weight-sum of matched indicators over the weight-sum
    /// of the event type's whole rule set, clamped to [0, 1]. An empty or
    /// missing set yields 0 rather than a division by zero. A predicate
    /// failure is logged and treated as a non-match; it never aborts the
    /// evaluation of the remaining rules.
    pub fn score(&self, event: &Event, context: &SubjectContext) -> ScoringResult {
        let Some(set) = self.sets.get(&event.event_type) else {
            return ScoringResult {
                event_id: event.id.clone(),
                matched_indicators: Vec::new(),
                confidence: 0.0,
            };
        };

        let mut matched = Vec::new();
        let mut matched_weight = 0.0;
        for rule in &set.rules {
            match rule.evaluate(event, context) {
                Ok(true) => {
                    matched.push(rule.key.clone());
                    matched_weight += rule.weight;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        event_id = %event.id,
                        indicator = %rule.key,
                        error = %err,
                        "indicator predicate failed; treating as non-match"
                    );
                }
            }
        }

        let confidence = if set.total_weight > 0.0 {
            (matched_weight / set.total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        ScoringResult {
            event_id: event.id.clone(),
            matched_indicators: matched,
            confidence,
        }
    }
}
