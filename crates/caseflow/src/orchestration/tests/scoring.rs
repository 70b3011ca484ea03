use super::common::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use crate::orchestration::engine::{EngineBuilder, SubmitError};
use crate::orchestration::events::{Event, EventId, ValidationError};
use crate::orchestration::scoring::{
    IndicatorRule, IndicatorSet, PredicateError, ScoringEngine, SubjectContext,
};
use crate::orchestration::ConfigurationError;

fn sample_event(event_type: &str) -> Event {
    let mut subject_ids = BTreeMap::new();
    subject_ids.insert("client".to_string(), "c1".to_string());
    Event {
        id: EventId("evt-000001".to_string()),
        event_type: event_type.to_string(),
        subject_ids,
        occurred_at: Utc::now(),
        metadata: BTreeMap::new(),
        received_at: Utc::now(),
    }
}

fn engine_for(rules: Vec<IndicatorRule>) -> ScoringEngine {
    let mut sets = BTreeMap::new();
    sets.insert(
        "appointment_cancelled".to_string(),
        IndicatorSet::new("appointment_cancelled", rules).expect("valid rule set"),
    );
    ScoringEngine::new(sets)
}

#[test]
fn no_matching_indicator_scores_zero() {
    let scoring = engine_for(slot_rules());
    let result = scoring.score(
        &sample_event("appointment_cancelled"),
        &SubjectContext::new(),
    );
    assert_eq!(result.confidence, 0.0);
    assert!(result.matched_indicators.is_empty());
}

#[test]
fn full_match_scores_one() {
    let scoring = engine_for(slot_rules());
    let result = scoring.score(
        &sample_event("appointment_cancelled"),
        &matching_context(),
    );
    assert_eq!(result.confidence, 1.0);
    assert_eq!(
        result.matched_indicators,
        vec!["overlap_slot".to_string(), "same_route".to_string()]
    );
}

#[test]
fn adding_a_matching_indicator_never_decreases_confidence() {
    let scoring = engine_for(slot_rules());
    let event = sample_event("appointment_cancelled");

    let partial = scoring.score(&event, &SubjectContext::new().with("overlap_slot", true));
    let full = scoring.score(&event, &matching_context());

    assert!(partial.confidence > 0.0);
    assert!(full.confidence >= partial.confidence);
}

#[test]
fn empty_rule_set_defines_confidence_as_zero() {
    let scoring = engine_for(Vec::new());
    let result = scoring.score(
        &sample_event("appointment_cancelled"),
        &matching_context(),
    );
    assert_eq!(result.confidence, 0.0);
}

#[test]
fn unconfigured_event_type_scores_zero() {
    let scoring = engine_for(slot_rules());
    let result = scoring.score(&sample_event("housing_available"), &matching_context());
    assert_eq!(result.confidence, 0.0);
}

#[test]
fn denominator_is_scoped_per_event_type() {
    let mut sets = BTreeMap::new();
    sets.insert(
        "appointment_cancelled".to_string(),
        IndicatorSet::new("appointment_cancelled", slot_rules()).expect("valid"),
    );
    sets.insert(
        "housing_available".to_string(),
        IndicatorSet::new(
            "housing_available",
            vec![IndicatorRule::new("waitlist_match", 2.0, |_, context| {
                Ok(context.flag("waitlist_match"))
            })],
        )
        .expect("valid"),
    );
    let scoring = ScoringEngine::new(sets);

    // The heavy housing rule must not dilute the cancellation score.
    let result = scoring.score(
        &sample_event("appointment_cancelled"),
        &SubjectContext::new().with("overlap_slot", true),
    );
    assert!((result.confidence - 0.6).abs() < 1e-9);
}

#[test]
fn failing_predicate_counts_as_non_match() {
    let rules = vec![
        IndicatorRule::new("broken", 0.5, |_, _| {
            Err(PredicateError("context attribute missing".to_string()))
        }),
        IndicatorRule::new("healthy", 0.5, |_, _| Ok(true)),
    ];
    let scoring = engine_for(rules);
    let result = scoring.score(
        &sample_event("appointment_cancelled"),
        &SubjectContext::new(),
    );
    assert_eq!(result.matched_indicators, vec!["healthy".to_string()]);
    assert!((result.confidence - 0.5).abs() < 1e-9);
}

#[test]
fn duplicate_indicator_keys_are_rejected_at_startup() {
    let result = IndicatorSet::new(
        "appointment_cancelled",
        vec![
            IndicatorRule::new("overlap_slot", 0.6, |_, _| Ok(true)),
            IndicatorRule::new("overlap_slot", 0.4, |_, _| Ok(true)),
        ],
    );
    match result {
        Err(ConfigurationError::DuplicateIndicator { key, .. }) => {
            assert_eq!(key, "overlap_slot");
        }
        other => panic!("expected duplicate indicator error, got {other:?}"),
    }
}

#[test]
fn non_positive_weight_is_rejected_at_startup() {
    let result = IndicatorSet::new(
        "appointment_cancelled",
        vec![IndicatorRule::new("overlap_slot", 0.0, |_, _| Ok(true))],
    );
    assert!(matches!(
        result,
        Err(ConfigurationError::NonPositiveWeight { .. })
    ));
}

#[test]
fn builder_rejects_out_of_range_threshold() {
    let result = EngineBuilder::new(fast_settings(1.5))
        .adapter(SCHEDULING, Arc::new(RecordingAdapter::default()))
        .adapter(NOTIFICATIONS, Arc::new(RecordingAdapter::default()))
        .event_type(cancellation_definition())
        .build();
    assert!(matches!(
        result,
        Err(ConfigurationError::InvalidThreshold(_))
    ));
}

#[test]
fn builder_rejects_unrepresentable_clock_skew() {
    let mut settings = fast_settings(0.7);
    settings.clock_skew_tolerance = Duration::from_secs(u64::MAX);
    let result = EngineBuilder::new(settings)
        .adapter(SCHEDULING, Arc::new(RecordingAdapter::default()))
        .adapter(NOTIFICATIONS, Arc::new(RecordingAdapter::default()))
        .event_type(cancellation_definition())
        .build();
    assert!(matches!(
        result,
        Err(ConfigurationError::ClockSkewOutOfRange(_))
    ));
}

#[test]
fn builder_rejects_template_with_unregistered_target() {
    let result = EngineBuilder::new(fast_settings(0.7))
        .adapter(SCHEDULING, Arc::new(RecordingAdapter::default()))
        .event_type(cancellation_definition())
        .build();
    assert!(matches!(
        result,
        Err(ConfigurationError::UnknownTargetSystem { .. })
    ));
}

#[tokio::test]
async fn sub_threshold_event_produces_no_recommendation() {
    let (engine, _, _) = engine(0.7);
    // Only same_route (0.4) matches: confidence 0.4 < 0.7.
    let weak = EngineBuilder::new(fast_settings(0.7))
        .context_provider(Arc::new(FixedContext(
            SubjectContext::new().with("same_route", true),
        )))
        .adapter(SCHEDULING, Arc::new(RecordingAdapter::default()))
        .adapter(NOTIFICATIONS, Arc::new(RecordingAdapter::default()))
        .event_type(cancellation_definition())
        .build()
        .expect("valid configuration");

    let outcome = weak.submit_event(submission()).expect("event accepted");
    assert!(outcome.recommendation.is_none());
    assert!(weak.list(None).expect("list works").is_empty());

    // The fully matching engine does create one, as a sanity check.
    let outcome = engine.submit_event(submission()).expect("event accepted");
    assert!(outcome.recommendation.is_some());
}

#[test]
fn intake_rejects_unknown_event_type() {
    let (engine, _, _) = engine(0.7);
    let mut unknown = submission();
    unknown.event_type = "meteor_strike".to_string();
    match engine.submit_event(unknown) {
        Err(SubmitError::Validation(ValidationError::UnknownEventType(name))) => {
            assert_eq!(name, "meteor_strike");
        }
        other => panic!("expected unknown event type error, got {other:?}"),
    }
}

#[test]
fn intake_rejects_empty_subjects() {
    let (engine, _, _) = engine(0.7);
    let mut missing = submission();
    missing.subject_ids.clear();
    assert!(matches!(
        engine.submit_event(missing),
        Err(SubmitError::Validation(ValidationError::MissingSubjects))
    ));
}

#[test]
fn intake_rejects_far_future_timestamps() {
    let (engine, _, _) = engine(0.7);
    let mut future = submission();
    future.occurred_at = Utc::now() + ChronoDuration::hours(2);
    assert!(matches!(
        engine.submit_event(future),
        Err(SubmitError::Validation(ValidationError::FutureTimestamp { .. }))
    ));
}

#[test]
fn intake_rejects_missing_required_metadata() {
    let (engine, _, _) = engine(0.7);
    let mut incomplete = submission();
    incomplete.metadata.remove("appointment_time");
    match engine.submit_event(incomplete) {
        Err(SubmitError::Validation(ValidationError::MissingMetadata { key, .. })) => {
            assert_eq!(key, "appointment_time");
        }
        other => panic!("expected missing metadata error, got {other:?}"),
    }
}

#[test]
fn reasoning_uses_the_fixed_indicator_templates() {
    let (engine, _, _) = engine(0.7);
    let outcome = engine.submit_event(submission()).expect("event accepted");
    let recommendation = outcome.recommendation.expect("above threshold");

    assert_eq!(recommendation.confidence, 1.0);
    assert_eq!(
        recommendation.reasoning,
        vec![
            "another client can take the freed appointment slot".to_string(),
            "replacement client lives on the existing transport route".to_string(),
        ]
    );
    assert_eq!(recommendation.action_plan.len(), 2);
    assert_eq!(recommendation.estimated_impact.monetary_savings_cents, 12_000);
}
