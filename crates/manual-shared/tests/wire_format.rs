//! Wire-format tests for the shared protocol types.

use chrono::{Duration, TimeZone, Utc};
use manual_shared::{
    tier_duration, AnswerPayload, QaError, RestrictionState, Source, Step, StreamEvent,
    ViolationType,
};
use serde_json::Value;

fn parse(event: &StreamEvent) -> Value {
    let line = event.to_line();
    assert!(line.ends_with('\n'));
    assert_eq!(line.matches('\n').count(), 1, "one event per line");
    serde_json::from_str(line.trim_end()).unwrap()
}

#[test]
fn test_step_event_shape() {
    let value = parse(&StreamEvent::step_timeout(Step::TextCache));
    assert_eq!(value["event"], "step_timeout");
    assert_eq!(value["step"], 2);
    assert!(value.get("answer").is_none());
    assert!(value.get("code").is_none());
}

#[test]
fn test_answer_event_shape() {
    let value = parse(&StreamEvent::answer(AnswerPayload {
        answer: "Descale monthly.\nUse citric acid.".into(),
        source: Source::GeneralKnowledge,
        reference: None,
        session_id: "s-1".into(),
        self_check_score: Some(0.5),
        needs_verification: true,
        used_general_knowledge: true,
    }));
    assert_eq!(value["event"], "answer");
    assert_eq!(value["source"], "general_knowledge");
    assert_eq!(value["needs_verification"], true);
    assert_eq!(value["used_general_knowledge"], true);
    assert!(value.get("reference").is_none());
    assert!(value.get("step").is_none());
}

#[test]
fn test_error_event_hides_internal_cause() {
    let err = QaError::Storage("database is locked at /var/lib/x.db".into());
    let value = parse(&StreamEvent::error(&err, None));
    assert_eq!(value["event"], "error");
    assert_eq!(value["code"], "INTERNAL_ERROR");
    assert!(!value["error"].as_str().unwrap().contains("/var/lib"));
}

#[test]
fn test_blocked_body_carries_expiry() {
    let until = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
    let body = QaError::Blocked {
        restricted_until: until,
        remaining_secs: 3 * 3600 + 12 * 60,
        violation_count: 3,
    }
    .to_body();
    assert_eq!(body.code, "QA_BLOCKED");
    assert_eq!(body.restricted_until, Some(until));
    assert_eq!(body.violation_count, Some(3));
    assert!(body.message.contains("3h 12m"));

    let value = serde_json::to_value(&body).unwrap();
    assert!(value.get("violation_type").is_none());
}

#[test]
fn test_invalid_question_body() {
    let body = QaError::InvalidQuestion {
        violation_type: Some(ViolationType::Adversarial),
        reason: "Questions must be about the product.".into(),
    }
    .to_body();
    let value = serde_json::to_value(&body).unwrap();
    assert_eq!(value["code"], "INVALID_QUESTION");
    assert_eq!(value["violation_type"], "adversarial");
}

#[test]
fn test_tiers_never_shrink() {
    let mut previous = Duration::zero();
    for count in 0..10 {
        let tier = tier_duration(count);
        assert!(tier >= previous, "tier {} shrank", count);
        previous = tier;
    }
    assert_eq!(tier_duration(1), Duration::zero());
    assert_eq!(tier_duration(4), Duration::days(7));
    assert_eq!(tier_duration(9), Duration::days(7));
}

#[test]
fn test_restriction_status_expires() {
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    let state = RestrictionState {
        user_id: "u1".into(),
        violation_count: 2,
        restricted_until: Some(now + Duration::hours(1)),
    };

    let blocked = state.status_at(now);
    assert!(blocked.blocked);
    assert_eq!(blocked.remaining_secs, Some(3600));

    let later = state.status_at(now + Duration::hours(1));
    assert!(!later.blocked);
    assert_eq!(later.restricted_until, None);
    assert_eq!(later.violation_count, Some(2));
}
