//! Total normalization of untrusted records. Nothing here can fail: malformed
//! input degrades into type-correct defaults.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde_json::{Map, Value};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::coerce_timestamp;
use crate::model::{
    Archive, Feedback, FeedbackMetrics, Message, Metric, Profile, Rate, SkillSample, Task,
};
use crate::profile::rate_score;

pub const PLACEHOLDER_TOPIC: &str = "Untitled session";
pub const PLACEHOLDER_TEXT: &str = "No analysis available.";

const REQUIRED_FEEDBACK_FIELDS: [&str; 8] = [
    "score",
    "summary",
    "strengths",
    "weaknesses",
    "advice",
    "metrics",
    "detailedReview",
    "skillSamples",
];

/// Normalizes an arbitrary value purporting to be an archive.
#[must_use]
pub fn sanitize_archive(value: &Value, now: OffsetDateTime) -> Archive {
    let empty = Map::new();
    let object = value.as_object().unwrap_or(&empty);

    let date = object.get("date").and_then(coerce_timestamp);
    let last_modified = object.get("lastModified").and_then(coerce_timestamp);
    let date = date.or(last_modified).unwrap_or(now);
    let last_modified = last_modified.unwrap_or(date);

    Archive {
        id: identifier(object.get("id")).unwrap_or_else(|| generate_archive_id(now)),
        date,
        last_modified,
        topic: non_blank(object.get("topic")).unwrap_or_else(|| PLACEHOLDER_TOPIC.to_string()),
        messages: sanitize_messages(object.get("messages")),
        feedback: sanitize_feedback(object.get("feedback")),
        settings_snapshot: object
            .get("settingsSnapshot")
            .filter(|value| !value.is_null())
            .cloned(),
    }
}

/// Normalizes a persisted weakness profile, recomputing every derived field
/// from the stored numerator/denominator pair.
#[must_use]
pub fn sanitize_profile(value: Option<&Value>, now: OffsetDateTime) -> Profile {
    let Some(object) = value.and_then(Value::as_object) else {
        return Profile::empty(now);
    };

    let last_updated = object
        .get("lastUpdated")
        .and_then(coerce_timestamp)
        .unwrap_or(now);

    let mut metrics = BTreeMap::new();
    if let Some(entries) = object.get("metrics").and_then(Value::as_object) {
        for (map_key, entry) in entries {
            let Some(entry) = entry.as_object() else {
                continue;
            };
            let key = non_blank(entry.get("key")).unwrap_or_else(|| map_key.clone());
            let rate = sanitize_rate(entry.get("rate"));
            metrics.insert(
                key.clone(),
                Metric {
                    label: non_blank(entry.get("label")).unwrap_or_else(|| key.clone()),
                    key,
                    rate,
                    score: rate_score(rate.numerator, rate.denominator),
                    sample_size: rate.denominator,
                    last_updated: entry
                        .get("lastUpdated")
                        .and_then(coerce_timestamp)
                        .unwrap_or(last_updated),
                },
            );
        }
    }

    Profile {
        last_updated,
        metrics,
    }
}

/// Normalizes a homework task; entries without a usable id are dropped.
#[must_use]
pub fn sanitize_task(value: &Value) -> Option<Task> {
    let object = value.as_object()?;
    let id = identifier(object.get("id"))?;
    let status = non_blank(object.get("status")).unwrap_or_else(|| "pending".to_string());

    let mut extra = object.clone();
    extra.remove("id");
    extra.remove("status");

    Some(Task { id, status, extra })
}

pub(crate) fn generate_archive_id(now: OffsetDateTime) -> String {
    Ulid::from_datetime(SystemTime::from(now)).to_string()
}

pub(crate) fn generate_pseudo_user_id(now: OffsetDateTime) -> String {
    format!(
        "anon-{}",
        Ulid::from_datetime(SystemTime::from(now))
            .to_string()
            .to_lowercase()
    )
}

fn sanitize_messages(value: Option<&Value>) -> Vec<Message> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(Value::as_object)
        .map(|object| {
            let mut extra = object.clone();
            extra.remove("role");
            extra.remove("content");
            Message {
                role: text(object.get("role")).unwrap_or_default(),
                content: text(object.get("content")).unwrap_or_default(),
                extra,
            }
        })
        .collect()
}

fn sanitize_feedback(value: Option<&Value>) -> Feedback {
    let empty = Map::new();
    let object = value.and_then(Value::as_object).unwrap_or(&empty);

    let analysis = object
        .iter()
        .filter(|(key, entry)| {
            !REQUIRED_FEEDBACK_FIELDS.contains(&key.as_str()) && !entry.is_null()
        })
        .map(|(key, entry)| (key.clone(), entry.clone()))
        .collect();

    Feedback {
        score: finite(object.get("score")).unwrap_or(0.0),
        summary: non_blank(object.get("summary")).unwrap_or_else(|| PLACEHOLDER_TEXT.to_string()),
        strengths: string_list(object.get("strengths")),
        weaknesses: string_list(object.get("weaknesses")),
        advice: non_blank(object.get("advice")).unwrap_or_else(|| PLACEHOLDER_TEXT.to_string()),
        metrics: sanitize_metrics(object.get("metrics")),
        detailed_review: object
            .get("detailedReview")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        skill_samples: sanitize_samples(object.get("skillSamples")),
        analysis,
    }
}

fn sanitize_metrics(value: Option<&Value>) -> FeedbackMetrics {
    let mut metrics = FeedbackMetrics::default();
    let Some(object) = value.and_then(Value::as_object) else {
        return metrics;
    };

    for name in FeedbackMetrics::FIELDS {
        if let (Some(slot), Some(number)) = (metrics.field_mut(name), finite(object.get(name))) {
            *slot = number;
        }
    }

    metrics
}

fn sanitize_samples(value: Option<&Value>) -> Vec<SkillSample> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let object = item.as_object()?;
            Some(SkillSample {
                key: non_blank(object.get("key"))?,
                label: non_blank(object.get("label")),
                rate: sanitize_rate(object.get("rate")),
            })
        })
        .collect()
}

fn sanitize_rate(value: Option<&Value>) -> Rate {
    let empty = Map::new();
    let object = value.and_then(Value::as_object).unwrap_or(&empty);
    let denominator = object.get("denominator").and_then(count).unwrap_or(0);
    let numerator = object
        .get("numerator")
        .and_then(count)
        .unwrap_or(0)
        .min(denominator);
    Rate {
        numerator,
        denominator,
    }
}

/// Non-negative integers, including integral floats such as `2.0`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::float_cmp
)]
fn count(value: &Value) -> Option<u64> {
    if let Some(whole) = value.as_u64() {
        return Some(whole);
    }
    value
        .as_f64()
        .filter(|float| float.is_finite() && *float >= 0.0 && float.fract() == 0.0)
        .filter(|float| *float <= u64::MAX as f64)
        .map(|float| float as u64)
}

fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(ToString::to_string)
}

fn non_blank(value: Option<&Value>) -> Option<String> {
    text(value).filter(|raw| !raw.trim().is_empty())
}

/// Ids arrive as strings, or as epoch-millisecond numbers in legacy exports.
fn identifier(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Number(number) => Some(number.to_string()),
        other => non_blank(Some(other)),
    }
}

fn finite(value: Option<&Value>) -> Option<f64> {
    value
        .and_then(Value::as_f64)
        .filter(|number| number.is_finite())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use crate::parse_rfc3339_utc;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_now() -> OffsetDateTime {
        must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"))
    }

    #[test]
    fn integral_float_rates_are_counted() {
        let profile = sanitize_profile(
            Some(&json!({
                "lastUpdated": "2026-01-01T00:00:00Z",
                "metrics": {
                    "logic": {"rate": {"numerator": 2.0, "denominator": 4.0}},
                    "evidence": {"rate": {"numerator": 1.5, "denominator": 4}},
                    "framing": {"rate": {"numerator": 1, "denominator": -1.0}}
                }
            })),
            fixture_now(),
        );

        let logic = &profile.metrics["logic"];
        assert_eq!((logic.rate.numerator, logic.rate.denominator), (2, 4));
        assert_eq!(logic.score, 50);
        assert_eq!(profile.metrics["evidence"].rate.numerator, 0);
        assert_eq!(profile.metrics["evidence"].rate.denominator, 4);
        assert_eq!(profile.metrics["framing"].rate.denominator, 0);
        assert_eq!(profile.metrics["framing"].rate.numerator, 0);
    }

    #[test]
    fn empty_feedback_is_fully_defaulted() {
        let archive = sanitize_archive(
            &json!({"id": "a1", "topic": "t", "messages": [], "feedback": {}}),
            fixture_now(),
        );

        assert_eq!(archive.id, "a1");
        assert_eq!(archive.topic, "t");
        assert_eq!(archive.feedback.score, 0.0);
        assert!(archive.feedback.strengths.is_empty());
        assert!(archive.feedback.weaknesses.is_empty());
        assert!(archive.feedback.detailed_review.is_empty());
        assert_eq!(archive.feedback.summary, PLACEHOLDER_TEXT);
        assert_eq!(archive.feedback.advice, PLACEHOLDER_TEXT);
        assert_eq!(archive.feedback.metrics, FeedbackMetrics::default());

        let metrics = must_ok(serde_json::to_value(archive.feedback.metrics));
        let fields = match metrics.as_object() {
            Some(value) => value,
            None => panic!("metrics did not serialize to an object"),
        };
        assert_eq!(fields.len(), 8);
        assert!(fields.values().all(|value| value.as_f64() == Some(0.0)));
    }

    #[test]
    fn non_object_input_still_yields_a_complete_archive() {
        for input in [json!(null), json!(42), json!("archive"), json!([1, 2])] {
            let archive = sanitize_archive(&input, fixture_now());
            assert!(!archive.id.is_empty());
            assert_eq!(archive.topic, PLACEHOLDER_TOPIC);
            assert!(archive.messages.is_empty());
            assert_eq!(archive.date, fixture_now());
            assert_eq!(archive.last_modified, fixture_now());
        }
    }

    #[test]
    fn last_modified_defaults_to_date_and_vice_versa() {
        let only_date = sanitize_archive(
            &json!({"id": "a", "date": "2026-01-01T00:00:00Z"}),
            fixture_now(),
        );
        assert_eq!(only_date.last_modified, only_date.date);
        assert_ne!(only_date.date, fixture_now());

        let only_modified = sanitize_archive(
            &json!({"id": "b", "lastModified": 1_770_465_600_000_i64}),
            fixture_now(),
        );
        assert_eq!(only_modified.date, only_modified.last_modified);
    }

    #[test]
    fn analysis_sub_objects_pass_through_and_absent_ones_stay_absent() {
        let archive = sanitize_archive(
            &json!({
                "id": "a",
                "feedback": {
                    "score": 81,
                    "logic": {"fallacies": ["strawman"]},
                    "story": null
                }
            }),
            fixture_now(),
        );

        assert_eq!(archive.feedback.score, 81.0);
        assert_eq!(
            archive.feedback.analysis.get("logic"),
            Some(&json!({"fallacies": ["strawman"]}))
        );
        assert!(!archive.feedback.analysis.contains_key("story"));
        assert!(!archive.feedback.analysis.contains_key("rhetoric"));
    }

    #[test]
    fn malformed_fields_are_replaced_not_rejected() {
        let archive = sanitize_archive(
            &json!({
                "id": 1_700_000_000_000_i64,
                "topic": "   ",
                "messages": "nope",
                "feedback": {
                    "score": "high",
                    "strengths": ["clear", 3, null],
                    "metrics": {"logic": 7.5, "rebuttal": "x"},
                    "skillSamples": [
                        {"key": "logic", "rate": {"numerator": 5, "denominator": 2}},
                        {"rate": {"numerator": 1, "denominator": 1}}
                    ]
                }
            }),
            fixture_now(),
        );

        assert_eq!(archive.id, "1700000000000");
        assert_eq!(archive.topic, PLACEHOLDER_TOPIC);
        assert!(archive.messages.is_empty());
        assert_eq!(archive.feedback.score, 0.0);
        assert_eq!(archive.feedback.strengths, vec!["clear".to_string()]);
        assert_eq!(archive.feedback.metrics.logic, 7.5);
        assert_eq!(archive.feedback.metrics.rebuttal, 0.0);
        assert_eq!(archive.feedback.skill_samples.len(), 1);
        assert_eq!(
            archive.feedback.skill_samples[0].rate,
            Rate {
                numerator: 2,
                denominator: 2
            }
        );
    }

    #[test]
    fn messages_keep_objects_and_extra_fields() {
        let archive = sanitize_archive(
            &json!({
                "id": "a",
                "messages": [
                    {"role": "user", "content": "hi", "timestamp": 5},
                    "stray",
                    {"content": "no role"}
                ]
            }),
            fixture_now(),
        );

        assert_eq!(archive.messages.len(), 2);
        assert_eq!(archive.messages[0].extra.get("timestamp"), Some(&json!(5)));
        assert_eq!(archive.messages[1].role, "");
    }

    #[test]
    fn profile_derived_fields_are_recomputed() {
        let profile = sanitize_profile(
            Some(&json!({
                "lastUpdated": "2026-01-01T00:00:00Z",
                "metrics": {
                    "logic": {
                        "label": "Logic",
                        "rate": {"numerator": 1, "denominator": 4},
                        "score": 99,
                        "sampleSize": 1
                    },
                    "broken": 7
                }
            })),
            fixture_now(),
        );

        assert_eq!(profile.metrics.len(), 1);
        let metric = &profile.metrics["logic"];
        assert_eq!(metric.score, 25);
        assert_eq!(metric.sample_size, 4);
        assert_eq!(metric.label, "Logic");
    }

    #[test]
    fn tasks_without_ids_are_dropped() {
        assert!(sanitize_task(&json!({"status": "done"})).is_none());
        let task = sanitize_task(&json!({"id": "t1", "title": "Read"}));
        let task = match task {
            Some(value) => value,
            None => panic!("expected task"),
        };
        assert_eq!(task.status, "pending");
        assert_eq!(task.extra.get("title"), Some(&json!("Read")));
    }
}
