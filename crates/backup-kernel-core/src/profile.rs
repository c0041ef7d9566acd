use std::borrow::Cow;

use time::OffsetDateTime;

use crate::model::{Archive, Metric, Profile, Rate, SkillSample};

/// Percentage score for a rate, rounded half up. Zero denominators score 0.
#[must_use]
pub fn rate_score(numerator: u64, denominator: u64) -> u32 {
    if denominator == 0 {
        return 0;
    }

    let numerator = u128::from(numerator.min(denominator));
    let denominator = u128::from(denominator);
    let rounded = (numerator * 200 + denominator) / (denominator * 2);
    u32::try_from(rounded).unwrap_or(100)
}

/// Folds new samples into the running per-skill aggregates.
///
/// Only the `(numerator, denominator)` sufficient statistic is kept, so the
/// profile never needs per-session history. An empty sample list borrows
/// `current` back unchanged.
#[must_use]
pub fn update_profile<'a>(
    current: &'a Profile,
    samples: &[SkillSample],
    now: OffsetDateTime,
) -> Cow<'a, Profile> {
    if samples.is_empty() {
        return Cow::Borrowed(current);
    }

    let mut metrics = current.metrics.clone();
    for sample in samples {
        let folded = fold_sample(metrics.get(&sample.key), sample, now);
        metrics.insert(sample.key.clone(), folded);
    }

    Cow::Owned(Profile {
        last_updated: now,
        metrics,
    })
}

/// Recomputes a profile from scratch by folding every archive's samples in
/// chronological order.
#[must_use]
pub fn rebuild_profile(archives: &[Archive], now: OffsetDateTime) -> Profile {
    let mut ordered: Vec<&Archive> = archives.iter().collect();
    ordered.sort_by_key(|archive| archive.date);

    let mut profile = Profile::empty(now);
    for archive in ordered {
        if archive.feedback.skill_samples.is_empty() {
            continue;
        }
        profile = update_profile(&profile, &archive.feedback.skill_samples, now).into_owned();
    }
    profile.last_updated = now;
    profile
}

fn fold_sample(existing: Option<&Metric>, sample: &SkillSample, now: OffsetDateTime) -> Metric {
    let previous = existing.map(|metric| metric.rate).unwrap_or_default();
    let denominator = previous
        .denominator
        .saturating_add(sample.rate.denominator);
    let numerator = previous
        .numerator
        .saturating_add(sample.rate.numerator.min(sample.rate.denominator))
        .min(denominator);

    let label = sample
        .label
        .clone()
        .filter(|label| !label.trim().is_empty())
        .or_else(|| existing.map(|metric| metric.label.clone()))
        .unwrap_or_else(|| sample.key.clone());

    Metric {
        key: sample.key.clone(),
        label,
        rate: Rate {
            numerator,
            denominator,
        },
        score: rate_score(numerator, denominator),
        sample_size: denominator,
        last_updated: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_rfc3339_utc;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn sample(key: &str, numerator: u64, denominator: u64) -> SkillSample {
        SkillSample {
            key: key.to_string(),
            label: None,
            rate: Rate {
                numerator,
                denominator,
            },
        }
    }

    #[test]
    fn accumulates_rather_than_replaces() {
        let empty = Profile::empty(must_utc("2026-02-01T00:00:00Z"));
        let first = update_profile(
            &empty,
            &[sample("logic", 2, 3)],
            must_utc("2026-02-02T00:00:00Z"),
        )
        .into_owned();
        let second = update_profile(
            &first,
            &[sample("logic", 1, 3)],
            must_utc("2026-02-03T00:00:00Z"),
        )
        .into_owned();

        let metric = &second.metrics["logic"];
        assert_eq!(
            metric.rate,
            Rate {
                numerator: 3,
                denominator: 6
            }
        );
        assert_eq!(metric.score, 50);
        assert_eq!(metric.sample_size, 6);
        assert_eq!(metric.last_updated, must_utc("2026-02-03T00:00:00Z"));
        assert_eq!(second.last_updated, must_utc("2026-02-03T00:00:00Z"));
    }

    #[test]
    fn zero_denominator_scores_zero() {
        let empty = Profile::empty(must_utc("2026-02-01T00:00:00Z"));
        let updated = update_profile(
            &empty,
            &[sample("evidence", 0, 0)],
            must_utc("2026-02-02T00:00:00Z"),
        );

        let metric = &updated.metrics["evidence"];
        assert_eq!(metric.score, 0);
        assert_eq!(metric.sample_size, 0);
        assert_eq!(rate_score(5, 0), 0);
    }

    #[test]
    fn empty_samples_borrow_the_current_profile() {
        let profile = Profile::empty(must_utc("2026-02-01T00:00:00Z"));
        let updated = update_profile(&profile, &[], must_utc("2026-02-02T00:00:00Z"));

        assert!(matches!(updated, Cow::Borrowed(_)));
        assert!(std::ptr::eq(&*updated, &profile));
    }

    #[test]
    fn untouched_keys_are_preserved() {
        let now = must_utc("2026-02-02T00:00:00Z");
        let base =
            update_profile(&Profile::empty(now), &[sample("logic", 1, 2)], now).into_owned();
        let later = must_utc("2026-02-05T00:00:00Z");
        let updated = update_profile(&base, &[sample("rebuttal", 3, 4)], later);

        assert_eq!(updated.metrics["logic"], base.metrics["logic"]);
        assert_eq!(updated.metrics["rebuttal"].score, 75);
    }

    #[test]
    fn oversized_numerators_are_clamped() {
        let now = must_utc("2026-02-02T00:00:00Z");
        let updated =
            update_profile(&Profile::empty(now), &[sample("logic", 9, 3)], now).into_owned();
        assert_eq!(updated.metrics["logic"].rate.numerator, 3);
        assert_eq!(updated.metrics["logic"].score, 100);
    }

    #[test]
    fn labels_prefer_sample_then_existing_then_key() {
        let now = must_utc("2026-02-02T00:00:00Z");
        let mut labelled = sample("logic", 1, 1);
        labelled.label = Some("Logical rigor".to_string());

        let first = update_profile(&Profile::empty(now), &[labelled], now).into_owned();
        let second = update_profile(&first, &[sample("logic", 0, 1)], now).into_owned();
        let fresh =
            update_profile(&Profile::empty(now), &[sample("composure", 1, 1)], now).into_owned();

        assert_eq!(second.metrics["logic"].label, "Logical rigor");
        assert_eq!(fresh.metrics["composure"].label, "composure");
    }

    #[test]
    fn rounding_is_half_up() {
        assert_eq!(rate_score(1, 8), 13);
        assert_eq!(rate_score(1, 3), 33);
        assert_eq!(rate_score(2, 3), 67);
        assert_eq!(rate_score(1, 200), 1);
        assert_eq!(rate_score(3, 3), 100);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_incremental_equals_single_fold(
            stream in prop::collection::vec((0_u64..20, 0_u64..20), 1..40)
        ) {
            let now = must_utc("2026-02-02T00:00:00Z");
            let mut incremental = Profile::empty(now);
            let mut total = Rate::default();
            for (numerator, denominator) in stream {
                let numerator = numerator.min(denominator);
                let next = [sample("logic", numerator, denominator)];
                incremental = update_profile(&incremental, &next, now).into_owned();
                total.numerator += numerator;
                total.denominator += denominator;
            }

            let metric = &incremental.metrics["logic"];
            prop_assert_eq!(metric.rate, total);
            prop_assert_eq!(metric.sample_size, metric.rate.denominator);
            prop_assert!(metric.rate.numerator <= metric.rate.denominator);
            prop_assert_eq!(metric.score, rate_score(total.numerator, total.denominator));
            prop_assert!(metric.score <= 100);
        }
    }
}
