//! Schema evolution, merge, and skill-aggregate engine for local-first backups.
//!
//! Raw input flows through [`validate`] and [`migrate_to_latest`] into a
//! canonical [`Snapshot`]. Canonical snapshots are combined with
//! [`merge_snapshots`] or extended through [`SnapshotStore::commit`], which
//! folds new skill samples into the running [`Profile`] via [`update_profile`].

use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

mod config;
mod merge;
mod migrate;
mod model;
mod profile;
mod sanitize;
mod store;
mod validate;

pub use config::{EngineConfig, ProfileMergeStrategy};
pub use merge::merge_snapshots;
pub use migrate::{
    migrate_to_latest, MigrationChain, MigrationContext, MigrationRun, MigrationStep,
    LATEST_SCHEMA_VERSION,
};
pub use model::{
    create_snapshot, Archive, Feedback, FeedbackMetrics, Message, Metric, Profile, Rate,
    SkillSample, Snapshot, Task, UserProfile,
};
pub use profile::{rate_score, rebuild_profile, update_profile};
pub use sanitize::{
    sanitize_archive, sanitize_profile, sanitize_task, PLACEHOLDER_TEXT, PLACEHOLDER_TOPIC,
};
pub use store::{
    add_archive, export_file_name, export_snapshot, import_snapshot, parse_snapshot_text,
    reduce, BlobStorage, CommitReport, ImportMode, MemoryBlobStorage, SnapshotAction,
    SnapshotStore, SubscriptionId,
};
pub use validate::validate;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BackupError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("no migration step registered for schema version {version}")]
    MigrationGap { version: u32 },
    #[error("unsupported schema version {version} (latest known is {latest})")]
    UnsupportedVersion { version: u32, latest: u32 },
    #[error("migration from schema version {version} failed: {message}")]
    Migration {
        version: u32,
        message: String,
        /// Best-effort value reached before the failing step.
        partial: Box<Value>,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`BackupError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, BackupError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| BackupError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(BackupError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`BackupError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, BackupError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            BackupError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Reads a persisted timestamp leniently: RFC3339 strings with any offset, or
/// epoch milliseconds. The result is normalized to UTC.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn coerce_timestamp(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::String(raw) => {
            OffsetDateTime::parse(raw.trim(), &time::format_description::well_known::Rfc3339)
                .ok()
                .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        }
        Value::Number(number) => {
            let millis = match number.as_i64() {
                Some(value) => value,
                None => {
                    let float = number.as_f64().filter(|value| value.is_finite())?;
                    float as i64
                }
            };
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn strict_parse_rejects_non_utc_offsets() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00Z").is_ok());
    }

    #[test]
    fn coerce_accepts_offsets_and_epoch_millis() {
        let from_offset = coerce_timestamp(&json!("2026-02-07T14:00:00+02:00"));
        let from_millis = coerce_timestamp(&json!(1_770_465_600_000_i64));
        let expected = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));

        assert_eq!(from_offset, Some(expected));
        assert_eq!(from_millis, Some(expected));
        assert_eq!(
            coerce_timestamp(&json!(1_770_465_600_000.0_f64)),
            Some(expected)
        );
    }

    #[test]
    fn coerce_rejects_garbage() {
        assert_eq!(coerce_timestamp(&json!("yesterday")), None);
        assert_eq!(coerce_timestamp(&json!(null)), None);
        assert_eq!(coerce_timestamp(&json!({"at": 1})), None);
    }

    #[test]
    fn format_round_trips_through_strict_parse() {
        let parsed = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00.250Z"));
        let formatted = must_ok(format_rfc3339(parsed));
        assert!(formatted.starts_with("2026-02-07T12:00:00.25"));
        assert_eq!(must_ok(parse_rfc3339_utc(&formatted)), parsed);
    }
}
