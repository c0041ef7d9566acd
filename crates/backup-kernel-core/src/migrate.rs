use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use serde_json::{json, Map, Value};
use time::OffsetDateTime;

use crate::config::EngineConfig;
use crate::merge::merge_archives;
use crate::model::{Archive, Snapshot};
use crate::sanitize::{generate_pseudo_user_id, sanitize_archive, sanitize_profile, sanitize_task};
use crate::{coerce_timestamp, format_rfc3339, BackupError};

pub const LATEST_SCHEMA_VERSION: u32 = 4;

/// Upgrades the shape of version `v` to `v + 1`. Steps only handle their own
/// delta and may not assume fields beyond what the previous version guarantees.
pub type MigrationStep = fn(&Value, &MigrationContext) -> Result<Value, BackupError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationContext {
    pub now: OffsetDateTime,
    pub app_version: String,
}

impl MigrationContext {
    #[must_use]
    pub fn new(config: &EngineConfig, now: OffsetDateTime) -> Self {
        Self {
            now,
            app_version: config.app_version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRun {
    pub value: Value,
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<u32>,
}

/// Version-indexed table of upgrade steps.
#[derive(Clone)]
pub struct MigrationChain {
    steps: BTreeMap<u32, MigrationStep>,
    latest: u32,
}

impl Debug for MigrationChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationChain")
            .field("versions", &self.steps.keys().collect::<Vec<_>>())
            .field("latest", &self.latest)
            .finish()
    }
}

impl MigrationChain {
    /// Registers a step table, requiring keys to cover exactly `0..latest`.
    ///
    /// # Errors
    /// Returns [`BackupError::MigrationGap`] for the first version without a
    /// step and [`BackupError::Configuration`] for steps at or past `latest`.
    pub fn new(steps: BTreeMap<u32, MigrationStep>, latest: u32) -> Result<Self, BackupError> {
        if latest == 0 {
            return Err(BackupError::Configuration(
                "latest schema version MUST be >= 1".to_string(),
            ));
        }

        if let Some(version) = (0..latest).find(|version| !steps.contains_key(version)) {
            return Err(BackupError::MigrationGap { version });
        }

        if let Some(version) = steps.keys().find(|version| **version >= latest) {
            return Err(BackupError::Configuration(format!(
                "migration step registered for version {version} at or beyond latest {latest}"
            )));
        }

        Ok(Self { steps, latest })
    }

    /// The chain shipped with this crate.
    ///
    /// # Errors
    /// Returns an error only if the built-in table is not contiguous.
    pub fn standard() -> Result<Self, BackupError> {
        let mut steps: BTreeMap<u32, MigrationStep> = BTreeMap::new();
        steps.insert(0, wrap_legacy_envelope);
        steps.insert(1, introduce_tasks_and_profile);
        steps.insert(2, sanitize_archives);
        steps.insert(3, introduce_user_profile);
        Self::new(steps, LATEST_SCHEMA_VERSION)
    }

    #[must_use]
    pub fn latest(&self) -> u32 {
        self.latest
    }

    /// Drives `input` through every step from its stamped version to latest.
    ///
    /// # Errors
    /// Returns [`BackupError::UnsupportedVersion`] for versions newer than
    /// latest, [`BackupError::MigrationGap`] when no step exists for a
    /// reached version, and [`BackupError::Migration`] (carrying the last
    /// successfully reached value) when a step fails.
    pub fn run(&self, input: Value, ctx: &MigrationContext) -> Result<MigrationRun, BackupError> {
        let from_version = stamped_version(&input);
        if from_version > self.latest {
            return Err(BackupError::UnsupportedVersion {
                version: from_version,
                latest: self.latest,
            });
        }

        let mut current = from_version;
        let mut value = input;
        let mut applied = Vec::new();

        while current < self.latest {
            let step = self
                .steps
                .get(&current)
                .ok_or(BackupError::MigrationGap { version: current })?;

            let mut next = match step(&value, ctx) {
                Ok(next) => next,
                Err(err) => {
                    tracing::warn!(
                        version = current,
                        error = %err,
                        "snapshot migration step failed; keeping last reached version"
                    );
                    return Err(BackupError::Migration {
                        version: current,
                        message: err.to_string(),
                        partial: Box::new(value),
                    });
                }
            };

            let stamped = stamped_version(&next);
            let reached = if stamped > current {
                stamped
            } else {
                current + 1
            };

            if reached > self.latest {
                return Err(BackupError::Migration {
                    version: current,
                    message: format!(
                        "step stamped version {reached} beyond latest {}",
                        self.latest
                    ),
                    partial: Box::new(value),
                });
            }

            let Some(object) = next.as_object_mut() else {
                return Err(BackupError::Migration {
                    version: current,
                    message: "step produced a non-object snapshot".to_string(),
                    partial: Box::new(value),
                });
            };
            object.insert("schemaVersion".to_string(), json!(reached));

            tracing::debug!("applied snapshot migration {} -> {}", current, reached);
            applied.push(current);
            current = reached;
            value = next;
        }

        Ok(MigrationRun {
            value,
            from_version,
            to_version: current,
            applied,
        })
    }

    /// Runs the chain and decodes the result into the canonical shape.
    ///
    /// Documents already stamped at a later version still pass through the
    /// sanitizer, so sparse archives and envelopes decode with defaults.
    ///
    /// # Errors
    /// Propagates [`MigrationChain::run`] errors and returns
    /// [`BackupError::Validation`] when the migrated value does not decode.
    pub fn migrate_to_latest(
        &self,
        input: Value,
        ctx: &MigrationContext,
    ) -> Result<Snapshot, BackupError> {
        let run = self.run(input, ctx)?;
        if !run.applied.is_empty() {
            tracing::info!(
                from = run.from_version,
                to = run.to_version,
                steps = run.applied.len(),
                "migrated snapshot to latest schema"
            );
        }

        let canonical = canonicalize(run.value, ctx)?;
        serde_json::from_value(canonical).map_err(|err| {
            BackupError::Validation(format!(
                "migrated snapshot does not match canonical shape: {err}"
            ))
        })
    }
}

/// Upgrades `input` with the standard chain.
///
/// # Errors
/// See [`MigrationChain::migrate_to_latest`].
pub fn migrate_to_latest(input: Value, ctx: &MigrationContext) -> Result<Snapshot, BackupError> {
    MigrationChain::standard()?.migrate_to_latest(input, ctx)
}

fn stamped_version(value: &Value) -> u32 {
    value
        .as_object()
        .and_then(|object| object.get("schemaVersion"))
        .and_then(Value::as_u64)
        .and_then(|version| u32::try_from(version).ok())
        .unwrap_or(0)
}

fn encode<T: serde::Serialize>(value: &T, what: &str) -> Result<Value, BackupError> {
    serde_json::to_value(value)
        .map_err(|err| BackupError::Validation(format!("failed to encode {what}: {err}")))
}

/// 0 -> 1: legacy bare arrays, null, and unversioned objects become an envelope.
fn wrap_legacy_envelope(value: &Value, ctx: &MigrationContext) -> Result<Value, BackupError> {
    let (mut envelope, archives) = match value {
        Value::Array(items) => (Map::new(), items.clone()),
        Value::Object(map) => (
            map.clone(),
            map.get("archives")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        ),
        _ => (Map::new(), Vec::new()),
    };

    let exported_at = envelope
        .get("exportedAt")
        .and_then(coerce_timestamp)
        .unwrap_or(ctx.now);

    if !envelope.get("appVersion").is_some_and(Value::is_string) {
        envelope.insert("appVersion".to_string(), json!(ctx.app_version));
    }
    envelope.insert(
        "exportedAt".to_string(),
        json!(format_rfc3339(exported_at)?),
    );
    envelope.insert("archives".to_string(), Value::Array(archives));
    envelope.insert("schemaVersion".to_string(), json!(1));

    Ok(Value::Object(envelope))
}

/// 1 -> 2: homework tasks and the weakness profile appear.
fn introduce_tasks_and_profile(
    value: &Value,
    ctx: &MigrationContext,
) -> Result<Value, BackupError> {
    let mut envelope = value.as_object().cloned().unwrap_or_default();

    let tasks = sanitized_tasks(&envelope)?;
    let profile = sanitize_profile(envelope.get("weaknessProfile"), ctx.now);

    envelope.insert("homeworkTasks".to_string(), tasks);
    envelope.insert(
        "weaknessProfile".to_string(),
        encode(&profile, "weakness profile")?,
    );
    envelope.insert("schemaVersion".to_string(), json!(2));

    Ok(Value::Object(envelope))
}

/// 2 -> 3: every archive passes through the sanitizer; duplicate ids collapse
/// to the most recently modified copy.
fn sanitize_archives(value: &Value, ctx: &MigrationContext) -> Result<Value, BackupError> {
    let mut envelope = value.as_object().cloned().unwrap_or_default();

    let archives = sanitized_archives(&envelope, ctx)?;
    envelope.insert("archives".to_string(), archives);
    envelope.insert("schemaVersion".to_string(), json!(3));

    Ok(Value::Object(envelope))
}

/// 3 -> 4: a pseudonymous user identity.
fn introduce_user_profile(value: &Value, ctx: &MigrationContext) -> Result<Value, BackupError> {
    let mut envelope = value.as_object().cloned().unwrap_or_default();

    let profile = envelope
        .get("userProfile")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    envelope.insert("userProfile".to_string(), with_identity(profile, ctx));
    envelope.insert("schemaVersion".to_string(), json!(4));

    Ok(Value::Object(envelope))
}

/// Applied to every run result before decoding. Fills envelope defaults and
/// re-sanitizes each collection; a no-op on canonical input.
fn canonicalize(value: Value, ctx: &MigrationContext) -> Result<Value, BackupError> {
    let Value::Object(mut envelope) = value else {
        return Err(BackupError::Validation(
            "migrated snapshot is not a JSON object".to_string(),
        ));
    };

    if !envelope.get("appVersion").is_some_and(Value::is_string) {
        envelope.insert("appVersion".to_string(), json!(ctx.app_version));
    }
    let exported_at = envelope
        .get("exportedAt")
        .and_then(coerce_timestamp)
        .unwrap_or(ctx.now);
    envelope.insert(
        "exportedAt".to_string(),
        json!(format_rfc3339(exported_at)?),
    );

    let archives = sanitized_archives(&envelope, ctx)?;
    let tasks = sanitized_tasks(&envelope)?;
    let profile = sanitize_profile(envelope.get("weaknessProfile"), ctx.now);
    envelope.insert("archives".to_string(), archives);
    envelope.insert("homeworkTasks".to_string(), tasks);
    envelope.insert(
        "weaknessProfile".to_string(),
        encode(&profile, "weakness profile")?,
    );

    if let Some(profile) = envelope.get("userProfile").and_then(Value::as_object) {
        let profile = with_identity(profile.clone(), ctx);
        envelope.insert("userProfile".to_string(), profile);
    } else if envelope.get("userProfile").is_some() {
        envelope.remove("userProfile");
    }

    Ok(Value::Object(envelope))
}

/// Sanitizes `archives` and collapses duplicate ids to the latest write.
fn sanitized_archives(
    envelope: &Map<String, Value>,
    ctx: &MigrationContext,
) -> Result<Value, BackupError> {
    let sanitized: Vec<Archive> = envelope
        .get("archives")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| sanitize_archive(item, ctx.now))
                .collect()
        })
        .unwrap_or_default();
    let (archives, _) = merge_archives(&[], &sanitized);
    encode(&archives, "archives")
}

fn sanitized_tasks(envelope: &Map<String, Value>) -> Result<Value, BackupError> {
    let tasks = envelope
        .get("homeworkTasks")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(sanitize_task).collect::<Vec<_>>())
        .unwrap_or_default();
    encode(&tasks, "homework tasks")
}

fn with_identity(mut profile: Map<String, Value>, ctx: &MigrationContext) -> Value {
    let has_identity = profile
        .get("pseudoUserId")
        .and_then(Value::as_str)
        .is_some_and(|raw| !raw.trim().is_empty());
    if !has_identity {
        profile.insert(
            "pseudoUserId".to_string(),
            json!(generate_pseudo_user_id(ctx.now)),
        );
    }
    Value::Object(profile)
}
