use std::collections::BTreeMap;

use serde_json::Value;
use time::OffsetDateTime;

use crate::config::EngineConfig;
use crate::merge::merge_snapshots;
use crate::migrate::{migrate_to_latest, MigrationContext};
use crate::model::{create_snapshot, Snapshot, Task};
use crate::profile::{rebuild_profile, update_profile};
use crate::sanitize::sanitize_archive;
use crate::validate::validate;
use crate::{format_rfc3339, now_utc, BackupError};

/// Opaque durable key/value primitive the snapshot is persisted through.
pub trait BlobStorage {
    /// # Errors
    /// Returns [`BackupError::Storage`] when the backend cannot be read.
    fn get_blob(&self, key: &str) -> Result<Option<String>, BackupError>;

    /// # Errors
    /// Returns [`BackupError::Storage`] when the backend rejects the write.
    fn set_blob(&mut self, key: &str, value: &str) -> Result<(), BackupError>;
}

/// In-process storage. Writes can be forced to fail to exercise the
/// non-rollback path.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStorage {
    blobs: BTreeMap<String, String>,
    fail_writes: bool,
}

impl MemoryBlobStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_blob(mut self, key: &str, value: &str) -> Self {
        self.blobs.insert(key.to_string(), value.to_string());
        self
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    #[must_use]
    pub fn blob(&self, key: &str) -> Option<&str> {
        self.blobs.get(key).map(String::as_str)
    }
}

impl BlobStorage for MemoryBlobStorage {
    fn get_blob(&self, key: &str) -> Result<Option<String>, BackupError> {
        Ok(self.blobs.get(key).cloned())
    }

    fn set_blob(&mut self, key: &str, value: &str) -> Result<(), BackupError> {
        if self.fail_writes {
            return Err(BackupError::Storage(format!(
                "write to `{key}` rejected by memory storage"
            )));
        }
        self.blobs.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    Merge,
    Replace,
}

impl ImportMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Replace => "replace",
        }
    }
}

/// Every state transition the store accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotAction {
    AddArchive {
        archive: Value,
        settings_snapshot: Option<Value>,
    },
    UpdateArchiveTopic {
        id: String,
        topic: String,
    },
    DeleteArchive {
        id: String,
    },
    UpsertTask(Task),
    RemoveTask {
        id: String,
    },
    Import {
        raw_text: String,
        mode: ImportMode,
    },
    RebuildProfile,
}

impl SnapshotAction {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AddArchive { .. } => "add_archive",
            Self::UpdateArchiveTopic { .. } => "update_archive_topic",
            Self::DeleteArchive { .. } => "delete_archive",
            Self::UpsertTask(_) => "upsert_task",
            Self::RemoveTask { .. } => "remove_task",
            Self::Import { .. } => "import",
            Self::RebuildProfile => "rebuild_profile",
        }
    }
}

/// Pure transition function behind [`SnapshotStore::commit`].
///
/// # Errors
/// Returns parse, validation, or migration errors from imports, and
/// [`BackupError::Validation`] when an action names an unknown id.
pub fn reduce(
    prev: &Snapshot,
    action: &SnapshotAction,
    config: &EngineConfig,
    now: OffsetDateTime,
) -> Result<Snapshot, BackupError> {
    match action {
        SnapshotAction::AddArchive {
            archive,
            settings_snapshot,
        } => Ok(add_archive(prev, archive, settings_snapshot.as_ref(), now)),
        SnapshotAction::UpdateArchiveTopic { id, topic } => {
            let topic = topic.trim();
            if topic.is_empty() {
                return Err(BackupError::Validation(
                    "archive topic must be non-empty".to_string(),
                ));
            }
            let mut next = prev.clone();
            let archive = next
                .archives
                .iter_mut()
                .find(|archive| archive.id == *id)
                .ok_or_else(|| unknown_archive(id))?;
            archive.topic = topic.to_string();
            archive.last_modified = now;
            Ok(next)
        }
        SnapshotAction::DeleteArchive { id } => {
            if prev.archive(id).is_none() {
                return Err(unknown_archive(id));
            }
            let mut next = prev.clone();
            next.archives.retain(|archive| archive.id != *id);
            Ok(next)
        }
        SnapshotAction::UpsertTask(task) => {
            if task.id.trim().is_empty() {
                return Err(BackupError::Validation(
                    "task id must be non-empty".to_string(),
                ));
            }
            let mut next = prev.clone();
            match next.homework_tasks.iter().position(|item| item.id == task.id) {
                Some(position) => next.homework_tasks[position] = task.clone(),
                None => next.homework_tasks.push(task.clone()),
            }
            Ok(next)
        }
        SnapshotAction::RemoveTask { id } => {
            if prev.task(id).is_none() {
                return Err(BackupError::Validation(format!("no task with id `{id}`")));
            }
            let mut next = prev.clone();
            next.homework_tasks.retain(|task| task.id != *id);
            Ok(next)
        }
        SnapshotAction::Import { raw_text, mode } => {
            import_snapshot(prev, raw_text, *mode, config, now)
        }
        SnapshotAction::RebuildProfile => {
            let mut next = prev.clone();
            next.weakness_profile = rebuild_profile(&next.archives, now);
            Ok(next)
        }
    }
}

fn unknown_archive(id: &str) -> BackupError {
    BackupError::Validation(format!("no archive with id `{id}`"))
}

/// Sanitizes a finished session and records it newest-first.
///
/// New archives fold their skill samples into the profile. An archive whose
/// id already exists replaces the stored one in place with `last_modified`
/// bumped to `now`; its samples are not folded a second time.
#[must_use]
pub fn add_archive(
    prev: &Snapshot,
    archive: &Value,
    settings_snapshot: Option<&Value>,
    now: OffsetDateTime,
) -> Snapshot {
    let mut archive = sanitize_archive(archive, now);
    if let Some(settings) = settings_snapshot.filter(|value| !value.is_null()) {
        archive.settings_snapshot = Some(settings.clone());
    }

    let mut next = prev.clone();
    if let Some(position) = next
        .archives
        .iter()
        .position(|existing| existing.id == archive.id)
    {
        archive.last_modified = now;
        next.archives[position] = archive;
        return next;
    }

    next.weakness_profile =
        update_profile(&prev.weakness_profile, &archive.feedback.skill_samples, now).into_owned();
    next.archives.insert(0, archive);
    next
}

/// Parses, validates, and migrates raw backup text into a canonical snapshot.
///
/// # Errors
/// Returns [`BackupError::Parse`] for malformed JSON,
/// [`BackupError::Validation`] for implausible documents, and migration
/// errors from [`migrate_to_latest`].
pub fn parse_snapshot_text(
    raw_text: &str,
    ctx: &MigrationContext,
) -> Result<Snapshot, BackupError> {
    let value: Value = serde_json::from_str(raw_text)
        .map_err(|err| BackupError::Parse(format!("backup is not valid JSON: {err}")))?;

    if !validate(&value) {
        return Err(BackupError::Validation(
            "document is not a recognizable backup snapshot".to_string(),
        ));
    }

    migrate_to_latest(value, ctx)
}

/// Brings an imported file into `current` by merging or replacing.
///
/// # Errors
/// Propagates every error from [`parse_snapshot_text`]; `current` is never
/// touched on failure.
pub fn import_snapshot(
    current: &Snapshot,
    raw_text: &str,
    mode: ImportMode,
    config: &EngineConfig,
    now: OffsetDateTime,
) -> Result<Snapshot, BackupError> {
    let ctx = MigrationContext::new(config, now);
    let incoming = parse_snapshot_text(raw_text, &ctx)?;

    tracing::info!(
        mode = mode.as_str(),
        archives = incoming.archives.len(),
        tasks = incoming.homework_tasks.len(),
        "importing snapshot"
    );

    Ok(match mode {
        ImportMode::Replace => incoming,
        ImportMode::Merge => merge_snapshots(current, &incoming, config.profile_merge, now),
    })
}

/// Serializes `snapshot` as pretty JSON with `exportedAt` stamped `now`.
///
/// # Errors
/// Returns [`BackupError::Validation`] when serialization fails.
pub fn export_snapshot(
    snapshot: &Snapshot,
    now: OffsetDateTime,
) -> Result<Vec<u8>, BackupError> {
    let mut stamped = snapshot.clone();
    stamped.exported_at = now;
    serde_json::to_vec_pretty(&stamped)
        .map_err(|err| BackupError::Validation(format!("failed to serialize snapshot: {err}")))
}

/// `debate-backup-<timestamp>.json` with `:` and `.` replaced by `-`.
///
/// # Errors
/// Returns [`BackupError::Validation`] when the timestamp cannot be formatted.
pub fn export_file_name(now: OffsetDateTime) -> Result<String, BackupError> {
    let stamp = format_rfc3339(now)?.replace([':', '.'], "-");
    Ok(format!("debate-backup-{stamp}.json"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&Snapshot)>;

/// Outcome of a committed action. The in-memory state has already advanced
/// when this is returned, even if `persisted` is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub archive_count: usize,
    pub task_count: usize,
    pub persisted: Result<(), BackupError>,
}

/// Single-writer owner of the current snapshot.
///
/// `commit` takes `&mut self`, so a transition always runs to completion
/// (read, reduce, swap, notify, persist) before the next one starts.
pub struct SnapshotStore<S: BlobStorage> {
    storage: S,
    config: EngineConfig,
    state: Snapshot,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl<S: BlobStorage> SnapshotStore<S> {
    /// # Errors
    /// See [`SnapshotStore::load_at`].
    pub fn load(storage: S, config: EngineConfig) -> Result<Self, BackupError> {
        Self::load_at(storage, config, now_utc())
    }

    /// Reads the persisted blob, or starts from an empty snapshot when none
    /// exists.
    ///
    /// # Errors
    /// Returns configuration, storage, parse, validation, or migration errors.
    pub fn load_at(
        storage: S,
        config: EngineConfig,
        now: OffsetDateTime,
    ) -> Result<Self, BackupError> {
        config.validate()?;
        let ctx = MigrationContext::new(&config, now);

        let state = match storage.get_blob(&config.storage_key)? {
            Some(raw) => parse_snapshot_text(&raw, &ctx)?,
            None => {
                tracing::debug!(key = %config.storage_key, "no persisted snapshot; starting empty");
                create_snapshot(Vec::new(), &ctx)
            }
        };

        Ok(Self {
            storage,
            config,
            state,
            listeners: Vec::new(),
            next_subscription: 0,
        })
    }

    #[must_use]
    pub fn get(&self) -> &Snapshot {
        &self.state
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&Snapshot) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Returns whether a listener was registered under `id`.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(registered, _)| *registered != id);
        self.listeners.len() != before
    }

    /// # Errors
    /// See [`SnapshotStore::commit_at`].
    pub fn commit(&mut self, action: SnapshotAction) -> Result<CommitReport, BackupError> {
        self.commit_at(action, now_utc())
    }

    /// Applies `action`, notifies subscribers, then persists.
    ///
    /// # Errors
    /// Returns the reducer's error; state is untouched and nobody is
    /// notified. Persistence failures are reported in the returned
    /// [`CommitReport`] instead and do not roll the state back.
    pub fn commit_at(
        &mut self,
        action: SnapshotAction,
        now: OffsetDateTime,
    ) -> Result<CommitReport, BackupError> {
        let next = reduce(&self.state, &action, &self.config, now)?;
        self.state = next;

        for (_, listener) in &mut self.listeners {
            listener(&self.state);
        }

        let persisted = self.persist();
        if let Err(err) = &persisted {
            tracing::warn!(
                action = action.name(),
                error = %err,
                "snapshot committed but not persisted"
            );
        }

        Ok(CommitReport {
            archive_count: self.state.archives.len(),
            task_count: self.state.homework_tasks.len(),
            persisted,
        })
    }

    /// Writes the current state under the configured storage key.
    ///
    /// # Errors
    /// Returns [`BackupError::Storage`] when serialization or the write fails.
    pub fn persist(&mut self) -> Result<(), BackupError> {
        let text = serde_json::to_string(&self.state)
            .map_err(|err| BackupError::Storage(format!("failed to serialize snapshot: {err}")))?;
        self.storage.set_blob(&self.config.storage_key, &text)
    }
}
