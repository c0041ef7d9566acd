use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::config::ProfileMergeStrategy;
use crate::model::{Archive, Snapshot, Task};
use crate::profile::rebuild_profile;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MergeStats {
    pub(crate) added: usize,
    pub(crate) replaced: usize,
    pub(crate) kept: usize,
}

/// Combines two canonical snapshots.
///
/// Archives resolve per id by last-write-wins on `last_modified` (ties keep
/// `current`). Tasks union by id with `incoming` overwriting. Every other
/// top-level field comes from `current`, and `exported_at` is stamped `now`.
#[must_use]
pub fn merge_snapshots(
    current: &Snapshot,
    incoming: &Snapshot,
    strategy: ProfileMergeStrategy,
    now: OffsetDateTime,
) -> Snapshot {
    let (archives, stats) = merge_archives(&current.archives, &incoming.archives);
    let homework_tasks = merge_tasks(&current.homework_tasks, &incoming.homework_tasks);

    let weakness_profile = match strategy {
        ProfileMergeStrategy::KeepCurrent => current.weakness_profile.clone(),
        ProfileMergeStrategy::Rebuild => rebuild_profile(&archives, now),
    };

    tracing::debug!(
        added = stats.added,
        replaced = stats.replaced,
        kept = stats.kept,
        tasks = homework_tasks.len(),
        strategy = strategy.as_str(),
        "merged snapshots"
    );

    Snapshot {
        exported_at: now,
        archives,
        homework_tasks,
        weakness_profile,
        ..current.clone()
    }
}

/// Folds `incoming` into `current` keyed by id, preserving first-seen order.
/// Duplicate ids inside `incoming` resolve by the same rule.
pub(crate) fn merge_archives(
    current: &[Archive],
    incoming: &[Archive],
) -> (Vec<Archive>, MergeStats) {
    let mut merged: Vec<Archive> = Vec::with_capacity(current.len() + incoming.len());
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    let mut stats = MergeStats::default();

    for archive in current.iter().chain(incoming) {
        match index.get(&archive.id) {
            None => {
                index.insert(archive.id.clone(), merged.len());
                merged.push(archive.clone());
                stats.added += 1;
            }
            Some(&position) => {
                if archive.last_modified > merged[position].last_modified {
                    merged[position] = archive.clone();
                    stats.replaced += 1;
                } else {
                    stats.kept += 1;
                }
            }
        }
    }

    stats.added = stats.added.saturating_sub(count_unique(current));
    (merged, stats)
}

fn count_unique(archives: &[Archive]) -> usize {
    archives
        .iter()
        .map(|archive| archive.id.as_str())
        .collect::<std::collections::BTreeSet<_>>()
        .len()
}

fn merge_tasks(current: &[Task], incoming: &[Task]) -> Vec<Task> {
    let mut merged: Vec<Task> = Vec::with_capacity(current.len() + incoming.len());
    let mut index: BTreeMap<String, usize> = BTreeMap::new();

    for task in current.iter().chain(incoming) {
        if let Some(&position) = index.get(&task.id) {
            merged[position] = task.clone();
        } else {
            index.insert(task.id.clone(), merged.len());
            merged.push(task.clone());
        }
    }

    merged
}
