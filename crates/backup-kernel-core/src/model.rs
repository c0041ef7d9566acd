use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::migrate::{MigrationContext, LATEST_SCHEMA_VERSION};
use crate::profile::rebuild_profile;
use crate::sanitize::generate_pseudo_user_id;

/// The complete persisted backup document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub schema_version: u32,
    pub app_version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub exported_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_profile: Option<UserProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    pub archives: Vec<Archive>,
    pub homework_tasks: Vec<Task>,
    pub weakness_profile: Profile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Snapshot {
    #[must_use]
    pub fn archive(&self, id: &str) -> Option<&Archive> {
        self.archives.iter().find(|archive| archive.id == id)
    }

    #[must_use]
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.homework_tasks.iter().find(|task| task.id == id)
    }
}

/// One completed session record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Archive {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
    pub topic: String,
    pub messages: Vec<Message>,
    pub feedback: Feedback,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_snapshot: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub score: f64,
    pub summary: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub advice: String,
    pub metrics: FeedbackMetrics,
    pub detailed_review: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skill_samples: Vec<SkillSample>,
    /// Mode-dependent analysis sub-objects (logic, rhetoric, story, demo, ...).
    #[serde(flatten)]
    pub analysis: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackMetrics {
    pub logic: f64,
    pub evidence: f64,
    pub rebuttal: f64,
    pub structure: f64,
    pub expression: f64,
    pub persuasion: f64,
    pub responsiveness: f64,
    pub composure: f64,
}

impl FeedbackMetrics {
    pub const FIELDS: [&'static str; 8] = [
        "logic",
        "evidence",
        "rebuttal",
        "structure",
        "expression",
        "persuasion",
        "responsiveness",
        "composure",
    ];

    pub(crate) fn field_mut(&mut self, name: &str) -> Option<&mut f64> {
        match name {
            "logic" => Some(&mut self.logic),
            "evidence" => Some(&mut self.evidence),
            "rebuttal" => Some(&mut self.rebuttal),
            "structure" => Some(&mut self.structure),
            "expression" => Some(&mut self.expression),
            "persuasion" => Some(&mut self.persuasion),
            "responsiveness" => Some(&mut self.responsiveness),
            "composure" => Some(&mut self.composure),
            _ => None,
        }
    }
}

/// Homework item. Only the identity matters to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub pseudo_user_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    pub metrics: BTreeMap<String, Metric>,
}

impl Profile {
    #[must_use]
    pub fn empty(now: OffsetDateTime) -> Self {
        Self {
            last_updated: now,
            metrics: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Rate {
    pub numerator: u64,
    pub denominator: u64,
}

/// Running aggregate for one skill key. `sample_size` always equals
/// `rate.denominator`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub key: String,
    pub label: String,
    pub rate: Rate,
    pub score: u32,
    pub sample_size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

/// One per-skill observation emitted by the analysis pipeline for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillSample {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub rate: Rate,
}

/// Builds a canonical snapshot around `archives`, deriving the weakness
/// profile from their skill samples.
#[must_use]
pub fn create_snapshot(archives: Vec<Archive>, ctx: &MigrationContext) -> Snapshot {
    let weakness_profile = rebuild_profile(&archives, ctx.now);
    Snapshot {
        schema_version: LATEST_SCHEMA_VERSION,
        app_version: ctx.app_version.clone(),
        exported_at: ctx.now,
        device_info: None,
        user_profile: Some(UserProfile {
            pseudo_user_id: generate_pseudo_user_id(ctx.now),
            extra: Map::new(),
        }),
        settings: None,
        archives,
        homework_tasks: Vec::new(),
        weakness_profile,
        meta: None,
    }
}
