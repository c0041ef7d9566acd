use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::BackupError;

/// How `merge_snapshots` treats the weakness profile of the combined result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileMergeStrategy {
    /// Keep the current profile; merged-in archives do not contribute.
    #[default]
    KeepCurrent,
    /// Refold the profile from every archive in the merged result.
    Rebuild,
}

impl ProfileMergeStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeepCurrent => "keep_current",
            Self::Rebuild => "rebuild",
        }
    }
}

/// Engine-wide settings threaded through migration, merge, and persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Stamped into snapshots created from legacy input.
    pub app_version: String,
    /// Blob key the snapshot is persisted under.
    pub storage_key: String,
    #[serde(default)]
    pub profile_merge: ProfileMergeStrategy,
}

impl EngineConfig {
    pub const DEFAULT_STORAGE_KEY: &'static str = "debate-coach.backup.v1";

    #[must_use]
    pub fn standard() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            storage_key: Self::DEFAULT_STORAGE_KEY.to_string(),
            profile_merge: ProfileMergeStrategy::default(),
        }
    }

    /// # Errors
    /// Returns [`BackupError::Configuration`] when a required field is blank.
    pub fn validate(&self) -> Result<(), BackupError> {
        if self.app_version.trim().is_empty() {
            return Err(BackupError::Configuration(
                "appVersion must be non-empty".to_string(),
            ));
        }
        if self.storage_key.trim().is_empty() {
            return Err(BackupError::Configuration(
                "storageKey must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads a partial JSON override on top of [`EngineConfig::standard`].
    ///
    /// # Errors
    /// Returns [`BackupError::Configuration`] for non-object input, wrongly
    /// typed fields, or a config that fails [`EngineConfig::validate`].
    pub fn from_json(value: &Value) -> Result<Self, BackupError> {
        let Value::Object(overrides) = value else {
            return Err(BackupError::Configuration(
                "engine config must be a JSON object".to_string(),
            ));
        };

        let mut merged = match serde_json::to_value(Self::standard()) {
            Ok(Value::Object(map)) => map,
            Ok(_) => serde_json::Map::new(),
            Err(err) => return Err(BackupError::Configuration(err.to_string())),
        };
        for (key, field) in overrides {
            merged.insert(key.clone(), field.clone());
        }

        let config: Self = serde_json::from_value(Value::Object(merged))
            .map_err(|err| BackupError::Configuration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::standard()
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
    fn standard_config_is_valid() {
        let config = EngineConfig::standard();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage_key, EngineConfig::DEFAULT_STORAGE_KEY);
        assert_eq!(config.profile_merge, ProfileMergeStrategy::KeepCurrent);
    }

    #[test]
    fn partial_overrides_keep_defaults() {
        let config = must_ok(EngineConfig::from_json(&json!({
            "appVersion": "9.9.9",
            "profileMerge": "rebuild"
        })));
        assert_eq!(config.app_version, "9.9.9");
        assert_eq!(config.storage_key, EngineConfig::DEFAULT_STORAGE_KEY);
        assert_eq!(config.profile_merge, ProfileMergeStrategy::Rebuild);
    }

    #[test]
    fn rejects_blank_and_malformed_config() {
        assert!(matches!(
            EngineConfig::from_json(&json!({"storageKey": "  "})),
            Err(BackupError::Configuration(_))
        ));
        assert!(matches!(
            EngineConfig::from_json(&json!({"profileMerge": "newest"})),
            Err(BackupError::Configuration(_))
        ));
        assert!(matches!(
            EngineConfig::from_json(&json!(["appVersion"])),
            Err(BackupError::Configuration(_))
        ));
    }

    #[test]
    fn strategy_names_match_serialized_form() {
        for strategy in [ProfileMergeStrategy::KeepCurrent, ProfileMergeStrategy::Rebuild] {
            let encoded = must_ok(serde_json::to_value(strategy));
            assert_eq!(encoded, json!(strategy.as_str()));
            let decoded: ProfileMergeStrategy = must_ok(serde_json::from_value(encoded));
            assert_eq!(decoded, strategy);
        }
    }
}
