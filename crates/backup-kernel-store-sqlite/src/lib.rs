#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use backup_kernel_core::{format_rfc3339, now_utc, parse_rfc3339_utc, BackupError, BlobStorage};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

const BLOB_MIGRATION_VERSION: i64 = 1;

const SCHEMA_BLOBS_V1: &str = r"
CREATE TABLE IF NOT EXISTS blobs (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// Durable [`BlobStorage`] backed by a single SQLite table.
pub struct SqliteBlobStorage {
    conn: Connection,
}

impl SqliteBlobStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Opens `path` and applies the schema in one call.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let storage = Self::open(path)?;
        storage.migrate()?;
        Ok(storage)
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_BLOBS_V1)
            .context("failed to apply blob schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![BLOB_MIGRATION_VERSION, now],
            )
            .context("failed to register blob schema migration")?;
        if inserted > 0 {
            tracing::info!(version = BLOB_MIGRATION_VERSION, "applied blob schema migration");
        }

        Ok(())
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn read_blob(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM blobs WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("failed to read blob `{key}`"))
    }

    pub fn write_blob(&self, key: &str, value: &str) -> Result<()> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO blobs(key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .with_context(|| format!("failed to write blob `{key}`"))?;
        Ok(())
    }

    pub fn blob_updated_at(&self, key: &str) -> Result<Option<OffsetDateTime>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT updated_at FROM blobs WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read updated_at for blob `{key}`"))?;

        raw.map(|value| {
            parse_rfc3339_utc(&value)
                .map_err(|err| anyhow!("invalid updated_at for blob `{key}`: {err}"))
        })
        .transpose()
    }
}

impl BlobStorage for SqliteBlobStorage {
    fn get_blob(&self, key: &str) -> Result<Option<String>, BackupError> {
        self.read_blob(key)
            .map_err(|err| BackupError::Storage(format!("{err:#}")))
    }

    fn set_blob(&mut self, key: &str, value: &str) -> Result<(), BackupError> {
        self.write_blob(key, value)
            .map_err(|err| BackupError::Storage(format!("{err:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_kernel_core::{
        EngineConfig, MemoryBlobStorage, SnapshotAction, SnapshotStore, LATEST_SCHEMA_VERSION,
    };

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_ok<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_storage() -> SqliteBlobStorage {
        must(SqliteBlobStorage::open_migrated(Path::new(":memory:")))
    }

    #[test]
    fn migrate_is_idempotent_and_registers_version() {
        let storage = fixture_storage();
        must(storage.migrate());

        let count: i64 = must(
            storage
                .connection()
                .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
                .map_err(anyhow::Error::from),
        );
        assert_eq!(count, 1);
    }

    #[test]
    fn blobs_upsert_by_key() {
        let mut storage = fixture_storage();
        assert_eq!(must_ok(storage.get_blob("backup")), None);

        must_ok(storage.set_blob("backup", "{\"v\":1}"));
        must_ok(storage.set_blob("backup", "{\"v\":2}"));

        assert_eq!(
            must_ok(storage.get_blob("backup")),
            Some("{\"v\":2}".to_string())
        );
        assert!(must(storage.blob_updated_at("backup")).is_some());
        assert!(must(storage.blob_updated_at("other")).is_none());
    }

    #[test]
    fn write_failures_surface_as_storage_errors() {
        let mut storage = fixture_storage();
        must(
            storage
                .connection()
                .execute_batch("DROP TABLE blobs;")
                .map_err(anyhow::Error::from),
        );

        let result = storage.set_blob("backup", "{}");
        assert!(matches!(result, Err(BackupError::Storage(_))));
    }

    #[test]
    fn snapshot_store_round_trips_through_sqlite() {
        let config = EngineConfig::standard();
        let mut store = must_ok(SnapshotStore::load(fixture_storage(), config.clone()));
        let report = must_ok(store.commit(SnapshotAction::AddArchive {
            archive: serde_json::json!({"id": "a", "topic": "Universal basic income"}),
            settings_snapshot: None,
        }));
        assert_eq!(report.persisted, Ok(()));

        let raw = must_ok(store.storage().get_blob(&config.storage_key));
        let mirrored =
            MemoryBlobStorage::new().with_blob(&config.storage_key, &raw.unwrap_or_default());
        let reloaded = must_ok(SnapshotStore::load(mirrored, config));

        assert_eq!(reloaded.get().schema_version, LATEST_SCHEMA_VERSION);
        assert_eq!(reloaded.get().archives, store.get().archives);
    }
}
