//! Command surface for inspecting and mutating a local backup database.
//!
//! Hosts embed the CLI through [`run_cli`] for parsed execution or
//! [`run_command`] against an already loaded [`SnapshotStore`]. Every command
//! prints JSON on stdout; diagnostics go to stderr through `tracing`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use backup_kernel_core::{
    export_file_name, export_snapshot, now_utc, parse_snapshot_text, validate, CommitReport,
    EngineConfig, ImportMode, MigrationContext, SnapshotAction, SnapshotStore, Task,
};
use backup_kernel_store_sqlite::SqliteBlobStorage;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(name = "bk")]
#[command(about = "Backup Kernel CLI")]
pub struct Cli {
    #[arg(long, default_value = "./backup_kernel.sqlite3")]
    db: PathBuf,

    /// JSON file overriding engine configuration fields.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check whether a file looks like a backup snapshot.
    Validate(FileArgs),
    /// Print the canonical form of a backup file without touching the database.
    Migrate(FileArgs),
    Import(ImportArgs),
    Export(ExportArgs),
    AddArchive(AddArchiveArgs),
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    Archive {
        #[command(subcommand)]
        command: ArchiveCommand,
    },
    Show,
}

#[derive(Debug, Args)]
pub struct FileArgs {
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    file: PathBuf,
    #[arg(long, value_enum, default_value_t = ImportModeArg::Merge)]
    mode: ImportModeArg,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long, default_value = ".")]
    out: PathBuf,
}

#[derive(Debug, Args)]
pub struct AddArchiveArgs {
    file: PathBuf,
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    Show,
    Rebuild,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    Upsert(TaskUpsertArgs),
    Remove(IdArgs),
}

#[derive(Debug, Args)]
pub struct TaskUpsertArgs {
    #[arg(long)]
    id: String,
    #[arg(long, default_value = "pending")]
    status: String,
}

#[derive(Debug, Subcommand)]
pub enum ArchiveCommand {
    Delete(IdArgs),
    Rename(ArchiveRenameArgs),
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct ArchiveRenameArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    topic: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ImportModeArg {
    Merge,
    Replace,
}

impl From<ImportModeArg> for ImportMode {
    fn from(value: ImportModeArg) -> Self {
        match value {
            ImportModeArg::Merge => Self::Merge,
            ImportModeArg::Replace => Self::Replace,
        }
    }
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when configuration is invalid, the database cannot be
/// opened, or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Validate(args) => run_validate(&args.file),
        Command::Migrate(args) => run_migrate(&args.file, &config),
        command => {
            let mut store = open_store(&cli.db, config)?;
            run_command(command, &mut store)
        }
    }
}

/// Reads engine configuration, layering the file at `path` over the defaults.
///
/// # Errors
/// Returns an error when the file is unreadable or fails validation.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::standard());
    };

    let value = read_json_file(path)?;
    EngineConfig::from_json(&value)
        .with_context(|| format!("invalid engine config at {}", path.display()))
}

/// Opens (and migrates) the `SQLite` database and loads its snapshot.
///
/// # Errors
/// Returns an error when the database or the stored snapshot is unusable.
pub fn open_store(
    db_path: &Path,
    config: EngineConfig,
) -> Result<SnapshotStore<SqliteBlobStorage>> {
    tracing::debug!(db = %db_path.display(), key = %config.storage_key, "opening backup database");
    let storage = SqliteBlobStorage::open_migrated(db_path)?;
    SnapshotStore::load(storage, config)
        .with_context(|| format!("failed to load snapshot from {}", db_path.display()))
}

/// Executes a store-backed command against an existing store handle.
///
/// # Errors
/// Returns an error when the action is rejected or its result could not be
/// persisted.
pub fn run_command(
    command: Command,
    store: &mut SnapshotStore<SqliteBlobStorage>,
) -> Result<()> {
    match command {
        Command::Validate(args) => run_validate(&args.file),
        Command::Migrate(args) => run_migrate(&args.file, store.config()),
        Command::Import(args) => {
            let raw_text = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            let mode = ImportMode::from(args.mode);
            let report = store.commit(SnapshotAction::Import { raw_text, mode })?;
            print_commit("import", &report)
        }
        Command::Export(args) => {
            let now = now_utc();
            let bytes = export_snapshot(store.get(), now)?;
            fs::create_dir_all(&args.out)
                .with_context(|| format!("failed to create {}", args.out.display()))?;
            let path = args.out.join(export_file_name(now)?);
            fs::write(&path, bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            print_json(&json!({
                "path": path.display().to_string(),
                "archives": store.get().archives.len(),
                "tasks": store.get().homework_tasks.len(),
            }))
        }
        Command::AddArchive(args) => {
            let archive = read_json_file(&args.file)?;
            let settings_snapshot = args
                .settings
                .as_deref()
                .map(read_json_file)
                .transpose()?;
            let report = store.commit(SnapshotAction::AddArchive {
                archive,
                settings_snapshot,
            })?;
            print_commit("add_archive", &report)
        }
        Command::Profile { command } => match command {
            ProfileCommand::Show => print_json(&store.get().weakness_profile),
            ProfileCommand::Rebuild => {
                let report = store.commit(SnapshotAction::RebuildProfile)?;
                ensure_persisted("rebuild_profile", &report)?;
                print_json(&store.get().weakness_profile)
            }
        },
        Command::Task { command } => match command {
            TaskCommand::Upsert(args) => {
                let task = match store.get().task(&args.id) {
                    Some(existing) => Task {
                        status: args.status,
                        ..existing.clone()
                    },
                    None => Task {
                        id: args.id,
                        status: args.status,
                        extra: Map::new(),
                    },
                };
                let report = store.commit(SnapshotAction::UpsertTask(task))?;
                print_commit("upsert_task", &report)
            }
            TaskCommand::Remove(args) => {
                let report = store.commit(SnapshotAction::RemoveTask { id: args.id })?;
                print_commit("remove_task", &report)
            }
        },
        Command::Archive { command } => match command {
            ArchiveCommand::Delete(args) => {
                let report = store.commit(SnapshotAction::DeleteArchive { id: args.id })?;
                print_commit("delete_archive", &report)
            }
            ArchiveCommand::Rename(args) => {
                let report = store.commit(SnapshotAction::UpdateArchiveTopic {
                    id: args.id,
                    topic: args.topic,
                })?;
                print_commit("update_archive_topic", &report)
            }
        },
        Command::Show => print_json(store.get()),
    }
}

fn run_validate(file: &Path) -> Result<()> {
    let value = read_json_file(file)?;
    let valid = validate(&value);
    print_json(&json!({
        "file": file.display().to_string(),
        "valid": valid,
    }))?;

    if !valid {
        bail!("{} is not a recognizable backup snapshot", file.display());
    }
    Ok(())
}

fn run_migrate(file: &Path, config: &EngineConfig) -> Result<()> {
    let raw_text =
        fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    let ctx = MigrationContext::new(config, now_utc());
    let snapshot = parse_snapshot_text(&raw_text, &ctx)?;
    print_json(&snapshot)
}

fn read_json_file(path: &Path) -> Result<Value> {
    let body =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_commit(action: &str, report: &CommitReport) -> Result<()> {
    print_json(&json!({
        "action": action,
        "archives": report.archive_count,
        "tasks": report.task_count,
        "persisted": report.persisted.is_ok(),
    }))?;
    ensure_persisted(action, report)
}

fn ensure_persisted(action: &str, report: &CommitReport) -> Result<()> {
    report
        .persisted
        .clone()
        .map_err(|err| anyhow!("{action} applied but not persisted: {err}"))
}
