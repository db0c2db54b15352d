//! Maintenance CLI for the frkb cache.
//!
//! Every command prints a single JSON document on stdout; logs go to stderr.

use clap::{Parser, Subcommand};
use frkb_cache::{Cache, Database, Lookup, Sidecar};
use frkb_config::Config;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "frkb", version, about)]
struct Cli {
    /// Config file (TOML, YAML or JSON). Defaults to the platform config
    /// directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database, overriding the configured one.
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// Database root directory, overriding the configured one.
    #[arg(long, global = true)]
    library_root: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Look up the cached entry for one file.
    Lookup {
        root: String,
        file: String,
        /// Query the cover index instead of the song cache.
        #[arg(long)]
        covers: bool,
    },
    /// Move every cached row from one root to another.
    RenameRoot { old: String, new: String },
    /// Delete every cached row whose root is not one of KEEP.
    Prune {
        #[arg(required = true, num_args = 1..)]
        keep: Vec<String>,
    },
    /// Rewrite absolute keys under the database root as relative keys.
    MigrateKeys,
    /// Import the legacy JSON sidecars of a root.
    ImportLegacy { root: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err:?}");
            return ExitCode::FAILURE;
        },
    };
    config.database = cli.database.or(config.database);
    config.library_root = cli.library_root.or(config.library_root);
    init_tracing(&config.log_level);

    let path = match config.database_path() {
        Ok(path) => path,
        Err(err) => {
            tracing::error!(error = ?err, "No database path");
            return ExitCode::FAILURE;
        },
    };
    if let Some(parent) = path.parent()
        && let Err(err) = std::fs::create_dir_all(parent)
    {
        tracing::error!(path = %parent.display(), error = %err, "Could not create database directory");
        return ExitCode::FAILURE;
    }
    let db = match Database::connect(&path).await {
        Ok(db) => db,
        Err(err) => {
            tracing::error!(path = %path.display(), error = ?err, "Could not open database");
            return ExitCode::FAILURE;
        },
    };

    let mut cache = Cache::new(Some(db.clone()), config.cache.clone());
    if let Some(root) = &config.library_root {
        cache = cache.with_database_root(root.as_str());
    }
    let output = run(&cache, cli.command).await;
    db.close().await;

    match serde_json::to_string_pretty(&output) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        },
        Err(err) => {
            tracing::error!(error = %err, "Could not serialize output");
            ExitCode::FAILURE
        },
    }
}

async fn run(cache: &Cache, command: Command) -> Value {
    match command {
        Command::Lookup { root, file, covers: false } => lookup(cache.songs().load(&root, &file).await),
        Command::Lookup { root, file, covers: true } => lookup(cache.covers().load(&root, &file).await),
        Command::RenameRoot { old, new } => json!(cache.maintenance().rename_root(&old, &new).await),
        Command::Prune { keep } => json!(cache.maintenance().prune(&keep).await),
        Command::MigrateKeys => {
            if cache.database_root().is_none() {
                tracing::warn!("No library root configured; nothing can be made relative");
            }
            json!(cache.maintenance().migrate_keys_to_relative_if_needed().await)
        },
        Command::ImportLegacy { root } => {
            let legacy = cache.legacy();
            json!({
                "songs": legacy.ensure_migrated(Sidecar::Songs, &root).await,
                "covers": legacy.ensure_migrated(Sidecar::Covers, &root).await,
            })
        },
    }
}

fn lookup<T: serde::Serialize>(result: Lookup<T>) -> Value {
    match result {
        Lookup::Hit(entry) => json!({ "status": "hit", "entry": entry }),
        Lookup::Miss => json!({ "status": "miss" }),
        Lookup::Unavailable => json!({ "status": "unavailable" }),
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}
