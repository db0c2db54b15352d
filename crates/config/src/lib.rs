//! Layered configuration.
//!
//! Values are read from, in increasing priority:
//! 1. built-in defaults,
//! 2. a config file (TOML, YAML or JSON, chosen by extension),
//! 3. `FRKB_`-prefixed environment variables, with `__` separating nested
//!    keys (`FRKB_CACHE__LOOSE_ROOT_LIMIT=50`).

pub mod error;

use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use frkb_cache::CacheOptions;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, Result};

pub const ENV_PREFIX: &str = "FRKB_";
const DATABASE_FILE: &str = "cache.db";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. Defaults to the platform data directory.
    pub database: Option<PathBuf>,
    /// Directory containing the database and library trees; roots under it
    /// are keyed relative to it.
    pub library_root: Option<String>,
    /// Default `tracing` filter when `RUST_LOG` is not set.
    pub log_level: String,
    pub cache: CacheOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: None,
            library_root: None,
            log_level: "info".to_string(),
            cache: CacheOptions::default(),
        }
    }
}

impl Config {
    /// Load the configuration. With no explicit `path`, the platform config
    /// file is used if one exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                if !path.is_file() {
                    exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
                }
                Some(path.to_path_buf())
            },
            None => Self::default_path().ok().filter(|p| p.is_file()),
        };
        tracing::debug!(file = ?file, "Loading configuration");
        Self::extract(Self::figment(file.as_deref(), Env::prefixed(ENV_PREFIX))?)
    }

    fn figment(file: Option<&Path>, env: Env) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(file) = file {
            figment = with_file(figment, file)?;
        }
        Ok(figment.merge(env.split("__")))
    }

    fn extract(figment: Figment) -> Result<Self> {
        figment.extract().or_raise(|| ErrorKind::Invalid)
    }

    /// `config.toml` in the platform configuration directory.
    pub fn default_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join(CONFIG_FILE))
    }

    /// The configured database file, or `cache.db` in the platform data
    /// directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join(DATABASE_FILE)),
        }
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "frkb").ok_or_raise(|| ErrorKind::NoConfigDir)
}

fn with_file(figment: Figment, path: &Path) -> Result<Figment> {
    let extension = path.extension().and_then(OsStr::to_str).map(str::to_ascii_lowercase);
    Ok(match extension.as_deref() {
        Some("toml") => figment.merge(Toml::file(path)),
        Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
        Some("json") => figment.merge(Json::file(path)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
    })
}
