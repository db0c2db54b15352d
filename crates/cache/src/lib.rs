//! SQLite-backed metadata caches for a music library.
//!
//! The cache is never the source of truth: the audio files are. Every entry
//! here can be recomputed (tags re-read, covers re-extracted, waveforms
//! re-decoded), so every public operation is best-effort and failure only
//! ever shows up as a miss.
//!
//! # Keys
//! Rows are keyed by `(list_root, file_path)`. Roots under the database root
//! are stored relative to it, files relative to their root, so a library can
//! be moved wholesale. Older releases wrote absolute and un-normalized keys;
//! reads still find those rows and rewrite them onto the canonical key (see
//! [`frkb_paths::PathResolver`] for the derivation).
//!
//! # Tables
//! - **Songs**: parsed tag metadata (JSON) per file.
//! - **Covers**: content hash of each file's embedded cover art.
//! - **Waveforms**: encoded waveform summaries, in four variants for
//!   different callers (one additionally keyed by target sample rate).

mod codec;
mod context;
mod db;
pub mod error;
mod legacy;
mod lookup;
mod maintenance;
mod meta;
mod models;
mod options;
mod stores;
mod table;

pub use crate::codec::WaveformCodec;
pub use crate::db::Database;
pub use crate::legacy::{LegacyMigrator, Sidecar};
pub use crate::maintenance::{MaintenanceCoordinator, RELATIVE_KEYS_FLAG};
pub use crate::meta::{MemoryMetaStore, MetaStore, SqliteMetaStore};
pub use crate::models::{
    CacheRecord, CoverEntry, FileStat, SongEntry, SongInfo, WaveformEntry, WaveformMeta, merge_entries, merge_info,
};
pub use crate::options::CacheOptions;
pub use crate::stores::{CoverIndex, HiresWaveformStore, SongCache, WaveformStore, waveform_version};
pub use crate::table::{CacheTable, TableCounts};

use crate::context::Shared;
use std::sync::Arc;

/// Outcome of a single-entry read.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    /// Nothing usable is cached (including stale or unreadable rows).
    Miss,
    /// No database is configured; the caller should not expect caching at all.
    Unavailable,
}

impl<T> Lookup<T> {
    pub fn hit(self) -> Option<T> {
        match self {
            Self::Hit(value) => Some(value),
            Self::Miss | Self::Unavailable => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Self::Hit(value) => Lookup::Hit(f(value)),
            Self::Miss => Lookup::Miss,
            Self::Unavailable => Lookup::Unavailable,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Miss, Self::Hit)
    }
}

/// Entry point: owns the process-scoped state and hands out the stores.
///
/// Cheap to clone; every clone and every store shares the same database
/// handle, resolver and in-process caches.
///
/// ```
/// use frkb_cache::{Cache, CacheOptions, Lookup};
///
/// # async fn demo() {
/// let cache = Cache::new(None, CacheOptions::default());
/// assert_eq!(cache.songs().load("/music/library/A", "track.mp3").await, Lookup::Unavailable);
/// # }
/// ```
#[derive(Clone)]
pub struct Cache {
    shared: Arc<Shared>,
}

impl Cache {
    /// A cache over `db`. Without a database every operation returns its
    /// empty result.
    pub fn new(db: Option<Database>, options: CacheOptions) -> Self {
        let meta: Arc<dyn MetaStore> = match &db {
            Some(db) => Arc::new(SqliteMetaStore::from(db)),
            None => Arc::new(MemoryMetaStore::default()),
        };
        Self::with_meta_store(db, options, meta)
    }

    /// Like [`new`](Self::new), with the flag store supplied by the caller.
    pub fn with_meta_store(db: Option<Database>, options: CacheOptions, meta: Arc<dyn MetaStore>) -> Self {
        Self { shared: Arc::new(Shared::new(db, meta, options)) }
    }

    /// Set the database root without scheduling the key migration.
    pub fn with_database_root(self, root: impl Into<String>) -> Self {
        self.shared.set_base(Some(root.into()));
        self
    }

    pub fn options(&self) -> &CacheOptions {
        &self.shared.options
    }

    pub fn database_root(&self) -> Option<String> {
        self.shared.resolver().base().map(str::to_string)
    }

    /// Point key resolution at a new database root.
    ///
    /// Clears the in-process caches and, when running inside a tokio runtime,
    /// schedules [`MaintenanceCoordinator::migrate_keys_to_relative_if_needed`]
    /// after [`CacheOptions::migration_delay`]. A later call (or a cleared
    /// root) cancels a migration that has not started yet.
    pub fn set_database_root(&self, root: Option<String>) {
        self.shared.set_base(root);
        if let Some(previous) = self.shared.replace_pending_migration(None) {
            previous.abort();
        }
        let Some(expected) = self.database_root() else {
            return;
        };
        if !self.shared.is_available() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No async runtime; relative key migration not scheduled");
            return;
        };
        let cache = self.clone();
        let delay = self.shared.options.migration_delay();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if cache.database_root().as_deref() != Some(expected.as_str()) {
                return;
            }
            cache.maintenance().migrate_keys_to_relative_if_needed().await;
        });
        self.shared.replace_pending_migration(Some(task.abort_handle()));
    }

    pub fn songs(&self) -> SongCache {
        SongCache::new(self.shared.clone())
    }

    pub fn covers(&self) -> CoverIndex {
        CoverIndex::new(self.shared.clone())
    }

    /// Store for one of the waveform tables keyed by `(root, file)` only.
    ///
    /// Passing [`CacheTable::MixtapeHiresWaveforms`] (or a non-waveform
    /// table) yields a store whose operations all miss; use
    /// [`hires_waveforms`](Self::hires_waveforms) instead.
    pub fn waveforms(&self, table: CacheTable) -> WaveformStore {
        WaveformStore::new(self.shared.clone(), table)
    }

    pub fn hires_waveforms(&self) -> HiresWaveformStore {
        HiresWaveformStore::new(self.shared.clone())
    }

    pub fn legacy(&self) -> LegacyMigrator {
        LegacyMigrator::new(self.shared.clone())
    }

    pub fn maintenance(&self) -> MaintenanceCoordinator {
        MaintenanceCoordinator::new(self.shared.clone())
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("available", &self.shared.is_available())
            .field("database_root", &self.database_root())
            .finish_non_exhaustive()
    }
}
