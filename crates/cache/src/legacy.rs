//! One-time import of the per-directory JSON caches that predate the database.
//!
//! A root is imported at most once: the in-process visited set stops repeat
//! attempts within a run, and any existing row for the root stops them across
//! runs. A sidecar that exists but can't be read or parsed leaves the root
//! unvisited, so the next access retries.

use exn::ResultExt;
use frkb_paths::ResolvedPath;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::instrument;

use crate::context::Shared;
use crate::error::{ErrorKind, Result, settle};
use crate::lookup::{self, Target};
use crate::models::{SongEntry, SongInfo, SongParams};
use crate::stores::{write_cover, write_song};
use crate::table::CacheTable;

/// Extension assumed for covers whose hash has no recorded extension.
const DEFAULT_COVER_EXT: &str = ".jpg";

/// A legacy sidecar format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sidecar {
    /// `<root>/.songs.cache.json`
    Songs,
    /// `<root>/.frkb_covers/.index.json`
    Covers,
}

impl Sidecar {
    pub fn table(self) -> CacheTable {
        match self {
            Self::Songs => CacheTable::Songs,
            Self::Covers => CacheTable::Covers,
        }
    }

    /// Location relative to the root directory.
    pub fn relative_path(self) -> &'static str {
        match self {
            Self::Songs => ".songs.cache.json",
            Self::Covers => ".frkb_covers/.index.json",
        }
    }
}

#[derive(Debug, Deserialize)]
struct SongSidecar {
    #[serde(default)]
    entries: HashMap<String, SongSidecarEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SongSidecarEntry {
    #[serde(default)]
    size: Option<f64>,
    #[serde(default)]
    mtime_ms: Option<f64>,
    #[serde(default)]
    info: Option<SongInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoverSidecar {
    #[serde(default)]
    file_to_hash: HashMap<String, String>,
    #[serde(default)]
    hash_to_ext: HashMap<String, String>,
}

/// JSON numbers in the sidecars were written by a float-only runtime.
fn sidecar_int(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 { value as u64 } else { 0 }
}

fn cover_ext(ext: Option<&String>) -> String {
    match ext.map(|e| e.trim()).filter(|e| !e.is_empty()) {
        Some(ext) if ext.starts_with('.') => ext.to_string(),
        Some(ext) => format!(".{ext}"),
        None => DEFAULT_COVER_EXT.to_string(),
    }
}

/// Import `root`'s sidecar for `sidecar` if it has not been dealt with yet.
/// Returns the number of rows written.
pub(crate) async fn ensure_migrated(shared: &Shared, sidecar: Sidecar, root: &ResolvedPath) -> Result<u64> {
    let table = sidecar.table();
    if shared.is_migrated(table, &root.key) {
        return Ok(0);
    }
    let db = shared.db()?;
    let has_rows = {
        let mut conn = db.acquire().await?;
        lookup::root_has_rows(&mut conn, table, &Target::keys_of(root)).await?
    };
    let style = shared.resolver().style();
    if has_rows || !style.is_absolute(&root.abs) {
        shared.mark_migrated(table, &root.key);
        return Ok(0);
    }

    let path = PathBuf::from(style.join(&root.abs, sidecar.relative_path()));
    let bytes = match tokio::fs::read(&path).await {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            shared.mark_migrated(table, &root.key);
            return Ok(0);
        },
        result => result.or_raise(|| ErrorKind::Io(path.clone()))?,
    };
    let imported = match sidecar {
        Sidecar::Songs => import_songs(shared, root, &bytes).await?,
        Sidecar::Covers => import_covers(shared, root, &bytes).await?,
    };
    shared.mark_migrated(table, &root.key);
    tracing::info!(
        table = table.name(),
        root = %root.key,
        path = %path.display(),
        imported,
        "Imported legacy cache sidecar"
    );
    Ok(imported)
}

async fn import_songs(shared: &Shared, root: &ResolvedPath, bytes: &[u8]) -> Result<u64> {
    let sidecar: SongSidecar = serde_json::from_slice(bytes).or_raise(|| ErrorKind::MalformedPayload("songs sidecar"))?;
    let resolver = shared.resolver();
    let mut rows = Vec::with_capacity(sidecar.entries.len());
    for (file, entry) in sidecar.entries {
        let Some(resolved) = resolver.resolve_file(&root.abs, &file) else {
            continue;
        };
        let entry = SongEntry {
            size: entry.size.map_or(0, sidecar_int),
            mtime_ms: entry.mtime_ms.map_or(0, sidecar_int),
            info: entry.info.unwrap_or_default(),
        }
        .with_file_path(&resolved.abs);
        rows.push((resolved.key, SongParams::try_from(&entry)?));
    }
    let mut tx = shared.db()?.begin().await?;
    for (file_key, params) in &rows {
        write_song(&mut tx, &root.key, file_key, params).await?;
    }
    tx.commit().await.or_raise(|| ErrorKind::Database)?;
    Ok(rows.len() as u64)
}

async fn import_covers(shared: &Shared, root: &ResolvedPath, bytes: &[u8]) -> Result<u64> {
    let sidecar: CoverSidecar =
        serde_json::from_slice(bytes).or_raise(|| ErrorKind::MalformedPayload("covers sidecar"))?;
    let resolver = shared.resolver();
    let mut tx = shared.db()?.begin().await?;
    let mut imported = 0;
    for (file, hash) in &sidecar.file_to_hash {
        let Some(resolved) = resolver.resolve_file(&root.abs, file) else {
            continue;
        };
        let ext = cover_ext(sidecar.hash_to_ext.get(hash));
        write_cover(&mut tx, &root.key, &resolved.key, hash, &ext).await?;
        imported += 1;
    }
    tx.commit().await.or_raise(|| ErrorKind::Database)?;
    Ok(imported)
}

/// Public handle on the sidecar import, for callers that want to import a
/// root ahead of its first lookup.
#[derive(Clone)]
pub struct LegacyMigrator {
    shared: Arc<Shared>,
}

impl LegacyMigrator {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Import `root`'s sidecar if needed; returns the number of rows written
    /// (zero when already migrated, absent, or on failure).
    #[instrument(skip(self))]
    pub async fn ensure_migrated(&self, sidecar: Sidecar, root: &str) -> u64 {
        let result = async {
            let resolved = self.shared.resolve_root(root)?;
            ensure_migrated(&self.shared, sidecar, &resolved).await
        };
        settle("legacy import", result.await, || 0)
    }
}
