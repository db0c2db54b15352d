//! One store per cache table family.
//!
//! Every public method settles internal errors into its empty result; the
//! `try_*` counterparts carry the actual logic.

mod cover;
mod song;
mod waveform;

pub use self::cover::CoverIndex;
pub(crate) use self::cover::write_cover;
pub use self::song::SongCache;
pub(crate) use self::song::{fetch_song_row, write_song};
pub use self::waveform::{HiresWaveformStore, WaveformStore, waveform_version};

use exn::ResultExt;
use frkb_paths::ResolvedPath;

use crate::context::Shared;
use crate::error::{ErrorKind, Result};
use crate::legacy::{self, Sidecar};
use crate::lookup::{self, Target};
use crate::table::CacheTable;

/// Import a root's legacy sidecar before serving it. Failure only costs the
/// import, never the operation that triggered it.
pub(crate) async fn import_legacy(shared: &Shared, sidecar: Sidecar, root: &ResolvedPath) {
    if let Err(err) = legacy::ensure_migrated(shared, sidecar, root).await {
        tracing::warn!(root = %root.key, sidecar = ?sidecar, error = ?err, "Legacy cache import failed; will retry");
    }
}

/// Delete `files` from `root` in one transaction: canonical, exact older key
/// forms, and anything a loose lookup would otherwise bring back.
pub(crate) async fn remove_files<'a>(
    shared: &Shared,
    table: CacheTable,
    root: &str,
    files: impl Iterator<Item = &'a str>,
) -> Result<u64> {
    let db = shared.db()?;
    let resolved = shared.resolve_root(root)?;
    let targets = files
        .map(|file| Target::within(resolved.clone(), root, file, shared, None))
        .collect::<Result<Vec<_>>>()?;
    let mut tx = db.begin().await?;
    let mut removed = 0;
    for target in &targets {
        removed += lookup::delete_identity(&mut tx, table, target).await?;
        removed += lookup::delete_loose(&mut tx, shared, table, target).await?;
    }
    tx.commit().await.or_raise(|| ErrorKind::Database)?;
    Ok(removed)
}

/// Delete every row under `root`'s keys and under any root loosely equal to it.
pub(crate) async fn clear_root(shared: &Shared, table: CacheTable, root: &str) -> Result<u64> {
    let db = shared.db()?;
    let resolved = shared.resolve_root(root)?;
    let mut tx = db.begin().await?;
    let mut keys = Target::keys_of(&resolved);
    for loose in lookup::loose_roots(&mut tx, shared, table, &resolved, root).await? {
        if !keys.contains(&loose) {
            keys.push(loose);
        }
    }
    let removed = lookup::delete_roots(&mut tx, table, &keys).await?;
    tx.commit().await.or_raise(|| ErrorKind::Database)?;
    tracing::debug!(table = table.name(), root = %resolved.key, removed, "Cleared cache root");
    Ok(removed)
}
