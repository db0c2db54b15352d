use exn::ResultExt;
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::Shared;
use crate::error::{ErrorKind, Result, settle};
use crate::legacy::Sidecar;
use crate::lookup::{self, Target};
use crate::models::{CacheRecord, CoverEntry, CoverRow};
use crate::stores::{clear_root, import_legacy, remove_files};
use crate::table::CacheTable;
use crate::Lookup;

const TABLE: CacheTable = CacheTable::Covers;
const COLUMNS: &str = "rowid AS row_id, list_root, file_path, hash, ext";

pub(crate) async fn write_cover(
    conn: &mut SqliteConnection,
    root_key: &str,
    file_key: &str,
    hash: &str,
    ext: &str,
) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO cover_index (list_root, file_path, hash, ext) VALUES (?, ?, ?, ?)")
        .bind(root_key)
        .bind(file_key)
        .bind(hash)
        .bind(ext)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// Content hash of each song's embedded cover art.
///
/// Cover images themselves live on disk, named by hash; this index maps files
/// to those images so identical artwork is only stored once.
#[derive(Clone)]
pub struct CoverIndex {
    shared: Arc<Shared>,
}

impl CoverIndex {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub async fn load(&self, root: &str, file: &str) -> Lookup<CoverEntry> {
        if !self.shared.is_available() {
            return Lookup::Unavailable;
        }
        settle("load cover", self.try_load(root, file).await, || None).into()
    }

    async fn try_load(&self, root: &str, file: &str) -> Result<Option<CoverEntry>> {
        let db = self.shared.db()?;
        let target = Target::resolve(&self.shared, root, file, None)?;
        import_legacy(&self.shared, Sidecar::Covers, &target.root).await;
        let mut conn = db.acquire().await?;
        let Some(row_id) = lookup::locate(&mut conn, &self.shared, TABLE, &target).await? else {
            return Ok(None);
        };
        let row: Option<CoverRow> = sqlx::query_as(&format!("SELECT {COLUMNS} FROM cover_index WHERE rowid = ?"))
            .bind(row_id)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(|row| row.into_entry(target.file.abs)))
    }

    /// Every cover entry for `root`; canonical rows win over older rows for the
    /// same file.
    pub async fn load_all(&self, root: &str) -> Option<Vec<CacheRecord<CoverEntry>>> {
        settle("load all covers", self.try_load_all(root).await.map(Some), || None)
    }

    async fn try_load_all(&self, root: &str) -> Result<Vec<CacheRecord<CoverEntry>>> {
        let db = self.shared.db()?;
        let resolved = self.shared.resolve_root(root)?;
        import_legacy(&self.shared, Sidecar::Covers, &resolved).await;
        let resolver = self.shared.resolver();
        let mut records = BTreeMap::new();
        let mut conn = db.acquire().await?;
        for root_key in Target::keys_of(&resolved) {
            let rows: Vec<CoverRow> = sqlx::query_as(&format!("SELECT {COLUMNS} FROM cover_index WHERE list_root = ?"))
                .bind(&root_key)
                .fetch_all(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
            for row in rows {
                let Some(file) = resolver.resolve_file(&resolved.abs, &row.file_path) else {
                    continue;
                };
                records.entry(file.key.clone()).or_insert_with(|| CacheRecord {
                    entry: row.into_entry(file.abs.clone()),
                    file_key: file.key,
                    path: file.abs,
                });
            }
        }
        Ok(records.into_values().collect())
    }

    /// Absolute paths of every file in `root` whose cover has `hash`, sorted.
    /// Empty means the image file for `hash` is no longer referenced.
    pub async fn files_for_hash(&self, root: &str, hash: &str) -> Option<Vec<String>> {
        let records = self.load_all(root).await?;
        Some(records.into_iter().filter(|r| r.entry.hash == hash).map(|r| r.path).collect())
    }

    /// Record that `file`'s cover has `hash` and is stored with extension `ext`.
    pub async fn upsert(&self, root: &str, file: &str, hash: &str, ext: &str, old_file: Option<&str>) -> bool {
        settle("upsert cover", self.try_upsert(root, file, hash, ext, old_file).await.map(|_| true), || false)
    }

    async fn try_upsert(&self, root: &str, file: &str, hash: &str, ext: &str, old_file: Option<&str>) -> Result<()> {
        let db = self.shared.db()?;
        let target = Target::resolve(&self.shared, root, file, None)?;
        import_legacy(&self.shared, Sidecar::Covers, &target.root).await;
        let mut tx = db.begin().await?;
        if let Some(old_file) = old_file {
            let old = Target::within(target.root.clone(), root, old_file, &self.shared, None)?;
            lookup::delete_identity(&mut tx, TABLE, &old).await?;
        }
        lookup::delete_identity(&mut tx, TABLE, &target).await?;
        write_cover(&mut tx, &target.root.key, &target.file.key, hash, ext).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    pub async fn remove(&self, root: &str, file: &str) -> bool {
        self.remove_all(root, [file]).await
    }

    pub async fn remove_all<I, S>(&self, root: &str, files: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let files: Vec<S> = files.into_iter().collect();
        let result = remove_files(&self.shared, TABLE, root, files.iter().map(AsRef::as_ref)).await;
        settle("remove covers", result.map(|_| true), || false)
    }

    pub async fn clear(&self, root: &str) -> bool {
        settle("clear covers", clear_root(&self.shared, TABLE, root).await.map(|_| true), || false)
    }
}
