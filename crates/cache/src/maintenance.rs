//! Cross-table operations run when the library tree is restructured.

use exn::ResultExt;
use frkb_paths::{PathResolver, PathStyle, ResolvedPath};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::instrument;

use crate::context::Shared;
use crate::error::{ErrorKind, Result, settle};
use crate::lookup::{self, Target};
use crate::models::{KeyRow, SongEntry, SongParams, merge_entries};
use crate::stores::{fetch_song_row, write_song};
use crate::table::{CacheTable, TableCounts};

/// Meta key recording that every eligible absolute root key has been made
/// relative to the database root.
pub const RELATIVE_KEYS_FLAG: &str = "cache_keys_relative_v1";

async fn distinct_roots(conn: &mut SqliteConnection, table: CacheTable) -> Result<Vec<String>> {
    sqlx::query_scalar(&format!("SELECT DISTINCT list_root FROM {}", table.name()))
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)
}

/// Where `file_path` (stored under a root that lived at `old_abs`) belongs
/// once its root is `dest`.
fn relocated_file(
    resolver: &PathResolver,
    old_abs: &str,
    dest: &ResolvedPath,
    file_path: &str,
) -> Option<ResolvedPath> {
    let style = resolver.style();
    match style.strip_base(old_abs, file_path) {
        Some(rest) => resolver.resolve_file(&dest.abs, &style.join(&dest.abs, &rest)),
        None => resolver.resolve_file(&dest.abs, file_path),
    }
}

/// Move one song row onto `(root_key, file.key)`, merging with whatever is
/// already stored there. The destination's populated fields win.
async fn relocate_song(conn: &mut SqliteConnection, row: &KeyRow, root_key: &str, file: &ResolvedPath) -> Result<u64> {
    let Some(source) = fetch_song_row(conn, row.row_id).await? else {
        return Ok(0);
    };
    let Ok(found) = SongEntry::try_from(&source) else {
        // Unreadable payload; carry it over as-is.
        return lookup::relocate(conn, CacheTable::Songs, row.row_id, root_key, &file.key).await;
    };
    let existing = match lookup::find_exact(conn, CacheTable::Songs, root_key, &file.key, None).await? {
        Some(row_id) if row_id != row.row_id => fetch_song_row(conn, row_id).await?,
        _ => None,
    };
    let existing = existing.and_then(|row| SongEntry::try_from(&row).ok());
    let merged = merge_entries(existing.as_ref(), &found, &file.abs);
    write_song(conn, root_key, &file.key, &SongParams::try_from(&merged)?).await?;
    lookup::delete_row(conn, CacheTable::Songs, row.row_id).await?;
    Ok(1)
}

/// Re-key every row of `table` stored under one of `sources` (a root that
/// lived at `old_abs`) onto `dest`. Returns the number of rows moved.
async fn relocate_rows(
    conn: &mut SqliteConnection,
    resolver: &PathResolver,
    table: CacheTable,
    sources: &[String],
    old_abs: &str,
    dest: &ResolvedPath,
) -> Result<u64> {
    if sources.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<Sqlite>::new(format!(
        "SELECT rowid AS row_id, list_root, file_path, {} FROM {} WHERE list_root IN (",
        table.target_rate_column(),
        table.name()
    ));
    let mut separated = query.separated(", ");
    for source in sources {
        separated.push_bind(source.clone());
    }
    query.push(") ORDER BY rowid");
    let rows: Vec<KeyRow> = query.build_query_as().fetch_all(&mut *conn).await.or_raise(|| ErrorKind::Database)?;

    let mut moved = 0;
    for row in &rows {
        let Some(file) = relocated_file(resolver, old_abs, dest, &row.file_path) else {
            tracing::debug!(
                table = table.name(),
                file = %row.file_path,
                "Skipping cache row with an unresolvable file"
            );
            continue;
        };
        if row.list_root == dest.key && row.file_path == file.key {
            continue;
        }
        moved += match table {
            CacheTable::Songs => relocate_song(conn, row, &dest.key, &file).await?,
            _ => lookup::relocate(conn, table, row.row_id, &dest.key, &file.key).await?,
        };
    }
    Ok(moved)
}

/// Absolute roots that can be re-keyed relative to the database root.
fn relative_target(resolver: &PathResolver, root: &str) -> Option<ResolvedPath> {
    if !resolver.style().is_absolute(root) {
        return None;
    }
    resolver.resolve_root(root).filter(|resolved| resolved.is_relative_key && resolved.key != root)
}

/// Maintenance entry points. Each runs as one transaction (one per table for
/// [`prune`](Self::prune)) and clears the in-process lookup caches afterwards.
#[derive(Clone)]
pub struct MaintenanceCoordinator {
    shared: Arc<Shared>,
}

impl MaintenanceCoordinator {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn clear_process_caches(&self) {
        self.shared.clear_process_caches();
    }

    /// Re-key everything stored under `old_root` (and its older key forms)
    /// onto `new_root`, across all tables. Returns rows moved per table; all
    /// zeros when both resolve to the same key or on failure.
    #[instrument(skip(self))]
    pub async fn rename_root(&self, old_root: &str, new_root: &str) -> TableCounts {
        settle("rename root", self.try_rename_root(old_root, new_root).await, TableCounts::default)
    }

    async fn try_rename_root(&self, old_root: &str, new_root: &str) -> Result<TableCounts> {
        let old = self.shared.resolve_root(old_root)?;
        let new = self.shared.resolve_root(new_root)?;
        if old.key == new.key {
            return Ok(TableCounts::default());
        }
        let resolver = self.shared.resolver();
        let sources: Vec<String> = Target::keys_of(&old).into_iter().filter(|key| *key != new.key).collect();
        let mut counts = TableCounts::default();
        let mut tx = self.shared.db()?.begin().await?;
        for table in CacheTable::ALL {
            counts.add(table, relocate_rows(&mut tx, &resolver, table, &sources, &old.abs, &new).await?);
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        self.clear_process_caches();
        tracing::info!(from = %old.key, to = %new.key, moved = counts.total(), "Renamed cache root");
        Ok(counts)
    }

    /// Delete every row whose root is not one of `keep_roots`, compared in
    /// normalized form against each root's key forms (so case-insensitively
    /// only under [`PathStyle::Windows`]). Returns rows removed per table; a
    /// table that fails counts zero and the rest proceed.
    #[instrument(skip_all)]
    pub async fn prune<I, S>(&self, keep_roots: I) -> TableCounts
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let resolver = self.shared.resolver();
        let style = resolver.style();
        let mut keep = HashSet::new();
        for root in keep_roots {
            let root = root.as_ref();
            if let Some(resolved) = resolver.resolve_root(root) {
                let forms = [Some(root), Some(resolved.abs.as_str()), Some(resolved.key.as_str())];
                let older = [resolved.key_raw.as_deref(), resolved.legacy_abs.as_deref()];
                keep.extend(forms.into_iter().chain(older).flatten().map(|form| style.normalize(form)));
            }
        }
        let mut counts = TableCounts::default();
        for table in CacheTable::ALL {
            let removed = settle("prune", self.prune_table(table, style, &keep).await, || 0);
            counts.add(table, removed);
        }
        self.clear_process_caches();
        tracing::info!(removed = counts.total(), kept = keep.len(), "Pruned cache roots");
        counts
    }

    async fn prune_table(&self, table: CacheTable, style: PathStyle, keep: &HashSet<String>) -> Result<u64> {
        let mut tx = self.shared.db()?.begin().await?;
        let doomed: Vec<String> = distinct_roots(&mut tx, table)
            .await?
            .into_iter()
            .filter(|root| !keep.contains(&style.normalize(root)))
            .collect();
        let removed = lookup::delete_roots(&mut tx, table, &doomed).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        if removed > 0 {
            tracing::debug!(table = table.name(), roots = doomed.len(), removed, "Pruned cache table");
        }
        Ok(removed)
    }

    /// One-shot upgrade of absolute root keys to keys relative to the database
    /// root, gated by [`RELATIVE_KEYS_FLAG`] in the meta store.
    ///
    /// Does nothing until a database root is known. The flag is only set once
    /// no eligible absolute root remains, so an interrupted run is retried on
    /// the next launch.
    #[instrument(skip(self))]
    pub async fn migrate_keys_to_relative_if_needed(&self) -> TableCounts {
        settle("migrate keys", self.try_migrate_keys().await, TableCounts::default)
    }

    async fn try_migrate_keys(&self) -> Result<TableCounts> {
        let db = self.shared.db()?;
        let resolver = self.shared.resolver();
        if resolver.base().is_none() {
            tracing::debug!("Database root unknown; relative key migration deferred");
            return Ok(TableCounts::default());
        }
        if self.shared.meta.get_meta_value(RELATIVE_KEYS_FLAG).await?.is_some() {
            return Ok(TableCounts::default());
        }

        let mut counts = TableCounts::default();
        let mut tx = db.begin().await?;
        for table in CacheTable::ALL {
            for root in distinct_roots(&mut tx, table).await? {
                let Some(dest) = relative_target(&resolver, &root) else {
                    continue;
                };
                let moved = relocate_rows(&mut tx, &resolver, table, std::slice::from_ref(&root), &root, &dest).await?;
                counts.add(table, moved);
            }
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        self.clear_process_caches();

        let mut remaining = 0;
        let mut conn = db.acquire().await?;
        for table in CacheTable::ALL {
            let roots = distinct_roots(&mut conn, table).await?;
            remaining += roots.iter().filter(|root| relative_target(&resolver, root).is_some()).count();
        }
        drop(conn);
        if remaining == 0 {
            self.shared.meta.set_meta_value(RELATIVE_KEYS_FLAG, "1").await?;
        }
        tracing::info!(moved = counts.total(), remaining, "Relative key migration finished");
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemoryMetaStore;
    use crate::{Cache, CacheOptions, Database, MetaStore};
    use serde_json::json;

    async fn cache(style: PathStyle, base: &str) -> (Database, Cache) {
        let db = Database::connect_in_memory().await.unwrap();
        let options = CacheOptions { path_style: style, ..CacheOptions::default() };
        let cache = Cache::new(Some(db.clone()), options).with_database_root(base);
        (db, cache)
    }

    async fn insert(db: &Database, table: CacheTable, root: &str, file: &str) {
        let sql = match table {
            CacheTable::Songs => {
                "INSERT INTO song_cache (list_root, file_path, size, mtime_ms, info_json)
                 VALUES (?, ?, 1, 1, '{}')"
                    .to_string()
            },
            CacheTable::Covers => {
                "INSERT INTO cover_index (list_root, file_path, hash, ext) VALUES (?, ?, 'h', '.jpg')".to_string()
            },
            CacheTable::MixtapeHiresWaveforms => "INSERT INTO mixtape_waveform_hires_cache
                 (list_root, file_path, target_rate, size, mtime_ms, version, sample_rate, step, duration, frames, data)
                 VALUES (?, ?, 4000, 1, 1, 1, 1, 1.0, 1.0, 1, x'00')"
                .to_string(),
            _ => format!(
                "INSERT INTO {}
                     (list_root, file_path, size, mtime_ms, version, sample_rate, step, duration, frames, data)
                 VALUES (?, ?, 1, 1, 1, 1, 1.0, 1.0, 1, x'00')",
                table.name()
            ),
        };
        sqlx::query(&sql).bind(root).bind(file).execute(db.pool()).await.unwrap();
    }

    async fn keys(db: &Database, table: CacheTable) -> Vec<(String, String)> {
        sqlx::query_as(&format!("SELECT list_root, file_path FROM {} ORDER BY list_root, file_path", table.name()))
            .fetch_all(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rename_same_root_is_noop() {
        let (db, cache) = cache(PathStyle::Windows, "C:\\FRKB").await;
        insert(&db, CacheTable::Covers, "library\\a", "x.mp3").await;
        let counts = cache.maintenance().rename_root("C:\\FRKB\\Library\\A", "library/a/").await;
        assert_eq!(counts, TableCounts::default());
        assert_eq!(keys(&db, CacheTable::Covers).await, vec![("library\\a".into(), "x.mp3".into())]);
    }

    #[tokio::test]
    async fn test_rename_moves_all_tables_and_legacy_rows() {
        let (db, cache) = cache(PathStyle::Windows, "C:\\FRKB").await;
        for table in CacheTable::ALL {
            insert(&db, table, "library\\a", "x.mp3").await;
        }
        insert(&db, CacheTable::Covers, "c:\\frkb\\library\\a", "c:\\frkb\\library\\a\\sub\\y.mp3").await;
        let counts = cache.maintenance().rename_root("C:\\FRKB\\library\\A", "C:\\FRKB\\library\\B").await;
        assert_eq!(counts.covers, 2);
        assert_eq!(counts.total(), 7);
        assert_eq!(
            keys(&db, CacheTable::Covers).await,
            vec![("library\\b".into(), "sub\\y.mp3".into()), ("library\\b".into(), "x.mp3".into())]
        );
        assert_eq!(keys(&db, CacheTable::MixtapeHiresWaveforms).await, vec![("library\\b".into(), "x.mp3".into())]);
    }

    #[tokio::test]
    async fn test_rename_merges_song_payloads() {
        let (db, cache) = cache(PathStyle::Posix, "/srv/frkb").await;
        let songs = cache.songs();
        let source = SongEntry { size: 1, mtime_ms: 1, info: serde_json::from_value(json!({"key": "8A"})).unwrap() };
        let dest = SongEntry { size: 2, mtime_ms: 2, info: serde_json::from_value(json!({"bpm": 128})).unwrap() };
        assert!(songs.upsert("library/A", "x.mp3", &source, None).await);
        assert!(songs.upsert("library/B", "x.mp3", &dest, None).await);
        let counts = cache.maintenance().rename_root("library/A", "library/B").await;
        assert_eq!(counts.songs, 1);
        let merged = songs.load("library/B", "x.mp3").await.hit().unwrap();
        assert_eq!(merged.info.key.as_deref(), Some("8A"));
        assert_eq!(merged.info.bpm, Some(128.0));
        assert_eq!(merged.info.file_path.as_deref(), Some("/srv/frkb/library/B/x.mp3"));
        assert_eq!(merged.size, 2);
        assert_eq!(keys(&db, CacheTable::Songs).await, vec![("library/B".into(), "x.mp3".into())]);
    }

    #[tokio::test]
    async fn test_prune_keeps_loose_matches() {
        let (db, cache) = cache(PathStyle::Windows, "C:\\FRKB").await;
        insert(&db, CacheTable::Covers, "library\\keep", "a").await;
        insert(&db, CacheTable::Covers, "C:/FRKB/Library/Keep", "b").await;
        insert(&db, CacheTable::Covers, "library\\gone", "c").await;
        insert(&db, CacheTable::Waveforms, "library\\gone", "c").await;
        let counts = cache.maintenance().prune(["C:\\FRKB\\Library\\Keep"]).await;
        assert_eq!((counts.covers, counts.waveforms, counts.total()), (1, 1, 2));
        assert_eq!(keys(&db, CacheTable::Covers).await.len(), 2);
    }

    #[tokio::test]
    async fn test_prune_is_case_sensitive_on_posix() {
        let (db, cache) = cache(PathStyle::Posix, "/srv/frkb").await;
        insert(&db, CacheTable::Covers, "library/A", "a").await;
        insert(&db, CacheTable::Covers, "/srv/frkb/library/A/", "b").await;
        insert(&db, CacheTable::Covers, "library/a", "c").await;
        let counts = cache.maintenance().prune(["library/A"]).await;
        assert_eq!(counts.covers, 1);
        let roots: Vec<String> = keys(&db, CacheTable::Covers).await.into_iter().map(|(root, _)| root).collect();
        assert!(!roots.contains(&"library/a".to_string()));
        assert_eq!(roots.len(), 2);
    }

    #[tokio::test]
    async fn test_migrate_keys_is_flag_gated() {
        let db = Database::connect_in_memory().await.unwrap();
        let meta = Arc::new(MemoryMetaStore::default());
        let options = CacheOptions { path_style: PathStyle::Posix, ..CacheOptions::default() };
        let cache = Cache::with_meta_store(Some(db.clone()), options, meta.clone());

        insert(&db, CacheTable::Songs, "/srv/frkb/library/A", "/srv/frkb/library/A/x.mp3").await;
        insert(&db, CacheTable::Covers, "/mnt/old/library/B", "y.mp3").await;
        insert(&db, CacheTable::Covers, "/elsewhere/C", "/elsewhere/C/z.mp3").await;

        // No database root yet.
        assert_eq!(cache.maintenance().migrate_keys_to_relative_if_needed().await, TableCounts::default());
        assert_eq!(meta.get_meta_value(RELATIVE_KEYS_FLAG).await.unwrap(), None);

        let cache = cache.with_database_root("/srv/frkb");
        let counts = cache.maintenance().migrate_keys_to_relative_if_needed().await;
        assert_eq!((counts.songs, counts.covers), (1, 1));
        assert_eq!(keys(&db, CacheTable::Songs).await, vec![("library/A".into(), "x.mp3".into())]);
        assert_eq!(
            keys(&db, CacheTable::Covers).await,
            vec![("/elsewhere/C".into(), "/elsewhere/C/z.mp3".into()), ("library/B".into(), "y.mp3".into())]
        );
        assert_eq!(meta.get_meta_value(RELATIVE_KEYS_FLAG).await.unwrap().as_deref(), Some("1"));

        insert(&db, CacheTable::Covers, "/srv/frkb/library/D", "w.mp3").await;
        assert_eq!(cache.maintenance().migrate_keys_to_relative_if_needed().await, TableCounts::default());
    }

    #[test]
    fn test_relocated_file() {
        let resolver = PathResolver::new(Some("C:\\FRKB".into()), PathStyle::Windows);
        let dest = resolver.resolve_root("C:\\FRKB\\library\\B").unwrap();
        let moved =
            relocated_file(&resolver, "C:\\FRKB\\library\\A", &dest, "c:\\frkb\\library\\a\\Sub\\X.mp3").unwrap();
        assert_eq!((moved.key.as_str(), moved.abs.as_str()), ("sub\\x.mp3", "C:\\FRKB\\library\\B\\Sub\\X.mp3"));
        let kept = relocated_file(&resolver, "C:\\FRKB\\library\\A", &dest, "D:\\Other\\y.mp3").unwrap();
        assert_eq!(kept.key, "d:\\other\\y.mp3");
        let relative = relocated_file(&resolver, "C:\\FRKB\\library\\A", &dest, "z.mp3").unwrap();
        assert_eq!(relative.abs, "C:\\FRKB\\library\\B\\z.mp3");
    }
}
