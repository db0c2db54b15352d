use exn::ResultExt;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use crate::context::Shared;
use crate::error::{ErrorKind, Result, settle};
use crate::legacy::Sidecar;
use crate::lookup::{self, Target};
use crate::models::{CacheRecord, SongEntry, SongParams, SongRow, merge_entries};
use crate::stores::{clear_root, import_legacy, remove_files};
use crate::table::CacheTable;
use crate::Lookup;

const TABLE: CacheTable = CacheTable::Songs;
const COLUMNS: &str = "rowid AS row_id, list_root, file_path, size, mtime_ms, info_json";

pub(crate) async fn fetch_song_row(conn: &mut SqliteConnection, row_id: i64) -> Result<Option<SongRow>> {
    sqlx::query_as(&format!("SELECT {COLUMNS} FROM song_cache WHERE rowid = ?"))
        .bind(row_id)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)
}

pub(crate) async fn write_song(
    conn: &mut SqliteConnection,
    root_key: &str,
    file_key: &str,
    params: &SongParams,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO song_cache (list_root, file_path, size, mtime_ms, info_json) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(root_key)
    .bind(file_key)
    .bind(params.size)
    .bind(params.mtime_ms)
    .bind(&params.info_json)
    .execute(&mut *conn)
    .await
    .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// Parse a stored row, treating an unreadable payload as absent.
fn parse_row(row: &SongRow) -> Option<SongEntry> {
    match SongEntry::try_from(row) {
        Ok(entry) => Some(entry),
        Err(err) => {
            tracing::debug!(
                root = %row.list_root,
                file = %row.file_path,
                error = ?err,
                "Ignoring unreadable song cache row"
            );
            None
        },
    }
}

/// Last-resort match on the absolute path embedded in the payload, for rows
/// whose root key no longer resembles the root at all.
async fn find_by_payload_path(conn: &mut SqliteConnection, target: &Target) -> Result<Option<i64>> {
    let mut paths = vec![frkb_paths::PathStyle::loose(&target.file.abs)];
    if let Some(legacy) = &target.file.legacy_abs {
        let legacy = frkb_paths::PathStyle::loose(legacy);
        if !paths.contains(&legacy) {
            paths.push(legacy);
        }
    }
    let mut query = QueryBuilder::<Sqlite>::new(
        r"SELECT rowid FROM song_cache
          WHERE lower(replace(
              CASE WHEN json_valid(info_json) THEN json_extract(info_json, '$.filePath') END, '/', '\'
          )) IN (",
    );
    let mut separated = query.separated(", ");
    for path in paths {
        separated.push_bind(path);
    }
    query
        .push(") AND NOT (list_root = ")
        .push_bind(target.root.key.clone())
        .push(" AND file_path = ")
        .push_bind(target.file.key.clone())
        .push(") ORDER BY rowid DESC LIMIT 1");
    query.build_query_scalar::<i64>().fetch_optional(&mut *conn).await.or_raise(|| ErrorKind::Database)
}

/// Cached tag metadata, one JSON document per song.
#[derive(Clone)]
pub struct SongCache {
    shared: Arc<Shared>,
}

impl SongCache {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Cached metadata for `file` in `root`, with `info.filePath` set to the
    /// file's current absolute path.
    ///
    /// A canonical entry missing its key or BPM is completed from any older
    /// row for the same file; that row is then folded into the canonical one.
    pub async fn load(&self, root: &str, file: &str) -> Lookup<SongEntry> {
        if !self.shared.is_available() {
            return Lookup::Unavailable;
        }
        settle("load song", self.try_load(root, file).await, || None).into()
    }

    async fn try_load(&self, root: &str, file: &str) -> Result<Option<SongEntry>> {
        let db = self.shared.db()?;
        let target = Target::resolve(&self.shared, root, file, None)?;
        import_legacy(&self.shared, Sidecar::Songs, &target.root).await;

        let mut conn = db.acquire().await?;
        let canonical = match lookup::find_canonical(&mut conn, TABLE, &target).await? {
            Some(row_id) => fetch_song_row(&mut conn, row_id).await?.as_ref().and_then(parse_row),
            None => None,
        };
        if let Some(entry) = &canonical
            && entry.info.is_complete()
        {
            return Ok(Some(entry.clone().with_file_path(&target.file.abs)));
        }
        // The payload scan reads every row; only worth it when nothing at all
        // is stored for this file.
        let found = match lookup::find_fallback(&mut conn, &self.shared, TABLE, &target).await? {
            Some(row_id) => Some(row_id),
            None if canonical.is_none() => find_by_payload_path(&mut conn, &target).await?,
            None => None,
        };
        drop(conn);
        let Some(found) = found else {
            return Ok(canonical.map(|entry| entry.with_file_path(&target.file.abs)));
        };

        let mut tx = db.begin().await?;
        let found_entry = fetch_song_row(&mut tx, found).await?.as_ref().and_then(parse_row);
        let Some(found_entry) = found_entry else {
            return Ok(canonical.map(|entry| entry.with_file_path(&target.file.abs)));
        };
        let merged = merge_entries(canonical.as_ref(), &found_entry, &target.file.abs);
        write_song(&mut tx, &target.root.key, &target.file.key, &SongParams::try_from(&merged)?).await?;
        lookup::delete_row(&mut tx, TABLE, found).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        tracing::debug!(
            root = %target.root.key,
            file = %target.file.key,
            "Merged older song cache row into canonical key"
        );
        Ok(Some(merged))
    }

    /// Every entry cached for `root`, including rows still stored under one of
    /// its older keys. `None` on failure.
    ///
    /// Rows under the canonical key win over older rows for the same file.
    pub async fn load_all(&self, root: &str) -> Option<Vec<CacheRecord<SongEntry>>> {
        settle("load all songs", self.try_load_all(root).await.map(Some), || None)
    }

    async fn try_load_all(&self, root: &str) -> Result<Vec<CacheRecord<SongEntry>>> {
        let db = self.shared.db()?;
        let resolved = self.shared.resolve_root(root)?;
        import_legacy(&self.shared, Sidecar::Songs, &resolved).await;
        let resolver = self.shared.resolver();
        let mut records: BTreeMap<String, CacheRecord<SongEntry>> = BTreeMap::new();
        let mut conn = db.acquire().await?;
        for root_key in Target::keys_of(&resolved) {
            let rows: Vec<SongRow> = sqlx::query_as(&format!("SELECT {COLUMNS} FROM song_cache WHERE list_root = ?"))
                .bind(&root_key)
                .fetch_all(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
            for row in rows {
                let (Some(file), Some(entry)) = (resolver.resolve_file(&resolved.abs, &row.file_path), parse_row(&row))
                else {
                    continue;
                };
                records.entry(file.key.clone()).or_insert_with(|| CacheRecord {
                    entry: entry.with_file_path(&file.abs),
                    file_key: file.key,
                    path: file.abs,
                });
            }
        }
        Ok(records.into_values().collect())
    }

    // =========================================================================
    // Write
    // =========================================================================

    /// Store `entry` for `file`, replacing any older row for the same file.
    /// `old_file` (a previous name of the same file) is removed as well.
    pub async fn upsert(&self, root: &str, file: &str, entry: &SongEntry, old_file: Option<&str>) -> bool {
        settle("upsert song", self.try_upsert(root, file, entry, old_file).await.map(|_| true), || false)
    }

    async fn try_upsert(&self, root: &str, file: &str, entry: &SongEntry, old_file: Option<&str>) -> Result<()> {
        let db = self.shared.db()?;
        let target = Target::resolve(&self.shared, root, file, None)?;
        import_legacy(&self.shared, Sidecar::Songs, &target.root).await;
        let entry = entry.clone().with_file_path(&target.file.abs);
        let params = SongParams::try_from(&entry)?;

        let mut tx = db.begin().await?;
        if let Some(old_file) = old_file {
            let old = Target::within(target.root.clone(), root, old_file, &self.shared, None)?;
            lookup::delete_identity(&mut tx, TABLE, &old).await?;
        }
        lookup::delete_identity(&mut tx, TABLE, &target).await?;
        write_song(&mut tx, &target.root.key, &target.file.key, &params).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    pub async fn remove(&self, root: &str, file: &str) -> bool {
        self.remove_all(root, [file]).await
    }

    /// Remove several files of one root in a single transaction.
    pub async fn remove_all<I, S>(&self, root: &str, files: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let files: Vec<S> = files.into_iter().collect();
        let result = remove_files(&self.shared, TABLE, root, files.iter().map(AsRef::as_ref)).await;
        settle("remove songs", result.map(|_| true), || false)
    }

    /// Drop every row stored for `root`, under any of its keys.
    #[instrument(skip(self))]
    pub async fn clear(&self, root: &str) -> bool {
        settle("clear songs", clear_root(&self.shared, TABLE, root).await.map(|_| true), || false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SongInfo;
    use crate::{Cache, CacheOptions, Database};
    use frkb_paths::PathStyle;
    use serde_json::json;

    async fn cache() -> (Database, Cache) {
        let db = Database::connect_in_memory().await.unwrap();
        let options = CacheOptions { path_style: PathStyle::Posix, ..CacheOptions::default() };
        let cache = Cache::new(Some(db.clone()), options).with_database_root("/srv/frkb");
        (db, cache)
    }

    fn entry(info: serde_json::Value) -> SongEntry {
        SongEntry { size: 10, mtime_ms: 20, info: serde_json::from_value(info).unwrap() }
    }

    async fn insert(db: &Database, root: &str, file: &str, info: serde_json::Value) {
        sqlx::query("INSERT INTO song_cache (list_root, file_path, size, mtime_ms, info_json) VALUES (?, ?, 1, 2, ?)")
            .bind(root)
            .bind(file)
            .bind(info.to_string())
            .execute(db.pool())
            .await
            .unwrap();
    }

    async fn count(db: &Database) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM song_cache").fetch_one(db.pool()).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_then_load() {
        let (_db, cache) = cache().await;
        let songs = cache.songs();
        let stored = entry(json!({"title": "Jaguar", "key": "4A", "bpm": 130, "filePath": "/somewhere/else.mp3"}));
        assert!(songs.upsert("/srv/frkb/library/A", "Jaguar.mp3", &stored, None).await);
        let loaded = songs.load("library/A", "/srv/frkb/library/A/Jaguar.mp3").await.hit().unwrap();
        assert_eq!(loaded.info.file_path.as_deref(), Some("/srv/frkb/library/A/Jaguar.mp3"));
        assert_eq!(loaded.info.extra.get("title"), Some(&json!("Jaguar")));
        assert_eq!((loaded.size, loaded.mtime_ms), (10, 20));
    }

    #[tokio::test]
    async fn test_load_miss() {
        let (_db, cache) = cache().await;
        assert_eq!(cache.songs().load("/srv/frkb/library/A", "nope.mp3").await, Lookup::Miss);
        assert_eq!(cache.songs().load("", "nope.mp3").await, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_upsert_with_old_file_removes_it() {
        let (db, cache) = cache().await;
        let songs = cache.songs();
        let stored = entry(json!({"key": "1A", "bpm": 100}));
        assert!(songs.upsert("/srv/frkb/library/A", "old.mp3", &stored, None).await);
        assert!(songs.upsert("/srv/frkb/library/A", "new.mp3", &stored, Some("old.mp3")).await);
        assert_eq!(count(&db).await, 1);
        assert_eq!(songs.load("/srv/frkb/library/A", "old.mp3").await, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_upsert_replaces_older_key_forms() {
        let (db, cache) = cache().await;
        insert(&db, "/srv/frkb/library/A", "/srv/frkb/library/A/a.mp3", json!({})).await;
        assert!(cache.songs().upsert("/srv/frkb/library/A", "a.mp3", &entry(json!({})), None).await);
        let keys: Vec<(String, String)> =
            sqlx::query_as("SELECT list_root, file_path FROM song_cache").fetch_all(db.pool()).await.unwrap();
        assert_eq!(keys, vec![("library/A".to_string(), "a.mp3".to_string())]);
    }

    #[tokio::test]
    async fn test_global_match_by_payload_path() {
        let (db, cache) = cache().await;
        insert(&db, "corrupted-root", "whatever", json!({"filePath": "/srv/frkb/library/B/x.mp3", "key": "2B"})).await;
        let loaded = cache.songs().load("/srv/frkb/library/B", "x.mp3").await.hit().unwrap();
        assert_eq!(loaded.info.key.as_deref(), Some("2B"));
        let roots: Vec<String> =
            sqlx::query_scalar("SELECT list_root FROM song_cache").fetch_all(db.pool()).await.unwrap();
        assert_eq!(roots, vec!["library/B".to_string()]);
    }

    #[tokio::test]
    async fn test_incomplete_canonical_ignores_other_roots_payloads() {
        let (db, cache) = cache().await;
        insert(&db, "library/A", "x.mp3", json!({"key": "1A"})).await;
        let stray = json!({"bpm": 128, "filePath": "/srv/frkb/library/A/x.mp3"});
        insert(&db, "library/playlist", "zzz.mp3", stray).await;
        let loaded = cache.songs().load("library/A", "x.mp3").await.hit().unwrap();
        assert_eq!((loaded.info.key.as_deref(), loaded.info.bpm), (Some("1A"), None));
        assert_eq!(count(&db).await, 2);
    }

    #[tokio::test]
    async fn test_malformed_canonical_is_replaced_by_older_row() {
        let (db, cache) = cache().await;
        sqlx::query(
            "INSERT INTO song_cache (list_root, file_path, size, mtime_ms, info_json)
             VALUES ('library/A', 'a.mp3', 1, 2, '{oops')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        insert(&db, "/srv/frkb/library/A", "/srv/frkb/library/A/a.mp3", json!({"bpm": 99})).await;
        let loaded = cache.songs().load("library/A", "a.mp3").await.hit().unwrap();
        assert_eq!(loaded.info.bpm, Some(99.0));
        assert_eq!(count(&db).await, 1);
    }

    #[tokio::test]
    async fn test_complete_canonical_skips_fallbacks() {
        let (db, cache) = cache().await;
        insert(&db, "library/A", "a.mp3", json!({"key": "1A", "bpm": 120})).await;
        insert(&db, "/srv/frkb/library/A", "/srv/frkb/library/A/a.mp3", json!({"key": "8A", "bpm": 128})).await;
        let loaded = cache.songs().load("library/A", "a.mp3").await.hit().unwrap();
        assert_eq!(loaded.info.key.as_deref(), Some("1A"));
        assert_eq!(count(&db).await, 2);
    }

    #[tokio::test]
    async fn test_load_all_prefers_canonical_rows() {
        let (db, cache) = cache().await;
        insert(&db, "library/A", "a.mp3", json!({"key": "canonical"})).await;
        insert(&db, "/srv/frkb/library/A", "/srv/frkb/library/A/a.mp3", json!({"key": "legacy"})).await;
        insert(&db, "/srv/frkb/library/A", "/srv/frkb/library/A/b.mp3", json!({"key": "only"})).await;
        insert(&db, "library/B", "c.mp3", json!({})).await;
        let all = cache.songs().load_all("/srv/frkb/library/A").await.unwrap();
        let keys: Vec<(&str, Option<&str>)> =
            all.iter().map(|r| (r.file_key.as_str(), r.entry.info.key.as_deref())).collect();
        assert_eq!(keys, vec![("a.mp3", Some("canonical")), ("b.mp3", Some("only"))]);
        assert_eq!(all[1].path, "/srv/frkb/library/A/b.mp3");
        assert_eq!(all[1].entry.info.file_path.as_deref(), Some("/srv/frkb/library/A/b.mp3"));
    }

    #[tokio::test]
    async fn test_remove_all_and_clear() {
        let (db, cache) = cache().await;
        let songs = cache.songs();
        for file in ["a.mp3", "b.mp3", "c.mp3"] {
            assert!(songs.upsert("library/A", file, &entry(json!({})), None).await);
        }
        insert(&db, "/srv/frkb/library/A", "/srv/frkb/library/A/d.mp3", json!({})).await;
        assert!(songs.remove_all("library/A", ["a.mp3", "b.mp3"]).await);
        assert_eq!(count(&db).await, 2);
        assert!(songs.clear("/srv/frkb/library/A").await);
        assert_eq!(count(&db).await, 0);
    }

    #[tokio::test]
    async fn test_removed_loose_rows_stay_removed() {
        let (db, cache) = cache().await;
        let songs = cache.songs();
        insert(&db, "Library/A", "X.mp3", json!({"key": "4A"})).await;
        insert(&db, "Library/A", "Y.mp3", json!({"key": "5A"})).await;
        insert(&db, "LIBRARY/a", "Z.mp3", json!({"key": "6A"})).await;

        assert!(songs.remove("library/A", "x.mp3").await);
        assert_eq!(songs.load("library/A", "x.mp3").await, Lookup::Miss);
        assert_eq!(count(&db).await, 2);

        assert!(songs.clear("library/A").await);
        assert_eq!(songs.load("library/A", "y.mp3").await, Lookup::Miss);
        assert_eq!(songs.load("library/A", "z.mp3").await, Lookup::Miss);
        assert_eq!(count(&db).await, 0);
    }

    #[test]
    fn test_parse_row_tolerates_garbage() {
        let row = SongRow {
            row_id: 1,
            list_root: "r".into(),
            file_path: "f".into(),
            size: 1,
            mtime_ms: 1,
            info_json: "42".into(),
        };
        assert_eq!(parse_row(&row), None);
        let row = SongRow { info_json: "{}".into(), ..row };
        assert_eq!(parse_row(&row).map(|e| e.info), Some(SongInfo::default()));
    }
}
