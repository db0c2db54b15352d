use exn::ResultExt;
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::WaveformCodec;
use crate::context::Shared;
use crate::error::{ErrorKind, Result, settle};
use crate::lookup::{self, Target};
use crate::models::{CacheRecord, FileStat, KeyRow, WaveformEntry, WaveformMeta, WaveformParams, WaveformRow};
use crate::stores::{clear_root, remove_files};
use crate::table::CacheTable;
use crate::Lookup;

/// Payload format version per waveform table. Rows written under any other
/// version read as stale.
pub const fn waveform_version(table: CacheTable) -> u32 {
    match table {
        CacheTable::Waveforms => 3,
        CacheTable::MixtapeWaveforms => 2,
        CacheTable::MixtapeRawWaveforms | CacheTable::MixtapeHiresWaveforms => 1,
        CacheTable::Songs | CacheTable::Covers => 0,
    }
}

const META_COLUMNS: &str = "rowid AS row_id, size, mtime_ms, version, sample_rate, step, duration, frames";

#[derive(sqlx::FromRow)]
struct KeyedWaveformRow {
    #[sqlx(flatten)]
    key: KeyRow,
    #[sqlx(flatten)]
    row: WaveformRow,
}

/// Shared implementation behind the plain and hi-res stores.
#[derive(Clone)]
struct WaveformTable {
    shared: Arc<Shared>,
    table: CacheTable,
    version: u32,
}

impl WaveformTable {
    fn is_waveform_table(&self) -> bool {
        !matches!(self.table, CacheTable::Songs | CacheTable::Covers)
    }

    fn check_table(&self, target_rate: Option<i64>) -> Result<()> {
        if !self.is_waveform_table() || self.table.has_target_rate() != target_rate.is_some() {
            exn::bail!(ErrorKind::InvalidData("waveform table"));
        }
        Ok(())
    }

    async fn fetch(&self, conn: &mut SqliteConnection, row_id: i64, with_payload: bool) -> Result<Option<WaveformRow>> {
        let data = if with_payload { "data" } else { "NULL AS data" };
        let sql = format!("SELECT {META_COLUMNS}, {data} FROM {} WHERE rowid = ?", self.table.name());
        sqlx::query_as(&sql).bind(row_id).fetch_optional(&mut *conn).await.or_raise(|| ErrorKind::Database)
    }

    /// A fresh row for `target`, deleting it first if it is stale.
    async fn load_fresh(
        &self,
        target: &Target,
        stat: FileStat,
        with_payload: bool,
    ) -> Result<Option<(i64, WaveformMeta, Option<Vec<u8>>)>> {
        let db = self.shared.db()?;
        let mut conn = db.acquire().await?;
        let Some(row_id) = lookup::locate(&mut conn, &self.shared, self.table, target).await? else {
            return Ok(None);
        };
        let Some(row) = self.fetch(&mut conn, row_id, with_payload).await? else {
            return Ok(None);
        };
        let fresh = WaveformMeta::try_from(&row).ok().filter(|meta| meta.is_fresh(stat, self.version));
        let usable = fresh.filter(|_| !with_payload || row.data.is_some());
        match usable {
            Some(meta) => Ok(Some((row_id, meta, row.data))),
            None => {
                lookup::delete_row(&mut conn, self.table, row_id).await?;
                tracing::debug!(
                    table = self.table.name(),
                    root = %target.root.key,
                    file = %target.file.key,
                    "Dropped stale waveform cache row"
                );
                Ok(None)
            },
        }
    }

    async fn load(
        &self,
        root: &str,
        file: &str,
        target_rate: Option<i64>,
        stat: FileStat,
    ) -> Result<Option<WaveformEntry>> {
        self.check_table(target_rate)?;
        let target = Target::resolve(&self.shared, root, file, target_rate)?;
        Ok(self.load_fresh(&target, stat, true).await?.and_then(|(_, meta, payload)| {
            payload.map(|payload| WaveformEntry { meta, payload })
        }))
    }

    async fn has_valid(&self, root: &str, file: &str, target_rate: Option<i64>, stat: FileStat) -> Result<bool> {
        self.check_table(target_rate)?;
        let target = Target::resolve(&self.shared, root, file, target_rate)?;
        Ok(self.load_fresh(&target, stat, false).await?.is_some())
    }

    async fn load_decoded<C: WaveformCodec>(
        &self,
        codec: &C,
        root: &str,
        file: &str,
        target_rate: Option<i64>,
        stat: FileStat,
    ) -> Result<Option<C::Waveform>> {
        self.check_table(target_rate)?;
        let target = Target::resolve(&self.shared, root, file, target_rate)?;
        let Some((row_id, meta, Some(payload))) = self.load_fresh(&target, stat, true).await? else {
            return Ok(None);
        };
        if let Some(waveform) = codec.decode(&meta, &payload) {
            return Ok(Some(waveform));
        }
        let mut conn = self.shared.db()?.acquire().await?;
        lookup::delete_row(&mut conn, self.table, row_id).await?;
        tracing::debug!(
            table = self.table.name(),
            root = %target.root.key,
            file = %target.file.key,
            "Dropped undecodable waveform"
        );
        Ok(None)
    }

    async fn upsert(
        &self,
        root: &str,
        file: &str,
        target_rate: Option<i64>,
        entry: &WaveformEntry,
        old_file: Option<&str>,
    ) -> Result<()> {
        self.check_table(target_rate)?;
        let db = self.shared.db()?;
        let target = Target::resolve(&self.shared, root, file, target_rate)?;
        let params = WaveformParams::try_from(&entry.meta)?;
        let mut tx = db.begin().await?;
        if let Some(old_file) = old_file {
            let old = Target::within(target.root.clone(), root, old_file, &self.shared, target_rate)?;
            lookup::delete_identity(&mut tx, self.table, &old).await?;
        }
        lookup::delete_identity(&mut tx, self.table, &target).await?;
        let (rate_column, rate_value) = match target_rate {
            Some(_) => (", target_rate", ", ?"),
            None => ("", ""),
        };
        let sql = format!(
            "INSERT OR REPLACE INTO {} (
                 list_root, file_path{rate_column}, size, mtime_ms, version, sample_rate, step, duration, frames, data
             ) VALUES (?, ?{rate_value}, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.table.name()
        );
        let mut query = sqlx::query(&sql).bind(&target.root.key).bind(&target.file.key);
        if let Some(rate) = target_rate {
            query = query.bind(rate);
        }
        query
            .bind(params.size)
            .bind(params.mtime_ms)
            .bind(params.version)
            .bind(params.sample_rate)
            .bind(params.step)
            .bind(params.duration)
            .bind(params.frames)
            .bind(&entry.payload)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    async fn load_all(&self, root: &str) -> Result<Vec<(Option<i64>, CacheRecord<WaveformEntry>)>> {
        self.check_table(self.table.has_target_rate().then_some(0))?;
        let db = self.shared.db()?;
        let resolved = self.shared.resolve_root(root)?;
        let resolver = self.shared.resolver();
        let sql = format!(
            "SELECT {META_COLUMNS}, data, list_root, file_path, {} FROM {} WHERE list_root = ?",
            self.table.target_rate_column(),
            self.table.name()
        );
        let mut records = BTreeMap::new();
        let mut conn = db.acquire().await?;
        for root_key in Target::keys_of(&resolved) {
            let rows: Vec<KeyedWaveformRow> =
                sqlx::query_as(&sql).bind(&root_key).fetch_all(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
            for KeyedWaveformRow { key, row } in rows {
                let Some(file) = resolver.resolve_file(&resolved.abs, &key.file_path) else {
                    continue;
                };
                let (Ok(meta), Some(payload)) = (WaveformMeta::try_from(&row), row.data) else {
                    continue;
                };
                records.entry((file.key.clone(), key.target_rate)).or_insert_with(|| {
                    let entry = WaveformEntry { meta, payload };
                    let record = CacheRecord { file_key: file.key, path: file.abs, entry };
                    (key.target_rate, record)
                });
            }
        }
        Ok(records.into_values().collect())
    }
}

/// Cached waveforms in one of the tables keyed by `(root, file)` only.
///
/// Reads take the live [`FileStat`] of the audio file: a row whose size,
/// modification time or format version disagree is deleted and reported as a
/// miss, never returned.
#[derive(Clone)]
pub struct WaveformStore {
    inner: WaveformTable,
}

impl WaveformStore {
    pub(crate) fn new(shared: Arc<Shared>, table: CacheTable) -> Self {
        Self { inner: WaveformTable { shared, table, version: waveform_version(table) } }
    }

    /// Override the payload version rows must carry to be considered fresh.
    pub fn with_version(mut self, version: u32) -> Self {
        self.inner.version = version;
        self
    }

    pub fn table(&self) -> CacheTable {
        self.inner.table
    }

    pub fn current_version(&self) -> u32 {
        self.inner.version
    }

    pub async fn load(&self, root: &str, file: &str, stat: FileStat) -> Lookup<WaveformEntry> {
        if !self.inner.shared.is_available() {
            return Lookup::Unavailable;
        }
        settle("load waveform", self.inner.load(root, file, None, stat).await, || None).into()
    }

    /// Whether a fresh row exists, without reading the payload.
    pub async fn has_valid(&self, root: &str, file: &str, stat: FileStat) -> bool {
        settle("check waveform", self.inner.has_valid(root, file, None, stat).await, || false)
    }

    /// [`load`](Self::load) and decode in one step; an undecodable payload is
    /// dropped like a stale one.
    pub async fn load_decoded<C: WaveformCodec>(
        &self,
        codec: &C,
        root: &str,
        file: &str,
        stat: FileStat,
    ) -> Lookup<C::Waveform> {
        if !self.inner.shared.is_available() {
            return Lookup::Unavailable;
        }
        settle("load waveform", self.inner.load_decoded(codec, root, file, None, stat).await, || None).into()
    }

    pub async fn load_all(&self, root: &str) -> Option<Vec<CacheRecord<WaveformEntry>>> {
        let records = settle("load all waveforms", self.inner.load_all(root).await.map(Some), || None)?;
        Some(records.into_iter().map(|(_, record)| record).collect())
    }

    pub async fn upsert(&self, root: &str, file: &str, entry: &WaveformEntry, old_file: Option<&str>) -> bool {
        settle("upsert waveform", self.inner.upsert(root, file, None, entry, old_file).await.map(|_| true), || false)
    }

    /// Encode `waveform` with `codec` and store it under this store's current
    /// version. `meta.version` is ignored.
    pub async fn upsert_encoded<C: WaveformCodec>(
        &self,
        codec: &C,
        root: &str,
        file: &str,
        meta: WaveformMeta,
        waveform: &C::Waveform,
        old_file: Option<&str>,
    ) -> bool {
        let entry = WaveformEntry {
            meta: WaveformMeta { version: self.inner.version, ..meta },
            payload: codec.encode(waveform),
        };
        self.upsert(root, file, &entry, old_file).await
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
        let result = remove_files(&self.inner.shared, self.inner.table, root, files.iter().map(AsRef::as_ref)).await;
        settle("remove waveforms", result.map(|_| true), || false)
    }

    pub async fn clear(&self, root: &str) -> bool {
        settle("clear waveforms", clear_root(&self.inner.shared, self.inner.table, root).await.map(|_| true), || false)
    }
}

/// Mixtape waveforms resampled to a target rate; one row per
/// `(root, file, target_rate)`.
#[derive(Clone)]
pub struct HiresWaveformStore {
    inner: WaveformTable,
}

impl HiresWaveformStore {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let table = CacheTable::MixtapeHiresWaveforms;
        Self { inner: WaveformTable { shared, table, version: waveform_version(table) } }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.inner.version = version;
        self
    }

    pub async fn load(&self, root: &str, file: &str, target_rate: u32, stat: FileStat) -> Lookup<WaveformEntry> {
        if !self.inner.shared.is_available() {
            return Lookup::Unavailable;
        }
        let rate = Some(i64::from(target_rate));
        settle("load hires waveform", self.inner.load(root, file, rate, stat).await, || None).into()
    }

    pub async fn has_valid(&self, root: &str, file: &str, target_rate: u32, stat: FileStat) -> bool {
        let rate = Some(i64::from(target_rate));
        settle("check hires waveform", self.inner.has_valid(root, file, rate, stat).await, || false)
    }

    pub async fn load_decoded<C: WaveformCodec>(
        &self,
        codec: &C,
        root: &str,
        file: &str,
        target_rate: u32,
        stat: FileStat,
    ) -> Lookup<C::Waveform> {
        if !self.inner.shared.is_available() {
            return Lookup::Unavailable;
        }
        let rate = Some(i64::from(target_rate));
        settle("load hires waveform", self.inner.load_decoded(codec, root, file, rate, stat).await, || None).into()
    }

    /// Every row for `root` as `(target_rate, record)`, ordered by file then rate.
    pub async fn load_all(&self, root: &str) -> Option<Vec<(u32, CacheRecord<WaveformEntry>)>> {
        let records = settle("load all hires waveforms", self.inner.load_all(root).await.map(Some), || None)?;
        Some(
            records
                .into_iter()
                .filter_map(|(rate, record)| Some((u32::try_from(rate?).ok()?, record)))
                .collect(),
        )
    }

    pub async fn upsert(
        &self,
        root: &str,
        file: &str,
        target_rate: u32,
        entry: &WaveformEntry,
        old_file: Option<&str>,
    ) -> bool {
        let rate = Some(i64::from(target_rate));
        let result = self.inner.upsert(root, file, rate, entry, old_file).await;
        settle("upsert hires waveform", result.map(|_| true), || false)
    }

    /// Remove `file` at every target rate.
    pub async fn remove(&self, root: &str, file: &str) -> bool {
        self.remove_all(root, [file]).await
    }

    pub async fn remove_all<I, S>(&self, root: &str, files: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let files: Vec<S> = files.into_iter().collect();
        let result = remove_files(&self.inner.shared, self.inner.table, root, files.iter().map(AsRef::as_ref)).await;
        settle("remove hires waveforms", result.map(|_| true), || false)
    }

    pub async fn clear(&self, root: &str) -> bool {
        let result = clear_root(&self.inner.shared, self.inner.table, root).await;
        settle("clear hires waveforms", result.map(|_| true), || false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cache, CacheOptions, Database};
    use frkb_paths::PathStyle;
    use rstest::rstest;

    async fn cache() -> (Database, Cache) {
        let db = Database::connect_in_memory().await.unwrap();
        let options = CacheOptions { path_style: PathStyle::Posix, ..CacheOptions::default() };
        let cache = Cache::new(Some(db.clone()), options).with_database_root("/srv/frkb");
        (db, cache)
    }

    fn entry(version: u32) -> WaveformEntry {
        WaveformEntry {
            meta: WaveformMeta {
                size: 100,
                mtime_ms: 1_700_000_000_000,
                version,
                sample_rate: 44_100,
                step: 512.0,
                duration: 180.5,
                frames: 15_000,
            },
            payload: vec![1, 2, 3, 4],
        }
    }

    const STAT: FileStat = FileStat { size: 100, mtime_ms: 1_700_000_000_000 };

    async fn rows(db: &Database, table: CacheTable) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table.name())).fetch_one(db.pool()).await.unwrap()
    }

    struct Bytes;

    impl WaveformCodec for Bytes {
        type Waveform = Vec<u16>;

        fn encode(&self, waveform: &Vec<u16>) -> Vec<u8> {
            waveform.iter().flat_map(|v| v.to_le_bytes()).collect()
        }

        fn decode(&self, meta: &WaveformMeta, payload: &[u8]) -> Option<Vec<u16>> {
            if payload.len() as u64 != meta.frames * 2 {
                return None;
            }
            Some(payload.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect())
        }
    }

    #[rstest]
    #[case(CacheTable::Waveforms)]
    #[case(CacheTable::MixtapeWaveforms)]
    #[case(CacheTable::MixtapeRawWaveforms)]
    #[tokio::test]
    async fn test_round_trip(#[case] table: CacheTable) {
        let (_db, cache) = cache().await;
        let store = cache.waveforms(table);
        let stored = entry(store.current_version());
        assert!(store.upsert("/srv/frkb/library/A", "a.wav", &stored, None).await);
        assert_eq!(store.load("library/A", "a.wav", STAT).await, Lookup::Hit(stored));
        assert!(store.has_valid("library/A", "a.wav", STAT).await);
    }

    #[rstest]
    #[case(FileStat { size: 101, ..STAT })]
    #[case(FileStat { mtime_ms: STAT.mtime_ms + 2, ..STAT })]
    #[tokio::test]
    async fn test_stale_row_is_deleted(#[case] live: FileStat) {
        let (db, cache) = cache().await;
        let store = cache.waveforms(CacheTable::Waveforms);
        assert!(store.upsert("library/A", "a.wav", &entry(store.current_version()), None).await);
        assert_eq!(store.load("library/A", "a.wav", live).await, Lookup::Miss);
        assert_eq!(rows(&db, CacheTable::Waveforms).await, 0);
    }

    #[tokio::test]
    async fn test_old_version_is_stale_for_has_valid() {
        let (db, cache) = cache().await;
        let store = cache.waveforms(CacheTable::MixtapeWaveforms);
        assert!(store.upsert("library/A", "a.wav", &entry(store.current_version() - 1), None).await);
        assert!(!store.has_valid("library/A", "a.wav", STAT).await);
        assert_eq!(rows(&db, CacheTable::MixtapeWaveforms).await, 0);
    }

    #[tokio::test]
    async fn test_mtime_within_tolerance() {
        let (_db, cache) = cache().await;
        let store = cache.waveforms(CacheTable::Waveforms).with_version(9);
        assert!(store.upsert("library/A", "a.wav", &entry(9), None).await);
        let live = FileStat { mtime_ms: STAT.mtime_ms + 1, ..STAT };
        assert!(store.load("library/A", "a.wav", live).await.is_hit());
    }

    #[tokio::test]
    async fn test_codec_paths() {
        let (db, cache) = cache().await;
        let store = cache.waveforms(CacheTable::Waveforms);
        let meta = WaveformMeta { frames: 3, version: 0, ..entry(0).meta };
        assert!(store.upsert_encoded(&Bytes, "library/A", "a.wav", meta, &vec![7, 8, 9], None).await);
        assert_eq!(store.load_decoded(&Bytes, "library/A", "a.wav", STAT).await, Lookup::Hit(vec![7, 8, 9]));

        // Frame count no longer matches the payload.
        let broken = WaveformEntry {
            meta: WaveformMeta { frames: 5, version: store.current_version(), ..meta },
            payload: vec![0; 6],
        };
        assert!(store.upsert("library/A", "a.wav", &broken, None).await);
        assert_eq!(store.load_decoded(&Bytes, "library/A", "a.wav", STAT).await, Lookup::Miss);
        assert_eq!(rows(&db, CacheTable::Waveforms).await, 0);
    }

    #[tokio::test]
    async fn test_hires_rates_are_independent() {
        let (db, cache) = cache().await;
        let store = cache.hires_waveforms();
        let stored = entry(waveform_version(CacheTable::MixtapeHiresWaveforms));
        assert!(store.upsert("library/A", "a.wav", 4000, &stored, None).await);
        assert!(store.upsert("library/A", "a.wav", 8000, &stored, None).await);
        assert!(store.load("library/A", "a.wav", 4000, STAT).await.is_hit());
        assert_eq!(store.load("library/A", "a.wav", 2000, STAT).await, Lookup::Miss);
        let rates: Vec<u32> = store.load_all("library/A").await.unwrap().into_iter().map(|(rate, _)| rate).collect();
        assert_eq!(rates, vec![4000, 8000]);
        assert!(store.remove("library/A", "a.wav").await);
        assert_eq!(rows(&db, CacheTable::MixtapeHiresWaveforms).await, 0);
    }

    #[tokio::test]
    async fn test_hires_table_rejected_by_plain_store() {
        let (_db, cache) = cache().await;
        let store = cache.waveforms(CacheTable::MixtapeHiresWaveforms);
        assert!(!store.upsert("library/A", "a.wav", &entry(1), None).await);
        assert_eq!(store.load("library/A", "a.wav", STAT).await, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_load_all_resolves_legacy_rows() {
        let (db, cache) = cache().await;
        let store = cache.waveforms(CacheTable::Waveforms);
        assert!(store.upsert("library/A", "a.wav", &entry(3), None).await);
        sqlx::query(
            "INSERT INTO waveform_cache
                 (list_root, file_path, size, mtime_ms, version, sample_rate, step, duration, frames, data)
             VALUES ('/srv/frkb/library/A', '/srv/frkb/library/A/b.wav', 1, 1, 3, 1, 1.0, 1.0, 1, x'00')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        let all = store.load_all("library/A").await.unwrap();
        let files: Vec<(&str, &str)> = all.iter().map(|r| (r.file_key.as_str(), r.path.as_str())).collect();
        assert_eq!(files, vec![("a.wav", "/srv/frkb/library/A/a.wav"), ("b.wav", "/srv/frkb/library/A/b.wav")]);
    }
}
