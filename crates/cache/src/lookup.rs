//! The fallback chain every store walks on a read miss.
//!
//! 1. Canonical `(root key, file key)`.
//! 2. Exact non-canonical forms: raw (pre-normalization) keys, then the
//!    legacy absolute pair.
//! 3. Loose: case and separator insensitive, across every root that loosely
//!    matches one of the root's forms.
//!
//! A hit on 2 or 3 is moved onto the canonical key so the next lookup is an
//! O(1) hit on step 1. Song-specific steps (merging, the global `filePath`
//! match) live in the song store.

use exn::{OptionExt, ResultExt};
use frkb_paths::ResolvedPath;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::context::Shared;
use crate::error::{ErrorKind, Result};
use crate::table::CacheTable;

/// A resolved `(root, file)` identity, plus the caller's original strings.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub(crate) root_input: String,
    pub(crate) file_input: String,
    pub(crate) root: ResolvedPath,
    pub(crate) file: ResolvedPath,
    pub(crate) target_rate: Option<i64>,
}

impl Target {
    pub(crate) fn resolve(shared: &Shared, root: &str, file: &str, target_rate: Option<i64>) -> Result<Self> {
        let resolved_root = shared.resolve_root(root)?;
        Self::within(resolved_root, root, file, shared, target_rate)
    }

    pub(crate) fn within(
        root: ResolvedPath,
        root_input: &str,
        file: &str,
        shared: &Shared,
        target_rate: Option<i64>,
    ) -> Result<Self> {
        let resolved_file = shared
            .resolver()
            .resolve_file(&root.abs, file)
            .ok_or_raise(|| ErrorKind::UnresolvableIdentity(file.to_string()))?;
        Ok(Self {
            root_input: root_input.to_string(),
            file_input: file.to_string(),
            root,
            file: resolved_file,
            target_rate,
        })
    }

    /// Exact `(root, file)` pairs other than the canonical one, in probe order.
    pub(crate) fn exact_fallbacks(&self) -> Vec<(&str, &str)> {
        let (root, file) = (&self.root, &self.file);
        let pairs = [
            (Some(root.key.as_str()), file.key_raw.as_deref()),
            (root.key_raw.as_deref(), Some(file.key.as_str())),
            (root.key_raw.as_deref(), file.key_raw.as_deref()),
            (root.legacy_abs.as_deref(), file.legacy_abs.as_deref()),
            (root.legacy_abs.as_deref(), Some(file.key.as_str())),
            (root.legacy_abs.as_deref(), file.key_raw.as_deref()),
        ];
        let mut out: Vec<(&str, &str)> = Vec::with_capacity(pairs.len());
        for pair in pairs {
            if let (Some(r), Some(f)) = pair
                && (r, f) != (root.key.as_str(), file.key.as_str())
                && !out.contains(&(r, f))
            {
                out.push((r, f));
            }
        }
        out
    }

    /// Every key `root` might have been stored under, canonical first.
    pub(crate) fn keys_of(root: &ResolvedPath) -> Vec<String> {
        let mut keys = vec![root.key.clone()];
        keys.extend(root.fallback_keys().into_iter().map(str::to_string));
        keys
    }
}

/// Append the `target_rate` condition for tables that have one.
pub(crate) fn push_rate(query: &mut QueryBuilder<'_, Sqlite>, table: CacheTable, target_rate: Option<i64>) {
    if let (true, Some(rate)) = (table.has_target_rate(), target_rate) {
        query.push(" AND target_rate = ").push_bind(rate);
    }
}

pub(crate) async fn find_exact(
    conn: &mut SqliteConnection,
    table: CacheTable,
    root: &str,
    file: &str,
    target_rate: Option<i64>,
) -> Result<Option<i64>> {
    let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT rowid FROM {} WHERE list_root = ", table.name()));
    query.push_bind(root.to_string()).push(" AND file_path = ").push_bind(file.to_string());
    push_rate(&mut query, table, target_rate);
    query.push(" LIMIT 1");
    query.build_query_scalar::<i64>().fetch_optional(&mut *conn).await.or_raise(|| ErrorKind::Database)
}

pub(crate) async fn find_canonical(
    conn: &mut SqliteConnection,
    table: CacheTable,
    target: &Target,
) -> Result<Option<i64>> {
    find_exact(conn, table, &target.root.key, &target.file.key, target.target_rate).await
}

/// Steps 2 and 3 of the chain. Never returns the canonical row.
pub(crate) async fn find_fallback(
    conn: &mut SqliteConnection,
    shared: &Shared,
    table: CacheTable,
    target: &Target,
) -> Result<Option<i64>> {
    for (root, file) in target.exact_fallbacks() {
        if let Some(row_id) = find_exact(conn, table, root, file, target.target_rate).await? {
            return Ok(Some(row_id));
        }
    }
    find_loose(conn, shared, table, target).await
}

/// Distinct stored roots that loosely match one of `root`'s forms, most
/// recently written first, at most `loose_root_limit` of them. Cached per
/// `(table, root key, candidates)` until the process caches are cleared.
pub(crate) async fn loose_roots(
    conn: &mut SqliteConnection,
    shared: &Shared,
    table: CacheTable,
    root: &ResolvedPath,
    root_input: &str,
) -> Result<Vec<String>> {
    let candidates = root.loose_candidates(root_input);
    if let Some(roots) = shared.cached_loose_roots(table, &root.key, &candidates) {
        return Ok(roots);
    }
    let mut query = QueryBuilder::<Sqlite>::new(format!(
        r"SELECT list_root FROM {} WHERE lower(replace(list_root, '/', '\')) IN (",
        table.name()
    ));
    let mut separated = query.separated(", ");
    for candidate in &candidates {
        separated.push_bind(candidate.clone());
    }
    // Most recently written root first: SQLite hands out a new rowid on
    // every INSERT OR REPLACE.
    query.push(") GROUP BY list_root ORDER BY MAX(rowid) DESC LIMIT ");
    query.push_bind(i64::from(shared.options.loose_root_limit));
    let roots: Vec<String> =
        query.build_query_scalar().fetch_all(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
    shared.cache_loose_roots(table, &root.key, &candidates, &roots);
    Ok(roots)
}

/// `list_root IN (roots) AND <file loosely matches> [AND target_rate = ?]`
fn push_loose_match(query: &mut QueryBuilder<'_, Sqlite>, roots: Vec<String>, target: &Target, table: CacheTable) {
    query.push("list_root IN (");
    let mut separated = query.separated(", ");
    for root in roots {
        separated.push_bind(root);
    }
    query.push(r") AND lower(replace(file_path, '/', '\')) IN (");
    let mut separated = query.separated(", ");
    for file in target.file.loose_candidates(&target.file_input) {
        separated.push_bind(file);
    }
    query.push(")");
    push_rate(query, table, target.target_rate);
}

async fn find_loose(
    conn: &mut SqliteConnection,
    shared: &Shared,
    table: CacheTable,
    target: &Target,
) -> Result<Option<i64>> {
    let roots = loose_roots(conn, shared, table, &target.root, &target.root_input).await?;
    if roots.is_empty() {
        return Ok(None);
    }
    let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT rowid FROM {} WHERE ", table.name()));
    push_loose_match(&mut query, roots, target, table);
    query
        .push(" AND NOT (list_root = ")
        .push_bind(target.root.key.clone())
        .push(" AND file_path = ")
        .push_bind(target.file.key.clone())
        .push(") ORDER BY rowid DESC LIMIT 1");
    query.build_query_scalar::<i64>().fetch_optional(&mut *conn).await.or_raise(|| ErrorKind::Database)
}

/// Move a row onto new key columns, replacing whatever already sits there.
pub(crate) async fn relocate(
    conn: &mut SqliteConnection,
    table: CacheTable,
    row_id: i64,
    root_key: &str,
    file_key: &str,
) -> Result<u64> {
    let sql = format!("UPDATE OR REPLACE {} SET list_root = ?, file_path = ? WHERE rowid = ?", table.name());
    let result = sqlx::query(&sql)
        .bind(root_key)
        .bind(file_key)
        .bind(row_id)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(result.rows_affected())
}

/// Canonical row id for `target`, healing a fallback hit onto the canonical
/// key first if needed.
pub(crate) async fn locate(
    conn: &mut SqliteConnection,
    shared: &Shared,
    table: CacheTable,
    target: &Target,
) -> Result<Option<i64>> {
    if let Some(row_id) = find_canonical(conn, table, target).await? {
        return Ok(Some(row_id));
    }
    let Some(row_id) = find_fallback(conn, shared, table, target).await? else {
        return Ok(None);
    };
    relocate(conn, table, row_id, &target.root.key, &target.file.key).await?;
    tracing::debug!(
        table = table.name(),
        root = %target.root.key,
        file = %target.file.key,
        "Migrated cache row to its canonical key"
    );
    Ok(Some(row_id))
}

pub(crate) async fn delete_row(conn: &mut SqliteConnection, table: CacheTable, row_id: i64) -> Result<u64> {
    let sql = format!("DELETE FROM {} WHERE rowid = ?", table.name());
    let result = sqlx::query(&sql).bind(row_id).execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
    Ok(result.rows_affected())
}

/// Delete the canonical row and every exact fallback row for `target`.
pub(crate) async fn delete_identity(conn: &mut SqliteConnection, table: CacheTable, target: &Target) -> Result<u64> {
    let mut pairs = vec![(target.root.key.as_str(), target.file.key.as_str())];
    pairs.extend(target.exact_fallbacks());
    let mut removed = 0;
    for (root, file) in pairs {
        let mut query = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {} WHERE list_root = ", table.name()));
        query.push_bind(root.to_string()).push(" AND file_path = ").push_bind(file.to_string());
        push_rate(&mut query, table, target.target_rate);
        removed += query.build().execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?.rows_affected();
    }
    Ok(removed)
}

/// Delete every row a loose lookup of `target` could still find.
pub(crate) async fn delete_loose(
    conn: &mut SqliteConnection,
    shared: &Shared,
    table: CacheTable,
    target: &Target,
) -> Result<u64> {
    let roots = loose_roots(conn, shared, table, &target.root, &target.root_input).await?;
    if roots.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {} WHERE ", table.name()));
    push_loose_match(&mut query, roots, target, table);
    let result = query.build().execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
    Ok(result.rows_affected())
}

/// Whether any row exists under one of `root_keys`.
pub(crate) async fn root_has_rows(
    conn: &mut SqliteConnection,
    table: CacheTable,
    root_keys: &[String],
) -> Result<bool> {
    let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT 1 FROM {} WHERE list_root IN (", table.name()));
    let mut separated = query.separated(", ");
    for key in root_keys {
        separated.push_bind(key.clone());
    }
    query.push(") LIMIT 1");
    let hit: Option<i64> =
        query.build_query_scalar().fetch_optional(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
    Ok(hit.is_some())
}

/// Delete every row stored under one of `root_keys`.
pub(crate) async fn delete_roots(conn: &mut SqliteConnection, table: CacheTable, root_keys: &[String]) -> Result<u64> {
    if root_keys.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {} WHERE list_root IN (", table.name()));
    let mut separated = query.separated(", ");
    for key in root_keys {
        separated.push_bind(key.clone());
    }
    query.push(")");
    let result = query.build().execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
    Ok(result.rows_affected())
}
