//! Process-scoped state shared by every store handed out by one [`Cache`](crate::Cache).

use exn::OptionExt;
use frkb_paths::{PathResolver, ResolvedPath};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::AbortHandle;

use crate::error::{ErrorKind, Result};
use crate::meta::MetaStore;
use crate::options::CacheOptions;
use crate::table::CacheTable;
use crate::Database;

type LooseKey = (CacheTable, String, Vec<String>);

pub(crate) struct Shared {
    db: Option<Database>,
    pub(crate) meta: Arc<dyn MetaStore>,
    pub(crate) options: CacheOptions,
    resolver: RwLock<PathResolver>,
    /// Roots whose legacy sidecar has been dealt with in this process.
    migrated_roots: Mutex<HashSet<(CacheTable, String)>>,
    /// Distinct `list_root` values that loosely matched a root's candidates.
    loose_roots: Mutex<HashMap<LooseKey, Vec<String>>>,
    pending_key_migration: Mutex<Option<AbortHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // Every critical section is a single map operation; a panic elsewhere
    // can't leave the map half-updated.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    pub(crate) fn new(db: Option<Database>, meta: Arc<dyn MetaStore>, options: CacheOptions) -> Self {
        let resolver = PathResolver::new(None, options.path_style);
        Self {
            db,
            meta,
            options,
            resolver: RwLock::new(resolver),
            migrated_roots: Mutex::default(),
            loose_roots: Mutex::default(),
            pending_key_migration: Mutex::default(),
        }
    }

    pub(crate) fn db(&self) -> Result<&Database> {
        self.db.as_ref().ok_or_raise(|| ErrorKind::Unavailable)
    }

    pub(crate) fn is_available(&self) -> bool {
        self.db.is_some()
    }

    /// Snapshot of the current resolver.
    pub(crate) fn resolver(&self) -> PathResolver {
        self.resolver.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_base(&self, base: Option<String>) {
        let resolver = PathResolver::new(base, self.options.path_style);
        *self.resolver.write().unwrap_or_else(PoisonError::into_inner) = resolver;
        self.clear_process_caches();
    }

    pub(crate) fn resolve_root(&self, root: &str) -> Result<ResolvedPath> {
        self.resolver().resolve_root(root).ok_or_raise(|| ErrorKind::UnresolvableIdentity(root.to_string()))
    }

    pub(crate) fn is_migrated(&self, table: CacheTable, root_key: &str) -> bool {
        lock(&self.migrated_roots).contains(&(table, root_key.to_string()))
    }

    pub(crate) fn mark_migrated(&self, table: CacheTable, root_key: &str) {
        lock(&self.migrated_roots).insert((table, root_key.to_string()));
    }

    pub(crate) fn cached_loose_roots(
        &self,
        table: CacheTable,
        root_key: &str,
        candidates: &[String],
    ) -> Option<Vec<String>> {
        lock(&self.loose_roots).get(&(table, root_key.to_string(), candidates.to_vec())).cloned()
    }

    pub(crate) fn cache_loose_roots(&self, table: CacheTable, root_key: &str, candidates: &[String], roots: &[String]) {
        lock(&self.loose_roots).insert((table, root_key.to_string(), candidates.to_vec()), roots.to_vec());
    }

    /// Swap the scheduled key migration, returning the previous one.
    pub(crate) fn replace_pending_migration(&self, task: Option<AbortHandle>) -> Option<AbortHandle> {
        std::mem::replace(&mut *lock(&self.pending_key_migration), task)
    }

    pub(crate) fn clear_process_caches(&self) {
        lock(&self.loose_roots).clear();
        lock(&self.migrated_roots).clear();
    }
}
