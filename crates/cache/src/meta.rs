//! Persisted key-value flags.

use async_trait::async_trait;
use exn::ResultExt;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::Database;
use crate::error::{ErrorKind, Result};

/// Small persisted key-value store, used for one-shot migration flags.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get_meta_value(&self, key: &str) -> Result<Option<String>>;
    async fn set_meta_value(&self, key: &str, value: &str) -> Result<()>;
}

/// [`MetaStore`] backed by the `cache_meta` table.
#[derive(Debug, Clone)]
pub struct SqliteMetaStore {
    pool: SqlitePool,
}

impl From<&Database> for SqliteMetaStore {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}

#[async_trait]
impl MetaStore for SqliteMetaStore {
    async fn get_meta_value(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM cache_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    async fn set_meta_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO cache_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }
}

/// Process-lifetime [`MetaStore`]; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get_meta_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned())
    }

    async fn set_meta_value(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).insert(key.to_string(), value.to_string());
        Ok(())
    }
}
