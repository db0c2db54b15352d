use frkb_paths::PathStyle;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for a [`Cache`](crate::Cache) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Delay between the database root becoming known and the one-shot key
    /// migration running. A newer root restarts the timer.
    pub migration_delay_ms: u64,
    /// Upper bound on distinct roots a case/separator-insensitive lookup will
    /// consider.
    pub loose_root_limit: u32,
    /// Path convention used for keys.
    pub path_style: PathStyle,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            migration_delay_ms: 3000,
            loose_root_limit: 20,
            path_style: PathStyle::host(),
        }
    }
}

impl CacheOptions {
    pub fn migration_delay(&self) -> Duration {
        Duration::from_millis(self.migration_delay_ms)
    }
}
