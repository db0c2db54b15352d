use serde::Serialize;

/// Where a song's extracted cover art lives, by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverEntry {
    /// Absolute path of the song the cover was extracted from.
    pub file_path: String,
    pub hash: String,
    /// Image file extension, including the leading dot.
    pub ext: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct CoverRow {
    pub(crate) row_id: i64,
    pub(crate) list_root: String,
    pub(crate) file_path: String,
    pub(crate) hash: String,
    pub(crate) ext: String,
}

impl CoverRow {
    pub(crate) fn into_entry(self, file_path: String) -> CoverEntry {
        CoverEntry { file_path, hash: self.hash, ext: self.ext }
    }
}
