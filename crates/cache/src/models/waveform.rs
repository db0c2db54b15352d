use crate::error::{Error, Result};
use crate::models::{from_sql_int, to_sql_int};
use std::fs::Metadata;
use std::time::UNIX_EPOCH;

/// Live size and modification time of a file, as the staleness check sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mtime_ms: u64,
}

impl From<&Metadata> for FileStat {
    fn from(metadata: &Metadata) -> Self {
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self { size: metadata.len(), mtime_ms }
    }
}

/// Everything about a cached waveform except the encoded payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformMeta {
    pub size: u64,
    pub mtime_ms: u64,
    /// Encoder format version the payload was produced with.
    pub version: u32,
    pub sample_rate: u32,
    /// Source samples per frame.
    pub step: f64,
    /// Seconds.
    pub duration: f64,
    pub frames: u64,
}

impl WaveformMeta {
    /// Timestamps that went through a float round trip may be off by one.
    pub const MTIME_TOLERANCE_MS: u64 = 1;

    /// Whether this row still describes `stat`'s file under the current encoder.
    pub fn is_fresh(&self, stat: FileStat, current_version: u32) -> bool {
        self.version == current_version
            && self.size == stat.size
            && self.mtime_ms.abs_diff(stat.mtime_ms) <= Self::MTIME_TOLERANCE_MS
    }
}

/// A cached multi-band waveform summary.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformEntry {
    pub meta: WaveformMeta,
    /// Opaque bytes produced by a [`WaveformCodec`](crate::WaveformCodec).
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct WaveformRow {
    pub(crate) row_id: i64,
    pub(crate) size: i64,
    pub(crate) mtime_ms: i64,
    pub(crate) version: i64,
    pub(crate) sample_rate: i64,
    pub(crate) step: f64,
    pub(crate) duration: f64,
    pub(crate) frames: i64,
    /// `NULL` when only the metadata columns were selected.
    pub(crate) data: Option<Vec<u8>>,
}

impl TryFrom<&WaveformRow> for WaveformMeta {
    type Error = Error;
    fn try_from(row: &WaveformRow) -> Result<Self> {
        Ok(Self {
            size: from_sql_int(row.size, "size")?,
            mtime_ms: from_sql_int(row.mtime_ms, "mtime")?,
            version: from_sql_int(row.version, "version")?,
            sample_rate: from_sql_int(row.sample_rate, "sample rate")?,
            step: row.step,
            duration: row.duration,
            frames: from_sql_int(row.frames, "frames")?,
        })
    }
}

pub(crate) struct WaveformParams {
    pub(crate) size: i64,
    pub(crate) mtime_ms: i64,
    pub(crate) version: i64,
    pub(crate) sample_rate: i64,
    pub(crate) step: f64,
    pub(crate) duration: f64,
    pub(crate) frames: i64,
}

impl TryFrom<&WaveformMeta> for WaveformParams {
    type Error = Error;
    fn try_from(meta: &WaveformMeta) -> Result<Self> {
        Ok(Self {
            size: to_sql_int(meta.size, "size")?,
            mtime_ms: to_sql_int(meta.mtime_ms, "mtime")?,
            version: i64::from(meta.version),
            sample_rate: i64::from(meta.sample_rate),
            step: meta.step,
            duration: meta.duration,
            frames: to_sql_int(meta.frames, "frames")?,
        })
    }
}
