mod cover;
mod key;
mod song;
mod waveform;

pub use self::cover::CoverEntry;
pub(crate) use self::cover::CoverRow;
pub(crate) use self::key::KeyRow;
pub use self::song::{SongEntry, SongInfo, merge_entries, merge_info};
pub(crate) use self::song::{SongParams, SongRow};
pub use self::waveform::{FileStat, WaveformEntry, WaveformMeta};
pub(crate) use self::waveform::{WaveformParams, WaveformRow};

use crate::error::{ErrorKind, Result};
use exn::ResultExt;

pub(crate) fn to_sql_int<T>(value: T, what: &'static str) -> Result<i64>
where
    i64: TryFrom<T>,
    <i64 as TryFrom<T>>::Error: std::error::Error + Send + Sync + 'static,
{
    i64::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}

pub(crate) fn from_sql_int<T>(value: i64, what: &'static str) -> Result<T>
where
    T: TryFrom<i64>,
    <T as TryFrom<i64>>::Error: std::error::Error + Send + Sync + 'static,
{
    T::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}

/// A cached entry together with the file it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord<E> {
    /// Key the row is stored under (relative to the root when possible).
    pub file_key: String,
    /// Absolute location of the file.
    pub path: String,
    pub entry: E,
}
