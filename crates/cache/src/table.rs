//! The six cache tables and per-table bookkeeping.

use serde::Serialize;

/// A cache table. Every table is keyed by `(list_root, file_path)`; the hi-res
/// waveform table additionally by `target_rate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheTable {
    Songs,
    Covers,
    Waveforms,
    MixtapeWaveforms,
    MixtapeRawWaveforms,
    MixtapeHiresWaveforms,
}

impl CacheTable {
    pub const ALL: [CacheTable; 6] = [
        Self::Songs,
        Self::Covers,
        Self::Waveforms,
        Self::MixtapeWaveforms,
        Self::MixtapeRawWaveforms,
        Self::MixtapeHiresWaveforms,
    ];

    /// SQL table name. Only ever interpolated from this closed set.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Songs => "song_cache",
            Self::Covers => "cover_index",
            Self::Waveforms => "waveform_cache",
            Self::MixtapeWaveforms => "mixtape_waveform_cache",
            Self::MixtapeRawWaveforms => "mixtape_raw_waveform_cache",
            Self::MixtapeHiresWaveforms => "mixtape_waveform_hires_cache",
        }
    }

    pub const fn has_target_rate(self) -> bool {
        matches!(self, Self::MixtapeHiresWaveforms)
    }

    /// `target_rate` column, or a NULL placeholder so every table decodes
    /// into the same key row.
    pub(crate) const fn target_rate_column(self) -> &'static str {
        match self.has_target_rate() {
            true => "target_rate",
            false => "NULL AS target_rate",
        }
    }
}

/// Rows touched per table by a maintenance operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub songs: u64,
    pub covers: u64,
    pub waveforms: u64,
    pub mixtape_waveforms: u64,
    pub mixtape_raw_waveforms: u64,
    pub mixtape_hires_waveforms: u64,
}

impl TableCounts {
    pub fn get(&self, table: CacheTable) -> u64 {
        match table {
            CacheTable::Songs => self.songs,
            CacheTable::Covers => self.covers,
            CacheTable::Waveforms => self.waveforms,
            CacheTable::MixtapeWaveforms => self.mixtape_waveforms,
            CacheTable::MixtapeRawWaveforms => self.mixtape_raw_waveforms,
            CacheTable::MixtapeHiresWaveforms => self.mixtape_hires_waveforms,
        }
    }

    pub(crate) fn add(&mut self, table: CacheTable, count: u64) {
        let slot = match table {
            CacheTable::Songs => &mut self.songs,
            CacheTable::Covers => &mut self.covers,
            CacheTable::Waveforms => &mut self.waveforms,
            CacheTable::MixtapeWaveforms => &mut self.mixtape_waveforms,
            CacheTable::MixtapeRawWaveforms => &mut self.mixtape_raw_waveforms,
            CacheTable::MixtapeHiresWaveforms => &mut self.mixtape_hires_waveforms,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        CacheTable::ALL.iter().map(|table| self.get(*table)).sum()
    }
}
