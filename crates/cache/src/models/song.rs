use crate::error::{Error, ErrorKind, Result};
use crate::models::{from_sql_int, to_sql_int};
use exn::ResultExt;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Parsed tag metadata for a song.
///
/// Only the fields the cache itself reasons about are typed; everything else
/// the tag reader produced is carried through untouched in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongInfo {
    /// Absolute path of the song. Rewritten on every load, never trusted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Musical key (e.g. `8A`).
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f64>,
    /// `Some(false)` means full tag metadata was read; `Some(true)` means only
    /// audio analysis results are present; `None` is unknown.
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub analysis_only: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<f64>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<bool>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => Some(b),
        _ => None,
    })
}

impl SongInfo {
    fn has_key(&self) -> bool {
        self.key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    fn has_bpm(&self) -> bool {
        self.bpm.is_some_and(|bpm| bpm > 0.0)
    }

    /// Whether a legacy row could still contribute anything to this entry.
    pub(crate) fn is_complete(&self) -> bool {
        self.has_key() && self.has_bpm()
    }
}

/// Reconcile the canonical row's info with info found under a legacy or
/// loosely matching key.
///
/// - `key` and `bpm` are kept from `canonical` if set (non-empty / positive),
///   otherwise taken from `found`.
/// - `analysisOnly` is `false` if either side says `false`.
/// - `filePath` is always `file_path`.
/// - Any other field is taken from `canonical` when both have it.
pub fn merge_info(canonical: Option<&SongInfo>, found: &SongInfo, file_path: &str) -> SongInfo {
    let Some(canonical) = canonical else {
        return SongInfo { file_path: Some(file_path.to_string()), ..found.clone() };
    };
    let mut extra = found.extra.clone();
    extra.extend(canonical.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    let key = match (canonical.has_key(), found.has_key()) {
        (true, _) => canonical.key.clone(),
        (false, true) => found.key.clone(),
        (false, false) => canonical.key.clone().or_else(|| found.key.clone()),
    };
    let bpm = match (canonical.has_bpm(), found.has_bpm()) {
        (true, _) => canonical.bpm,
        (false, true) => found.bpm,
        (false, false) => canonical.bpm.or(found.bpm),
    };
    let analysis_only = match (canonical.analysis_only, found.analysis_only) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (canonical, found) => canonical.or(found),
    };
    SongInfo {
        file_path: Some(file_path.to_string()),
        key,
        bpm,
        analysis_only,
        extra,
    }
}

/// [`merge_info`] over whole entries; file stats come from `canonical` when present.
pub fn merge_entries(canonical: Option<&SongEntry>, found: &SongEntry, file_path: &str) -> SongEntry {
    let info = merge_info(canonical.map(|c| &c.info), &found.info, file_path);
    match canonical {
        Some(canonical) => SongEntry { size: canonical.size, mtime_ms: canonical.mtime_ms, info },
        None => SongEntry { size: found.size, mtime_ms: found.mtime_ms, info },
    }
}

/// Cached tag metadata for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongEntry {
    pub size: u64,
    pub mtime_ms: u64,
    pub info: SongInfo,
}

impl SongEntry {
    pub(crate) fn with_file_path(mut self, file_path: &str) -> Self {
        self.info.file_path = Some(file_path.to_string());
        self
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct SongRow {
    pub(crate) row_id: i64,
    pub(crate) list_root: String,
    pub(crate) file_path: String,
    pub(crate) size: i64,
    pub(crate) mtime_ms: i64,
    pub(crate) info_json: String,
}

impl TryFrom<&SongRow> for SongEntry {
    type Error = Error;
    fn try_from(row: &SongRow) -> Result<Self> {
        Ok(Self {
            size: from_sql_int(row.size, "size")?,
            mtime_ms: from_sql_int(row.mtime_ms, "mtime")?,
            info: serde_json::from_str(&row.info_json).or_raise(|| ErrorKind::MalformedPayload("info_json"))?,
        })
    }
}

/// Bindable column values for an insert or update.
pub(crate) struct SongParams {
    pub(crate) size: i64,
    pub(crate) mtime_ms: i64,
    pub(crate) info_json: String,
}

impl TryFrom<&SongEntry> for SongParams {
    type Error = Error;
    fn try_from(entry: &SongEntry) -> Result<Self> {
        Ok(Self {
            size: to_sql_int(entry.size, "size")?,
            mtime_ms: to_sql_int(entry.mtime_ms, "mtime")?,
            info_json: serde_json::to_string(&entry.info).or_raise(|| ErrorKind::MalformedPayload("info_json"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn info(value: Value) -> SongInfo {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_info_keeps_unknown_fields() {
        let parsed = info(json!({"title": "Strings of Life", "bpm": 126, "filePath": "/old"}));
        assert_eq!(parsed.bpm, Some(126.0));
        assert_eq!(parsed.extra.get("title"), Some(&json!("Strings of Life")));
        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back, json!({"title": "Strings of Life", "bpm": 126.0, "filePath": "/old"}));
    }

    #[rstest]
    #[case(json!({"bpm": null}), None)]
    #[case(json!({"bpm": "128.5"}), Some(128.5))]
    #[case(json!({"bpm": [1]}), None)]
    #[case(json!({}), None)]
    fn test_lenient_bpm(#[case] input: Value, #[case] expected: Option<f64>) {
        assert_eq!(info(input).bpm, expected);
    }

    #[test]
    fn test_merge_prefers_populated_fields() {
        let canonical = info(json!({"key": null, "bpm": 128, "title": "canonical"}));
        let found = info(json!({"key": "8A", "bpm": null, "title": "legacy", "genre": "House"}));
        let merged = merge_info(Some(&canonical), &found, "/lib/a/song.mp3");
        assert_eq!(merged.key.as_deref(), Some("8A"));
        assert_eq!(merged.bpm, Some(128.0));
        assert_eq!(merged.file_path.as_deref(), Some("/lib/a/song.mp3"));
        assert_eq!(merged.extra.get("title"), Some(&json!("canonical")));
        assert_eq!(merged.extra.get("genre"), Some(&json!("House")));
    }

    #[test]
    fn test_merge_keeps_canonical_when_both_populated() {
        let canonical = info(json!({"key": "1A", "bpm": 120}));
        let found = info(json!({"key": "8A", "bpm": 128}));
        let merged = merge_info(Some(&canonical), &found, "/x");
        assert_eq!(merged.key.as_deref(), Some("1A"));
        assert_eq!(merged.bpm, Some(120.0));
    }

    #[test]
    fn test_merge_empty_key_and_zero_bpm_are_unset() {
        let canonical = info(json!({"key": "  ", "bpm": 0}));
        let found = info(json!({"key": "5B", "bpm": 90}));
        let merged = merge_info(Some(&canonical), &found, "/x");
        assert_eq!(merged.key.as_deref(), Some("5B"));
        assert_eq!(merged.bpm, Some(90.0));
    }

    #[rstest]
    #[case(Some(true), Some(false), Some(false))]
    #[case(Some(false), Some(true), Some(false))]
    #[case(None, Some(true), Some(true))]
    #[case(Some(true), None, Some(true))]
    #[case(None, None, None)]
    fn test_merge_analysis_only(
        #[case] canonical: Option<bool>,
        #[case] found: Option<bool>,
        #[case] expected: Option<bool>,
    ) {
        let canonical = SongInfo { analysis_only: canonical, ..SongInfo::default() };
        let found = SongInfo { analysis_only: found, ..SongInfo::default() };
        assert_eq!(merge_info(Some(&canonical), &found, "/x").analysis_only, expected);
    }

    #[test]
    fn test_merge_without_canonical_rewrites_path_only() {
        let found = info(json!({"key": "8A", "filePath": "C:\\old\\song.mp3", "analysisOnly": true}));
        let merged = merge_info(None, &found, "/new/song.mp3");
        assert_eq!(merged, SongInfo { file_path: Some("/new/song.mp3".into()), ..found });
    }

    #[test]
    fn test_merge_entries_stats() {
        let canonical = SongEntry { size: 1, mtime_ms: 2, info: SongInfo::default() };
        let found = SongEntry { size: 3, mtime_ms: 4, info: SongInfo::default() };
        let merged = merge_entries(Some(&canonical), &found, "/x");
        assert_eq!((merged.size, merged.mtime_ms), (1, 2));
        let merged = merge_entries(None, &found, "/x");
        assert_eq!((merged.size, merged.mtime_ms), (3, 4));
    }

    #[test]
    fn test_row_with_malformed_json() {
        let row = SongRow {
            row_id: 1,
            list_root: "a".into(),
            file_path: "b".into(),
            size: 1,
            mtime_ms: 1,
            info_json: "{not json".into(),
        };
        let err = SongEntry::try_from(&row).unwrap_err();
        assert!(matches!(*err, ErrorKind::MalformedPayload(_)));
    }
}
