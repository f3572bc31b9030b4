//! クラスインデックス→ラベルの対応表
//!
//! 学習ジョブが出力する `labels.json`（`{"0": "echeveria_elegans", ...}`）を読み込みます。
//! 起動時に一度だけ構築され、以降は変更されません。

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::error::{InferenceError, Result};

/// ラベル表（インデックス 0..N-1 が密に埋まっている）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
    labels: Vec<String>,
}

impl LabelTable {
    /// ファイルから読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            InferenceError::Config(format!("cannot read label file {}: {}", path.display(), e))
        })?;
        let table = Self::from_json_str(&content)?;
        tracing::info!(path = %path.display(), count = table.len(), "loaded labels");
        Ok(table)
    }

    /// JSON文字列から構築
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: RawEntries = serde_json::from_str(json)
            .map_err(|e| InferenceError::Config(format!("malformed label file: {}", e)))?;
        Self::from_entries(raw.0)
    }

    /// (キー, ラベル) の組から構築
    ///
    /// キーは非負整数、インデックスの重複・欠番・ラベルの重複はエラー。
    pub fn from_entries<I, K, V>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let entries: Vec<(K, V)> = entries.into_iter().collect();
        let mut slots: Vec<Option<String>> = vec![None; entries.len()];

        for (key, label) in entries {
            let key = key.as_ref();
            let index: usize = key.trim().parse().map_err(|_| {
                InferenceError::Config(format!("label key is not a non-negative integer: {:?}", key))
            })?;
            // N件なら 0..N-1 に収まっていなければ欠番がある
            if index >= slots.len() {
                return Err(InferenceError::Config(format!(
                    "label index {} out of range for {} labels (indices must be dense)",
                    index,
                    slots.len()
                )));
            }
            if slots[index].is_some() {
                return Err(InferenceError::Config(format!("duplicate label index: {}", index)));
            }
            slots[index] = Some(label.into());
        }

        if slots.is_empty() {
            return Err(InferenceError::Config("label file contains no labels".to_string()));
        }

        let mut labels = Vec::with_capacity(slots.len());
        let mut seen = HashSet::new();
        for (index, slot) in slots.into_iter().enumerate() {
            let label = slot.ok_or_else(|| {
                InferenceError::Config(format!("label index {} is missing", index))
            })?;
            if !seen.insert(label.clone()) {
                return Err(InferenceError::Config(format!("duplicate label: {:?}", label)));
            }
            labels.push(label);
        }

        Ok(Self { labels })
    }

    /// インデックスからラベルを取得
    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

/// JSONオブジェクトのエントリを出現順のまま保持する
///
/// `HashMap` に直接デシリアライズすると重複キーが黙って上書きされるため。
struct RawEntries(Vec<(String, String)>);

impl<'de> Deserialize<'de> for RawEntries {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = RawEntries;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping class indices to label strings")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, String>()? {
                    entries.push((key, value));
                }
                Ok(RawEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_config_error(result: Result<LabelTable>) {
        match result {
            Err(InferenceError::Config(_)) => {}
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_loads_dense_mapping_in_index_order() {
        let table = LabelTable::from_json_str(
            r#"{"2": "sedum_morganianum", "0": "echeveria_elegans", "1": "haworthia_fasciata"}"#,
        )
        .unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.get(0), Some("echeveria_elegans"));
        assert_eq!(table.get(1), Some("haworthia_fasciata"));
        assert_eq!(table.get(2), Some("sedum_morganianum"));
        assert_eq!(table.get(3), None);
    }

    #[test]
    fn test_rejects_non_integer_key() {
        assert_config_error(LabelTable::from_json_str(r#"{"0": "a", "one": "b"}"#));
        assert_config_error(LabelTable::from_json_str(r#"{"-1": "a"}"#));
    }

    #[test]
    fn test_rejects_duplicate_index() {
        assert_config_error(LabelTable::from_json_str(r#"{"0": "a", "1": "b", "01": "c"}"#));
        assert_config_error(LabelTable::from_json_str(r#"{"0": "a", "0": "b"}"#));
    }

    #[test]
    fn test_rejects_gap_and_empty() {
        assert_config_error(LabelTable::from_json_str(r#"{"0": "a", "2": "c"}"#));
        assert_config_error(LabelTable::from_json_str("{}"));
    }

    #[test]
    fn test_rejects_wrong_structure() {
        assert_config_error(LabelTable::from_json_str(r#"["a", "b"]"#));
        assert_config_error(LabelTable::from_json_str(r#"{"0": 5}"#));
        assert_config_error(LabelTable::from_json_str("not json"));
    }

    #[test]
    fn test_rejects_duplicate_label() {
        assert_config_error(LabelTable::from_json_str(r#"{"0": "a", "1": "a"}"#));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_config_error(LabelTable::load(dir.path().join("labels.json")));
    }
}
