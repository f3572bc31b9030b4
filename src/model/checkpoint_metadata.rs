//! チェックポイントメタデータの定義
//!
//! 学習ジョブがモデルの重みと一緒に保存する情報です。
//! 推論サービスは起動時にこれを読み、ラベルファイルや設定と突き合わせます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// チェックポイントメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// 学習時のクラス一覧（インデックス順）
    /// 例: ["echeveria_elegans", "haworthia_fasciata", "sedum_morganianum"]
    pub classes: Vec<String>,

    /// モデル入力サイズ（CNNへの入力解像度、通常224x224）
    pub model_input_size: u32,

    /// 学習エポック数
    pub num_epochs: u32,

    /// 検証データでの正解率（%）
    #[serde(default)]
    pub val_acc: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl CheckpointMetadata {
    /// 新しいメタデータを作成
    pub fn new(classes: Vec<String>, model_input_size: u32, num_epochs: u32, val_acc: Option<f64>) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            classes,
            model_input_size,
            num_epochs,
            val_acc,
            trained_at,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
