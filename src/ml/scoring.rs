//! ロジット → 確率 → 上位K件の予測

use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, Result};
use crate::model::LabelTable;

/// 信頼度の丸め桁数
pub const CONFIDENCE_DECIMALS: i32 = 4;

/// 1件の予測結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
}

/// ソフトマックス（最大値を引いてオーバーフローを防ぐ）
pub fn softmax(scores: &[f32]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let max = scores
        .iter()
        .map(|&s| s as f64)
        .fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|&s| (s as f64 - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// 確率の高い順に `min(k, len)` 件のインデックスを返す（同値は小さいインデックス優先）
pub fn top_k_indices(probabilities: &[f64], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..probabilities.len()).collect();
    indices.sort_by(|&a, &b| {
        probabilities[b]
            .total_cmp(&probabilities[a])
            .then_with(|| a.cmp(&b))
    });
    indices.truncate(k);
    indices
}

pub fn round_confidence(probability: f64) -> f64 {
    let factor = 10f64.powi(CONFIDENCE_DECIMALS);
    (probability * factor).round() / factor
}

/// 生スコアから上位K件の予測を組み立てる
pub fn rank_predictions(scores: &[f32], labels: &LabelTable, top_k: usize) -> Result<Vec<Prediction>> {
    if top_k == 0 {
        return Err(InferenceError::Input("top_k must be at least 1".to_string()));
    }
    if scores.len() != labels.len() {
        return Err(InferenceError::Internal(format!(
            "model produced {} scores for {} labels",
            scores.len(),
            labels.len()
        )));
    }
    if let Some(index) = scores.iter().position(|s| !s.is_finite()) {
        return Err(InferenceError::Internal(format!("non-finite score at class {}", index)));
    }

    let probabilities = softmax(scores);
    top_k_indices(&probabilities, top_k)
        .into_iter()
        .map(|index| {
            let label = labels
                .get(index)
                .ok_or_else(|| InferenceError::Internal(format!("class index {} has no label", index)))?;
            Ok(Prediction {
                label: label.to_string(),
                confidence: round_confidence(probabilities[index]),
            })
        })
        .collect()
}
