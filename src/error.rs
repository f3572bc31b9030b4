//! 推論サービスのエラー分類
//!
//! 呼び出し側が区別すべき失敗カテゴリを閉じた列挙型で表現します。

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    /// 起動時アーティファクト（ラベルファイル・チェックポイント）の不備
    #[error("configuration error: {0}")]
    Config(String),

    /// 指定された画像が存在しない
    #[error("image not found: {0}")]
    NotFound(String),

    /// 画像のデコード失敗やリクエスト値の不正
    #[error("invalid input: {0}")]
    Input(String),

    /// スコア計算中の想定外の失敗
    #[error("internal error: {0}")]
    Internal(String),

    /// サービスがReady状態ではない
    #[error("service not ready ({0})")]
    NotReady(String),
}

impl InferenceError {
    /// ログ用の短いカテゴリ名
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::Config(_) => "config",
            InferenceError::NotFound(_) => "not_found",
            InferenceError::Input(_) => "input",
            InferenceError::Internal(_) => "internal",
            InferenceError::NotReady(_) => "not_ready",
        }
    }
}

pub type Result<T> = std::result::Result<T, InferenceError>;
