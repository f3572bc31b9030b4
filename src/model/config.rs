//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、アーティファクトのパス、サーバー設定をJSON形式で保存・読み込みします。
//! 環境変数 `MODEL_PATH` / `LABELS_PATH` / `TOP_K` / `HOST` / `PORT` / `DEVICE` で上書きできます。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ml::ml_model::{IMAGE_SIZE, MIN_IMAGE_SIZE};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Cpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            other => Err(format!("unknown device type: {}", other)),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// チェックポイント（tar.gz）のパス
    pub checkpoint_path: String,
    /// クラスインデックス→ラベルのJSONファイルのパス
    pub labels_path: String,
    /// 返す予測の件数（リクエストで省略された場合）
    pub top_k: usize,
    /// モデル入力解像度（正方形）
    pub image_size: u32,
    /// 同時に推論できるモデルレプリカ数（未指定ならCPUコア数）
    #[serde(default)]
    pub replicas: Option<usize>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            checkpoint_path: "models/succulent_classifier_best.tar.gz".to_string(),
            labels_path: "labels.json".to_string(),
            top_k: 3,
            image_size: IMAGE_SIZE as u32,
            replicas: None,
        }
    }
}

impl ModelSettings {
    pub fn effective_replicas(&self) -> usize {
        self.replicas
            .filter(|&n| n > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }
}

/// HTTPサーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// リクエストボディの上限（base64画像を含む）
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// サーバー設定
    #[serde(default)]
    pub server: ServerSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded config file");
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to read config file, using defaults"
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        }
    }

    /// 環境変数で上書き
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// 任意の参照関数で上書き（テストでは環境変数の代わりに使う）
    ///
    /// 解釈できない値は警告を出して無視します。
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("MODEL_PATH") {
            self.model.checkpoint_path = path;
        }
        if let Some(path) = lookup("LABELS_PATH") {
            self.model.labels_path = path;
        }
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(raw) = lookup("TOP_K") {
            match raw.parse() {
                Ok(top_k) => self.model.top_k = top_k,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid TOP_K"),
            }
        }
        if let Some(raw) = lookup("PORT") {
            match raw.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid PORT"),
            }
        }
        if let Some(raw) = lookup("DEVICE") {
            match raw.parse() {
                Ok(device) => self.device_type = device,
                Err(e) => tracing::warn!(error = %e, "ignoring invalid DEVICE"),
            }
        }
    }

    /// 起動前の値チェック
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.model.top_k == 0 {
            anyhow::bail!("model.top_k must be at least 1");
        }
        if (self.model.image_size as usize) < MIN_IMAGE_SIZE {
            anyhow::bail!(
                "model.image_size is too small: {} (minimum {})",
                self.model.image_size,
                MIN_IMAGE_SIZE
            );
        }
        if self.server.port == 0 {
            anyhow::bail!("server.port must not be 0");
        }
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn log_summary(&self) {
        tracing::info!(
            device = %self.device_type,
            checkpoint = %self.model.checkpoint_path,
            labels = %self.model.labels_path,
            top_k = self.model.top_k,
            image_size = self.model.image_size,
            host = %self.server.host,
            port = self.server.port,
            "service configuration"
        );
    }
}
