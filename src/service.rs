//! 推論サービス
//!
//! ラベル表・分類モデル・前処理器を起動時に一度だけ構築し、以降は読み取り専用で共有します。
//! 停止時に手放し、処理中のリクエストが終わった時点でモデルの重みが解放されます。
//!
//! 状態遷移: `Uninitialized → Initializing → Ready → ShuttingDown → Stopped`
//! （初期化に失敗した場合は `Failed`。`Ready` には到達しない）

use burn::tensor::backend::Backend;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use crate::error::{InferenceError, Result};
use crate::ml::{rank_predictions, ClassifierModel, ImageSource, Prediction, Preprocessor};
use crate::model::{LabelTable, ModelSettings};

/// サービスの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ServicePhase {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    ShuttingDown = 3,
    Stopped = 4,
    Failed = 5,
}

impl ServicePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServicePhase::Uninitialized,
            1 => ServicePhase::Initializing,
            2 => ServicePhase::Ready,
            3 => ServicePhase::ShuttingDown,
            4 => ServicePhase::Stopped,
            _ => ServicePhase::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServicePhase::Uninitialized => "uninitialized",
            ServicePhase::Initializing => "initializing",
            ServicePhase::Ready => "ready",
            ServicePhase::ShuttingDown => "shutting_down",
            ServicePhase::Stopped => "stopped",
            ServicePhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ServicePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 初期化完了後に不変となるサービス状態
struct ServiceState<B: Backend> {
    labels: LabelTable,
    model: ClassifierModel<B>,
    preprocessor: Preprocessor,
}

/// ヘルスチェック結果
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub ready: bool,
    pub class_count: usize,
    pub phase: ServicePhase,
    pub device: String,
}

/// 推論サービス
pub struct InferenceService<B: Backend> {
    settings: ModelSettings,
    device: B::Device,
    device_name: String,
    phase: AtomicU8,
    class_count: AtomicUsize,
    state: RwLock<Option<Arc<ServiceState<B>>>>,
}

impl<B: Backend> InferenceService<B> {
    pub fn new(settings: ModelSettings, device: B::Device, device_name: impl Into<String>) -> Self {
        Self {
            settings,
            device,
            device_name: device_name.into(),
            phase: AtomicU8::new(ServicePhase::Uninitialized as u8),
            class_count: AtomicUsize::new(0),
            state: RwLock::new(None),
        }
    }

    pub fn phase(&self) -> ServicePhase {
        ServicePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: ServicePhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// ラベル・モデル・前処理器を読み込んでReadyにする（ブロッキング）
    ///
    /// 失敗した場合は `Failed` になり、エラーを返す。呼び出し側はプロセスを終了すること。
    pub fn initialize(&self) -> Result<()> {
        self.initialize_with(|| {})
    }

    /// `before_ready` は状態の構築後、Readyへ遷移する直前に呼ばれる
    fn initialize_with<F: FnOnce()>(&self, before_ready: F) -> Result<()> {
        self.phase
            .compare_exchange(
                ServicePhase::Uninitialized as u8,
                ServicePhase::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|current| {
                InferenceError::Internal(format!(
                    "initialize called in phase {}",
                    ServicePhase::from_u8(current)
                ))
            })?;

        tracing::info!(device = %self.device_name, "initializing inference service");

        let state = match self.build_state() {
            Ok(state) => state,
            Err(e) => {
                self.set_phase(ServicePhase::Failed);
                tracing::error!(error = %e, "failed to initialize inference service");
                return Err(e);
            }
        };

        let class_count = state.labels.len();
        *self.write_state() = Some(Arc::new(state));
        self.class_count.store(class_count, Ordering::Release);
        before_ready();

        // 初期化中にshutdownされていたらReadyにせず、構築した状態も手放す
        if let Err(current) = self.phase.compare_exchange(
            ServicePhase::Initializing as u8,
            ServicePhase::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            self.write_state().take();
            self.class_count.store(0, Ordering::Release);
            return Err(InferenceError::NotReady(ServicePhase::from_u8(current).to_string()));
        }

        tracing::info!(class_count, "inference service ready");
        Ok(())
    }

    fn build_state(&self) -> Result<ServiceState<B>> {
        let labels = LabelTable::load(&self.settings.labels_path)?;

        let model = ClassifierModel::<B>::load(
            Path::new(&self.settings.checkpoint_path),
            labels.len(),
            self.settings.effective_replicas(),
            &self.device,
        )?;

        if model.image_size() != self.settings.image_size {
            return Err(InferenceError::Config(format!(
                "checkpoint expects {}x{} input but image_size is configured as {}",
                model.image_size(),
                model.image_size(),
                self.settings.image_size
            )));
        }

        let metadata = model.metadata();
        if metadata.classes.as_slice() != labels.labels() {
            tracing::warn!("checkpoint class names differ from the label file; using the label file");
        }
        match metadata.val_acc {
            Some(val_acc) => tracing::info!(
                path = %self.settings.checkpoint_path,
                val_acc,
                trained_at = %metadata.trained_at,
                "model loaded"
            ),
            None => tracing::info!(
                path = %self.settings.checkpoint_path,
                trained_at = %metadata.trained_at,
                "model loaded (no validation accuracy recorded)"
            ),
        }

        Ok(ServiceState {
            labels,
            model,
            preprocessor: Preprocessor::new(self.settings.image_size),
        })
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, Option<Arc<ServiceState<B>>>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ready状態のときだけ状態を返す
    fn state(&self) -> Result<Arc<ServiceState<B>>> {
        let phase = self.phase();
        if phase != ServicePhase::Ready {
            return Err(InferenceError::NotReady(phase.to_string()));
        }
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| InferenceError::NotReady(phase.to_string()))
    }

    /// 画像を分類して上位K件を返す
    ///
    /// `top_k` 省略時は設定値を使う。
    pub fn infer(&self, source: &ImageSource, top_k: Option<usize>) -> Result<Vec<Prediction>> {
        let state = self.state()?;
        let top_k = top_k.unwrap_or(self.settings.top_k);
        if top_k == 0 {
            return Err(InferenceError::Input("top_k must be at least 1".to_string()));
        }

        let image = state.preprocessor.preprocess(source)?;
        let scores = state.model.score(&image)?;
        rank_predictions(&scores, &state.labels, top_k)
    }

    /// ヘルスチェック（ブロックしない）
    pub fn health(&self) -> Health {
        let phase = self.phase();
        Health {
            ready: phase == ServicePhase::Ready,
            class_count: self.class_count.load(Ordering::Acquire),
            phase,
            device: self.device_name.clone(),
        }
    }

    /// 新規リクエストの受付を止める。以降の `infer` は `NotReady`。
    ///
    /// `Ready` か `Initializing` のときだけ `ShuttingDown` に遷移し、遷移したら `true`。
    pub fn begin_shutdown(&self) -> bool {
        for from in [ServicePhase::Ready, ServicePhase::Initializing] {
            if self
                .phase
                .compare_exchange(
                    from as u8,
                    ServicePhase::ShuttingDown as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                tracing::info!(from = %from, "shutting down inference service");
                return true;
            }
        }
        false
    }

    /// 停止して状態を手放す（処理中のリクエストが終わった後に呼ぶ）
    pub fn shutdown(&self) {
        self.begin_shutdown();
        if self
            .phase
            .compare_exchange(
                ServicePhase::ShuttingDown as u8,
                ServicePhase::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.write_state().take();
            self.class_count.store(0, Ordering::Release);
            tracing::info!("inference service stopped");
        }
    }
}
