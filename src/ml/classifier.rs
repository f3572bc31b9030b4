//! チェックポイントからの分類モデル読み込みとスコア計算

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor, TensorData},
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use crate::error::{InferenceError, Result};
use crate::ml::ml_model::{ModelConfig, SucculentClassifier, SucculentClassifierRecord, FEATURE_DIM, MIN_IMAGE_SIZE};
use crate::ml::preprocessing::PreprocessedImage;
use crate::model::{load_checkpoint, CheckpointMetadata};

type WeightsRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// 読み込み済みの分類モデル
///
/// `score` は `&self` で呼べる。burnのモジュールは `Send` だが `Sync` ではないため、
/// 重みを共有するレプリカを複数保持し、空いているものを使う。
pub struct ClassifierModel<B: Backend> {
    replicas: Vec<Mutex<SucculentClassifier<B>>>,
    next_replica: AtomicUsize,
    device: B::Device,
    num_classes: usize,
    metadata: CheckpointMetadata,
}

impl<B: Backend> ClassifierModel<B> {
    /// チェックポイントを読み込んでモデルを構築
    ///
    /// チェックポイントのクラス数・分類ヘッドの形状が `num_classes` と一致しない場合は
    /// `InferenceError::Config`。
    pub fn load(checkpoint_path: &Path, num_classes: usize, replicas: usize, device: &B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_checkpoint(checkpoint_path)
            .map_err(|e| InferenceError::Config(format!("cannot load checkpoint: {:#}", e)))?;

        if metadata.num_classes() != num_classes {
            return Err(InferenceError::Config(format!(
                "checkpoint was trained on {} classes but the label table has {}",
                metadata.num_classes(),
                num_classes
            )));
        }
        if (metadata.model_input_size as usize) < MIN_IMAGE_SIZE {
            return Err(InferenceError::Config(format!(
                "checkpoint input size {} is below the minimum {}",
                metadata.model_input_size, MIN_IMAGE_SIZE
            )));
        }

        let record: SucculentClassifierRecord<B> = WeightsRecorder::default()
            .load(model_binary, device)
            .map_err(|e| InferenceError::Config(format!("cannot decode model weights: {:?}", e)))?;

        check_head_shape(&record, num_classes)?;

        let model = ModelConfig::new(num_classes)
            .with_dropout(0.0)
            .init::<B>(device)
            .load_record(record);

        let replicas = (0..replicas.max(1))
            .map(|_| Mutex::new(model.clone()))
            .collect();

        Ok(Self {
            replicas,
            next_replica: AtomicUsize::new(0),
            device: device.clone(),
            num_classes,
            metadata,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// 学習時の入力解像度
    pub fn image_size(&self) -> u32 {
        self.metadata.model_input_size
    }

    pub fn metadata(&self) -> &CheckpointMetadata {
        &self.metadata
    }

    /// 生スコア（ロジット）を計算。確率ではない。
    pub fn score(&self, image: &PreprocessedImage) -> Result<Vec<f32>> {
        let [channels, height, width] = image.shape();
        if height != self.image_size() as usize {
            return Err(InferenceError::Internal(format!(
                "preprocessed image is {}x{} but the model expects {}x{}",
                height,
                width,
                self.image_size(),
                self.image_size()
            )));
        }

        let data = TensorData::new(image.as_slice().to_vec(), [1, channels, height, width]);
        let tensor = Tensor::<B, 4>::from_data(data, &self.device);

        let output = {
            let model = self.acquire();
            model.forward(tensor)
        };

        let scores = output
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| InferenceError::Internal(format!("cannot read model output: {:?}", e)))?;

        if scores.len() != self.num_classes {
            return Err(InferenceError::Internal(format!(
                "model produced {} scores, expected {}",
                scores.len(),
                self.num_classes
            )));
        }
        Ok(scores)
    }

    /// 空いているレプリカを取得（全て使用中なら順番のものを待つ）
    ///
    /// 推論は重みを変更しないため、poisonされたロックもそのまま使う。
    fn acquire(&self) -> MutexGuard<'_, SucculentClassifier<B>> {
        let count = self.replicas.len();
        let start = self.next_replica.fetch_add(1, Ordering::Relaxed) % count;

        for offset in 0..count {
            match self.replicas[(start + offset) % count].try_lock() {
                Ok(guard) => return guard,
                Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => continue,
            }
        }

        self.replicas[start]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// 分類ヘッドの形状が [FEATURE_DIM, num_classes] であることを確認
fn check_head_shape<B: Backend>(record: &SucculentClassifierRecord<B>, num_classes: usize) -> Result<()> {
    let weight_dims = record.head.weight.val().dims();
    if weight_dims != [FEATURE_DIM, num_classes] {
        return Err(InferenceError::Config(format!(
            "checkpoint head weight has shape {:?}, expected {:?} for {} classes",
            weight_dims,
            [FEATURE_DIM, num_classes],
            num_classes
        )));
    }
    if let Some(bias) = &record.head.bias {
        let bias_dims = bias.val().dims();
        if bias_dims != [num_classes] {
            return Err(InferenceError::Config(format!(
                "checkpoint head bias has shape {:?}, expected [{}]",
                bias_dims, num_classes
            )));
        }
    }
    Ok(())
}

/// モデルの重みをチェックポイント用のバイト列に変換
pub fn model_to_bytes<B: Backend>(model: SucculentClassifier<B>) -> anyhow::Result<Vec<u8>> {
    <WeightsRecorder as Recorder<B>>::record(&WeightsRecorder::default(), model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::preprocessing::Preprocessor;
    use crate::model::save_checkpoint;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{DynamicImage, Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    fn write_checkpoint(dir: &Path, classes: usize, head_width: usize, input_size: u32) -> std::path::PathBuf {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(head_width).init::<TestBackend>(&device);
        let bytes = model_to_bytes(model).unwrap();
        let metadata = CheckpointMetadata::new(
            (0..classes).map(|i| format!("class_{}", i)).collect(),
            input_size,
            3,
            Some(88.0),
        );
        save_checkpoint(&dir.join("model.tar.gz"), &metadata, &bytes).unwrap()
    }

    fn sample_image(size: u32) -> PreprocessedImage {
        let img = RgbImage::from_fn(40, 30, |x, y| Rgb([x as u8 * 6, y as u8 * 8, 100]));
        Preprocessor::new(size).preprocess_image(&DynamicImage::ImageRgb8(img))
    }

    #[test]
    fn test_load_and_score() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_checkpoint(dir.path(), 4, 4, 16);

        let model = ClassifierModel::<TestBackend>::load(&path, 4, 2, &NdArrayDevice::Cpu).unwrap();
        assert_eq!(model.num_classes(), 4);
        assert_eq!(model.image_size(), 16);
        assert_eq!(model.metadata().val_acc, Some(88.0));

        let scores = model.score(&sample_image(16)).unwrap();
        assert_eq!(scores.len(), 4);
        assert!(scores.iter().all(|s| s.is_finite()));

        // 同じ入力なら同じスコア（レプリカが違っても）
        let again = model.score(&sample_image(16)).unwrap();
        assert_eq!(scores, again);
    }

    #[test]
    fn test_class_count_mismatch_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_checkpoint(dir.path(), 4, 4, 16);

        let result = ClassifierModel::<TestBackend>::load(&path, 3, 1, &NdArrayDevice::Cpu);
        assert!(matches!(result, Err(InferenceError::Config(_))));
    }

    #[test]
    fn test_head_width_mismatch_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        // メタデータは3クラスだが重みのヘッドは5クラス
        let path = write_checkpoint(dir.path(), 3, 5, 16);

        match ClassifierModel::<TestBackend>::load(&path, 3, 1, &NdArrayDevice::Cpu) {
            Err(InferenceError::Config(msg)) => assert!(msg.contains("head weight")),
            other => panic!("expected config error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_missing_checkpoint_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ClassifierModel::<TestBackend>::load(&dir.path().join("none.tar.gz"), 3, 1, &NdArrayDevice::Cpu);
        assert!(matches!(result, Err(InferenceError::Config(_))));
    }

    #[test]
    fn test_corrupt_weights_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = CheckpointMetadata::new(vec!["a".into(), "b".into()], 16, 1, None);
        let path = save_checkpoint(&dir.path().join("bad"), &metadata, b"not a record").unwrap();

        let result = ClassifierModel::<TestBackend>::load(&path, 2, 1, &NdArrayDevice::Cpu);
        assert!(matches!(result, Err(InferenceError::Config(_))));
    }

    #[test]
    fn test_wrong_image_size_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_checkpoint(dir.path(), 2, 2, 16);
        let model = ClassifierModel::<TestBackend>::load(&path, 2, 1, &NdArrayDevice::Cpu).unwrap();

        let result = model.score(&sample_image(24));
        assert!(matches!(result, Err(InferenceError::Internal(_))));
    }
}
