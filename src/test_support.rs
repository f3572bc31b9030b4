//! テスト用のアーティファクト生成

use burn_ndarray::{NdArray, NdArrayDevice};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::ml::{model_to_bytes, ModelConfig};
use crate::model::{save_checkpoint, CheckpointMetadata, ModelSettings};

pub type TestBackend = NdArray<f32>;

/// テストで使う入力解像度
pub const FIXTURE_IMAGE_SIZE: u32 = 16;

pub struct Fixture {
    pub dir: TempDir,
    pub settings: ModelSettings,
}

/// ランダム初期化したモデルのチェックポイントとラベルファイルを書き出す
pub fn write_fixture(num_classes: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let classes: Vec<String> = (0..num_classes).map(|i| format!("species_{}", i)).collect();

    let model = ModelConfig::new(num_classes).init::<TestBackend>(&NdArrayDevice::Cpu);
    let bytes = model_to_bytes(model).unwrap();
    let metadata = CheckpointMetadata::new(classes.clone(), FIXTURE_IMAGE_SIZE, 5, Some(90.0));
    let checkpoint = save_checkpoint(&dir.path().join("model.tar.gz"), &metadata, &bytes).unwrap();

    let labels: serde_json::Map<String, serde_json::Value> = classes
        .iter()
        .enumerate()
        .map(|(i, c)| (i.to_string(), serde_json::Value::String(c.clone())))
        .collect();
    let labels_path = dir.path().join("labels.json");
    std::fs::write(&labels_path, serde_json::to_string(&labels).unwrap()).unwrap();

    let settings = ModelSettings {
        checkpoint_path: checkpoint.to_string_lossy().to_string(),
        labels_path: labels_path.to_string_lossy().to_string(),
        top_k: 3,
        image_size: FIXTURE_IMAGE_SIZE,
        replicas: Some(2),
    };

    Fixture { dir, settings }
}

/// グラデーションのPNGを書き出す
pub fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    png_image(width, height).save_with_format(&path, ImageFormat::Png).unwrap();
    path
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    png_image(width, height).write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

fn png_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 9 % 256) as u8, (y * 4 % 256) as u8, ((x * y) % 256) as u8])
    }))
}
