//! 推論用の画像前処理
//!
//! デコード → RGB変換 → 正方形リサイズ → ImageNet正規化 を行う純粋関数です。
//! 学習時のデータ拡張（反転・回転など）は含みません。

use image::{imageops::FilterType, DynamicImage, RgbImage};
use std::path::{Path, PathBuf};

use crate::error::{InferenceError, Result};

/// ImageNetのチャネル平均
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetのチャネル標準偏差
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// リサイズに使うフィルタ（バイリニア）
const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// 入力画像の参照
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// ローカルファイル
    Path(PathBuf),
    /// アップロードされたバイト列
    Bytes(Vec<u8>),
}

/// 前処理済み画像 (C, H, W) の順で平坦化
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedImage {
    data: Vec<f32>,
    size: usize,
}

impl PreprocessedImage {
    /// [チャネル, 高さ, 幅]
    pub fn shape(&self) -> [usize; 3] {
        [3, self.size, self.size]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// 画像前処理器
#[derive(Debug, Clone)]
pub struct Preprocessor {
    image_size: u32,
}

impl Preprocessor {
    pub fn new(image_size: u32) -> Self {
        Self { image_size }
    }

    pub fn preprocess(&self, source: &ImageSource) -> Result<PreprocessedImage> {
        match source {
            ImageSource::Path(path) => self.preprocess_path(path),
            ImageSource::Bytes(bytes) => self.preprocess_bytes(bytes),
        }
    }

    /// ファイルから読み込んで前処理
    pub fn preprocess_path(&self, path: &Path) -> Result<PreprocessedImage> {
        if !path.is_file() {
            return Err(InferenceError::NotFound(path.display().to_string()));
        }
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => InferenceError::NotFound(path.display().to_string()),
            _ => InferenceError::Input(format!("cannot read image file: {}", e)),
        })?;
        self.preprocess_bytes(&bytes)
    }

    /// エンコード済みバイト列から前処理
    pub fn preprocess_bytes(&self, bytes: &[u8]) -> Result<PreprocessedImage> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| InferenceError::Input(format!("cannot decode image: {}", e)))?;
        if image.width() == 0 || image.height() == 0 {
            return Err(InferenceError::Input("image has zero width or height".to_string()));
        }
        Ok(self.preprocess_image(&image))
    }

    /// デコード済み画像を前処理
    pub fn preprocess_image(&self, image: &DynamicImage) -> PreprocessedImage {
        let rgb = to_rgb(image);
        let resized = self.resize(rgb);
        normalize(&resized)
    }

    fn resize(&self, rgb: RgbImage) -> RgbImage {
        let size = self.image_size;
        if rgb.dimensions() == (size, size) {
            return rgb;
        }
        image::imageops::resize(&rgb, size, size, RESIZE_FILTER)
    }
}

/// 3チャネル8bit RGBへ変換（RGB8はそのまま）
///
/// グレースケールは各チャネルに複製、アルファは破棄、16bit/浮動小数は8bitへ量子化。
fn to_rgb(image: &DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb.clone(),
        other => other.to_rgb8(),
    }
}

fn normalize(img: &RgbImage) -> PreprocessedImage {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let pixel = img.get_pixel(x, y);
                let value = pixel[channel] as f32 / 255.0;
                data.push((value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel]);
            }
        }
    }

    PreprocessedImage {
        data,
        size: width as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageFormat, Luma, Rgb, Rgba, RgbaImage};
    use std::io::Cursor;

    fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, format).unwrap();
        buffer.into_inner()
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn test_output_shape_for_any_source() {
        let preprocessor = Preprocessor::new(32);
        let sources = vec![
            DynamicImage::ImageRgb8(gradient(640, 480)),
            DynamicImage::ImageRgb8(gradient(17, 300)),
            DynamicImage::ImageLuma8(GrayImage::from_pixel(50, 50, Luma([128]))),
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 40, Rgba([1, 2, 3, 0]))),
        ];

        for source in sources {
            let out = preprocessor.preprocess_bytes(&encode(&source, ImageFormat::Png)).unwrap();
            assert_eq!(out.shape(), [3, 32, 32]);
            assert_eq!(out.as_slice().len(), 3 * 32 * 32);
        }
    }

    #[test]
    fn test_deterministic() {
        let preprocessor = Preprocessor::new(24);
        let bytes = encode(&DynamicImage::ImageRgb8(gradient(100, 60)), ImageFormat::Png);

        let first = preprocessor.preprocess_bytes(&bytes).unwrap();
        let second = preprocessor.preprocess_bytes(&bytes).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rgb_conversion_is_idempotent() {
        let rgb = DynamicImage::ImageRgb8(gradient(9, 9));
        assert_eq!(to_rgb(&rgb), to_rgb(&DynamicImage::ImageRgb8(to_rgb(&rgb))));
    }

    #[test]
    fn test_grayscale_replicated_across_channels() {
        let preprocessor = Preprocessor::new(8);
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([255])));
        let out = preprocessor.preprocess_image(&gray);

        let plane = 8 * 8;
        for channel in 0..3 {
            let expected = (1.0 - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
            let value = out.as_slice()[channel * plane];
            assert!((value - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_normalization_of_black_pixel() {
        let preprocessor = Preprocessor::new(8);
        let black = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])));
        let out = preprocessor.preprocess_image(&black);

        let plane = 8 * 8;
        for channel in 0..3 {
            let expected = -IMAGENET_MEAN[channel] / IMAGENET_STD[channel];
            assert!(out.as_slice()[channel * plane..(channel + 1) * plane]
                .iter()
                .all(|v| (v - expected).abs() < 1e-6));
        }
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let preprocessor = Preprocessor::new(8);

        let missing = preprocessor.preprocess_path(&dir.path().join("nope.jpg"));
        assert!(matches!(missing, Err(InferenceError::NotFound(_))));

        // ディレクトリもファイルではない
        let dir_result = preprocessor.preprocess_path(dir.path());
        assert!(matches!(dir_result, Err(InferenceError::NotFound(_))));
    }

    #[test]
    fn test_corrupt_bytes_is_input_error() {
        let preprocessor = Preprocessor::new(8);
        let result = preprocessor.preprocess_bytes(b"this is not an image");
        assert!(matches!(result, Err(InferenceError::Input(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0x00, 0x01]).unwrap();
        let result = preprocessor.preprocess(&ImageSource::Path(path));
        assert!(matches!(result, Err(InferenceError::Input(_))));
    }

    #[test]
    fn test_path_and_bytes_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plant.png");
        let bytes = encode(&DynamicImage::ImageRgb8(gradient(40, 30)), ImageFormat::Png);
        std::fs::write(&path, &bytes).unwrap();

        let preprocessor = Preprocessor::new(16);
        let from_path = preprocessor.preprocess(&ImageSource::Path(path)).unwrap();
        let from_bytes = preprocessor.preprocess(&ImageSource::Bytes(bytes)).unwrap();
        assert_eq!(from_path, from_bytes);
    }
}
