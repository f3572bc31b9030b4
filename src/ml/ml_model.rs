//! 多肉植物分類用CNNモデルの定義

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// 標準の入力画像サイズ
pub const IMAGE_SIZE: usize = 224;

/// バックボーン最終層のチャネル数（= 分類ヘッドの入力次元）
pub const FEATURE_DIM: usize = 128;

/// 最小入力サイズ（2x2プーリング3回）
pub const MIN_IMAGE_SIZE: usize = 8;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率（推論バックエンドでは無効）
    #[config(default = 0.2)]
    pub dropout: f64,
}

impl ModelConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> SucculentClassifier<B> {
        SucculentClassifier {
            conv1: Conv2dConfig::new([3, 32], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            conv2: Conv2dConfig::new([32, 64], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            conv3: Conv2dConfig::new([64, FEATURE_DIM], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            head: LinearConfig::new(FEATURE_DIM, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// 多肉植物分類用CNN
///
/// # アーキテクチャ
/// - {Conv 3x3 (same padding) + ReLU + MaxPool 2x2} x 3層 (3 -> 32 -> 64 -> 128)
/// - Global Average Pooling -> 128次元
/// - Dropout
/// - FC: 128 -> num_classes
///
/// Global Average Poolingにより入力解像度に依存せずヘッドの形状が決まる。
#[derive(Module, Debug)]
pub struct SucculentClassifier<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,
    global_pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    pub(crate) head: Linear<B>,
    activation: Relu,
}

impl<B: Backend> SucculentClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.block(&self.conv1, images);
        let x = self.block(&self.conv2, x);
        let x = self.block(&self.conv3, x);

        let x = self.global_pool.forward(x);
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.dropout.forward(x);
        self.head.forward(x)
    }

    fn block(&self, conv: &Conv2d<B>, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = conv.forward(x);
        let x = self.activation.forward(x);
        self.pool.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_output_width_matches_num_classes() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(5).init::<TestBackend>(&device);

        for size in [MIN_IMAGE_SIZE, 20, 33] {
            let images = Tensor::<TestBackend, 4>::zeros([2, 3, size, size], &device);
            assert_eq!(model.forward(images).dims(), [2, 5]);
        }
    }

    #[test]
    fn test_head_shape() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(7).init::<TestBackend>(&device);
        assert_eq!(model.head.weight.val().dims(), [FEATURE_DIM, 7]);
    }
}
