//! 多肉植物画像分類の推論コア
//!
//! ラベル表・前処理・分類モデル・推論サービスと、その上に載るHTTP境界を提供します。

pub mod error;
pub mod ml;
pub mod model;
pub mod server;
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{InferenceError, Result};
pub use ml::{ImageSource, Prediction};
pub use model::{AppConfig, DeviceType, LabelTable};
pub use service::{Health, InferenceService, ServicePhase};
