pub mod ml_model;
pub mod preprocessing;
pub mod classifier;
pub mod scoring;

pub use ml_model::{SucculentClassifier, ModelConfig, IMAGE_SIZE, FEATURE_DIM};
pub use preprocessing::{Preprocessor, PreprocessedImage, ImageSource, IMAGENET_MEAN, IMAGENET_STD};
pub use classifier::{ClassifierModel, model_to_bytes};
pub use scoring::{Prediction, rank_predictions, softmax};
