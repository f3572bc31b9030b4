pub mod checkpoint_metadata;
pub mod checkpoint_storage;
pub mod label_table;
pub mod config;

pub use checkpoint_metadata::CheckpointMetadata;
pub use checkpoint_storage::{save_checkpoint, load_checkpoint};
pub use label_table::LabelTable;
pub use config::{AppConfig, DeviceType, ModelSettings, ServerSettings};
