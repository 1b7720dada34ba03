pub mod augment;
pub mod config;
pub mod dataset;
pub mod metrics;
pub mod model;
pub mod tiling;
pub mod trainer;

pub use config::TrainingConfig;
pub use dataset::Split;
pub use trainer::{fit, Classifier, LoopOptions, SteelNetTrainer, StepOutput, TrainingReport};
