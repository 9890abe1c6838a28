#![recursion_limit = "256"]

pub mod config;
pub mod loss;
pub mod trainer;
pub mod util;

pub use config::{ConfigError, Hyperparameters, KEEP_PROB, LEARNING_RATE};
pub use loss::{build_objective, build_optimizer, LossConfig, LossError, Objective};
pub use trainer::{format_progress, train, BatchSource, DatasetSource, StepRecord, TrainReport};
pub use util::{run_train, TrainArgs};
/// Backend alias for training (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
