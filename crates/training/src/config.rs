use serde::{Deserialize, Serialize};
use std::path::Path;
use std::{fs, io};

/// Fixed learning rate for every Adam step.
pub const LEARNING_RATE: f64 = 1e-4;
/// Dropout keep probability used while training.
pub const KEEP_PROB: f64 = 1.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Settings for one training run. Saved next to the outputs as `run_config.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Hyperparameters {
    pub num_classes: usize,
    /// (height, width) every image is resized to.
    pub image_shape: (usize, usize),
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub keep_prob: f64,
    /// Stop gradients at the backbone so only the decoder trains.
    pub freeze_backbone: bool,
    /// Add the decoder's L2 penalty to the minimized loss.
    pub include_regularization: bool,
    pub seed: Option<u64>,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            num_classes: 2,
            image_shape: (160, 576),
            epochs: 21,
            batch_size: 40,
            learning_rate: LEARNING_RATE,
            keep_prob: KEEP_PROB,
            freeze_backbone: false,
            include_regularization: false,
            seed: None,
        }
    }
}

impl Hyperparameters {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_classes == 0 {
            return Err(ConfigError::Validation(
                "num_classes must be greater than 0".into(),
            ));
        }
        let (height, width) = self.image_shape;
        if height == 0 || width == 0 || height % 32 != 0 || width % 32 != 0 {
            return Err(ConfigError::Validation(format!(
                "image_shape must be a non-zero multiple of 32, got {height}x{width}"
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Validation(
                "batch_size must be greater than 0".into(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::Validation(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "keep_prob must be within (0, 1], got {}",
                self.keep_prob
            )));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        let hyper: Self = serde_json::from_str(&json)?;
        hyper.validate()?;
        Ok(hyper)
    }
}
