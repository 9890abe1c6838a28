//! Core types, error definitions, and layout constants for road_dataset.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type DatasetResult<T> = Result<T, RoadDatasetError>;

/// Ground-truth colour marking "not road" pixels.
pub const BACKGROUND_COLOR: [u8; 3] = [255, 0, 0];
/// Label channels: 0 = not road, 1 = road.
pub const NUM_LABEL_CLASSES: usize = 2;

pub const TRAINING_DIR: &str = "data_road/training";
pub const TESTING_DIR: &str = "data_road/testing";
pub const IMAGE_SUBDIR: &str = "image_2";
pub const LABEL_SUBDIR: &str = "gt_image_2";

#[derive(Debug, Error)]
pub enum RoadDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no ground-truth mask for training image {image}")]
    MissingLabel { image: PathBuf },
    #[error("dataset directory missing: {path}")]
    MissingDir { path: PathBuf },
    #[error("dataset directory has no png files: {path}")]
    Empty { path: PathBuf },
    #[error("invalid dataset config: {0}")]
    Config(String),
}

/// A training image and its ground-truth mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePair {
    pub image: PathBuf,
    pub label: PathBuf,
}

/// A decoded, resized sample in CHW layout.
#[derive(Debug, Clone)]
pub struct RoadSample {
    /// Image normalized to [0, 1], shape `[3, height, width]`.
    pub image_chw: Vec<f32>,
    /// One-hot label, shape `[2, height, width]`.
    pub label_chw: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

/// Resolved dataset directories under a data root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLayout {
    pub training_images: PathBuf,
    pub training_labels: PathBuf,
    pub testing_images: PathBuf,
}

impl DataLayout {
    pub fn new(data_dir: &Path) -> Self {
        let training = data_dir.join(TRAINING_DIR);
        Self {
            training_images: training.join(IMAGE_SUBDIR),
            training_labels: training.join(LABEL_SUBDIR),
            testing_images: data_dir.join(TESTING_DIR).join(IMAGE_SUBDIR),
        }
    }
}
