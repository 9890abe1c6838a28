//! KITTI road dataset loading and Burn-compatible batching.
//!
//! This crate provides utilities for:
//! - Pairing training images with their `_road_` ground-truth masks
//! - Checking the on-disk dataset layout before a run
//! - Resizing, augmentation and one-hot label encoding
//! - Lazy, shuffled batch iteration into `[N, C, H, W]` tensors

pub mod aug;
pub mod batch;
pub mod index;
pub mod types;
pub mod validation;

pub use aug::{encode_label, image_to_chw, DatasetConfig, TransformPipeline};
pub use batch::{BatchIter, RoadBatch};
pub use index::{index_images, index_training_pairs, label_key, RoadDataset};
pub use types::*;
pub use validation::{verify_layout, LayoutSummary};
