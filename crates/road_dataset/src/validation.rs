//! Pre-run checks on the dataset layout.

use crate::index::{index_images, index_training_pairs};
use crate::types::{DataLayout, DatasetResult, RoadDatasetError};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSummary {
    pub training_pairs: usize,
    pub training_labels: usize,
    pub testing_images: usize,
}

/// Confirm `<data_dir>` holds a usable KITTI road layout: every training image has
/// a `_road_` mask and the testing folder is non-empty.
pub fn verify_layout(data_dir: &Path) -> DatasetResult<LayoutSummary> {
    let layout = DataLayout::new(data_dir);
    for dir in [
        &layout.training_images,
        &layout.training_labels,
        &layout.testing_images,
    ] {
        if !dir.is_dir() {
            return Err(RoadDatasetError::MissingDir { path: dir.clone() });
        }
    }

    let pairs = index_training_pairs(&layout.training_images, &layout.training_labels)?;
    if pairs.is_empty() {
        return Err(RoadDatasetError::Empty {
            path: layout.training_images,
        });
    }
    let training_labels = index_images(&layout.training_labels)?.len();
    let testing_images = index_images(&layout.testing_images)?.len();
    if testing_images == 0 {
        return Err(RoadDatasetError::Empty {
            path: layout.testing_images,
        });
    }

    let summary = LayoutSummary {
        training_pairs: pairs.len(),
        training_labels,
        testing_images,
    };
    tracing::info!(
        training_pairs = summary.training_pairs,
        training_labels = summary.training_labels,
        testing_images = summary.testing_images,
        "dataset layout ok"
    );
    Ok(summary)
}
