//! Indexing KITTI road images and pairing them with ground-truth masks.

use crate::aug::DatasetConfig;
use crate::batch::BatchIter;
use crate::types::{DataLayout, DatasetResult, RoadDatasetError, SamplePair};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Map a ground-truth filename to the image it annotates.
///
/// `um_road_000000.png` annotates `um_000000.png`. Lane masks are not labels.
pub fn label_key(label_name: &str) -> Option<String> {
    if !label_name.ends_with(".png") {
        return None;
    }
    let idx = label_name.find("_road_")?;
    Some(format!("{}_{}", &label_name[..idx], &label_name[idx + 6..]))
}

/// Sorted list of `*.png` files directly inside `dir`.
pub fn index_images(dir: &Path) -> DatasetResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| RoadDatasetError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let mut images: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().and_then(|s| s.to_str()) == Some("png"))
        .collect();
    images.sort();
    Ok(images)
}

/// Pair every image in `images_dir` with its mask in `labels_dir`.
pub fn index_training_pairs(images_dir: &Path, labels_dir: &Path) -> DatasetResult<Vec<SamplePair>> {
    let mut labels: HashMap<String, PathBuf> = HashMap::new();
    for path in index_images(labels_dir)? {
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(key) = label_key(name) {
            labels.insert(key, path);
        }
    }

    let mut pairs = Vec::new();
    for image in index_images(images_dir)? {
        let name = image
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        match labels.get(&name) {
            Some(label) => pairs.push(SamplePair {
                image,
                label: label.clone(),
            }),
            None => return Err(RoadDatasetError::MissingLabel { image }),
        }
    }
    Ok(pairs)
}

/// The training split of a KITTI road dataset.
#[derive(Debug, Clone)]
pub struct RoadDataset {
    pairs: Vec<SamplePair>,
    cfg: DatasetConfig,
}

impl RoadDataset {
    /// Index `<data_dir>/data_road/training`.
    pub fn open(data_dir: &Path, cfg: DatasetConfig) -> DatasetResult<Self> {
        let layout = DataLayout::new(data_dir);
        let pairs = index_training_pairs(&layout.training_images, &layout.training_labels)?;
        tracing::info!(
            samples = pairs.len(),
            root = %layout.training_images.display(),
            "indexed road training set"
        );
        Self::from_pairs(pairs, cfg)
    }

    pub fn from_pairs(pairs: Vec<SamplePair>, cfg: DatasetConfig) -> DatasetResult<Self> {
        cfg.validate()?;
        Ok(Self { pairs, cfg })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[SamplePair] {
        &self.pairs
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.cfg
    }

    /// Number of batches one pass yields (the last partial batch counts).
    pub fn batches_per_epoch(&self, batch_size: usize) -> usize {
        self.pairs.len().div_ceil(batch_size.max(1))
    }

    /// A fresh, shuffled pass over the dataset.
    pub fn iter_epoch(&self, epoch: usize) -> BatchIter {
        BatchIter::new(self.pairs.clone(), self.cfg.clone(), epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::label_key;

    #[test]
    fn road_masks_map_to_images() {
        assert_eq!(label_key("um_road_000000.png").as_deref(), Some("um_000000.png"));
        assert_eq!(label_key("uu_road_000097.png").as_deref(), Some("uu_000097.png"));
        assert_eq!(label_key("um_lane_000000.png"), None);
        assert_eq!(label_key("um_road_000000.json"), None);
    }
}
