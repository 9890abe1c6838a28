use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use image::imageops::FilterType;
use models::{DecoderError, Fcn8};
use road_dataset::{image_to_chw, index_images, RoadDatasetError};
use thiserror::Error;
use vision_core::overlay::{blend_mask, mask_layer, ROAD_TINT};

/// Pixels whose road probability exceeds this are tinted.
pub const ROAD_THRESHOLD: f32 = 0.5;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Dataset(#[from] RoadDatasetError),
    #[error(transparent)]
    Decoder(#[from] DecoderError),
    #[error("model has {0} output classes; road overlays need at least 2")]
    Classes(usize),
    #[error("could not read tensor data: {0}")]
    Tensor(String),
    #[error("overlay size mismatch for {path}")]
    Overlay { path: PathBuf },
}

/// Owns one run's output directory.
#[derive(Debug, Clone)]
pub struct SampleWriter {
    run_dir: PathBuf,
}

impl SampleWriter {
    /// Create `<runs_dir>/<unix seconds>`.
    pub fn new(runs_dir: &Path) -> Result<Self, SamplerError> {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self::at(runs_dir.join(secs.to_string()))
    }

    /// Use `run_dir` as the output directory, replacing whatever is already there.
    pub fn at(run_dir: PathBuf) -> Result<Self, SamplerError> {
        if run_dir.exists() {
            tracing::warn!(path = %run_dir.display(), "removing stale run directory");
            fs::remove_dir_all(&run_dir).map_err(|e| SamplerError::Io {
                path: run_dir.clone(),
                source: e,
            })?;
        }
        fs::create_dir_all(&run_dir).map_err(|e| SamplerError::Io {
            path: run_dir.clone(),
            source: e,
        })?;
        Ok(Self { run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Save `img` as `<run_dir>/<name>`.
    pub fn write(&self, name: &str, img: &image::RgbImage) -> Result<PathBuf, SamplerError> {
        let path = self.run_dir.join(name);
        img.save(&path).map_err(|e| SamplerError::Image {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }
}

/// Softmax over the class axis, keeping only the road channel: `[N, H, W]`.
pub fn road_probabilities<B: Backend>(logits: Tensor<B, 4>) -> Result<Tensor<B, 3>, SamplerError> {
    let [n, classes, h, w] = logits.dims();
    if classes < 2 {
        return Err(SamplerError::Classes(classes));
    }
    Ok(softmax(logits, 1)
        .slice([0..n, 1..2, 0..h, 0..w])
        .reshape([n, h, w]))
}

/// Threshold road probabilities into a row-major mask.
pub fn road_mask(probs: &[f32], threshold: f32) -> Vec<bool> {
    probs.iter().map(|p| *p > threshold).collect()
}

/// Run `model` over every test image and write one overlay per image.
///
/// Images are resized to `image_shape` (height, width) first, so overlays come out at
/// the training resolution.
pub fn save_inference_samples<B: Backend>(
    model: &Fcn8<B>,
    writer: &SampleWriter,
    test_dir: &Path,
    image_shape: (usize, usize),
    device: &B::Device,
) -> Result<Vec<PathBuf>, SamplerError> {
    let (height, width) = image_shape;
    let images = index_images(test_dir)?;
    tracing::info!(
        count = images.len(),
        out = %writer.run_dir().display(),
        "saving inference samples"
    );

    let mut written = Vec::with_capacity(images.len());
    for path in images {
        let img = image::open(&path)
            .map_err(|e| SamplerError::Image {
                path: path.clone(),
                source: e,
            })?
            .to_rgb8();
        let img = image::imageops::resize(&img, width as u32, height as u32, FilterType::Triangle);

        let input = Tensor::<B, 4>::from_data(
            TensorData::new(image_to_chw(&img), [1, 3, height, width]),
            device,
        );
        let logits = model.forward(input, 1.0)?;
        let probs = road_probabilities(logits)?
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| SamplerError::Tensor(format!("{e:?}")))?;

        let mask = road_mask(&probs, ROAD_THRESHOLD);
        let overlay = mask_layer(&mask, (width as u32, height as u32), ROAD_TINT)
            .and_then(|layer| blend_mask(&img, &layer))
            .ok_or_else(|| SamplerError::Overlay { path: path.clone() })?;

        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("sample.png");
        let out = writer.write(name, &overlay)?;
        tracing::debug!(
            image = %path.display(),
            road_pixels = mask.iter().filter(|m| **m).count(),
            "wrote overlay"
        );
        written.push(out);
    }
    Ok(written)
}
