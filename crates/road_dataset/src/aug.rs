//! Resizing, augmentation and label encoding.

use crate::types::{
    DatasetResult, RoadDatasetError, RoadSample, SamplePair, BACKGROUND_COLOR, NUM_LABEL_CLASSES,
};
use image::imageops::FilterType;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Target (height, width) every image and mask is resized to.
    pub image_shape: (u32, u32),
    /// Probability of flipping image and mask horizontally.
    pub flip_horizontal_prob: f32,
    /// Shuffle samples at the start of every epoch.
    pub shuffle: bool,
    /// Seed for reproducible shuffling and augmentation.
    pub seed: Option<u64>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            image_shape: (160, 576),
            flip_horizontal_prob: 0.0,
            shuffle: true,
            seed: None,
        }
    }
}

impl DatasetConfig {
    pub fn validate(&self) -> DatasetResult<()> {
        let (h, w) = self.image_shape;
        if h == 0 || w == 0 {
            return Err(RoadDatasetError::Config(format!(
                "image_shape must be non-zero, got {h}x{w}"
            )));
        }
        let p = self.flip_horizontal_prob;
        if !(0.0..=1.0).contains(&p) {
            return Err(RoadDatasetError::Config(format!(
                "flip_horizontal_prob must be within [0, 1], got {p}"
            )));
        }
        Ok(())
    }
}

/// Per-sample augmentation decisions, drawn up front so loading can run in parallel.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformPipeline {
    pub flip: bool,
}

impl TransformPipeline {
    pub fn draw(cfg: &DatasetConfig, rng: &mut impl Rng) -> Self {
        let flip = cfg.flip_horizontal_prob > 0.0 && rng.random_range(0.0..1.0) < cfg.flip_horizontal_prob;
        Self { flip }
    }
}

/// Decode, resize and encode one image/mask pair.
pub(crate) fn load_sample(
    pair: &SamplePair,
    image_shape: (u32, u32),
    transform: TransformPipeline,
) -> DatasetResult<RoadSample> {
    let (height, width) = image_shape;
    let mut img = image::imageops::resize(
        &open_rgb(&pair.image)?,
        width,
        height,
        FilterType::Triangle,
    );
    // Nearest keeps mask colours exact.
    let mut mask = image::imageops::resize(
        &open_rgb(&pair.label)?,
        width,
        height,
        FilterType::Nearest,
    );

    if transform.flip {
        image::imageops::flip_horizontal_in_place(&mut img);
        image::imageops::flip_horizontal_in_place(&mut mask);
    }

    Ok(RoadSample {
        image_chw: image_to_chw(&img),
        label_chw: encode_label(&mask),
        width,
        height,
    })
}

fn open_rgb(path: &std::path::Path) -> DatasetResult<image::RgbImage> {
    Ok(image::open(path)
        .map_err(|e| RoadDatasetError::Image {
            path: path.to_path_buf(),
            source: e,
        })?
        .to_rgb8())
}

/// RGB image to CHW floats in [0, 1].
pub fn image_to_chw(img: &image::RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut chw = vec![0.0f32; plane * 3];
    for (x, y, pixel) in img.enumerate_pixels() {
        let base = (y * width + x) as usize;
        chw[base] = pixel[0] as f32 / 255.0;
        chw[plane + base] = pixel[1] as f32 / 255.0;
        chw[2 * plane + base] = pixel[2] as f32 / 255.0;
    }
    chw
}

/// One-hot encode a ground-truth mask: channel 0 marks background-coloured
/// pixels, channel 1 everything else.
pub fn encode_label(mask: &image::RgbImage) -> Vec<f32> {
    let (width, height) = mask.dimensions();
    let plane = (width * height) as usize;
    let mut chw = vec![0.0f32; plane * NUM_LABEL_CLASSES];
    for (x, y, pixel) in mask.enumerate_pixels() {
        let base = (y * width + x) as usize;
        let background = pixel.0 == BACKGROUND_COLOR;
        chw[base] = if background { 1.0 } else { 0.0 };
        chw[plane + base] = if background { 0.0 } else { 1.0 };
    }
    chw
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn label_channels_are_complementary() {
        let mut mask = image::RgbImage::new(2, 1);
        mask.put_pixel(0, 0, image::Rgb(BACKGROUND_COLOR));
        mask.put_pixel(1, 0, image::Rgb([255, 0, 255]));
        assert_eq!(encode_label(&mask), vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn chw_layout_splits_planes() {
        let mut img = image::RgbImage::new(2, 1);
        img.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        img.put_pixel(1, 0, image::Rgb([0, 0, 255]));
        assert_eq!(image_to_chw(&img), vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn flip_follows_its_probability() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let never = DatasetConfig::default();
        let always = DatasetConfig {
            flip_horizontal_prob: 1.0,
            ..Default::default()
        };
        for _ in 0..32 {
            assert!(!TransformPipeline::draw(&never, &mut rng).flip);
            assert!(TransformPipeline::draw(&always, &mut rng).flip);
        }
    }

    #[test]
    fn flip_mirrors_image_and_mask_together() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("um_000000.png");
        let label = dir.path().join("um_road_000000.png");
        let mut img = image::RgbImage::from_pixel(2, 1, image::Rgb([0, 0, 0]));
        img.put_pixel(0, 0, image::Rgb([255, 255, 255]));
        img.save(&image).unwrap();
        let mut mask = image::RgbImage::from_pixel(2, 1, image::Rgb(BACKGROUND_COLOR));
        mask.put_pixel(0, 0, image::Rgb([255, 0, 255]));
        mask.save(&label).unwrap();

        let pair = SamplePair { image, label };
        let sample = load_sample(&pair, (1, 2), TransformPipeline { flip: true }).unwrap();
        // The bright, road-labelled pixel moves from x=0 to x=1.
        assert_eq!(&sample.image_chw[..2], &[0.0, 1.0]);
        assert_eq!(sample.label_chw, vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn out_of_range_probability_is_rejected() {
        let cfg = DatasetConfig {
            flip_horizontal_prob: 1.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
