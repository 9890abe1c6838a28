//! Lazy batch iteration for training.

use crate::aug::{load_sample, DatasetConfig, TransformPipeline};
use crate::types::{DatasetResult, SamplePair, NUM_LABEL_CLASSES};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::time::{Duration, Instant};

/// Images `[N, 3, H, W]` in [0, 1] and one-hot labels `[N, 2, H, W]`.
#[derive(Debug, Clone)]
pub struct RoadBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 4>,
}

/// One shuffled pass over a set of sample pairs.
pub struct BatchIter {
    pairs: Vec<SamplePair>,
    transforms: Vec<TransformPipeline>,
    cursor: usize,
    cfg: DatasetConfig,
    processed_batches: usize,
    total_load_time: Duration,
}

impl BatchIter {
    /// `epoch` is mixed into the seed so seeded runs reshuffle every epoch.
    pub fn new(mut pairs: Vec<SamplePair>, cfg: DatasetConfig, epoch: usize) -> Self {
        let mut rng = match cfg.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed ^ epoch as u64),
            None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
        };
        if cfg.shuffle {
            pairs.shuffle(&mut rng);
        }
        let transforms = pairs
            .iter()
            .map(|_| TransformPipeline::draw(&cfg, &mut rng))
            .collect();
        Self {
            pairs,
            transforms,
            cursor: 0,
            cfg,
            processed_batches: 0,
            total_load_time: Duration::ZERO,
        }
    }

    /// Pairs in iteration order.
    pub fn order(&self) -> &[SamplePair] {
        &self.pairs
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        batch_size: usize,
        device: &B::Device,
    ) -> DatasetResult<Option<RoadBatch<B>>> {
        if self.cursor >= self.pairs.len() {
            return Ok(None);
        }
        let end = (self.cursor + batch_size.max(1)).min(self.pairs.len());
        let range = self.cursor..end;
        self.cursor = end;

        let t_load = Instant::now();
        let shape = self.cfg.image_shape;
        let loaded: Vec<_> = self.pairs[range.clone()]
            .par_iter()
            .zip(self.transforms[range].par_iter())
            .map(|(pair, transform)| load_sample(pair, shape, *transform))
            .collect();
        let load_elapsed = t_load.elapsed();

        let (height, width) = (shape.0 as usize, shape.1 as usize);
        let batch_len = loaded.len();
        let plane = height * width;
        let mut images_buf = Vec::with_capacity(batch_len * 3 * plane);
        let mut labels_buf = Vec::with_capacity(batch_len * NUM_LABEL_CLASSES * plane);
        for sample in loaded {
            let sample = sample?;
            images_buf.extend_from_slice(&sample.image_chw);
            labels_buf.extend_from_slice(&sample.label_chw);
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(images_buf, [batch_len, 3, height, width]),
            device,
        );
        let labels = Tensor::<B, 4>::from_data(
            TensorData::new(labels_buf, [batch_len, NUM_LABEL_CLASSES, height, width]),
            device,
        );

        self.processed_batches += 1;
        self.total_load_time += load_elapsed;
        tracing::debug!(
            batch = self.processed_batches,
            samples = batch_len,
            load_ms = load_elapsed.as_secs_f64() * 1000.0,
            avg_load_ms =
                self.total_load_time.as_secs_f64() * 1000.0 / self.processed_batches as f64,
            "assembled road batch"
        );

        Ok(Some(RoadBatch { images, labels }))
    }
}
