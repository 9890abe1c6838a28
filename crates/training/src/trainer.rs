//! The fixed-epoch training loop.

use std::time::{Duration, Instant};

use anyhow::anyhow;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::ElementConversion;
use models::Fcn8;
use road_dataset::{BatchIter, RoadBatch, RoadDataset};

use crate::config::Hyperparameters;
use crate::loss::{build_objective, LossConfig};

/// Anything that can replay batches of images and one-hot labels, one pass per epoch.
pub trait BatchSource<B: Backend> {
    /// Begin pass number `epoch` (zero-based).
    fn start_epoch(&mut self, epoch: usize);

    /// Next batch of the current pass, `None` once it is exhausted.
    fn next_batch(
        &mut self,
        batch_size: usize,
        device: &B::Device,
    ) -> anyhow::Result<Option<RoadBatch<B>>>;
}

/// Feeds a [`RoadDataset`] to the trainer, reshuffling at every epoch.
pub struct DatasetSource<'a> {
    dataset: &'a RoadDataset,
    iter: Option<BatchIter>,
}

impl<'a> DatasetSource<'a> {
    pub fn new(dataset: &'a RoadDataset) -> Self {
        Self {
            dataset,
            iter: None,
        }
    }
}

impl<B: Backend> BatchSource<B> for DatasetSource<'_> {
    fn start_epoch(&mut self, epoch: usize) {
        self.iter = Some(self.dataset.iter_epoch(epoch));
    }

    fn next_batch(
        &mut self,
        batch_size: usize,
        device: &B::Device,
    ) -> anyhow::Result<Option<RoadBatch<B>>> {
        match self.iter.as_mut() {
            Some(iter) => Ok(iter.next_batch::<B>(batch_size, device)?),
            None => Err(anyhow!("next_batch called before start_epoch")),
        }
    }
}

/// One optimizer step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub epoch: usize,
    pub batch: usize,
    pub loss: f32,
    /// Time since training started.
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    pub steps: usize,
    pub records: Vec<StepRecord>,
}

impl TrainReport {
    pub fn all_finite(&self) -> bool {
        self.records.iter().all(|r| r.loss.is_finite())
    }

    pub fn final_loss(&self) -> Option<f32> {
        self.records.last().map(|r| r.loss)
    }
}

/// Progress line for one step; `epoch` and `batch` are already one-based.
pub fn format_progress(epoch: usize, batch: usize, loss: f32, elapsed: Duration) -> String {
    format!(
        "Epoch: {:<3} Batch: {:<5} Loss: {:<10.4} Running Time: {:<.1} seconds",
        epoch,
        batch,
        loss,
        elapsed.as_secs_f64()
    )
}

/// Run `hyper.epochs` passes over `source`, taking one Adam step per batch.
///
/// Returns the trained model. Any failure aborts the whole run.
pub fn train<B, O, S>(
    mut model: Fcn8<B>,
    optim: &mut O,
    source: &mut S,
    hyper: &Hyperparameters,
    device: &B::Device,
) -> anyhow::Result<(Fcn8<B>, TrainReport)>
where
    B: AutodiffBackend,
    O: Optimizer<Fcn8<B>, B>,
    S: BatchSource<B>,
{
    if hyper.freeze_backbone {
        model = model.freeze_backbone();
        tracing::info!("backbone frozen; only decoder parameters will update");
    }
    let loss_cfg = LossConfig {
        include_regularization: hyper.include_regularization,
    };

    let mut report = TrainReport::default();
    let start = Instant::now();
    for epoch in 0..hyper.epochs {
        source.start_epoch(epoch);
        let mut batch_idx = 0;
        while let Some(batch) = source.next_batch(hyper.batch_size, device)? {
            let logits = model
                .forward(batch.images, hyper.keep_prob)
                .map_err(|e| anyhow!("forward pass failed: {e}"))?;
            let objective = build_objective(logits, batch.labels, hyper.num_classes)?;
            let loss = loss_cfg.total(objective, &model);
            let loss_value = loss.clone().into_scalar().elem::<f32>();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(hyper.learning_rate, model, grads);

            let elapsed = start.elapsed();
            tracing::info!(
                epoch = epoch + 1,
                batch = batch_idx + 1,
                loss = loss_value,
                elapsed_s = elapsed.as_secs_f64(),
                "{}",
                format_progress(epoch + 1, batch_idx + 1, loss_value, elapsed)
            );
            report.records.push(StepRecord {
                epoch,
                batch: batch_idx,
                loss: loss_value,
                elapsed,
            });
            report.steps += 1;
            batch_idx += 1;
        }
    }

    tracing::info!(
        steps = report.steps,
        final_loss = report.final_loss().unwrap_or(f32::NAN),
        elapsed_s = start.elapsed().as_secs_f64(),
        "training finished"
    );
    Ok((model, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_line_layout() {
        let line = format_progress(1, 1, 0.693_147, Duration::from_millis(400));
        assert_eq!(
            line,
            "Epoch: 1   Batch: 1     Loss: 0.6931     Running Time: 0.4 seconds"
        );
    }

    #[test]
    fn report_flags_non_finite_losses() {
        let mut report = TrainReport::default();
        report.records.push(StepRecord {
            epoch: 0,
            batch: 0,
            loss: 0.5,
            elapsed: Duration::ZERO,
        });
        assert!(report.all_finite());
        report.records.push(StepRecord {
            epoch: 0,
            batch: 1,
            loss: f32::NAN,
            elapsed: Duration::ZERO,
        });
        assert!(!report.all_finite());
    }
}
