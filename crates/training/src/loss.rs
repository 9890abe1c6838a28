//! Pixel-wise softmax cross-entropy and the optimizer used to minimize it.

use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, Optimizer};
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use models::Fcn8;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LossError {
    #[error("logits {logits:?} and labels {labels:?} must have the same shape")]
    ShapeMismatch {
        logits: [usize; 4],
        labels: [usize; 4],
    },
    #[error("expected {expected} class channels, got {actual}")]
    ClassCount { expected: usize, actual: usize },
}

/// Flattened class scores and the mean cross-entropy over every pixel.
#[derive(Debug, Clone)]
pub struct Objective<B: Backend> {
    /// `[N * H * W, num_classes]`, pixel-major.
    pub flat_logits: Tensor<B, 2>,
    pub cross_entropy: Tensor<B, 1>,
}

impl<B: Backend> Objective<B> {
    /// The scalar the optimizer minimizes, optionally with a weight penalty added.
    pub fn total(self, regularization: Option<Tensor<B, 1>>) -> Tensor<B, 1> {
        match regularization {
            Some(reg) => self.cross_entropy + reg,
            None => self.cross_entropy,
        }
    }
}

/// Cross-entropy of `logits` against one-hot (or soft) `labels`, both `[N, C, H, W]`.
pub fn build_objective<B: Backend>(
    logits: Tensor<B, 4>,
    labels: Tensor<B, 4>,
    num_classes: usize,
) -> Result<Objective<B>, LossError> {
    let dims = logits.dims();
    if dims != labels.dims() {
        return Err(LossError::ShapeMismatch {
            logits: dims,
            labels: labels.dims(),
        });
    }
    if dims[1] != num_classes {
        return Err(LossError::ClassCount {
            expected: num_classes,
            actual: dims[1],
        });
    }

    let pixels = dims[0] * dims[2] * dims[3];
    let flat_logits = logits.permute([0, 2, 3, 1]).reshape([pixels, num_classes]);
    let flat_labels = labels.permute([0, 2, 3, 1]).reshape([pixels, num_classes]);

    let log_probs = log_softmax(flat_logits.clone(), 1);
    let cross_entropy = (flat_labels * log_probs).sum_dim(1).mean().neg();

    Ok(Objective {
        flat_logits,
        cross_entropy,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LossConfig {
    /// Declared on the decoder but left out of the minimized loss unless set.
    pub include_regularization: bool,
}

impl LossConfig {
    pub fn total<B: Backend>(&self, objective: Objective<B>, model: &Fcn8<B>) -> Tensor<B, 1> {
        let reg = self
            .include_regularization
            .then(|| model.decoder().regularization_loss());
        objective.total(reg)
    }
}

/// Adam with default betas and epsilon; the learning rate is supplied on every step.
pub fn build_optimizer<B>() -> impl Optimizer<Fcn8<B>, B>
where
    B: AutodiffBackend,
    Fcn8<B>: AutodiffModule<B>,
{
    AdamConfig::new().init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::{ElementConversion, TensorData};

    type B = NdArray<f32>;

    fn one_hot_road(n: usize, h: usize, w: usize) -> Tensor<B, 4> {
        let plane = h * w;
        let mut data = vec![0.0f32; n * 2 * plane];
        for b in 0..n {
            for i in 0..plane {
                data[b * 2 * plane + plane + i] = 1.0;
            }
        }
        Tensor::from_data(TensorData::new(data, [n, 2, h, w]), &Default::default())
    }

    #[test]
    fn zero_logits_cost_ln_two() {
        let device = Default::default();
        let logits = Tensor::<B, 4>::zeros([2, 2, 4, 6], &device);
        let objective = build_objective(logits, one_hot_road(2, 4, 6), 2).unwrap();
        assert_eq!(objective.flat_logits.dims(), [48, 2]);
        let loss = objective.cross_entropy.into_scalar().elem::<f32>();
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-5, "loss {loss}");
    }

    #[test]
    fn confident_correct_logits_cost_almost_nothing() {
        let logits = one_hot_road(1, 3, 3).mul_scalar(20.0);
        let objective = build_objective(logits, one_hot_road(1, 3, 3), 2).unwrap();
        assert!(objective.cross_entropy.into_scalar().elem::<f32>() < 1e-4);
    }

    #[test]
    fn flattening_is_pixel_major() {
        let device = Default::default();
        // Channel 0 holds 0..4, channel 1 holds 10..14.
        let data: Vec<f32> = (0..4).map(|v| v as f32).chain((10..14).map(|v| v as f32)).collect();
        let logits = Tensor::<B, 4>::from_data(TensorData::new(data, [1, 2, 2, 2]), &device);
        let objective = build_objective(logits, one_hot_road(1, 2, 2), 2).unwrap();
        let flat = objective.flat_logits.into_data().to_vec::<f32>().unwrap();
        assert_eq!(flat, vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0, 3.0, 13.0]);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let device = Default::default();
        let logits = Tensor::<B, 4>::zeros([1, 2, 4, 4], &device);
        let err = build_objective(logits, one_hot_road(1, 4, 2), 2).unwrap_err();
        assert!(matches!(err, LossError::ShapeMismatch { .. }));

        let logits = Tensor::<B, 4>::zeros([1, 2, 4, 4], &device);
        let err = build_objective(logits, one_hot_road(1, 4, 4), 3).unwrap_err();
        assert_eq!(
            err,
            LossError::ClassCount {
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn regularization_is_opt_in() {
        let device = Default::default();
        let objective = Objective::<B> {
            flat_logits: Tensor::zeros([1, 2], &device),
            cross_entropy: Tensor::from_floats([0.5], &device),
        };
        let reg = Tensor::<B, 1>::from_floats([0.25], &device);
        let with = objective.clone().total(Some(reg)).into_scalar().elem::<f32>();
        let without = objective.total(None).into_scalar().elem::<f32>();
        assert_eq!(without, 0.5);
        assert_eq!(with, 0.75);
    }
}
