use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::backbone::{Vgg16, Vgg16Config};
use crate::decoder::{DecoderConfig, DecoderError, DecoderPlan, Fcn8Decoder};

/// VGG16 encoder with the FCN-8 decoder on top.
#[derive(Module, Debug)]
pub struct Fcn8<B: Backend> {
    backbone: Vgg16<B>,
    decoder: Fcn8Decoder<B>,
}

impl<B: Backend> Fcn8<B> {
    /// Attach a freshly initialised decoder sized for `image_shape` (height, width).
    pub fn new(
        backbone: Vgg16<B>,
        backbone_cfg: &Vgg16Config,
        image_shape: (usize, usize),
        cfg: &DecoderConfig,
        device: &B::Device,
    ) -> Result<Self, DecoderError> {
        let (height, width) = image_shape;
        let plan = DecoderPlan::fcn8(backbone_cfg.tap_shapes(height, width), cfg)?;
        Ok(Self {
            backbone,
            decoder: Fcn8Decoder::new(plan, device),
        })
    }

    /// Mark every backbone parameter as not requiring gradients.
    pub fn freeze_backbone(self) -> Self {
        Self {
            backbone: self.backbone.no_grad(),
            decoder: self.decoder,
        }
    }

    /// Class scores `[N, num_classes, H, W]` for `images` `[N, 3, H, W]`.
    pub fn forward(&self, images: Tensor<B, 4>, keep_prob: f64) -> Result<Tensor<B, 4>, DecoderError> {
        let features = self.backbone.forward(images, keep_prob);
        self.decoder.forward(features)
    }

    pub fn backbone(&self) -> &Vgg16<B> {
        &self.backbone
    }

    pub fn decoder(&self) -> &Fcn8Decoder<B> {
        &self.decoder
    }

    pub fn num_classes(&self) -> usize {
        self.decoder.plan().num_classes()
    }
}
