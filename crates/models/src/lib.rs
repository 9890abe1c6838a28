//! Burn modules for FCN-8 road segmentation.
//!
//! This crate defines the network used for pixel-wise road labeling:
//! - `Vgg16`: the classification backbone, exposing three intermediate taps.
//! - `Fcn8Decoder`: 1x1 projections, transposed-conv upsampling and additive skips,
//!   built from an explicit `DecoderPlan`.
//! - `Fcn8`: backbone + decoder, the module the training loop optimizes.
//!
//! These are pure Burn Modules. Loss, optimizer wiring and data loading live in the
//! `training` and `road_dataset` crates.
//!
//! All tensors are NCHW: `[batch, channels, height, width]`.

pub mod backbone;
pub mod decoder;
pub mod fcn;

pub use backbone::{
    load_vgg, save_vgg, BackboneError, BackboneFeatures, BackboneManifest, TensorNames, Vgg16,
    Vgg16Config,
};
pub use decoder::{
    Activation, DecoderConfig, DecoderError, DecoderPlan, Fcn8Decoder, LayerSpec, OpKind,
    Operand, Tap, TapShapes, TensorShape,
};
pub use fcn::Fcn8;
