//! VGG16 feature extractor and its on-disk artifact.
//!
//! The backbone is stored as a Burn record next to a small JSON manifest that pins
//! the tensor-name contract the decoder relies on: one input, one keep-probability
//! and three feature taps.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::record::{BinFileRecorder, FullPrecisionSettings, RecorderError};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::decoder::{Tap, TapShapes, TensorShape};

pub const VGG_TAG: &str = "vgg16";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const DEFAULT_WEIGHTS_FILE: &str = "vgg16.bin";

#[derive(Debug, Error)]
pub enum BackboneError {
    #[error("backbone manifest not found at {path} (place a vgg16 artifact under this directory)")]
    MissingManifest { path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("backbone tag mismatch: expected {expected}, found {found}")]
    Tag { expected: String, found: String },
    #[error("backbone tensor `{role}` is named `{found}`, expected `{expected}`")]
    TensorName {
        role: &'static str,
        expected: String,
        found: String,
    },
    #[error("backbone weights missing at {path}")]
    MissingWeights { path: PathBuf },
    #[error("failed to read backbone record {path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: RecorderError,
    },
}

/// Names of the tensors a backbone artifact must expose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorNames {
    pub image_input: String,
    pub keep_prob: String,
    pub layer3_out: String,
    pub layer4_out: String,
    pub layer7_out: String,
}

impl Default for TensorNames {
    fn default() -> Self {
        Self {
            image_input: "image_input".into(),
            keep_prob: "keep_prob".into(),
            layer3_out: Tap::Layer3.to_string(),
            layer4_out: Tap::Layer4.to_string(),
            layer7_out: Tap::Layer7.to_string(),
        }
    }
}

impl TensorNames {
    fn check(&self, expected: &TensorNames) -> Result<(), BackboneError> {
        let pairs = [
            ("image_input", &self.image_input, &expected.image_input),
            ("keep_prob", &self.keep_prob, &expected.keep_prob),
            ("layer3_out", &self.layer3_out, &expected.layer3_out),
            ("layer4_out", &self.layer4_out, &expected.layer4_out),
            ("layer7_out", &self.layer7_out, &expected.layer7_out),
        ];
        for (role, found, want) in pairs {
            if found != want {
                return Err(BackboneError::TensorName {
                    role,
                    expected: want.clone(),
                    found: found.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vgg16Config {
    /// Output channels of the five conv blocks.
    pub block_channels: [usize; 5],
    /// Width of the fully-convolutional fc6/fc7 layers.
    pub fc_channels: usize,
    /// Kernel of fc6 (7 in the classification net).
    pub fc6_kernel: usize,
    pub in_channels: usize,
}

impl Default for Vgg16Config {
    fn default() -> Self {
        Self {
            block_channels: [64, 128, 256, 512, 512],
            fc_channels: 4096,
            fc6_kernel: 7,
            in_channels: 3,
        }
    }
}

const BLOCK_DEPTHS: [usize; 5] = [2, 2, 3, 3, 3];

impl Vgg16Config {
    /// Shapes of the three taps for an input of `height x width`.
    pub fn tap_shapes(&self, height: usize, width: usize) -> TapShapes {
        TapShapes {
            layer3: TensorShape::new(self.block_channels[2], height / 8, width / 8),
            layer4: TensorShape::new(self.block_channels[3], height / 16, width / 16),
            layer7: TensorShape::new(self.fc_channels, height / 32, width / 32),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Vgg16<B> {
        let mut in_ch = self.in_channels;
        let mut block = |idx: usize| {
            let out_ch = self.block_channels[idx];
            let convs = (0..BLOCK_DEPTHS[idx])
                .map(|_| {
                    let layer = conv(in_ch, out_ch, 3, device);
                    in_ch = out_ch;
                    layer
                })
                .collect();
            VggBlock { convs }
        };
        let (block1, block2, block3, block4, block5) =
            (block(0), block(1), block(2), block(3), block(4));
        Vgg16 {
            block1,
            block2,
            block3,
            block4,
            block5,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc6: conv(self.block_channels[4], self.fc_channels, self.fc6_kernel, device),
            fc7: conv(self.fc_channels, self.fc_channels, 1, device),
        }
    }
}

fn conv<B: Backend>(in_ch: usize, out_ch: usize, kernel: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_ch, out_ch], [kernel, kernel])
        .with_padding(PaddingConfig2d::Same)
        .init(device)
}

/// Intermediate activations handed to the decoder.
#[derive(Debug, Clone)]
pub struct BackboneFeatures<B: Backend> {
    pub layer3: Tensor<B, 4>,
    pub layer4: Tensor<B, 4>,
    pub layer7: Tensor<B, 4>,
}

impl<B: Backend> BackboneFeatures<B> {
    pub fn get(&self, tap: Tap) -> Tensor<B, 4> {
        match tap {
            Tap::Layer3 => self.layer3.clone(),
            Tap::Layer4 => self.layer4.clone(),
            Tap::Layer7 => self.layer7.clone(),
        }
    }
}

#[derive(Module, Debug)]
pub struct VggBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
}

impl<B: Backend> VggBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.convs.iter().fold(x, |x, conv| relu(conv.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct Vgg16<B: Backend> {
    block1: VggBlock<B>,
    block2: VggBlock<B>,
    block3: VggBlock<B>,
    block4: VggBlock<B>,
    block5: VggBlock<B>,
    pool: MaxPool2d,
    fc6: Conv2d<B>,
    fc7: Conv2d<B>,
}

impl<B: Backend> Vgg16<B> {
    /// Run the encoder. `keep_prob` drives dropout after fc6/fc7; dropout only fires
    /// on autodiff backends and is a no-op at 1.0.
    pub fn forward(&self, images: Tensor<B, 4>, keep_prob: f64) -> BackboneFeatures<B> {
        let x = self.pool.forward(self.block1.forward(images));
        let x = self.pool.forward(self.block2.forward(x));
        let layer3 = self.pool.forward(self.block3.forward(x));
        let layer4 = self.pool.forward(self.block4.forward(layer3.clone()));
        let x = self.pool.forward(self.block5.forward(layer4.clone()));
        let x = dropout(relu(self.fc6.forward(x)), keep_prob);
        let layer7 = dropout(relu(self.fc7.forward(x)), keep_prob);
        BackboneFeatures {
            layer3,
            layer4,
            layer7,
        }
    }
}

fn dropout<B: Backend>(x: Tensor<B, 4>, keep_prob: f64) -> Tensor<B, 4> {
    if keep_prob >= 1.0 || !B::ad_enabled() {
        return x;
    }
    let mask = Tensor::<B, 4>::random(x.shape(), Distribution::Bernoulli(keep_prob), &x.device());
    (x * mask).div_scalar(keep_prob)
}

/// Manifest stored at `<vgg_dir>/manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneManifest {
    pub tag: String,
    pub tensors: TensorNames,
    /// Weights file, relative to the manifest directory.
    pub weights: String,
    pub config: Vgg16Config,
}

impl BackboneManifest {
    pub fn new(config: Vgg16Config) -> Self {
        Self {
            tag: VGG_TAG.to_string(),
            tensors: TensorNames::default(),
            weights: DEFAULT_WEIGHTS_FILE.to_string(),
            config,
        }
    }

    pub fn read(vgg_dir: &Path) -> Result<Self, BackboneError> {
        let path = vgg_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(BackboneError::MissingManifest {
                path: vgg_dir.to_path_buf(),
            });
        }
        let raw = fs::read(&path).map_err(|e| BackboneError::Io {
            path: path.clone(),
            source: e,
        })?;
        let manifest: Self =
            serde_json::from_slice(&raw).map_err(|e| BackboneError::Json { path, source: e })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), BackboneError> {
        if self.tag != VGG_TAG {
            return Err(BackboneError::Tag {
                expected: VGG_TAG.to_string(),
                found: self.tag.clone(),
            });
        }
        self.tensors.check(&TensorNames::default())
    }
}

/// Restore a VGG16 backbone from `<vgg_dir>`.
pub fn load_vgg<B: Backend>(
    vgg_dir: &Path,
    device: &B::Device,
) -> Result<(Vgg16<B>, Vgg16Config), BackboneError> {
    let manifest = BackboneManifest::read(vgg_dir)?;
    let weights = vgg_dir.join(&manifest.weights);
    if !weights.exists() {
        return Err(BackboneError::MissingWeights { path: weights });
    }
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let model = manifest
        .config
        .init::<B>(device)
        .load_file(weights.as_path(), &recorder, device)
        .map_err(|e| BackboneError::Record {
            path: weights.clone(),
            source: e,
        })?;
    tracing::info!(
        path = %vgg_dir.display(),
        tag = %manifest.tag,
        fc_channels = manifest.config.fc_channels,
        "loaded backbone"
    );
    Ok((model, manifest.config))
}

/// Write a backbone artifact (manifest + weights) to `<vgg_dir>`.
pub fn save_vgg<B: Backend>(
    model: &Vgg16<B>,
    config: &Vgg16Config,
    vgg_dir: &Path,
) -> Result<(), BackboneError> {
    fs::create_dir_all(vgg_dir).map_err(|e| BackboneError::Io {
        path: vgg_dir.to_path_buf(),
        source: e,
    })?;
    let manifest = BackboneManifest::new(config.clone());
    let weights = vgg_dir.join(&manifest.weights);
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(weights.as_path(), &recorder)
        .map_err(|e| BackboneError::Record {
            path: weights.clone(),
            source: e,
        })?;
    let manifest_path = vgg_dir.join(MANIFEST_FILE);
    let json = serde_json::to_vec_pretty(&manifest).map_err(|e| BackboneError::Json {
        path: manifest_path.clone(),
        source: e,
    })?;
    fs::write(&manifest_path, json).map_err(|e| BackboneError::Io {
        path: manifest_path,
        source: e,
    })
}
