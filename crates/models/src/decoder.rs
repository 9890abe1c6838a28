//! FCN-8 decoder: a fixed layer plan interpreted over the backbone taps.
//!
//! The topology is described by `DecoderPlan`, an ordered list of `LayerSpec`
//! records. Building the plan infers every stage shape from the tap shapes, so an
//! inconsistent skip connection fails before any weights exist. `Fcn8Decoder`
//! instantiates one Burn layer per conv/transposed-conv record and walks the plan
//! in order during `forward`.

use burn::module::{Ignored, Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{Initializer, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::backbone::BackboneFeatures;

/// L2 kernel regularization strength used by every decoder layer.
pub const DEFAULT_L2_SCALE: f64 = 1e-3;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecoderError {
    #[error("num_classes must be greater than 0")]
    InvalidClasses,
    #[error("backbone tap {tap} has an empty shape {shape}")]
    InvalidTap { tap: Tap, shape: TensorShape },
    #[error("backbone tap {tap} has {actual} channels, decoder was built for {expected}")]
    TapChannels {
        tap: Tap,
        expected: usize,
        actual: usize,
    },
    #[error("decoder plan has no layers")]
    EmptyPlan,
    #[error("stage `{stage}` reads stage {index}, which is not computed before it")]
    UnknownStage { stage: &'static str, index: usize },
    #[error("skip connection `{stage}` adds mismatched tensors: {left} vs {right}")]
    SkipMismatch {
        stage: &'static str,
        left: TensorShape,
        right: TensorShape,
    },
}

/// One of the three backbone activations consumed by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tap {
    /// Shallowest tap, stride 8.
    Layer3,
    /// Mid tap, stride 16.
    Layer4,
    /// Deepest tap, stride 32.
    Layer7,
}

impl fmt::Display for Tap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tap::Layer3 => "layer3_out",
            Tap::Layer4 => "layer4_out",
            Tap::Layer7 => "layer7_out",
        };
        f.write_str(name)
    }
}

/// Per-sample tensor shape (batch dimension excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl TensorShape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    pub fn from_dims(dims: [usize; 4]) -> Self {
        Self::new(dims[1], dims[2], dims[3])
    }

    fn is_empty(&self) -> bool {
        self.channels == 0 || self.height == 0 || self.width == 0
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.channels, self.height, self.width)
    }
}

/// Shapes of the three backbone taps for a given input resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapShapes {
    pub layer3: TensorShape,
    pub layer4: TensorShape,
    pub layer7: TensorShape,
}

impl TapShapes {
    pub fn get(&self, tap: Tap) -> TensorShape {
        match tap {
            Tap::Layer3 => self.layer3,
            Tap::Layer4 => self.layer4,
            Tap::Layer7 => self.layer7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Conv,
    ConvTranspose,
    Add,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activation {
    Identity,
    Elu,
}

impl Activation {
    fn apply<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Activation::Identity => x,
            Activation::Elu => elu(x),
        }
    }
}

/// Input of a layer: a backbone tap or the output of an earlier stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Tap(Tap),
    Stage(usize),
}

/// One record of the decoder topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    pub name: &'static str,
    pub op: OpKind,
    pub input: Operand,
    /// Second operand, only for `OpKind::Add`.
    pub skip: Option<Operand>,
    pub kernel: usize,
    pub stride: usize,
    pub out_channels: usize,
    pub activation: Activation,
}

impl LayerSpec {
    fn conv(
        name: &'static str,
        input: Operand,
        kernel: usize,
        out_channels: usize,
        activation: Activation,
    ) -> Self {
        Self {
            name,
            op: OpKind::Conv,
            input,
            skip: None,
            kernel,
            stride: 1,
            out_channels,
            activation,
        }
    }

    fn upsample(
        name: &'static str,
        input: Operand,
        kernel: usize,
        stride: usize,
        out_channels: usize,
    ) -> Self {
        Self {
            name,
            op: OpKind::ConvTranspose,
            input,
            skip: None,
            kernel,
            stride,
            out_channels,
            activation: Activation::Identity,
        }
    }

    fn add(name: &'static str, left: Operand, right: Operand) -> Self {
        Self {
            name,
            op: OpKind::Add,
            input: left,
            skip: Some(right),
            kernel: 0,
            stride: 1,
            out_channels: 0,
            activation: Activation::Identity,
        }
    }

    /// Padding that makes a transposed conv output exactly `input * stride`.
    fn transpose_padding(&self) -> usize {
        self.kernel.saturating_sub(self.stride) / 2
    }
}

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub num_classes: usize,
    pub l2_scale: f64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            num_classes: 2,
            l2_scale: DEFAULT_L2_SCALE,
        }
    }
}

/// Validated decoder topology with the inferred output shape of every stage.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderPlan {
    layers: Vec<LayerSpec>,
    shapes: Vec<TensorShape>,
    taps: TapShapes,
    num_classes: usize,
    l2_scale: f64,
}

impl DecoderPlan {
    /// Build the FCN-8 topology (with the smoothing tail) for the given taps.
    pub fn fcn8(taps: TapShapes, cfg: &DecoderConfig) -> Result<Self, DecoderError> {
        let n = cfg.num_classes;
        if n == 0 {
            return Err(DecoderError::InvalidClasses);
        }
        for tap in [Tap::Layer3, Tap::Layer4, Tap::Layer7] {
            let shape = taps.get(tap);
            if shape.is_empty() {
                return Err(DecoderError::InvalidTap { tap, shape });
            }
        }

        use Operand::{Stage, Tap as T};
        let layers = vec![
            LayerSpec::conv("project_layer7", T(Tap::Layer7), 1, n, Activation::Identity),
            LayerSpec::upsample("upsample_2a", Stage(0), 4, 2, n),
            LayerSpec::conv("project_layer4", T(Tap::Layer4), 1, n, Activation::Identity),
            LayerSpec::add("skip_layer4", Stage(1), Stage(2)),
            LayerSpec::upsample("upsample_2b", Stage(3), 4, 2, n),
            LayerSpec::conv("project_layer3", T(Tap::Layer3), 1, n, Activation::Identity),
            LayerSpec::add("skip_layer3", Stage(4), Stage(5)),
            LayerSpec::upsample("fcn8", Stage(6), 16, 8, n),
            LayerSpec::conv("smooth_3x3", Stage(7), 3, 2 * n, Activation::Elu),
            LayerSpec::conv("smooth_5x5", Stage(8), 5, n, Activation::Elu),
            LayerSpec::add("residual", Stage(7), Stage(9)),
            LayerSpec::conv("head", Stage(10), 7, n, Activation::Elu),
        ];
        Self::from_layers(layers, taps, cfg)
    }

    /// Validate an arbitrary layer list against the tap shapes.
    pub fn from_layers(
        layers: Vec<LayerSpec>,
        taps: TapShapes,
        cfg: &DecoderConfig,
    ) -> Result<Self, DecoderError> {
        if layers.is_empty() {
            return Err(DecoderError::EmptyPlan);
        }
        let mut shapes: Vec<TensorShape> = Vec::with_capacity(layers.len());
        for layer in &layers {
            for operand in std::iter::once(layer.input).chain(layer.skip) {
                if let Operand::Stage(index) = operand {
                    if index >= shapes.len() {
                        return Err(DecoderError::UnknownStage {
                            stage: layer.name,
                            index,
                        });
                    }
                }
            }
            let input = resolve_shape(&shapes, &taps, layer.input);
            let shape = match layer.op {
                OpKind::Conv => TensorShape::new(layer.out_channels, input.height, input.width),
                OpKind::ConvTranspose => TensorShape::new(
                    layer.out_channels,
                    input.height * layer.stride,
                    input.width * layer.stride,
                ),
                OpKind::Add => {
                    let right = match layer.skip {
                        Some(operand) => resolve_shape(&shapes, &taps, operand),
                        None => input,
                    };
                    if input != right {
                        return Err(DecoderError::SkipMismatch {
                            stage: layer.name,
                            left: input,
                            right,
                        });
                    }
                    input
                }
            };
            shapes.push(shape);
        }
        Ok(Self {
            layers,
            shapes,
            taps,
            num_classes: cfg.num_classes,
            l2_scale: cfg.l2_scale,
        })
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    pub fn taps(&self) -> &TapShapes {
        &self.taps
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn l2_scale(&self) -> f64 {
        self.l2_scale
    }

    pub fn output_shape(&self) -> TensorShape {
        self.shapes
            .last()
            .copied()
            .unwrap_or_else(|| self.taps.layer7)
    }

    /// Number of layers per op kind, used to compare topologies.
    pub fn op_counts(&self) -> BTreeMap<OpKind, usize> {
        let mut counts = BTreeMap::new();
        for layer in &self.layers {
            *counts.entry(layer.op).or_insert(0) += 1;
        }
        counts
    }

    /// Input channel count of each layer (0 for adds).
    fn input_channels(&self, layer: &LayerSpec) -> usize {
        resolve_shape(&self.shapes, &self.taps, layer.input).channels
    }
}

fn resolve_shape(shapes: &[TensorShape], taps: &TapShapes, operand: Operand) -> TensorShape {
    match operand {
        Operand::Tap(tap) => taps.get(tap),
        Operand::Stage(idx) => shapes[idx],
    }
}

/// Exponential linear unit, written as `relu(x) + exp(min(x, 0)) - 1` so the
/// unused branch never overflows.
pub fn elu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    relu(x.clone()) + x.clamp_max(0.0).exp().sub_scalar(1.0)
}

#[derive(Module, Debug)]
pub struct Fcn8Decoder<B: Backend> {
    convs: Vec<Conv2d<B>>,
    upsamples: Vec<ConvTranspose2d<B>>,
    plan: Ignored<DecoderPlan>,
}

impl<B: Backend> Fcn8Decoder<B> {
    pub fn new(plan: DecoderPlan, device: &B::Device) -> Self {
        let mut convs = Vec::new();
        let mut upsamples = Vec::new();
        for layer in plan.layers() {
            let in_channels = plan.input_channels(layer);
            let kernel = [layer.kernel, layer.kernel];
            match layer.op {
                OpKind::Conv => {
                    let mut conv = Conv2dConfig::new([in_channels, layer.out_channels], kernel)
                        .with_stride([layer.stride, layer.stride])
                        .with_padding(PaddingConfig2d::Same)
                        .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                        .with_bias(false)
                        .init(device);
                    conv.bias = Some(zero_bias(layer.out_channels, device));
                    convs.push(conv);
                }
                OpKind::ConvTranspose => {
                    let pad = layer.transpose_padding();
                    let mut up = ConvTranspose2dConfig::new([in_channels, layer.out_channels], kernel)
                        .with_stride([layer.stride, layer.stride])
                        .with_padding([pad, pad])
                        .with_bias(false)
                        .init(device);
                    // The transposed config never hands a fan-out to its initializer.
                    let area = layer.kernel * layer.kernel;
                    up.weight = Initializer::XavierUniform { gain: 1.0 }.init_with(
                        [in_channels, layer.out_channels, layer.kernel, layer.kernel],
                        Some(in_channels * area),
                        Some(layer.out_channels * area),
                        device,
                    );
                    up.bias = Some(zero_bias(layer.out_channels, device));
                    upsamples.push(up);
                }
                OpKind::Add => {}
            }
        }
        tracing::debug!(
            convs = convs.len(),
            upsamples = upsamples.len(),
            output = %plan.output_shape(),
            "built fcn8 decoder"
        );
        Self {
            convs,
            upsamples,
            plan: Ignored(plan),
        }
    }

    pub fn plan(&self) -> &DecoderPlan {
        &self.plan.0
    }

    /// Run the plan over the backbone taps and return class scores `[N, C, H, W]`.
    pub fn forward(&self, features: BackboneFeatures<B>) -> Result<Tensor<B, 4>, DecoderError> {
        let plan = self.plan();
        for tap in [Tap::Layer3, Tap::Layer4, Tap::Layer7] {
            let expected = plan.taps().get(tap).channels;
            let actual = features.get(tap).dims()[1];
            if expected != actual {
                return Err(DecoderError::TapChannels {
                    tap,
                    expected,
                    actual,
                });
            }
        }

        let mut outputs: Vec<Tensor<B, 4>> = Vec::with_capacity(plan.layers().len());
        let mut conv_idx = 0;
        let mut up_idx = 0;
        for layer in plan.layers() {
            let input = fetch(&outputs, &features, layer.input);
            let out = match layer.op {
                OpKind::Conv => {
                    let out = self.convs[conv_idx].forward(input);
                    conv_idx += 1;
                    layer.activation.apply(out)
                }
                OpKind::ConvTranspose => {
                    let out = self.upsamples[up_idx].forward(input);
                    up_idx += 1;
                    layer.activation.apply(out)
                }
                OpKind::Add => {
                    let right = match layer.skip {
                        Some(operand) => fetch(&outputs, &features, operand),
                        None => input.clone(),
                    };
                    let (l, r) = (input.dims(), right.dims());
                    if l != r {
                        return Err(DecoderError::SkipMismatch {
                            stage: layer.name,
                            left: TensorShape::from_dims(l),
                            right: TensorShape::from_dims(r),
                        });
                    }
                    input + right
                }
            };
            outputs.push(out);
        }
        outputs.pop().ok_or(DecoderError::EmptyPlan)
    }

    /// `scale * sum(W^2) / 2` over every kernel, the penalty an L2 kernel
    /// regularizer contributes.
    pub fn regularization_loss(&self) -> Tensor<B, 1> {
        let scale = self.plan().l2_scale();
        let mut terms: Vec<Tensor<B, 1>> = Vec::new();
        for conv in &self.convs {
            terms.push(conv.weight.val().powf_scalar(2.0).sum());
        }
        for up in &self.upsamples {
            terms.push(up.weight.val().powf_scalar(2.0).sum());
        }
        Tensor::cat(terms, 0).sum().mul_scalar(scale / 2.0)
    }
}

fn zero_bias<B: Backend>(channels: usize, device: &B::Device) -> Param<Tensor<B, 1>> {
    Initializer::Zeros.init([channels], device)
}

fn fetch<B: Backend>(
    outputs: &[Tensor<B, 4>],
    features: &BackboneFeatures<B>,
    operand: Operand,
) -> Tensor<B, 4> {
    match operand {
        Operand::Tap(tap) => features.get(tap),
        Operand::Stage(idx) => outputs[idx].clone(),
    }
}
