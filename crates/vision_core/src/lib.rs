//! vision_core: image helpers shared by the inference sampler.

pub mod overlay;
