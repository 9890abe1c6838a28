//! Qualitative inference: run a trained FCN-8 over the test split and save
//! road overlays into a timestamped run directory.

pub mod sampler;

pub use sampler::{
    road_mask, road_probabilities, save_inference_samples, SampleWriter, SamplerError,
    ROAD_THRESHOLD,
};
