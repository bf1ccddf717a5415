use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::Result;

pub mod nucleus;
pub mod penalty;
pub mod rng;

pub const MIN_TEMPERATURE: f32 = 0.1;
pub const MAX_TEMPERATURE: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct SamplerParams {
    /// Clamped to `[0.1, 5.0]` when sampling.
    #[derivative(Default(value = "1.0"))]
    pub temperature: f32,
    /// Values of 0 or 1 select the argmax.
    #[derivative(Default(value = "128"))]
    pub top_k: usize,
    #[derivative(Default(value = "0.3"))]
    pub top_p: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct PenaltyParams {
    #[derivative(Default(value = "0.0"))]
    pub presence_penalty: f32,
    #[derivative(Default(value = "1.0"))]
    pub frequency_penalty: f32,
    #[derivative(Default(value = "0.996"))]
    pub penalty_decay: f32,
}

pub trait Sampler {
    /// Reset the random source.
    fn set_seed(&mut self, seed: u64);
    /// Select one token from raw logits, advancing the random state.
    fn sample(&mut self, logits: &[f32], params: &SamplerParams) -> Result<u32>;
}
