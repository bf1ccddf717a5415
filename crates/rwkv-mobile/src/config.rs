use std::path::{Path, PathBuf};

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::{
    backend::{AdapterOption, BackendKind, BackendOptions},
    error::StatusExt,
    init_logger,
    sampler::{PenaltyParams, SamplerParams},
    Result, Runtime, Status,
};

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Config {
    pub backend: BackendKind,
    #[derivative(Default(value = "log::LevelFilter::Warn"))]
    pub log_level: log::LevelFilter,
    /// Sampler seed. A random one is picked if absent.
    pub seed: Option<u64>,
    pub model: Model,
    pub tokenizer: Tokenizer,
    pub sampler: SamplerParams,
    pub penalty: PenaltyParams,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Model {
    /// Path to the model weights.
    pub path: PathBuf,
    /// Specify layers that needs to be quantized to `Int8`.
    pub quant: usize,
    /// Specify layers that needs to be quantized to `NF4`.
    pub quant_nf4: usize,
    pub rescale: Option<usize>,
    /// Maximum tokens to be processed in parallel at once.
    #[derivative(Default(value = "128"))]
    pub token_chunk_size: usize,
    pub adapter: AdapterOption,
}

impl From<&Model> for BackendOptions {
    fn from(model: &Model) -> Self {
        Self {
            quant: model.quant,
            quant_nf4: model.quant_nf4,
            rescale: model.rescale,
            token_chunk_size: model.token_chunk_size,
            adapter: model.adapter,
        }
    }
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct Tokenizer {
    #[derivative(Default(value = "\"assets/tokenizer/rwkv_vocab_v20230424.json\".into()"))]
    pub path: PathBuf,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path).status(Status::IO)?;
        contents.parse()
    }
}

impl std::str::FromStr for Config {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).status(Status::INVALID_PARAMETERS)
    }
}

impl Runtime {
    /// Build a ready-to-generate runtime, stopping at the first step that fails.
    pub fn from_config(config: &Config) -> Result<Self> {
        init_logger(config.log_level);

        let mut runtime = Self::new();
        runtime.init_with_options(config.backend, (&config.model).into())?;
        runtime.load_tokenizer(&config.tokenizer.path)?;
        runtime.load_model(&config.model.path)?;
        runtime.set_sampler_params(config.sampler);
        runtime.set_penalty_params(config.penalty);
        if let Some(seed) = config.seed {
            runtime.set_seed(seed)?;
        }
        Ok(runtime)
    }
}
