use serde::{Deserialize, Serialize};

pub mod backend;
pub mod config;
pub mod error;
pub mod runtime;
pub mod sampler;
pub mod tokenizer;

pub use backend::{BackendKind, BackendOptions, ExecutionProvider};
pub use config::Config;
pub use error::{Error, Result, Status};
pub use runtime::Runtime;
pub use sampler::{PenaltyParams, SamplerParams};
pub use tokenizer::Tokenizer;

/// Sampling this token ends generation.
pub const EOS_TOKEN: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model emitted the end token or closed its turn with a blank line.
    Stop,
    /// Output was cut at the token budget.
    Length,
}

/// Install the global logger. Later calls are ignored.
pub fn init_logger(level: log::LevelFilter) {
    let result = simple_logger::SimpleLogger::new()
        .with_level(level)
        .with_module_level("rwkv_mobile", log::LevelFilter::Info)
        .with_module_level("web_rwkv", log::LevelFilter::Info)
        .init();
    if result.is_ok() {
        log::info!("[logger][init] {level}");
    }
}
