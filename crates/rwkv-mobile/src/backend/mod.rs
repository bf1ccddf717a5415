use std::{fmt::Display, path::Path, str::FromStr};

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, Status};

pub mod web;

pub use web::WebRwkvBackend;

/// A model inference backend. Every call blocks until the backend is done.
pub trait ExecutionProvider {
    fn init(&mut self) -> Result<()>;

    fn load_model(&mut self, path: &Path) -> Result<()>;

    /// Vocabulary size of the loaded model, or 0 if none is loaded.
    fn num_vocab(&self) -> usize;

    /// Feed one token and write the next-token logits into `logits`.
    fn eval(&mut self, token: u32, logits: &mut [f32]) -> Result<()> {
        self.eval_sequence(&[token], logits)
    }

    /// Feed a sequence of tokens and write the logits following the last one.
    fn eval_sequence(&mut self, tokens: &[u32], logits: &mut [f32]) -> Result<()>;

    fn get_state(&self) -> Result<Vec<f32>> {
        Ok(Vec::new())
    }

    fn set_state(&mut self, _state: &[f32]) -> Result<()> {
        Ok(())
    }

    fn clear_state(&mut self) -> Result<()>;

    fn release_model(&mut self) -> Result<()>;

    fn release(&mut self) -> Result<()>;

    fn is_available(&self) -> bool;
}

/// Identifiers match the numeric backend ids exposed across the C boundary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "rwkv.cpp")]
    RwkvCpp = 0,
    #[default]
    #[serde(rename = "web-rwkv")]
    WebRwkv = 1,
}

impl BackendKind {
    pub const fn name(self) -> &'static str {
        match self {
            BackendKind::RwkvCpp => "rwkv.cpp",
            BackendKind::WebRwkv => "web-rwkv",
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rwkv.cpp" => Ok(Self::RwkvCpp),
            "web-rwkv" => Ok(Self::WebRwkv),
            _ => Err(Error::new(Status::BACKEND, format!("unknown backend: {s}"))),
        }
    }
}

impl TryFrom<i32> for BackendKind {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::RwkvCpp),
            1 => Ok(Self::WebRwkv),
            _ => Err(Error::new(Status::BACKEND, format!("unknown backend id: {value}"))),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterOption {
    #[default]
    Auto,
    Economical,
    Manual(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct BackendOptions {
    /// Number of leading layers quantized to `Int8`.
    pub quant: usize,
    /// Number of leading layers quantized to `NF4`. Overrides `quant` where both apply.
    pub quant_nf4: usize,
    /// Layer interval for activation rescaling. Guessed from the model name if absent.
    pub rescale: Option<usize>,
    /// Maximum tokens to be processed in parallel at once.
    #[derivative(Default(value = "128"))]
    pub token_chunk_size: usize,
    pub adapter: AdapterOption,
}

pub fn create_backend(
    kind: BackendKind,
    options: BackendOptions,
) -> Result<Box<dyn ExecutionProvider + Send>> {
    match kind {
        BackendKind::WebRwkv => Ok(Box::new(WebRwkvBackend::new(options))),
        BackendKind::RwkvCpp => Err(Error::new(
            Status::BACKEND | Status::UNSUPPORTED,
            format!("backend {kind} is not built in"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_parse_both_ways() {
        for kind in [BackendKind::RwkvCpp, BackendKind::WebRwkv] {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
            assert_eq!(BackendKind::try_from(kind as i32).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_selectors_are_backend_errors() {
        let err = "mlc-llm".parse::<BackendKind>().unwrap_err();
        assert_eq!(err.status(), Status::BACKEND);
        let err = BackendKind::try_from(7).unwrap_err();
        assert_eq!(err.status(), Status::BACKEND);
        let err = BackendKind::try_from(-1).unwrap_err();
        assert_eq!(err.status(), Status::BACKEND);
    }

    #[test]
    fn missing_backend_is_unsupported() {
        let err = create_backend(BackendKind::RwkvCpp, Default::default())
            .err()
            .unwrap();
        assert!(err.status().contains(Status::BACKEND | Status::UNSUPPORTED));
    }
}
