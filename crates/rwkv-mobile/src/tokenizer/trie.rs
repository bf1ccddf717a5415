use std::path::Path;

use super::Tokenizer;
use crate::{error::StatusExt, Result, Status};

/// The RWKV world vocabulary, matched greedily over a byte trie.
#[derive(Debug)]
pub struct TrieTokenizer(web_rwkv::tokenizer::Tokenizer);

impl TrieTokenizer {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).status(Status::IO | Status::TOKENIZER)?;
        let tokenizer = Self::from_json(&contents)?;
        log::info!("[tokenizer][load] {}", path.display());
        Ok(tokenizer)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let tokenizer = web_rwkv::tokenizer::Tokenizer::new(contents).status(Status::TOKENIZER)?;
        Ok(Self(tokenizer))
    }
}

impl Tokenizer for TrieTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.0.encode(text.as_bytes()).status(Status::TOKENIZER)
    }

    fn decode_bytes(&self, tokens: &[u32]) -> Result<Vec<u8>> {
        self.0.decode(tokens).status(Status::TOKENIZER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_vocabulary_is_an_io_error() {
        let err = TrieTokenizer::load("assets/tokenizer/does_not_exist.json").unwrap_err();
        assert!(err.status().contains(Status::IO | Status::TOKENIZER));
    }

    #[test]
    fn malformed_vocabulary_is_rejected() {
        let err = TrieTokenizer::from_json("this is not a vocabulary").unwrap_err();
        assert_eq!(err.status(), Status::TOKENIZER);
    }
}
