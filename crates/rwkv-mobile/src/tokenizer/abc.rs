use super::Tokenizer;
use crate::Result;

/// Byte-level vocabulary of the ABC music models: every byte is its own token.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbcTokenizer;

impl AbcTokenizer {
    pub const PAD_TOKEN: u32 = 0;
    pub const BOS_TOKEN: u32 = 2;
    pub const EOS_TOKEN: u32 = 3;
}

impl Tokenizer for AbcTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode_bytes(&self, tokens: &[u32]) -> Result<Vec<u8>> {
        let bytes = tokens
            .iter()
            .filter(|&&token| token > Self::EOS_TOKEN)
            .filter_map(|&token| u8::try_from(token).ok())
            .collect();
        Ok(bytes)
    }
}
