use crate::Result;

pub mod abc;
pub mod trie;

pub use abc::AbcTokenizer;
pub use trie::TrieTokenizer;

pub trait Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Raw bytes of the tokens. A single token may hold only part of a UTF-8 character.
    fn decode_bytes(&self, tokens: &[u32]) -> Result<Vec<u8>>;

    fn decode(&self, token: u32) -> Result<String> {
        let bytes = self.decode_bytes(&[token])?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Concatenation of every token's bytes, so characters split across tokens survive.
    fn decode_all(&self, tokens: &[u32]) -> Result<String> {
        let bytes = self.decode_bytes(tokens)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
