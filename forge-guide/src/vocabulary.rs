//! In-memory tokenizer.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use forge_core::{ForgeError, Result, TokenId, Tokenizer};
use serde::Deserialize;

use crate::alphabet::{byte_fallback_token, REPLACEMENT, UNICODE_TO_BYTES};

/// How raw token text turns into user-visible text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeMode {
    /// Tokens are their own text.
    #[default]
    Identity,
    /// SentencePiece: `▁` is a space and `<0xHH>` is a raw byte.
    ByteFallback,
    /// GPT-2 byte-level BPE: every character stands for one byte.
    ByteLevel,
}

/// A vocabulary held in memory, usable anywhere a [`Tokenizer`] is expected.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: HashMap<String, TokenId>,
    special_tokens: HashSet<String>,
    eos_token_id: TokenId,
    decode_mode: DecodeMode,
}

#[derive(Deserialize)]
struct VocabularyFile {
    eos_token_id: TokenId,
    #[serde(default)]
    special_tokens: Vec<String>,
    #[serde(default)]
    decode_mode: DecodeMode,
    vocabulary: HashMap<String, TokenId>,
}

impl Vocabulary {
    pub fn new(eos_token_id: TokenId) -> Self {
        Self {
            tokens: HashMap::new(),
            special_tokens: HashSet::new(),
            eos_token_id,
            decode_mode: DecodeMode::Identity,
        }
    }

    pub fn with_decode_mode(mut self, decode_mode: DecodeMode) -> Self {
        self.decode_mode = decode_mode;
        self
    }

    /// Add a token that never takes part in matching. It still receives an id.
    pub fn with_special_token(mut self, token: impl Into<String>, id: TokenId) -> Result<Self> {
        let token = token.into();
        self.try_insert(token.clone(), id)?;
        self.special_tokens.insert(token);
        Ok(self)
    }

    /// Insert `token` with `id`; both must be new.
    pub fn try_insert(&mut self, token: impl Into<String>, id: TokenId) -> Result<()> {
        let token = token.into();
        if self.tokens.contains_key(&token) {
            return Err(ForgeError::Tokenizer(format!("duplicate token `{token}`")));
        }
        if self.tokens.values().any(|&existing| existing == id) {
            return Err(ForgeError::Tokenizer(format!("duplicate token id {id}")));
        }
        self.tokens.insert(token, id);
        Ok(())
    }

    /// Load from JSON:
    ///
    /// ```json
    /// {"eos_token_id": 3, "special_tokens": ["eos"], "decode_mode": "byte_fallback",
    ///  "vocabulary": {"1": 1, "a": 2, "eos": 3}}
    /// ```
    pub fn from_json_str(text: &str) -> Result<Self> {
        let file: VocabularyFile = serde_json::from_str(text)?;
        let mut vocabulary = Self::new(file.eos_token_id).with_decode_mode(file.decode_mode);
        for (token, id) in file.vocabulary {
            vocabulary.try_insert(token, id)?;
        }
        for token in file.special_tokens {
            if !vocabulary.tokens.contains_key(&token) {
                return Err(ForgeError::Tokenizer(format!(
                    "special token `{token}` is not in the vocabulary"
                )));
            }
            vocabulary.special_tokens.insert(token);
        }
        Ok(vocabulary)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Tokenizer for Vocabulary {
    fn vocabulary(&self) -> &HashMap<String, TokenId> {
        &self.tokens
    }

    fn special_tokens(&self) -> &HashSet<String> {
        &self.special_tokens
    }

    fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    fn convert_token_to_string(&self, token: &str) -> String {
        match self.decode_mode {
            DecodeMode::Identity => token.to_string(),
            DecodeMode::ByteFallback => match byte_fallback_token(token) {
                Some(byte) if byte.is_ascii() => char::from(byte).to_string(),
                Some(_) => REPLACEMENT.to_string(),
                None => token.replace('\u{2581}', " "),
            },
            DecodeMode::ByteLevel => {
                let mut bytes = Vec::with_capacity(token.len());
                for c in token.chars() {
                    match UNICODE_TO_BYTES.get(&c) {
                        Some(&byte) => bytes.push(byte),
                        None => bytes.extend_from_slice(c.encode_utf8(&mut [0; 4]).as_bytes()),
                    }
                }
                String::from_utf8_lossy(&bytes).into_owned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicates() {
        let mut vocabulary = Vocabulary::new(0);
        vocabulary.try_insert("a", 1).unwrap();
        assert!(vocabulary.try_insert("a", 2).is_err());
        assert!(vocabulary.try_insert("b", 1).is_err());
        assert_eq!(vocabulary.len(), 1);
    }

    #[test]
    fn byte_fallback_decoding() {
        let vocabulary = Vocabulary::new(0).with_decode_mode(DecodeMode::ByteFallback);
        assert_eq!(vocabulary.convert_token_to_string("<0xF0>"), "\u{FFFD}");
        assert_eq!(vocabulary.convert_token_to_string("<0x41>"), "A");
        assert_eq!(vocabulary.convert_token_to_string("▁hello"), " hello");
    }

    #[test]
    fn byte_level_decoding() {
        let vocabulary = Vocabulary::new(0).with_decode_mode(DecodeMode::ByteLevel);
        assert_eq!(vocabulary.convert_token_to_string("Ġhello"), " hello");
        assert_eq!(vocabulary.convert_token_to_string("Ġð"), " \u{FFFD}");
        assert_eq!(vocabulary.convert_token_to_string("ðŁĺį"), "😍");
    }

    #[test]
    fn loads_json() {
        let vocabulary = Vocabulary::from_json_str(
            r#"{"eos_token_id": 3, "special_tokens": ["eos"],
                "vocabulary": {"1": 1, "a": 2, "eos": 3}}"#,
        )
        .unwrap();
        assert_eq!(vocabulary.eos_token_id(), 3);
        assert!(vocabulary.special_tokens().contains("eos"));
        assert_eq!(vocabulary.vocabulary_size(), 4);
        assert_eq!(vocabulary.convert_token_to_string("a"), "a");
    }

    #[test]
    fn unknown_special_token_is_an_error() {
        let err = Vocabulary::from_json_str(
            r#"{"eos_token_id": 3, "special_tokens": ["</s>"], "vocabulary": {"a": 2}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ForgeError::Tokenizer(_)));
    }
}
