//! The tokenizer contract consumed by guides.

use std::collections::{HashMap, HashSet};

use crate::types::TokenId;

/// What a guide needs to know about a tokenizer.
///
/// Implementations are expected to be cheap to query; guides read the
/// vocabulary once at construction time.
pub trait Tokenizer {
    /// Raw token text → token id. Ids are unique.
    fn vocabulary(&self) -> &HashMap<String, TokenId>;

    /// Token texts that never take part in pattern matching (EOS, BOS, ...).
    fn special_tokens(&self) -> &HashSet<String>;

    fn eos_token_id(&self) -> TokenId;

    /// Decode a single raw token to its user-visible form.
    ///
    /// Tokens holding part of a multi-byte UTF-8 sequence decode to one or
    /// more U+FFFD replacement characters.
    fn convert_token_to_string(&self, token: &str) -> String;

    /// Number of ids a sampler may choose from.
    fn vocabulary_size(&self) -> usize {
        self.vocabulary()
            .values()
            .max()
            .map_or(0, |&max| max as usize + 1)
            .max(self.eos_token_id() as usize + 1)
    }
}
