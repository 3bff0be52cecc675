//! Token alphabet resolution.
//!
//! Splits a vocabulary into *whole* tokens, which decode to complete
//! characters and are matched character by character, and *fragment*
//! tokens, which carry raw bytes of an incomplete UTF-8 sequence and decode
//! to U+FFFD on their own. Fragment tokens are matched byte by byte by the
//! index builder.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

use forge_core::{ForgeError, Result, TokenId, Tokenizer};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

pub(crate) const REPLACEMENT: char = char::REPLACEMENT_CHARACTER;

/// SentencePiece word-boundary marker.
const SPIECE_UNDERLINE: char = '\u{2581}';

/// Raw bytes of a fragment token. Almost always 1-4 bytes.
pub type TokenBytes = SmallVec<[u8; 8]>;

/// All ids that decode to the same complete text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WholeToken {
    pub text: String,
    pub ids: Vec<TokenId>,
}

/// All ids that carry the same raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentToken {
    pub bytes: TokenBytes,
    pub ids: Vec<TokenId>,
}

/// The matching alphabet derived from a tokenizer.
///
/// Both token lists are sorted (by text and by bytes), and ids inside each
/// entry are ascending, so the alphabet is identical for identical input
/// regardless of hash map iteration order.
#[derive(Debug, Clone, Default)]
pub struct TokenAlphabet {
    whole: Vec<WholeToken>,
    fragments: Vec<FragmentToken>,
    empty_token_ids: Vec<TokenId>,
}

impl TokenAlphabet {
    /// Resolve the alphabet of `tokenizer`, excluding its special tokens
    /// and its EOS id.
    pub fn from_tokenizer<T: Tokenizer + ?Sized>(tokenizer: &T) -> Result<Self> {
        Self::resolve(
            tokenizer.vocabulary(),
            |token| tokenizer.convert_token_to_string(token),
            tokenizer.special_tokens(),
            Some(tokenizer.eos_token_id()),
        )
    }

    /// Classify every vocabulary entry.
    ///
    /// Tokens that decode to the empty string are dropped and listed in
    /// [`TokenAlphabet::empty_token_ids`]. A fragmentary token whose raw
    /// bytes cannot be recovered is an error.
    pub fn resolve<F>(
        vocabulary: &HashMap<String, TokenId>,
        decode: F,
        special_tokens: &HashSet<String>,
        eos_token_id: Option<TokenId>,
    ) -> Result<Self>
    where
        F: Fn(&str) -> String,
    {
        let mut whole: BTreeMap<String, Vec<TokenId>> = BTreeMap::new();
        let mut fragments: BTreeMap<TokenBytes, Vec<TokenId>> = BTreeMap::new();
        let mut empty_token_ids = Vec::new();

        for (token, &id) in vocabulary {
            if special_tokens.contains(token) || Some(id) == eos_token_id {
                continue;
            }
            let text = decode(token);
            if text.is_empty() {
                empty_token_ids.push(id);
                continue;
            }
            if text.contains(REPLACEMENT) && !is_replacement_sequence(token) {
                let bytes = token_bytes(token).ok_or_else(|| ForgeError::TokenBytes {
                    token: token.clone(),
                    id,
                    text: text.clone(),
                })?;
                fragments.entry(bytes).or_default().push(id);
            } else {
                whole.entry(text).or_default().push(id);
            }
        }

        let whole: Vec<WholeToken> = whole
            .into_iter()
            .map(|(text, mut ids)| {
                ids.sort_unstable();
                WholeToken { text, ids }
            })
            .collect();
        let fragments: Vec<FragmentToken> = fragments
            .into_iter()
            .map(|(bytes, mut ids)| {
                ids.sort_unstable();
                FragmentToken { bytes, ids }
            })
            .collect();
        empty_token_ids.sort_unstable();

        debug!(
            whole = whole.len(),
            fragments = fragments.len(),
            empty = empty_token_ids.len(),
            "resolved token alphabet"
        );

        Ok(Self {
            whole,
            fragments,
            empty_token_ids,
        })
    }

    pub fn whole_tokens(&self) -> &[WholeToken] {
        &self.whole
    }

    pub fn fragment_tokens(&self) -> &[FragmentToken] {
        &self.fragments
    }

    pub fn empty_token_ids(&self) -> &[TokenId] {
        &self.empty_token_ids
    }

    /// Ids whose decoded form is exactly `text`.
    pub fn ids_for(&self, text: &str) -> Option<&[TokenId]> {
        self.whole
            .binary_search_by(|entry| entry.text.as_str().cmp(text))
            .ok()
            .map(|i| self.whole[i].ids.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.whole.is_empty() && self.fragments.is_empty()
    }
}

/// Tokens such as `"\u{FFFD}"` or `"▁\u{FFFD}\u{FFFD}"` stand for the
/// replacement character itself, not for raw bytes.
fn is_replacement_sequence(token: &str) -> bool {
    let rest = token.trim_start_matches(SPIECE_UNDERLINE);
    !rest.is_empty() && rest.chars().all(|c| c == REPLACEMENT)
}

/// Recover the raw bytes behind a fragmentary token, either from a
/// `<0xHH>` byte-fallback token or through the GPT-2 byte-level alphabet.
fn token_bytes(token: &str) -> Option<TokenBytes> {
    if let Some(byte) = byte_fallback_token(token) {
        return Some(SmallVec::from_slice(&[byte]));
    }
    token
        .chars()
        .map(|c| UNICODE_TO_BYTES.get(&c).copied())
        .collect()
}

/// Parse `<0xHH>`, the byte-fallback spelling used by SentencePiece models.
pub(crate) fn byte_fallback_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'A'..=b'F')) {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// GPT-2 byte-level alphabet: printable bytes map to themselves, the rest
/// to consecutive codepoints from U+0100 in byte order.
pub(crate) static BYTES_TO_UNICODE: LazyLock<[char; 256]> = LazyLock::new(|| {
    let mut table = [REPLACEMENT; 256];
    let mut shifted = 0u32;
    for byte in 0..=255u8 {
        table[byte as usize] = if matches!(byte, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF) {
            char::from(byte)
        } else {
            shifted += 1;
            char::from_u32(255 + shifted).unwrap_or(REPLACEMENT)
        };
    }
    table
});

pub(crate) static UNICODE_TO_BYTES: LazyLock<FxHashMap<char, u8>> = LazyLock::new(|| {
    BYTES_TO_UNICODE
        .iter()
        .enumerate()
        .map(|(byte, &c)| (c, byte as u8))
        .collect()
});

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(entries: &[(&str, TokenId)]) -> HashMap<String, TokenId> {
        entries.iter().map(|(t, id)| (t.to_string(), *id)).collect()
    }

    fn specials(entries: &[&str]) -> HashSet<String> {
        entries.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn gpt2_table_round_trips() {
        assert_eq!(BYTES_TO_UNICODE[b' ' as usize], 'Ġ');
        assert_eq!(BYTES_TO_UNICODE[0xF0], 'ð');
        assert_eq!(BYTES_TO_UNICODE[0x9F], 'Ł');
        assert_eq!(BYTES_TO_UNICODE[0x98], 'ĺ');
        assert_eq!(BYTES_TO_UNICODE[0x88], 'Ī');
        assert_eq!(UNICODE_TO_BYTES.len(), 256);
    }

    #[test]
    fn byte_fallback_tokens() {
        assert_eq!(byte_fallback_token("<0xF0>"), Some(0xF0));
        assert_eq!(byte_fallback_token("<0x0A>"), Some(0x0A));
        assert_eq!(byte_fallback_token("<0xf0>"), None);
        assert_eq!(byte_fallback_token("<0xF>"), None);
        assert_eq!(byte_fallback_token("0xF0"), None);
    }

    #[test]
    fn replacement_sequences() {
        assert!(is_replacement_sequence("\u{FFFD}"));
        assert!(is_replacement_sequence("\u{FFFD}\u{FFFD}"));
        assert!(is_replacement_sequence("▁\u{FFFD}"));
        assert!(!is_replacement_sequence("▁"));
        assert!(!is_replacement_sequence("<0xF0>"));
    }

    #[test]
    fn splits_whole_and_fragment_tokens() {
        let vocabulary = vocab(&[
            ("1", 1),
            ("a", 2),
            ("eos", 3),
            ("<0xF0>", 5),
            ("<0x9F>", 6),
            ("\u{FFFD}", 9),
        ]);
        let alphabet = TokenAlphabet::resolve(
            &vocabulary,
            |t| if t.starts_with('<') { "\u{FFFD}".into() } else { t.into() },
            &specials(&["eos"]),
            Some(3),
        )
        .unwrap();

        let whole: Vec<_> = alphabet.whole_tokens().iter().map(|w| w.text.as_str()).collect();
        assert_eq!(whole, vec!["1", "a", "\u{FFFD}"]);
        let fragments: Vec<_> = alphabet
            .fragment_tokens()
            .iter()
            .map(|f| (f.bytes.to_vec(), f.ids.clone()))
            .collect();
        assert_eq!(fragments, vec![(vec![0x9F], vec![6]), (vec![0xF0], vec![5])]);
        assert_eq!(alphabet.ids_for("\u{FFFD}"), Some(&[9][..]));
        assert_eq!(alphabet.ids_for("eos"), None);
    }

    #[test]
    fn groups_ids_with_identical_text() {
        let vocabulary = vocab(&[("x", 4), ("▁x", 7), ("y", 1)]);
        let alphabet = TokenAlphabet::resolve(
            &vocabulary,
            |t| t.trim_start_matches('▁').to_string(),
            &HashSet::new(),
            None,
        )
        .unwrap();
        assert_eq!(alphabet.ids_for("x"), Some(&[4, 7][..]));
        assert_eq!(alphabet.whole_tokens().len(), 2);
    }

    #[test]
    fn gpt2_fragments_map_through_byte_table() {
        let vocabulary = vocab(&[("Ġð", 10), ("ŁĺĪ", 11)]);
        let alphabet = TokenAlphabet::resolve(
            &vocabulary,
            |_| "\u{FFFD}".to_string(),
            &HashSet::new(),
            None,
        )
        .unwrap();
        let fragments: Vec<_> = alphabet
            .fragment_tokens()
            .iter()
            .map(|f| f.bytes.to_vec())
            .collect();
        assert_eq!(fragments, vec![vec![0x20, 0xF0], vec![0x9F, 0x98, 0x88]]);
    }

    #[test]
    fn drops_empty_tokens() {
        let vocabulary = vocab(&[("<pad>", 0), ("a", 1)]);
        let alphabet = TokenAlphabet::resolve(
            &vocabulary,
            |t| if t == "<pad>" { String::new() } else { t.to_string() },
            &HashSet::new(),
            None,
        )
        .unwrap();
        assert_eq!(alphabet.empty_token_ids(), &[0]);
        assert_eq!(alphabet.whole_tokens().len(), 1);
    }

    #[test]
    fn unrecoverable_fragment_is_an_error() {
        // U+4E2D is neither a byte-fallback token nor in the GPT-2 table.
        let vocabulary = vocab(&[("中", 3)]);
        let err = TokenAlphabet::resolve(
            &vocabulary,
            |_| "\u{FFFD}".to_string(),
            &HashSet::new(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ForgeError::TokenBytes { id: 3, .. }));
    }
}
