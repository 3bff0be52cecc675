//! Hugging Face `tokenizers` adapter.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use forge_core::{ForgeError, Result, TokenId, Tokenizer};
use serde_json::Value;
use tokenizers::Decoder;
use tracing::{debug, warn};

const SPIECE_UNDERLINE: char = '\u{2581}';

/// A `tokenizer.json` loaded through the `tokenizers` crate.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    vocabulary: HashMap<String, TokenId>,
    special_tokens: HashSet<String>,
    eos_token_id: TokenId,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| ForgeError::Tokenizer(e.to_string()))?;
        let eos_token_id = resolve_eos(&inner, path);
        Ok(Self::new(inner, eos_token_id))
    }

    pub fn new(inner: tokenizers::Tokenizer, eos_token_id: TokenId) -> Self {
        let vocabulary = inner.get_vocab(true);
        let special_tokens: HashSet<String> = inner
            .get_added_tokens_decoder()
            .into_iter()
            .filter(|(_, token)| token.special)
            .map(|(_, token)| token.content)
            .collect();
        debug!(
            vocabulary = vocabulary.len(),
            special = special_tokens.len(),
            eos_token_id,
            "loaded tokenizer"
        );
        Self {
            inner,
            vocabulary,
            special_tokens,
            eos_token_id,
        }
    }

    pub fn inner(&self) -> &tokenizers::Tokenizer {
        &self.inner
    }
}

/// EOS spellings tried when `tokenizer_config.json` names none.
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>"];
const DEFAULT_EOS_ID: TokenId = 2;

fn resolve_eos(inner: &tokenizers::Tokenizer, path: &Path) -> TokenId {
    let config = path
        .parent()
        .and_then(|dir| std::fs::read_to_string(dir.join("tokenizer_config.json")).ok())
        .and_then(|text| serde_json::from_str::<Value>(&text).ok());

    config
        .as_ref()
        .and_then(|config| configured_eos(inner, config))
        .or_else(|| EOS_CANDIDATES.iter().find_map(|token| inner.token_to_id(token)))
        .unwrap_or_else(|| {
            warn!(id = DEFAULT_EOS_ID, "no EOS token found, using default id");
            DEFAULT_EOS_ID
        })
}

/// `eos_token_id`, else `eos_token` as a string or an added-token object.
fn configured_eos(inner: &tokenizers::Tokenizer, config: &Value) -> Option<TokenId> {
    if let Some(id) = config["eos_token_id"].as_u64() {
        return TokenId::try_from(id).ok();
    }
    let token = match &config["eos_token"] {
        Value::String(token) => token.as_str(),
        other => other["content"].as_str()?,
    };
    inner.token_to_id(token)
}

impl Tokenizer for HfTokenizer {
    fn vocabulary(&self) -> &HashMap<String, TokenId> {
        &self.vocabulary
    }

    fn special_tokens(&self) -> &HashSet<String> {
        &self.special_tokens
    }

    fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    /// Decode a single token. SentencePiece decoders strip the leading
    /// space of a word-initial token, so it is put back here.
    fn convert_token_to_string(&self, token: &str) -> String {
        let text = match self.inner.get_decoder() {
            Some(decoder) => match decoder.decode(vec![token.to_string()]) {
                Ok(text) => text,
                Err(e) => {
                    warn!(token, error = %e, "decoder rejected token");
                    token.to_string()
                }
            },
            None => token.to_string(),
        };
        if token.starts_with(SPIECE_UNDERLINE) || token == "<0x20>" {
            format!(" {text}")
        } else {
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::alphabet::TokenAlphabet;

    /// A WordLevel tokenizer over `vocab` with `special` as added tokens.
    fn tokenizer_json(vocab: Value, special: &[(&str, TokenId)], decoder: Value) -> Value {
        let added: Vec<Value> = special
            .iter()
            .map(|(content, id)| {
                json!({
                    "id": id,
                    "content": content,
                    "single_word": false,
                    "lstrip": false,
                    "rstrip": false,
                    "normalized": false,
                    "special": true
                })
            })
            .collect();
        json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": added,
            "normalizer": null,
            "pre_tokenizer": null,
            "post_processor": null,
            "decoder": decoder,
            "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
        })
    }

    fn build(json: Value) -> tokenizers::Tokenizer {
        json.to_string().parse().unwrap()
    }

    /// Llama-style: `▁` word markers and `<0xHH>` byte tokens.
    fn sentencepiece() -> HfTokenizer {
        let decoder = json!({
            "type": "Sequence",
            "decoders": [
                {"type": "Replace", "pattern": {"String": "▁"}, "content": " "},
                {"type": "ByteFallback"},
                {"type": "Fuse"},
                {"type": "Strip", "content": " ", "start": 1, "stop": 0}
            ]
        });
        let vocab = json!({
            "<unk>": 0, "</s>": 1, "▁hello": 2, "<0x20>": 3, "<0xF0>": 4, "<0x9F>": 5, "a": 6
        });
        HfTokenizer::new(build(tokenizer_json(vocab, &[("</s>", 1)], decoder)), 1)
    }

    /// GPT-2-style: every byte spelled through the byte-level alphabet.
    fn byte_level() -> HfTokenizer {
        let decoder = json!({
            "type": "ByteLevel",
            "add_prefix_space": true,
            "trim_offsets": true,
            "use_regex": true
        });
        let vocab = json!({
            "<unk>": 0, "<|endoftext|>": 1, "Ġhello": 2, "Ġð": 3, "Ł": 4, "a": 5
        });
        HfTokenizer::new(build(tokenizer_json(vocab, &[("<|endoftext|>", 1)], decoder)), 1)
    }

    #[test]
    fn sentencepiece_tokens_keep_their_space() {
        let tokenizer = sentencepiece();
        assert_eq!(tokenizer.convert_token_to_string("▁hello"), " hello");
        assert_eq!(tokenizer.convert_token_to_string("<0x20>"), " ");
        assert_eq!(tokenizer.convert_token_to_string("a"), "a");
        assert_eq!(tokenizer.convert_token_to_string("<0xF0>"), "\u{FFFD}");
    }

    #[test]
    fn byte_level_tokens_decode_to_bytes() {
        let tokenizer = byte_level();
        assert_eq!(tokenizer.convert_token_to_string("Ġhello"), " hello");
        assert_eq!(tokenizer.convert_token_to_string("Ġð"), " \u{FFFD}");
    }

    #[test]
    fn special_tokens_come_from_added_tokens() {
        let tokenizer = sentencepiece();
        assert!(tokenizer.special_tokens().contains("</s>"));
        assert_eq!(tokenizer.special_tokens().len(), 1);
        assert_eq!(tokenizer.vocabulary().get("▁hello"), Some(&2));
    }

    #[test]
    fn byte_fallback_alphabet() {
        let alphabet = TokenAlphabet::from_tokenizer(&sentencepiece()).unwrap();
        assert_eq!(alphabet.ids_for(" hello"), Some(&[2][..]));
        assert_eq!(alphabet.ids_for(" "), Some(&[3][..]));
        assert_eq!(alphabet.ids_for("</s>"), None);

        let fragments: Vec<(&[u8], &[TokenId])> = alphabet
            .fragment_tokens()
            .iter()
            .map(|f| (f.bytes.as_slice(), f.ids.as_slice()))
            .collect();
        assert_eq!(fragments, vec![(&[0x9F][..], &[5][..]), (&[0xF0][..], &[4][..])]);
    }

    #[test]
    fn byte_level_alphabet() {
        let alphabet = TokenAlphabet::from_tokenizer(&byte_level()).unwrap();
        assert_eq!(alphabet.ids_for(" hello"), Some(&[2][..]));
        assert_eq!(alphabet.ids_for("a"), Some(&[5][..]));

        let fragments: Vec<(&[u8], &[TokenId])> = alphabet
            .fragment_tokens()
            .iter()
            .map(|f| (f.bytes.as_slice(), f.ids.as_slice()))
            .collect();
        assert_eq!(fragments, vec![(&[0x20, 0xF0][..], &[3][..]), (&[0x9F][..], &[4][..])]);
    }

    fn write_tokenizer(dir: &Path, config: Option<Value>) -> std::path::PathBuf {
        let vocab = json!({"<unk>": 0, "</s>": 1, "<|im_end|>": 2, "a": 3});
        let special = [("</s>", 1), ("<|im_end|>", 2)];
        let path = dir.join("tokenizer.json");
        std::fs::write(&path, tokenizer_json(vocab, &special, Value::Null).to_string()).unwrap();
        if let Some(config) = config {
            std::fs::write(dir.join("tokenizer_config.json"), config.to_string()).unwrap();
        }
        path
    }

    #[test]
    fn eos_from_tokenizer_config() {
        for config in [
            json!({"eos_token": "<|im_end|>"}),
            json!({"eos_token": {"content": "<|im_end|>", "special": true}}),
            json!({"eos_token_id": 2, "eos_token": "</s>"}),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let path = write_tokenizer(dir.path(), Some(config.clone()));
            let tokenizer = HfTokenizer::from_file(&path).unwrap();
            assert_eq!(tokenizer.eos_token_id(), 2, "{config}");
        }
    }

    #[test]
    fn eos_from_known_spellings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tokenizer(dir.path(), None);
        assert_eq!(HfTokenizer::from_file(&path).unwrap().eos_token_id(), 1);

        // An unknown configured token falls through to the known spellings.
        let dir = tempfile::tempdir().unwrap();
        let path = write_tokenizer(dir.path(), Some(json!({"eos_token": "<eos>"})));
        assert_eq!(HfTokenizer::from_file(&path).unwrap().eos_token_id(), 1);
    }

    #[test]
    fn missing_tokenizer_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = HfTokenizer::from_file(&dir.path().join("tokenizer.json")).unwrap_err();
        assert!(matches!(err, ForgeError::Tokenizer(_)));
    }
}
