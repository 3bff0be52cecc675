use thiserror::Error;

use crate::types::{StateId, TokenId};

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("The vocabulary does not allow us to build a sequence that matches the input regex: {0}")]
    Vocabulary(String),

    #[error("Invalid regex pattern: {0}")]
    InvalidPattern(String),

    #[error("Unsupported regex feature: {0}")]
    UnsupportedPattern(String),

    #[error("regex pattern too long ({len} bytes, max {max})")]
    PatternTooLong { len: usize, max: usize },

    #[error("character automaton exceeds its size limit of {max} bytes: {message}")]
    AutomatonTooLarge { max: usize, message: String },

    #[error("token index too large ({states} states, max {max})")]
    IndexTooLarge { states: usize, max: usize },

    #[error("Cannot convert token `{token}` ({id}) to bytes: {text}")]
    TokenBytes {
        token: String,
        id: TokenId,
        text: String,
    },

    #[error("No transition from state {state} with token {token_id}")]
    InvalidTransition { state: StateId, token_id: TokenId },

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ForgeError>;
