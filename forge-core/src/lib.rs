//! Forge core types, the tokenizer contract, and error definitions.

pub mod error;
pub mod tokenizer;
pub mod types;

pub use error::{ForgeError, Result};
pub use tokenizer::Tokenizer;
pub use types::*;
