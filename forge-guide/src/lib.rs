//! Forge guide: regex-constrained generation.
//!
//! A regex is compiled into a character automaton, then walked together with
//! a tokenizer's vocabulary to build an [`Index`] that maps each generation
//! state to the tokens allowed there. [`RegexGuide`] serves that index
//! through the [`Guide`] trait; [`StopAtEosGuide`] is the unconstrained
//! counterpart.

pub mod alphabet;
pub mod automaton;
pub mod config;
pub mod guide;
#[cfg(feature = "hf")]
pub mod hf;
pub mod index;
pub mod vocabulary;

pub use alphabet::TokenAlphabet;
pub use automaton::{CharAutomaton, RegexAutomaton};
pub use config::GuideConfig;
pub use guide::{Guide, Instruction, RegexGuide, StopAtEosGuide};
pub use index::Index;
pub use vocabulary::{DecodeMode, Vocabulary};
