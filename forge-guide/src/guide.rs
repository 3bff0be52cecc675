//! Guides: the per-step contract a generation loop talks to.
//!
//! A guide is immutable once built. Callers keep their own current
//! [`StateId`] per sequence, so a single guide can drive any number of
//! sequences (beam search branches included) at once.

use std::collections::BTreeMap;
use std::sync::Arc;

use forge_core::{ForgeError, Result, StateId, TokenId, Tokenizer, FINAL_STATE, START_STATE};
use tracing::debug;

use crate::alphabet::TokenAlphabet;
use crate::automaton::{CharAutomaton, RegexAutomaton};
use crate::config::GuideConfig;
use crate::index::Index;

/// What the generation loop must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Sample the next token, restricted to these ids when present.
    Generate(Option<Vec<TokenId>>),
    /// Append these tokens verbatim without sampling.
    Write(Vec<TokenId>),
}

impl Instruction {
    pub fn tokens(&self) -> Option<&[TokenId]> {
        match self {
            Instruction::Generate(tokens) => tokens.as_deref(),
            Instruction::Write(tokens) => Some(tokens),
        }
    }

    /// Whether `token_id` is an acceptable next token under this instruction.
    pub fn allows(&self, token_id: TokenId) -> bool {
        match self {
            Instruction::Generate(None) => true,
            Instruction::Generate(Some(tokens)) => tokens.contains(&token_id),
            Instruction::Write(tokens) => tokens.first() == Some(&token_id),
        }
    }
}

/// Trait for FSM-based generation constraints.
pub trait Guide: Send + Sync {
    fn start_state(&self) -> StateId {
        START_STATE
    }

    fn final_state(&self) -> StateId {
        FINAL_STATE
    }

    fn next_instruction(&self, state: StateId) -> Instruction;

    /// Advance from `state` by `token_id`.
    ///
    /// Emitting EOS always leads to [`FINAL_STATE`]. A token that the last
    /// instruction did not allow is an [`ForgeError::InvalidTransition`].
    fn next_state(&self, state: StateId, token_id: TokenId) -> Result<StateId>;

    fn is_final_state(&self, state: StateId) -> bool;
}

/// Unconstrained guide: anything goes until EOS.
#[derive(Debug, Clone)]
pub struct StopAtEosGuide {
    eos_token_id: TokenId,
    vocabulary_size: usize,
}

impl StopAtEosGuide {
    pub fn new<T: Tokenizer + ?Sized>(tokenizer: &T) -> Self {
        Self {
            eos_token_id: tokenizer.eos_token_id(),
            vocabulary_size: tokenizer.vocabulary_size(),
        }
    }

    pub fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    /// Size of the id space `Generate(None)` leaves open.
    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary_size
    }
}

impl Guide for StopAtEosGuide {
    fn next_instruction(&self, state: StateId) -> Instruction {
        if state == FINAL_STATE {
            Instruction::Write(vec![self.eos_token_id])
        } else {
            Instruction::Generate(None)
        }
    }

    fn next_state(&self, _state: StateId, token_id: TokenId) -> Result<StateId> {
        if token_id == self.eos_token_id {
            Ok(FINAL_STATE)
        } else {
            Ok(START_STATE)
        }
    }

    fn is_final_state(&self, state: StateId) -> bool {
        state == FINAL_STATE
    }
}

/// Guide that keeps the generated text inside the language of a regex.
///
/// Cloning shares the underlying [`Index`].
#[derive(Debug, Clone)]
pub struct RegexGuide {
    index: Arc<Index>,
}

impl RegexGuide {
    /// Compile `pattern` and build its index over `tokenizer`'s vocabulary.
    pub fn from_regex<T: Tokenizer + ?Sized>(pattern: &str, tokenizer: &T) -> Result<Self> {
        Self::from_regex_with_config(pattern, tokenizer, &GuideConfig::default())
    }

    pub fn from_regex_with_config<T: Tokenizer + ?Sized>(
        pattern: &str,
        tokenizer: &T,
        config: &GuideConfig,
    ) -> Result<Self> {
        let automaton = RegexAutomaton::with_config(pattern, config)?;
        Self::from_automaton_with_config(&automaton, tokenizer, config)
    }

    /// Build from an already compiled character automaton.
    pub fn from_automaton<A, T>(automaton: &A, tokenizer: &T) -> Result<Self>
    where
        A: CharAutomaton + Sync,
        T: Tokenizer + ?Sized,
    {
        Self::from_automaton_with_config(automaton, tokenizer, &GuideConfig::default())
    }

    pub fn from_automaton_with_config<A, T>(
        automaton: &A,
        tokenizer: &T,
        config: &GuideConfig,
    ) -> Result<Self>
    where
        A: CharAutomaton + Sync,
        T: Tokenizer + ?Sized,
    {
        let alphabet = TokenAlphabet::from_tokenizer(tokenizer)?;
        if alphabet.is_empty() {
            return Err(ForgeError::Vocabulary(
                "no usable token after excluding special and empty tokens".into(),
            ));
        }
        let index = Index::new(automaton, &alphabet, tokenizer.eos_token_id(), config)?;
        Ok(Self::from_index(index))
    }

    pub fn from_index(index: Index) -> Self {
        debug!(states = index.len(), "regex guide ready");
        Self {
            index: Arc::new(index),
        }
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// The raw index: state → (token id → next state).
    pub fn index_dict(&self) -> &BTreeMap<StateId, BTreeMap<TokenId, StateId>> {
        self.index.transitions()
    }

    pub fn eos_token_id(&self) -> TokenId {
        self.index.eos_token_id()
    }
}

impl Guide for RegexGuide {
    fn start_state(&self) -> StateId {
        self.index.initial_state()
    }

    /// `Generate` over the index entry of `state`, EOS included when the
    /// state is also final. States without an entry can only end the
    /// sequence.
    fn next_instruction(&self, state: StateId) -> Instruction {
        match self.index.allowed_tokens(state) {
            Some(tokens) => Instruction::Generate(Some(tokens)),
            None => Instruction::Write(vec![self.index.eos_token_id()]),
        }
    }

    fn next_state(&self, state: StateId, token_id: TokenId) -> Result<StateId> {
        if token_id == self.index.eos_token_id() {
            return Ok(FINAL_STATE);
        }
        self.index
            .next_state(state, token_id)
            .ok_or(ForgeError::InvalidTransition { state, token_id })
    }

    fn is_final_state(&self, state: StateId) -> bool {
        self.index.is_final_state(state)
    }
}
