//! Token-level index construction.
//!
//! The builder walks a [`CharAutomaton`] and a [`TokenAlphabet`] together.
//! Whole tokens are matched character by character. Fragment tokens are
//! matched byte by byte: the bytes that do not yet form a complete UTF-8
//! sequence stay *pending*, and the pair (automaton state, pending bytes)
//! becomes an intermediate state of the index whose only continuations are
//! further fragment tokens.
//!
//! States of the resulting index are numbered canonically, so the index
//! depends only on the language of the automaton and on the vocabulary,
//! never on the automaton's own state numbering:
//!
//! 1. Starting from the start state (`0`), a depth-first stack walk numbers
//!    states as it discovers them.
//! 2. The outgoing steps of a state are visited byte steps first (ascending
//!    byte), then character steps (ascending codepoint).
//! 3. Intermediate byte positions inside a single fragment token are
//!    numbered too, even when no token ends there.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Instant;

use forge_core::{ForgeError, Result, StateId, TokenId, FINAL_STATE};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::alphabet::TokenAlphabet;
use crate::automaton::CharAutomaton;
use crate::config::GuideConfig;

/// Bytes of a UTF-8 sequence that has been started but not finished.
type Pending = SmallVec<[u8; 4]>;

/// A state of the token-level automaton before numbering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Node<S> {
    state: S,
    pending: Pending,
}

impl<S: Copy> Node<S> {
    fn clean(state: S) -> Self {
        Self {
            state,
            pending: Pending::new(),
        }
    }
}

/// One unit of progress through the automaton. Byte steps sort before
/// character steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Step {
    Byte(u8),
    Char(char),
}

/// Everything learned from one explored state.
struct Expansion<S> {
    transitions: Vec<(TokenId, Node<S>)>,
    edges: FxHashSet<(Node<S>, Step, Node<S>)>,
}

impl<S: Copy + Eq + std::hash::Hash> Expansion<S> {
    fn new() -> Self {
        Self {
            transitions: Vec::new(),
            edges: FxHashSet::default(),
        }
    }

    /// Record a successful walk from `from` along `steps` for every id in `ids`.
    fn commit(&mut self, from: &Node<S>, steps: &[(Step, Node<S>)], ids: &[TokenId]) {
        let Some((_, destination)) = steps.last() else {
            return;
        };
        let mut current = from.clone();
        for (step, next) in steps {
            self.edges.insert((current, *step, next.clone()));
            current = next.clone();
        }
        self.transitions
            .extend(ids.iter().map(|&id| (id, destination.clone())));
    }
}

enum Utf8Prefix {
    Complete(char),
    Incomplete,
    Invalid,
}

/// Re-decode the pending bytes of a single codepoint.
fn decode_prefix(bytes: &[u8]) -> Utf8Prefix {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.chars().next().map_or(Utf8Prefix::Invalid, Utf8Prefix::Complete),
        Err(e) if e.valid_up_to() == 0 && e.error_len().is_none() => Utf8Prefix::Incomplete,
        Err(_) => Utf8Prefix::Invalid,
    }
}

/// All scalar values whose UTF-8 encoding starts with `prefix`, a valid
/// incomplete sequence.
fn completions(prefix: &[u8]) -> Option<RangeInclusive<char>> {
    let (&lead, rest) = prefix.split_first()?;
    let (len, bits, min) = match lead {
        0xC2..=0xDF => (2, lead & 0x1F, 0x80),
        0xE0..=0xEF => (3, lead & 0x0F, 0x800),
        0xF0..=0xF4 => (4, lead & 0x07, 0x1_0000),
        _ => return None,
    };
    let mut lo = u32::from(bits);
    let mut hi = u32::from(bits);
    for i in 1..len {
        let (lo_bits, hi_bits) = match rest.get(i - 1) {
            Some(&b) => (b & 0x3F, b & 0x3F),
            None => (0x00, 0x3F),
        };
        lo = (lo << 6) | u32::from(lo_bits);
        hi = (hi << 6) | u32::from(hi_bits);
    }
    let lo = lo.max(min);
    let hi = hi.min(0x10_FFFF);
    let lo = if (0xD800..=0xDFFF).contains(&lo) { 0xE000 } else { lo };
    let hi = if (0xD800..=0xDFFF).contains(&hi) { 0xD7FF } else { hi };
    Some(char::from_u32(lo)?..=char::from_u32(hi)?).filter(|r| r.start() <= r.end())
}

/// Pre-computed token-level FSM index.
///
/// Maps each state to the tokens that can be appended without leaving the
/// language of the pattern, and to the state each of them leads to. Final
/// states that still have continuations also permit EOS, which leads to
/// [`FINAL_STATE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    initial_state: StateId,
    final_states: BTreeSet<StateId>,
    transitions: BTreeMap<StateId, BTreeMap<TokenId, StateId>>,
    eos_token_id: TokenId,
}

impl Index {
    /// Build the index of `automaton` over `alphabet`.
    ///
    /// Fails with [`ForgeError::Vocabulary`] when no token sequence leads
    /// from the start state to a final state.
    pub fn new<A>(
        automaton: &A,
        alphabet: &TokenAlphabet,
        eos_token_id: TokenId,
        config: &GuideConfig,
    ) -> Result<Self>
    where
        A: CharAutomaton + Sync,
    {
        IndexBuilder {
            automaton,
            alphabet,
            config,
        }
        .build(eos_token_id)
    }

    pub fn initial_state(&self) -> StateId {
        self.initial_state
    }

    /// States that correspond to a final automaton state. The post-EOS
    /// sentinel is not listed.
    pub fn final_states(&self) -> &BTreeSet<StateId> {
        &self.final_states
    }

    pub fn transitions(&self) -> &BTreeMap<StateId, BTreeMap<TokenId, StateId>> {
        &self.transitions
    }

    pub fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    /// Ascending ids allowed from `state`, `None` if the state has no
    /// outgoing token.
    pub fn allowed_tokens(&self, state: StateId) -> Option<Vec<TokenId>> {
        self.transitions
            .get(&state)
            .map(|map| map.keys().copied().collect())
    }

    pub fn next_state(&self, state: StateId, token_id: TokenId) -> Option<StateId> {
        self.transitions.get(&state)?.get(&token_id).copied()
    }

    pub fn is_final_state(&self, state: StateId) -> bool {
        state == FINAL_STATE || self.final_states.contains(&state)
    }

    /// Number of states with outgoing tokens.
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn num_transitions(&self) -> usize {
        self.transitions.values().map(BTreeMap::len).sum()
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Index object with transitions:")?;
        for (state, tokens) in &self.transitions {
            writeln!(f, "{state:?} -> {tokens:?}")?;
        }
        Ok(())
    }
}

struct IndexBuilder<'a, A> {
    automaton: &'a A,
    alphabet: &'a TokenAlphabet,
    config: &'a GuideConfig,
}

impl<'a, A> IndexBuilder<'a, A>
where
    A: CharAutomaton + Sync,
{
    fn build(&self, eos_token_id: TokenId) -> Result<Index> {
        let started = Instant::now();
        let start = Node::clean(self.automaton.start_state());

        // Explore depth by depth. States of one depth are independent of
        // each other, so they are expanded in parallel and merged in order.
        let mut explored: FxHashMap<Node<A::State>, Vec<(TokenId, Node<A::State>)>> =
            FxHashMap::default();
        let mut edges: FxHashMap<Node<A::State>, BTreeMap<Step, Node<A::State>>> =
            FxHashMap::default();
        let mut seen: FxHashSet<Node<A::State>> = FxHashSet::from_iter([start.clone()]);
        let mut frontier = vec![start.clone()];
        let mut depth = 0usize;
        let mut near_limit = false;

        while !frontier.is_empty() {
            let expansions: Vec<Expansion<A::State>> = if self.config.parallel {
                frontier.par_iter().map(|node| self.expand(node)).collect()
            } else {
                frontier.iter().map(|node| self.expand(node)).collect()
            };

            let mut next_frontier = Vec::new();
            for (node, expansion) in frontier.into_iter().zip(expansions) {
                for (from, step, to) in expansion.edges {
                    edges.entry(from).or_default().insert(step, to);
                }
                for (_, destination) in &expansion.transitions {
                    if seen.insert(destination.clone()) {
                        if seen.len() > self.config.max_index_states {
                            return Err(ForgeError::IndexTooLarge {
                                states: seen.len(),
                                max: self.config.max_index_states,
                            });
                        }
                        next_frontier.push(destination.clone());
                    }
                }
                explored.insert(node, expansion.transitions);
            }
            if !near_limit && seen.len() > self.config.max_index_states / 10 * 9 {
                warn!(
                    states = seen.len(),
                    max = self.config.max_index_states,
                    "token index is close to its state limit"
                );
                near_limit = true;
            }

            debug!(
                depth,
                frontier = next_frontier.len(),
                explored = explored.len(),
                "explored token index level"
            );
            next_frontier.sort_unstable();
            frontier = next_frontier;
            depth += 1;
        }

        let live = self.live_states(&explored);
        if !live.contains(&start) {
            return Err(ForgeError::Vocabulary(
                "no token sequence reaches a final state from the start state".into(),
            ));
        }

        let numbers = number_states(&start, &edges, &live);

        let mut transitions: BTreeMap<StateId, BTreeMap<TokenId, StateId>> = BTreeMap::new();
        for (node, outgoing) in &explored {
            if !live.contains(node) {
                continue;
            }
            let map: BTreeMap<TokenId, StateId> = outgoing
                .iter()
                .filter(|(_, destination)| live.contains(destination))
                .map(|(id, destination)| (*id, numbers[destination]))
                .collect();
            if map.is_empty() {
                continue;
            }
            transitions.insert(numbers[node], map);
        }
        for (node, &number) in &numbers {
            if self.is_final(node) {
                if let Some(map) = transitions.get_mut(&number) {
                    map.insert(eos_token_id, FINAL_STATE);
                }
            }
        }

        let final_states: BTreeSet<StateId> = numbers
            .iter()
            .filter(|(node, _)| self.is_final(node))
            .map(|(_, &number)| number)
            .collect();

        let index = Index {
            initial_state: numbers[&start],
            final_states,
            transitions,
            eos_token_id,
        };
        info!(
            states = index.len(),
            transitions = index.num_transitions(),
            explored = explored.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "built token index"
        );
        Ok(index)
    }

    fn is_final(&self, node: &Node<A::State>) -> bool {
        node.pending.is_empty() && self.automaton.is_final(node.state)
    }

    /// Every token that can be emitted from `node`, with the walks that
    /// produced them.
    fn expand(&self, node: &Node<A::State>) -> Expansion<A::State> {
        let mut expansion = Expansion::new();
        let mut steps: Vec<(Step, Node<A::State>)> = Vec::new();

        // Whole tokens cannot continue a pending sequence: their first byte
        // is never a continuation byte.
        if node.pending.is_empty() {
            'tokens: for token in self.alphabet.whole_tokens() {
                steps.clear();
                let mut state = node.state;
                for c in token.text.chars() {
                    match self.automaton.transition(state, c) {
                        Some(next) => {
                            state = next;
                            steps.push((Step::Char(c), Node::clean(next)));
                        }
                        None => continue 'tokens,
                    }
                }
                expansion.commit(node, &steps, &token.ids);
            }
        }

        // Memo of single byte steps, keyed by (automaton state, pending
        // suffix). Local to this state, so expansions share nothing.
        let mut memo: FxHashMap<(Node<A::State>, u8), Option<(Step, Node<A::State>)>> =
            FxHashMap::default();
        'fragments: for token in self.alphabet.fragment_tokens() {
            steps.clear();
            let mut current = node.clone();
            for &byte in &token.bytes {
                let step = memo
                    .entry((current.clone(), byte))
                    .or_insert_with(|| self.step_byte(&current, byte))
                    .clone();
                match step {
                    Some((step, next)) => {
                        current = next.clone();
                        steps.push((step, next));
                    }
                    None => continue 'fragments,
                }
            }
            expansion.commit(node, &steps, &token.ids);
        }
        expansion
    }

    /// Append one raw byte to `node`, decoding it together with the pending
    /// bytes.
    fn step_byte(&self, node: &Node<A::State>, byte: u8) -> Option<(Step, Node<A::State>)> {
        if node.pending.is_empty() && byte.is_ascii() {
            let c = char::from(byte);
            let next = self.automaton.transition(node.state, c)?;
            return Some((Step::Char(c), Node::clean(next)));
        }
        let mut pending = node.pending.clone();
        pending.push(byte);
        match decode_prefix(&pending) {
            Utf8Prefix::Complete(c) => {
                let next = self.automaton.transition(node.state, c)?;
                Some((Step::Byte(byte), Node::clean(next)))
            }
            Utf8Prefix::Incomplete => {
                let range = completions(&pending)?;
                if !self.automaton.accepts_any(node.state, range) {
                    return None;
                }
                Some((
                    Step::Byte(byte),
                    Node {
                        state: node.state,
                        pending,
                    },
                ))
            }
            Utf8Prefix::Invalid => None,
        }
    }

    /// States from which some token sequence reaches a final state.
    fn live_states(
        &self,
        explored: &FxHashMap<Node<A::State>, Vec<(TokenId, Node<A::State>)>>,
    ) -> FxHashSet<Node<A::State>> {
        let mut incoming: FxHashMap<&Node<A::State>, Vec<&Node<A::State>>> = FxHashMap::default();
        for (from, outgoing) in explored {
            for (_, to) in outgoing {
                incoming.entry(to).or_default().push(from);
            }
        }
        let mut live: FxHashSet<Node<A::State>> = FxHashSet::default();
        let mut stack: Vec<&Node<A::State>> = explored.keys().filter(|n| self.is_final(n)).collect();
        while let Some(node) = stack.pop() {
            if !live.insert(node.clone()) {
                continue;
            }
            if let Some(sources) = incoming.get(node) {
                stack.extend(sources.iter().copied().filter(|s| !live.contains(*s)));
            }
        }
        live
    }
}

/// Canonical numbering: depth-first stack walk from `start` over the
/// recorded steps, numbering on discovery. Only states that lead to a live
/// state are entered.
fn number_states<S>(
    start: &Node<S>,
    edges: &FxHashMap<Node<S>, BTreeMap<Step, Node<S>>>,
    live: &FxHashSet<Node<S>>,
) -> FxHashMap<Node<S>, StateId>
where
    S: Copy + Eq + std::hash::Hash,
{
    let mut incoming: FxHashMap<&Node<S>, Vec<&Node<S>>> = FxHashMap::default();
    for (from, steps) in edges {
        for to in steps.values() {
            incoming.entry(to).or_default().push(from);
        }
    }
    let mut useful: FxHashSet<&Node<S>> = FxHashSet::default();
    let mut stack: Vec<&Node<S>> = live.iter().collect();
    while let Some(node) = stack.pop() {
        if !useful.insert(node) {
            continue;
        }
        if let Some(sources) = incoming.get(node) {
            stack.extend(sources.iter().copied().filter(|s| !useful.contains(*s)));
        }
    }

    let mut numbers: FxHashMap<Node<S>, StateId> = FxHashMap::default();
    numbers.insert(start.clone(), 0);
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        let Some(steps) = edges.get(node) else {
            continue;
        };
        for next in steps.values() {
            if !useful.contains(next) || numbers.contains_key(next) {
                continue;
            }
            numbers.insert(next.clone(), numbers.len() as StateId);
            stack.push(next);
        }
    }
    numbers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_prefixes() {
        assert!(matches!(decode_prefix(&[0xF0]), Utf8Prefix::Incomplete));
        assert!(matches!(decode_prefix(&[0xF0, 0x9F, 0x98]), Utf8Prefix::Incomplete));
        assert!(matches!(
            decode_prefix(&[0xF0, 0x9F, 0x98, 0x88]),
            Utf8Prefix::Complete('😈')
        ));
        assert!(matches!(decode_prefix(&[0xF0, 0x41]), Utf8Prefix::Invalid));
        assert!(matches!(decode_prefix(&[0x9F]), Utf8Prefix::Invalid));
        assert!(matches!(decode_prefix(&[0xC0]), Utf8Prefix::Invalid));
        // Surrogate encodings are never valid.
        assert!(matches!(decode_prefix(&[0xED, 0xA0]), Utf8Prefix::Invalid));
    }

    #[test]
    fn completion_ranges() {
        assert_eq!(completions(&[0xC3]), Some('\u{C0}'..='\u{FF}'));
        assert_eq!(completions(&[0xE0]), Some('\u{800}'..='\u{FFF}'));
        assert_eq!(completions(&[0xED]), Some('\u{D000}'..='\u{D7FF}'));
        assert_eq!(
            completions(&[0xF0, 0x9F, 0x98]),
            Some('\u{1F600}'..='\u{1F63F}')
        );
        assert_eq!(completions(&[0xF4]), Some('\u{100000}'..='\u{10FFFF}'));
        assert_eq!(completions(&[0x41]), None);
    }

    #[test]
    fn steps_sort_bytes_first() {
        assert!(Step::Byte(0xFF) < Step::Char('\0'));
        assert!(Step::Char('a') < Step::Char('b'));
    }
}
