//! Character-level automata.
//!
//! The index builder only needs the [`CharAutomaton`] capability, so any
//! deterministic automaton over Unicode scalar values can drive it.
//! [`RegexAutomaton`] is the provider used by `RegexGuide::from_regex`: a
//! minimized `regex-automata` dense DFA over UTF-8 bytes, stepped one
//! codepoint at a time.

use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::RangeInclusive;

use forge_core::{ForgeError, Result};
use regex_automata::dfa::{dense, Automaton, StartKind};
use regex_automata::util::primitives::StateID;
use regex_automata::util::{start, syntax};
use regex_automata::{Anchored, MatchKind};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::config::GuideConfig;

/// Trait abstracting a character-level DFA for use in token index building.
///
/// State values are opaque: the builder never assumes anything about their
/// numbering.
pub trait CharAutomaton {
    type State: Copy + Eq + Ord + Hash + Debug + Send + Sync;

    fn start_state(&self) -> Self::State;

    fn is_final(&self, state: Self::State) -> bool;

    /// `None` when `c` leads to the dead state.
    fn transition(&self, state: Self::State, c: char) -> Option<Self::State>;

    /// Whether some codepoint in `range` has a transition out of `state`.
    ///
    /// The builder uses this to avoid opening intermediate byte states that
    /// no codepoint could complete. Answering `true` is always safe.
    fn accepts_any(&self, state: Self::State, range: RangeInclusive<char>) -> bool {
        let _ = (state, range);
        true
    }
}

impl<A: CharAutomaton + ?Sized> CharAutomaton for &A {
    type State = A::State;

    fn start_state(&self) -> Self::State {
        (**self).start_state()
    }

    fn is_final(&self, state: Self::State) -> bool {
        (**self).is_final(state)
    }

    fn transition(&self, state: Self::State, c: char) -> Option<Self::State> {
        (**self).transition(state, c)
    }

    fn accepts_any(&self, state: Self::State, range: RangeInclusive<char>) -> bool {
        (**self).accepts_any(state, range)
    }
}

/// A regex compiled into a character-level automaton.
///
/// The pattern must match the whole text: the DFA is anchored at the start
/// and a state is final when the end of input leads to a match.
///
/// The dense DFA reports a match one byte late, so two of its states can
/// differ only in whether the text *before* the last byte matched. Those
/// states have identical transitions and are folded into one, leaving one
/// state per remaining language. States that can no longer reach a match
/// are treated as dead.
pub struct RegexAutomaton {
    dfa: dense::DFA<Vec<u32>>,
    start: StateID,
    /// Live state → representative of its transition row.
    canonical: FxHashMap<StateID, StateID>,
    len: usize,
}

impl RegexAutomaton {
    /// Compile a regex pattern into a character-level DFA.
    pub fn new(pattern: &str) -> Result<Self> {
        Self::with_config(pattern, &GuideConfig::default())
    }

    pub fn with_config(pattern: &str, config: &GuideConfig) -> Result<Self> {
        if pattern.len() > config.max_pattern_len {
            return Err(ForgeError::PatternTooLong {
                len: pattern.len(),
                max: config.max_pattern_len,
            });
        }

        // Syntax errors first, so that DFA build errors are only about
        // unsupported features and size.
        syntax::parse(pattern).map_err(|e| ForgeError::InvalidPattern(e.to_string()))?;

        let dfa = dense::Builder::new()
            .configure(
                dense::DFA::config()
                    .start_kind(StartKind::Anchored)
                    .match_kind(MatchKind::All)
                    .minimize(true)
                    .dfa_size_limit(Some(config.dfa_size_limit))
                    .determinize_size_limit(Some(config.dfa_size_limit)),
            )
            .build(pattern)
            .map_err(|e| {
                if e.is_size_limit_exceeded() {
                    ForgeError::AutomatonTooLarge {
                        max: config.dfa_size_limit,
                        message: e.to_string(),
                    }
                } else {
                    ForgeError::UnsupportedPattern(e.to_string())
                }
            })?;

        let start_config = start::Config::new().anchored(Anchored::Yes);
        let start = dfa
            .start_state(&start_config)
            .map_err(|e| ForgeError::UnsupportedPattern(format!("no start state: {e}")))?;

        let canonical = fold_states(&dfa, start);
        let len = canonical.values().collect::<FxHashSet<_>>().len();
        let start = canonical.get(&start).copied().unwrap_or(start);
        debug!(
            pattern,
            dfa_bytes = dfa.memory_usage(),
            states = len,
            "compiled character automaton"
        );
        Ok(Self {
            dfa,
            start,
            canonical,
            len,
        })
    }

    /// Number of distinct live states, intermediate UTF-8 positions included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the pattern matches nothing at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Feed `bytes` from `state`, stopping at the first state that can no
    /// longer reach a match.
    fn walk(&self, state: StateID, bytes: &[u8]) -> Option<StateID> {
        let mut sid = state;
        for &byte in bytes {
            sid = self.dfa.next_state(sid, byte);
            if !self.canonical.contains_key(&sid) {
                return None;
            }
        }
        self.canonical.get(&sid).copied()
    }
}

/// Explore every state reachable from `start`, keep those from which a
/// match is still reachable, and map each to the first state seen with the
/// same transition row.
fn fold_states(dfa: &dense::DFA<Vec<u32>>, start: StateID) -> FxHashMap<StateID, StateID> {
    let bytes: Vec<u8> = dfa
        .byte_classes()
        .representatives(0..=255)
        .filter_map(|unit| unit.as_u8())
        .collect();

    let mut rows: FxHashMap<StateID, (Vec<StateID>, StateID)> = FxHashMap::default();
    let mut incoming: FxHashMap<StateID, Vec<StateID>> = FxHashMap::default();
    let mut seen: FxHashSet<StateID> = FxHashSet::from_iter([start]);
    let mut stack = vec![start];
    while let Some(sid) = stack.pop() {
        let row: Vec<StateID> = bytes.iter().map(|&b| dfa.next_state(sid, b)).collect();
        for &next in &row {
            if dfa.is_dead_state(next) || dfa.is_quit_state(next) {
                continue;
            }
            incoming.entry(next).or_default().push(sid);
            if seen.insert(next) {
                stack.push(next);
            }
        }
        rows.insert(sid, (row, dfa.next_eoi_state(sid)));
    }

    let mut live: FxHashSet<StateID> = FxHashSet::default();
    let mut stack: Vec<StateID> = rows
        .iter()
        .filter(|(_, (_, eoi))| dfa.is_match_state(*eoi))
        .map(|(&sid, _)| sid)
        .collect();
    while let Some(sid) = stack.pop() {
        if !live.insert(sid) {
            continue;
        }
        if let Some(sources) = incoming.get(&sid) {
            stack.extend(sources.iter().copied().filter(|s| !live.contains(s)));
        }
    }

    // Sorted so the choice of representative does not depend on hash order.
    let mut live: Vec<StateID> = live.into_iter().collect();
    live.sort_unstable();
    let mut by_row: FxHashMap<&(Vec<StateID>, StateID), StateID> = FxHashMap::default();
    let mut canonical = FxHashMap::default();
    for sid in live {
        let row = &rows[&sid];
        let representative = *by_row.entry(row).or_insert(sid);
        canonical.insert(sid, representative);
    }
    canonical
}

impl CharAutomaton for RegexAutomaton {
    type State = StateID;

    fn start_state(&self) -> StateID {
        self.start
    }

    fn is_final(&self, state: StateID) -> bool {
        self.dfa.is_match_state(self.dfa.next_eoi_state(state))
    }

    fn transition(&self, state: StateID, c: char) -> Option<StateID> {
        let mut buf = [0; 4];
        self.walk(state, c.encode_utf8(&mut buf).as_bytes())
    }

    /// Feeds the UTF-8 prefix shared by every codepoint in `range`.
    fn accepts_any(&self, state: StateID, range: RangeInclusive<char>) -> bool {
        let (mut lo_buf, mut hi_buf) = ([0; 4], [0; 4]);
        let lo = range.start().encode_utf8(&mut lo_buf).as_bytes();
        let hi = range.end().encode_utf8(&mut hi_buf).as_bytes();
        if lo.len() != hi.len() {
            return true;
        }
        let shared = lo.iter().zip(hi).take_while(|(a, b)| a == b).count();
        self.walk(state, &lo[..shared]).is_some()
    }
}

impl fmt::Debug for RegexAutomaton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RegexAutomaton ({} states, {} bytes)",
            self.len,
            self.dfa.memory_usage()
        )
    }
}
