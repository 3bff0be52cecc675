/// Vocabulary token id.
pub type TokenId = u32;

/// Token-level automaton state.
///
/// Non-negative ids are issued by the index builder; negative ids are
/// reserved for sentinels.
pub type StateId = i32;

/// Every guide starts here.
pub const START_STATE: StateId = 0;

/// Terminal state, reached only by emitting the end-of-sequence token.
pub const FINAL_STATE: StateId = -1;
