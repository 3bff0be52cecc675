//! Limits and switches for index construction.

use forge_core::Result;
use serde::Deserialize;

/// Index construction settings.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use forge_guide::GuideConfig;
///
/// let config = GuideConfig::from_json_str(r#"{ "parallel": false }"#).unwrap();
/// assert!(!config.parallel);
/// assert_eq!(config.max_pattern_len, 8192);
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct GuideConfig {
    /// Longest accepted pattern, in bytes.
    #[serde(default = "default_max_pattern_len")]
    pub max_pattern_len: usize,
    /// Memory budget of the character DFA and of its determinization, in bytes.
    #[serde(default = "default_dfa_size_limit")]
    pub dfa_size_limit: usize,
    /// Upper bound on explored token-level states, intermediate byte states included.
    #[serde(default = "default_max_index_states")]
    pub max_index_states: usize,
    /// Explore each depth level of the automaton on the rayon pool.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

fn default_max_pattern_len() -> usize {
    8192
}
fn default_dfa_size_limit() -> usize {
    10 * 1024 * 1024
}
fn default_max_index_states() -> usize {
    2_000_000
}
fn default_parallel() -> bool {
    true
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            max_pattern_len: default_max_pattern_len(),
            dfa_size_limit: default_dfa_size_limit(),
            max_index_states: default_max_index_states(),
            parallel: default_parallel(),
        }
    }
}

impl GuideConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
