//! The configuration of grammar compilation and the recognizer.

use serde::{Deserialize, Serialize};

/// The configuration of token-class regex compilation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Copy)]
pub struct RegexConfig {
    /// The maximum heap usage in bytes allowed when compiling one class into
    /// a DFA. Compilation fails when the limit is exceeded. `None` means no
    /// limit.
    pub max_memory_usage: Option<usize>,
}

/// The configuration of the completion generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Copy)]
pub struct CompletionConfig {
    /// The maximum length, in bytes, of an example string sampled from a
    /// token class for debug completions.
    pub max_example_length: usize,
}

/// The configuration of [`Grammar`](crate::grammar::Grammar) compilation.
/// The defaults suffice for most scenarios.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Config {
    /// The configuration of the regular expression classes.
    pub regex_config: RegexConfig,
    /// The configuration of the completion generator.
    pub completion_config: CompletionConfig,
    /// Overrides the grammar's start nonterminal. `None` keeps the spec's
    /// `start:` directive, or the first head when there is no directive.
    pub start_nonterminal: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            regex_config: RegexConfig {
                max_memory_usage: None,
            },
            completion_config: CompletionConfig {
                max_example_length: 8,
            },
            start_nonterminal: None,
        }
    }
}
