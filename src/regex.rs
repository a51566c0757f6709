//! Prefix-aware matching for the token classes of a grammar.
//!
//! Every regex class in a grammar spec is compiled once, at grammar load, into
//! an anchored dense DFA. The recognizer then never re-runs a regex over the
//! buffer: it stores a [`StateID`] per live derivation and advances it one
//! byte at a time. Prefix validity falls out of the DFA representation: a text
//! is a prefix of some member of the class exactly when walking it does not
//! reach the dead state.

use std::collections::VecDeque;
use std::fmt::Debug;

use ahash::AHashMap;
use fixedbitset::FixedBitSet;
use regex_automata::dfa::{dense, Automaton, StartKind};
use regex_automata::util::primitives::StateID;
use regex_automata::{Anchored, Input, MatchError};

/// The set of bytes that keep a DFA state alive.
pub(crate) type ByteSet = FixedBitSet;

/// The status of a DFA state with respect to the whole class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ClassState {
    /// The consumed text is a full match. It may still be extendable.
    Accept,
    /// The consumed text is not a prefix of any match.
    Reject,
    /// The consumed text is a proper prefix of at least one match.
    InProgress,
}

/// The error type for compiling a token-class pattern.
#[derive(Debug, thiserror::Error)]
pub enum RegexCompileError {
    /// The pattern could not be compiled into a DFA.
    #[error("{0}")]
    Build(#[from] dense::BuildError),
    /// The anchored start state could not be computed.
    #[error("{0}")]
    Start(#[from] MatchError),
}

/// A compiled token class: an anchored DFA plus the per-state byte sets the
/// recognizer and the completion generator consult on every step.
#[derive(Clone)]
pub struct ClassPattern {
    pattern: Box<str>,
    dfa: dense::DFA<Vec<u32>>,
    start: StateID,
    live_bytes: AHashMap<StateID, ByteSet>,
}

impl Debug for ClassPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassPattern")
            .field("pattern", &self.pattern)
            .field("states", &self.live_bytes.len())
            .finish()
    }
}

impl ClassPattern {
    /// Compiles `pattern` into an anchored, minimized DFA.
    ///
    /// `size_limit` bounds the DFA's heap usage in bytes; compilation fails
    /// when the bound is exceeded.
    pub fn compile(pattern: &str, size_limit: Option<usize>) -> Result<Self, RegexCompileError> {
        let dfa = dense::Builder::new()
            .configure(
                dense::Config::new()
                    .start_kind(StartKind::Anchored)
                    .minimize(true)
                    .dfa_size_limit(size_limit),
            )
            .build(pattern)?;
        let start = dfa.start_state_forward(&Input::new("").anchored(Anchored::Yes))?;
        let live_bytes = Self::construct_live_bytes(&dfa, start);
        Ok(Self {
            pattern: pattern.into(),
            dfa,
            start,
            live_bytes,
        })
    }

    /// Walks every state reachable from `start` and records, for each, the
    /// bytes whose transition does not lead to the dead state.
    fn construct_live_bytes(
        dfa: &dense::DFA<Vec<u32>>,
        start: StateID,
    ) -> AHashMap<StateID, ByteSet> {
        let mut live_bytes = AHashMap::default();
        let mut queue = vec![start];
        while let Some(state) = queue.pop() {
            if live_bytes.contains_key(&state) {
                continue;
            }
            let mut set = ByteSet::with_capacity(256);
            for byte in 0..=u8::MAX {
                let next = dfa.next_state(state, byte);
                if dfa.is_dead_state(next) || dfa.is_quit_state(next) {
                    continue;
                }
                set.insert(byte as usize);
                if !live_bytes.contains_key(&next) {
                    queue.push(next);
                }
            }
            live_bytes.insert(state, set);
        }
        live_bytes
    }

    /// The pattern this class was compiled from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The anchored start state.
    pub(crate) fn start_state(&self) -> StateID {
        self.start
    }

    /// Advances `state` by one byte.
    pub(crate) fn next_state(&self, state: StateID, byte: u8) -> StateID {
        self.dfa.next_state(state, byte)
    }

    /// Classifies `state` as accepting, rejecting or in progress.
    pub(crate) fn status(&self, state: StateID) -> ClassState {
        if self.dfa.is_special_state(state)
            && (self.dfa.is_dead_state(state) || self.dfa.is_quit_state(state))
        {
            return ClassState::Reject;
        }
        if self.dfa.is_match_state(self.dfa.next_eoi_state(state)) {
            ClassState::Accept
        } else {
            ClassState::InProgress
        }
    }

    /// The bytes that keep `state` alive.
    pub(crate) fn live_bytes(&self, state: StateID) -> Option<&ByteSet> {
        self.live_bytes.get(&state)
    }

    /// Walks `text` from the start state, returning the final state if no
    /// byte led to the dead state.
    fn walk(&self, text: &str) -> Option<StateID> {
        let mut state = self.start;
        for &byte in text.as_bytes() {
            state = self.dfa.next_state(state, byte);
            if self.status(state) == ClassState::Reject {
                return None;
            }
        }
        Some(state)
    }

    /// Does `text` match the whole class?
    pub fn full_match(&self, text: &str) -> bool {
        match self.walk(text) {
            Some(state) => self.status(state) == ClassState::Accept,
            None => false,
        }
    }

    /// Is `text` a prefix of some string that matches the class?
    pub fn prefix_valid(&self, text: &str) -> bool {
        self.walk(text).is_some()
    }

    /// Resumes walking from `state` over the bytes of `text`.
    pub(crate) fn walk_from(&self, state: StateID, text: &str) -> Option<StateID> {
        let mut state = state;
        for &byte in text.as_bytes() {
            state = self.dfa.next_state(state, byte);
            if self.status(state) == ClassState::Reject {
                return None;
            }
        }
        Some(state)
    }

    /// Produces one short example string accepted from `state`, preferring
    /// printable characters. Search is breadth-first, so the example is a
    /// shortest one; it is `None` when no match is reachable within
    /// `max_len` ASCII bytes.
    pub(crate) fn example_from(&self, state: StateID, max_len: usize) -> Option<String> {
        const CANDIDATES: [std::ops::RangeInclusive<u8>; 2] = [b' '..=b'~', b'\t'..=b'\r'];
        let mut visited = ahash::AHashSet::new();
        let mut queue: VecDeque<(StateID, String)> = VecDeque::new();
        queue.push_back((state, String::new()));
        visited.insert(state);
        while let Some((state, text)) = queue.pop_front() {
            if self.status(state) == ClassState::Accept {
                return Some(text);
            }
            if text.len() >= max_len {
                continue;
            }
            for byte in CANDIDATES.iter().cloned().flatten() {
                let next = self.dfa.next_state(state, byte);
                if self.status(next) == ClassState::Reject || !visited.insert(next) {
                    continue;
                }
                let mut extended = text.clone();
                extended.push(byte as char);
                queue.push_back((next, extended));
            }
        }
        None
    }
}

/// Does `text` fully match `pattern`? The pattern is implicitly anchored at
/// both ends.
pub fn regex_matches(pattern: &str, text: &str) -> Result<bool, RegexCompileError> {
    Ok(ClassPattern::compile(pattern, None)?.full_match(text))
}

/// Is `text` a prefix of some string that fully matches `pattern`?
pub fn regex_prefix_valid(pattern: &str, text: &str) -> Result<bool, RegexCompileError> {
    Ok(ClassPattern::compile(pattern, None)?.prefix_valid(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_match_is_anchored() {
        let class = ClassPattern::compile("[0-9]+", None).unwrap();
        assert!(class.full_match("042"));
        assert!(!class.full_match("42a"));
        assert!(!class.full_match(""));
    }

    #[test]
    fn prefix_validity_tracks_partial_consumption() {
        let class = ClassPattern::compile("[a-z]+[0-9]{2}", None).unwrap();
        assert!(class.prefix_valid(""));
        assert!(class.prefix_valid("ab"));
        assert!(class.prefix_valid("ab1"));
        assert!(!class.prefix_valid("1"));
        assert!(!class.prefix_valid("ab123"));
    }

    #[test]
    fn optional_classes_accept_empty() {
        let class = ClassPattern::compile("[ ]*", None).unwrap();
        assert_eq!(class.status(class.start_state()), ClassState::Accept);
        assert!(class.full_match(""));
        assert!(class.full_match("   "));
    }

    #[test]
    fn examples_are_shortest_accepting_strings() {
        let class = ClassPattern::compile("[a-c][0-9]+", None).unwrap();
        let example = class.example_from(class.start_state(), 8).unwrap();
        assert_eq!(example.len(), 2);
        assert!(class.full_match(&example));
    }

    #[test]
    fn top_level_helpers() {
        assert!(regex_matches("[0-9]{1,3}", "27").unwrap());
        assert!(!regex_matches("[0-9]{1,3}", "2727").unwrap());
        assert!(regex_prefix_valid("[0-9]{3}", "27").unwrap());
        assert!(!regex_prefix_valid("[0-9]{3}", "a").unwrap());
    }
}
