//! The `Vocabulary` struct, which represents a language model's decoded
//! token strings.
//!
//! The engine treats tokens as opaque strings; a token's position in the
//! host-supplied list is its externally meaningful id. Tokens are indexed by
//! first character so the token filter can discard most of a large
//! vocabulary without simulating it.

use ahash::AHashMap;
use std::collections::hash_map::Entry;
use std::fmt::Debug;

/// A language model's vocabulary: an ordered list of decoded token strings.
#[derive(Clone)]
pub struct Vocabulary {
    tokens: Vec<String>,
    token_to_id: AHashMap<String, u32>,
    first_char_to_ids: AHashMap<char, Vec<u32>>,
}

impl Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field("size", &self.tokens.len())
            .finish()
    }
}

impl Vocabulary {
    /// Creates a new [`Vocabulary`] from decoded token strings, in id order.
    ///
    /// Empty tokens are kept so ids stay aligned with the host's, but they
    /// are never matched by the token filter.
    pub fn new(tokens: Vec<String>) -> Vocabulary {
        let mut token_to_id = AHashMap::with_capacity(tokens.len());
        let mut first_char_to_ids: AHashMap<char, Vec<u32>> = AHashMap::default();
        for (id, token) in tokens.iter().enumerate() {
            if token.is_empty() {
                log::warn!(
                    "token id {id} decodes to an empty string; it will never be sampled"
                );
                continue;
            }
            match token_to_id.entry(token.clone()) {
                Entry::Occupied(entry) => {
                    log::warn!(
                        "token ids {} and {id} decode to the same string; \
                         the first id is kept when matching strings to ids",
                        entry.get()
                    );
                }
                Entry::Vacant(entry) => {
                    entry.insert(id as u32);
                }
            }
            let first = token.chars().next().expect("nonempty token");
            first_char_to_ids.entry(first).or_default().push(id as u32);
        }
        Vocabulary {
            tokens,
            token_to_id,
            first_char_to_ids,
        }
    }

    /// The decoded token string for `id`, if in range.
    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(|s| s.as_str())
    }

    /// The id of the first token decoding to `token`, if any.
    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// The ordered token strings.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// The size of the vocabulary.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the vocabulary is empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The ids of all tokens starting with `ch`, in id order.
    pub(crate) fn ids_with_first_char(&self, ch: char) -> &[u32] {
        self.first_char_to_ids
            .get(&ch)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }
}

impl From<Vec<String>> for Vocabulary {
    fn from(tokens: Vec<String>) -> Vocabulary {
        Vocabulary::new(tokens)
    }
}

impl FromIterator<String> for Vocabulary {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Vocabulary {
        Vocabulary::new(iter.into_iter().collect())
    }
}
