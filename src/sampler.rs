//! The typed sampler: logit masking plus greedy or weighted choice.
//!
//! The sampler wraps a [`Recognizer`], a [`Vocabulary`] and an opaque logit
//! producer. At every step it masks out the tokens that would break a
//! syntactic or typing invariant and picks from what is left. Filtering the
//! whole vocabulary costs one simulation per surviving candidate, so
//! interactive loops should pass `pre_top_k` to restrict filtering to the
//! highest-logit candidates first.
//!
//! Setting `P7_CONSTRAINED_DEBUG=1` (or `P7_SAMPLER_DEBUG=1`) prints the fed
//! text, the current buffer and the valid-token sets to standard error.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

use ahash::AHashSet;
use rand::Rng;

use crate::grammar::{CompileError, Grammar};
use crate::recognizer::{FeedError, Recognizer};
use crate::utils::sampler_trace;
use crate::vocabulary::Vocabulary;

/// An opaque error from the logit function, surfaced unchanged to the
/// caller.
#[derive(Debug, Clone, thiserror::Error)]
#[error("model error: {0}")]
pub struct ModelError(pub String);

impl ModelError {
    /// The stable discriminator string of this error kind.
    pub fn kind(&self) -> &'static str {
        "ModelError"
    }
}

/// The opaque logit producer: one call per decoding step, returning one
/// logit per vocabulary entry. This is the only blocking operation in the
/// core; it may take arbitrary wall time.
pub type LogitFn = Box<dyn FnMut() -> Result<Vec<f32>, ModelError>>;

/// The error type for sampler operations.
#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    /// The fed text was rejected by the recognizer; state is unchanged.
    #[error(transparent)]
    Feed(#[from] FeedError),
    /// The logit function failed.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// The logit function returned a vector of the wrong length.
    #[error("model returned {got} logits for a vocabulary of {expected}")]
    LogitsLength {
        /// Number of logits received.
        got: usize,
        /// Vocabulary size.
        expected: usize,
    },
}

impl SamplerError {
    /// The stable discriminator string of this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SamplerError::Feed(err) => err.kind(),
            SamplerError::Model(err) => err.kind(),
            SamplerError::LogitsLength { .. } => "ModelError",
        }
    }
}

/// Filters a model's next-token distribution down to well-typed
/// continuations.
pub struct TypedSampler {
    recognizer: Recognizer,
    vocab: Vocabulary,
    logit_fn: LogitFn,
}

impl Debug for TypedSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedSampler")
            .field("recognizer", &self.recognizer)
            .field("vocab", &self.vocab)
            .finish()
    }
}

impl TypedSampler {
    /// Creates a sampler over a shared grammar.
    pub fn new(grammar: Arc<Grammar>, vocab: Vocabulary, logit_fn: LogitFn) -> TypedSampler {
        TypedSampler {
            recognizer: Recognizer::new(grammar),
            vocab,
            logit_fn,
        }
    }

    /// Compiles `spec` and creates a sampler over it.
    pub fn from_spec(
        spec: &str,
        vocab: Vocabulary,
        logit_fn: LogitFn,
    ) -> Result<TypedSampler, CompileError> {
        Ok(Self::new(Arc::new(Grammar::new(spec)?), vocab, logit_fn))
    }

    /// The underlying recognizer.
    pub fn recognizer(&self) -> &Recognizer {
        &self.recognizer
    }

    /// The vocabulary.
    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Restores the initial recognizer state.
    pub fn reset(&mut self) {
        self.recognizer.reset();
    }

    /// Feeds text into the recognizer. Rejection leaves the state unchanged
    /// and is surfaced as a typed error.
    pub fn feed(&mut self, text: &str) -> Result<(), FeedError> {
        self.recognizer.feed_raw(text)?;
        sampler_trace!(
            "feed({text:?}) -> current={:?}",
            self.recognizer.current_text()
        );
        if crate::utils::debug_enabled() {
            let completions = self.recognizer.get_completions();
            sampler_trace!("  completions (n={}): {completions:?}", completions.len());
            sampler_trace!("  debug_completions: {:?}", self.recognizer.debug_completions());
        }
        Ok(())
    }

    /// The accepted buffer.
    pub fn current_text(&self) -> &str {
        self.recognizer.current_text()
    }

    /// Whether the buffer is a complete derivation.
    pub fn is_complete(&self) -> bool {
        self.recognizer.is_complete()
    }

    /// Whether feeding `token` would be accepted, without feeding it.
    pub fn check_completion(&mut self, token: &str) -> bool {
        self.recognizer.simulate(token)
    }

    fn fetch_logits(&mut self) -> Result<Vec<f32>, SamplerError> {
        let logits = (self.logit_fn)()?;
        if logits.len() != self.vocab.len() {
            return Err(SamplerError::LogitsLength {
                got: logits.len(),
                expected: self.vocab.len(),
            });
        }
        Ok(logits)
    }

    /// The valid `(token id, logit)` pairs, sorted by descending logit.
    /// With `pre_top_k`, only the top-K logits are even considered.
    fn valid_pairs(&mut self, logits: &[f32], pre_top_k: Option<usize>) -> Vec<(usize, f32)> {
        let mut pairs: Vec<(usize, f32)> = match pre_top_k {
            Some(k) if k < logits.len() => {
                let mut indexed: Vec<(usize, f32)> =
                    logits.iter().copied().enumerate().collect();
                sort_by_logit(&mut indexed);
                indexed.truncate(k);
                let (chars, non_ascii_open) = self.recognizer.first_char_projection();
                indexed
                    .into_iter()
                    .filter(|&(id, _)| {
                        let Some(token) = self.vocab.token(id as u32) else {
                            return false;
                        };
                        let Some(first) = token.chars().next() else {
                            return false;
                        };
                        if !chars.contains(&first) && !(non_ascii_open && !first.is_ascii()) {
                            return false;
                        }
                        let token = token.to_string();
                        self.recognizer.simulate(&token)
                    })
                    .collect()
            }
            _ => {
                // Project the frontier's acceptable first characters onto
                // the vocabulary index, then simulate only those candidates.
                let (chars, non_ascii_open) = self.recognizer.first_char_projection();
                let mut candidates: Vec<u32> = Vec::new();
                for ch in &chars {
                    candidates.extend_from_slice(self.vocab.ids_with_first_char(*ch));
                }
                if non_ascii_open {
                    for (id, token) in self.vocab.tokens().iter().enumerate() {
                        if token.chars().next().is_some_and(|c| !c.is_ascii()) {
                            candidates.push(id as u32);
                        }
                    }
                }
                candidates.sort_unstable();
                candidates.dedup();
                candidates
                    .into_iter()
                    .filter_map(|id| {
                        let token = self.vocab.token(id)?.to_string();
                        self.recognizer
                            .simulate(&token)
                            .then(|| (id as usize, logits[id as usize]))
                    })
                    .collect()
            }
        };
        sort_by_logit(&mut pairs);
        pairs
    }

    /// The masked next-token distribution: invalid indices are set to
    /// negative infinity, valid ones keep their original logit.
    pub fn infer(&mut self, pre_top_k: Option<usize>) -> Result<Vec<f32>, SamplerError> {
        let mut logits = self.fetch_logits()?;
        let valid: AHashSet<usize> = self
            .valid_pairs(&logits, pre_top_k)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        for (id, logit) in logits.iter_mut().enumerate() {
            if !valid.contains(&id) {
                *logit = f32::NEG_INFINITY;
            }
        }
        sampler_trace!("infer(): valid_count={}", valid.len());
        Ok(logits)
    }

    /// The top-`k` valid token strings, sorted by descending logit.
    pub fn infer_text(
        &mut self,
        k: usize,
        pre_top_k: Option<usize>,
    ) -> Result<Vec<String>, SamplerError> {
        let logits = self.fetch_logits()?;
        let pairs = self.valid_pairs(&logits, pre_top_k);
        sampler_trace!(
            "infer_text(k={k}, pre_top_k={pre_top_k:?}): valid_pairs_count={}",
            pairs.len()
        );
        Ok(pairs
            .into_iter()
            .take(k)
            .filter_map(|(id, _)| self.vocab.token(id as u32).map(str::to_string))
            .collect())
    }

    /// Picks one token from the top-`k` valid candidates. `k = 1` is pure
    /// greedy; otherwise the choice is weighted by softmax over the raw
    /// logits (shifted by their maximum for stability). Returns `None` when
    /// no vocabulary token is acceptable.
    pub fn infer_greedy(
        &mut self,
        k: usize,
        pre_top_k: Option<usize>,
    ) -> Result<Option<String>, SamplerError> {
        let logits = self.fetch_logits()?;
        let pairs = self.valid_pairs(&logits, pre_top_k);
        if pairs.is_empty() {
            sampler_trace!("infer_greedy(k={k}): no valid tokens");
            return Ok(None);
        }
        if k <= 1 || pairs.len() == 1 {
            let token = self.vocab.token(pairs[0].0 as u32).map(str::to_string);
            sampler_trace!("infer_greedy: selected (greedy) {token:?}");
            return Ok(token);
        }
        let top_k = &pairs[..k.min(pairs.len())];
        let max_logit = top_k
            .iter()
            .map(|&(_, logit)| logit)
            .fold(f32::NEG_INFINITY, f32::max);
        let weights: Vec<f32> = top_k
            .iter()
            .map(|&(_, logit)| (logit - max_logit).exp())
            .collect();
        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            return Ok(self.vocab.token(top_k[0].0 as u32).map(str::to_string));
        }
        let mut remaining = rand::thread_rng().gen::<f32>() * total;
        for (&(id, _), weight) in top_k.iter().zip(&weights) {
            remaining -= weight;
            if remaining <= 0.0 {
                let token = self.vocab.token(id as u32).map(str::to_string);
                sampler_trace!("infer_greedy: selected (weighted) {token:?}");
                return Ok(token);
            }
        }
        Ok(self
            .vocab
            .token(top_k[top_k.len() - 1].0 as u32)
            .map(str::to_string))
    }

    /// Picks from the top-`k` logits ignoring the grammar entirely. Useful
    /// for comparison and for unconstrained spans.
    pub fn infer_unconstrained(&mut self, k: usize) -> Result<Option<String>, SamplerError> {
        let logits = self.fetch_logits()?;
        let mut indexed: Vec<(usize, f32)> = logits.into_iter().enumerate().collect();
        sort_by_logit(&mut indexed);
        indexed.truncate(k.max(1));
        if indexed.is_empty() {
            return Ok(None);
        }
        let pick = if indexed.len() == 1 {
            indexed[0].0
        } else {
            indexed[rand::thread_rng().gen_range(0..indexed.len())].0
        };
        Ok(self.vocab.token(pick as u32).map(str::to_string))
    }
}

fn sort_by_logit(pairs: &mut [(usize, f32)]) {
    pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
}
