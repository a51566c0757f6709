//! The opaque model abstraction the reasoning environment drives.
//!
//! A [`ModelHandle`] exposes constrained and unconstrained generation plus
//! the tag and stop-token conventions of the underlying model family.
//! [`LogitModel`] implements it directly over a vocabulary and a logit
//! function; hosts that wrap a real inference stack implement the trait
//! themselves. Model loading, tokenizer adapters and any process-wide model
//! cache belong to the host, not to this crate.

use std::sync::Arc;

use crate::generation::{GenerateOptions, GenerationResult, OnToken, StopReason, TokenStream};
use crate::grammar::Grammar;
use crate::sampler::{LogitFn, SamplerError, TypedSampler};
use crate::utils::dedupe_tokens;
use crate::vocabulary::Vocabulary;

/// A request for one grammar-constrained span.
#[derive(Debug, Clone, Default)]
pub struct ConstrainedRequest {
    /// The initial buffer text (a partial expression), fed before sampling.
    pub initial: String,
    /// The token budget for this span.
    pub max_tokens: usize,
    /// Stop as soon as the buffer is a complete derivation.
    pub until_complete: bool,
}

/// A request for one unconstrained span.
#[derive(Debug, Clone)]
pub struct UnconstrainedRequest {
    /// The token budget for this span.
    pub max_tokens: usize,
    /// Sample from the top-K logits; `None` is greedy.
    pub top_k: Option<usize>,
    /// Strings that end the span when sampled.
    pub stop_tokens: Vec<String>,
}

impl Default for UnconstrainedRequest {
    fn default() -> Self {
        Self {
            max_tokens: 50,
            top_k: None,
            stop_tokens: Vec::new(),
        }
    }
}

/// The opaque model handle the reasoning environment generates through.
///
/// `prompt` is the accumulated conversation so far; how (and whether) it
/// conditions the model is the implementation's business. The engine only
/// relies on the returned text and summary.
pub trait ModelHandle {
    /// The tag that opens an unconstrained reasoning span.
    fn think_open(&self) -> String {
        "<think>".to_string()
    }

    /// The tag that closes an unconstrained reasoning span.
    fn think_close(&self) -> String {
        "</think>".to_string()
    }

    /// Whether a system prompt should be prepended for this model family.
    fn allow_system_prompt(&self) -> bool {
        true
    }

    /// The stop tokens for unconstrained spans: the think-close tag, both
    /// grammar tags and common end-of-text markers.
    fn stop_tokens_unconstrained(&self, grammar_name: &str) -> Vec<String> {
        dedupe_tokens(vec![
            self.think_close(),
            format!("<{grammar_name}>"),
            format!("</{grammar_name}>"),
            "<|end|>".to_string(),
            "<|endoftext|>".to_string(),
            "<|eot_id|>".to_string(),
        ])
    }

    /// The stop tokens for constrained spans.
    fn stop_tokens_constrained(&self, grammar_name: &str) -> Vec<String> {
        dedupe_tokens(vec![
            format!("</{grammar_name}>"),
            "<|end|>".to_string(),
            "<|endoftext|>".to_string(),
            "<|eot_id|>".to_string(),
        ])
    }

    /// Generates one grammar-constrained span.
    fn generate_constrained(
        &mut self,
        prompt: &str,
        request: &ConstrainedRequest,
        on_token: OnToken<'_>,
    ) -> Result<GenerationResult, SamplerError>;

    /// Generates one unconstrained span.
    fn generate_unconstrained(
        &mut self,
        prompt: &str,
        request: &UnconstrainedRequest,
        on_token: OnToken<'_>,
    ) -> Result<GenerationResult, SamplerError>;
}

/// A [`ModelHandle`] over a vocabulary and an opaque logit function.
///
/// The logit function is context-blind from the engine's point of view: it
/// is called once per step and may track its own context. Constrained spans
/// run through a [`TypedSampler`]; unconstrained spans sample the raw
/// distribution and stop on stop tokens.
pub struct LogitModel {
    sampler: TypedSampler,
    /// Sample constrained tokens from the top-`greedy_k` valid candidates.
    pub greedy_k: usize,
    /// Restrict constrained filtering to the top-K logits.
    pub pre_top_k: Option<usize>,
}

impl LogitModel {
    /// Creates a model over a shared grammar, a vocabulary and a logit
    /// function.
    pub fn new(grammar: Arc<Grammar>, vocab: Vocabulary, logit_fn: LogitFn) -> LogitModel {
        LogitModel {
            sampler: TypedSampler::new(grammar, vocab, logit_fn),
            greedy_k: 1,
            pre_top_k: Some(100),
        }
    }

    /// The underlying sampler.
    pub fn sampler(&self) -> &TypedSampler {
        &self.sampler
    }
}

impl ModelHandle for LogitModel {
    fn generate_constrained(
        &mut self,
        _prompt: &str,
        request: &ConstrainedRequest,
        mut on_token: OnToken<'_>,
    ) -> Result<GenerationResult, SamplerError> {
        self.sampler.reset();
        let options = GenerateOptions {
            max_tokens: request.max_tokens,
            greedy_k: self.greedy_k,
            pre_top_k: self.pre_top_k,
            stop_on_complete: request.until_complete,
        };
        if !request.initial.is_empty() {
            if let Err(err) = self.sampler.feed(&request.initial) {
                return Ok(GenerationResult {
                    text: request.initial.clone(),
                    is_complete: false,
                    tokens_generated: 0,
                    stop_reason: StopReason::TypeError(err.to_string()),
                });
            }
        }
        if request.until_complete && self.sampler.is_complete() {
            return Ok(GenerationResult {
                text: self.sampler.current_text().to_string(),
                is_complete: true,
                tokens_generated: 0,
                stop_reason: StopReason::Complete,
            });
        }
        let mut stream = TokenStream::new(&mut self.sampler, options);
        let mut step = 0;
        while let Some(token) = stream.next_token()? {
            if let Some(on_token) = on_token.as_deref_mut() {
                on_token(&token, step);
            }
            step += 1;
        }
        Ok(stream.finish())
    }

    fn generate_unconstrained(
        &mut self,
        _prompt: &str,
        request: &UnconstrainedRequest,
        mut on_token: OnToken<'_>,
    ) -> Result<GenerationResult, SamplerError> {
        let mut text = String::new();
        let mut tokens_generated = 0;
        let mut stop_reason = StopReason::MaxTokens;
        for step in 0..request.max_tokens {
            let Some(token) = self.sampler.infer_unconstrained(request.top_k.unwrap_or(1))?
            else {
                stop_reason = StopReason::NoValid;
                break;
            };
            let hit_stop = request.stop_tokens.iter().any(|stop| {
                token == *stop || (stop.len() > 1 && token.ends_with(stop.as_str()))
            });
            if hit_stop {
                stop_reason = StopReason::StopToken;
                break;
            }
            text.push_str(&token);
            tokens_generated += 1;
            if let Some(on_token) = on_token.as_deref_mut() {
                on_token(&token, step);
            }
        }
        Ok(GenerationResult {
            text,
            is_complete: false,
            tokens_generated,
            stop_reason,
        })
    }
}
