//! Driver loops for typed constrained generation.
//!
//! The streaming surface is a pull-based lazy sequence: the caller pulls one
//! token at a time with [`TokenStream::next_token`] and collects the summary
//! with [`TokenStream::finish`]. [`generate`] and [`until_complete`] drive
//! that loop to completion. No per-step resource outlives the stream; a
//! caller may abandon it at any point.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sampler::{SamplerError, TypedSampler};

/// Why a generation loop stopped, with a stable display string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The buffer became a complete derivation (`complete`).
    Complete,
    /// The token budget ran out (`max_tokens`).
    MaxTokens,
    /// No vocabulary token was acceptable (`no_valid`).
    NoValid,
    /// A sampled token was rejected at feed time (`type_error: …`).
    TypeError(String),
    /// Unconstrained generation hit a stop token (`stop_token`).
    StopToken,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Complete => write!(f, "complete"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::NoValid => write!(f, "no_valid"),
            StopReason::TypeError(msg) => write!(f, "type_error: {msg}"),
            StopReason::StopToken => write!(f, "stop_token"),
        }
    }
}

/// The summary of one generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    /// The accumulated text, including any initial prefix.
    pub text: String,
    /// Whether the text is a complete derivation.
    pub is_complete: bool,
    /// Tokens accepted into the buffer during this run.
    pub tokens_generated: usize,
    /// Why the run stopped.
    pub stop_reason: StopReason,
}

impl GenerationResult {
    /// Serializes the finished derivation, when there is one, from the
    /// sampler that produced this result.
    pub fn to_sexpr(&self, sampler: &TypedSampler) -> Option<String> {
        if !self.is_complete {
            return None;
        }
        sampler.recognizer().to_sexpr().ok()
    }
}

/// Options for one constrained generation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    /// The token budget.
    pub max_tokens: usize,
    /// Sample from the top-`greedy_k` valid tokens; 1 is pure greedy.
    pub greedy_k: usize,
    /// Restrict filtering to the top-K logits for throughput; `None`
    /// filters the whole vocabulary.
    pub pre_top_k: Option<usize>,
    /// Stop as soon as the buffer is a complete derivation.
    pub stop_on_complete: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 50,
            greedy_k: 1,
            pre_top_k: Some(100),
            stop_on_complete: false,
        }
    }
}

/// A lazy constrained-generation sequence over a borrowed sampler.
///
/// Pull tokens with [`next_token`](TokenStream::next_token) until it yields
/// `None`, then take the summary with [`finish`](TokenStream::finish).
/// Tokens are yielded in the order they are accepted into the buffer.
pub struct TokenStream<'a> {
    sampler: &'a mut TypedSampler,
    options: GenerateOptions,
    step: usize,
    stopped: Option<StopReason>,
}

impl<'a> TokenStream<'a> {
    /// Starts a stream; the sampler continues from its current buffer.
    pub fn new(sampler: &'a mut TypedSampler, options: GenerateOptions) -> TokenStream<'a> {
        TokenStream {
            sampler,
            options,
            step: 0,
            stopped: None,
        }
    }

    /// Pulls the next accepted token, or `None` when the stream is done.
    /// Model failures abort the stream and are surfaced unchanged.
    pub fn next_token(&mut self) -> Result<Option<String>, SamplerError> {
        if self.stopped.is_some() {
            return Ok(None);
        }
        if self.options.stop_on_complete && self.sampler.is_complete() {
            self.stopped = Some(StopReason::Complete);
            return Ok(None);
        }
        if self.step >= self.options.max_tokens {
            self.stopped = Some(StopReason::MaxTokens);
            return Ok(None);
        }
        let token = match self
            .sampler
            .infer_greedy(self.options.greedy_k, self.options.pre_top_k)?
        {
            Some(token) => token,
            None => {
                self.stopped = Some(StopReason::NoValid);
                return Ok(None);
            }
        };
        if let Err(err) = self.sampler.feed(&token) {
            // The filter is sound, so a rejection here means every
            // derivation that accepted the token died of typing.
            self.stopped = Some(StopReason::TypeError(err.to_string()));
            return Ok(None);
        }
        self.step += 1;
        Ok(Some(token))
    }

    /// The summary of the exhausted (or abandoned) stream.
    pub fn finish(self) -> GenerationResult {
        GenerationResult {
            text: self.sampler.current_text().to_string(),
            is_complete: self.sampler.is_complete(),
            tokens_generated: self.step,
            stop_reason: self.stopped.unwrap_or(StopReason::MaxTokens),
        }
    }
}

/// Per-token callback: the accepted token and its 0-based step.
pub type OnToken<'a> = Option<&'a mut dyn FnMut(&str, usize)>;

fn run(
    sampler: &mut TypedSampler,
    initial: &str,
    options: GenerateOptions,
    mut on_token: OnToken<'_>,
) -> Result<GenerationResult, SamplerError> {
    if !initial.is_empty() {
        if let Err(err) = sampler.feed(initial) {
            return Ok(GenerationResult {
                text: initial.to_string(),
                is_complete: false,
                tokens_generated: 0,
                stop_reason: StopReason::TypeError(err.to_string()),
            });
        }
    }
    let mut stream = TokenStream::new(sampler, options);
    while let Some(token) = stream.next_token()? {
        if let Some(on_token) = on_token.as_deref_mut() {
            on_token(&token, stream.step - 1);
        }
    }
    Ok(stream.finish())
}

/// Generates up to `max_tokens` tokens of well-typed output, continuing from
/// the sampler's current buffer after feeding `initial`.
pub fn generate(
    sampler: &mut TypedSampler,
    initial: &str,
    options: &GenerateOptions,
    on_token: OnToken<'_>,
) -> Result<GenerationResult, SamplerError> {
    let options = GenerateOptions {
        stop_on_complete: false,
        ..options.clone()
    };
    run(sampler, initial, options, on_token)
}

/// Like [`generate`], but stops as soon as the buffer is a complete
/// derivation.
pub fn until_complete(
    sampler: &mut TypedSampler,
    initial: &str,
    options: &GenerateOptions,
    on_token: OnToken<'_>,
) -> Result<GenerationResult, SamplerError> {
    let options = GenerateOptions {
        stop_on_complete: true,
        ..options.clone()
    };
    run(sampler, initial, options, on_token)
}

/// One record of the newline-delimited streaming protocol hosts expose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// One accepted token.
    Token {
        /// 0-based decoding step.
        step: usize,
        /// The token text.
        text: String,
        /// The buffer after accepting the token.
        full_text: String,
    },
    /// A host-defined status message.
    Status {
        /// The message.
        message: String,
    },
    /// The stream finished.
    Done {
        /// The stop reason's display string.
        reason: String,
        /// Whether the final buffer is a complete derivation.
        is_complete: bool,
    },
    /// The stream failed.
    Error {
        /// The error message.
        message: String,
    },
}

impl StreamEvent {
    /// Renders the event as one newline-terminated JSON record.
    pub fn to_json_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}
