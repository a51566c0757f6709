//! The reasoning environment: a block-level state machine that interleaves
//! unconstrained `<think>` spans with grammar-constrained output spans.
//!
//! Tags are derived from the grammar name (`<stlc>`, `</stlc>`, …), so the
//! environment is grammar-independent. Chain-of-thought content flows
//! through the model untouched; the final output block is produced by the
//! constrained path and is therefore well typed whenever it completes.

use std::fmt;

use crate::generation::StopReason;
use crate::grammars::get_grammar_info;
use crate::model::{ConstrainedRequest, ModelHandle, UnconstrainedRequest};

/// The current generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Mode {
    /// Unconstrained chain-of-thought reasoning.
    Think,
    /// Grammar-constrained output (the tag varies by grammar).
    Grammar,
}

/// A block of unconstrained reasoning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkBlock {
    /// The reasoning text, without tags.
    pub content: String,
}

impl fmt::Display for ThinkBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<think>{}</think>", self.content)
    }
}

/// A block of grammar-constrained output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrammarBlock {
    /// The constrained text, without tags.
    pub content: String,
    /// The grammar this block was constrained by.
    pub grammar_name: String,
    /// Whether the content is a complete derivation.
    pub is_complete: bool,
}

impl fmt::Display for GrammarBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{0}>{1}</{0}>",
            self.grammar_name, self.content
        )
    }
}

/// One block of an environment run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// An unconstrained reasoning span.
    Think(ThinkBlock),
    /// A grammar-constrained span.
    Grammar(GrammarBlock),
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Block::Think(b) => b.fmt(f),
            Block::Grammar(b) => b.fmt(f),
        }
    }
}

/// Why an environment run stopped, with a stable display string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvStopReason {
    /// A grammar block completed (`complete`).
    Complete,
    /// The block budget ran out (`max_blocks`).
    MaxBlocks,
    /// The constrained path failed (`error:<msg>`).
    Error(String),
}

impl fmt::Display for EnvStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvStopReason::Complete => write!(f, "complete"),
            EnvStopReason::MaxBlocks => write!(f, "max_blocks"),
            EnvStopReason::Error(msg) => write!(f, "error:{msg}"),
        }
    }
}

/// The result of one environment run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentResult {
    /// All generated blocks in order.
    pub blocks: Vec<Block>,
    /// Total tokens generated across all blocks.
    pub total_tokens: usize,
    /// Why the run stopped.
    pub stop_reason: EnvStopReason,
    /// The grammar the run was constrained by.
    pub grammar_name: String,
}

impl EnvironmentResult {
    /// The reasoning blocks, in order.
    pub fn think_blocks(&self) -> Vec<&ThinkBlock> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::Think(b) => Some(b),
                Block::Grammar(_) => None,
            })
            .collect()
    }

    /// The grammar blocks, in order.
    pub fn grammar_blocks(&self) -> Vec<&GrammarBlock> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::Grammar(b) => Some(b),
                Block::Think(_) => None,
            })
            .collect()
    }

    /// The last grammar block: the final output.
    pub fn final_output(&self) -> Option<&GrammarBlock> {
        self.grammar_blocks().pop()
    }

    /// All reasoning text, joined by newlines.
    pub fn all_thoughts(&self) -> String {
        self.think_blocks()
            .iter()
            .map(|b| b.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether the final output is a complete derivation.
    pub fn is_complete(&self) -> bool {
        self.final_output().is_some_and(|b| b.is_complete)
    }
}

impl fmt::Display for EnvironmentResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            block.fmt(f)?;
        }
        Ok(())
    }
}

/// Procedurally generates a system prompt for a grammar: the two modes, the
/// process, and the grammar's syntax hints and worked examples.
pub fn build_system_prompt(
    grammar_name: &str,
    task_description: Option<&str>,
    include_examples: bool,
) -> String {
    let info = get_grammar_info(grammar_name);
    let mut lines = vec![
        format!(
            "You are a reasoning assistant that produces well-typed {}.",
            info.short
        ),
        String::new(),
        "You can use two modes:".to_string(),
        "- <think>...</think>: Free-form reasoning. Think step by step.".to_string(),
        format!(
            "- <{0}>...</{0}>: Produce the final well-typed output. This is grammar-constrained.",
            grammar_name
        ),
        String::new(),
        "Process:".to_string(),
        "1. Use <think> to reason about the problem".to_string(),
        format!("2. When ready, use <{grammar_name}> to produce typed output"),
        "3. The output must be syntactically and type-correct".to_string(),
    ];
    if !info.syntax_hints.is_empty() {
        lines.push(String::new());
        lines.push("Syntax:".to_string());
        for hint in &info.syntax_hints {
            lines.push(format!("  - {hint}"));
        }
    }
    if include_examples && !info.examples.is_empty() {
        lines.push(String::new());
        lines.push("Examples:".to_string());
        for (name, code) in &info.examples {
            lines.push(format!("  {name}: {code}"));
        }
    }
    if let Some(task) = task_description {
        lines.push(String::new());
        lines.push(format!("Task: {task}"));
    }
    lines.join("\n")
}

/// The tunable knobs of a [`ReasoningEnvironment`].
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Max tokens per think block.
    pub think_budget: usize,
    /// Max tokens per grammar block.
    pub formal_budget: usize,
    /// Custom system prompt; auto-generated when `None`.
    pub system_prompt: Option<String>,
    /// Stop a grammar block as soon as it completes.
    pub stop_on_complete: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            think_budget: 200,
            formal_budget: 100,
            system_prompt: None,
            stop_on_complete: false,
        }
    }
}

/// Options for one environment run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of blocks to generate.
    pub max_blocks: usize,
    /// Whether to start in think mode.
    pub start_thinking: bool,
    /// Per-run override of the config's `stop_on_complete`.
    pub stop_on_complete: Option<bool>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_blocks: 10,
            start_thinking: true,
            stop_on_complete: None,
        }
    }
}

/// Reborrows a `&mut dyn FnMut` out of an `Option` without tying the
/// result's lifetime to the whole enclosing borrow, so it can be called
/// fresh on every loop iteration.
fn reborrow_callback<'a, 'b>(
    cb: &'a mut Option<&'b mut dyn FnMut(&str, usize)>,
) -> Option<&'a mut dyn FnMut(&str, usize)> {
    match cb {
        Some(f) => Some(&mut **f),
        None => None,
    }
}

/// Per-token and mode-switch observers for one run.
#[derive(Default)]
pub struct RunCallbacks<'a> {
    /// Called for each token of a think block.
    pub on_think_token: Option<&'a mut dyn FnMut(&str, usize)>,
    /// Called for each token of a grammar block.
    pub on_formal_token: Option<&'a mut dyn FnMut(&str, usize)>,
    /// Called when entering a block, with the mode and its opening tag.
    pub on_mode_switch: Option<&'a mut dyn FnMut(Mode, &str)>,
}

/// The block-structured state machine: think spans alternate with grammar
/// spans until a grammar block completes or the block budget runs out.
pub struct ReasoningEnvironment<M: ModelHandle> {
    model: M,
    grammar_name: String,
    config: EnvironmentConfig,
    system_prompt: String,
    think_open: String,
    think_close: String,
    grammar_open: String,
    grammar_close: String,
    think_stop: Vec<String>,
}

impl<M: ModelHandle> ReasoningEnvironment<M> {
    /// Creates an environment for `grammar_name` over a model handle.
    pub fn new(model: M, grammar_name: &str, config: EnvironmentConfig) -> Self {
        let system_prompt = if model.allow_system_prompt() {
            config
                .system_prompt
                .clone()
                .unwrap_or_else(|| build_system_prompt(grammar_name, None, true))
        } else {
            config.system_prompt.clone().unwrap_or_default()
        };
        let think_open = model.think_open();
        let think_close = model.think_close();
        let think_stop = model.stop_tokens_unconstrained(grammar_name);
        ReasoningEnvironment {
            model,
            grammar_name: grammar_name.to_string(),
            config,
            system_prompt,
            think_open,
            think_close,
            grammar_open: format!("<{grammar_name}>"),
            grammar_close: format!("</{grammar_name}>"),
            think_stop,
        }
    }

    /// The wrapped model handle.
    pub fn model(&mut self) -> &mut M {
        &mut self.model
    }

    /// Runs the state machine: starting in the caller-chosen mode, think
    /// blocks run unconstrained until a transition tag, grammar blocks run
    /// constrained; a complete grammar block ends the run. Every exit path
    /// records a stop reason (`complete`, `max_blocks` or `error:<msg>`).
    pub fn generate(
        &mut self,
        prompt: &str,
        initial: &str,
        options: &RunOptions,
        mut callbacks: RunCallbacks<'_>,
    ) -> EnvironmentResult {
        let mut blocks: Vec<Block> = Vec::new();
        let mut total_tokens = 0;
        let mut stop_reason = None;

        let mut accumulated = if self.system_prompt.is_empty() {
            prompt.to_string()
        } else {
            format!("{}\n\n{}", self.system_prompt, prompt)
        };
        let mut mode = if options.start_thinking {
            Mode::Think
        } else {
            Mode::Grammar
        };
        accumulated.push('\n');
        accumulated.push_str(match mode {
            Mode::Think => &self.think_open,
            Mode::Grammar => &self.grammar_open,
        });

        for _ in 0..options.max_blocks {
            if let Some(on_mode_switch) = callbacks.on_mode_switch.as_deref_mut() {
                let tag = match mode {
                    Mode::Think => self.think_open.clone(),
                    Mode::Grammar => self.grammar_open.clone(),
                };
                on_mode_switch(mode, &tag);
            }
            match mode {
                Mode::Think => {
                    let request = UnconstrainedRequest {
                        max_tokens: self.config.think_budget,
                        top_k: None,
                        stop_tokens: self.think_stop.clone(),
                    };
                    let result = match self.model.generate_unconstrained(
                        &accumulated,
                        &request,
                        reborrow_callback(&mut callbacks.on_think_token),
                    ) {
                        Ok(result) => result,
                        Err(err) => {
                            stop_reason = Some(EnvStopReason::Error(err.to_string()));
                            break;
                        }
                    };
                    let (content, stop_tag) = self.split_at_transition(&result.text);
                    blocks.push(Block::Think(ThinkBlock {
                        content: content.to_string(),
                    }));
                    total_tokens += result.tokens_generated;
                    accumulated.push_str(content);
                    // A clean handoff appends the tag the model produced;
                    // anything else synthesizes a close-then-open pair.
                    if stop_tag.as_deref() == Some(self.grammar_open.as_str()) {
                        accumulated.push_str(&self.grammar_open);
                    } else {
                        accumulated.push_str(&self.think_close);
                        accumulated.push('\n');
                        accumulated.push_str(&self.grammar_open);
                    }
                    mode = Mode::Grammar;
                }
                Mode::Grammar => {
                    // The caller's initial prefix applies to the first
                    // grammar block only.
                    let first_grammar_block = blocks
                        .iter()
                        .all(|b| matches!(b, Block::Think(_)));
                    let request = ConstrainedRequest {
                        initial: if first_grammar_block {
                            initial.to_string()
                        } else {
                            String::new()
                        },
                        max_tokens: self.config.formal_budget,
                        until_complete: options
                            .stop_on_complete
                            .unwrap_or(self.config.stop_on_complete),
                    };
                    let result = match self.model.generate_constrained(
                        &accumulated,
                        &request,
                        reborrow_callback(&mut callbacks.on_formal_token),
                    ) {
                        Ok(result) => result,
                        Err(err) => {
                            stop_reason = Some(EnvStopReason::Error(err.to_string()));
                            break;
                        }
                    };
                    let is_complete = result.is_complete;
                    blocks.push(Block::Grammar(GrammarBlock {
                        content: result.text.clone(),
                        grammar_name: self.grammar_name.clone(),
                        is_complete,
                    }));
                    total_tokens += result.tokens_generated;
                    accumulated.push_str(&result.text);
                    accumulated.push_str(&self.grammar_close);
                    if is_complete {
                        stop_reason = Some(EnvStopReason::Complete);
                        break;
                    }
                    mode = Mode::Think;
                    accumulated.push('\n');
                    accumulated.push_str(&self.think_open);
                }
            }
        }

        EnvironmentResult {
            blocks,
            total_tokens,
            stop_reason: stop_reason.unwrap_or(EnvStopReason::MaxBlocks),
            grammar_name: self.grammar_name.clone(),
        }
    }

    /// Splits think output at the first transition tag, returning the
    /// content before it and the tag that stopped it, if any.
    fn split_at_transition<'t>(&self, text: &'t str) -> (&'t str, Option<String>) {
        let tags = [&self.think_close, &self.grammar_open, &self.grammar_close];
        let mut cut: Option<(usize, &String)> = None;
        for tag in tags {
            if let Some(idx) = text.find(tag.as_str()) {
                if cut.map_or(true, |(at, _)| idx < at) {
                    cut = Some((idx, tag));
                }
            }
        }
        match cut {
            Some((idx, tag)) => (&text[..idx], Some(tag.clone())),
            None => (text, None),
        }
    }
}

/// A minimal environment: one grammar-constrained block, no reasoning.
pub struct SimpleEnvironment<M: ModelHandle> {
    model: M,
    grammar_name: String,
}

impl<M: ModelHandle> SimpleEnvironment<M> {
    /// Creates a single-block environment for `grammar_name`.
    pub fn new(model: M, grammar_name: &str) -> Self {
        SimpleEnvironment {
            model,
            grammar_name: grammar_name.to_string(),
        }
    }

    /// Generates one constrained block, stopping when it completes.
    pub fn generate(&mut self, prompt: &str, initial: &str, max_tokens: usize) -> EnvironmentResult {
        let request = ConstrainedRequest {
            initial: initial.to_string(),
            max_tokens,
            until_complete: true,
        };
        match self.model.generate_constrained(prompt, &request, None) {
            Ok(result) => {
                let is_complete = result.is_complete;
                EnvironmentResult {
                    blocks: vec![Block::Grammar(GrammarBlock {
                        content: result.text,
                        grammar_name: self.grammar_name.clone(),
                        is_complete,
                    })],
                    total_tokens: result.tokens_generated,
                    stop_reason: if is_complete {
                        EnvStopReason::Complete
                    } else if result.stop_reason == StopReason::MaxTokens {
                        EnvStopReason::MaxBlocks
                    } else {
                        EnvStopReason::Error(result.stop_reason.to_string())
                    },
                    grammar_name: self.grammar_name.clone(),
                }
            }
            Err(err) => EnvironmentResult {
                blocks: Vec::new(),
                total_tokens: 0,
                stop_reason: EnvStopReason::Error(err.to_string()),
                grammar_name: self.grammar_name.clone(),
            },
        }
    }
}
