/*!
# p7

This crate provides a type-aware constrained decoding engine: given a prefix
of text, it answers incrementally whether the prefix can still be extended to
a well-typed program, and which continuations from a supplied vocabulary keep
it extendable. Plugged into a sampling loop, it steers a language model so
that the final output is guaranteed to parse — and, when the grammar carries
typing rules, to type-check.

Unlike CFG-only approaches, the grammar language mixes context-free
productions with context-sensitive typing rules, so the engine can reject
`let x: Int = 1; x + true` at the exact character where every well-typed
derivation dies.

```rust
use std::sync::Arc;
use p7::{get_grammar, Grammar, Recognizer};

let grammar = Arc::new(Grammar::new(get_grammar("toy").unwrap()).unwrap());
let mut recognizer = Recognizer::new(grammar);
recognizer.feed_raw("beep:Fizz").unwrap();
assert!(recognizer.is_complete());
// Fizz + Buzz is ill-typed; the feed is rejected and nothing changes.
assert!(recognizer.feed_raw(" + boop:Buzz").is_err());
assert_eq!(recognizer.current_text(), "beep:Fizz");
recognizer.feed_raw(" + boop:Fizz").unwrap();
assert!(recognizer.is_complete());
```

Token filtering against a host vocabulary:

```rust
use std::sync::Arc;
use p7::{get_grammar, Grammar, Recognizer};

let grammar = Arc::new(Grammar::new(get_grammar("imp").unwrap()).unwrap());
let mut recognizer = Recognizer::new(grammar);
recognizer.feed_raw("x: Int = 1; if x < 3 { y: Int = x +").unwrap();
let accepted = recognizer.filter_completions(&["1", "true", "foo", " 1"]);
assert_eq!(accepted, vec!["1".to_string(), " 1".to_string()]);
```

# Overview

- [`Grammar`] compiles a spec once; it is immutable and shared across
  sessions behind an [`Arc`](std::sync::Arc).
- [`Recognizer`] is the per-session incremental parser: [`Recognizer::feed_raw`]
  accepts or atomically rejects text, [`Recognizer::get_completions`]
  enumerates legal continuations, [`Recognizer::filter_completion_indices`]
  projects them onto a vocabulary.
- [`TypedSampler`] masks a model's logits ([`TypedSampler::infer`]) or picks
  the next token directly ([`TypedSampler::infer_greedy`]).
- [`generate`] and [`until_complete`] drive whole decoding loops;
  [`TokenStream`](generation::TokenStream) is the pull-based streaming
  variant.
- [`ReasoningEnvironment`] interleaves unconstrained `<think>` spans with
  grammar-constrained output spans over an opaque [`ModelHandle`].
- [`list_grammars`], [`get_grammar`] and [`get_grammar_info`] expose the
  built-in grammars (`stlc`, `imp`, `fun`, `toy`, `json`).

# Grammar specs

A spec is UTF-8 text in two sections separated by the first blank line:
productions, then optional typing rules. Comments run from `#` to the end of
the line; a line starting with whitespace continues the previous one.

## Productions

```text
Expr ::= Atom | Expr " + " Atom
Atom ::= [a-z]+ ":" TyName
TyName ::= "Fizz" | "Buzz"
```

Each alternative is a whitespace-separated sequence of symbols:

- `"literal"` — a quoted terminal. JS-style escapes are supported
  (`\n`, `\t`, `\r`, `\\`, `\"`, `\uXXXX`, `\u{…}`).
- `[class]` — a regex character class, optionally quantified with `*`, `+`,
  `?` or `{m,n}`. Classes are compiled once per grammar load into anchored
  DFAs with prefix-validity tracking.
- `Bareword` — a nonterminal reference. Referencing an undefined
  nonterminal is fatal at compile time.

The start nonterminal is the first head, or the one named by a `start: Name`
directive line. Empty productions (`WS ::= ""`) are allowed. Direct left
recursion is supported; indirect left recursion is rejected.

## Typing rules

```text
Abs : bind $2 : @4 => @4 -> $6
App : $2 = ?a -> ?b, $4 = ?a => ?b
Var : env $1
```

A rule `Head : premise, … => TypeExpr` constrains the derivations of `Head`.
Within a type expression, `$N` is the synthesized type of child N (1-based),
`@N` is the *text* of child N parsed as a type annotation, `?a` is a
rule-local metavariable, `->` is right-associative and `|` builds unions
(canonicalized, and unifying with any of their branches). Premises:

- `$N = TypeExpr` unifies child N's type with the expression;
- `bind $N : TypeExpr` extends Γ with child N's text for the remaining
  children (lexical scope);
- `export $N : TypeExpr` additionally propagates the binding to the parent
  derivation on completion (sequential scope, e.g. statement lists);
- `env $N` requires child N's text to name a variable in Γ and gives the
  child that variable's type — while the identifier is being consumed, its
  partial text must be a prefix of some in-scope name, which is what makes
  completions type-aware;
- `scoped` stops child bindings from escaping `Head`.

Rules fire as soon as the children they mention are complete; a failed
unification or lookup silently drops that derivation. The feed is rejected
only when the whole frontier dies, as a
[`TypeError`](recognizer::FeedError::TypeError) when some derivation
advanced syntactically but died of typing.

# Performance

Filtering is O(|vocabulary| · simulation). Both the recognizer and the
sampler first project the frontier's acceptable first characters and discard
non-matching tokens without simulation; for interactive loops, pass
`pre_top_k` to [`TypedSampler::infer`] and friends to restrict filtering to
the highest-logit candidates.

# Debugging

Set `P7_CONSTRAINED_DEBUG=1` (or `P7_SAMPLER_DEBUG=1`) to trace feeds,
completions and valid-token sets to standard error. Library diagnostics go
through the [`log`] facade.
*/
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod environment;
pub mod generation;
pub mod grammar;
pub mod grammars;
pub mod model;
pub mod recognizer;
pub mod regex;
pub mod sampler;
pub mod types;
mod utils;
pub mod vocabulary;

pub use config::Config;
pub use environment::{
    build_system_prompt, Block, EnvStopReason, EnvironmentConfig, EnvironmentResult,
    GrammarBlock, Mode, ReasoningEnvironment, RunCallbacks, RunOptions, SimpleEnvironment,
    ThinkBlock,
};
pub use generation::{
    generate, until_complete, GenerateOptions, GenerationResult, StopReason, StreamEvent,
};
pub use grammar::{CompileError, Grammar};
pub use grammars::{get_grammar, get_grammar_info, list_grammars, GrammarInfo};
pub use model::{ConstrainedRequest, LogitModel, ModelHandle, UnconstrainedRequest};
pub use recognizer::{DebugCompletions, FeedError, Recognizer, SexprError};
pub use regex::{regex_matches, regex_prefix_valid};
pub use sampler::{LogitFn, ModelError, SamplerError, TypedSampler};
pub use types::{Type, TypeEnv};
pub use vocabulary::Vocabulary;
