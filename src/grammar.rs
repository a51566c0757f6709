//! Grammar compilation: from spec text to an immutable rule table plus
//! typing-rule index.
//!
//! A grammar spec has two sections separated by the first blank line. The
//! production section holds `Head ::= Alt | Alt …` rules whose symbols are
//! quoted literals, `[…]` regex classes (with an optional `* + ? {m,n}`
//! quantifier suffix) or bareword nonterminal references, plus an optional
//! `start: Name` directive. The typing section holds `Head : premise, … =>
//! TypeExpr` rules that constrain the derivations of `Head` (see the crate
//! docs for the rule language).
//!
//! The compiled [`Grammar`] is immutable and meant to be shared behind an
//! [`Arc`](std::sync::Arc) across recognizer sessions.

use std::fmt::{self, Debug};
use std::str::CharIndices;
use std::sync::Arc;

use ahash::AHashMap;
use nom::branch::alt as nom_alt;
use nom::bytes::complete::{tag, take_while};
use nom::character::complete::{char as nom_char, digit1, satisfy, space0, space1};
use nom::combinator::{all_consuming, map, map_res, not, opt, peek, recognize};
use nom::multi::separated_list0;
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;
use string_interner::{DefaultStringInterner, DefaultSymbol, Symbol as _};

use crate::config::Config;
use crate::regex::{ClassPattern, RegexCompileError};

/// The wrapper struct that represents a nonterminal id in the grammar.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct NonterminalID(pub u32);

/// The wrapper struct that represents a terminal id in the grammar.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TerminalID(pub u32);

/// The wrapper struct that represents a regex-class id in the grammar.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RegexID(pub u32);

/// One symbol reference inside an alternative.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum SymbolRef {
    /// A literal terminal.
    Terminal(TerminalID),
    /// A regex token class.
    Class(RegexID),
    /// A nonterminal reference.
    Nonterminal(NonterminalID),
}

/// One alternative of a production: an ordered sequence of symbols. Empty
/// alternatives are allowed and derive the empty string.
#[derive(Debug, Clone)]
pub struct Alternative {
    pub(crate) symbols: Vec<SymbolRef>,
}

/// A type expression on the right-hand side of a typing rule.
#[derive(Debug, Clone)]
pub(crate) enum TypeExpr {
    /// A named base type.
    Base(Arc<str>),
    /// A rule-local metavariable `?a`.
    Var(Arc<str>),
    /// `$N`: the synthesized type of child N (1-based).
    ChildType(usize),
    /// `@N`: the text of child N parsed as a type annotation.
    ChildText(usize),
    /// A function type.
    Arrow(Box<TypeExpr>, Box<TypeExpr>),
    /// A union type.
    Union(Vec<TypeExpr>),
}

impl TypeExpr {
    pub(crate) fn child_refs(&self, out: &mut Vec<usize>) {
        match self {
            TypeExpr::Base(_) | TypeExpr::Var(_) => {}
            TypeExpr::ChildType(n) | TypeExpr::ChildText(n) => out.push(*n),
            TypeExpr::Arrow(from, to) => {
                from.child_refs(out);
                to.child_refs(out);
            }
            TypeExpr::Union(branches) => branches.iter().for_each(|b| b.child_refs(out)),
        }
    }
}

/// One premise of a typing rule.
#[derive(Debug, Clone)]
pub(crate) enum Premise {
    /// `$N = expr`: unify child N's type with the expression.
    Unify { child: usize, expr: TypeExpr },
    /// `bind $N : expr` / `export $N : expr`: extend Γ with the text of
    /// child N for the remaining children; exported bindings also flow to
    /// the parent derivation on completion.
    Bind {
        name_child: usize,
        expr: TypeExpr,
        export: bool,
    },
    /// `env $N`: child N's text must name a variable in Γ; its type becomes
    /// the child's type.
    Env { child: usize },
}

impl Premise {
    /// The highest child position this premise mentions; the premise fires
    /// when that child completes.
    pub(crate) fn max_child_ref(&self) -> usize {
        let mut refs = Vec::new();
        match self {
            Premise::Unify { child, expr } => {
                refs.push(*child);
                expr.child_refs(&mut refs);
            }
            Premise::Bind {
                name_child, expr, ..
            } => {
                refs.push(*name_child);
                expr.child_refs(&mut refs);
            }
            Premise::Env { child } => refs.push(*child),
        }
        refs.into_iter().max().unwrap_or(0)
    }
}

/// A typing rule for one nonterminal. The rule applies to an alternative iff
/// every child position it references exists in that alternative.
#[derive(Debug, Clone)]
pub(crate) struct TypingRule {
    pub(crate) premises: Vec<Premise>,
    pub(crate) result: Option<TypeExpr>,
    pub(crate) scoped: bool,
    pub(crate) max_child: usize,
    #[allow(dead_code)]
    pub(crate) line: usize,
}

/// The error type for grammar compilation.
#[derive(Debug, thiserror::Error, strum::IntoStaticStr)]
pub enum CompileError {
    /// Malformed spec text.
    #[strum(serialize = "GrammarParseError")]
    #[error("grammar parse error at line {line}: {reason}")]
    Parse {
        /// 1-based line of the offending logical line.
        line: usize,
        /// A short human-readable reason.
        reason: String,
    },
    /// A production or typing rule references an unknown nonterminal.
    #[strum(serialize = "UndefinedNonterminal")]
    #[error("undefined nonterminal `{name}` at line {line}")]
    UndefinedNonterminal {
        /// The unresolved name.
        name: String,
        /// 1-based line of the reference.
        line: usize,
    },
    /// A typing rule references a child position beyond every alternative.
    #[strum(serialize = "GrammarParseError")]
    #[error("typing rule at line {line} references child ${child}, beyond every alternative of `{head}`")]
    UnknownArity {
        /// The constrained nonterminal.
        head: String,
        /// The out-of-range child position.
        child: usize,
        /// 1-based line of the rule.
        line: usize,
    },
    /// A token class failed to compile.
    #[strum(serialize = "GrammarParseError")]
    #[error("invalid regex class at line {line}: {source}")]
    Regex {
        /// 1-based line of the class symbol.
        line: usize,
        /// The underlying compile failure.
        #[source]
        source: RegexCompileError,
    },
}

impl CompileError {
    /// The stable discriminator string of this error kind.
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

/// A compiled grammar: production table, typing-rule index, compiled token
/// classes and the start nonterminal.
#[derive(Clone)]
pub struct Grammar {
    interner: DefaultStringInterner,
    start: NonterminalID,
    rules: Vec<Vec<Alternative>>,
    typing: Vec<Vec<TypingRule>>,
    left_recursive: Vec<Vec<usize>>,
    terminals: Vec<Box<str>>,
    classes: Vec<ClassPattern>,
    max_example_length: usize,
}

impl Grammar {
    /// Compiles a grammar spec with the default [`Config`].
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] naming the offending line when the spec is
    /// malformed, references an undefined nonterminal, constrains an unknown
    /// child position or contains an invalid regex class.
    pub fn new(spec: &str) -> Result<Grammar, CompileError> {
        Self::with_config(spec, &Config::default())
    }

    /// Compiles a grammar spec with an explicit [`Config`].
    pub fn with_config(spec: &str, config: &Config) -> Result<Grammar, CompileError> {
        Compiler::new(spec, config)?.finish()
    }

    /// The name of the start nonterminal.
    pub fn start_nonterminal(&self) -> &str {
        self.nonterminal_str(self.start).unwrap_or("")
    }

    #[inline]
    pub(crate) fn start_id(&self) -> NonterminalID {
        self.start
    }

    /// The name of a nonterminal, if the id is in range.
    pub fn nonterminal_str(&self, id: NonterminalID) -> Option<&str> {
        self.interner
            .resolve(DefaultSymbol::try_from_usize(id.0 as usize)?)
    }

    /// The literal text of a terminal, if the id is in range.
    pub fn terminal_str(&self, id: TerminalID) -> Option<&str> {
        self.terminals.get(id.0 as usize).map(|s| s.as_ref())
    }

    /// The compiled class for a regex id.
    pub fn class(&self, id: RegexID) -> &ClassPattern {
        &self.classes[id.0 as usize]
    }

    /// The number of nonterminals.
    pub fn nonterminals_size(&self) -> usize {
        self.rules.len()
    }

    #[inline]
    pub(crate) fn alternatives(&self, id: NonterminalID) -> &[Alternative] {
        &self.rules[id.0 as usize]
    }

    #[inline]
    pub(crate) fn alternative(&self, id: NonterminalID, alt: usize) -> &Alternative {
        &self.rules[id.0 as usize][alt]
    }

    #[inline]
    pub(crate) fn typing_rules(&self, id: NonterminalID) -> &[TypingRule] {
        &self.typing[id.0 as usize]
    }

    #[inline]
    pub(crate) fn left_recursive_alts(&self, id: NonterminalID) -> &[usize] {
        &self.left_recursive[id.0 as usize]
    }

    #[inline]
    pub(crate) fn max_example_length(&self) -> usize {
        self.max_example_length
    }

    fn symbol_display(&self, symbol: &SymbolRef) -> String {
        match symbol {
            SymbolRef::Terminal(id) => format!("{:?}", self.terminal_str(*id).unwrap_or("")),
            SymbolRef::Class(id) => self.class(*id).pattern().to_string(),
            SymbolRef::Nonterminal(id) => self.nonterminal_str(*id).unwrap_or("?").to_string(),
        }
    }
}

impl Debug for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = String::new();
        for (nt, alternatives) in self.rules.iter().enumerate() {
            let head = self
                .nonterminal_str(NonterminalID(nt as u32))
                .unwrap_or("?");
            let rendered = alternatives
                .iter()
                .map(|alternative| {
                    alternative
                        .symbols
                        .iter()
                        .map(|s| self.symbol_display(s))
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect::<Vec<_>>()
                .join(" | ");
            lines.push_str(&format!("{head} ::= {rendered}\n"));
        }
        f.debug_struct("Grammar")
            .field("start", &self.start_nonterminal())
            .field("rules", &lines)
            .field("typing_rules", &self.typing.iter().flatten().count())
            .finish()
    }
}

/// A raw, unresolved symbol from the production lexer.
enum RawSymbol {
    Literal(String),
    Class(String),
    Ref(String),
}

struct LogicalLine {
    text: String,
    line: usize,
}

struct Compiler<'a> {
    config: &'a Config,
    interner: DefaultStringInterner,
    rules: Vec<Vec<Alternative>>,
    typing: Vec<Vec<TypingRule>>,
    terminals: Vec<Box<str>>,
    terminal_ids: AHashMap<String, u32>,
    class_patterns: Vec<(String, usize)>,
    class_ids: AHashMap<String, u32>,
    first_head: Option<DefaultSymbol>,
    start_directive: Option<(String, usize)>,
    productions: Vec<(DefaultSymbol, Vec<Vec<RawSymbol>>, usize)>,
    typing_lines: Vec<LogicalLine>,
}

impl<'a> Compiler<'a> {
    fn new(spec: &str, config: &'a Config) -> Result<Self, CompileError> {
        let lines: Vec<&str> = spec.lines().map(|l| l.trim_end_matches('\r')).collect();
        let boundary = lines
            .iter()
            .position(|l| l.trim().is_empty())
            .unwrap_or(lines.len());
        let production_lines = logical_lines(&lines[..boundary], 0);
        let typing_lines = logical_lines(lines.get(boundary + 1..).unwrap_or(&[]), boundary + 1);
        if production_lines.is_empty() {
            return Err(CompileError::Parse {
                line: 1,
                reason: "empty grammar spec".to_string(),
            });
        }

        let mut compiler = Compiler {
            config,
            interner: DefaultStringInterner::default(),
            rules: Vec::new(),
            typing: Vec::new(),
            terminals: Vec::new(),
            terminal_ids: AHashMap::default(),
            class_patterns: Vec::new(),
            class_ids: AHashMap::default(),
            first_head: None,
            start_directive: None,
            productions: Vec::new(),
            typing_lines,
        };
        compiler.parse_productions(production_lines)?;
        Ok(compiler)
    }

    fn parse_productions(&mut self, lines: Vec<LogicalLine>) -> Result<(), CompileError> {
        // First pass interns every head so references resolve regardless of
        // declaration order.
        let mut parsed = Vec::new();
        for ll in lines {
            if let Some(rest) = parse_start_directive(&ll.text) {
                let name = rest.map_err(|reason| CompileError::Parse {
                    line: ll.line,
                    reason,
                })?;
                self.start_directive = Some((name, ll.line));
                continue;
            }
            let (head, body) = split_production(&ll.text).map_err(|reason| {
                CompileError::Parse {
                    line: ll.line,
                    reason,
                }
            })?;
            let symbol = self.interner.get_or_intern(&head);
            if self.first_head.is_none() {
                self.first_head = Some(symbol);
            }
            parsed.push((symbol, body.to_string(), ll.line));
        }
        for (symbol, body, line) in parsed {
            let alternatives =
                lex_alternatives(&body).map_err(|reason| CompileError::Parse { line, reason })?;
            self.productions.push((symbol, alternatives, line));
        }
        Ok(())
    }

    fn intern_terminal(&mut self, text: String) -> TerminalID {
        if let Some(&id) = self.terminal_ids.get(&text) {
            return TerminalID(id);
        }
        let id = self.terminals.len() as u32;
        self.terminals.push(text.clone().into_boxed_str());
        self.terminal_ids.insert(text, id);
        TerminalID(id)
    }

    fn intern_class(&mut self, pattern: String, line: usize) -> RegexID {
        if let Some(&id) = self.class_ids.get(&pattern) {
            return RegexID(id);
        }
        let id = self.class_patterns.len() as u32;
        self.class_patterns.push((pattern.clone(), line));
        self.class_ids.insert(pattern, id);
        RegexID(id)
    }

    fn finish(mut self) -> Result<Grammar, CompileError> {
        let count = self.interner.len();
        self.rules = vec![Vec::new(); count];
        self.typing = vec![Vec::new(); count];

        let productions = std::mem::take(&mut self.productions);
        for (symbol, alternatives, line) in productions {
            let nt = symbol.to_usize();
            for raw_symbols in alternatives {
                let mut symbols = Vec::with_capacity(raw_symbols.len());
                for raw in raw_symbols {
                    symbols.push(match raw {
                        RawSymbol::Literal(text) => SymbolRef::Terminal(self.intern_terminal(text)),
                        RawSymbol::Class(pattern) => {
                            SymbolRef::Class(self.intern_class(pattern, line))
                        }
                        RawSymbol::Ref(name) => match self.interner.get(&name) {
                            Some(sym) => SymbolRef::Nonterminal(NonterminalID(sym.to_usize() as u32)),
                            None => {
                                return Err(CompileError::UndefinedNonterminal { name, line })
                            }
                        },
                    });
                }
                self.rules[nt].push(Alternative { symbols });
            }
        }

        let typing_lines = std::mem::take(&mut self.typing_lines);
        for ll in typing_lines {
            let (head, premises, result, scoped) =
                parse_typing_line(&ll.text).map_err(|reason| CompileError::Parse {
                    line: ll.line,
                    reason,
                })?;
            let symbol = match self.interner.get(&head) {
                Some(sym) => sym,
                None => {
                    return Err(CompileError::UndefinedNonterminal {
                        name: head,
                        line: ll.line,
                    })
                }
            };
            let nt = symbol.to_usize();
            let mut max_child = 0;
            for premise in &premises {
                max_child = max_child.max(premise.max_child_ref());
            }
            if let Some(result) = &result {
                let mut refs = Vec::new();
                result.child_refs(&mut refs);
                max_child = max_child.max(refs.into_iter().max().unwrap_or(0));
            }
            let max_arity = self.rules[nt]
                .iter()
                .map(|a| a.symbols.len())
                .max()
                .unwrap_or(0);
            if max_child > max_arity {
                return Err(CompileError::UnknownArity {
                    head,
                    child: max_child,
                    line: ll.line,
                });
            }
            self.typing[nt].push(TypingRule {
                premises,
                result,
                scoped,
                max_child,
                line: ll.line,
            });
        }

        let start = match self
            .config
            .start_nonterminal
            .clone()
            .map(|name| (name, 0))
            .or_else(|| self.start_directive.clone())
        {
            Some((name, line)) => match self.interner.get(&name) {
                Some(sym) => NonterminalID(sym.to_usize() as u32),
                None => return Err(CompileError::UndefinedNonterminal { name, line }),
            },
            None => {
                NonterminalID(self.first_head.expect("nonempty grammar").to_usize() as u32)
            }
        };

        let mut classes = Vec::with_capacity(self.class_patterns.len());
        for (pattern, line) in &self.class_patterns {
            classes.push(
                ClassPattern::compile(pattern, self.config.regex_config.max_memory_usage)
                    .map_err(|source| CompileError::Regex {
                        line: *line,
                        source,
                    })?,
            );
        }

        let nullable = compute_nullable(&self.rules, &self.terminals, &classes);
        let mut left_recursive = vec![Vec::new(); count];
        for (nt, alternatives) in self.rules.iter().enumerate() {
            for (i, alternative) in alternatives.iter().enumerate() {
                if alternative.symbols.first()
                    == Some(&SymbolRef::Nonterminal(NonterminalID(nt as u32)))
                {
                    // A left-recursive alternative whose tail derives the
                    // empty string would complete again at the same position
                    // forever; it cannot contribute a parse and is dropped.
                    let tail_nullable = alternative.symbols[1..]
                        .iter()
                        .all(|s| symbol_nullable(s, &nullable, &self.terminals, &classes));
                    if tail_nullable {
                        log::warn!(
                            "left-recursive alternative {i} of `{}` has a nullable tail and is ignored",
                            self.interner
                                .resolve(DefaultSymbol::try_from_usize(nt).unwrap())
                                .unwrap_or("?")
                        );
                        continue;
                    }
                    left_recursive[nt].push(i);
                }
            }
        }

        Ok(Grammar {
            interner: self.interner,
            start,
            rules: self.rules,
            typing: self.typing,
            left_recursive,
            terminals: self.terminals,
            classes,
            max_example_length: self.config.completion_config.max_example_length,
        })
    }
}

fn symbol_nullable(
    symbol: &SymbolRef,
    nullable: &[bool],
    terminals: &[Box<str>],
    classes: &[ClassPattern],
) -> bool {
    match symbol {
        SymbolRef::Terminal(id) => terminals[id.0 as usize].is_empty(),
        SymbolRef::Class(id) => classes[id.0 as usize].full_match(""),
        SymbolRef::Nonterminal(id) => nullable[id.0 as usize],
    }
}

/// Standard fixpoint nullability: a nonterminal is nullable when some
/// alternative consists solely of nullable symbols.
fn compute_nullable(
    rules: &[Vec<Alternative>],
    terminals: &[Box<str>],
    classes: &[ClassPattern],
) -> Vec<bool> {
    let mut nullable = vec![false; rules.len()];
    loop {
        let mut changed = false;
        for (nt, alternatives) in rules.iter().enumerate() {
            if nullable[nt] {
                continue;
            }
            let derives_empty = alternatives.iter().any(|alternative| {
                alternative
                    .symbols
                    .iter()
                    .all(|s| symbol_nullable(s, &nullable, terminals, classes))
            });
            if derives_empty {
                nullable[nt] = true;
                changed = true;
            }
        }
        if !changed {
            return nullable;
        }
    }
}

/// Truncates a raw line at the first `#` that is outside quotes and brackets.
fn strip_comment(line: &str) -> &str {
    let mut in_quote = false;
    let mut in_bracket = false;
    let mut escaped = false;
    for (i, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quote || in_bracket => escaped = true,
            '"' if !in_bracket => in_quote = !in_quote,
            '[' if !in_quote && !in_bracket => in_bracket = true,
            ']' if !in_quote => in_bracket = false,
            '#' if !in_quote && !in_bracket => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Joins continuation lines (leading whitespace) onto their head line,
/// dropping blank and comment-only lines. `offset` is the 0-based index of
/// the first raw line in the whole spec.
fn logical_lines(raw: &[&str], offset: usize) -> Vec<LogicalLine> {
    let mut out: Vec<LogicalLine> = Vec::new();
    for (i, raw_line) in raw.iter().enumerate() {
        let stripped = strip_comment(raw_line);
        if stripped.trim().is_empty() {
            continue;
        }
        let continuation = stripped.starts_with(' ') || stripped.starts_with('\t');
        match out.last_mut() {
            Some(last) if continuation => {
                last.text.push(' ');
                last.text.push_str(stripped.trim());
            }
            _ => out.push(LogicalLine {
                text: stripped.trim().to_string(),
                line: offset + i + 1,
            }),
        }
    }
    out
}

/// Recognizes a `start: Name` directive; returns the parsed name or a reason.
fn parse_start_directive(text: &str) -> Option<Result<String, String>> {
    let rest = text.strip_prefix("start")?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix(':')?;
    if rest.starts_with(':') {
        // `start ::= …` is an ordinary production.
        return None;
    }
    let name = rest.trim();
    if name.is_empty() || !is_bareword(name) {
        return Some(Err(format!("malformed start directive `{text}`")));
    }
    Some(Ok(name.to_string()))
}

fn is_bareword(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Splits a production line at `::=`, validating the head.
fn split_production(text: &str) -> Result<(String, &str), String> {
    let Some(idx) = text.find("::=") else {
        return Err("missing `::=`".to_string());
    };
    let head = text[..idx].trim();
    if !is_bareword(head) {
        return Err(format!("malformed rule head `{head}`"));
    }
    Ok((head.to_string(), &text[idx + 3..]))
}

/// Lexes the right-hand side of a production into alternatives of raw
/// symbols.
fn lex_alternatives(body: &str) -> Result<Vec<Vec<RawSymbol>>, String> {
    let mut alternatives = vec![Vec::new()];
    let mut rest = body;
    loop {
        rest = rest.trim_start();
        let Some(first) = rest.chars().next() else {
            break;
        };
        match first {
            '|' => {
                alternatives.push(Vec::new());
                rest = &rest[1..];
            }
            '"' => {
                let (text, remaining) = lex_quoted(rest)?;
                alternatives.last_mut().unwrap().push(RawSymbol::Literal(text));
                rest = remaining;
            }
            '[' => {
                let (pattern, remaining) = lex_bracket_class(rest)?;
                alternatives.last_mut().unwrap().push(RawSymbol::Class(pattern));
                rest = remaining;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let end = rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(rest.len());
                alternatives
                    .last_mut()
                    .unwrap()
                    .push(RawSymbol::Ref(rest[..end].to_string()));
                rest = &rest[end..];
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }
    Ok(alternatives)
}

/// Lexes a double-quoted literal, decoding JS-style escapes.
fn lex_quoted(input: &str) -> Result<(String, &str), String> {
    debug_assert!(input.starts_with('"'));
    let mut chars = input.char_indices();
    chars.next();
    let mut value = String::new();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '"' => return Ok((value, &input[i + 1..])),
            '\\' => value.push(decode_escape(&mut chars)?),
            other => value.push(other),
        }
    }
    Err("unterminated string literal".to_string())
}

/// Decodes one escape sequence after a backslash.
fn decode_escape(chars: &mut CharIndices) -> Result<char, String> {
    let (_, esc) = chars.next().ok_or("dangling escape at end of literal")?;
    Ok(match esc {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        'b' => '\u{0008}',
        'f' => '\u{000C}',
        '\\' | '"' | '\'' | '/' | '[' | ']' => esc,
        'u' => {
            let mut hex = String::new();
            let mut peeked = chars.clone();
            match peeked.next() {
                Some((_, '{')) => {
                    *chars = peeked;
                    for (_, ch) in chars.by_ref() {
                        if ch == '}' {
                            break;
                        }
                        hex.push(ch);
                    }
                }
                _ => {
                    for _ in 0..4 {
                        let (_, ch) = chars
                            .next()
                            .ok_or("truncated \\u escape")?;
                        hex.push(ch);
                    }
                }
            }
            let code =
                u32::from_str_radix(&hex, 16).map_err(|_| format!("bad \\u escape `{hex}`"))?;
            char::from_u32(code).ok_or(format!("\\u escape `{hex}` is not a scalar value"))?
        }
        other => return Err(format!("unknown escape `\\{other}`")),
    })
}

/// Lexes a `[…]` class symbol with its optional quantifier suffix, keeping
/// the raw regex text.
fn lex_bracket_class(input: &str) -> Result<(String, &str), String> {
    debug_assert!(input.starts_with('['));
    let mut escaped = false;
    let mut end = None;
    for (i, ch) in input.char_indices().skip(1) {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            ']' => {
                end = Some(i);
                break;
            }
            _ => {}
        }
    }
    let Some(end) = end else {
        return Err("unterminated character class".to_string());
    };
    let mut pattern = input[..=end].to_string();
    let mut rest = &input[end + 1..];
    match rest.chars().next() {
        Some(q @ ('*' | '+' | '?')) => {
            pattern.push(q);
            rest = &rest[1..];
        }
        Some('{') => {
            let close = rest.find('}').ok_or("malformed repetition count")?;
            let inner = &rest[1..close];
            let valid = !inner.is_empty()
                && inner
                    .chars()
                    .all(|c| c.is_ascii_digit() || c == ',')
                && inner.matches(',').count() <= 1
                && !inner.starts_with(',');
            if !valid {
                return Err("malformed repetition count".to_string());
            }
            pattern.push_str(&rest[..=close]);
            rest = &rest[close + 1..];
        }
        _ => {}
    }
    Ok((pattern, rest))
}

// --- typing-rule parsing (nom) ---

fn nom_bareword(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn child_ref(input: &str) -> IResult<&str, usize> {
    preceded(nom_char('$'), map_res(digit1, str::parse))(input)
}

fn texpr_atom(input: &str) -> IResult<&str, TypeExpr> {
    preceded(
        space0,
        nom_alt((
            map(child_ref, TypeExpr::ChildType),
            map(
                preceded(nom_char('@'), map_res(digit1, str::parse)),
                TypeExpr::ChildText,
            ),
            map(preceded(nom_char('?'), nom_bareword), |name| {
                TypeExpr::Var(Arc::from(name))
            }),
            map(nom_bareword, |name| TypeExpr::Base(Arc::from(name))),
            delimited(nom_char('('), texpr_arrow, preceded(space0, nom_char(')'))),
        )),
    )(input)
}

fn texpr_union(input: &str) -> IResult<&str, TypeExpr> {
    let (rest, first) = texpr_atom(input)?;
    let mut branches = vec![first];
    let mut rest = rest;
    loop {
        match preceded(space0, nom_char::<_, nom::error::Error<&str>>('|'))(rest) {
            Ok((after, _)) => {
                let (after, next) = texpr_atom(after)?;
                branches.push(next);
                rest = after;
            }
            Err(_) => break,
        }
    }
    Ok((
        rest,
        if branches.len() == 1 {
            branches.pop().unwrap()
        } else {
            TypeExpr::Union(branches)
        },
    ))
}

fn texpr_arrow(input: &str) -> IResult<&str, TypeExpr> {
    let (rest, head) = texpr_union(input)?;
    let (rest, _) = space0(rest)?;
    match tag::<_, _, nom::error::Error<&str>>("->")(rest) {
        Ok((rest, _)) => {
            let (rest, tail) = texpr_arrow(rest)?;
            Ok((rest, TypeExpr::Arrow(Box::new(head), Box::new(tail))))
        }
        Err(_) => Ok((rest, head)),
    }
}

enum RawPremise {
    Premise(Premise),
    Scoped,
}

fn premise(input: &str) -> IResult<&str, RawPremise> {
    preceded(
        space0,
        nom_alt((
            map(
                tuple((
                    tag("bind"),
                    space1,
                    child_ref,
                    space0,
                    nom_char(':'),
                    texpr_arrow,
                )),
                |(_, _, name_child, _, _, expr)| {
                    RawPremise::Premise(Premise::Bind {
                        name_child,
                        expr,
                        export: false,
                    })
                },
            ),
            map(
                tuple((
                    tag("export"),
                    space1,
                    child_ref,
                    space0,
                    nom_char(':'),
                    texpr_arrow,
                )),
                |(_, _, name_child, _, _, expr)| {
                    RawPremise::Premise(Premise::Bind {
                        name_child,
                        expr,
                        export: true,
                    })
                },
            ),
            map(tuple((tag("env"), space1, child_ref)), |(_, _, child)| {
                RawPremise::Premise(Premise::Env { child })
            }),
            map(terminated(tag("scoped"), peek(not(nom_bareword))), |_| {
                RawPremise::Scoped
            }),
            map(
                tuple((
                    child_ref,
                    space0,
                    nom_char('='),
                    peek(not(nom_char('>'))),
                    texpr_arrow,
                )),
                |(child, _, _, _, expr)| RawPremise::Premise(Premise::Unify { child, expr }),
            ),
        )),
    )(input)
}

type ParsedTypingLine = (String, Vec<Premise>, Option<TypeExpr>, bool);

/// Parses one `Head : premise, … => TypeExpr` line.
fn parse_typing_line(text: &str) -> Result<ParsedTypingLine, String> {
    let parsed: IResult<&str, (&str, Vec<RawPremise>, Option<TypeExpr>)> =
        all_consuming(map(
            tuple((
                preceded(space0, nom_bareword),
                preceded(space0, nom_char(':')),
                separated_list0(preceded(space0, nom_char(',')), premise),
                opt(preceded(preceded(space0, tag("=>")), texpr_arrow)),
                space0,
            )),
            |(head, _, premises, result, _)| (head, premises, result),
        ))(text);
    let (_, (head, raw_premises, result)) =
        parsed.map_err(|_| format!("malformed typing rule `{text}`"))?;
    let mut premises = Vec::new();
    let mut scoped = false;
    for raw in raw_premises {
        match raw {
            RawPremise::Premise(p) => {
                if premise_mentions_child_zero(&p) {
                    return Err("child positions are 1-based".to_string());
                }
                premises.push(p);
            }
            RawPremise::Scoped => scoped = true,
        }
    }
    if let Some(result) = &result {
        let mut refs = Vec::new();
        result.child_refs(&mut refs);
        if refs.contains(&0) {
            return Err("child positions are 1-based".to_string());
        }
    }
    Ok((head.to_string(), premises, result, scoped))
}

fn premise_mentions_child_zero(premise: &Premise) -> bool {
    let mut refs = Vec::new();
    match premise {
        Premise::Unify { child, expr } => {
            refs.push(*child);
            expr.child_refs(&mut refs);
        }
        Premise::Bind {
            name_child, expr, ..
        } => {
            refs.push(*name_child);
            expr.child_refs(&mut refs);
        }
        Premise::Env { child } => refs.push(*child),
    }
    refs.contains(&0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_head_is_the_default_start() {
        let grammar = Grammar::new("A ::= \"a\"\nB ::= \"b\"").unwrap();
        assert_eq!(grammar.start_nonterminal(), "A");
    }

    #[test]
    fn start_directive_overrides_first_head() {
        let grammar = Grammar::new("A ::= \"a\"\nstart: B\nB ::= \"b\"").unwrap();
        assert_eq!(grammar.start_nonterminal(), "B");
    }

    #[test]
    fn missing_definition_is_fatal() {
        let err = Grammar::new("A ::= Missing").unwrap_err();
        assert_eq!(err.kind(), "UndefinedNonterminal");
        assert!(err.to_string().contains("Missing"));
    }

    #[test]
    fn missing_assign_reports_line() {
        let err = Grammar::new("A ::= \"a\"\nB \"b\"").unwrap_err();
        match err {
            CompileError::Parse { line, reason } => {
                assert_eq!(line, 2);
                assert!(reason.contains("::="));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unterminated_literal_is_reported() {
        let err = Grammar::new("A ::= \"a").unwrap_err();
        assert_eq!(err.kind(), "GrammarParseError");
        assert!(err.to_string().contains("unterminated string"));
    }

    #[test]
    fn empty_spec_is_a_parse_error() {
        assert_eq!(Grammar::new("").unwrap_err().kind(), "GrammarParseError");
        assert_eq!(
            Grammar::new("\n  \n").unwrap_err().kind(),
            "GrammarParseError"
        );
    }

    #[test]
    fn typing_rule_arity_is_checked() {
        let spec = "A ::= \"a\"\n\nA : $2 = Int";
        let err = Grammar::new(spec).unwrap_err();
        assert_eq!(err.kind(), "GrammarParseError");
        assert!(err.to_string().contains("$2"));
    }

    #[test]
    fn typing_rule_head_must_exist() {
        let spec = "A ::= \"a\"\n\nB : $1 = Int";
        let err = Grammar::new(spec).unwrap_err();
        assert_eq!(err.kind(), "UndefinedNonterminal");
    }

    #[test]
    fn comments_and_continuations() {
        let spec = "# leading comment\nA ::= \"a\" # trailing\n    | \"b\"\n";
        let grammar = Grammar::new(spec).unwrap();
        assert_eq!(grammar.alternatives(grammar.start_id()).len(), 2);
    }

    #[test]
    fn duplicate_heads_merge_alternatives() {
        let grammar = Grammar::new("A ::= \"a\"\nA ::= \"b\"").unwrap();
        assert_eq!(grammar.alternatives(grammar.start_id()).len(), 2);
    }

    #[test]
    fn class_quantifiers_are_kept() {
        let grammar = Grammar::new("A ::= [0-9]{1,3} [a-z]*").unwrap();
        let alternative = &grammar.alternatives(grammar.start_id())[0];
        assert_eq!(alternative.symbols.len(), 2);
        match alternative.symbols[0] {
            SymbolRef::Class(id) => assert_eq!(grammar.class(id).pattern(), "[0-9]{1,3}"),
            _ => panic!("expected a class symbol"),
        }
    }
}
