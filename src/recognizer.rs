//! The incremental recognizer: a character-level parser that maintains the
//! frontier of live partial derivations together with their typing contexts.
//!
//! Every accepted character advances each frontier derivation by exactly one
//! character; derivations that cannot consume it are dropped, and derivations
//! whose typing rules fail are dropped too. A feed that would empty the
//! frontier is rejected without mutating any state, classified as a type
//! error when at least one derivation advanced syntactically but died of
//! typing.
//!
//! Derivations are frames in a per-session, append-only arena; parents are
//! non-owning back-references. Because the arena only grows within a feed,
//! atomic multi-character feeds and token-filter simulation are snapshots of
//! a few lengths plus the frontier list, restored by truncation.

use std::fmt::{self, Debug};
use std::sync::Arc;

use ahash::AHashSet;
use nonmax::NonMaxU32;
use regex_automata::util::primitives::StateID;
use tinyvec::TinyVec;

use crate::grammar::{
    Grammar, NonterminalID, Premise, RegexID, SymbolRef, TerminalID, TypeExpr,
};
use crate::regex::ClassState;
use crate::types::{parse_type, resolve_pat, unify, Subst, TyPat, Type, TypeEnv};

/// The error type for a rejected feed. The buffer and the frontier are left
/// exactly as they were before the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, strum::IntoStaticStr)]
pub enum FeedError {
    /// Every derivation that could consume the character syntactically died
    /// of a typing-rule violation. The caller may retry with another suffix.
    #[strum(serialize = "TypeError")]
    #[error("type error: {rejected:?} violates a typing rule after {position} bytes")]
    TypeError {
        /// The rejected character.
        rejected: char,
        /// Byte length of the buffer at the time of rejection.
        position: usize,
    },
    /// No derivation could consume the character at all.
    #[strum(serialize = "InvalidPrefix")]
    #[error("invalid prefix: no derivation accepts {rejected:?} after {position} bytes")]
    InvalidPrefix {
        /// The rejected character.
        rejected: char,
        /// Byte length of the buffer at the time of rejection.
        position: usize,
    },
}

impl FeedError {
    /// The stable discriminator string of this error kind.
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

/// The error type for [`Recognizer::to_sexpr`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, strum::IntoStaticStr)]
pub enum SexprError {
    /// The buffer is not a complete derivation yet; feeding more input may
    /// recover.
    #[strum(serialize = "Incomplete")]
    #[error("the buffer is not a complete derivation of the start nonterminal")]
    Incomplete,
}

impl SexprError {
    /// The stable discriminator string of this error kind.
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

/// Structured completions for UI layers: the patterns still open on the
/// frontier plus short example strings.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DebugCompletions {
    /// Regex patterns of the classes the frontier is currently inside.
    pub patterns: Vec<String>,
    /// Example strings that would advance at least one derivation.
    pub examples: Vec<String>,
}

/// Progress within the symbol under the dot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// The symbol has not consumed anything yet.
    Start,
    /// Inside a literal, `matched` bytes consumed.
    Literal { matched: u32 },
    /// Inside a regex class.
    Class { state: StateID },
}

/// One live parser frame. Frames are immutable once pushed; advancing a
/// derivation allocates a new frame whose `parent` chain is shared.
#[derive(Debug, Clone)]
struct Frame {
    nont: NonterminalID,
    alt: u32,
    dot: u32,
    start: u32,
    sym_start: u32,
    scan: Scan,
    children: TinyVec<[u32; 8]>,
    env: TypeEnv,
    subst: Subst,
    exports: Vec<(Arc<str>, Type)>,
    parent: Option<NonMaxU32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeSym {
    Nonterminal(NonterminalID),
    Terminal(TerminalID),
    Class(RegexID),
}

/// One node of a derivation tree.
#[derive(Debug, Clone)]
struct Node {
    sym: NodeSym,
    start: u32,
    end: u32,
    children: Vec<u32>,
    ty: Option<Type>,
    exports: Vec<(Arc<str>, Type)>,
}

#[derive(Debug, Clone, Copy)]
struct Completed {
    node: u32,
    at: u32,
}

/// A restore point: arena lengths plus the frontier. Arenas are append-only
/// within a feed, so truncating to these lengths undoes it.
#[derive(Debug, Clone)]
struct Snapshot {
    frames: usize,
    nodes: usize,
    completed: usize,
    buffer: usize,
    frontier: Vec<u32>,
}

/// The incremental recognizer for one generation session.
///
/// Created from a shared [`Grammar`]; mutated only via feeding and
/// [`reset`](Recognizer::reset). Cloning yields an independent session with
/// the same state.
#[derive(Clone)]
pub struct Recognizer {
    grammar: Arc<Grammar>,
    frames: Vec<Frame>,
    nodes: Vec<Node>,
    frontier: Vec<u32>,
    completed: Vec<Completed>,
    buffer: String,
}

impl Debug for Recognizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recognizer")
            .field("buffer", &self.buffer)
            .field("frontier", &self.frontier.len())
            .field("is_complete", &self.is_complete())
            .finish()
    }
}

impl Recognizer {
    /// Creates a recognizer positioned at the start of the grammar. The
    /// initial frontier enumerates every alternative of the start
    /// nonterminal that could begin the empty prefix.
    pub fn new(grammar: Arc<Grammar>) -> Recognizer {
        let mut recognizer = Recognizer {
            grammar,
            frames: Vec::new(),
            nodes: Vec::new(),
            frontier: Vec::new(),
            completed: Vec::new(),
            buffer: String::new(),
        };
        recognizer.init();
        recognizer
    }

    /// The grammar this recognizer runs.
    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    /// The name of the start nonterminal.
    pub fn start_nonterminal(&self) -> &str {
        self.grammar.start_nonterminal()
    }

    /// The accepted buffer.
    pub fn current_text(&self) -> &str {
        &self.buffer
    }

    /// True iff some derivation has consumed a whole alternative of the
    /// start nonterminal covering the entire buffer, with all typing rules
    /// satisfied and resolved.
    pub fn is_complete(&self) -> bool {
        let len = self.buffer.len() as u32;
        self.completed.iter().any(|c| c.at == len)
    }

    /// The number of live derivations (frontier plus current complete
    /// parses); a proxy for parse ambiguity.
    pub fn well_typed_tree_count(&self) -> usize {
        let len = self.buffer.len() as u32;
        self.frontier.len() + self.completed.iter().filter(|c| c.at == len).count()
    }

    /// Restores the initial frontier and the empty buffer.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.nodes.clear();
        self.frontier.clear();
        self.completed.clear();
        self.buffer.clear();
        self.init();
    }

    fn init(&mut self) {
        let grammar = self.grammar.clone();
        let start = grammar.start_id();
        let mut seeds = Vec::new();
        for (i, alternative) in grammar.alternatives(start).iter().enumerate() {
            if alternative.symbols.first() == Some(&SymbolRef::Nonterminal(start)) {
                continue;
            }
            let frame = Frame {
                nont: start,
                alt: i as u32,
                dot: 0,
                start: 0,
                sym_start: 0,
                scan: Scan::Start,
                children: TinyVec::default(),
                env: TypeEnv::new(),
                subst: Subst::new(),
                exports: Vec::new(),
                parent: None,
            };
            seeds.push(self.push_frame(frame));
        }
        let mut deaths = false;
        self.frontier = self.closure(seeds, 0, &mut deaths);
    }

    /// Feeds one character. On rejection nothing is mutated; the error says
    /// whether the frontier died of typing or of syntax.
    pub fn feed(&mut self, ch: char) -> Result<(), FeedError> {
        let snapshot = self.snapshot();
        let position = snapshot.buffer;
        self.buffer.push(ch);
        let pos = self.buffer.len() as u32;
        let mut deaths = false;
        let mut seeds = Vec::new();
        let frontier = std::mem::take(&mut self.frontier);
        for &fid in &frontier {
            self.advance_scan(fid, ch, pos, &mut seeds, &mut deaths);
        }
        let ready = self.closure(seeds, pos, &mut deaths);
        if ready.is_empty() {
            self.restore(&snapshot);
            return Err(if deaths {
                FeedError::TypeError {
                    rejected: ch,
                    position,
                }
            } else {
                FeedError::InvalidPrefix {
                    rejected: ch,
                    position,
                }
            });
        }
        self.frontier = ready;
        Ok(())
    }

    /// Atomic multi-character feed: on rejection the pre-call state is
    /// restored. Feeding the empty string is a no-op.
    pub fn feed_raw(&mut self, text: &str) -> Result<(), FeedError> {
        let snapshot = self.snapshot();
        for ch in text.chars() {
            if let Err(err) = self.feed(ch) {
                self.restore(&snapshot);
                return Err(err);
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            frames: self.frames.len(),
            nodes: self.nodes.len(),
            completed: self.completed.len(),
            buffer: self.buffer.len(),
            frontier: self.frontier.clone(),
        }
    }

    fn restore(&mut self, snapshot: &Snapshot) {
        self.frames.truncate(snapshot.frames);
        self.nodes.truncate(snapshot.nodes);
        self.completed.truncate(snapshot.completed);
        self.buffer.truncate(snapshot.buffer);
        self.frontier = snapshot.frontier.clone();
    }

    fn push_frame(&mut self, frame: Frame) -> u32 {
        let id = self.frames.len() as u32;
        self.frames.push(frame);
        id
    }

    fn push_node(&mut self, node: Node) -> u32 {
        let id = self.nodes.len() as u32;
        self.nodes.push(node);
        id
    }

    fn node_text(&self, node_id: u32) -> &str {
        let node = &self.nodes[node_id as usize];
        &self.buffer[node.start as usize..node.end as usize]
    }

    /// Advances one scan-ready frame over `ch`. New frames that need further
    /// prediction or completion are pushed onto `seeds`.
    fn advance_scan(&mut self, fid: u32, ch: char, pos: u32, seeds: &mut Vec<u32>, deaths: &mut bool) {
        let grammar = self.grammar.clone();
        let frame = self.frames[fid as usize].clone();
        let symbols = &grammar.alternative(frame.nont, frame.alt as usize).symbols;
        let mut ch_buf = [0u8; 4];
        let ch_bytes = ch.encode_utf8(&mut ch_buf).as_bytes();
        match symbols[frame.dot as usize] {
            SymbolRef::Terminal(t) => {
                let lit = grammar.terminal_str(t).unwrap_or("").as_bytes();
                let matched = match frame.scan {
                    Scan::Literal { matched } => matched as usize,
                    _ => 0,
                };
                let end = matched + ch_bytes.len();
                if lit.len() < end || &lit[matched..end] != ch_bytes {
                    return;
                }
                if end == lit.len() {
                    let node_id = self.push_node(Node {
                        sym: NodeSym::Terminal(t),
                        start: frame.sym_start,
                        end: pos,
                        children: Vec::new(),
                        ty: None,
                        exports: Vec::new(),
                    });
                    match self.advance_with_node(frame, node_id, pos) {
                        Some(next) => {
                            let id = self.push_frame(next);
                            seeds.push(id);
                        }
                        None => *deaths = true,
                    }
                } else {
                    let mut next = frame;
                    next.scan = Scan::Literal {
                        matched: end as u32,
                    };
                    let id = self.push_frame(next);
                    seeds.push(id);
                }
            }
            SymbolRef::Class(r) => {
                let class = grammar.class(r);
                let mut state = match frame.scan {
                    Scan::Class { state } => state,
                    _ => class.start_state(),
                };
                for &byte in ch_bytes {
                    state = class.next_state(state, byte);
                    if class.status(state) == ClassState::Reject {
                        return;
                    }
                }
                if self.env_constrained(&frame) {
                    let text = &self.buffer[frame.sym_start as usize..pos as usize];
                    if !frame.env.has_prefix(text) {
                        *deaths = true;
                        return;
                    }
                }
                let can_continue = class
                    .live_bytes(state)
                    .map_or(false, |bytes| bytes.count_ones(..) > 0);
                if can_continue {
                    let mut keep_scanning = frame.clone();
                    keep_scanning.scan = Scan::Class { state };
                    let id = self.push_frame(keep_scanning);
                    seeds.push(id);
                }
                if class.status(state) == ClassState::Accept {
                    let node_id = self.push_node(Node {
                        sym: NodeSym::Class(r),
                        start: frame.sym_start,
                        end: pos,
                        children: Vec::new(),
                        ty: None,
                        exports: Vec::new(),
                    });
                    match self.advance_with_node(frame, node_id, pos) {
                        Some(next) => {
                            let id = self.push_frame(next);
                            seeds.push(id);
                        }
                        None => *deaths = true,
                    }
                }
            }
            SymbolRef::Nonterminal(_) => {
                debug_assert!(false, "frontier frames are scan-ready");
            }
        }
    }

    /// Drives seeds to scan-ready positions: predicts nonterminals under the
    /// dot, pops completed alternatives up the parent stack (firing typing
    /// rules), and branches past zero-width symbols.
    fn closure(&mut self, mut work: Vec<u32>, pos: u32, deaths: &mut bool) -> Vec<u32> {
        let grammar = self.grammar.clone();
        let mut ready = Vec::new();
        while let Some(fid) = work.pop() {
            let frame = self.frames[fid as usize].clone();
            let symbols = &grammar.alternative(frame.nont, frame.alt as usize).symbols;
            if frame.dot as usize == symbols.len() {
                self.complete_frame(frame, pos, &mut work, deaths);
                continue;
            }
            match symbols[frame.dot as usize] {
                SymbolRef::Terminal(t) => {
                    let lit = grammar.terminal_str(t).unwrap_or("");
                    if lit.is_empty() && frame.scan == Scan::Start {
                        let node_id = self.push_node(Node {
                            sym: NodeSym::Terminal(t),
                            start: pos,
                            end: pos,
                            children: Vec::new(),
                            ty: None,
                            exports: Vec::new(),
                        });
                        match self.advance_with_node(frame, node_id, pos) {
                            Some(next) => {
                                let id = self.push_frame(next);
                                work.push(id);
                            }
                            None => *deaths = true,
                        }
                    } else {
                        ready.push(fid);
                    }
                }
                SymbolRef::Class(r) => {
                    let class = grammar.class(r);
                    let state = match frame.scan {
                        Scan::Class { state } => state,
                        _ => class.start_state(),
                    };
                    let can_scan = class
                        .live_bytes(state)
                        .map_or(false, |bytes| bytes.count_ones(..) > 0);
                    if can_scan {
                        ready.push(fid);
                    }
                    let zero_width = frame.scan == Scan::Start
                        && class.status(class.start_state()) == ClassState::Accept;
                    // An empty identifier can never name a variable, so the
                    // zero-width branch is skipped under an `env` premise.
                    if zero_width && !self.env_constrained(&frame) {
                        let node_id = self.push_node(Node {
                            sym: NodeSym::Class(r),
                            start: pos,
                            end: pos,
                            children: Vec::new(),
                            ty: None,
                            exports: Vec::new(),
                        });
                        match self.advance_with_node(frame, node_id, pos) {
                            Some(next) => {
                                let id = self.push_frame(next);
                                work.push(id);
                            }
                            None => *deaths = true,
                        }
                    }
                }
                SymbolRef::Nonterminal(n) => {
                    for (i, alternative) in grammar.alternatives(n).iter().enumerate() {
                        // Left-recursive alternatives enter bottom-up at
                        // completion, never top-down.
                        if alternative.symbols.first() == Some(&SymbolRef::Nonterminal(n)) {
                            continue;
                        }
                        if self.predicted_in_chain(fid, n, pos) {
                            continue;
                        }
                        let child = Frame {
                            nont: n,
                            alt: i as u32,
                            dot: 0,
                            start: pos,
                            sym_start: pos,
                            scan: Scan::Start,
                            children: TinyVec::default(),
                            env: frame.env.clone(),
                            subst: Subst::new(),
                            exports: Vec::new(),
                            parent: Some(NonMaxU32::new(fid).unwrap()),
                        };
                        let id = self.push_frame(child);
                        work.push(id);
                    }
                }
            }
        }
        ready
    }

    /// Guards prediction against cycles that consume no input: a nonterminal
    /// already predicted at this position in the same derivation chain is
    /// not predicted again. This also rejects indirect (and nullable-hidden)
    /// left recursion; direct left recursion is handled at completion.
    fn predicted_in_chain(&self, fid: u32, nont: NonterminalID, pos: u32) -> bool {
        let mut cursor = Some(fid);
        while let Some(id) = cursor {
            let frame = &self.frames[id as usize];
            if frame.start != pos {
                return false;
            }
            if frame.nont == nont {
                return true;
            }
            cursor = frame.parent.map(|p| p.get());
        }
        false
    }

    /// Pops a completed alternative: computes the node's type (rule result,
    /// or its sole typed child), propagates exported bindings, reseeds
    /// direct left recursion bottom-up, and advances the parent frame.
    fn complete_frame(&mut self, frame: Frame, pos: u32, work: &mut Vec<u32>, deaths: &mut bool) {
        let grammar = self.grammar.clone();
        let arity = grammar.alternative(frame.nont, frame.alt as usize).symbols.len();
        let mut ty = None;
        for rule in grammar.typing_rules(frame.nont) {
            if rule.max_child > arity {
                continue;
            }
            if let Some(result) = &rule.result {
                let resolved = self
                    .instantiate(result, &frame)
                    .and_then(|pat| resolve_pat(&pat, &frame.subst));
                match resolved {
                    Some(resolved) => {
                        ty = Some(resolved);
                        break;
                    }
                    None => {
                        // Unresolved metavariable or untypable child: the
                        // derivation is not well typed.
                        *deaths = true;
                        return;
                    }
                }
            }
        }
        if ty.is_none() {
            let mut typed_children = (1..=frame.children.len())
                .filter_map(|i| self.child_type(&frame, i));
            if let Some(first) = typed_children.next() {
                if typed_children.next().is_none() {
                    ty = Some(first);
                }
            }
        }
        let scoped = grammar
            .typing_rules(frame.nont)
            .iter()
            .any(|rule| rule.max_child <= arity && rule.scoped);
        let exports = if scoped {
            Vec::new()
        } else {
            frame.exports.clone()
        };
        let node_id = self.push_node(Node {
            sym: NodeSym::Nonterminal(frame.nont),
            start: frame.start,
            end: pos,
            children: frame.children.to_vec(),
            ty,
            exports,
        });

        for &lr_alt in grammar.left_recursive_alts(frame.nont) {
            let base_env = match frame.parent {
                Some(p) => self.frames[p.get() as usize].env.clone(),
                None => TypeEnv::new(),
            };
            // The completed node becomes child 1 of the reseeded
            // alternative; `advance_with_node` records it and fires the
            // premises it satisfies.
            let seed = Frame {
                nont: frame.nont,
                alt: lr_alt as u32,
                dot: 0,
                start: frame.start,
                sym_start: frame.start,
                scan: Scan::Start,
                children: TinyVec::default(),
                env: base_env,
                subst: Subst::new(),
                exports: Vec::new(),
                parent: frame.parent,
            };
            match self.advance_with_node(seed, node_id, pos) {
                Some(next) => {
                    let id = self.push_frame(next);
                    work.push(id);
                }
                None => *deaths = true,
            }
        }

        match frame.parent {
            Some(p) => {
                let parent = self.frames[p.get() as usize].clone();
                match self.advance_with_node(parent, node_id, pos) {
                    Some(next) => {
                        let id = self.push_frame(next);
                        work.push(id);
                    }
                    None => *deaths = true,
                }
            }
            None => {
                self.completed.push(Completed { node: node_id, at: pos });
            }
        }
    }

    /// Records `node_id` as the next child of `frame`: merges the child's
    /// exported bindings into Γ, advances the dot and fires every typing
    /// premise whose referenced children are now complete. Returns `None`
    /// when a premise fails.
    fn advance_with_node(&mut self, mut frame: Frame, node_id: u32, pos: u32) -> Option<Frame> {
        let child_exports = self.nodes[node_id as usize].exports.clone();
        for (name, ty) in &child_exports {
            frame.env = frame.env.extend(name.clone(), ty.clone());
        }
        frame.exports.extend(child_exports);
        frame.children.push(node_id);
        let completed_child = frame.dot as usize + 1;
        frame.dot += 1;
        frame.scan = Scan::Start;
        frame.sym_start = pos;
        if self.fire_premises(&mut frame, completed_child) {
            Some(frame)
        } else {
            None
        }
    }

    /// Fires every applicable premise whose highest referenced child is
    /// `completed_child`. Returns false when the derivation dies.
    fn fire_premises(&self, frame: &mut Frame, completed_child: usize) -> bool {
        let grammar = self.grammar.clone();
        let arity = grammar.alternative(frame.nont, frame.alt as usize).symbols.len();
        for rule in grammar.typing_rules(frame.nont) {
            if rule.max_child > arity {
                continue;
            }
            for premise in &rule.premises {
                if premise.max_child_ref() != completed_child {
                    continue;
                }
                match premise {
                    Premise::Env { child } => {
                        let node_id = frame.children[*child - 1];
                        if frame.env.lookup(self.node_text(node_id)).is_none() {
                            return false;
                        }
                    }
                    Premise::Unify { child, expr } => {
                        let Some(child_ty) = self.child_type(frame, *child) else {
                            return false;
                        };
                        let Some(pat) = self.instantiate(expr, frame) else {
                            return false;
                        };
                        if !unify(&pat, &child_ty, &mut frame.subst) {
                            return false;
                        }
                    }
                    Premise::Bind {
                        name_child,
                        expr,
                        export,
                    } => {
                        let Some(ty) = self
                            .instantiate(expr, frame)
                            .and_then(|pat| resolve_pat(&pat, &frame.subst))
                        else {
                            return false;
                        };
                        let name: Arc<str> = Arc::from(self.node_text(frame.children[*name_child - 1]));
                        frame.env = frame.env.extend(name.clone(), ty.clone());
                        if *export {
                            frame.exports.push((name, ty));
                        }
                    }
                }
            }
        }
        true
    }

    /// The synthesized type of child `child` (1-based), consulting `env`
    /// premises for identifier leaves.
    fn child_type(&self, frame: &Frame, child: usize) -> Option<Type> {
        let node_id = *frame.children.get(child - 1)?;
        if let Some(ty) = &self.nodes[node_id as usize].ty {
            return Some(ty.clone());
        }
        let arity = self
            .grammar
            .alternative(frame.nont, frame.alt as usize)
            .symbols
            .len();
        for rule in self.grammar.typing_rules(frame.nont) {
            if rule.max_child > arity {
                continue;
            }
            for premise in &rule.premises {
                if let Premise::Env { child: env_child } = premise {
                    if *env_child == child {
                        return frame.env.lookup(self.node_text(node_id)).cloned();
                    }
                }
            }
        }
        None
    }

    /// Instantiates a rule type expression against a derivation's children.
    fn instantiate(&self, expr: &TypeExpr, frame: &Frame) -> Option<TyPat> {
        Some(match expr {
            TypeExpr::Base(name) => TyPat::Ty(Type::Base(name.clone())),
            TypeExpr::Var(name) => TyPat::Var(name.clone()),
            TypeExpr::ChildType(n) => TyPat::Ty(self.child_type(frame, *n)?),
            TypeExpr::ChildText(n) => {
                let node_id = *frame.children.get(*n - 1)?;
                TyPat::Ty(parse_type(self.node_text(node_id)).ok()?)
            }
            TypeExpr::Arrow(from, to) => TyPat::Arrow(
                Box::new(self.instantiate(from, frame)?),
                Box::new(self.instantiate(to, frame)?),
            ),
            TypeExpr::Union(branches) => TyPat::Union(
                branches
                    .iter()
                    .map(|b| self.instantiate(b, frame))
                    .collect::<Option<Vec<_>>>()?,
            ),
        })
    }

    /// Whether the symbol currently under the dot is constrained by an
    /// `env` premise.
    fn env_constrained(&self, frame: &Frame) -> bool {
        let child = frame.dot as usize + 1;
        let arity = self
            .grammar
            .alternative(frame.nont, frame.alt as usize)
            .symbols
            .len();
        self.grammar.typing_rules(frame.nont).iter().any(|rule| {
            rule.max_child <= arity
                && rule
                    .premises
                    .iter()
                    .any(|p| matches!(p, Premise::Env { child: c } if *c == child))
        })
    }

    /// The minimal strings that advance at least one live derivation:
    /// literal remainders, in-scope identifier suffixes for `env`-constrained
    /// classes, and one single-character completion per acceptable next
    /// character of every other class.
    ///
    /// Every returned string feeds successfully on a clone of this
    /// recognizer, and every character some derivation would accept next
    /// appears as the first character of some completion.
    pub fn get_completions(&self) -> Vec<String> {
        let mut seen = AHashSet::new();
        let mut out = Vec::new();
        self.for_each_completion(|s| {
            if !s.is_empty() && seen.insert(s.clone()) {
                out.push(s);
            }
        });
        out
    }

    fn for_each_completion(&self, mut emit: impl FnMut(String)) {
        let grammar = &self.grammar;
        for &fid in &self.frontier {
            let frame = &self.frames[fid as usize];
            let symbols = &grammar.alternative(frame.nont, frame.alt as usize).symbols;
            match symbols[frame.dot as usize] {
                SymbolRef::Terminal(t) => {
                    let lit = grammar.terminal_str(t).unwrap_or("");
                    let matched = match frame.scan {
                        Scan::Literal { matched } => matched as usize,
                        _ => 0,
                    };
                    emit(lit[matched..].to_string());
                }
                SymbolRef::Class(r) => {
                    let class = grammar.class(r);
                    let state = match frame.scan {
                        Scan::Class { state } => state,
                        _ => class.start_state(),
                    };
                    if self.env_constrained(frame) {
                        let text = &self.buffer[frame.sym_start as usize..];
                        let mut names = AHashSet::new();
                        for (name, _) in frame.env.iter() {
                            if !names.insert(name) || !name.starts_with(text) {
                                continue;
                            }
                            let suffix = &name[text.len()..];
                            if !suffix.is_empty() && class.walk_from(state, suffix).is_some() {
                                emit(suffix.to_string());
                            }
                        }
                    } else if let Some(bytes) = class.live_bytes(state) {
                        for byte in bytes.ones() {
                            if byte < 0x80 {
                                emit((byte as u8 as char).to_string());
                            }
                        }
                    }
                }
                SymbolRef::Nonterminal(_) => {}
            }
        }
    }

    /// Structured completions: the open class patterns plus short examples.
    pub fn debug_completions(&self) -> DebugCompletions {
        let grammar = &self.grammar;
        let mut patterns = Vec::new();
        let mut pattern_seen = AHashSet::new();
        let mut examples = Vec::new();
        let mut example_seen = AHashSet::new();
        for &fid in &self.frontier {
            let frame = &self.frames[fid as usize];
            let symbols = &grammar.alternative(frame.nont, frame.alt as usize).symbols;
            match symbols[frame.dot as usize] {
                SymbolRef::Terminal(t) => {
                    let lit = grammar.terminal_str(t).unwrap_or("");
                    let matched = match frame.scan {
                        Scan::Literal { matched } => matched as usize,
                        _ => 0,
                    };
                    let rest = lit[matched..].to_string();
                    if !rest.is_empty() && example_seen.insert(rest.clone()) {
                        examples.push(rest);
                    }
                }
                SymbolRef::Class(r) => {
                    let class = grammar.class(r);
                    if pattern_seen.insert(class.pattern().to_string()) {
                        patterns.push(class.pattern().to_string());
                    }
                    let state = match frame.scan {
                        Scan::Class { state } => state,
                        _ => class.start_state(),
                    };
                    if self.env_constrained(frame) {
                        let text = &self.buffer[frame.sym_start as usize..];
                        for (name, _) in frame.env.iter() {
                            if name.starts_with(text) && name.len() > text.len() {
                                let suffix = name[text.len()..].to_string();
                                if example_seen.insert(suffix.clone()) {
                                    examples.push(suffix);
                                }
                            }
                        }
                    } else if let Some(example) =
                        class.example_from(state, grammar.max_example_length())
                    {
                        if !example.is_empty() && example_seen.insert(example.clone()) {
                            examples.push(example);
                        }
                    }
                }
                SymbolRef::Nonterminal(_) => {}
            }
        }
        DebugCompletions { patterns, examples }
    }

    /// The characters some live derivation would accept next, plus a flag
    /// for classes whose next byte may start a non-ASCII character (those
    /// candidates skip pre-filtering and go straight to simulation).
    pub(crate) fn first_char_projection(&self) -> (AHashSet<char>, bool) {
        let mut chars = AHashSet::new();
        let mut non_ascii_open = false;
        let grammar = &self.grammar;
        for &fid in &self.frontier {
            let frame = &self.frames[fid as usize];
            let symbols = &grammar.alternative(frame.nont, frame.alt as usize).symbols;
            match symbols[frame.dot as usize] {
                SymbolRef::Terminal(t) => {
                    let lit = grammar.terminal_str(t).unwrap_or("");
                    let matched = match frame.scan {
                        Scan::Literal { matched } => matched as usize,
                        _ => 0,
                    };
                    if let Some(ch) = lit[matched..].chars().next() {
                        chars.insert(ch);
                    }
                }
                SymbolRef::Class(r) => {
                    let class = grammar.class(r);
                    let state = match frame.scan {
                        Scan::Class { state } => state,
                        _ => class.start_state(),
                    };
                    if self.env_constrained(frame) {
                        let text = &self.buffer[frame.sym_start as usize..];
                        for (name, _) in frame.env.iter() {
                            if name.starts_with(text) {
                                if let Some(ch) = name[text.len()..].chars().next() {
                                    chars.insert(ch);
                                }
                            }
                        }
                    } else if let Some(bytes) = class.live_bytes(state) {
                        for byte in bytes.ones() {
                            if byte < 0x80 {
                                chars.insert(byte as u8 as char);
                            } else {
                                non_ascii_open = true;
                            }
                        }
                    }
                }
                SymbolRef::Nonterminal(_) => {}
            }
        }
        (chars, non_ascii_open)
    }

    /// Simulates feeding `text` and restores the pre-call state. Returns
    /// whether every character was accepted.
    pub(crate) fn simulate(&mut self, text: &str) -> bool {
        let snapshot = self.snapshot();
        let mut accepted = true;
        for ch in text.chars() {
            if self.feed(ch).is_err() {
                accepted = false;
                break;
            }
        }
        self.restore(&snapshot);
        accepted
    }

    /// The subset of `candidates` whose strings extend the buffer without
    /// rejection. Candidates whose first character no derivation accepts are
    /// rejected without simulation.
    pub fn filter_completions<S: AsRef<str>>(&mut self, candidates: &[S]) -> Vec<String> {
        self.filter_completion_indices(candidates)
            .into_iter()
            .map(|i| candidates[i].as_ref().to_string())
            .collect()
    }

    /// Like [`filter_completions`](Recognizer::filter_completions), but
    /// returns the positions of the accepted entries.
    pub fn filter_completion_indices<S: AsRef<str>>(&mut self, vocab: &[S]) -> Vec<usize> {
        let (chars, non_ascii_open) = self.first_char_projection();
        let mut out = Vec::new();
        for (i, candidate) in vocab.iter().enumerate() {
            let candidate = candidate.as_ref();
            let Some(first) = candidate.chars().next() else {
                continue;
            };
            if !chars.contains(&first) && !(non_ascii_open && !first.is_ascii()) {
                continue;
            }
            if self.simulate(candidate) {
                out.push(i);
            }
        }
        out
    }

    /// Serializes one complete derivation as an S-expression of
    /// `(Head child…)` with quoted leaves. Under ambiguity the first
    /// completed derivation is rendered.
    pub fn to_sexpr(&self) -> Result<String, SexprError> {
        let len = self.buffer.len() as u32;
        let completed = self
            .completed
            .iter()
            .find(|c| c.at == len)
            .ok_or(SexprError::Incomplete)?;
        let mut out = String::new();
        self.render_sexpr(completed.node, &mut out);
        Ok(out)
    }

    fn render_sexpr(&self, node_id: u32, out: &mut String) {
        let node = &self.nodes[node_id as usize];
        match node.sym {
            NodeSym::Nonterminal(nt) => {
                out.push('(');
                out.push_str(self.grammar.nonterminal_str(nt).unwrap_or("?"));
                for &child in &node.children {
                    out.push(' ');
                    self.render_sexpr(child, out);
                }
                out.push(')');
            }
            NodeSym::Terminal(_) | NodeSym::Class(_) => {
                out.push_str(&format!("{:?}", self.node_text(node_id)));
            }
        }
    }
}
