//! Built-in grammars with typing rules.
//!
//! A fixed, enumerable set of specs identified by short names, each carrying
//! the metadata prompt construction needs: a human name, a short noun
//! phrase, syntax hints and worked examples.

/// Metadata and spec text for one built-in grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrammarInfo {
    /// The grammar spec text (empty for unknown grammars).
    pub spec: String,
    /// Human-readable name.
    pub name: String,
    /// A short noun phrase describing the output ("typed lambda calculus terms").
    pub short: String,
    /// A one-line description.
    pub description: String,
    /// Syntax hints for prompt construction.
    pub syntax_hints: Vec<String>,
    /// Worked `(label, code)` examples.
    pub examples: Vec<(String, String)>,
}

/// The error type for unknown built-in grammar names.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown grammar `{name}`. Available: {available}")]
pub struct UnknownGrammar {
    /// The requested name.
    pub name: String,
    /// Comma-separated list of known names.
    pub available: String,
}

const STLC_SPEC: &str = include_str!("../grammars/stlc.spec");
const IMP_SPEC: &str = include_str!("../grammars/imp.spec");
const FUN_SPEC: &str = include_str!("../grammars/fun.spec");
const TOY_SPEC: &str = include_str!("../grammars/toy.spec");
const JSON_SPEC: &str = include_str!("../grammars/json.spec");

const NAMES: [&str; 5] = ["stlc", "imp", "fun", "toy", "json"];

fn hints(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn examples(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(name, code)| (name.to_string(), code.to_string()))
        .collect()
}

fn builtin(name: &str) -> Option<GrammarInfo> {
    match name {
        "stlc" => Some(GrammarInfo {
            spec: STLC_SPEC.to_string(),
            name: "Simply Typed Lambda Calculus".to_string(),
            short: "typed lambda calculus terms".to_string(),
            description: "Simply typed lambda calculus with explicit type annotations"
                .to_string(),
            syntax_hints: hints(&[
                "λx:T.e - lambda abstraction",
                "(f x) - function application",
                "Types use -> and are right-associative: Int->Bool->Int",
                "Parenthesize function arguments and nested types when needed",
            ]),
            examples: examples(&[
                ("identity", "λx:Int.x"),
                ("const", "λx:Int.λy:Bool.x"),
                ("apply", "λf:(Int->Bool).λx:Int.(f x)"),
            ]),
        }),
        "imp" => Some(GrammarInfo {
            spec: IMP_SPEC.to_string(),
            name: "IMP".to_string(),
            short: "typed imperative programs".to_string(),
            description: "Typed imperative language with assignments, conditionals, and loops"
                .to_string(),
            syntax_hints: hints(&[
                "Assignment: x: Type = value;",
                "Arithmetic values: x + y, x - 1, a * b",
                "Conditionals: if cond { ... } else { ... }",
                "Loops: while cond { ... }",
                "Type unions are allowed: Int|Bool",
            ]),
            examples: examples(&[
                ("assignment", "x: Int = 5;"),
                ("sequence", "x: Int = 1; y: Int = x + 2;"),
                (
                    "if_else",
                    "x: Int = 1; if x < 5 { y: Int = x + 1; } else { y: Int = 0; }",
                ),
                ("while", "counter: Int = 0; while counter < 3 { counter + 1; }"),
            ]),
        }),
        "fun" => Some(GrammarInfo {
            spec: FUN_SPEC.to_string(),
            name: "Fun".to_string(),
            short: "typed functional expressions".to_string(),
            description: "ML-style functional language with let bindings and typed lambdas"
                .to_string(),
            syntax_hints: hints(&[
                "Lambda: (x: Type) => expr",
                "Let binding: let x: Type = value; body",
                "Function application: f(arg)",
                "Int ops: + - * /, Float ops: +. -. *. /.",
                "Literals include Int, Float, and Bool",
            ]),
            examples: examples(&[
                ("identity", "(x: Int) => x"),
                ("let_int", "let x: Int = 1; x + 2"),
                ("apply_lambda", "((x: Int) => x + 1)(41)"),
                ("float_math", "let f: Float = 1.5; f +. 2.0"),
            ]),
        }),
        "toy" => Some(GrammarInfo {
            spec: TOY_SPEC.to_string(),
            name: "Toy: Beep Boop".to_string(),
            short: "typed nonsense".to_string(),
            description: "Meaningless but funny typed expressions".to_string(),
            syntax_hints: hints(&[
                "Typed value: beep:Fizz",
                "Concatenation: beep:Fizz + boop:Fizz",
            ]),
            examples: examples(&[
                ("single", "beep:Fizz"),
                ("concat", "beep:Fizz + boop:Fizz"),
            ]),
        }),
        "json" => Some(GrammarInfo {
            spec: JSON_SPEC.to_string(),
            name: "JSON".to_string(),
            short: "untyped JSON values".to_string(),
            description: "JSON grammar with strings, numbers, arrays, and objects".to_string(),
            syntax_hints: hints(&[
                "Strings like \"hello\" (supports escapes)",
                "Arrays: [1, 2, 3]",
                "Objects: {\"k\": true, \"n\": 1}",
            ]),
            examples: examples(&[
                ("string", "\"hello\""),
                ("array", "[1, 2, 3]"),
                ("object", "{\"k\": true, \"n\": 1}"),
            ]),
        }),
        _ => None,
    }
}

/// Lists all built-in grammar names.
pub fn list_grammars() -> Vec<&'static str> {
    NAMES.to_vec()
}

/// The spec text of a built-in grammar.
///
/// # Errors
///
/// Returns [`UnknownGrammar`] when `name` is not a built-in.
pub fn get_grammar(name: &str) -> Result<&'static str, UnknownGrammar> {
    match name {
        "stlc" => Ok(STLC_SPEC),
        "imp" => Ok(IMP_SPEC),
        "fun" => Ok(FUN_SPEC),
        "toy" => Ok(TOY_SPEC),
        "json" => Ok(JSON_SPEC),
        _ => Err(UnknownGrammar {
            name: name.to_string(),
            available: NAMES.join(", "),
        }),
    }
}

/// Metadata for a grammar, with a generic fallback for unknown names so
/// prompt construction always has something to work with.
pub fn get_grammar_info(name: &str) -> GrammarInfo {
    builtin(name).unwrap_or_else(|| GrammarInfo {
        spec: String::new(),
        name: name.to_string(),
        short: format!("{name} expressions"),
        description: format!("Grammar: {name}"),
        syntax_hints: Vec::new(),
        examples: Vec::new(),
    })
}
