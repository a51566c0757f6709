use std::sync::Arc;

use p7::{
    generate, get_grammar, list_grammars, until_complete, EnvStopReason, EnvironmentConfig,
    GenerateOptions, Grammar, LogitModel, ReasoningEnvironment, Recognizer, RunCallbacks,
    RunOptions, StopReason, StreamEvent, TypedSampler, Vocabulary,
};

fn compile(name: &str) -> Arc<Grammar> {
    Arc::new(Grammar::new(get_grammar(name).unwrap()).unwrap())
}

fn recognizer(name: &str) -> Recognizer {
    Recognizer::new(compile(name))
}

#[test]
fn builtin_grammars_compile() {
    for name in list_grammars() {
        let grammar = Grammar::new(get_grammar(name).unwrap())
            .unwrap_or_else(|e| panic!("grammar `{name}` failed to compile: {e}"));
        assert!(!grammar.start_nonterminal().is_empty());
    }
}

#[test]
fn stlc_identity_is_complete() {
    let mut r = recognizer("stlc");
    r.feed_raw("λx:Int.x").unwrap();
    assert!(r.is_complete());
    let sexpr = r.to_sexpr().unwrap();
    assert!(sexpr.starts_with("(Term"));
    assert_eq!(sexpr.matches("(Abs").count(), 1);
}

#[test]
fn stlc_partial_term_offers_bound_variable_and_lambda() {
    let mut r = recognizer("stlc");
    r.feed_raw("λx:Int.").unwrap();
    assert!(!r.is_complete());
    let completions = r.get_completions();
    assert!(completions.contains(&"x".to_string()), "{completions:?}");
    assert!(completions.contains(&"λ".to_string()), "{completions:?}");
}

#[test]
fn stlc_application_types_check() {
    let mut r = recognizer("stlc");
    r.feed_raw("λf:(Int->Bool).λx:Int.(f x)").unwrap();
    assert!(r.is_complete());

    let mut r = recognizer("stlc");
    // f expects an Int argument; x is Bool here, so the term cannot close.
    assert!(r.feed_raw("λf:(Int->Bool).λx:Bool.(f x)").is_err());
}

#[test]
fn fun_plus_rejects_bool_with_type_error() {
    let mut r = recognizer("fun");
    r.feed_raw("let x: Int = 1; x +").unwrap();
    r.feed_raw(" ").unwrap();
    r.feed_raw("1").unwrap();

    let mut r = recognizer("fun");
    r.feed_raw("let x: Int = 1; x +").unwrap();
    r.feed_raw(" ").unwrap();
    let err = r.feed_raw("true").unwrap_err();
    assert_eq!(err.kind(), "TypeError");
    // The rejected suffix is rolled back entirely.
    assert_eq!(r.current_text(), "let x: Int = 1; x + ");
}

#[test]
fn fun_float_operator_requires_floats() {
    let mut r = recognizer("fun");
    r.feed_raw("let f: Float = 1.5; f +. 2.0").unwrap();
    assert!(r.is_complete());

    let mut r = recognizer("fun");
    assert!(r.feed_raw("let f: Float = 1.0; f + 2").is_err());
}

#[test]
fn fun_lambda_application() {
    let mut r = recognizer("fun");
    r.feed_raw("((x: Int) => x + 1)(41)").unwrap();
    assert!(r.is_complete());
}

#[test]
fn imp_token_filter_is_type_aware() {
    let mut r = recognizer("imp");
    r.feed_raw("x: Int = 1; if x < 3 { y: Int = x +").unwrap();
    let vocab = ["1", "true", "foo", " 1"];
    let accepted = r.filter_completions(&vocab);
    assert_eq!(accepted, vec!["1".to_string(), " 1".to_string()]);
    let indices = r.filter_completion_indices(&vocab);
    assert_eq!(indices, vec![0, 3]);
}

#[test]
fn imp_union_annotation_accepts_both_branches() {
    let mut r = recognizer("imp");
    r.feed_raw("flag: Int|Bool = true; if flag == true { z: Int = 1; } else { z: Int = 0; }")
        .unwrap();
    assert!(r.is_complete());
}

#[test]
fn imp_example_programs_parse() {
    for program in [
        "x: Int = 5;",
        "x: Int = 1; y: Int = x + 2;",
        "x: Int = 1; if x < 5 { y: Int = x + 1; } else { y: Int = 0; }",
        "counter: Int = 0; while counter < 3 { counter + 1; }",
    ] {
        let mut r = recognizer("imp");
        r.feed_raw(program)
            .unwrap_or_else(|e| panic!("`{program}` rejected: {e}"));
        assert!(r.is_complete(), "`{program}` incomplete");
    }
}

#[test]
fn json_array_prefix_offers_whitespace_and_digits() {
    let mut r = recognizer("json");
    r.feed_raw("[1, 2,").unwrap();
    let completions = r.get_completions();
    assert!(completions.contains(&" ".to_string()), "{completions:?}");
    assert!(completions.contains(&"3".to_string()), "{completions:?}");
    let debug = r.debug_completions();
    assert!(debug.patterns.iter().any(|p| p.contains("0-9")));
    r.feed_raw("3]").unwrap();
    assert!(r.is_complete());
}

#[test]
fn json_behaves_as_a_pure_cfg() {
    for value in [
        "\"hello\"",
        "[1, 2, 3]",
        "{\"k\": true, \"n\": 1}",
        "{\"nested\": [\"a\\n\", -2.5, null]}",
    ] {
        let mut r = recognizer("json");
        r.feed_raw(value)
            .unwrap_or_else(|e| panic!("`{value}` rejected: {e}"));
        assert!(r.is_complete(), "`{value}` incomplete");
    }
}

#[test]
fn toy_concatenation_extends_while_complete() {
    let mut r = recognizer("toy");
    r.feed_raw("beep:Fizz + boop:Fizz").unwrap();
    assert!(r.is_complete());
    r.feed_raw(" + boop:Fizz").unwrap();
    assert!(r.is_complete());

    let err = r.feed_raw(" + zap:Buzz").unwrap_err();
    assert_eq!(err.kind(), "TypeError");
}

#[test]
fn feed_raw_is_atomic() {
    let mut r = recognizer("toy");
    r.feed_raw("beep:F").unwrap();
    let before = r.current_text().to_string();
    assert!(r.feed_raw("izz + x:Buzz").is_err());
    assert_eq!(r.current_text(), before);
    // The same recognizer still accepts a well-typed suffix.
    r.feed_raw("izz + x:Fizz").unwrap();
    assert!(r.is_complete());
}

#[test]
fn feeding_the_empty_string_never_fails() {
    let mut r = recognizer("stlc");
    r.feed_raw("").unwrap();
    r.feed_raw("λx:Int.").unwrap();
    r.feed_raw("").unwrap();
    assert_eq!(r.current_text(), "λx:Int.");
}

#[test]
fn completions_are_sound() {
    let mut r = recognizer("stlc");
    r.feed_raw("λx:Int.").unwrap();
    for completion in r.get_completions() {
        let mut clone = r.clone();
        clone
            .feed_raw(&completion)
            .unwrap_or_else(|e| panic!("completion {completion:?} rejected: {e}"));
    }

    let mut r = recognizer("json");
    r.feed_raw("{\"k\": [1,").unwrap();
    for completion in r.get_completions() {
        let mut clone = r.clone();
        clone
            .feed_raw(&completion)
            .unwrap_or_else(|e| panic!("completion {completion:?} rejected: {e}"));
    }
}

#[test]
fn token_filter_round_trips_against_a_clone() {
    let mut r = recognizer("imp");
    r.feed_raw("x: Int = 1; y: Int = x").unwrap();
    let vocab = [" + 1", " - x", ";", " < 2", "zz", " + true", ""];
    let indices = r.filter_completion_indices(&vocab);
    for (i, token) in vocab.iter().enumerate() {
        let mut clone = r.clone();
        let accepted = !token.is_empty() && clone.feed_raw(token).is_ok();
        assert_eq!(
            indices.contains(&i),
            accepted,
            "filter and feed disagree on {token:?}"
        );
    }
}

#[test]
fn ambiguous_prefixes_widen_the_frontier() {
    let grammar = Arc::new(Grammar::new("A ::= \"ab\" | \"ac\" | [a-z]+").unwrap());
    let mut r = Recognizer::new(grammar);
    r.feed('a').unwrap();
    assert!(r.well_typed_tree_count() >= 2);
}

#[test]
fn reset_restores_the_initial_state() {
    let mut r = recognizer("toy");
    let initial = r.get_completions();
    r.feed_raw("beep:Fizz").unwrap();
    r.reset();
    assert_eq!(r.current_text(), "");
    assert!(!r.is_complete());
    assert_eq!(r.get_completions(), initial);
    r.reset();
    assert_eq!(r.get_completions(), initial);
    // The reset recognizer parses again from scratch.
    r.feed_raw("boop:Buzz").unwrap();
    assert!(r.is_complete());
}

#[test]
fn to_sexpr_requires_a_complete_buffer() {
    let mut r = recognizer("toy");
    r.feed_raw("beep:").unwrap();
    let err = r.to_sexpr().unwrap_err();
    assert_eq!(err.kind(), "Incomplete");
    r.feed_raw("Fizz").unwrap();
    let sexpr = r.to_sexpr().unwrap();
    assert_eq!(sexpr, "(Expr (Atom \"beep\" \":\" (TyName \"Fizz\")))");
}

#[test]
fn clones_are_independent_sessions() {
    let mut r = recognizer("toy");
    r.feed_raw("beep:").unwrap();
    let clone = r.clone();
    r.feed_raw("Fizz").unwrap();
    assert_eq!(clone.current_text(), "beep:");
    assert!(!clone.is_complete());
}

fn char_vocab() -> Vec<String> {
    "abcdefghijklmnopqrstuvwxyz0123456789 +:.FizBuz"
        .chars()
        .map(|c| c.to_string())
        .collect()
}

#[test]
fn masked_logits_keep_valid_indices_and_kill_the_rest() {
    let grammar = compile("toy");
    let vocab: Vec<String> = char_vocab();
    let size = vocab.len();
    let mut sampler = TypedSampler::new(
        grammar,
        Vocabulary::new(vocab.clone()),
        Box::new(move || Ok(vec![0.25; size])),
    );
    sampler.feed("beep:Fizz +").unwrap();
    let masked = sampler.infer(None).unwrap();
    let mut clone = sampler.recognizer().clone();
    for (i, &logit) in masked.iter().enumerate() {
        let accepted = clone.simulate_ok(&vocab[i]);
        if accepted {
            assert_eq!(logit, 0.25, "valid token {:?} was masked", vocab[i]);
        } else {
            assert_eq!(
                logit,
                f32::NEG_INFINITY,
                "invalid token {:?} kept its logit",
                vocab[i]
            );
        }
    }
}

// Feeding on a clone is the reference semantics for the mask.
trait SimulateOk {
    fn simulate_ok(&mut self, text: &str) -> bool;
}

impl SimulateOk for Recognizer {
    fn simulate_ok(&mut self, text: &str) -> bool {
        let mut clone = self.clone();
        clone.feed_raw(text).is_ok()
    }
}

#[test]
fn pre_top_k_restricts_filtering_to_high_logits() {
    let grammar = compile("toy");
    let vocab = vec!["beep".to_string(), "boop".to_string(), "zap".to_string()];
    // "zap" has the highest logit, "beep" the lowest.
    let mut sampler = TypedSampler::new(
        grammar,
        Vocabulary::new(vocab),
        Box::new(|| Ok(vec![0.1, 0.5, 0.9])),
    );
    // All three are syntactically fine openers; pre_top_k=2 must not see
    // "beep" at all.
    let top = sampler.infer_text(10, Some(2)).unwrap();
    assert_eq!(top, vec!["zap".to_string(), "boop".to_string()]);
    let all = sampler.infer_text(10, None).unwrap();
    assert_eq!(
        all,
        vec!["zap".to_string(), "boop".to_string(), "beep".to_string()]
    );
}

#[test]
fn greedy_generation_until_complete() {
    let grammar = compile("toy");
    let vocab = vec![
        "beep:Fizz".to_string(),
        " + boop:Fizz".to_string(),
        "nonsense".to_string(),
    ];
    let mut sampler = TypedSampler::new(
        grammar,
        Vocabulary::new(vocab),
        Box::new(|| Ok(vec![3.0, 1.0, 2.0])),
    );
    let mut seen = Vec::new();
    let mut on_token = |token: &str, step: usize| seen.push((step, token.to_string()));
    let result = until_complete(
        &mut sampler,
        "",
        &GenerateOptions::default(),
        Some(&mut on_token),
    )
    .unwrap();
    assert_eq!(result.stop_reason, StopReason::Complete);
    assert!(result.is_complete);
    assert_eq!(result.text, "beep:Fizz");
    assert_eq!(result.tokens_generated, 1);
    assert_eq!(seen, vec![(0, "beep:Fizz".to_string())]);
    assert!(result.to_sexpr(&sampler).is_some());
}

#[test]
fn generation_reports_no_valid_token() {
    let grammar = compile("toy");
    let vocab = vec!["123".to_string(), "!!".to_string()];
    let mut sampler = TypedSampler::new(
        grammar,
        Vocabulary::new(vocab),
        Box::new(|| Ok(vec![1.0, 2.0])),
    );
    let result = generate(&mut sampler, "", &GenerateOptions::default(), None).unwrap();
    assert_eq!(result.stop_reason, StopReason::NoValid);
    assert!(!result.is_complete);
    assert_eq!(result.tokens_generated, 0);
}

#[test]
fn generation_surfaces_ill_typed_initial_text() {
    let grammar = compile("toy");
    let vocab = vec!["x".to_string()];
    let mut sampler =
        TypedSampler::new(grammar, Vocabulary::new(vocab), Box::new(|| Ok(vec![0.0])));
    let result = generate(
        &mut sampler,
        "beep:Fizz + boop:Buzz",
        &GenerateOptions::default(),
        None,
    )
    .unwrap();
    assert!(matches!(result.stop_reason, StopReason::TypeError(_)));
    assert_eq!(result.tokens_generated, 0);
}

#[test]
fn model_errors_pass_through_unchanged() {
    let grammar = compile("toy");
    let vocab = vec!["beep".to_string()];
    let mut sampler = TypedSampler::new(
        grammar,
        Vocabulary::new(vocab),
        Box::new(|| Err(p7::ModelError("backend exploded".to_string()))),
    );
    let err = generate(&mut sampler, "", &GenerateOptions::default(), None).unwrap_err();
    assert_eq!(err.kind(), "ModelError");
    assert!(err.to_string().contains("backend exploded"));
}

#[test]
fn reasoning_environment_thinks_then_emits_typed_output() {
    let grammar = compile("toy");
    let vocab = vec![
        "I".to_string(),
        " think".to_string(),
        "</think>".to_string(),
        "beep:Fizz".to_string(),
        " + boop:Fizz".to_string(),
    ];
    let mut call = 0usize;
    let logit_fn = Box::new(move || {
        // Script the think span: "I", " think", then the close tag. The
        // grammar span ignores the favored index because it is masked.
        let favored = match call {
            0 => 0,
            1 => 1,
            _ => 2,
        };
        call += 1;
        let mut logits = vec![0.0f32; 5];
        logits[favored] = 5.0;
        Ok(logits)
    });
    let model = LogitModel::new(grammar, Vocabulary::new(vocab), logit_fn);
    let mut env = ReasoningEnvironment::new(
        model,
        "toy",
        EnvironmentConfig {
            stop_on_complete: true,
            ..EnvironmentConfig::default()
        },
    );
    let mut switches = Vec::new();
    let mut on_switch = |mode: p7::Mode, tag: &str| switches.push((mode, tag.to_string()));
    let result = env.generate(
        "Produce a fizzy expression.",
        "",
        &RunOptions::default(),
        RunCallbacks {
            on_mode_switch: Some(&mut on_switch),
            ..RunCallbacks::default()
        },
    );
    assert_eq!(result.stop_reason, EnvStopReason::Complete);
    assert!(result.is_complete());
    assert_eq!(result.think_blocks().len(), 1);
    assert_eq!(result.think_blocks()[0].content, "I think");
    let output = result.final_output().unwrap();
    assert_eq!(output.content, "beep:Fizz");
    assert!(output.is_complete);
    assert_eq!(result.all_thoughts(), "I think");
    assert_eq!(switches[0].0, p7::Mode::Think);
    assert_eq!(switches[1].0, p7::Mode::Grammar);
    assert_eq!(
        result.to_string(),
        "<think>I think</think><toy>beep:Fizz</toy>"
    );
}

#[test]
fn environment_gives_up_after_max_blocks() {
    let grammar = compile("toy");
    // No vocabulary token can ever complete an expression, so every grammar
    // block stalls and the environment alternates until the budget runs out.
    let vocab = vec!["hm".to_string(), "</think>".to_string(), "beep:".to_string()];
    let logit_fn = Box::new(|| Ok(vec![0.0, 1.0, 0.5]));
    let model = LogitModel::new(grammar, Vocabulary::new(vocab), logit_fn);
    let mut env = ReasoningEnvironment::new(model, "toy", EnvironmentConfig::default());
    let result = env.generate(
        "?",
        "",
        &RunOptions {
            max_blocks: 4,
            ..RunOptions::default()
        },
        RunCallbacks::default(),
    );
    assert_eq!(result.stop_reason, EnvStopReason::MaxBlocks);
    assert!(!result.is_complete());
    assert_eq!(result.blocks.len(), 4);
}

#[test]
fn build_system_prompt_mentions_modes_and_examples() {
    let prompt = p7::build_system_prompt("stlc", Some("make an identity function"), true);
    assert!(prompt.contains("<think>"));
    assert!(prompt.contains("<stlc>"));
    assert!(prompt.contains("λx:Int.x"));
    assert!(prompt.contains("Task: make an identity function"));

    let fallback = p7::build_system_prompt("mystery", None, true);
    assert!(fallback.contains("<mystery>"));
}

#[test]
fn stream_events_serialize_as_tagged_records() {
    let event = StreamEvent::Token {
        step: 3,
        text: "x".to_string(),
        full_text: "λx".to_string(),
    };
    let line = event.to_json_line();
    assert!(line.ends_with('\n'));
    let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(value["type"], "token");
    assert_eq!(value["step"], 3);
    assert_eq!(value["full_text"], "λx");

    let done = StreamEvent::Done {
        reason: StopReason::Complete.to_string(),
        is_complete: true,
    };
    let value: serde_json::Value = serde_json::from_str(done.to_json_line().trim()).unwrap();
    assert_eq!(value["type"], "done");
    assert_eq!(value["reason"], "complete");
}

#[test]
fn regex_helpers_are_prefix_aware() {
    assert!(p7::regex_matches("[a-z]+[0-9]", "abc1").unwrap());
    assert!(!p7::regex_matches("[a-z]+[0-9]", "abc").unwrap());
    assert!(p7::regex_prefix_valid("[a-z]+[0-9]", "abc").unwrap());
    assert!(!p7::regex_prefix_valid("[a-z]+[0-9]", "abc12").unwrap());
}

#[test]
fn left_recursion_parses_long_chains() {
    let grammar = Arc::new(Grammar::new("S ::= \"b\" | S \"b\"").unwrap());
    let mut r = Recognizer::new(grammar);
    for _ in 0..20 {
        r.feed('b').unwrap();
        assert!(r.is_complete());
    }
}

#[test]
fn start_directive_and_override() {
    let spec = "A ::= \"a\"\nstart: B\nB ::= \"b\"";
    let grammar = Arc::new(Grammar::new(spec).unwrap());
    assert_eq!(grammar.start_nonterminal(), "B");
    let mut r = Recognizer::new(grammar);
    assert!(r.feed('a').is_err());
    r.feed('b').unwrap();
    assert!(r.is_complete());
}

#[test]
fn unknown_grammar_names_are_reported() {
    let err = get_grammar("nope").unwrap_err();
    assert!(err.to_string().contains("nope"));
    assert!(err.to_string().contains("stlc"));
    let info = p7::get_grammar_info("nope");
    assert_eq!(info.name, "nope");
    assert!(info.spec.is_empty());
}
