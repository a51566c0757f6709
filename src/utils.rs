//! Small helpers shared across the crate.

use std::sync::OnceLock;

/// Returns true when the named environment variable holds a truthy value
/// (`1`, `true`, `yes` or `on`, case-insensitively).
pub(crate) fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Whether verbose constrained-decoding traces go to standard error.
///
/// Controlled by `P7_CONSTRAINED_DEBUG` or `P7_SAMPLER_DEBUG`; read once per
/// process.
pub(crate) fn debug_enabled() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| env_flag("P7_CONSTRAINED_DEBUG") || env_flag("P7_SAMPLER_DEBUG"))
}

/// Deduplicates a token list while preserving first-occurrence order. Empty
/// entries are dropped.
pub(crate) fn dedupe_tokens(tokens: Vec<String>) -> Vec<String> {
    let mut seen = ahash::AHashSet::new();
    let mut ordered = Vec::with_capacity(tokens.len());
    for token in tokens {
        if token.is_empty() || !seen.insert(token.clone()) {
            continue;
        }
        ordered.push(token);
    }
    ordered
}

macro_rules! sampler_trace {
    ($($arg:tt)*) => {
        if crate::utils::debug_enabled() {
            eprintln!("[p7-sampler-debug] {}", format_args!($($arg)*));
        }
    };
}
pub(crate) use sampler_trace;
