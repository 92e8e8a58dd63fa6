//! Model catalog: short-name aliases and router fallback chains.

use std::collections::BTreeMap;

/// Short names accepted by the router, mapped to its canonical ids.
const ROUTER_ALIASES: &[(&str, &str)] = &[
    ("claude-sonnet-4.5", "anthropic/claude-sonnet-4-5-20250929"),
    ("claude-haiku-4.5", "anthropic/claude-haiku-4-5-20251001"),
    ("claude-opus-4", "anthropic/claude-opus-4-20250514"),
    ("gpt-4o", "openai/gpt-4o"),
    ("gpt-4o-mini", "openai/gpt-4o-mini"),
    ("gemini-2.0-flash", "google/gemini-2.0-flash-001"),
    ("deepseek-v3", "deepseek/deepseek-chat"),
    ("llama-3.3-70b", "meta-llama/llama-3.3-70b-instruct"),
];

/// Models tried, in order, after the requested one fails.
const FALLBACK_CHAINS: &[(&str, &[&str])] = &[
    (
        "anthropic/claude-sonnet-4-5-20250929",
        &["anthropic/claude-haiku-4-5-20251001", "openai/gpt-4o-mini"],
    ),
    (
        "anthropic/claude-opus-4-20250514",
        &["anthropic/claude-sonnet-4-5-20250929", "openai/gpt-4o"],
    ),
    (
        "openai/gpt-4o",
        &["anthropic/claude-sonnet-4-5-20250929", "openai/gpt-4o-mini"],
    ),
];

const ANTHROPIC_ALIASES: &[(&str, &str)] = &[
    ("claude-sonnet-4.5", "claude-sonnet-4-5-latest"),
    ("claude-haiku-4.5", "claude-haiku-4-5-latest"),
];

/// Resolves a model name to a router id. Configured aliases win over
/// the built-in table; unknown names pass through.
pub(crate) fn resolve_router_model(name: &str, extra: &BTreeMap<String, String>) -> String {
    if let Some(id) = extra.get(name) {
        return id.clone();
    }
    ROUTER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map_or_else(|| name.to_string(), |(_, id)| (*id).to_string())
}

/// The resolved model followed by its fallbacks.
pub(crate) fn fallback_chain(resolved: &str) -> Vec<String> {
    let mut chain = vec![resolved.to_string()];
    if let Some((_, fallbacks)) = FALLBACK_CHAINS.iter().find(|(id, _)| *id == resolved) {
        chain.extend(fallbacks.iter().map(|m| (*m).to_string()));
    }
    chain
}

/// Resolves a model name to a native Anthropic id (vendor prefix stripped).
pub(crate) fn resolve_anthropic_model(name: &str) -> String {
    let bare = name.strip_prefix("anthropic/").unwrap_or(name);
    ANTHROPIC_ALIASES
        .iter()
        .find(|(alias, _)| *alias == bare)
        .map_or_else(|| bare.to_string(), |(_, id)| (*id).to_string())
}
