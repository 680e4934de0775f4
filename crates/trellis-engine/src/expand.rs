//! Prompt variable expansion.
//!
//! The vocabulary is fixed: `$goal` resolves to the graph-level goal and
//! `$context.<key>` to the stringified context value. Any other `$var`
//! expands to the empty string. No arbitrary expressions, no code execution.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use trellis_core::Value;

fn variable_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$(?:context\.([A-Za-z0-9_.]+)|([A-Za-z_][A-Za-z0-9_]*))").unwrap()
    })
}

/// Expand `$goal` and `$context.<k>` in `template`. Unknown variables and
/// missing context keys expand to the empty string.
pub fn expand_prompt(template: &str, goal: &str, snapshot: &HashMap<String, Value>) -> String {
    variable_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            if let Some(key) = caps.get(1) {
                snapshot
                    .get(key.as_str())
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            } else if caps.get(2).map(|m| m.as_str()) == Some("goal") {
                goal.to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}
