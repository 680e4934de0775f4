//! Deterministic next-edge selection.
//!
//! After a node completes, the candidate set is formed first: conditional
//! edges whose condition holds, or — when none hold — the unconditional
//! edges. Within the candidates, the cascade is preferred label, suggested
//! next ids, explicit priority, weight, lexical target id, source order.

use std::cmp::Ordering;

use trellis_core::Outcome;

use crate::condition::{evaluate_condition, parse_condition};
use crate::graph::{Edge, Graph};

/// Select the next edge out of `node_id`, or `None` when no candidate
/// matches (the caller decides whether that is a clean exit or a failure).
pub fn select_edge<'a>(
    graph: &'a Graph,
    node_id: &str,
    outcome: &Outcome,
    resolve: &dyn Fn(&str) -> String,
) -> Option<&'a Edge> {
    let edges = graph.outgoing_edges(node_id);
    if edges.is_empty() {
        return None;
    }

    // Step 1: conditional edges that evaluate true win the candidacy; they
    // displace every unconditional edge. Unparseable conditions never match.
    let truthy: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|e| match &e.condition {
            Some(cond) => parse_condition(cond)
                .map(|expr| evaluate_condition(&expr, resolve))
                .unwrap_or(false),
            None => false,
        })
        .collect();

    let candidates: Vec<&Edge> = if truthy.is_empty() {
        edges
            .iter()
            .copied()
            .filter(|e| e.condition.is_none())
            .collect()
    } else {
        truthy
    };
    if candidates.is_empty() {
        return None;
    }

    // Step 2: preferred label.
    if let Some(label) = &outcome.preferred_label {
        let wanted = normalize_label(label);
        if let Some(edge) = candidates
            .iter()
            .copied()
            .find(|e| e.label.as_deref().map(normalize_label).as_deref() == Some(&wanted))
        {
            return Some(edge);
        }
    }

    // Step 3: suggested next ids, in suggestion order.
    for suggested in &outcome.suggested_next_ids {
        if let Some(edge) = candidates.iter().copied().find(|e| e.to == *suggested) {
            return Some(edge);
        }
    }

    // Steps 4–5: priority (when declared), weight, then stable tiebreaks.
    candidates.into_iter().max_by(|a, b| rank(a, b))
}

/// Total ordering over candidate edges; the maximum is selected. Explicit
/// `priority` outranks `weight`; ties fall to the lexically smaller target
/// id, then to the earlier edge in source order.
fn rank(a: &Edge, b: &Edge) -> Ordering {
    a.priority
        .unwrap_or(i64::MIN)
        .cmp(&b.priority.unwrap_or(i64::MIN))
        .then(a.weight.cmp(&b.weight))
        .then_with(|| b.to.cmp(&a.to))
        .then_with(|| b.order.cmp(&a.order))
}

/// Lowercase, trimmed, with an `&` accelerator prefix removed, so
/// `"&Yes"` matches a preferred label of `"yes"`.
pub fn normalize_label(label: &str) -> String {
    label.trim().trim_start_matches('&').trim().to_lowercase()
}
