//! Graph lint rules and diagnostics.
//!
//! A [`Validator`] owns an ordered rule list. The built-in rules cover the
//! structural invariants (start/exit shape counts, reachability, dangling
//! endpoints) plus a handful of advisory checks. User rules registered with
//! [`Validator::register`] run after the built-ins, in registration order.
//! Cycles are legal — retry loops are a feature, not a defect.

use std::collections::{HashSet, VecDeque};

use trellis_core::{Result, TrellisError};

use crate::condition::parse_condition;
use crate::graph::Graph;
use crate::handler::shape_handler_type;

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
}

impl Diagnostic {
    fn error(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message: message.into(),
            node_id: None,
            edge: None,
        }
    }

    fn warning(rule: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule, message)
        }
    }

    fn for_node(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    fn for_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge = Some((from.into(), to.into()));
        self
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, graph: &Graph) -> Vec<Diagnostic>;
}

struct StartNodeRule;
impl LintRule for StartNodeRule {
    fn name(&self) -> &str {
        "start_node"
    }
    fn check(&self, graph: &Graph) -> Vec<Diagnostic> {
        let starts: Vec<_> = graph.nodes().filter(|n| n.is_start()).collect();
        match starts.len() {
            1 => vec![],
            0 => vec![Diagnostic::error(
                self.name(),
                "pipeline has no start node (shape=Mdiamond)",
            )],
            n => vec![Diagnostic::error(
                self.name(),
                format!(
                    "pipeline has {n} start nodes ({}); expected exactly one",
                    starts
                        .iter()
                        .map(|x| x.id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )],
        }
    }
}

struct ExitNodeRule;
impl LintRule for ExitNodeRule {
    fn name(&self) -> &str {
        "exit_node"
    }
    fn check(&self, graph: &Graph) -> Vec<Diagnostic> {
        if graph.exit_nodes().next().is_none() {
            vec![Diagnostic::error(
                self.name(),
                "pipeline has no exit node (shape=Msquare)",
            )]
        } else {
            vec![]
        }
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str {
        "reachability"
    }
    fn check(&self, graph: &Graph) -> Vec<Diagnostic> {
        let start = match graph.start_node() {
            Some(n) => n.id.clone(),
            // StartNodeRule reports the missing start.
            None => return vec![],
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        seen.insert(start.clone());
        queue.push_back(start);
        while let Some(current) = queue.pop_front() {
            for edge in graph.outgoing_edges(&current) {
                if seen.insert(edge.to.clone()) {
                    queue.push_back(edge.to.clone());
                }
            }
        }

        graph
            .nodes()
            .filter(|n| !seen.contains(&n.id))
            .map(|n| {
                Diagnostic::error(
                    self.name(),
                    format!("node '{}' is not reachable from the start node", n.id),
                )
                .for_node(&n.id)
            })
            .collect()
    }
}

struct EdgeEndpointsRule;
impl LintRule for EdgeEndpointsRule {
    fn name(&self) -> &str {
        "edge_endpoints"
    }
    fn check(&self, graph: &Graph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for edge in graph.edges() {
            for endpoint in [&edge.from, &edge.to] {
                if graph.node(endpoint).is_none() {
                    diags.push(
                        Diagnostic::error(
                            self.name(),
                            format!(
                                "edge {} -> {} references undeclared node '{endpoint}'",
                                edge.from, edge.to
                            ),
                        )
                        .for_edge(&edge.from, &edge.to),
                    );
                }
            }
        }
        diags
    }
}

struct StartNoIncomingRule;
impl LintRule for StartNoIncomingRule {
    fn name(&self) -> &str {
        "start_no_incoming"
    }
    fn check(&self, graph: &Graph) -> Vec<Diagnostic> {
        let start = match graph.start_node() {
            Some(n) => n.id.clone(),
            None => return vec![],
        };
        if graph.edges().iter().any(|e| e.to == start) {
            vec![
                Diagnostic::error(self.name(), format!("start node '{start}' has incoming edges"))
                    .for_node(start),
            ]
        } else {
            vec![]
        }
    }
}

struct ExitNoOutgoingRule;
impl LintRule for ExitNoOutgoingRule {
    fn name(&self) -> &str {
        "exit_no_outgoing"
    }
    fn check(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .exit_nodes()
            .filter(|n| !graph.outgoing_edges(&n.id).is_empty())
            .map(|n| {
                Diagnostic::error(
                    self.name(),
                    format!("exit node '{}' has outgoing edges", n.id),
                )
                .for_node(&n.id)
            })
            .collect()
    }
}

struct ConditionSyntaxRule;
impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str {
        "condition_syntax"
    }
    fn check(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .edges()
            .iter()
            .filter_map(|e| {
                let cond = e.condition.as_deref()?;
                parse_condition(cond).err().map(|err| {
                    Diagnostic::error(
                        self.name(),
                        format!(
                            "edge {} -> {} has invalid condition '{cond}': {err}",
                            e.from, e.to
                        ),
                    )
                    .for_edge(&e.from, &e.to)
                })
            })
            .collect()
    }
}

struct RetryTargetExistsRule;
impl LintRule for RetryTargetExistsRule {
    fn name(&self) -> &str {
        "retry_target_exists"
    }
    fn check(&self, graph: &Graph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in graph.nodes() {
            for (attr, target) in [
                ("retry_target", &node.retry_target),
                ("fallback_retry_target", &node.fallback_retry_target),
            ] {
                if let Some(target) = target {
                    if graph.node(target).is_none() {
                        diags.push(
                            Diagnostic::warning(
                                self.name(),
                                format!("node '{}' has {attr} '{target}' which does not exist", node.id),
                            )
                            .for_node(&node.id),
                        );
                    }
                }
            }
        }
        diags
    }
}

struct GoalGateHasRetryRule;
impl LintRule for GoalGateHasRetryRule {
    fn name(&self) -> &str {
        "goal_gate_has_retry"
    }
    fn check(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .filter(|n| n.goal_gate && n.retry_target.is_none() && n.fallback_retry_target.is_none())
            .map(|n| {
                Diagnostic::warning(
                    self.name(),
                    format!("node '{}' has goal_gate=true but no retry target", n.id),
                )
                .for_node(&n.id)
            })
            .collect()
    }
}

struct PromptOnLlmNodesRule;
impl LintRule for PromptOnLlmNodesRule {
    fn name(&self) -> &str {
        "prompt_on_llm_nodes"
    }
    fn check(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .filter(|n| {
                let resolved = n
                    .handler_type
                    .clone()
                    .or_else(|| shape_handler_type(&n.shape).map(str::to_string))
                    .unwrap_or_else(|| "codergen".to_string());
                resolved == "codergen"
            })
            .filter(|n| n.prompt.as_deref().is_none_or(str::is_empty))
            .map(|n| {
                Diagnostic::warning(
                    self.name(),
                    format!("LLM node '{}' has no prompt", n.id),
                )
                .for_node(&n.id)
            })
            .collect()
    }
}

struct MaxRetriesRangeRule;
impl LintRule for MaxRetriesRangeRule {
    fn name(&self) -> &str {
        "max_retries_range"
    }
    fn check(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .filter_map(|n| {
                let declared = n.attr_int("max_retries")?;
                if !(0..=crate::graph::MAX_RETRIES_CAP).contains(&declared) {
                    Some(
                        Diagnostic::warning(
                            self.name(),
                            format!(
                                "node '{}' declares max_retries={declared}; clamped to 0..=50",
                                n.id
                            ),
                        )
                        .for_node(&n.id),
                    )
                } else {
                    None
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Ordered rule runner. `Validator::default()` carries the built-in rules.
pub struct Validator {
    rules: Vec<Box<dyn LintRule>>,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            rules: vec![
                Box::new(StartNodeRule),
                Box::new(ExitNodeRule),
                Box::new(ReachabilityRule),
                Box::new(EdgeEndpointsRule),
                Box::new(StartNoIncomingRule),
                Box::new(ExitNoOutgoingRule),
                Box::new(ConditionSyntaxRule),
                Box::new(RetryTargetExistsRule),
                Box::new(GoalGateHasRetryRule),
                Box::new(PromptOnLlmNodesRule),
                Box::new(MaxRetriesRangeRule),
            ],
        }
    }
}

impl Validator {
    /// An empty validator with no rules.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule; rules run in registration order.
    pub fn register(&mut self, rule: impl LintRule + 'static) -> &mut Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn validate(&self, graph: &Graph) -> Vec<Diagnostic> {
        self.rules.iter().flat_map(|r| r.check(graph)).collect()
    }

    /// Fail with an aggregated error when any diagnostic is `Error`.
    pub fn validate_or_raise(&self, graph: &Graph) -> Result<Vec<Diagnostic>> {
        let diagnostics = self.validate(graph);
        let errors: Vec<_> = diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .map(|d| d.message.clone())
            .collect();
        if !errors.is_empty() {
            return Err(TrellisError::Validation(errors.join("; ")));
        }
        Ok(diagnostics)
    }
}

/// Run the built-in rules.
pub fn validate(graph: &Graph) -> Vec<Diagnostic> {
    Validator::default().validate(graph)
}

/// Run the built-in rules, failing on any error-severity diagnostic.
pub fn validate_or_raise(graph: &Graph) -> Result<Vec<Diagnostic>> {
    Validator::default().validate_or_raise(graph)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
