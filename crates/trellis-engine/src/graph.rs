//! Typed pipeline graph built from the raw DOT document.

use std::collections::HashMap;
use std::time::Duration;

use trellis_core::{Result, Value};
use trellis_dot::DotGraph;

/// Hard cap on per-node retries, regardless of what the source declares.
pub const MAX_RETRIES_CAP: i64 = 50;

/// An immutable pipeline graph with node and adjacency indexes.
#[derive(Debug, Clone)]
pub struct Graph {
    pub name: String,
    pub goal: String,
    pub attrs: HashMap<String, Value>,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    outgoing: HashMap<String, Vec<usize>>,
}

/// One stage of the pipeline.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub label: String,
    pub shape: String,
    /// Explicit `type` attribute overriding shape-based handler dispatch.
    pub handler_type: Option<String>,
    pub prompt: Option<String>,
    pub goal: Option<String>,
    pub goal_gate: bool,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
    pub retry_target: Option<String>,
    pub fallback_retry_target: Option<String>,
    pub allow_partial: bool,
    /// Stylesheet hooks.
    pub classes: Vec<String>,
    pub element_id: Option<String>,
    pub llm_model: Option<String>,
    pub llm_provider: Option<String>,
    pub reasoning_effort: Option<String>,
    /// Full merged attribute map; reserved keys above are also present here.
    pub attrs: HashMap<String, Value>,
}

impl Node {
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    pub fn attr_int(&self, key: &str) -> Option<i64> {
        self.attrs.get(key).and_then(Value::as_int)
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        self.attrs.get(key).and_then(Value::as_bool)
    }

    pub fn attr_duration(&self, key: &str) -> Option<Duration> {
        self.attrs.get(key).and_then(Value::as_duration)
    }

    pub fn is_start(&self) -> bool {
        self.shape == "Mdiamond"
    }

    pub fn is_exit(&self) -> bool {
        self.shape == "Msquare"
    }
}

/// A transition between stages.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
    pub condition: Option<String>,
    pub weight: i64,
    pub priority: Option<i64>,
    /// Position in the source document; the final selection tiebreaker.
    pub order: usize,
    pub attrs: HashMap<String, Value>,
}

fn string_attr(attrs: &HashMap<String, Value>, key: &str) -> Option<String> {
    attrs.get(key).and_then(Value::as_str).map(str::to_string)
}

impl Graph {
    /// Build the typed graph from a parsed document. Node order and edge
    /// order are preserved from the source.
    pub fn from_dot(doc: DotGraph) -> Result<Self> {
        let mut nodes = Vec::with_capacity(doc.nodes.len());
        let mut index = HashMap::new();

        for def in &doc.nodes {
            let attrs = def.attrs.clone();
            let shape = string_attr(&attrs, "shape").unwrap_or_else(|| "box".to_string());
            let max_retries = attrs
                .get("max_retries")
                .and_then(Value::as_int)
                .unwrap_or(0)
                .clamp(0, MAX_RETRIES_CAP) as u32;
            let classes = string_attr(&attrs, "class")
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_default();

            let node = Node {
                id: def.id.clone(),
                label: string_attr(&attrs, "label").unwrap_or_else(|| def.id.clone()),
                shape,
                handler_type: string_attr(&attrs, "type"),
                prompt: string_attr(&attrs, "prompt"),
                goal: string_attr(&attrs, "goal"),
                goal_gate: attrs.get("goal_gate").and_then(Value::as_bool).unwrap_or(false),
                max_retries,
                timeout: attrs.get("timeout").and_then(Value::as_duration),
                retry_target: string_attr(&attrs, "retry_target"),
                fallback_retry_target: string_attr(&attrs, "fallback_retry_target"),
                allow_partial: attrs
                    .get("allow_partial")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                classes,
                element_id: string_attr(&attrs, "id"),
                llm_model: string_attr(&attrs, "llm_model"),
                llm_provider: string_attr(&attrs, "llm_provider"),
                reasoning_effort: string_attr(&attrs, "reasoning_effort"),
                attrs,
            };
            index.insert(def.id.clone(), nodes.len());
            nodes.push(node);
        }

        let mut edges = Vec::with_capacity(doc.edges.len());
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (order, def) in doc.edges.iter().enumerate() {
            let attrs = def.attrs.clone();
            let edge = Edge {
                from: def.from.clone(),
                to: def.to.clone(),
                label: string_attr(&attrs, "label"),
                condition: string_attr(&attrs, "condition"),
                weight: attrs.get("weight").and_then(Value::as_int).unwrap_or(0),
                priority: attrs.get("priority").and_then(Value::as_int),
                order,
                attrs,
            };
            outgoing.entry(def.from.clone()).or_default().push(order);
            edges.push(edge);
        }

        let goal = string_attr(&doc.attrs, "goal").unwrap_or_default();

        Ok(Graph {
            name: doc.name,
            goal,
            attrs: doc.attrs,
            nodes,
            index,
            edges,
            outgoing,
        })
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// The unique start node (shape `Mdiamond`), when present.
    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.is_start())
    }

    pub fn exit_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_exit())
    }

    /// Outgoing edges of a node, in source order.
    pub fn outgoing_edges(&self, id: &str) -> Vec<&Edge> {
        self.outgoing
            .get(id)
            .map(|idxs| idxs.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn graph_attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(dot: &str) -> Graph {
        Graph::from_dot(trellis_dot::parse(dot).unwrap()).unwrap()
    }

    #[test]
    fn linear_graph_shape() {
        let g = build(
            r#"digraph Pipeline {
                start [shape="Mdiamond"]
                work [label="Do work"]
                done [shape="Msquare"]
                start -> work -> done
            }"#,
        );
        assert_eq!(g.name, "Pipeline");
        assert_eq!(g.edges().len(), 2);
        assert_eq!(g.start_node().unwrap().id, "start");
        assert_eq!(g.exit_nodes().count(), 1);
        assert_eq!(g.node("work").unwrap().label, "Do work");
        assert_eq!(g.node("work").unwrap().shape, "box");
    }

    #[test]
    fn typed_attribute_extraction() {
        let g = build(
            r#"digraph G {
                step [max_retries=3, goal_gate=true, timeout=30s, retry_target="plan",
                      class="fast critical", id="step_one", allow_partial=true]
            }"#,
        );
        let n = g.node("step").unwrap();
        assert_eq!(n.max_retries, 3);
        assert!(n.goal_gate);
        assert_eq!(n.timeout, Some(Duration::from_secs(30)));
        assert_eq!(n.retry_target.as_deref(), Some("plan"));
        assert_eq!(n.classes, vec!["fast".to_string(), "critical".to_string()]);
        assert_eq!(n.element_id.as_deref(), Some("step_one"));
        assert!(n.allow_partial);
    }

    #[test]
    fn max_retries_clamped() {
        let g = build("digraph G { a [max_retries=500] ; b [max_retries=-2] }");
        assert_eq!(g.node("a").unwrap().max_retries, 50);
        assert_eq!(g.node("b").unwrap().max_retries, 0);
    }

    #[test]
    fn edge_attributes() {
        let g = build(
            r#"digraph G {
                a -> b [label="ok", condition="outcome=success", weight=5, priority=2]
            }"#,
        );
        let edges = g.outgoing_edges("a");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].label.as_deref(), Some("ok"));
        assert_eq!(edges[0].condition.as_deref(), Some("outcome=success"));
        assert_eq!(edges[0].weight, 5);
        assert_eq!(edges[0].priority, Some(2));
    }

    #[test]
    fn outgoing_edges_in_source_order() {
        let g = build(
            r#"digraph G {
                a -> z
                a -> b
                a -> m
            }"#,
        );
        let targets: Vec<_> = g.outgoing_edges("a").iter().map(|e| e.to.as_str()).collect();
        assert_eq!(targets, vec!["z", "b", "m"]);
    }

    #[test]
    fn goal_from_graph_attrs() {
        let g = build(r#"digraph G { goal = "Ship it" ; a -> b }"#);
        assert_eq!(g.goal, "Ship it");
    }

    #[test]
    fn no_outgoing_edges_for_terminal() {
        let g = build("digraph G { a -> b }");
        assert!(g.outgoing_edges("b").is_empty());
        assert!(g.outgoing_edges("missing").is_empty());
    }
}
