//! Raw document model produced by the parser.
//!
//! Subgraph structure is flattened at parse time: nodes and edges declared
//! inside a subgraph land in the top-level lists with the subgraph's default
//! attributes already applied. Declaration order is preserved — edge order is
//! the final tiebreaker during edge selection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use trellis_core::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DotGraph {
    pub name: String,
    pub attrs: HashMap<String, Value>,
    /// Declared and referenced nodes, in first-appearance order.
    pub nodes: Vec<NodeDef>,
    /// Expanded edges (chains split into pairs), in source order.
    pub edges: Vec<EdgeDef>,
}

impl DotGraph {
    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    pub attrs: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
    pub attrs: HashMap<String, Value>,
}
