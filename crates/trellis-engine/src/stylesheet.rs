//! CSS-like model stylesheet.
//!
//! The graph attribute `model_stylesheet` holds rules that assign LLM
//! settings to nodes:
//!
//! ```text
//! * { llm_model: fast-model; }
//! codergen { reasoning_effort: medium; }
//! .critical { llm_model: big-model; }
//! #final_review { llm_provider: acme; }
//! ```
//!
//! Specificity: id > class > type > universal; among equal specificity the
//! later rule wins (declaration order is the stable secondary key).

use trellis_core::{Result, TrellisError, Value};

use crate::graph::{Graph, Node};
use crate::handler::shape_handler_type;

#[derive(Debug, Clone, PartialEq)]
pub struct Stylesheet {
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub selector: Selector,
    pub declarations: Vec<Declaration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Universal,
    Type(String),
    Class(String),
    Id(String),
}

impl Selector {
    pub fn specificity(&self) -> u8 {
        match self {
            Selector::Universal => 0,
            Selector::Type(_) => 1,
            Selector::Class(_) => 2,
            Selector::Id(_) => 3,
        }
    }

    pub fn matches(&self, node: &Node) -> bool {
        match self {
            Selector::Universal => true,
            Selector::Type(t) => {
                let resolved = node
                    .handler_type
                    .as_deref()
                    .or_else(|| shape_handler_type(&node.shape))
                    .unwrap_or("codergen");
                resolved == t
            }
            Selector::Class(c) => node.classes.contains(c),
            Selector::Id(id) => node.element_id.as_deref().unwrap_or(&node.id) == id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub property: String,
    pub value: String,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

fn err(msg: impl Into<String>) -> TrellisError {
    TrellisError::Validation(format!("stylesheet parse error: {}", msg.into()))
}

/// Parse a stylesheet string into rules.
pub fn parse_stylesheet(input: &str) -> Result<Stylesheet> {
    let mut rules = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let brace = rest
            .find('{')
            .ok_or_else(|| err(format!("expected '{{' after selector near '{rest}'")))?;
        let selector_text = rest[..brace].trim();
        let selector = parse_selector(selector_text)?;

        let body_start = brace + 1;
        let close = rest[body_start..]
            .find('}')
            .map(|i| body_start + i)
            .ok_or_else(|| err("unterminated rule body"))?;
        let body = &rest[body_start..close];

        let mut declarations = Vec::new();
        for decl in body.split(';') {
            let decl = decl.trim();
            if decl.is_empty() {
                continue;
            }
            let (property, value) = decl
                .split_once(':')
                .ok_or_else(|| err(format!("expected 'property: value' in '{decl}'")))?;
            declarations.push(Declaration {
                property: property.trim().to_string(),
                value: value.trim().trim_matches('"').to_string(),
            });
        }

        rules.push(Rule {
            selector,
            declarations,
        });
        rest = rest[close + 1..].trim_start();
    }

    Ok(Stylesheet { rules })
}

fn parse_selector(text: &str) -> Result<Selector> {
    if text == "*" {
        return Ok(Selector::Universal);
    }
    if let Some(id) = text.strip_prefix('#') {
        if id.is_empty() {
            return Err(err("empty id selector"));
        }
        return Ok(Selector::Id(id.to_string()));
    }
    if let Some(class) = text.strip_prefix('.') {
        if class.is_empty() {
            return Err(err("empty class selector"));
        }
        return Ok(Selector::Class(class.to_string()));
    }
    if text.is_empty() || !text.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
        return Err(err(format!("invalid selector '{text}'")));
    }
    Ok(Selector::Type(text.to_string()))
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Apply a stylesheet to every node, honoring specificity and rule order.
pub fn apply_stylesheet(graph: &mut Graph, sheet: &Stylesheet) {
    // Matching rules, lowest precedence first; later application overwrites.
    let mut order: Vec<(u8, usize)> = Vec::new();
    for node in graph.nodes_mut() {
        order.clear();
        for (i, rule) in sheet.rules.iter().enumerate() {
            if rule.selector.matches(node) {
                order.push((rule.selector.specificity(), i));
            }
        }
        order.sort();

        for &(_, i) in &order {
            for decl in &sheet.rules[i].declarations {
                match decl.property.as_str() {
                    "llm_model" => node.llm_model = Some(decl.value.clone()),
                    "llm_provider" => node.llm_provider = Some(decl.value.clone()),
                    "reasoning_effort" => node.reasoning_effort = Some(decl.value.clone()),
                    _ => {}
                }
                node.attrs
                    .insert(decl.property.clone(), Value::String(decl.value.clone()));
            }
        }
    }
}

/// Parse and apply the graph's `model_stylesheet` attribute, when present.
pub fn apply_model_stylesheet(graph: &mut Graph) -> Result<()> {
    let css = match graph.graph_attr_str("model_stylesheet") {
        Some(css) => css.to_string(),
        None => return Ok(()),
    };
    let sheet = parse_stylesheet(&css)?;
    apply_stylesheet(graph, &sheet);
    Ok(())
}
