//! Recursive-descent parser for the supported DOT subset, built on winnow.
//!
//! Accepted grammar:
//!
//! ```text
//! graph        := "digraph" IDENT "{" stmt* "}"
//! stmt         := graph_attr | attr_default | node_decl | edge_stmt | subgraph
//! graph_attr   := "graph" "[" attr_list "]" | IDENT "=" value
//! attr_default := ("node" | "edge") "[" attr_list "]"
//! node_decl    := name ("[" attr_list "]")?
//! edge_stmt    := name ("->" name)+ ("[" attr_list "]")?
//! subgraph     := ("subgraph" IDENT?)? "{" stmt* "}"
//! ```
//!
//! Anything outside this subset is a parse error with line/column location.

use std::collections::HashMap;
use std::time::Duration;

use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, opt};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{any, literal, take_while};
use winnow::{ModalResult, Parser};

use trellis_core::value::parse_duration;
use trellis_core::{TrellisError, Value};

use crate::ast::{DotGraph, EdgeDef, NodeDef};

// ---------------------------------------------------------------------------
// Comment stripping
// ---------------------------------------------------------------------------

/// Remove `//` line comments and non-nesting `/* */` block comments.
/// Newlines are preserved so error locations stay accurate; string literals
/// are copied verbatim, escapes included.
fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'/') => {
                chars.next();
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    if c == '\n' {
                        out.push('\n');
                    }
                    prev = c;
                }
            }
            '"' => {
                out.push('"');
                while let Some(c) = chars.next() {
                    out.push(c);
                    match c {
                        '\\' => {
                            if let Some(esc) = chars.next() {
                                out.push(esc);
                            }
                        }
                        '"' => break,
                        _ => {}
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Lexical parsers
// ---------------------------------------------------------------------------

fn cut_expected(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

fn backtrack() -> ErrMode<ContextError<StrContext>> {
    ErrMode::Backtrack(ContextError::new())
}

fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Attribute keys may be dotted (`manager.poll_interval`).
fn attr_key(input: &mut &str) -> ModalResult<String> {
    let first = identifier.parse_next(input)?;
    let mut key = first.to_string();
    while opt('.').parse_next(input)?.is_some() {
        key.push('.');
        key.push_str(identifier.parse_next(input)?);
    }
    Ok(key)
}

/// Double-quoted string with `\"`, `\\`, `\n`, `\t` escapes.
fn quoted_string(input: &mut &str) -> ModalResult<String> {
    let _ = '"'.parse_next(input)?;
    let mut s = String::new();
    loop {
        match any.parse_next(input)? {
            '"' => break,
            '\\' => match any.parse_next(input)? {
                'n' => s.push('\n'),
                't' => s.push('\t'),
                '\\' => s.push('\\'),
                '"' => s.push('"'),
                other => {
                    s.push('\\');
                    s.push(other);
                }
            },
            other => s.push(other),
        }
    }
    Ok(s)
}

/// A node reference: bare identifier or quoted string.
fn name(input: &mut &str) -> ModalResult<String> {
    alt((quoted_string, identifier.map(str::to_string))).parse_next(input)
}

/// Unquoted values must end at a token boundary so `5m` parses as a duration
/// while `5minutes` falls through to the bareword branch (and fails there,
/// since barewords cannot start with a digit).
fn at_boundary(input: &str) -> bool {
    !input
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn duration_value(input: &mut &str) -> ModalResult<Duration> {
    let digits: &str = digit1.parse_next(input)?;
    let n: u64 = digits.parse().map_err(|_| backtrack())?;
    let suffix = alt(("ms", "s", "m", "h", "d")).parse_next(input)?;
    if !at_boundary(input) {
        return Err(backtrack());
    }
    Ok(match suffix {
        "ms" => Duration::from_millis(n),
        "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        "d" => Duration::from_secs(n * 86400),
        _ => unreachable!(),
    })
}

fn float_value(input: &mut &str) -> ModalResult<f64> {
    let s: &str = (opt(alt(('-', '+'))), digit1, '.', digit1)
        .take()
        .parse_next(input)?;
    if !at_boundary(input) {
        return Err(backtrack());
    }
    s.parse().map_err(|_| backtrack())
}

fn integer_value(input: &mut &str) -> ModalResult<i64> {
    let s: &str = (opt(alt(('-', '+'))), digit1).take().parse_next(input)?;
    if !at_boundary(input) {
        return Err(backtrack());
    }
    s.parse().map_err(|_| backtrack())
}

fn boolean_value(input: &mut &str) -> ModalResult<bool> {
    let b = alt((literal("true").value(true), literal("false").value(false))).parse_next(input)?;
    if !at_boundary(input) {
        return Err(backtrack());
    }
    Ok(b)
}

/// Typed attribute value. Quoted strings that are duration literals
/// (`timeout="900s"`) are typed as durations; every other quoted string
/// stays a string.
fn attr_value(input: &mut &str) -> ModalResult<Value> {
    alt((
        quoted_string.map(|s| match parse_duration(&s) {
            Some(d) => Value::Duration(d),
            None => Value::String(s),
        }),
        boolean_value.map(Value::Bool),
        duration_value.map(Value::Duration),
        float_value.map(Value::Float),
        integer_value.map(Value::Int),
        identifier.map(|s: &str| Value::String(s.to_string())),
    ))
    .parse_next(input)
}

/// `[` key `=` value (`,` | `;` | WS)* `]`
fn attr_block(input: &mut &str) -> ModalResult<HashMap<String, Value>> {
    let _ = '['.parse_next(input)?;
    let mut attrs = HashMap::new();
    loop {
        let _ = ws.parse_next(input)?;
        let _ = opt(alt((',', ';'))).parse_next(input)?;
        let _ = ws.parse_next(input)?;
        match opt(attr_key).parse_next(input)? {
            Some(key) => {
                let _ = ws.parse_next(input)?;
                // Inside the block, malformed attributes are hard errors.
                let _ = '='
                    .context(StrContext::Expected(StrContextValue::CharLiteral('=')))
                    .parse_next(input)
                    .map_err(|e: ErrMode<ContextError>| e.cut())?;
                let _ = ws.parse_next(input)?;
                let value = attr_value
                    .context(StrContext::Expected(StrContextValue::Description(
                        "attribute value",
                    )))
                    .parse_next(input)
                    .map_err(|e: ErrMode<ContextError>| e.cut())?;
                attrs.insert(key, value);
            }
            None => break,
        }
    }
    let _ = ws.parse_next(input)?;
    let _ = ']'
        .context(StrContext::Expected(StrContextValue::CharLiteral(']')))
        .parse_next(input)
        .map_err(|e: ErrMode<ContextError>| e.cut())?;
    Ok(attrs)
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

enum Stmt {
    GraphAttrs(HashMap<String, Value>),
    GraphAttr(String, Value),
    NodeDefaults(HashMap<String, Value>),
    EdgeDefaults(HashMap<String, Value>),
    Node(String, HashMap<String, Value>),
    Edge(Vec<String>, HashMap<String, Value>),
    Subgraph(Vec<Stmt>),
}

fn keyword_block(keyword: &'static str) -> impl FnMut(&mut &str) -> ModalResult<HashMap<String, Value>> {
    move |input: &mut &str| {
        let _ = literal(keyword).parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let attrs = attr_block.parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        Ok(attrs)
    }
}

/// `("subgraph" IDENT?)? "{" stmt* "}"` — contents are flattened later.
fn subgraph_stmt(input: &mut &str) -> ModalResult<Stmt> {
    if opt(literal("subgraph")).parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        let _ = opt(identifier).parse_next(input)?;
        let _ = ws.parse_next(input)?;
    }
    let _ = '{'.parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'
        .context(StrContext::Expected(StrContextValue::CharLiteral('}')))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Stmt::Subgraph(stmts))
}

fn node_or_edge_stmt(input: &mut &str) -> ModalResult<Stmt> {
    let mut first = name.parse_next(input)?;

    // A dotted head (`stack.child_dotfile = ...`) can only be a graph
    // attribute; node ids are plain identifiers.
    let mut dotted = false;
    while opt('.').parse_next(input)?.is_some() {
        dotted = true;
        first.push('.');
        first.push_str(identifier.parse_next(input)?);
    }
    let _ = ws.parse_next(input)?;
    if dotted {
        let _ = '='
            .context(StrContext::Expected(StrContextValue::CharLiteral('=')))
            .parse_next(input)
            .map_err(|e: ErrMode<ContextError>| e.cut())?;
        let _ = ws.parse_next(input)?;
        let value = attr_value
            .context(StrContext::Expected(StrContextValue::Description(
                "attribute value",
            )))
            .parse_next(input)
            .map_err(|e: ErrMode<ContextError>| e.cut())?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Stmt::GraphAttr(first, value));
    }

    if opt(literal("->")).parse_next(input)?.is_some() {
        let mut chain = vec![first];
        loop {
            let _ = ws.parse_next(input)?;
            let next = name
                .context(StrContext::Expected(StrContextValue::Description(
                    "edge target",
                )))
                .parse_next(input)
                .map_err(|e: ErrMode<ContextError>| e.cut())?;
            chain.push(next);
            let _ = ws.parse_next(input)?;
            if opt(literal("->")).parse_next(input)?.is_none() {
                break;
            }
        }
        let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Stmt::Edge(chain, attrs));
    }

    if opt(literal("--")).parse_next(input)?.is_some() {
        return Err(cut_expected(
            "'->' (undirected edges are not supported)",
        ));
    }

    // `key = value` at statement level is a graph attribute.
    if opt('=').parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        let value = attr_value
            .context(StrContext::Expected(StrContextValue::Description(
                "attribute value",
            )))
            .parse_next(input)
            .map_err(|e: ErrMode<ContextError>| e.cut())?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Stmt::GraphAttr(first, value));
    }

    let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Stmt::Node(first, attrs))
}

fn statement(input: &mut &str) -> ModalResult<Stmt> {
    alt((
        keyword_block("graph").map(Stmt::GraphAttrs),
        keyword_block("node").map(Stmt::NodeDefaults),
        keyword_block("edge").map(Stmt::EdgeDefaults),
        subgraph_stmt,
        node_or_edge_stmt,
    ))
    .parse_next(input)
}

fn statements(input: &mut &str) -> ModalResult<Vec<Stmt>> {
    let mut stmts = Vec::new();
    loop {
        let _ = ws.parse_next(input)?;
        if input.is_empty() || input.starts_with('}') {
            break;
        }
        stmts.push(statement.parse_next(input)?);
    }
    Ok(stmts)
}

// ---------------------------------------------------------------------------
// Flattening
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Builder {
    attrs: HashMap<String, Value>,
    nodes: Vec<NodeDef>,
    index: HashMap<String, usize>,
    edges: Vec<EdgeDef>,
}

impl Builder {
    fn declare_node(&mut self, id: String, attrs: HashMap<String, Value>, defaults: &HashMap<String, Value>) {
        match self.index.get(&id) {
            Some(&i) => {
                self.nodes[i].attrs.extend(attrs);
            }
            None => {
                let mut merged = defaults.clone();
                merged.extend(attrs);
                self.index.insert(id.clone(), self.nodes.len());
                self.nodes.push(NodeDef { id, attrs: merged });
            }
        }
    }

    /// Referenced-but-undeclared endpoints are auto-declared with the
    /// defaults in scope.
    fn touch_node(&mut self, id: &str, defaults: &HashMap<String, Value>) {
        if !self.index.contains_key(id) {
            self.declare_node(id.to_string(), HashMap::new(), defaults);
        }
    }

    fn collect(
        &mut self,
        stmts: Vec<Stmt>,
        mut node_defaults: HashMap<String, Value>,
        mut edge_defaults: HashMap<String, Value>,
    ) {
        for stmt in stmts {
            match stmt {
                Stmt::GraphAttrs(attrs) => self.attrs.extend(attrs),
                Stmt::GraphAttr(key, value) => {
                    self.attrs.insert(key, value);
                }
                Stmt::NodeDefaults(attrs) => node_defaults.extend(attrs),
                Stmt::EdgeDefaults(attrs) => edge_defaults.extend(attrs),
                Stmt::Node(id, attrs) => self.declare_node(id, attrs, &node_defaults),
                Stmt::Edge(chain, attrs) => {
                    for id in &chain {
                        self.touch_node(id, &node_defaults);
                    }
                    for pair in chain.windows(2) {
                        let mut merged = edge_defaults.clone();
                        merged.extend(attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
                        self.edges.push(EdgeDef {
                            from: pair[0].clone(),
                            to: pair[1].clone(),
                            attrs: merged,
                        });
                    }
                }
                // Defaults set inside a subgraph stay scoped to it.
                Stmt::Subgraph(inner) => {
                    self.collect(inner, node_defaults.clone(), edge_defaults.clone())
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn parse_digraph(input: &mut &str) -> ModalResult<DotGraph> {
    let _ = ws.parse_next(input)?;

    if input.starts_with("strict") {
        return Err(cut_expected("'digraph' (strict graphs are not supported)"));
    }
    if input.starts_with("graph") {
        return Err(cut_expected(
            "'digraph' (undirected graphs are not supported)",
        ));
    }

    let _ = literal("digraph")
        .context(StrContext::Expected(StrContextValue::StringLiteral(
            "digraph",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let graph_name = identifier
        .context(StrContext::Expected(StrContextValue::Description(
            "graph name",
        )))
        .parse_next(input)
        .map_err(|e: ErrMode<ContextError>| e.cut())?;
    let _ = ws.parse_next(input)?;
    let _ = '{'
        .context(StrContext::Expected(StrContextValue::CharLiteral('{')))
        .parse_next(input)
        .map_err(|e: ErrMode<ContextError>| e.cut())?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'
        .context(StrContext::Expected(StrContextValue::CharLiteral('}')))
        .parse_next(input)
        .map_err(|e: ErrMode<ContextError>| e.cut())?;
    let _ = ws.parse_next(input)?;

    let mut builder = Builder::default();
    builder.collect(stmts, HashMap::new(), HashMap::new());

    Ok(DotGraph {
        name: graph_name.to_string(),
        attrs: builder.attrs,
        nodes: builder.nodes,
        edges: builder.edges,
    })
}

fn line_col(text: &str, consumed: usize) -> (usize, usize) {
    let prefix = &text[..consumed.min(text.len())];
    let line = prefix.matches('\n').count() + 1;
    let col = match prefix.rfind('\n') {
        Some(pos) => consumed - pos,
        None => consumed + 1,
    };
    (line, col)
}

/// Parse DOT source into a [`DotGraph`], or fail with a located parse error.
pub fn parse(source: &str) -> Result<DotGraph, TrellisError> {
    let stripped = strip_comments(source);
    let total = stripped.len();
    let mut remaining = stripped.as_str();

    let located = |remaining_len: usize, message: String| {
        let consumed = total - remaining_len;
        let (line, col) = line_col(&stripped, consumed);
        let snippet: String = stripped[consumed..].chars().take(40).collect();
        TrellisError::Parse {
            line,
            col,
            message,
            snippet: (!snippet.is_empty()).then_some(snippet),
        }
    };

    let graph = parse_digraph
        .parse_next(&mut remaining)
        .map_err(|e| located(remaining.len(), e.to_string()))?;

    let _ = ws.parse_next(&mut remaining);
    if !remaining.is_empty() {
        return Err(located(
            remaining.len(),
            "unexpected content after closing '}'".to_string(),
        ));
    }
    Ok(graph)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
