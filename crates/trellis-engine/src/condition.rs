//! Edge condition expressions: parser and evaluator.
//!
//! ```text
//! expr    := cmp ("&&" cmp)*
//! cmp     := key ("=" | "!=") literal
//! key     := "outcome" | "preferred_label" | "context" "." IDENT | IDENT
//! literal := quoted_string | bareword | number | bool
//! ```
//!
//! All comparison is string equality. Missing keys resolve to the empty
//! string; an empty expression is always true; `&&` short-circuits.

use trellis_core::TrellisError;

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpr {
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub key: String,
    pub operator: Operator,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
}

fn make_error(msg: &str) -> TrellisError {
    TrellisError::Validation(format!("condition parse error: {msg}"))
}

/// Parse a condition string. Empty or whitespace-only input yields an
/// expression with no clauses, which evaluates to `true`.
pub fn parse_condition(input: &str) -> Result<ConditionExpr, TrellisError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(ConditionExpr { clauses: Vec::new() });
    }

    let mut clauses = Vec::new();
    for part in trimmed.split("&&") {
        clauses.push(parse_clause(part.trim())?);
    }
    Ok(ConditionExpr { clauses })
}

fn parse_clause(input: &str) -> Result<Clause, TrellisError> {
    if input.is_empty() {
        return Err(make_error("empty clause"));
    }

    let (key_end, operator, op_len) = find_operator(input)?;
    let key = input[..key_end].trim().to_string();
    if key.is_empty() {
        return Err(make_error("missing key before operator"));
    }
    for seg in key.split('.') {
        if seg.is_empty() || !seg.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(make_error(&format!("invalid key segment '{seg}'")));
        }
    }

    let raw = input[key_end + op_len..].trim();
    if raw.is_empty() {
        return Err(make_error(&format!("missing value after operator in '{input}'")));
    }

    Ok(Clause {
        key,
        operator,
        value: strip_quotes(raw),
    })
}

fn find_operator(input: &str) -> Result<(usize, Operator, usize), TrellisError> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'!' if bytes.get(i + 1) == Some(&b'=') => return Ok((i, Operator::NotEq, 2)),
            b'=' => return Ok((i, Operator::Eq, 1)),
            _ => i += 1,
        }
    }
    Err(make_error(&format!("no operator in '{input}'")))
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if s.len() >= 2
        && ((bytes[0] == b'"' && bytes[s.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[s.len() - 1] == b'\''))
    {
        return s[1..s.len() - 1].to_string();
    }
    s.to_string()
}

/// Evaluate against a resolver mapping keys to string values. Missing keys
/// must resolve to the empty string.
pub fn evaluate_condition(expr: &ConditionExpr, resolve: &dyn Fn(&str) -> String) -> bool {
    expr.clauses.iter().all(|clause| {
        let actual = resolve(&clause.key);
        match clause.operator {
            Operator::Eq => actual == clause.value,
            Operator::NotEq => actual != clause.value,
        }
    })
}
