//! The postfix (stack-based) query expression parser.
//!
//! The grammar is a flat, comma-separated token stream evaluated against an
//! explicit stack, no recursive descent, no operator precedence to get
//! wrong. `(` pushes a list marker, `)` pops back to it collecting a value
//! list, anything starting with `:` is an operator that pops its operands
//! and pushes a result, and everything else is a string literal pushed
//! as-is. `subscribe::parse_data_expr` reuses [`apply_query_operator`] so
//! the query grammar stays in one place even though a subscription
//! expression layers aggregate/group-by/rollup tokens on top of it.

use std::sync::Arc;

use atlas_core::AtlasError;
use regex::{Regex, RegexBuilder};

use super::ast::{Leaf, Query};
use super::data_expr::DataExpr;

#[derive(Debug)]
pub(crate) enum StackItem {
    ListStart,
    Str(Arc<str>),
    List(Vec<Arc<str>>),
    Query(Query),
    /// Only ever pushed/popped by `data_expr::apply_data_operator`; kept
    /// on the same stack as `Query` so a subscription expression can mix
    /// boolean-query and aggregate/group-by tokens in one token stream.
    Data(DataExpr),
}

pub(crate) fn tokenize(expr: &str) -> Vec<&str> {
    expr.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()).collect()
}

pub(crate) fn err(msg: impl Into<String>) -> AtlasError {
    AtlasError::InvalidQuery(msg.into())
}

pub(crate) fn pop_str(stack: &mut Vec<StackItem>, op: &str) -> Result<Arc<str>, AtlasError> {
    match stack.pop() {
        Some(StackItem::Str(s)) => Ok(s),
        Some(_) => Err(err(format!("{op}: expected a string operand"))),
        None => Err(err(format!("{op}: stack underflow"))),
    }
}

pub(crate) fn pop_list(stack: &mut Vec<StackItem>, op: &str) -> Result<Vec<Arc<str>>, AtlasError> {
    match stack.pop() {
        Some(StackItem::List(l)) => Ok(l),
        Some(_) => Err(err(format!("{op}: expected a value list operand"))),
        None => Err(err(format!("{op}: stack underflow"))),
    }
}

pub(crate) fn pop_query(stack: &mut Vec<StackItem>, op: &str) -> Result<Query, AtlasError> {
    match stack.pop() {
        Some(StackItem::Query(q)) => Ok(q),
        Some(_) => Err(err(format!("{op}: expected a query operand"))),
        None => Err(err(format!("{op}: stack underflow"))),
    }
}

pub(crate) fn pop_data(stack: &mut Vec<StackItem>, op: &str) -> Result<DataExpr, AtlasError> {
    match stack.pop() {
        Some(StackItem::Data(d)) => Ok(d),
        Some(_) => Err(err(format!("{op}: expected a data expression operand"))),
        None => Err(err(format!("{op}: stack underflow"))),
    }
}

fn compile_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, AtlasError> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| err(format!("invalid regex /{pattern}/: {e}")))
}

fn regex_leaf(key: Arc<str>, pattern: String, case_insensitive: bool) -> Result<Query, AtlasError> {
    let compiled = compile_regex(&pattern, case_insensitive)?;
    Ok(Query::Leaf(Leaf::Regex {
        key,
        pattern: pattern.into(),
        case_insensitive,
        compiled: Arc::new(compiled),
    }))
}

/// Processes `)` by popping back to the matching `(`, in push order.
fn close_list(stack: &mut Vec<StackItem>) -> Result<(), AtlasError> {
    let mut values = Vec::new();
    loop {
        match stack.pop() {
            Some(StackItem::ListStart) => break,
            Some(StackItem::Str(s)) => values.push(s),
            Some(_) => return Err(err("list may only contain string literals")),
            None => return Err(err("unmatched ')'")),
        }
    }
    values.reverse();
    stack.push(StackItem::List(values));
    Ok(())
}

/// Applies one of the boolean-query operators (`:eq`, `:has`, `:in`,
/// `:lt`, `:le`, `:gt`, `:ge`, `:re`, `:reic`, `:contains`, `:starts`,
/// `:ends`, `:true`, `:false`, `:not`, `:and`, `:or`) to `stack`. Returns
/// `Ok(true)` if `op` was recognized and applied, `Ok(false)` if `op` is
/// not one of these (so the caller can try its own operator set), or an
/// error if it was recognized but malformed.
pub(crate) fn apply_query_operator(op: &str, stack: &mut Vec<StackItem>) -> Result<bool, AtlasError> {
    match op {
        ":eq" => {
            let v = pop_str(stack, op)?;
            let k = pop_str(stack, op)?;
            stack.push(StackItem::Query(Query::Leaf(Leaf::Equal(k, v))));
        }
        ":has" => {
            let k = pop_str(stack, op)?;
            stack.push(StackItem::Query(Query::Leaf(Leaf::Has(k))));
        }
        ":in" => {
            let values = pop_list(stack, op)?;
            let k = pop_str(stack, op)?;
            stack.push(StackItem::Query(Query::Leaf(Leaf::In(k, values.into()))));
        }
        ":lt" => {
            let v = pop_str(stack, op)?;
            let k = pop_str(stack, op)?;
            stack.push(StackItem::Query(Query::Leaf(Leaf::LessThan(k, v))));
        }
        ":le" => {
            let v = pop_str(stack, op)?;
            let k = pop_str(stack, op)?;
            stack.push(StackItem::Query(Query::Leaf(Leaf::LessThanEqual(k, v))));
        }
        ":gt" => {
            let v = pop_str(stack, op)?;
            let k = pop_str(stack, op)?;
            stack.push(StackItem::Query(Query::Leaf(Leaf::GreaterThan(k, v))));
        }
        ":ge" => {
            let v = pop_str(stack, op)?;
            let k = pop_str(stack, op)?;
            stack.push(StackItem::Query(Query::Leaf(Leaf::GreaterThanEqual(k, v))));
        }
        ":re" => {
            let pattern = pop_str(stack, op)?;
            let k = pop_str(stack, op)?;
            stack.push(StackItem::Query(regex_leaf(k, pattern.to_string(), false)?));
        }
        ":reic" => {
            let pattern = pop_str(stack, op)?;
            let k = pop_str(stack, op)?;
            stack.push(StackItem::Query(regex_leaf(k, pattern.to_string(), true)?));
        }
        ":contains" => {
            let substr = pop_str(stack, op)?;
            let k = pop_str(stack, op)?;
            stack.push(StackItem::Query(regex_leaf(k, regex::escape(&substr), false)?));
        }
        ":starts" => {
            let prefix = pop_str(stack, op)?;
            let k = pop_str(stack, op)?;
            stack.push(StackItem::Query(regex_leaf(
                k,
                format!("^{}", regex::escape(&prefix)),
                false,
            )?));
        }
        ":ends" => {
            let suffix = pop_str(stack, op)?;
            let k = pop_str(stack, op)?;
            stack.push(StackItem::Query(regex_leaf(
                k,
                format!("{}$", regex::escape(&suffix)),
                false,
            )?));
        }
        ":true" => stack.push(StackItem::Query(Query::True)),
        ":false" => stack.push(StackItem::Query(Query::False)),
        ":not" => {
            let q = pop_query(stack, op)?;
            stack.push(StackItem::Query(Query::Not(Box::new(q))));
        }
        ":and" => {
            let b = pop_query(stack, op)?;
            let a = pop_query(stack, op)?;
            stack.push(StackItem::Query(Query::And(Box::new(a), Box::new(b))));
        }
        ":or" => {
            let b = pop_query(stack, op)?;
            let a = pop_query(stack, op)?;
            stack.push(StackItem::Query(Query::Or(Box::new(a), Box::new(b))));
        }
        _ => return Ok(false),
    }
    Ok(true)
}

/// Runs the shared stack machine over `expr`, calling `extra` for any
/// `:`-prefixed token `apply_query_operator` doesn't recognize (used by
/// `subscribe::parse_data_expr` to layer aggregate/group-by/rollup
/// operators on top of the same token stream).
pub(crate) fn run(
    expr: &str,
    mut extra: impl FnMut(&str, &mut Vec<StackItem>) -> Result<bool, AtlasError>,
) -> Result<Vec<StackItem>, AtlasError> {
    let mut stack = Vec::new();
    for token in tokenize(expr) {
        if token == "(" {
            stack.push(StackItem::ListStart);
        } else if token == ")" {
            close_list(&mut stack)?;
        } else if token.starts_with(':') {
            if apply_query_operator(token, &mut stack)? {
                continue;
            }
            if extra(token, &mut stack)? {
                continue;
            }
            return Err(err(format!("unknown operator {token}")));
        } else {
            stack.push(StackItem::Str(token.into()));
        }
    }
    Ok(stack)
}

/// Parses a pure boolean query expression (no aggregate/group-by/rollup
/// suffix) into a [`Query`]. Fails on an unmatched `)`, an unknown word,
/// or a non-singleton residual stack.
pub fn parse_query(expr: &str) -> Result<Query, AtlasError> {
    let mut stack = run(expr, |_, _| Ok(false))?;
    if stack.len() != 1 {
        return Err(err(format!(
            "expression left {} items on the stack, expected exactly 1",
            stack.len()
        )));
    }
    match stack.pop() {
        Some(StackItem::Query(q)) => Ok(q),
        Some(_) => Err(err("expression did not reduce to a query")),
        None => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_equality() {
        let q = parse_query("name,foo,:eq").unwrap();
        assert!(matches!(q, Query::Leaf(Leaf::Equal(_, _))));
    }

    #[test]
    fn parses_and_of_two_equalities() {
        let q = parse_query("name,foo,:eq,app,bar,:eq,:and").unwrap();
        assert!(matches!(q, Query::And(_, _)));
    }

    #[test]
    fn parses_in_list() {
        let q = parse_query("name,(,a,b,c,),:in").unwrap();
        match q {
            Query::Leaf(Leaf::In(k, values)) => {
                assert_eq!(&*k, "name");
                assert_eq!(values.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_unmatched_close_paren() {
        assert!(parse_query("name,foo,:eq,)").is_err());
    }

    #[test]
    fn rejects_unknown_operator() {
        assert!(parse_query("name,foo,:bogus").is_err());
    }

    #[test]
    fn rejects_non_empty_residual_stack() {
        assert!(parse_query("name,foo,:eq,app,bar").is_err());
    }

    #[test]
    fn contains_compiles_to_unanchored_escaped_regex() {
        let q = parse_query("host,a.b,:contains").unwrap();
        let id = atlas_core::Id::new("x", [("host", "xxa.bxx")]);
        assert!(q.matches(&id));
        let id2 = atlas_core::Id::new("x", [("host", "xxaXbxx")]);
        assert!(!q.matches(&id2));
    }
}
