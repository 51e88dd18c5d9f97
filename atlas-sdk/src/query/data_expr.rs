//! The data-expression layer on top of the boolean query grammar: the
//! aggregate and group-by/rollup tokens (`:all`, `:sum`, `:min`, `:max`,
//! `:count`, `:by`, `:rollup-drop`, `:rollup-keep`) that turn a bare
//! [`Query`](super::Query) into the `(query, aggregateFunction,
//! groupByKeys?, rollupDrop/keep?)` triple a subscription's expression
//! compiles to.
//!
//! Layered on [`super::parser::run`] rather than duplicating the stack
//! machine: every non-data token is handled by
//! [`super::parser::apply_query_operator`] first, and only the data ops
//! below are new.

use std::sync::Arc;

use atlas_core::AtlasError;

use super::ast::Query;
use super::parser::{apply_query_operator, err, pop_data, pop_list, pop_query, run, StackItem};

/// How a [`DataExpr`]'s matched values are combined into one result per
/// evaluation tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateFunction {
    Sum,
    Min,
    Max,
    Count,
    /// `:all`, no aggregation, every matched id's value is emitted
    /// individually (tagged by its own id).
    All,
}

/// The optional dimension-shaping suffix applied after aggregation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Grouping {
    /// No `:by`/`:rollup-*` suffix: a single aggregate over every match.
    None,
    /// `:by (keys)`, one aggregate per distinct combination of `keys`.
    By(Vec<Arc<str>>),
    /// `:rollup-drop (keys)`, group by every id dimension except `keys`.
    RollupDrop(Vec<Arc<str>>),
    /// `:rollup-keep (keys)`, group by only `keys`, dropping the rest.
    RollupKeep(Vec<Arc<str>>),
}

/// The parsed form of a subscription's expression: the predicate that
/// selects matching ids, how to aggregate their values, and how to shape
/// the resulting tag set.
#[derive(Clone, Debug)]
pub struct DataExpr {
    pub query: Query,
    pub aggregate: AggregateFunction,
    pub grouping: Grouping,
}

impl DataExpr {
    /// The keys the evaluator should look at when aggregating: `By`/
    /// `RollupKeep` name them directly; `RollupDrop` and `None` carry no
    /// fixed grouping key set (a drop computes the keep-set per id).
    pub fn group_by_keys(&self) -> Option<&[Arc<str>]> {
        match &self.grouping {
            Grouping::By(keys) | Grouping::RollupKeep(keys) => Some(keys),
            Grouping::RollupDrop(_) | Grouping::None => None,
        }
    }
}

pub(crate) fn apply_data_operator(op: &str, stack: &mut Vec<StackItem>) -> Result<bool, AtlasError> {
    if apply_query_operator(op, stack)? {
        return Ok(true);
    }
    match op {
        ":all" => {
            let query = pop_query(stack, op)?;
            stack.push(StackItem::Data(DataExpr {
                query,
                aggregate: AggregateFunction::All,
                grouping: Grouping::None,
            }));
        }
        ":sum" => push_aggregate(stack, op, AggregateFunction::Sum)?,
        ":min" => push_aggregate(stack, op, AggregateFunction::Min)?,
        ":max" => push_aggregate(stack, op, AggregateFunction::Max)?,
        ":count" => push_aggregate(stack, op, AggregateFunction::Count)?,
        ":by" => {
            let keys = pop_list(stack, op)?;
            let mut data = pop_data(stack, op)?;
            data.grouping = Grouping::By(keys);
            stack.push(StackItem::Data(data));
        }
        ":rollup-drop" => {
            let keys = pop_list(stack, op)?;
            let mut data = pop_data(stack, op)?;
            data.grouping = Grouping::RollupDrop(keys);
            stack.push(StackItem::Data(data));
        }
        ":rollup-keep" => {
            let keys = pop_list(stack, op)?;
            let mut data = pop_data(stack, op)?;
            data.grouping = Grouping::RollupKeep(keys);
            stack.push(StackItem::Data(data));
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn push_aggregate(
    stack: &mut Vec<StackItem>,
    op: &str,
    aggregate: AggregateFunction,
) -> Result<(), AtlasError> {
    let query = pop_query(stack, op)?;
    stack.push(StackItem::Data(DataExpr {
        query,
        aggregate,
        grouping: Grouping::None,
    }));
    Ok(())
}

/// Parses a full subscription expression (boolean query plus an aggregate
/// and optional group-by/rollup suffix) into a [`DataExpr`].
pub fn parse_data_expr(expr: &str) -> Result<DataExpr, AtlasError> {
    let mut stack = run(expr, apply_data_operator)?;
    if stack.len() != 1 {
        return Err(err(format!(
            "expression left {} items on the stack, expected exactly 1",
            stack.len()
        )));
    }
    match stack.pop() {
        Some(StackItem::Data(d)) => Ok(d),
        Some(_) => Err(err("expression did not reduce to a data expression")),
        None => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sum_aggregate_with_no_grouping() {
        let expr = parse_data_expr("name,cpu,:eq,:sum").unwrap();
        assert_eq!(expr.aggregate, AggregateFunction::Sum);
        assert_eq!(expr.grouping, Grouping::None);
    }

    #[test]
    fn parses_sum_with_group_by_keys() {
        let expr = parse_data_expr("name,cpu,:eq,:sum,(,nf.cluster,),:by").unwrap();
        assert_eq!(expr.aggregate, AggregateFunction::Sum);
        match &expr.grouping {
            Grouping::By(keys) => assert_eq!(keys.iter().map(|k| &**k).collect::<Vec<_>>(), vec!["nf.cluster"]),
            other => panic!("unexpected grouping {other:?}"),
        }
    }

    #[test]
    fn parses_rollup_keep() {
        let expr = parse_data_expr("name,cpu,:eq,:max,(,nf.cluster,nf.asg,),:rollup-keep").unwrap();
        assert_eq!(expr.aggregate, AggregateFunction::Max);
        assert!(matches!(expr.grouping, Grouping::RollupKeep(_)));
    }

    #[test]
    fn rejects_an_aggregate_without_a_preceding_query() {
        assert!(parse_data_expr(":sum").is_err());
    }
}
