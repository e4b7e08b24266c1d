//! Query planner
//!
//! Lowers a parsed statement into the tagged plan tree
//! `Scan | Filter | Project | Aggregate | Insert | SubSelect`, evaluated by
//! one recursive evaluator in the executor.
//!
//! Epoch predicates on the AND-spine of the WHERE clause are normalized to
//! a closed `[lo, hi]` second range and pushed into the scan. Open
//! intervals convert with ±1s at second granularity: strict bounds shift by
//! one second, and `BETWEEN a AND b` denotes the open interval `(a, b)`.
//! Everything else stays behind as a residual row-wise filter. A
//! contradiction (`lo > hi`) makes the scan range empty, which the
//! executor answers without any segment reads.

use super::{
    CompareOp, FunctionCall, Predicate, ProjectionItem, QueryStatement, SelectStatement, Source,
};
use crate::types::TimeRange;
use crate::{Result, TickError};

/// Plan tree node
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Read a bucket over a pushed-down epoch range
    Scan { bucket: String, range: TimeRange },
    /// Row-wise residual predicates (AND of the list)
    Filter {
        input: Box<Node>,
        predicates: Vec<Predicate>,
    },
    /// Column selection/reordering; `SELECT *` emits no Project node
    Project {
        input: Box<Node>,
        columns: Vec<String>,
    },
    /// Aggregate calls over the projected series
    Aggregate {
        input: Box<Node>,
        calls: Vec<FunctionCall>,
    },
    /// Pipe the input series into the writer as one transaction
    Insert { target: String, input: Box<Node> },
    /// A completed (sub-)select, with its LIMIT
    SubSelect {
        input: Box<Node>,
        limit: Option<usize>,
    },
}

/// An executable plan
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub root: Node,
}

/// Build the plan tree for a statement
pub fn plan(stmt: &QueryStatement) -> Result<QueryPlan> {
    let root = match stmt {
        QueryStatement::Select(sel) => plan_select(sel)?,
        QueryStatement::Insert { target, source } => Node::Insert {
            target: target.clone(),
            input: Box::new(plan_select(source)?),
        },
    };
    Ok(QueryPlan { root })
}

fn plan_select(sel: &SelectStatement) -> Result<Node> {
    let mut node = match &sel.source {
        Source::Bucket(key) => {
            let (range, residual) = split_predicate(sel.predicate.as_ref())?;
            let scan = Node::Scan {
                bucket: key.clone(),
                range,
            };
            wrap_filter(scan, residual)
        }
        Source::Subquery(sub) => {
            // the inner select materializes first; the outer predicate runs
            // entirely as a residual filter
            let inner = plan_select(sub)?;
            let residual: Vec<Predicate> = sel.predicate.clone().into_iter().collect();
            wrap_filter(inner, residual)
        }
    };

    let mut columns = Vec::new();
    let mut calls = Vec::new();
    let mut wildcard = false;
    for item in &sel.projection {
        match item {
            ProjectionItem::Wildcard => wildcard = true,
            ProjectionItem::Column(name) => columns.push(name.clone()),
            ProjectionItem::Call(call) => calls.push(call.clone()),
        }
    }
    if !calls.is_empty() && (wildcard || !columns.is_empty()) {
        return Err(TickError::InvalidQuery(
            "aggregates cannot be mixed with plain columns in a projection".into(),
        ));
    }

    if !calls.is_empty() {
        node = Node::Aggregate {
            input: Box::new(node),
            calls,
        };
    } else if !wildcard && !columns.is_empty() {
        node = Node::Project {
            input: Box::new(node),
            columns,
        };
    }

    Ok(Node::SubSelect {
        input: Box::new(node),
        limit: sel.limit,
    })
}

fn wrap_filter(input: Node, residual: Vec<Predicate>) -> Node {
    if residual.is_empty() {
        input
    } else {
        Node::Filter {
            input: Box::new(input),
            predicates: residual,
        }
    }
}

/// Split the WHERE clause into a pushed-down epoch range and residual
/// predicates. Only the AND-spine is inspected; OR subtrees stay residual.
fn split_predicate(pred: Option<&Predicate>) -> Result<(TimeRange, Vec<Predicate>)> {
    let mut range = TimeRange::all();
    let mut residual = Vec::new();
    if let Some(pred) = pred {
        narrow(pred, &mut range, &mut residual)?;
    }
    Ok((range, residual))
}

fn narrow(pred: &Predicate, range: &mut TimeRange, residual: &mut Vec<Predicate>) -> Result<()> {
    match pred {
        Predicate::And(left, right) => {
            narrow(left, range, residual)?;
            narrow(right, range, residual)?;
        }
        Predicate::Compare { column, op, value } if column == "Epoch" => {
            let epoch = value.as_epoch().ok_or_else(|| {
                TickError::InvalidQuery(format!("bad Epoch literal in comparison: {:?}", value))
            })?;
            match op {
                CompareOp::Eq => {
                    range.start = range.start.max(epoch);
                    range.end = range.end.min(epoch);
                }
                CompareOp::Gt => range.start = range.start.max(epoch + 1),
                CompareOp::Ge => range.start = range.start.max(epoch),
                CompareOp::Lt => range.end = range.end.min(epoch - 1),
                CompareOp::Le => range.end = range.end.min(epoch),
                CompareOp::Ne => residual.push(pred.clone()),
            }
        }
        Predicate::Between { column, low, high } if column == "Epoch" => {
            let lo = low.as_epoch().ok_or_else(|| {
                TickError::InvalidQuery(format!("bad Epoch literal in BETWEEN: {:?}", low))
            })?;
            let hi = high.as_epoch().ok_or_else(|| {
                TickError::InvalidQuery(format!("bad Epoch literal in BETWEEN: {:?}", high))
            })?;
            range.start = range.start.max(lo + 1);
            range.end = range.end.min(hi - 1);
        }
        other => residual.push(other.clone()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse;

    fn planned(sql: &str) -> QueryPlan {
        plan(&parse(sql).unwrap()).unwrap()
    }

    fn scan_range(node: &Node) -> Option<TimeRange> {
        match node {
            Node::Scan { range, .. } => Some(*range),
            Node::Filter { input, .. }
            | Node::Project { input, .. }
            | Node::Aggregate { input, .. }
            | Node::Insert { input, .. }
            | Node::SubSelect { input, .. } => scan_range(input),
        }
    }

    #[test]
    fn test_between_pushdown() {
        let plan = planned(
            "SELECT Epoch FROM 'AAPL/1Min/OHLCV' \
             WHERE Epoch BETWEEN '2000-01-05-12:30' AND '2000-01-05-13:00'",
        );
        assert_eq!(
            scan_range(&plan.root).unwrap(),
            TimeRange::new(947075401, 947077199)
        );
    }

    #[test]
    fn test_strict_bounds_shift_one_second() {
        let plan = planned(
            "SELECT Epoch FROM 'AAPL/1Min/OHLCV' \
             WHERE Epoch > '2000-01-05-12:30' AND Epoch < '2000-01-05-13:00'",
        );
        assert_eq!(
            scan_range(&plan.root).unwrap(),
            TimeRange::new(947075401, 947077199)
        );
    }

    #[test]
    fn test_impossible_range_is_empty() {
        let plan = planned(
            "SELECT Epoch FROM 'AAPL/1Min/OHLCV' \
             WHERE Epoch < '2000-01-05-12:30' AND Epoch > '2000-01-05-13:00'",
        );
        assert!(scan_range(&plan.root).unwrap().is_empty());
    }

    #[test]
    fn test_residual_predicate_stays_behind() {
        let plan = planned(
            "SELECT Epoch FROM 'AAPL/1Min/OHLCV' \
             WHERE Open > 10.234 AND Epoch > '2000-01-05-12:30'",
        );
        let Node::SubSelect { input, .. } = &plan.root else {
            panic!("expected subselect wrapper")
        };
        let Node::Project { input, .. } = input.as_ref() else {
            panic!("expected project")
        };
        let Node::Filter { predicates, .. } = input.as_ref() else {
            panic!("expected filter, got {:?}", input)
        };
        assert_eq!(predicates.len(), 1);
        assert_eq!(
            scan_range(&plan.root).unwrap().start,
            947075401
        );
    }

    #[test]
    fn test_aggregate_plan_shape() {
        let plan = planned("SELECT count(*) FROM 'AAPL/1Min/OHLCV'");
        let Node::SubSelect { input, .. } = &plan.root else {
            panic!("expected subselect wrapper")
        };
        assert!(matches!(input.as_ref(), Node::Aggregate { .. }));
    }

    #[test]
    fn test_insert_plan_shape() {
        let plan = planned("INSERT INTO 'AAPL/5Min/OHLCV' SELECT * FROM 'AAPL/1Min/OHLCV'");
        assert!(matches!(plan.root, Node::Insert { ref target, .. } if target == "AAPL/5Min/OHLCV"));
    }

    #[test]
    fn test_mixed_projection_rejected() {
        let stmt = parse("SELECT Open, count(*) FROM 'AAPL/1Min/OHLCV'").unwrap();
        assert!(plan(&stmt).is_err());
    }
}
