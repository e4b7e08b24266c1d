//! Query engine
//!
//! Pipeline: `parse → QueryStatement → plan (tagged Node tree) →
//! execute(catalog, aggregator registry) → ColumnSeries`.

pub mod aggregates;
pub mod executor;
pub mod parser;
pub mod planner;

pub use aggregates::{AggRegistry, Aggregator, AggregatorFactory};
pub use executor::{Executor, QueryContext};
pub use parser::{parse, parse_time_literal};
pub use planner::{plan, Node, QueryPlan};

use crate::types::Epoch;

/// Parsed top-level statement
#[derive(Debug, Clone, PartialEq)]
pub enum QueryStatement {
    Select(SelectStatement),
    /// `INSERT INTO '<bucket>' SELECT …` pipes the select result into the
    /// writer as a single transaction
    Insert {
        target: String,
        source: SelectStatement,
    },
}

/// Parsed SELECT
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub projection: Vec<ProjectionItem>,
    pub source: Source,
    pub predicate: Option<Predicate>,
    pub limit: Option<usize>,
}

/// FROM clause: a quoted bucket key or a nested select
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Bucket(String),
    Subquery(Box<SelectStatement>),
}

/// One projection list entry
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionItem {
    /// `*` expands to schema order
    Wildcard,
    Column(String),
    /// Aggregate call, e.g. `TickCandler('5Min', Open)` or `count(*)`
    Call(FunctionCall),
}

/// An aggregate invocation from the projection list
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<FuncArg>,
}

impl FunctionCall {
    /// Column-name arguments, in order
    pub fn column_args(&self) -> Vec<&str> {
        self.args
            .iter()
            .filter_map(|a| match a {
                FuncArg::Column(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// First literal argument (the window of windowed aggregates)
    pub fn literal_arg(&self) -> Option<&Literal> {
        self.args.iter().find_map(|a| match a {
            FuncArg::Literal(lit) => Some(lit),
            _ => None,
        })
    }
}

/// Aggregate call argument
#[derive(Debug, Clone, PartialEq)]
pub enum FuncArg {
    Wildcard,
    Column(String),
    Literal(Literal),
}

/// SQL literal
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Literal {
    /// Numeric view; comparisons against float columns widen to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Int(v) => Some(*v as f64),
            Literal::Float(v) => Some(*v),
            Literal::Str(_) => None,
        }
    }

    /// Epoch view: bare integers are seconds since epoch, strings accept
    /// the supported timestamp formats
    pub fn as_epoch(&self) -> Option<Epoch> {
        match self {
            Literal::Int(v) => Some(*v),
            Literal::Float(v) => Some(*v as Epoch),
            Literal::Str(s) => parse_time_literal(s),
        }
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn flip(self) -> CompareOp {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            other => other,
        }
    }
}

/// WHERE clause expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        column: String,
        op: CompareOp,
        value: Literal,
    },
    Between {
        column: String,
        low: Literal,
        high: Literal,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}
