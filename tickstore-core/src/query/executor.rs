//! Plan evaluation and materialization
//!
//! One recursive evaluator over the tagged plan tree. Scans derive the
//! intersecting `(year, slot range)` per catalog year from the pushed-down
//! epoch range; an empty range materializes an empty series without any
//! segment reads. Cancellation is checked at every segment-read boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::planner::{Node, QueryPlan};
use super::{AggRegistry, CompareOp, Literal, Predicate};
use crate::catalog::Catalog;
use crate::types::{
    year_start, ColumnSeries, ColumnSeriesMap, ColumnData, RecordKind, TimeRange, EPOCH_COLUMN,
};
use crate::writer::CsmWriter;
use crate::{Result, TickError};

/// Cancellation handle carried by every externally triggered query
#[derive(Clone, Default)]
pub struct QueryContext {
    cancelled: Arc<AtomicBool>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle the frontend keeps to abort the query
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(TickError::Cancelled);
        }
        Ok(())
    }
}

/// Executes query plans against the catalog
pub struct Executor {
    catalog: Arc<Catalog>,
    registry: Arc<AggRegistry>,
    writer: Option<Arc<dyn CsmWriter>>,
}

impl Executor {
    pub fn new(catalog: Arc<Catalog>, registry: Arc<AggRegistry>) -> Self {
        Self {
            catalog,
            registry,
            writer: None,
        }
    }

    /// Attach the writer that `INSERT INTO … SELECT` pipes into
    pub fn with_writer(mut self, writer: Arc<dyn CsmWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Parse, plan, and execute one SQL statement
    pub fn execute_sql(&self, sql: &str, ctx: &QueryContext) -> Result<ColumnSeries> {
        let stmt = super::parse(sql)?;
        let plan = super::plan(&stmt)?;
        self.execute(&plan, ctx)
    }

    pub fn execute(&self, plan: &QueryPlan, ctx: &QueryContext) -> Result<ColumnSeries> {
        self.eval(&plan.root, ctx)
    }

    fn eval(&self, node: &Node, ctx: &QueryContext) -> Result<ColumnSeries> {
        match node {
            Node::Scan { bucket, range } => self.scan(bucket, range, ctx),
            Node::Filter { input, predicates } => {
                let cs = self.eval(input, ctx)?;
                filter_rows(&cs, predicates)
            }
            Node::Project { input, columns } => {
                let cs = self.eval(input, ctx)?;
                let mut names: Vec<String> = Vec::with_capacity(columns.len() + 1);
                // the Epoch column rides along even when not asked for
                if !columns.iter().any(|c| c == EPOCH_COLUMN)
                    && cs.column(EPOCH_COLUMN).is_some()
                {
                    names.push(EPOCH_COLUMN.to_string());
                }
                names.extend(columns.iter().cloned());
                cs.project(&names)
            }
            Node::Aggregate { input, calls } => {
                let cs = self.eval(input, ctx)?;
                let mut output: Option<ColumnSeries> = None;
                for call in calls {
                    let out = self.registry.run_call(call, &cs)?;
                    output = Some(match output {
                        None => out,
                        Some(merged) => merge_aggregate_outputs(merged, out)?,
                    });
                }
                Ok(output.unwrap_or_default())
            }
            Node::Insert { target, input } => {
                let cs = self.eval(input, ctx)?;
                self.insert(target, cs)
            }
            Node::SubSelect { input, limit } => {
                let mut cs = self.eval(input, ctx)?;
                if let Some(limit) = limit {
                    cs.truncate(*limit);
                }
                Ok(cs)
            }
        }
    }

    fn scan(&self, bucket_key: &str, range: &TimeRange, ctx: &QueryContext) -> Result<ColumnSeries> {
        let bucket = self.catalog.resolve(bucket_key)?;
        let view = bucket.read_view();
        let schema = view.schema().clone();
        let mut out = ColumnSeries::from_schema(&schema);
        if range.is_empty() {
            return Ok(out);
        }

        for year in view.years()? {
            let year_range = TimeRange::new(year_start(year), year_start(year + 1) - 1);
            if range.intersect(&year_range).is_empty() {
                continue;
            }
            ctx.check()?;
            let segment = view.get_or_open_year(year)?;
            let batch = match segment.record_kind() {
                RecordKind::Fixed => {
                    let Some((lo, hi)) = segment.slots_for_range(range) else {
                        continue;
                    };
                    let bytes = segment.read_slot_range(lo, hi)?;
                    ColumnSeries::decode_records(&schema, &bytes, true)?
                }
                RecordKind::Variable => {
                    let bytes = segment.read_variable_range(range)?;
                    ColumnSeries::decode_records(&schema, &bytes, false)?
                }
            };
            out.append(&batch)?;
        }

        // slot granularity can over-capture at the edges
        let keep: Vec<usize> = out
            .epochs()
            .iter()
            .enumerate()
            .filter(|(_, &e)| range.contains(e))
            .map(|(i, _)| i)
            .collect();
        if keep.len() != out.len() {
            out = out.take(&keep);
        }
        Ok(out)
    }

    fn insert(&self, target: &str, cs: ColumnSeries) -> Result<ColumnSeries> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| TickError::Internal("no writer attached to this executor".into()))?;
        let first_epoch = cs.epochs().first().copied().unwrap_or(0);
        let records = cs.len() as i64;
        if records > 0 {
            let mut csm = ColumnSeriesMap::new();
            csm.insert(target, cs);
            let response = writer.write_csm(&csm)?;
            if let Some(error) = response.first_error() {
                return Err(TickError::Rejected(error.to_string()));
            }
        }
        Ok(ColumnSeries::new()
            .with_column(EPOCH_COLUMN, ColumnData::Int64(vec![first_epoch]))
            .with_column("RecordsWritten", ColumnData::Int64(vec![records])))
    }
}

fn filter_rows(cs: &ColumnSeries, predicates: &[Predicate]) -> Result<ColumnSeries> {
    let mut keep = Vec::with_capacity(cs.len());
    for row in 0..cs.len() {
        let mut pass = true;
        for pred in predicates {
            if !eval_predicate(pred, cs, row)? {
                pass = false;
                break;
            }
        }
        if pass {
            keep.push(row);
        }
    }
    Ok(cs.take(&keep))
}

fn literal_target(column: &str, value: &Literal) -> Result<f64> {
    let target = if column == EPOCH_COLUMN {
        value.as_epoch().map(|e| e as f64)
    } else {
        value.as_f64()
    };
    target.ok_or_else(|| {
        TickError::InvalidQuery(format!(
            "literal {:?} is not comparable with column {}",
            value, column
        ))
    })
}

fn eval_predicate(pred: &Predicate, cs: &ColumnSeries, row: usize) -> Result<bool> {
    match pred {
        Predicate::Compare { column, op, value } => {
            let data = cs
                .column(column)
                .ok_or_else(|| TickError::InvalidQuery(format!("unknown column: {}", column)))?;
            let target = literal_target(column, value)?;
            let Some(v) = data.f64_at(row) else {
                return Ok(false);
            };
            Ok(match op {
                CompareOp::Eq => v == target,
                CompareOp::Ne => v != target,
                CompareOp::Lt => v < target,
                CompareOp::Le => v <= target,
                CompareOp::Gt => v > target,
                CompareOp::Ge => v >= target,
            })
        }
        Predicate::Between { column, low, high } => {
            let data = cs
                .column(column)
                .ok_or_else(|| TickError::InvalidQuery(format!("unknown column: {}", column)))?;
            let lo = literal_target(column, low)?;
            let hi = literal_target(column, high)?;
            let Some(v) = data.f64_at(row) else {
                return Ok(false);
            };
            Ok(v >= lo && v <= hi)
        }
        Predicate::And(left, right) => {
            Ok(eval_predicate(left, cs, row)? && eval_predicate(right, cs, row)?)
        }
        Predicate::Or(left, right) => {
            Ok(eval_predicate(left, cs, row)? || eval_predicate(right, cs, row)?)
        }
    }
}

fn merge_aggregate_outputs(mut acc: ColumnSeries, other: ColumnSeries) -> Result<ColumnSeries> {
    if acc.len() != other.len() {
        return Err(TickError::InvalidQuery(
            "aggregate outputs disagree on row count".into(),
        ));
    }
    for (name, data) in other.columns() {
        if acc.column(name).is_none() {
            acc.add_column(name.clone(), data.clone());
        }
    }
    Ok(acc)
}
