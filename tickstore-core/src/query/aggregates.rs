//! Aggregator registry and built-in functions
//!
//! The registry is keyed by lowercase function name and populated once at
//! startup; lookups after that are read-only. Each factory declares its
//! argument shape, binds the call's column arguments against the input
//! series, and hands back a stateful [`Aggregator`] that may be fed
//! repeatedly (`accum`) before producing its output series.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{FuncArg, FunctionCall};
use crate::types::{ColumnData, ColumnSeries, Epoch, Timeframe, EPOCH_COLUMN};
use crate::{Result, TickError};

/// Declared argument of an aggregate function
#[derive(Debug, Clone, Copy)]
pub struct ArgSpec {
    pub name: &'static str,
    pub required: bool,
}

/// A stateful aggregation run
pub trait Aggregator: Send {
    /// Fold another batch of input rows
    fn accum(&mut self, cs: &ColumnSeries) -> Result<()>;

    /// Produce the final output series
    fn output(&mut self) -> Result<ColumnSeries>;
}

/// Factory for one named aggregate function
pub trait AggregatorFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn arg_specs(&self) -> &'static [ArgSpec];

    /// Bind the call's arguments and return a fresh aggregator. Fails on
    /// arity or type mismatch.
    fn create(&self, call: &FunctionCall) -> Result<Box<dyn Aggregator>>;
}

/// Registry of aggregate functions, keyed by lowercase name
#[derive(Default)]
pub struct AggRegistry {
    funcs: HashMap<String, Arc<dyn AggregatorFactory>>,
}

impl AggRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-ins
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CountFactory));
        registry.register(Arc::new(StatFactory { kind: Stat::Min }));
        registry.register(Arc::new(StatFactory { kind: Stat::Max }));
        registry.register(Arc::new(StatFactory { kind: Stat::Sum }));
        registry.register(Arc::new(StatFactory { kind: Stat::Avg }));
        registry.register(Arc::new(TickCandlerFactory));
        registry
    }

    /// Registration happens at startup only
    pub fn register(&mut self, factory: Arc<dyn AggregatorFactory>) {
        self.funcs.insert(factory.name().to_lowercase(), factory);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AggregatorFactory>> {
        self.funcs.get(&name.to_lowercase()).cloned()
    }

    /// Bind, run, and materialize one call over an input series
    pub fn run_call(&self, call: &FunctionCall, input: &ColumnSeries) -> Result<ColumnSeries> {
        let factory = self.get(&call.name).ok_or_else(|| {
            TickError::InvalidQuery(format!("unknown aggregate function: {}", call.name))
        })?;
        for column in call.column_args() {
            if input.column(column).is_none() {
                return Err(TickError::InvalidQuery(format!(
                    "{}: unknown column {}",
                    call.name, column
                )));
            }
        }
        let mut aggregator = factory.create(call)?;
        aggregator.accum(input)?;
        aggregator.output()
    }
}

fn single_column_arg(call: &FunctionCall) -> Result<String> {
    match call.args.as_slice() {
        [FuncArg::Column(name)] => Ok(name.clone()),
        _ => Err(TickError::InvalidQuery(format!(
            "{} takes exactly one column argument",
            call.name
        ))),
    }
}

fn numeric_column<'a>(cs: &'a ColumnSeries, name: &str, func: &str) -> Result<&'a ColumnData> {
    let data = cs
        .column(name)
        .ok_or_else(|| TickError::InvalidQuery(format!("{}: unknown column {}", func, name)))?;
    if !data.element_type().is_numeric() {
        return Err(TickError::InvalidQuery(format!(
            "{}: column {} is not numeric",
            func, name
        )));
    }
    Ok(data)
}

fn first_epoch(cs: &ColumnSeries) -> Epoch {
    cs.epochs().first().copied().unwrap_or(0)
}

// ============================================================================
// count(*)
// ============================================================================

struct CountFactory;

impl AggregatorFactory for CountFactory {
    fn name(&self) -> &'static str {
        "count"
    }

    fn arg_specs(&self) -> &'static [ArgSpec] {
        &[ArgSpec {
            name: "column",
            required: false,
        }]
    }

    fn create(&self, call: &FunctionCall) -> Result<Box<dyn Aggregator>> {
        match call.args.as_slice() {
            [] | [FuncArg::Wildcard] | [FuncArg::Column(_)] => {}
            _ => {
                return Err(TickError::InvalidQuery(
                    "count takes * or one column".into(),
                ))
            }
        }
        Ok(Box::new(CountAggregator { count: 0, epoch: 0 }))
    }
}

struct CountAggregator {
    count: u64,
    epoch: Epoch,
}

impl Aggregator for CountAggregator {
    fn accum(&mut self, cs: &ColumnSeries) -> Result<()> {
        if self.count == 0 {
            self.epoch = first_epoch(cs);
        }
        self.count += cs.len() as u64;
        Ok(())
    }

    fn output(&mut self) -> Result<ColumnSeries> {
        Ok(ColumnSeries::new()
            .with_column(EPOCH_COLUMN, ColumnData::Int64(vec![self.epoch]))
            .with_column("Count", ColumnData::Int64(vec![self.count as i64])))
    }
}

// ============================================================================
// min / max / sum / avg
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stat {
    Min,
    Max,
    Sum,
    Avg,
}

impl Stat {
    fn name(&self) -> &'static str {
        match self {
            Stat::Min => "min",
            Stat::Max => "max",
            Stat::Sum => "sum",
            Stat::Avg => "avg",
        }
    }

    fn output_column(&self) -> &'static str {
        match self {
            Stat::Min => "Min",
            Stat::Max => "Max",
            Stat::Sum => "Sum",
            Stat::Avg => "Avg",
        }
    }
}

struct StatFactory {
    kind: Stat,
}

impl AggregatorFactory for StatFactory {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn arg_specs(&self) -> &'static [ArgSpec] {
        &[ArgSpec {
            name: "column",
            required: true,
        }]
    }

    fn create(&self, call: &FunctionCall) -> Result<Box<dyn Aggregator>> {
        Ok(Box::new(StatAggregator {
            kind: self.kind,
            column: single_column_arg(call)?,
            epoch: 0,
            seen: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }))
    }
}

struct StatAggregator {
    kind: Stat,
    column: String,
    epoch: Epoch,
    seen: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Aggregator for StatAggregator {
    fn accum(&mut self, cs: &ColumnSeries) -> Result<()> {
        let data = numeric_column(cs, &self.column, self.kind.name())?;
        if self.seen == 0 {
            self.epoch = first_epoch(cs);
        }
        for row in 0..data.len() {
            let v = data.f64_at(row).unwrap_or(0.0);
            self.sum += v;
            self.min = self.min.min(v);
            self.max = self.max.max(v);
            self.seen += 1;
        }
        Ok(())
    }

    fn output(&mut self) -> Result<ColumnSeries> {
        let value = match self.kind {
            Stat::Sum => self.sum,
            Stat::Min if self.seen > 0 => self.min,
            Stat::Max if self.seen > 0 => self.max,
            Stat::Avg if self.seen > 0 => self.sum / self.seen as f64,
            _ => 0.0,
        };
        Ok(ColumnSeries::new()
            .with_column(EPOCH_COLUMN, ColumnData::Int64(vec![self.epoch]))
            .with_column(
                self.kind.output_column(),
                ColumnData::Float64(vec![value]),
            ))
    }
}

// ============================================================================
// tickcandler(window, price)
// ============================================================================

struct TickCandlerFactory;

impl AggregatorFactory for TickCandlerFactory {
    fn name(&self) -> &'static str {
        "tickcandler"
    }

    fn arg_specs(&self) -> &'static [ArgSpec] {
        &[
            ArgSpec {
                name: "window",
                required: true,
            },
            ArgSpec {
                name: "price",
                required: true,
            },
        ]
    }

    fn create(&self, call: &FunctionCall) -> Result<Box<dyn Aggregator>> {
        let window = call
            .literal_arg()
            .and_then(|lit| match lit {
                super::Literal::Str(s) => s.parse::<Timeframe>().ok(),
                _ => None,
            })
            .ok_or_else(|| {
                TickError::InvalidQuery(
                    "tickcandler requires a window literal like '5Min'".into(),
                )
            })?;
        let columns = call.column_args();
        let price = columns
            .first()
            .ok_or_else(|| {
                TickError::InvalidQuery("tickcandler requires a price column".into())
            })?
            .to_string();
        Ok(Box::new(TickCandler {
            window_seconds: window.step_seconds(),
            price,
            candles: BTreeMap::new(),
        }))
    }
}

#[derive(Debug, Clone, Copy)]
struct Candle {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

/// Buckets prices into window-aligned candles, producing
/// `{Epoch, Open, High, Low, Close}`
struct TickCandler {
    window_seconds: i64,
    price: String,
    candles: BTreeMap<Epoch, Candle>,
}

impl Aggregator for TickCandler {
    fn accum(&mut self, cs: &ColumnSeries) -> Result<()> {
        let prices = numeric_column(cs, &self.price, "tickcandler")?;
        let epochs = cs.epochs();
        if epochs.len() != prices.len() {
            return Err(TickError::Internal(
                "tickcandler input columns disagree on length".into(),
            ));
        }
        for (row, &epoch) in epochs.iter().enumerate() {
            let price = prices.f64_at(row).unwrap_or(0.0);
            let bucket = epoch - epoch.rem_euclid(self.window_seconds);
            self.candles
                .entry(bucket)
                .and_modify(|c| {
                    c.high = c.high.max(price);
                    c.low = c.low.min(price);
                    c.close = price;
                })
                .or_insert(Candle {
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                });
        }
        Ok(())
    }

    fn output(&mut self) -> Result<ColumnSeries> {
        let mut epochs = Vec::with_capacity(self.candles.len());
        let mut open = Vec::with_capacity(self.candles.len());
        let mut high = Vec::with_capacity(self.candles.len());
        let mut low = Vec::with_capacity(self.candles.len());
        let mut close = Vec::with_capacity(self.candles.len());
        for (&epoch, candle) in &self.candles {
            epochs.push(epoch);
            open.push(candle.open);
            high.push(candle.high);
            low.push(candle.low);
            close.push(candle.close);
        }
        Ok(ColumnSeries::new()
            .with_column(EPOCH_COLUMN, ColumnData::Int64(epochs))
            .with_column("Open", ColumnData::Float64(open))
            .with_column("High", ColumnData::Float64(high))
            .with_column("Low", ColumnData::Float64(low))
            .with_column("Close", ColumnData::Float64(close)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Literal;

    fn minute_bars(start: Epoch, opens: &[f64]) -> ColumnSeries {
        let epochs: Vec<i64> = (0..opens.len() as i64).map(|i| start + i * 60).collect();
        ColumnSeries::new()
            .with_column(EPOCH_COLUMN, ColumnData::Int64(epochs))
            .with_column("Open", ColumnData::Float64(opens.to_vec()))
    }

    fn call(name: &str, args: Vec<FuncArg>) -> FunctionCall {
        FunctionCall {
            name: name.into(),
            args,
        }
    }

    #[test]
    fn test_count_star() {
        let registry = AggRegistry::with_defaults();
        let input = minute_bars(947075400, &[1.0, 2.0, 3.0]);
        let out = registry
            .run_call(&call("count", vec![FuncArg::Wildcard]), &input)
            .unwrap();
        assert_eq!(out.column("Count"), Some(&ColumnData::Int64(vec![3])));
    }

    #[test]
    fn test_stats() {
        let registry = AggRegistry::with_defaults();
        let input = minute_bars(947075400, &[4.0, 1.0, 7.0, 2.0]);
        let arg = vec![FuncArg::Column("Open".into())];

        let min = registry.run_call(&call("min", arg.clone()), &input).unwrap();
        assert_eq!(min.column("Min"), Some(&ColumnData::Float64(vec![1.0])));

        let max = registry.run_call(&call("max", arg.clone()), &input).unwrap();
        assert_eq!(max.column("Max"), Some(&ColumnData::Float64(vec![7.0])));

        let sum = registry.run_call(&call("sum", arg.clone()), &input).unwrap();
        assert_eq!(sum.column("Sum"), Some(&ColumnData::Float64(vec![14.0])));

        let avg = registry.run_call(&call("avg", arg), &input).unwrap();
        assert_eq!(avg.column("Avg"), Some(&ColumnData::Float64(vec![3.5])));
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let registry = AggRegistry::with_defaults();
        assert!(registry.get("TickCandler").is_some());
        assert!(registry.get("COUNT").is_some());
        assert!(registry.get("median").is_none());
    }

    #[test]
    fn test_tickcandler_windows() {
        let registry = AggRegistry::with_defaults();
        // 29 one-minute bars from 12:30 to 12:58 → six 5-minute windows
        let opens: Vec<f64> = (0..29).map(|i| 10.0 + i as f64).collect();
        let input = minute_bars(947075400, &opens);
        let out = registry
            .run_call(
                &call(
                    "tickcandler",
                    vec![
                        FuncArg::Literal(Literal::Str("5Min".into())),
                        FuncArg::Column("Open".into()),
                    ],
                ),
                &input,
            )
            .unwrap();
        assert_eq!(out.len(), 6);
        assert_eq!(out.epochs()[0], 947075400);
        assert_eq!(out.epochs()[5], 947075400 + 5 * 300);
        // first window covers opens 10..14
        assert_eq!(out.column("Open").unwrap().f64_at(0), Some(10.0));
        assert_eq!(out.column("High").unwrap().f64_at(0), Some(14.0));
        assert_eq!(out.column("Low").unwrap().f64_at(0), Some(10.0));
        assert_eq!(out.column("Close").unwrap().f64_at(0), Some(14.0));
        // last window covers opens 35..38 (minutes 25..28)
        assert_eq!(out.column("Open").unwrap().f64_at(5), Some(35.0));
        assert_eq!(out.column("Close").unwrap().f64_at(5), Some(38.0));
    }

    #[test]
    fn test_bad_bindings() {
        let registry = AggRegistry::with_defaults();
        let input = minute_bars(947075400, &[1.0]);
        assert!(registry
            .run_call(&call("min", vec![FuncArg::Wildcard]), &input)
            .is_err());
        assert!(registry
            .run_call(&call("min", vec![FuncArg::Column("Nope".into())]), &input)
            .is_err());
        assert!(registry
            .run_call(&call("tickcandler", vec![FuncArg::Column("Open".into())]), &input)
            .is_err());
        assert!(registry
            .run_call(&call("nosuchfn", vec![]), &input)
            .is_err());
    }
}
