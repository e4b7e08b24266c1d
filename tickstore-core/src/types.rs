//! Core types for tickstore
//!
//! Buckets are named by a hierarchical key `Symbol/Timeframe/RecordType`
//! (e.g. `AAPL/1Min/OHLCV`) and carry a fixed schema whose first column is
//! always `Epoch: INT64` (seconds since the Unix epoch). Query results and
//! write payloads travel as [`ColumnSeries`]: named, equal-length typed
//! vectors.

use chrono::{DateTime, Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Result, TickError};

/// Timestamp in seconds since Unix epoch
pub type Epoch = i64;

/// Name of the mandatory leading column
pub const EPOCH_COLUMN: &str = "Epoch";

/// Name of the nanosecond column on variable-length buckets
pub const NANOS_COLUMN: &str = "Nanoseconds";

// ============================================================================
// Element types and schema
// ============================================================================

/// Storage type of a single column element. All integers are little-endian
/// two's-complement on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Byte,
}

impl ElementType {
    /// Width in bytes of one element
    pub fn width(&self) -> usize {
        match self {
            ElementType::Int8 | ElementType::UInt8 | ElementType::Byte => 1,
            ElementType::Int16 | ElementType::UInt16 => 2,
            ElementType::Int32 | ElementType::UInt32 | ElementType::Float32 => 4,
            ElementType::Int64 | ElementType::UInt64 | ElementType::Float64 => 8,
        }
    }

    /// Single-byte code used in segment headers
    pub fn code(&self) -> u8 {
        match self {
            ElementType::Int8 => 1,
            ElementType::Int16 => 2,
            ElementType::Int32 => 3,
            ElementType::Int64 => 4,
            ElementType::UInt8 => 5,
            ElementType::UInt16 => 6,
            ElementType::UInt32 => 7,
            ElementType::UInt64 => 8,
            ElementType::Float32 => 9,
            ElementType::Float64 => 10,
            ElementType::Byte => 11,
        }
    }

    /// Inverse of [`ElementType::code`]
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => ElementType::Int8,
            2 => ElementType::Int16,
            3 => ElementType::Int32,
            4 => ElementType::Int64,
            5 => ElementType::UInt8,
            6 => ElementType::UInt16,
            7 => ElementType::UInt32,
            8 => ElementType::UInt64,
            9 => ElementType::Float32,
            10 => ElementType::Float64,
            11 => ElementType::Byte,
            _ => {
                return Err(TickError::InvalidFormat(format!(
                    "unknown element type code: {}",
                    code
                )))
            }
        })
    }

    /// True for types that participate in numeric comparisons and aggregates
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ElementType::Byte)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElementType::Int8 => "INT8",
            ElementType::Int16 => "INT16",
            ElementType::Int32 => "INT32",
            ElementType::Int64 => "INT64",
            ElementType::UInt8 => "UINT8",
            ElementType::UInt16 => "UINT16",
            ElementType::UInt32 => "UINT32",
            ElementType::UInt64 => "UINT64",
            ElementType::Float32 => "FLOAT32",
            ElementType::Float64 => "FLOAT64",
            ElementType::Byte => "BYTE",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ElementType {
    type Err = TickError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_uppercase().as_str() {
            "INT8" => ElementType::Int8,
            "INT16" => ElementType::Int16,
            "INT32" => ElementType::Int32,
            "INT64" => ElementType::Int64,
            "UINT8" => ElementType::UInt8,
            "UINT16" => ElementType::UInt16,
            "UINT32" => ElementType::UInt32,
            "UINT64" => ElementType::UInt64,
            "FLOAT32" => ElementType::Float32,
            "FLOAT64" => ElementType::Float64,
            "BYTE" => ElementType::Byte,
            other => {
                return Err(TickError::InvalidFormat(format!(
                    "unknown element type: {}",
                    other
                )))
            }
        })
    }
}

/// A named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub elem: ElementType,
}

impl Column {
    pub fn new(name: impl Into<String>, elem: ElementType) -> Self {
        Self {
            name: name.into(),
            elem,
        }
    }
}

/// Ordered column list of a bucket. Equality is structural: same names, same
/// element types, same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let schema = Self { columns };
        schema.validate()?;
        Ok(schema)
    }

    /// A schema is valid when it leads with `Epoch: INT64` and has no
    /// duplicate names.
    pub fn validate(&self) -> Result<()> {
        match self.columns.first() {
            Some(c) if c.name == EPOCH_COLUMN && c.elem == ElementType::Int64 => {}
            _ => {
                return Err(TickError::InvalidFormat(
                    "schema must start with Epoch: INT64".into(),
                ))
            }
        }
        for (i, c) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|p| p.name == c.name) {
                return Err(TickError::InvalidFormat(format!(
                    "duplicate column: {}",
                    c.name
                )));
            }
        }
        Ok(())
    }

    /// Bytes per record
    pub fn record_length(&self) -> usize {
        self.columns.iter().map(|c| c.elem.width()).sum()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Byte offset of a column within a record
    pub fn column_offset(&self, index: usize) -> usize {
        self.columns[..index].iter().map(|c| c.elem.width()).sum()
    }
}

/// Fixed buckets address records by slot; variable buckets append with an
/// explicit `(Epoch, Nanoseconds)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    Fixed,
    Variable,
}

impl RecordKind {
    pub fn code(&self) -> u8 {
        match self {
            RecordKind::Fixed => 1,
            RecordKind::Variable => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(RecordKind::Fixed),
            2 => Ok(RecordKind::Variable),
            _ => Err(TickError::InvalidFormat(format!(
                "unknown record kind code: {}",
                code
            ))),
        }
    }
}

/// Everything needed to (re)create a bucket: schema, timeframe, record kind.
/// Persisted in the bucket header file and carried on replication items so a
/// replica can bootstrap buckets it has never seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketMeta {
    pub schema: Schema,
    pub timeframe: Timeframe,
    pub record_kind: RecordKind,
}

// ============================================================================
// Timeframe
// ============================================================================

/// Time unit of a timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Sec,
    Min,
    Hour,
    Day,
}

impl TimeUnit {
    fn seconds(&self) -> i64 {
        match self {
            TimeUnit::Sec => 1,
            TimeUnit::Min => 60,
            TimeUnit::Hour => 3600,
            TimeUnit::Day => 86400,
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            TimeUnit::Sec => "Sec",
            TimeUnit::Min => "Min",
            TimeUnit::Hour => "H",
            TimeUnit::Day => "D",
        }
    }
}

/// The nominal time step per record of a fixed bucket, e.g. `1Min`, `5Min`,
/// `1D`. The step must divide 24 hours evenly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    pub qty: u32,
    pub unit: TimeUnit,
}

impl Timeframe {
    pub fn new(qty: u32, unit: TimeUnit) -> Result<Self> {
        let tf = Self { qty, unit };
        if qty == 0 {
            return Err(TickError::InvalidFormat("zero timeframe".into()));
        }
        if 86400 % tf.step_seconds() != 0 {
            return Err(TickError::InvalidFormat(format!(
                "timeframe {} does not divide one day",
                tf
            )));
        }
        Ok(tf)
    }

    /// Seconds between consecutive slots
    pub fn step_seconds(&self) -> i64 {
        self.qty as i64 * self.unit.seconds()
    }

    /// Records per 24 hours
    pub fn intervals_per_day(&self) -> i64 {
        86400 / self.step_seconds()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.qty, self.unit.suffix())
    }
}

impl FromStr for Timeframe {
    type Err = TickError;

    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
        let suffix = &s[digits.len()..];
        let qty: u32 = digits
            .parse()
            .map_err(|_| TickError::InvalidFormat(format!("bad timeframe: {}", s)))?;
        let unit = match suffix {
            "Sec" | "sec" | "S" | "s" => TimeUnit::Sec,
            "Min" | "min" | "T" => TimeUnit::Min,
            "H" | "h" | "Hour" | "hour" => TimeUnit::Hour,
            "D" | "d" | "Day" | "day" => TimeUnit::Day,
            other => {
                return Err(TickError::InvalidFormat(format!(
                    "bad timeframe suffix: {}",
                    other
                )))
            }
        };
        Timeframe::new(qty, unit)
    }
}

// ============================================================================
// Calendar helpers
// ============================================================================

/// Calendar year (UTC) containing an epoch
pub fn year_of_epoch(epoch: Epoch) -> i32 {
    DateTime::from_timestamp(epoch, 0)
        .map(|dt| dt.year())
        .unwrap_or(1970)
}

/// Epoch of January 1st 00:00:00 UTC of a year
pub fn year_start(year: i32) -> Epoch {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

/// 365 or 366
pub fn days_in_year(year: i32) -> i64 {
    if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
        366
    } else {
        365
    }
}

// ============================================================================
// Time range
// ============================================================================

/// Closed time range in epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start epoch (inclusive)
    pub start: Epoch,
    /// End epoch (inclusive)
    pub end: Epoch,
}

impl TimeRange {
    pub fn new(start: Epoch, end: Epoch) -> Self {
        Self { start, end }
    }

    pub fn all() -> Self {
        Self {
            start: Epoch::MIN,
            end: Epoch::MAX,
        }
    }

    pub fn contains(&self, epoch: Epoch) -> bool {
        epoch >= self.start && epoch <= self.end
    }

    /// An empty range results from contradictory predicates; queries over it
    /// return an empty series without touching any segment file.
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn intersect(&self, other: &TimeRange) -> TimeRange {
        TimeRange::new(self.start.max(other.start), self.end.min(other.end))
    }
}

// ============================================================================
// Column series
// ============================================================================

/// Typed column vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Byte(Vec<u8>),
}

macro_rules! per_variant {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            ColumnData::Int8($v) => $body,
            ColumnData::Int16($v) => $body,
            ColumnData::Int32($v) => $body,
            ColumnData::Int64($v) => $body,
            ColumnData::UInt8($v) => $body,
            ColumnData::UInt16($v) => $body,
            ColumnData::UInt32($v) => $body,
            ColumnData::UInt64($v) => $body,
            ColumnData::Float32($v) => $body,
            ColumnData::Float64($v) => $body,
            ColumnData::Byte($v) => $body,
        }
    };
}

impl ColumnData {
    pub fn empty(elem: ElementType) -> Self {
        match elem {
            ElementType::Int8 => ColumnData::Int8(Vec::new()),
            ElementType::Int16 => ColumnData::Int16(Vec::new()),
            ElementType::Int32 => ColumnData::Int32(Vec::new()),
            ElementType::Int64 => ColumnData::Int64(Vec::new()),
            ElementType::UInt8 => ColumnData::UInt8(Vec::new()),
            ElementType::UInt16 => ColumnData::UInt16(Vec::new()),
            ElementType::UInt32 => ColumnData::UInt32(Vec::new()),
            ElementType::UInt64 => ColumnData::UInt64(Vec::new()),
            ElementType::Float32 => ColumnData::Float32(Vec::new()),
            ElementType::Float64 => ColumnData::Float64(Vec::new()),
            ElementType::Byte => ColumnData::Byte(Vec::new()),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            ColumnData::Int8(_) => ElementType::Int8,
            ColumnData::Int16(_) => ElementType::Int16,
            ColumnData::Int32(_) => ElementType::Int32,
            ColumnData::Int64(_) => ElementType::Int64,
            ColumnData::UInt8(_) => ElementType::UInt8,
            ColumnData::UInt16(_) => ElementType::UInt16,
            ColumnData::UInt32(_) => ElementType::UInt32,
            ColumnData::UInt64(_) => ElementType::UInt64,
            ColumnData::Float32(_) => ElementType::Float32,
            ColumnData::Float64(_) => ElementType::Float64,
            ColumnData::Byte(_) => ElementType::Byte,
        }
    }

    pub fn len(&self) -> usize {
        per_variant!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode one little-endian element from `buf` and append it
    pub fn push_le(&mut self, buf: &[u8]) {
        match self {
            ColumnData::Int8(v) => v.push(buf[0] as i8),
            ColumnData::Int16(v) => v.push(i16::from_le_bytes([buf[0], buf[1]])),
            ColumnData::Int32(v) => v.push(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            ColumnData::Int64(v) => v.push(i64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ])),
            ColumnData::UInt8(v) => v.push(buf[0]),
            ColumnData::UInt16(v) => v.push(u16::from_le_bytes([buf[0], buf[1]])),
            ColumnData::UInt32(v) => v.push(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            ColumnData::UInt64(v) => v.push(u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ])),
            ColumnData::Float32(v) => v.push(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            ColumnData::Float64(v) => v.push(f64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ])),
            ColumnData::Byte(v) => v.push(buf[0]),
        }
    }

    /// Append the little-endian encoding of element `idx` to `out`
    pub fn write_le(&self, idx: usize, out: &mut Vec<u8>) {
        match self {
            ColumnData::Int8(v) => out.extend_from_slice(&v[idx].to_le_bytes()),
            ColumnData::Int16(v) => out.extend_from_slice(&v[idx].to_le_bytes()),
            ColumnData::Int32(v) => out.extend_from_slice(&v[idx].to_le_bytes()),
            ColumnData::Int64(v) => out.extend_from_slice(&v[idx].to_le_bytes()),
            ColumnData::UInt8(v) => out.push(v[idx]),
            ColumnData::UInt16(v) => out.extend_from_slice(&v[idx].to_le_bytes()),
            ColumnData::UInt32(v) => out.extend_from_slice(&v[idx].to_le_bytes()),
            ColumnData::UInt64(v) => out.extend_from_slice(&v[idx].to_le_bytes()),
            ColumnData::Float32(v) => out.extend_from_slice(&v[idx].to_le_bytes()),
            ColumnData::Float64(v) => out.extend_from_slice(&v[idx].to_le_bytes()),
            ColumnData::Byte(v) => out.push(v[idx]),
        }
    }

    /// Element as f64, for predicate evaluation and aggregates
    pub fn f64_at(&self, idx: usize) -> Option<f64> {
        Some(match self {
            ColumnData::Int8(v) => v[idx] as f64,
            ColumnData::Int16(v) => v[idx] as f64,
            ColumnData::Int32(v) => v[idx] as f64,
            ColumnData::Int64(v) => v[idx] as f64,
            ColumnData::UInt8(v) => v[idx] as f64,
            ColumnData::UInt16(v) => v[idx] as f64,
            ColumnData::UInt32(v) => v[idx] as f64,
            ColumnData::UInt64(v) => v[idx] as f64,
            ColumnData::Float32(v) => v[idx] as f64,
            ColumnData::Float64(v) => v[idx],
            ColumnData::Byte(_) => return None,
        })
    }

    /// Keep only the rows at `indices` (ascending)
    pub fn take(&self, indices: &[usize]) -> ColumnData {
        match self {
            ColumnData::Int8(v) => ColumnData::Int8(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::Int16(v) => ColumnData::Int16(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::Int32(v) => ColumnData::Int32(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::Int64(v) => ColumnData::Int64(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::UInt8(v) => ColumnData::UInt8(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::UInt16(v) => ColumnData::UInt16(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::UInt32(v) => ColumnData::UInt32(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::UInt64(v) => ColumnData::UInt64(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::Float32(v) => ColumnData::Float32(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::Float64(v) => ColumnData::Float64(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::Byte(v) => ColumnData::Byte(indices.iter().map(|&i| v[i]).collect()),
        }
    }

    pub fn truncate(&mut self, len: usize) {
        per_variant!(self, v => v.truncate(len))
    }

    /// Append all rows of `other`; types must match
    pub fn append(&mut self, other: &ColumnData) -> Result<()> {
        if self.element_type() != other.element_type() {
            return Err(TickError::Internal("column type mismatch on append".into()));
        }
        match (self, other) {
            (ColumnData::Int8(a), ColumnData::Int8(b)) => a.extend_from_slice(b),
            (ColumnData::Int16(a), ColumnData::Int16(b)) => a.extend_from_slice(b),
            (ColumnData::Int32(a), ColumnData::Int32(b)) => a.extend_from_slice(b),
            (ColumnData::Int64(a), ColumnData::Int64(b)) => a.extend_from_slice(b),
            (ColumnData::UInt8(a), ColumnData::UInt8(b)) => a.extend_from_slice(b),
            (ColumnData::UInt16(a), ColumnData::UInt16(b)) => a.extend_from_slice(b),
            (ColumnData::UInt32(a), ColumnData::UInt32(b)) => a.extend_from_slice(b),
            (ColumnData::UInt64(a), ColumnData::UInt64(b)) => a.extend_from_slice(b),
            (ColumnData::Float32(a), ColumnData::Float32(b)) => a.extend_from_slice(b),
            (ColumnData::Float64(a), ColumnData::Float64(b)) => a.extend_from_slice(b),
            (ColumnData::Byte(a), ColumnData::Byte(b)) => a.extend_from_slice(b),
            _ => unreachable!(),
        }
        Ok(())
    }
}

/// An in-memory columnar result or write payload: ordered mapping of column
/// name to typed vector, all vectors of equal length. The `Epoch` column is
/// always present on data series.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ColumnSeries {
    columns: Vec<(String, ColumnData)>,
}

impl ColumnSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty series with one vector per schema column
    pub fn from_schema(schema: &Schema) -> Self {
        Self {
            columns: schema
                .columns
                .iter()
                .map(|c| (c.name.clone(), ColumnData::empty(c.elem)))
                .collect(),
        }
    }

    pub fn add_column(&mut self, name: impl Into<String>, data: ColumnData) {
        self.columns.push((name.into(), data));
    }

    pub fn with_column(mut self, name: impl Into<String>, data: ColumnData) -> Self {
        self.add_column(name, data);
        self
    }

    /// Number of rows (length of the first column)
    pub fn len(&self) -> usize {
        self.columns.first().map(|(_, d)| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
    }

    pub fn columns(&self) -> &[(String, ColumnData)] {
        &self.columns
    }

    /// The `Epoch` vector; empty when the column is missing
    pub fn epochs(&self) -> &[Epoch] {
        match self.column(EPOCH_COLUMN) {
            Some(ColumnData::Int64(v)) => v,
            _ => &[],
        }
    }

    /// Keep only the rows at `indices`
    pub fn take(&self, indices: &[usize]) -> ColumnSeries {
        ColumnSeries {
            columns: self
                .columns
                .iter()
                .map(|(n, d)| (n.clone(), d.take(indices)))
                .collect(),
        }
    }

    pub fn truncate(&mut self, len: usize) {
        for (_, d) in &mut self.columns {
            d.truncate(len);
        }
    }

    /// Reorder/select columns by name
    pub fn project(&self, names: &[String]) -> Result<ColumnSeries> {
        let mut out = ColumnSeries::new();
        for name in names {
            let data = self
                .column(name)
                .ok_or_else(|| TickError::InvalidQuery(format!("unknown column: {}", name)))?;
            out.add_column(name.clone(), data.clone());
        }
        Ok(out)
    }

    /// Append all rows of `other`; column sets must be identical
    pub fn append(&mut self, other: &ColumnSeries) -> Result<()> {
        if self.columns.is_empty() {
            *self = other.clone();
            return Ok(());
        }
        if self.columns.len() != other.columns.len() {
            return Err(TickError::Internal("column count mismatch on append".into()));
        }
        for ((name, data), (oname, odata)) in self.columns.iter_mut().zip(other.columns.iter()) {
            if name != oname {
                return Err(TickError::Internal(format!(
                    "column name mismatch on append: {} vs {}",
                    name, oname
                )));
            }
            data.append(odata)?;
        }
        Ok(())
    }

    /// Decode `bytes` as a dense array of fixed-width records laid out per
    /// `schema`. Rows whose leading `Epoch` is zero are empty slots and are
    /// skipped when `skip_empty` is set.
    pub fn decode_records(schema: &Schema, bytes: &[u8], skip_empty: bool) -> Result<ColumnSeries> {
        let rec_len = schema.record_length();
        if rec_len == 0 || bytes.len() % rec_len != 0 {
            return Err(TickError::InvalidFormat(format!(
                "payload length {} is not a multiple of record length {}",
                bytes.len(),
                rec_len
            )));
        }
        let mut cs = ColumnSeries::from_schema(schema);
        for record in bytes.chunks_exact(rec_len) {
            if skip_empty {
                let epoch = i64::from_le_bytes([
                    record[0], record[1], record[2], record[3], record[4], record[5], record[6],
                    record[7],
                ]);
                if epoch == 0 {
                    continue;
                }
            }
            let mut off = 0;
            for (i, col) in schema.columns.iter().enumerate() {
                let w = col.elem.width();
                cs.columns[i].1.push_le(&record[off..off + w]);
                off += w;
            }
        }
        Ok(cs)
    }

    /// Encode all rows into fixed-width record bytes per `schema`. The series
    /// must carry exactly the schema's columns, in any order, with matching
    /// element types.
    pub fn encode_records(&self, schema: &Schema) -> Result<Vec<u8>> {
        let mut sources = Vec::with_capacity(schema.columns.len());
        for col in &schema.columns {
            let data = self.column(&col.name).ok_or_else(|| TickError::SchemaMismatch {
                bucket: String::new(),
                reason: format!("missing column: {}", col.name),
            })?;
            if data.element_type() != col.elem {
                return Err(TickError::SchemaMismatch {
                    bucket: String::new(),
                    reason: format!(
                        "column {} has type {}, schema wants {}",
                        col.name,
                        data.element_type(),
                        col.elem
                    ),
                });
            }
            sources.push(data);
        }
        let rows = self.len();
        let mut out = Vec::with_capacity(rows * schema.record_length());
        for row in 0..rows {
            for data in &sources {
                data.write_le(row, &mut out);
            }
        }
        Ok(out)
    }
}

/// A write payload: bucket key → column series
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnSeriesMap(pub BTreeMap<String, ColumnSeries>);

impl ColumnSeriesMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, bucket_key: impl Into<String>, cs: ColumnSeries) {
        self.0.insert(bucket_key.into(), cs);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ColumnSeries)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ohlcv_schema() -> Schema {
        Schema::new(vec![
            Column::new(EPOCH_COLUMN, ElementType::Int64),
            Column::new("Open", ElementType::Float32),
            Column::new("High", ElementType::Float32),
            Column::new("Low", ElementType::Float32),
            Column::new("Close", ElementType::Float32),
            Column::new("Volume", ElementType::Int32),
        ])
        .unwrap()
    }

    #[test]
    fn test_timeframe_parse() {
        let tf: Timeframe = "1Min".parse().unwrap();
        assert_eq!(tf.step_seconds(), 60);
        assert_eq!(tf.intervals_per_day(), 1440);

        let tf: Timeframe = "5Min".parse().unwrap();
        assert_eq!(tf.intervals_per_day(), 288);

        let tf: Timeframe = "1D".parse().unwrap();
        assert_eq!(tf.intervals_per_day(), 1);

        assert!("7Min".parse::<Timeframe>().is_err()); // does not divide a day
        assert!("Min".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_schema_validation() {
        assert!(Schema::new(vec![Column::new("Open", ElementType::Float32)]).is_err());
        let schema = ohlcv_schema();
        assert_eq!(schema.record_length(), 8 + 4 * 4 + 4);
        assert_eq!(schema.column_offset(1), 8);
        assert_eq!(schema.column_offset(5), 24);
    }

    #[test]
    fn test_record_round_trip() {
        let schema = ohlcv_schema();
        let mut cs = ColumnSeries::new();
        cs.add_column(EPOCH_COLUMN, ColumnData::Int64(vec![947073600, 947073660]));
        cs.add_column("Open", ColumnData::Float32(vec![10.0, 10.5]));
        cs.add_column("High", ColumnData::Float32(vec![10.6, 10.7]));
        cs.add_column("Low", ColumnData::Float32(vec![9.9, 10.4]));
        cs.add_column("Close", ColumnData::Float32(vec![10.5, 10.6]));
        cs.add_column("Volume", ColumnData::Int32(vec![100, 250]));

        let bytes = cs.encode_records(&schema).unwrap();
        assert_eq!(bytes.len(), 2 * schema.record_length());

        let decoded = ColumnSeries::decode_records(&schema, &bytes, false).unwrap();
        assert_eq!(decoded, cs);
    }

    #[test]
    fn test_decode_skips_empty_slots() {
        let schema = ohlcv_schema();
        let rec_len = schema.record_length();
        let mut bytes = vec![0u8; 3 * rec_len];
        // populate only the middle slot
        bytes[rec_len..rec_len + 8].copy_from_slice(&947073600i64.to_le_bytes());
        let cs = ColumnSeries::decode_records(&schema, &bytes, true).unwrap();
        assert_eq!(cs.len(), 1);
        assert_eq!(cs.epochs(), &[947073600]);
    }

    #[test]
    fn test_encode_rejects_wrong_type() {
        let schema = ohlcv_schema();
        let mut cs = ColumnSeries::new();
        cs.add_column(EPOCH_COLUMN, ColumnData::Int64(vec![947073600]));
        cs.add_column("Open", ColumnData::Float64(vec![10.0]));
        cs.add_column("High", ColumnData::Float32(vec![10.6]));
        cs.add_column("Low", ColumnData::Float32(vec![9.9]));
        cs.add_column("Close", ColumnData::Float32(vec![10.5]));
        cs.add_column("Volume", ColumnData::Int32(vec![100]));
        assert!(matches!(
            cs.encode_records(&schema),
            Err(TickError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_year_helpers() {
        assert_eq!(year_of_epoch(947073600), 2000); // 2000-01-05
        assert_eq!(year_start(2000), 946684800);
        assert_eq!(days_in_year(2000), 366);
        assert_eq!(days_in_year(1999), 365);
        assert_eq!(days_in_year(1900), 365);
    }

    #[test]
    fn test_time_range() {
        let r = TimeRange::new(100, 200);
        assert!(r.contains(100) && r.contains(200) && !r.contains(201));
        assert!(TimeRange::new(10, 5).is_empty());
        let i = r.intersect(&TimeRange::new(150, 400));
        assert_eq!(i, TimeRange::new(150, 200));
    }
}
