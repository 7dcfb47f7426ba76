use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Timestamp type (milliseconds since epoch).
pub type Timestamp = i64;

/// Name of the mandatory time column in every segment.
pub const TIME_COLUMN: &str = "__time";

/// Sentinel stored in a row-number conversion buffer for input rows that did
/// not contribute to the output (dropped by rollup or skipped).
pub const INVALID_ROW: u32 = u32::MAX;

/// Closed-open time interval `[start, end)` in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInterval {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeInterval {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Smallest interval covering both `self` and `other`.
    pub fn union(&self, other: &TimeInterval) -> TimeInterval {
        TimeInterval {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        t >= self.start && t < self.end
    }
}

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Long,
    Float,
    Double,
    String,
    Complex,
}

impl ValueType {
    pub fn is_numeric(self) -> bool {
        matches!(self, ValueType::Long | ValueType::Float | ValueType::Double)
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueType::Long => "long",
            ValueType::Float => "float",
            ValueType::Double => "double",
            ValueType::String => "string",
            ValueType::Complex => "complex",
        };
        f.write_str(s)
    }
}

/// A single metric cell. Complex payloads are opaque bytes interpreted by the
/// serde registered for the metric's type name.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Null,
    Long(i64),
    Float(f32),
    Double(f64),
    Complex(Vec<u8>),
}

impl MetricValue {
    pub fn is_null(&self) -> bool {
        matches!(self, MetricValue::Null)
    }

    /// Numeric view as i64; nulls and complex values read as 0.
    pub fn as_long(&self) -> i64 {
        match self {
            MetricValue::Long(v) => *v,
            MetricValue::Float(v) => *v as i64,
            MetricValue::Double(v) => *v as i64,
            _ => 0,
        }
    }

    /// Numeric view as f64; nulls and complex values read as 0.0.
    pub fn as_double(&self) -> f64 {
        match self {
            MetricValue::Long(v) => *v as f64,
            MetricValue::Float(v) => *v as f64,
            MetricValue::Double(v) => *v,
            _ => 0.0,
        }
    }

    pub fn as_float(&self) -> f32 {
        match self {
            MetricValue::Long(v) => *v as f32,
            MetricValue::Float(v) => *v,
            MetricValue::Double(v) => *v as f32,
            _ => 0.0,
        }
    }
}

/// One row's value(s) for one dimension, in row order. An empty cell reads as
/// the single null value; a multi-value cell preserves element order.
pub type DimensionCell = Vec<Option<String>>;

const NULL_CELL: &[Option<String>] = &[None];

/// Normalized view of a cell for ordering and equality: empty means `[null]`.
pub(crate) fn cell_values(cell: &DimensionCell) -> &[Option<String>] {
    if cell.is_empty() {
        NULL_CELL
    } else {
        cell
    }
}

/// A row in unified schema order: timestamp, then one cell per merged
/// dimension, then one value per merged metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRow {
    pub timestamp: Timestamp,
    pub dims: Vec<DimensionCell>,
    pub metrics: Vec<MetricValue>,
}

impl MergeRow {
    pub fn new(timestamp: Timestamp, dims: Vec<DimensionCell>, metrics: Vec<MetricValue>) -> Self {
        Self {
            timestamp,
            dims,
            metrics,
        }
    }
}

/// Total order on the `(timestamp, dim1, dim2, ...)` composite key. Metrics do
/// not participate in the ordering.
pub(crate) fn compare_row_keys(a: &MergeRow, b: &MergeRow) -> Ordering {
    a.timestamp.cmp(&b.timestamp).then_with(|| {
        for (ca, cb) in a.dims.iter().zip(b.dims.iter()) {
            let ord = cell_values(ca).cmp(cell_values(cb));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.dims.len().cmp(&b.dims.len())
    })
}

pub(crate) fn row_keys_equal(a: &MergeRow, b: &MergeRow) -> bool {
    compare_row_keys(a, b) == Ordering::Equal
}
