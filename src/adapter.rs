//! Merge inputs: the adapter trait every source implements and an in-memory
//! implementation used by the ingestion path and tests.

use std::collections::{BTreeSet, HashMap};

use roaring::RoaringBitmap;

use crate::capabilities::{ColumnCapabilities, TriState};
use crate::error::MergeError;
use crate::meta::Metadata;
use crate::types::{
    cell_values, compare_row_keys, DimensionCell, MergeRow, MetricValue, TimeInterval, Timestamp,
    ValueType,
};

/// A sorted, row-iterable merge input.
///
/// `rows()` returns an independent cursor on each call; the dictionary pass
/// and the row walk each take their own.
pub trait IndexableAdapter {
    fn data_interval(&self) -> TimeInterval;

    /// Dimension names in this input's declared order.
    fn dimension_names(&self) -> &[String];

    /// Metric names in this input's declared order.
    fn metric_names(&self) -> &[String];

    fn capabilities(&self, column: &str) -> Option<ColumnCapabilities>;

    /// Complex subtype name for a complex metric.
    fn metric_type_name(&self, metric: &str) -> Option<&str>;

    fn num_rows(&self) -> usize;

    /// Actual `(min, max)` timestamps present, if any rows exist.
    fn time_bounds(&self) -> Option<(Timestamp, Timestamp)>;

    /// Sorted distinct values of a dimension, null token first when present.
    /// Empty when the dimension is unknown to this input.
    fn dimension_dictionary(&self, dimension: &str) -> Vec<Option<String>>;

    /// Bitmap of input row numbers whose cell for `dimension` contains
    /// `value`. Empty when the value or dimension is unknown to this input.
    fn dimension_value_bitmap(&self, dimension: &str, value: Option<&str>) -> RoaringBitmap;

    /// Rows in non-decreasing `(timestamp, dims...)` order, in this input's
    /// own column order.
    fn rows(&self) -> Box<dyn Iterator<Item = MergeRow> + '_>;

    fn metadata(&self) -> Option<Metadata>;
}

/// Declared shape of one metric column in a [`RowBatchAdapter`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSchema {
    pub name: String,
    pub value_type: ValueType,
    pub complex_type_name: Option<String>,
}

impl MetricSchema {
    pub fn numeric(name: &str, value_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            value_type,
            complex_type_name: None,
        }
    }

    pub fn complex(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            value_type: ValueType::Complex,
            complex_type_name: Some(type_name.to_string()),
        }
    }
}

/// In-memory input: rows are sorted on construction, dictionaries and
/// per-value bitmaps are built eagerly.
#[derive(Debug)]
pub struct RowBatchAdapter {
    interval: TimeInterval,
    dimensions: Vec<String>,
    metrics: Vec<MetricSchema>,
    metric_names: Vec<String>,
    rows: Vec<MergeRow>,
    dictionaries: Vec<Vec<Option<String>>>,
    value_bitmaps: Vec<HashMap<Option<String>, RoaringBitmap>>,
    multi_value: Vec<bool>,
    has_nulls: Vec<bool>,
    metadata: Option<Metadata>,
}

impl RowBatchAdapter {
    pub fn new(
        interval: TimeInterval,
        dimensions: Vec<String>,
        metrics: Vec<MetricSchema>,
        mut rows: Vec<MergeRow>,
        metadata: Option<Metadata>,
    ) -> Result<Self, MergeError> {
        for (i, row) in rows.iter().enumerate() {
            if row.dims.len() != dimensions.len() {
                return Err(MergeError::InvalidInput(format!(
                    "Row {} has {} dimension cells, schema declares {}",
                    i,
                    row.dims.len(),
                    dimensions.len()
                )));
            }
            if row.metrics.len() != metrics.len() {
                return Err(MergeError::InvalidInput(format!(
                    "Row {} has {} metric values, schema declares {}",
                    i,
                    row.metrics.len(),
                    metrics.len()
                )));
            }
        }
        rows.sort_by(compare_row_keys);

        let mut dictionaries = Vec::with_capacity(dimensions.len());
        let mut value_bitmaps = Vec::with_capacity(dimensions.len());
        let mut multi_value = Vec::with_capacity(dimensions.len());
        let mut has_nulls = Vec::with_capacity(dimensions.len());
        for dim_index in 0..dimensions.len() {
            let mut values: BTreeSet<Option<String>> = BTreeSet::new();
            let mut bitmaps: HashMap<Option<String>, RoaringBitmap> = HashMap::new();
            let mut multi = false;
            for (row_num, row) in rows.iter().enumerate() {
                let cell = &row.dims[dim_index];
                if cell.len() > 1 {
                    multi = true;
                }
                for value in cell_values(cell) {
                    values.insert(value.clone());
                    bitmaps
                        .entry(value.clone())
                        .or_default()
                        .insert(row_num as u32);
                }
            }
            has_nulls.push(values.contains(&None));
            dictionaries.push(values.into_iter().collect());
            value_bitmaps.push(bitmaps);
            multi_value.push(multi);
        }

        let metric_names = metrics.iter().map(|m| m.name.clone()).collect();
        Ok(Self {
            interval,
            dimensions,
            metrics,
            metric_names,
            rows,
            dictionaries,
            value_bitmaps,
            multi_value,
            has_nulls,
            metadata,
        })
    }

    fn dimension_index(&self, dimension: &str) -> Option<usize> {
        self.dimensions.iter().position(|d| d == dimension)
    }
}

impl IndexableAdapter for RowBatchAdapter {
    fn data_interval(&self) -> TimeInterval {
        self.interval
    }

    fn dimension_names(&self) -> &[String] {
        &self.dimensions
    }

    fn metric_names(&self) -> &[String] {
        &self.metric_names
    }

    fn capabilities(&self, column: &str) -> Option<ColumnCapabilities> {
        if let Some(i) = self.dimension_index(column) {
            let mut caps = ColumnCapabilities::string_dimension();
            caps.has_multiple_values = TriState::from(self.multi_value[i]);
            caps.has_nulls = TriState::from(self.has_nulls[i]);
            return Some(caps);
        }
        self.metrics.iter().find(|m| m.name == column).map(|m| {
            match &m.complex_type_name {
                Some(name) => ColumnCapabilities::complex(name),
                None => ColumnCapabilities::numeric(m.value_type),
            }
        })
    }

    fn metric_type_name(&self, metric: &str) -> Option<&str> {
        self.metrics
            .iter()
            .find(|m| m.name == metric)
            .and_then(|m| m.complex_type_name.as_deref())
    }

    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn time_bounds(&self) -> Option<(Timestamp, Timestamp)> {
        if self.rows.is_empty() {
            return None;
        }
        Some((
            self.rows[0].timestamp,
            self.rows[self.rows.len() - 1].timestamp,
        ))
    }

    fn dimension_dictionary(&self, dimension: &str) -> Vec<Option<String>> {
        self.dimension_index(dimension)
            .map(|i| self.dictionaries[i].clone())
            .unwrap_or_default()
    }

    fn dimension_value_bitmap(&self, dimension: &str, value: Option<&str>) -> RoaringBitmap {
        self.dimension_index(dimension)
            .and_then(|i| {
                self.value_bitmaps[i]
                    .get(&value.map(|v| v.to_string()))
                    .cloned()
            })
            .unwrap_or_default()
    }

    fn rows(&self) -> Box<dyn Iterator<Item = MergeRow> + '_> {
        Box::new(self.rows.iter().cloned())
    }

    fn metadata(&self) -> Option<Metadata> {
        self.metadata.clone()
    }
}

/// Column-reordering projection from one input's schema into the unified
/// merge schema. Missing dimensions become null cells; missing metrics read
/// as null.
#[derive(Debug, Clone)]
pub(crate) struct SchemaProjection {
    dim_map: Vec<Option<usize>>,
    metric_map: Vec<Option<usize>>,
    identity: bool,
}

impl SchemaProjection {
    pub(crate) fn new(
        adapter: &dyn IndexableAdapter,
        merged_dimensions: &[String],
        merged_metrics: &[String],
    ) -> Self {
        let dim_map: Vec<Option<usize>> = merged_dimensions
            .iter()
            .map(|name| adapter.dimension_names().iter().position(|d| d == name))
            .collect();
        let metric_map: Vec<Option<usize>> = merged_metrics
            .iter()
            .map(|name| adapter.metric_names().iter().position(|m| m == name))
            .collect();
        let identity = adapter.dimension_names() == merged_dimensions
            && adapter.metric_names() == merged_metrics;
        Self {
            dim_map,
            metric_map,
            identity,
        }
    }

    pub(crate) fn project(&self, row: MergeRow) -> MergeRow {
        if self.identity {
            return row;
        }
        let dims: Vec<DimensionCell> = self
            .dim_map
            .iter()
            .map(|slot| match slot {
                Some(i) => row.dims[*i].clone(),
                None => Vec::new(),
            })
            .collect();
        let metrics: Vec<MetricValue> = self
            .metric_map
            .iter()
            .map(|slot| match slot {
                Some(i) => row.metrics[*i].clone(),
                None => MetricValue::Null,
            })
            .collect();
        MergeRow::new(row.timestamp, dims, metrics)
    }
}
