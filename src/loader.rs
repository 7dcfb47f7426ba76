//! Minimal segment reader: reopens a built segment directory as an
//! [`IndexableAdapter`] so the multi-phase driver can feed intermediate
//! outputs into the next tier, and so round-trip tests can verify segments.

use std::io::{Cursor, Read};
use std::path::Path;

use roaring::RoaringBitmap;

use crate::adapter::IndexableAdapter;
use crate::capabilities::{ColumnCapabilities, TriState};
use crate::column::{
    decode_complex_part, decode_numeric_part, ColumnDescriptor, ColumnPart, GenericIndexed,
    NumericKind,
};
use crate::config::SegmentizerFactory;
use crate::dimension::{decode_string_dimension, DecodedDimension};
use crate::error::MergeError;
use crate::meta::Metadata;
use crate::smoosh::SmooshedDir;
use crate::types::{DimensionCell, MergeRow, MetricValue, TimeInterval, Timestamp, ValueType};
use crate::util::{read_i64, read_u32};
use crate::SEGMENT_FORMAT_VERSION;

const VERSION_FILE: &str = "version.bin";
const FACTORY_FILE: &str = "factory.json";
const INDEX_BLOB: &str = "index.drd";
const METADATA_BLOB: &str = "metadata.drd";

struct DecodedMetric {
    value_type: ValueType,
    complex_type_name: Option<String>,
    values: Vec<MetricValue>,
}

/// A fully decoded segment, usable as a merge input.
pub struct SegmentAdapter {
    interval: TimeInterval,
    dimensions: Vec<String>,
    metrics: Vec<String>,
    timestamps: Vec<Timestamp>,
    dim_columns: Vec<DecodedDimension>,
    dim_null_only_types: Vec<Option<ValueType>>,
    metric_columns: Vec<DecodedMetric>,
    metadata: Option<Metadata>,
}

impl SegmentAdapter {
    pub fn open(dir: &Path) -> Result<Self, MergeError> {
        let version_bytes = std::fs::read(dir.join(VERSION_FILE))?;
        if version_bytes.len() != 4 {
            return Err(MergeError::Corruption {
                details: format!("Bad version marker length in {:?}", dir),
            });
        }
        let version = i32::from_be_bytes([
            version_bytes[0],
            version_bytes[1],
            version_bytes[2],
            version_bytes[3],
        ]);
        if version != SEGMENT_FORMAT_VERSION {
            return Err(MergeError::Corruption {
                details: format!("Unsupported segment format version {} in {:?}", version, dir),
            });
        }
        // The loader descriptor is validated for well-formedness; this
        // in-process reader serves any loader kind.
        let factory_bytes = std::fs::read(dir.join(FACTORY_FILE))?;
        let _factory: SegmentizerFactory = serde_json::from_slice(&factory_bytes)?;

        let container = SmooshedDir::open(dir)?;
        let index = container.read(INDEX_BLOB)?;
        let mut cur = Cursor::new(&index[..]);

        let non_null_columns = GenericIndexed::read_from(&mut cur)?;
        let non_null_dimensions = GenericIndexed::read_from(&mut cur)?;
        let start = read_i64(&mut cur)?;
        let end = read_i64(&mut cur)?;
        let bitmap_serde_len = read_u32(&mut cur)? as usize;
        let mut bitmap_serde_bytes = vec![0u8; bitmap_serde_len];
        cur.read_exact(&mut bitmap_serde_bytes)?;
        let all_columns = GenericIndexed::read_from(&mut cur)?;
        let all_dimensions = GenericIndexed::read_from(&mut cur)?;

        let columns = restore_order(all_columns.items(), non_null_columns.items())?;
        let dimensions = restore_order(all_dimensions.items(), non_null_dimensions.items())?;
        let dimension_names: Vec<String> = dimensions.iter().map(|(n, _)| n.clone()).collect();

        let time_blob = container.read(crate::types::TIME_COLUMN)?;
        let (time_desc, time_payload) = split_column_blob(&time_blob)?;
        let timestamps = decode_time_column(&time_desc, time_payload)?;

        let mut dim_columns = Vec::new();
        let mut dim_null_only_types = Vec::new();
        let mut metric_names = Vec::new();
        let mut metric_columns = Vec::new();

        for (name, _null_only) in &columns {
            if dimension_names.contains(name) {
                continue;
            }
            let blob = container.read(name)?;
            let (desc, payload) = split_column_blob(&blob)?;
            metric_columns.push(decode_metric_column(name, &desc, payload)?);
            metric_names.push(name.clone());
        }

        for (name, null_only) in &dimensions {
            let blob = container.read(name)?;
            let (desc, payload) = split_column_blob(&blob)?;
            if *null_only {
                let row_count = null_column_row_count(name, &desc)?;
                dim_columns.push(DecodedDimension {
                    dictionary: vec![None],
                    rows: vec![vec![0]; row_count as usize],
                    bitmaps: None,
                    multi_value: false,
                });
                dim_null_only_types.push(Some(desc.value_type));
            } else {
                let mut cur = Cursor::new(payload);
                dim_columns.push(decode_string_dimension(&mut cur)?);
                dim_null_only_types.push(None);
            }
        }

        let metadata = if container.contains(METADATA_BLOB) {
            let bytes = container.read(METADATA_BLOB)?;
            Some(serde_json::from_slice(&bytes)?)
        } else {
            None
        };

        Ok(Self {
            interval: TimeInterval::new(start, end),
            dimensions: dimension_names,
            metrics: metric_names,
            timestamps,
            dim_columns,
            dim_null_only_types,
            metric_columns,
            metadata,
        })
    }

    fn dimension_index(&self, dimension: &str) -> Option<usize> {
        self.dimensions.iter().position(|d| d == dimension)
    }

    fn cell_for(&self, dim_index: usize, row: usize) -> DimensionCell {
        let column = &self.dim_columns[dim_index];
        let ids = &column.rows[row];
        if ids.len() == 1 && column.dictionary[ids[0] as usize].is_none() {
            return Vec::new();
        }
        ids.iter()
            .map(|&id| column.dictionary[id as usize].clone())
            .collect()
    }
}

impl IndexableAdapter for SegmentAdapter {
    fn data_interval(&self) -> TimeInterval {
        self.interval
    }

    fn dimension_names(&self) -> &[String] {
        &self.dimensions
    }

    fn metric_names(&self) -> &[String] {
        &self.metrics
    }

    fn capabilities(&self, column: &str) -> Option<ColumnCapabilities> {
        if let Some(i) = self.dimension_index(column) {
            if let Some(value_type) = self.dim_null_only_types[i] {
                return Some(ColumnCapabilities::null_only(value_type));
            }
            let decoded = &self.dim_columns[i];
            let mut caps = ColumnCapabilities::string_dimension();
            caps.has_multiple_values = TriState::from(decoded.multi_value);
            caps.has_nulls =
                TriState::from(decoded.dictionary.first().map(|v| v.is_none()).unwrap_or(false));
            caps.has_bitmap_indexes = decoded.bitmaps.is_some();
            return Some(caps);
        }
        let i = self.metrics.iter().position(|m| m == column)?;
        let metric = &self.metric_columns[i];
        Some(match &metric.complex_type_name {
            Some(name) => ColumnCapabilities::complex(name),
            None => ColumnCapabilities::numeric(metric.value_type),
        })
    }

    fn metric_type_name(&self, metric: &str) -> Option<&str> {
        let i = self.metrics.iter().position(|m| m == metric)?;
        self.metric_columns[i].complex_type_name.as_deref()
    }

    fn num_rows(&self) -> usize {
        self.timestamps.len()
    }

    fn time_bounds(&self) -> Option<(Timestamp, Timestamp)> {
        if self.timestamps.is_empty() {
            return None;
        }
        Some((
            self.timestamps[0],
            self.timestamps[self.timestamps.len() - 1],
        ))
    }

    fn dimension_dictionary(&self, dimension: &str) -> Vec<Option<String>> {
        self.dimension_index(dimension)
            .map(|i| self.dim_columns[i].dictionary.clone())
            .unwrap_or_default()
    }

    fn dimension_value_bitmap(&self, dimension: &str, value: Option<&str>) -> RoaringBitmap {
        let Some(dim_index) = self.dimension_index(dimension) else {
            return RoaringBitmap::new();
        };
        let column = &self.dim_columns[dim_index];
        let Some(id) = column
            .dictionary
            .iter()
            .position(|v| v.as_deref() == value)
        else {
            return RoaringBitmap::new();
        };
        if let Some(bitmaps) = &column.bitmaps {
            return bitmaps[id].clone();
        }
        // No stored index (intermediate or null-only column); scan the ids.
        let mut out = RoaringBitmap::new();
        for (row, ids) in column.rows.iter().enumerate() {
            if ids.iter().any(|&i| i as usize == id) {
                out.insert(row as u32);
            }
        }
        out
    }

    fn rows(&self) -> Box<dyn Iterator<Item = MergeRow> + '_> {
        Box::new((0..self.timestamps.len()).map(move |row| {
            let dims: Vec<DimensionCell> = (0..self.dimensions.len())
                .map(|d| self.cell_for(d, row))
                .collect();
            let metrics: Vec<MetricValue> = self
                .metric_columns
                .iter()
                .map(|m| m.values[row].clone())
                .collect();
            MergeRow::new(self.timestamps[row], dims, metrics)
        }))
    }

    fn metadata(&self) -> Option<Metadata> {
        self.metadata.clone()
    }
}

/// Rebuilds the user-declared order from the positional placeholder vector
/// and the non-null name vector. Returns `(name, is_null_only)` pairs.
fn restore_order(
    placeholders: &[Option<String>],
    non_null: &[Option<String>],
) -> Result<Vec<(String, bool)>, MergeError> {
    let mut non_null_iter = non_null.iter();
    let mut out = Vec::with_capacity(placeholders.len());
    for slot in placeholders {
        match slot {
            Some(name) => out.push((name.clone(), true)),
            None => {
                let name = non_null_iter.next().and_then(|v| v.clone()).ok_or_else(|| {
                    MergeError::Corruption {
                        details: "Column order vectors do not zip".to_string(),
                    }
                })?;
                out.push((name, false));
            }
        }
    }
    if non_null_iter.next().is_some() {
        return Err(MergeError::Corruption {
            details: "Column order vectors do not zip".to_string(),
        });
    }
    Ok(out)
}

fn split_column_blob(blob: &[u8]) -> Result<(ColumnDescriptor, &[u8]), MergeError> {
    let mut cur = Cursor::new(blob);
    let desc_len = read_u32(&mut cur)? as usize;
    let desc_start = 4usize;
    let desc_end = desc_start
        .checked_add(desc_len)
        .filter(|&end| end <= blob.len())
        .ok_or_else(|| MergeError::Corruption {
            details: "Truncated column descriptor".to_string(),
        })?;
    let descriptor: ColumnDescriptor = serde_json::from_slice(&blob[desc_start..desc_end])?;
    Ok((descriptor, &blob[desc_end..]))
}

fn decode_time_column(
    desc: &ColumnDescriptor,
    payload: &[u8],
) -> Result<Vec<Timestamp>, MergeError> {
    if desc.value_type != ValueType::Long {
        return Err(MergeError::Corruption {
            details: "Time column is not a long column".to_string(),
        });
    }
    let values = decode_metric_column(crate::types::TIME_COLUMN, desc, payload)?.values;
    values
        .into_iter()
        .map(|v| match v {
            MetricValue::Long(ts) => Ok(ts),
            other => Err(MergeError::Corruption {
                details: format!("Non-long value {:?} in time column", other),
            }),
        })
        .collect()
}

fn decode_metric_column(
    name: &str,
    desc: &ColumnDescriptor,
    payload: &[u8],
) -> Result<DecodedMetric, MergeError> {
    let part = desc.parts.first().ok_or_else(|| MergeError::Corruption {
        details: format!("Column [{}] has no parts", name),
    })?;
    let mut cur = Cursor::new(payload);
    let (values, complex_type_name) = match part {
        ColumnPart::LongNumeric => (decode_numeric_part(NumericKind::Long, false, &mut cur)?, None),
        ColumnPart::LongNumericV2 { .. } => {
            (decode_numeric_part(NumericKind::Long, true, &mut cur)?, None)
        }
        ColumnPart::FloatNumeric => {
            (decode_numeric_part(NumericKind::Float, false, &mut cur)?, None)
        }
        ColumnPart::FloatNumericV2 { .. } => {
            (decode_numeric_part(NumericKind::Float, true, &mut cur)?, None)
        }
        ColumnPart::DoubleNumeric => {
            (decode_numeric_part(NumericKind::Double, false, &mut cur)?, None)
        }
        ColumnPart::DoubleNumericV2 { .. } => {
            (decode_numeric_part(NumericKind::Double, true, &mut cur)?, None)
        }
        ColumnPart::Complex { type_name } => {
            (decode_complex_part(&mut cur)?, Some(type_name.clone()))
        }
        other => {
            return Err(MergeError::Corruption {
                details: format!("Column [{}] has unexpected part {:?}", name, other),
            })
        }
    };
    Ok(DecodedMetric {
        value_type: desc.value_type,
        complex_type_name,
        values,
    })
}

fn null_column_row_count(name: &str, desc: &ColumnDescriptor) -> Result<u32, MergeError> {
    match desc.parts.first() {
        Some(ColumnPart::NullColumn { row_count }) => Ok(*row_count),
        other => Err(MergeError::Corruption {
            details: format!(
                "Null-only column [{}] has unexpected part {:?}",
                name, other
            ),
        }),
    }
}
