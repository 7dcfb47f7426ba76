//! Per-dimension merging: dictionary union, row value encoding, and inverted
//! bitmap index construction.
//!
//! The merger runs a strict three-phase protocol with no back-pointers into
//! the row iterator:
//!   A. [`StringDimensionMerger::write_merged_value_dictionary`] before any
//!      row is processed;
//!   B. [`StringDimensionMerger::process_merged_row`] once per output row in
//!      key order;
//!   C. [`StringDimensionMerger::write_indexes`] after the row walk, with the
//!      finished row-number conversion buffers as an explicit argument.

use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Read, Write};

use roaring::RoaringBitmap;

use crate::adapter::IndexableAdapter;
use crate::capabilities::ColumnCapabilities;
use crate::column::{
    decode_section, encode_section, ColumnDescriptor, ColumnPart, GenericIndexed,
};
use crate::config::IndexSpec;
use crate::error::MergeError;
use crate::types::{cell_values, DimensionCell, ValueType, INVALID_ROW};
use crate::util::{read_u32, read_var_u32, write_u32, write_var_u32};
use crate::writeout::{WriteOutBytes, WriteOutMedium};

pub struct StringDimensionMerger {
    name: String,
    multi_value: bool,
    has_bitmap_index: bool,
    spec: IndexSpec,
    dictionary: Vec<Option<String>>,
    id_of: HashMap<Option<String>, u32>,
    values: Box<dyn WriteOutBytes>,
    rows_written: u32,
    dictionary_written: bool,
    bitmaps: Option<Vec<RoaringBitmap>>,
    finalized: Option<Vec<u8>>,
}

impl StringDimensionMerger {
    pub fn new(
        name: &str,
        capabilities: &ColumnCapabilities,
        spec: &IndexSpec,
        medium: &dyn WriteOutMedium,
    ) -> Result<Self, MergeError> {
        Ok(Self {
            name: name.to_string(),
            multi_value: capabilities.has_multiple_values.is_true(),
            has_bitmap_index: capabilities.has_bitmap_indexes,
            spec: spec.clone(),
            dictionary: Vec::new(),
            id_of: HashMap::new(),
            values: medium.make_bytes()?,
            rows_written: 0,
            dictionary_written: false,
            bitmaps: None,
            finalized: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Phase A: union all input dictionaries into the sorted output
    /// dictionary (null token first). An input that does not know the
    /// dimension contributes all-null rows, so it forces the null token.
    pub fn write_merged_value_dictionary(
        &mut self,
        adapters: &[&dyn IndexableAdapter],
    ) -> Result<(), MergeError> {
        let mut values: BTreeSet<Option<String>> = BTreeSet::new();
        for adapter in adapters {
            if adapter.dimension_names().iter().any(|d| d == &self.name) {
                for value in adapter.dimension_dictionary(&self.name) {
                    values.insert(value);
                }
            } else if adapter.num_rows() > 0 {
                values.insert(None);
            }
        }
        self.dictionary = values.into_iter().collect();
        self.id_of = self
            .dictionary
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i as u32))
            .collect();
        self.dictionary_written = true;
        Ok(())
    }

    /// True when the merged column holds nothing but nulls. Such columns are
    /// omitted or stored as placeholders, never as real dictionary columns.
    pub fn has_only_nulls(&self) -> bool {
        self.dictionary.is_empty()
            || (self.dictionary.len() == 1 && self.dictionary[0].is_none())
    }

    /// Phase B: encode one output row's cell as dictionary ids.
    pub fn process_merged_row(&mut self, cell: &DimensionCell) -> Result<(), MergeError> {
        if !self.dictionary_written {
            return Err(MergeError::Internal(format!(
                "Dimension [{}] processed a row before its dictionary",
                self.name
            )));
        }
        let values = cell_values(cell);
        if !self.multi_value && values.len() > 1 {
            return Err(MergeError::Internal(format!(
                "Multi-value row in single-value dimension [{}]",
                self.name
            )));
        }
        let mut buf = Vec::with_capacity(1 + 5 * values.len());
        if self.multi_value {
            write_var_u32(&mut buf, values.len() as u32);
        }
        for value in values {
            let id = *self.id_of.get(value).ok_or_else(|| {
                MergeError::Internal(format!(
                    "Value missing from merged dictionary of [{}]",
                    self.name
                ))
            })?;
            if self.multi_value {
                write_var_u32(&mut buf, id);
            } else {
                write_u32(&mut buf, id);
            }
        }
        self.values.write_all(&buf)?;
        self.rows_written += 1;
        Ok(())
    }

    /// Phase C: build the inverted index. For each dictionary value, the
    /// per-input bitmaps are remapped through the row-number conversion
    /// buffers and unioned. Inputs without the dimension contribute their
    /// whole row range to the null value.
    pub fn write_indexes(
        &mut self,
        adapters: &[&dyn IndexableAdapter],
        conversions: &[Vec<u32>],
    ) -> Result<(), MergeError> {
        if !self.has_bitmap_index {
            return Ok(());
        }
        if conversions.len() != adapters.len() {
            return Err(MergeError::Internal(format!(
                "Dimension [{}] got {} conversion buffers for {} inputs",
                self.name,
                conversions.len(),
                adapters.len()
            )));
        }

        let mut bitmaps: Vec<RoaringBitmap> = vec![RoaringBitmap::new(); self.dictionary.len()];
        for (input, adapter) in adapters.iter().enumerate() {
            let conversion = &conversions[input];
            let has_dim = adapter.dimension_names().iter().any(|d| d == &self.name);
            for (id, value) in self.dictionary.iter().enumerate() {
                if has_dim {
                    let input_bitmap =
                        adapter.dimension_value_bitmap(&self.name, value.as_deref());
                    remap_into(&input_bitmap, conversion, &mut bitmaps[id]);
                } else if value.is_none() {
                    for row in 0..adapter.num_rows() as u32 {
                        if let Some(&converted) = conversion.get(row as usize) {
                            if converted != INVALID_ROW {
                                bitmaps[id].insert(converted);
                            }
                        }
                    }
                }
            }
        }
        self.bitmaps = Some(bitmaps);
        Ok(())
    }

    /// Builds the final descriptor once phases A-C are complete.
    pub fn make_column_descriptor(&mut self) -> Result<ColumnDescriptor, MergeError> {
        self.ensure_finalized()?;
        Ok(ColumnDescriptor {
            value_type: ValueType::String,
            has_multiple_values: self.multi_value,
            parts: vec![ColumnPart::StringDictionary {
                bitmap_serde: self.spec.bitmap_serde,
                has_bitmap_index: self.has_bitmap_index,
            }],
        })
    }

    pub fn serialized_size(&mut self) -> Result<u64, MergeError> {
        self.ensure_finalized()?;
        Ok(self.finalized.as_ref().map(|b| b.len()).unwrap_or(0) as u64)
    }

    pub fn write_to(&mut self, out: &mut dyn Write) -> Result<(), MergeError> {
        self.ensure_finalized()?;
        let bytes = self
            .finalized
            .as_ref()
            .ok_or_else(|| MergeError::Internal("Finalized payload missing".to_string()))?;
        out.write_all(bytes)?;
        Ok(())
    }

    fn ensure_finalized(&mut self) -> Result<(), MergeError> {
        if self.finalized.is_some() {
            return Ok(());
        }
        if self.has_bitmap_index && self.bitmaps.is_none() {
            return Err(MergeError::Internal(format!(
                "Dimension [{}] finalized before write_indexes",
                self.name
            )));
        }

        let mut part = Vec::new();
        write_u32(&mut part, self.rows_written);
        part.push(self.multi_value as u8);
        part.push(self.has_bitmap_index as u8);

        let dict = GenericIndexed::new(self.dictionary.clone());
        dict.write_to(&mut part);

        let raw_values = self.values.read_fully()?;
        part.extend_from_slice(&encode_section(
            self.spec.dimension_compression,
            &raw_values,
        )?);

        if self.has_bitmap_index {
            let bitmaps = self
                .bitmaps
                .as_ref()
                .ok_or_else(|| MergeError::Internal("Bitmaps missing".to_string()))?;
            write_u32(&mut part, bitmaps.len() as u32);
            for bitmap in bitmaps {
                let mut bytes = Vec::with_capacity(bitmap.serialized_size());
                bitmap
                    .serialize_into(&mut bytes)
                    .map_err(|e| MergeError::Serialization(e.to_string()))?;
                write_u32(&mut part, bytes.len() as u32);
                part.extend_from_slice(&bytes);
            }
        }

        self.finalized = Some(part);
        Ok(())
    }
}

fn remap_into(input: &RoaringBitmap, conversion: &[u32], out: &mut RoaringBitmap) {
    for row in input.iter() {
        if let Some(&converted) = conversion.get(row as usize) {
            if converted != INVALID_ROW {
                out.insert(converted);
            }
        }
    }
}

/// Decoded form of a string dictionary column, used when a segment is
/// reopened as a merge input.
#[derive(Debug, Clone)]
pub(crate) struct DecodedDimension {
    pub dictionary: Vec<Option<String>>,
    /// Per row, the dictionary ids of the cell in order.
    pub rows: Vec<Vec<u32>>,
    pub bitmaps: Option<Vec<RoaringBitmap>>,
    pub multi_value: bool,
}

pub(crate) fn decode_string_dimension(
    cur: &mut Cursor<&[u8]>,
) -> Result<DecodedDimension, MergeError> {
    let row_count = read_u32(cur)? as usize;
    let mut flags = [0u8; 2];
    cur.read_exact(&mut flags)?;
    let multi_value = flags[0] != 0;
    let has_bitmap = flags[1] != 0;

    let dictionary = GenericIndexed::read_from(cur)?.into_items();

    let values = decode_section(cur)?;
    let mut vcur = Cursor::new(&values[..]);
    let mut rows = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        if multi_value {
            let count = read_var_u32(&mut vcur)? as usize;
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                ids.push(read_var_u32(&mut vcur)?);
            }
            rows.push(ids);
        } else {
            rows.push(vec![read_u32(&mut vcur)?]);
        }
    }
    for ids in &rows {
        for &id in ids {
            if id as usize >= dictionary.len() {
                return Err(MergeError::Corruption {
                    details: "Dictionary id out of range".to_string(),
                });
            }
        }
    }

    let bitmaps = if has_bitmap {
        let count = read_u32(cur)? as usize;
        if count != dictionary.len() {
            return Err(MergeError::Corruption {
                details: "Bitmap count does not match dictionary".to_string(),
            });
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let len = read_u32(cur)? as usize;
            let mut bytes = vec![0u8; len];
            cur.read_exact(&mut bytes)?;
            out.push(
                RoaringBitmap::deserialize_from(&bytes[..]).map_err(|e| {
                    MergeError::Corruption {
                        details: format!("Bad value bitmap: {}", e),
                    }
                })?,
            );
        }
        Some(out)
    } else {
        None
    };

    Ok(DecodedDimension {
        dictionary,
        rows,
        bitmaps,
        multi_value,
    })
}
