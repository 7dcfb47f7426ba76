//! Column descriptors and serializers.
//!
//! Every column blob in the container is a length-prefixed UTF-8 JSON
//! [`ColumnDescriptor`] followed by the payload bytes of its parts. Numeric
//! parts exist in a legacy form (null encoded as the type's zero) and a V2
//! form carrying an explicit roaring null bitmap plus the segment's bitmap
//! serde identifier.

use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::complex::ComplexMetricSerde;
use crate::config::{BitmapSerde, CompressionFormat, IndexSpec, LongEncoding, NullHandling};
use crate::error::MergeError;
use crate::types::{MetricValue, ValueType};
use crate::util::{
    crc32, read_i64, read_u32, read_zigzag_i64, write_i64, write_u32, write_zigzag_i64,
};
use crate::writeout::{WriteOutBytes, WriteOutMedium};

pub(crate) const COMPRESS_NONE: u8 = 0;
pub(crate) const COMPRESS_LZ4: u8 = 1;
pub(crate) const COMPRESS_ZSTD: u8 = 2;

pub(crate) const LONG_ENC_RAW: u8 = 1;
pub(crate) const LONG_ENC_DELTA_ZIGZAG: u8 = 2;

/// Serialized description of a column: its logical type and the ordered parts
/// making up the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub value_type: ValueType,
    pub has_multiple_values: bool,
    pub parts: Vec<ColumnPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ColumnPart {
    LongNumeric,
    #[serde(rename_all = "camelCase")]
    LongNumericV2 { bitmap_serde: BitmapSerde },
    FloatNumeric,
    #[serde(rename_all = "camelCase")]
    FloatNumericV2 { bitmap_serde: BitmapSerde },
    DoubleNumeric,
    #[serde(rename_all = "camelCase")]
    DoubleNumericV2 { bitmap_serde: BitmapSerde },
    #[serde(rename_all = "camelCase")]
    Complex { type_name: String },
    #[serde(rename_all = "camelCase")]
    StringDictionary {
        bitmap_serde: BitmapSerde,
        has_bitmap_index: bool,
    },
    #[serde(rename_all = "camelCase")]
    NullColumn { row_count: u32 },
}

// --- GenericIndexed ---

/// Random-access serialization of a sequence of (possibly null) strings:
/// a version byte, the element count, an offset table, and the packed slots.
/// Used for the column/dimension name vectors in `index.drd` and for
/// dimension dictionaries.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericIndexed {
    items: Vec<Option<String>>,
}

const GENERIC_INDEXED_VERSION: u8 = 1;

impl GenericIndexed {
    pub fn new(items: Vec<Option<String>>) -> Self {
        Self { items }
    }

    pub fn from_strings<I: IntoIterator<Item = String>>(items: I) -> Self {
        Self {
            items: items.into_iter().map(Some).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&str> {
        self.items.get(i).and_then(|v| v.as_deref())
    }

    pub fn items(&self) -> &[Option<String>] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Option<String>> {
        self.items
    }

    pub fn serialized_size(&self) -> u64 {
        let payload: u64 = self
            .items
            .iter()
            .map(|item| 1 + item.as_ref().map(|s| s.len()).unwrap_or(0) as u64)
            .sum();
        1 + 4 + 4 * (self.items.len() as u64 + 1) + payload
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(GENERIC_INDEXED_VERSION);
        write_u32(out, self.items.len() as u32);
        let mut offset = 0u32;
        let mut offsets = Vec::with_capacity(self.items.len() + 1);
        offsets.push(0u32);
        for item in &self.items {
            offset += 1 + item.as_ref().map(|s| s.len()).unwrap_or(0) as u32;
            offsets.push(offset);
        }
        for off in offsets {
            write_u32(out, off);
        }
        for item in &self.items {
            match item {
                Some(s) => {
                    out.push(1);
                    out.extend_from_slice(s.as_bytes());
                }
                None => out.push(0),
            }
        }
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, MergeError> {
        let mut version = [0u8; 1];
        r.read_exact(&mut version)?;
        if version[0] != GENERIC_INDEXED_VERSION {
            return Err(MergeError::Corruption {
                details: format!("Unsupported indexed-strings version {}", version[0]),
            });
        }
        let count = read_u32(r)? as usize;
        let mut offsets = Vec::with_capacity(count + 1);
        for _ in 0..=count {
            offsets.push(read_u32(r)?);
        }
        let payload_len = *offsets.last().unwrap_or(&0) as usize;
        let mut payload = vec![0u8; payload_len];
        r.read_exact(&mut payload)?;

        let mut items = Vec::with_capacity(count);
        for i in 0..count {
            let start = offsets[i] as usize;
            let end = offsets[i + 1] as usize;
            if start >= end || end > payload.len() {
                return Err(MergeError::Corruption {
                    details: "Indexed-strings offsets out of bounds".to_string(),
                });
            }
            match payload[start] {
                0 => items.push(None),
                1 => {
                    let s = std::str::from_utf8(&payload[start + 1..end]).map_err(|e| {
                        MergeError::Corruption {
                            details: format!("Invalid UTF-8 in indexed strings: {}", e),
                        }
                    })?;
                    items.push(Some(s.to_string()));
                }
                other => {
                    return Err(MergeError::Corruption {
                        details: format!("Bad indexed-strings slot flag {}", other),
                    })
                }
            }
        }
        Ok(Self { items })
    }
}

// --- compressed value sections ---

/// Encodes a value payload as a self-describing section:
/// compression byte, parameter, uncompressed length + crc, stored length,
/// stored bytes.
pub(crate) fn encode_section(
    compression: CompressionFormat,
    payload: &[u8],
) -> Result<Vec<u8>, MergeError> {
    let (codec, param, stored): (u8, u32, Vec<u8>) = match compression {
        CompressionFormat::None => (COMPRESS_NONE, 0, payload.to_vec()),
        CompressionFormat::Lz4 => (COMPRESS_LZ4, 0, lz4_flex::compress_prepend_size(payload)),
        CompressionFormat::Zstd { level } => {
            let compressed = zstd::bulk::compress(payload, level)
                .map_err(|e| MergeError::Internal(format!("Zstd compress failed: {}", e)))?;
            (COMPRESS_ZSTD, u32::from_le_bytes(level.to_le_bytes()), compressed)
        }
    };

    let mut out = Vec::with_capacity(17 + stored.len());
    out.push(codec);
    write_u32(&mut out, param);
    write_u32(&mut out, payload.len() as u32);
    write_u32(&mut out, crc32(payload));
    write_u32(&mut out, stored.len() as u32);
    out.extend_from_slice(&stored);
    Ok(out)
}

pub(crate) fn decode_section(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>, MergeError> {
    let mut codec = [0u8; 1];
    cur.read_exact(&mut codec)?;
    let _param = read_u32(cur)?;
    let uncompressed_len = read_u32(cur)? as usize;
    let expected_crc = read_u32(cur)?;
    let stored_len = read_u32(cur)? as usize;
    let mut stored = vec![0u8; stored_len];
    cur.read_exact(&mut stored)?;

    let payload = match codec[0] {
        COMPRESS_NONE => stored,
        COMPRESS_LZ4 => lz4_flex::decompress_size_prepended(&stored).map_err(|e| {
            MergeError::Corruption {
                details: format!("LZ4 decompress failed: {}", e),
            }
        })?,
        COMPRESS_ZSTD => {
            zstd::bulk::decompress(&stored, uncompressed_len).map_err(|e| {
                MergeError::Corruption {
                    details: format!("Zstd decompress failed: {}", e),
                }
            })?
        }
        other => {
            return Err(MergeError::Corruption {
                details: format!("Unknown compression codec {}", other),
            })
        }
    };
    if payload.len() != uncompressed_len {
        return Err(MergeError::Corruption {
            details: "Section decompressed length mismatch".to_string(),
        });
    }
    if crc32(&payload) != expected_crc {
        return Err(MergeError::Corruption {
            details: "Section payload CRC mismatch".to_string(),
        });
    }
    Ok(payload)
}

// --- column serializers ---

/// Contract every column writer follows: `open` once, `serialize` once per
/// output row in row order, then `serialized_size`/`write_to` at flush time.
pub trait ColumnSerializer {
    fn open(&mut self) -> Result<(), MergeError>;
    fn serialize(&mut self, value: &MetricValue) -> Result<(), MergeError>;
    fn serialized_size(&mut self) -> Result<u64, MergeError>;
    fn write_to(&mut self, out: &mut dyn Write) -> Result<(), MergeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NumericKind {
    Long,
    Float,
    Double,
}

/// Serializer for LONG/FLOAT/DOUBLE columns. In V2 form nulls go to a roaring
/// bitmap and the value slot holds the type's zero; in legacy form the zero is
/// all that remains of a null.
pub struct NumericColumnSerializer {
    kind: NumericKind,
    v2: bool,
    compression: CompressionFormat,
    long_encoding: LongEncoding,
    values: Box<dyn WriteOutBytes>,
    nulls: RoaringBitmap,
    row_count: u32,
    opened: bool,
    finalized: Option<Vec<u8>>,
}

impl NumericColumnSerializer {
    fn new(
        kind: NumericKind,
        v2: bool,
        spec: &IndexSpec,
        medium: &dyn WriteOutMedium,
    ) -> Result<Self, MergeError> {
        Ok(Self {
            kind,
            v2,
            compression: spec.metric_compression,
            long_encoding: spec.long_encoding,
            values: medium.make_bytes()?,
            nulls: RoaringBitmap::new(),
            row_count: 0,
            opened: false,
            finalized: None,
        })
    }

    fn ensure_finalized(&mut self) -> Result<(), MergeError> {
        if self.finalized.is_some() {
            return Ok(());
        }
        let raw = self.values.read_fully()?;

        let values_payload = match (self.kind, self.long_encoding) {
            (NumericKind::Long, LongEncoding::DeltaZigZag) => {
                let mut cur = Cursor::new(&raw[..]);
                let mut out = Vec::new();
                out.push(LONG_ENC_DELTA_ZIGZAG);
                if self.row_count > 0 {
                    let first = read_i64(&mut cur)?;
                    write_i64(&mut out, first);
                    let mut prev = first;
                    for _ in 1..self.row_count {
                        let v = read_i64(&mut cur)?;
                        write_zigzag_i64(&mut out, v.wrapping_sub(prev));
                        prev = v;
                    }
                }
                out
            }
            _ => {
                let mut out = Vec::with_capacity(1 + raw.len());
                out.push(LONG_ENC_RAW);
                out.extend_from_slice(&raw);
                out
            }
        };

        let mut part = Vec::new();
        write_u32(&mut part, self.row_count);
        if self.v2 {
            let mut bitmap = Vec::with_capacity(self.nulls.serialized_size());
            self.nulls
                .serialize_into(&mut bitmap)
                .map_err(|e| MergeError::Serialization(e.to_string()))?;
            write_u32(&mut part, bitmap.len() as u32);
            part.extend_from_slice(&bitmap);
        }
        part.extend_from_slice(&encode_section(self.compression, &values_payload)?);
        self.finalized = Some(part);
        Ok(())
    }
}

impl ColumnSerializer for NumericColumnSerializer {
    fn open(&mut self) -> Result<(), MergeError> {
        self.opened = true;
        Ok(())
    }

    fn serialize(&mut self, value: &MetricValue) -> Result<(), MergeError> {
        if !self.opened {
            return Err(MergeError::Internal(
                "Column serializer used before open()".to_string(),
            ));
        }
        if self.finalized.is_some() {
            return Err(MergeError::Internal(
                "Column serializer used after finalization".to_string(),
            ));
        }
        if value.is_null() {
            self.nulls.insert(self.row_count);
        }
        match self.kind {
            NumericKind::Long => self.values.write_all(&value.as_long().to_le_bytes())?,
            NumericKind::Float => self
                .values
                .write_all(&value.as_float().to_bits().to_le_bytes())?,
            NumericKind::Double => self
                .values
                .write_all(&value.as_double().to_bits().to_le_bytes())?,
        }
        self.row_count += 1;
        Ok(())
    }

    fn serialized_size(&mut self) -> Result<u64, MergeError> {
        self.ensure_finalized()?;
        Ok(self.finalized.as_ref().map(|b| b.len()).unwrap_or(0) as u64)
    }

    fn write_to(&mut self, out: &mut dyn Write) -> Result<(), MergeError> {
        self.ensure_finalized()?;
        let bytes = self
            .finalized
            .as_ref()
            .ok_or_else(|| MergeError::Internal("Finalized payload missing".to_string()))?;
        out.write_all(bytes)?;
        Ok(())
    }
}

/// Serializer for complex metric columns: length-offset table plus the blob
/// of serde-encoded values. Nulls are empty slots.
pub struct ComplexColumnSerializer {
    serde: Arc<dyn ComplexMetricSerde>,
    lengths: Vec<u32>,
    blob: Box<dyn WriteOutBytes>,
    opened: bool,
    finalized: Option<Vec<u8>>,
}

impl ComplexColumnSerializer {
    pub(crate) fn new(
        serde: Arc<dyn ComplexMetricSerde>,
        medium: &dyn WriteOutMedium,
    ) -> Result<Self, MergeError> {
        Ok(Self {
            serde,
            lengths: Vec::new(),
            blob: medium.make_bytes()?,
            opened: false,
            finalized: None,
        })
    }

    fn ensure_finalized(&mut self) -> Result<(), MergeError> {
        if self.finalized.is_some() {
            return Ok(());
        }
        let blob = self.blob.read_fully()?;
        let mut part = Vec::with_capacity(4 + 4 * (self.lengths.len() + 1) + blob.len());
        write_u32(&mut part, self.lengths.len() as u32);
        let mut offset = 0u32;
        write_u32(&mut part, 0);
        for len in &self.lengths {
            offset += len;
            write_u32(&mut part, offset);
        }
        part.extend_from_slice(&blob);
        self.finalized = Some(part);
        Ok(())
    }
}

impl ColumnSerializer for ComplexColumnSerializer {
    fn open(&mut self) -> Result<(), MergeError> {
        self.opened = true;
        Ok(())
    }

    fn serialize(&mut self, value: &MetricValue) -> Result<(), MergeError> {
        if !self.opened {
            return Err(MergeError::Internal(
                "Column serializer used before open()".to_string(),
            ));
        }
        match value {
            MetricValue::Null => self.lengths.push(0),
            MetricValue::Complex(bytes) => {
                let encoded = self.serde.serialize_value(bytes)?;
                self.blob.write_all(&encoded)?;
                self.lengths.push(encoded.len() as u32);
            }
            other => {
                return Err(MergeError::Internal(format!(
                    "Complex column [{}] fed a non-complex value {:?}",
                    self.serde.type_name(),
                    other
                )))
            }
        }
        Ok(())
    }

    fn serialized_size(&mut self) -> Result<u64, MergeError> {
        self.ensure_finalized()?;
        Ok(self.finalized.as_ref().map(|b| b.len()).unwrap_or(0) as u64)
    }

    fn write_to(&mut self, out: &mut dyn Write) -> Result<(), MergeError> {
        self.ensure_finalized()?;
        let bytes = self
            .finalized
            .as_ref()
            .ok_or_else(|| MergeError::Internal("Finalized payload missing".to_string()))?;
        out.write_all(bytes)?;
        Ok(())
    }
}

/// Builds the long column serializer for the null-handling mode: legacy when
/// nulls are replaced with defaults (older readers stay compatible), V2
/// otherwise.
pub(crate) fn create_long_serializer(
    medium: &dyn WriteOutMedium,
    spec: &IndexSpec,
    null_handling: NullHandling,
) -> Result<NumericColumnSerializer, MergeError> {
    NumericColumnSerializer::new(
        NumericKind::Long,
        !null_handling.replace_with_default(),
        spec,
        medium,
    )
}

pub(crate) fn create_float_serializer(
    medium: &dyn WriteOutMedium,
    spec: &IndexSpec,
    null_handling: NullHandling,
) -> Result<NumericColumnSerializer, MergeError> {
    NumericColumnSerializer::new(
        NumericKind::Float,
        !null_handling.replace_with_default(),
        spec,
        medium,
    )
}

pub(crate) fn create_double_serializer(
    medium: &dyn WriteOutMedium,
    spec: &IndexSpec,
    null_handling: NullHandling,
) -> Result<NumericColumnSerializer, MergeError> {
    NumericColumnSerializer::new(
        NumericKind::Double,
        !null_handling.replace_with_default(),
        spec,
        medium,
    )
}

/// Descriptor part for a numeric column under the given null-handling mode.
pub(crate) fn numeric_part(
    value_type: ValueType,
    spec: &IndexSpec,
    null_handling: NullHandling,
) -> Result<ColumnPart, MergeError> {
    let legacy = null_handling.replace_with_default();
    Ok(match (value_type, legacy) {
        (ValueType::Long, true) => ColumnPart::LongNumeric,
        (ValueType::Long, false) => ColumnPart::LongNumericV2 {
            bitmap_serde: spec.bitmap_serde,
        },
        (ValueType::Float, true) => ColumnPart::FloatNumeric,
        (ValueType::Float, false) => ColumnPart::FloatNumericV2 {
            bitmap_serde: spec.bitmap_serde,
        },
        (ValueType::Double, true) => ColumnPart::DoubleNumeric,
        (ValueType::Double, false) => ColumnPart::DoubleNumericV2 {
            bitmap_serde: spec.bitmap_serde,
        },
        (other, _) => {
            return Err(MergeError::Internal(format!(
                "Not a numeric column type: {}",
                other
            )))
        }
    })
}

// --- decoding (loader side) ---

/// Decoded numeric part: per-row values with nulls restored from the V2
/// bitmap when present.
pub(crate) fn decode_numeric_part(
    kind: NumericKind,
    v2: bool,
    cur: &mut Cursor<&[u8]>,
) -> Result<Vec<MetricValue>, MergeError> {
    let row_count = read_u32(cur)? as usize;
    let nulls = if v2 {
        let len = read_u32(cur)? as usize;
        let mut bytes = vec![0u8; len];
        cur.read_exact(&mut bytes)?;
        RoaringBitmap::deserialize_from(&bytes[..]).map_err(|e| MergeError::Corruption {
            details: format!("Bad null bitmap: {}", e),
        })?
    } else {
        RoaringBitmap::new()
    };

    let section = decode_section(cur)?;
    if section.is_empty() {
        return Err(MergeError::Corruption {
            details: "Empty numeric value section".to_string(),
        });
    }
    let enc = section[0];
    let mut vcur = Cursor::new(&section[1..]);

    let mut out = Vec::with_capacity(row_count);
    match kind {
        NumericKind::Long => match enc {
            LONG_ENC_RAW => {
                for i in 0..row_count {
                    let v = read_i64(&mut vcur)?;
                    out.push(numeric_or_null(&nulls, i, MetricValue::Long(v)));
                }
            }
            LONG_ENC_DELTA_ZIGZAG => {
                if row_count > 0 {
                    let first = read_i64(&mut vcur)?;
                    out.push(numeric_or_null(&nulls, 0, MetricValue::Long(first)));
                    let mut prev = first;
                    for i in 1..row_count {
                        let delta = read_zigzag_i64(&mut vcur)?;
                        prev = prev.wrapping_add(delta);
                        out.push(numeric_or_null(&nulls, i, MetricValue::Long(prev)));
                    }
                }
            }
            other => {
                return Err(MergeError::Corruption {
                    details: format!("Unknown long encoding {}", other),
                })
            }
        },
        NumericKind::Float => {
            for i in 0..row_count {
                let bits = read_u32(&mut vcur)?;
                out.push(numeric_or_null(
                    &nulls,
                    i,
                    MetricValue::Float(f32::from_bits(bits)),
                ));
            }
        }
        NumericKind::Double => {
            for i in 0..row_count {
                let v = read_i64(&mut vcur)?;
                out.push(numeric_or_null(
                    &nulls,
                    i,
                    MetricValue::Double(f64::from_bits(v as u64)),
                ));
            }
        }
    }
    Ok(out)
}

fn numeric_or_null(nulls: &RoaringBitmap, row: usize, value: MetricValue) -> MetricValue {
    if nulls.contains(row as u32) {
        MetricValue::Null
    } else {
        value
    }
}

pub(crate) fn decode_complex_part(cur: &mut Cursor<&[u8]>) -> Result<Vec<MetricValue>, MergeError> {
    let row_count = read_u32(cur)? as usize;
    let mut offsets = Vec::with_capacity(row_count + 1);
    for _ in 0..=row_count {
        offsets.push(read_u32(cur)?);
    }
    let blob_len = *offsets.last().unwrap_or(&0) as usize;
    let mut blob = vec![0u8; blob_len];
    cur.read_exact(&mut blob)?;

    let mut out = Vec::with_capacity(row_count);
    for i in 0..row_count {
        let start = offsets[i] as usize;
        let end = offsets[i + 1] as usize;
        if start > end || end > blob.len() {
            return Err(MergeError::Corruption {
                details: "Complex column offsets out of bounds".to_string(),
            });
        }
        if start == end {
            out.push(MetricValue::Null);
        } else {
            out.push(MetricValue::Complex(blob[start..end].to_vec()));
        }
    }
    Ok(out)
}
