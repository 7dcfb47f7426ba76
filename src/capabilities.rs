//! Per-column typing/encoding metadata and the rules for folding it across
//! merge inputs.

use crate::error::MergeError;
use crate::types::ValueType;

/// Three-valued flag for capabilities that may be unreported by an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriState {
    True,
    False,
    Unknown,
}

impl TriState {
    /// Logical OR; `Unknown` behaves as the operator's identity (false).
    pub fn or(self, other: TriState) -> TriState {
        match (self, other) {
            (TriState::True, _) | (_, TriState::True) => TriState::True,
            (TriState::Unknown, x) | (x, TriState::Unknown) => x,
            _ => TriState::False,
        }
    }

    /// Logical AND; `Unknown` behaves as the operator's identity (true).
    pub fn and(self, other: TriState) -> TriState {
        match (self, other) {
            (TriState::False, _) | (_, TriState::False) => TriState::False,
            (TriState::Unknown, x) | (x, TriState::Unknown) => x,
            _ => TriState::True,
        }
    }

    pub fn is_true(self) -> bool {
        self == TriState::True
    }

    /// Resolves `Unknown` against a coercion default.
    pub fn coerce(self, default: bool) -> TriState {
        match self {
            TriState::Unknown => TriState::from(default),
            other => other,
        }
    }
}

impl From<bool> for TriState {
    fn from(b: bool) -> Self {
        if b {
            TriState::True
        } else {
            TriState::False
        }
    }
}

/// Defaults substituted for `Unknown` flags when snapshotting capabilities
/// before a merge.
#[derive(Debug, Clone, Copy)]
pub struct CoercionPolicy {
    pub dictionary_encoded: bool,
    pub dictionary_values_sorted: bool,
    pub dictionary_values_unique: bool,
    pub multiple_values: bool,
    pub has_nulls: bool,
}

/// Dimensions come out of a persisted index dictionary-encoded, sorted,
/// unique, single-valued, and null-free unless stated otherwise.
pub const DIMENSION_COERCION: CoercionPolicy = CoercionPolicy {
    dictionary_encoded: true,
    dictionary_values_sorted: true,
    dictionary_values_unique: true,
    multiple_values: false,
    has_nulls: false,
};

pub const METRIC_COERCION: CoercionPolicy = CoercionPolicy {
    dictionary_encoded: false,
    dictionary_values_sorted: false,
    dictionary_values_unique: false,
    multiple_values: false,
    has_nulls: false,
};

/// Per-column attributes used to decide column structure and to validate that
/// inputs are compatible.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnCapabilities {
    pub value_type: ValueType,
    pub element_type: Option<ValueType>,
    pub complex_type_name: Option<String>,
    pub dictionary_encoded: TriState,
    pub dictionary_values_sorted: TriState,
    pub dictionary_values_unique: TriState,
    pub has_multiple_values: TriState,
    pub has_nulls: TriState,
    pub has_bitmap_indexes: bool,
    pub has_spatial_indexes: bool,
    pub filterable: bool,
}

impl ColumnCapabilities {
    /// Capabilities of a dictionary-encoded string dimension with a bitmap
    /// index.
    pub fn string_dimension() -> Self {
        Self {
            value_type: ValueType::String,
            element_type: None,
            complex_type_name: None,
            dictionary_encoded: TriState::True,
            dictionary_values_sorted: TriState::True,
            dictionary_values_unique: TriState::True,
            has_multiple_values: TriState::False,
            has_nulls: TriState::False,
            has_bitmap_indexes: true,
            has_spatial_indexes: false,
            filterable: true,
        }
    }

    /// Capabilities of a plain numeric metric column.
    pub fn numeric(value_type: ValueType) -> Self {
        Self {
            value_type,
            element_type: None,
            complex_type_name: None,
            dictionary_encoded: TriState::False,
            dictionary_values_sorted: TriState::False,
            dictionary_values_unique: TriState::False,
            has_multiple_values: TriState::False,
            has_nulls: TriState::False,
            has_bitmap_indexes: false,
            has_spatial_indexes: false,
            filterable: false,
        }
    }

    pub fn complex(type_name: &str) -> Self {
        Self {
            value_type: ValueType::Complex,
            element_type: None,
            complex_type_name: Some(type_name.to_string()),
            dictionary_encoded: TriState::False,
            dictionary_values_sorted: TriState::False,
            dictionary_values_unique: TriState::False,
            has_multiple_values: TriState::False,
            has_nulls: TriState::False,
            has_bitmap_indexes: false,
            has_spatial_indexes: false,
            filterable: false,
        }
    }

    /// Capabilities reported for a null-only column placeholder. Null-only
    /// columns never carry bitmap indexes.
    pub fn null_only(value_type: ValueType) -> Self {
        Self {
            value_type,
            element_type: None,
            complex_type_name: None,
            dictionary_encoded: TriState::True,
            dictionary_values_sorted: TriState::True,
            dictionary_values_unique: TriState::True,
            has_multiple_values: TriState::False,
            has_nulls: TriState::True,
            has_bitmap_indexes: false,
            has_spatial_indexes: false,
            filterable: true,
        }
    }

    /// Returns a copy with every `Unknown` flag resolved against the policy.
    pub fn snapshot(&self, policy: &CoercionPolicy) -> ColumnCapabilities {
        let mut out = self.clone();
        out.dictionary_encoded = out.dictionary_encoded.coerce(policy.dictionary_encoded);
        out.dictionary_values_sorted = out
            .dictionary_values_sorted
            .coerce(policy.dictionary_values_sorted);
        out.dictionary_values_unique = out
            .dictionary_values_unique
            .coerce(policy.dictionary_values_unique);
        out.has_multiple_values = out.has_multiple_values.coerce(policy.multiple_values);
        out.has_nulls = out.has_nulls.coerce(policy.has_nulls);
        out
    }

    fn type_signature(&self) -> String {
        match (&self.complex_type_name, &self.element_type) {
            (Some(name), _) => format!("{}<{}>", self.value_type, name),
            (None, Some(elem)) => format!("{}[{}]", self.value_type, elem),
            (None, None) => self.value_type.to_string(),
        }
    }
}

/// Folds two capability snapshots into one. Either side may be absent (column
/// missing from one input); type disagreement is an error.
pub fn merge_capabilities(
    a: Option<&ColumnCapabilities>,
    b: Option<&ColumnCapabilities>,
    policy: &CoercionPolicy,
) -> Result<Option<ColumnCapabilities>, MergeError> {
    let a = a.map(|c| c.snapshot(policy));
    let b = b.map(|c| c.snapshot(policy));
    let (mut merged, other) = match (a, b) {
        (None, None) => return Ok(None),
        (Some(a), None) => return Ok(Some(a)),
        (None, Some(b)) => return Ok(Some(b)),
        (Some(a), Some(b)) => (a, b),
    };

    if merged.value_type != other.value_type
        || merged.element_type != other.element_type
        || merged.complex_type_name != other.complex_type_name
    {
        return Err(MergeError::IncompatibleColumnTypes {
            left: merged.type_signature(),
            right: other.type_signature(),
        });
    }

    merged.dictionary_encoded = merged.dictionary_encoded.or(other.dictionary_encoded);
    merged.has_multiple_values = merged.has_multiple_values.or(other.has_multiple_values);
    merged.has_nulls = merged.has_nulls.or(other.has_nulls);
    merged.dictionary_values_sorted = merged
        .dictionary_values_sorted
        .and(other.dictionary_values_sorted);
    merged.dictionary_values_unique = merged
        .dictionary_values_unique
        .and(other.dictionary_values_unique);
    merged.filterable = merged.filterable && other.filterable;

    // A null-only column never has bitmap indexes, so a flag mismatch here
    // usually means a real column met its null-only counterpart. The merged
    // value stays false; the ingestion spec restores the flag downstream.
    if merged.has_bitmap_indexes != other.has_bitmap_indexes {
        merged.has_bitmap_indexes = false;
    }
    if merged.has_spatial_indexes != other.has_spatial_indexes {
        merged.has_spatial_indexes = merged.has_spatial_indexes || other.has_spatial_indexes;
    }

    Ok(Some(merged))
}
