//! Registry of complex-metric serdes, keyed by type name.
//!
//! Complex metric values travel through the merge as opaque bytes; the serde
//! registered for the metric's type name owns their on-disk encoding. The
//! registry is populated once at process start and shared by reference.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::MergeError;

/// Encoder for one complex metric type.
pub trait ComplexMetricSerde: Send + Sync {
    fn type_name(&self) -> &str;

    /// Encodes one value for storage. The default passes bytes through.
    fn serialize_value(&self, value: &[u8]) -> Result<Vec<u8>, MergeError> {
        Ok(value.to_vec())
    }
}

/// Pass-through serde for types whose in-memory and on-disk forms coincide.
#[derive(Debug)]
pub struct OpaqueComplexSerde {
    type_name: String,
}

impl OpaqueComplexSerde {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
        }
    }
}

impl ComplexMetricSerde for OpaqueComplexSerde {
    fn type_name(&self) -> &str {
        &self.type_name
    }
}

/// String-keyed serde lookup.
#[derive(Default)]
pub struct ComplexSerdeRegistry {
    by_name: HashMap<String, Arc<dyn ComplexMetricSerde>>,
}

impl ComplexSerdeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, serde: Arc<dyn ComplexMetricSerde>) {
        self.by_name.insert(serde.type_name().to_string(), serde);
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn ComplexMetricSerde>> {
        self.by_name.get(type_name).cloned()
    }

    /// Lookup that fails with the typed error used across the merge path.
    pub fn require(&self, type_name: &str) -> Result<Arc<dyn ComplexMetricSerde>, MergeError> {
        self.get(type_name)
            .ok_or_else(|| MergeError::UnknownComplexType(type_name.to_string()))
    }
}

impl std::fmt::Debug for ComplexSerdeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplexSerdeRegistry")
            .field("types", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}
