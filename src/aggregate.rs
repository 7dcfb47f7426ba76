//! Per-metric aggregators used for rollup combination and recorded in segment
//! metadata.
//!
//! Combine must be associative and commutative: rollup merges rows in key
//! order but inputs may already be partially aggregated, so the metadata for
//! a rolled-up segment stores the *combining* variant of each aggregator.

use serde::{Deserialize, Serialize};

use crate::types::MetricValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AggregatorSpec {
    #[serde(rename_all = "camelCase")]
    LongSum { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    DoubleSum { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    FloatSum { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    LongMin { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    LongMax { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    DoubleMin { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    DoubleMax { name: String, field_name: String },
    Count { name: String },
}

impl AggregatorSpec {
    pub fn long_sum(name: &str) -> Self {
        AggregatorSpec::LongSum {
            name: name.to_string(),
            field_name: name.to_string(),
        }
    }

    pub fn double_sum(name: &str) -> Self {
        AggregatorSpec::DoubleSum {
            name: name.to_string(),
            field_name: name.to_string(),
        }
    }

    pub fn count(name: &str) -> Self {
        AggregatorSpec::Count {
            name: name.to_string(),
        }
    }

    /// Output metric name this aggregator produces.
    pub fn name(&self) -> &str {
        match self {
            AggregatorSpec::LongSum { name, .. }
            | AggregatorSpec::DoubleSum { name, .. }
            | AggregatorSpec::FloatSum { name, .. }
            | AggregatorSpec::LongMin { name, .. }
            | AggregatorSpec::LongMax { name, .. }
            | AggregatorSpec::DoubleMin { name, .. }
            | AggregatorSpec::DoubleMax { name, .. }
            | AggregatorSpec::Count { name } => name,
        }
    }

    /// The aggregator to apply when inputs are already aggregated: it reads
    /// its own output column. A count of counts is a sum.
    pub fn combining(&self) -> AggregatorSpec {
        let name = self.name().to_string();
        match self {
            AggregatorSpec::LongSum { .. } => AggregatorSpec::LongSum {
                field_name: name.clone(),
                name,
            },
            AggregatorSpec::DoubleSum { .. } => AggregatorSpec::DoubleSum {
                field_name: name.clone(),
                name,
            },
            AggregatorSpec::FloatSum { .. } => AggregatorSpec::FloatSum {
                field_name: name.clone(),
                name,
            },
            AggregatorSpec::LongMin { .. } => AggregatorSpec::LongMin {
                field_name: name.clone(),
                name,
            },
            AggregatorSpec::LongMax { .. } => AggregatorSpec::LongMax {
                field_name: name.clone(),
                name,
            },
            AggregatorSpec::DoubleMin { .. } => AggregatorSpec::DoubleMin {
                field_name: name.clone(),
                name,
            },
            AggregatorSpec::DoubleMax { .. } => AggregatorSpec::DoubleMax {
                field_name: name.clone(),
                name,
            },
            AggregatorSpec::Count { .. } => AggregatorSpec::LongSum {
                field_name: name.clone(),
                name,
            },
        }
    }

    /// Combines two already-aggregated values. Null is the identity.
    pub fn combine(&self, a: &MetricValue, b: &MetricValue) -> MetricValue {
        if a.is_null() {
            return b.clone();
        }
        if b.is_null() {
            return a.clone();
        }
        match self {
            AggregatorSpec::LongSum { .. } | AggregatorSpec::Count { .. } => {
                MetricValue::Long(a.as_long().wrapping_add(b.as_long()))
            }
            AggregatorSpec::DoubleSum { .. } => MetricValue::Double(a.as_double() + b.as_double()),
            AggregatorSpec::FloatSum { .. } => MetricValue::Float(a.as_float() + b.as_float()),
            AggregatorSpec::LongMin { .. } => MetricValue::Long(a.as_long().min(b.as_long())),
            AggregatorSpec::LongMax { .. } => MetricValue::Long(a.as_long().max(b.as_long())),
            AggregatorSpec::DoubleMin { .. } => {
                MetricValue::Double(a.as_double().min(b.as_double()))
            }
            AggregatorSpec::DoubleMax { .. } => {
                MetricValue::Double(a.as_double().max(b.as_double()))
            }
        }
    }
}
