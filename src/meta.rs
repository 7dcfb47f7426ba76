//! Segment-level metadata written to `metadata.drd`.

use serde::{Deserialize, Serialize};

use crate::aggregate::AggregatorSpec;
use crate::types::Timestamp;

/// Aggregation/rollup metadata carried by a segment. Serialized as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregators: Option<Vec<AggregatorSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_granularity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<Timestamp>,
}

impl Metadata {
    pub fn new() -> Self {
        Self {
            aggregators: None,
            query_granularity: None,
            rollup: None,
            ingested_at: None,
        }
    }

    /// Folds per-input metadata into one. Returns `None` when any input lacks
    /// metadata (nothing trustworthy to carry forward). Fields on which the
    /// inputs disagree are dropped rather than guessed. `combining_aggregators`
    /// overrides the stored aggregators; inputs may already be partially
    /// aggregated, so the merged segment must record combining variants.
    pub fn merge(
        all: &[Option<Metadata>],
        combining_aggregators: Option<Vec<AggregatorSpec>>,
    ) -> Option<Metadata> {
        if all.is_empty() || all.iter().any(|m| m.is_none()) {
            return None;
        }
        let items: Vec<&Metadata> = all.iter().map(|m| m.as_ref().expect("checked above")).collect();

        let first = items[0];
        let granularity = if items
            .iter()
            .all(|m| m.query_granularity == first.query_granularity)
        {
            first.query_granularity.clone()
        } else {
            None
        };
        let rollup = if items.iter().all(|m| m.rollup == first.rollup) {
            first.rollup
        } else {
            None
        };
        let aggregators = match combining_aggregators {
            Some(aggs) => Some(aggs),
            None => {
                if items.iter().all(|m| m.aggregators == first.aggregators) {
                    first.aggregators.clone()
                } else {
                    None
                }
            }
        };
        let ingested_at = items.iter().filter_map(|m| m.ingested_at).max();

        Some(Metadata {
            aggregators,
            query_granularity: granularity,
            rollup,
            ingested_at,
        })
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}
