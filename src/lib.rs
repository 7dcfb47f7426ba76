#![doc = r#"
lithos: columnar segment builder for time-series stores

This crate merges one or more sorted, row-oriented time-series inputs into a
single immutable, column-organized on-disk segment. It is the ingestion-path
core of an analytical time-series store: the component that turns accumulated
in-memory rows (or previously built segments) into the canonical queryable
file format. It provides:
- A k-way row-merge iterator over timestamp-sorted inputs, with optional
  rollup combining equal `(time, dims...)` keys through per-metric aggregators
- Dictionary-encoded dimension columns with inverted roaring-bitmap indexes
- Numeric and complex metric columns in legacy and null-bitmap encodings
- A bounded multi-file blob container with an in-container directory
- A multi-phase merge driver that caps column fan-in by merging in tiers

The crate is a library with no CLI; callers are ingestion pipelines and
intermediate-persist code.
"#]

// Declare modules
pub mod adapter;
pub mod aggregate;
pub mod capabilities;
pub mod column;
pub mod complex;
pub mod config;
pub mod dimension;
pub mod error;
pub mod loader;
pub mod merger;
pub mod meta;
pub mod progress;
pub mod rowiter;
pub mod smoosh;
pub mod telemetry;
pub mod types;
mod util;
pub mod writeout;

/// Main entry point: builds and merges segments.
pub use crate::merger::{SegmentMerger, UNLIMITED_MAX_COLUMNS_TO_MERGE};
/// Error type for build and merge operations.
pub use crate::error::MergeError;
/// Merge input contract and the in-memory implementation.
pub use crate::adapter::{IndexableAdapter, MetricSchema, RowBatchAdapter};
/// Reopens a built segment as a merge input.
pub use crate::loader::SegmentAdapter;
/// Output options for one merge invocation.
pub use crate::config::{
    BitmapSerde, CompressionFormat, DimensionsSpec, IndexSpec, LongEncoding, NullHandling,
    SegmentizerFactory,
};
/// Per-metric aggregators used by rollup.
pub use crate::aggregate::AggregatorSpec;
/// Segment-level aggregation metadata.
pub use crate::meta::Metadata;
/// Progress hook for long merges.
pub use crate::progress::{NoopProgressIndicator, ProgressIndicator};
/// Row and interval primitives.
pub use crate::types::{
    DimensionCell, MergeRow, MetricValue, TimeInterval, Timestamp, ValueType, INVALID_ROW,
    TIME_COLUMN,
};
/// Complex-metric serde registry.
pub use crate::complex::{ComplexMetricSerde, ComplexSerdeRegistry, OpaqueComplexSerde};
/// Scratch buffer placement for column serializers.
pub use crate::writeout::WriteOutType;

/// On-disk segment format version, written big-endian into `version.bin`.
pub const SEGMENT_FORMAT_VERSION: i32 = 9;
