//! Segment assembly: merges sorted inputs into one immutable columnar
//! segment directory, in tiers when the column fan-in is capped.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use roaring::RoaringBitmap;
use tempfile::TempDir;

use crate::adapter::{IndexableAdapter, SchemaProjection};
use crate::aggregate::AggregatorSpec;
use crate::capabilities::{
    merge_capabilities, ColumnCapabilities, DIMENSION_COERCION, METRIC_COERCION,
};
use crate::column::{
    create_double_serializer, create_float_serializer, create_long_serializer, numeric_part,
    ColumnDescriptor, ColumnPart, ColumnSerializer, ComplexColumnSerializer, GenericIndexed,
};
use crate::complex::ComplexSerdeRegistry;
use crate::config::{
    DimensionsSpec, DimensionsSpecInspector, IndexSpec, NullHandling, SegmentizerFactory,
};
use crate::dimension::StringDimensionMerger;
use crate::error::MergeError;
use crate::loader::SegmentAdapter;
use crate::meta::Metadata;
use crate::progress::{NoopProgressIndicator, ProgressIndicator};
use crate::rowiter::{MergedRowStream, MergingRowIterator, RowCombiningIterator, RowOrigin};
use crate::smoosh::{Smoosher, SmooshWriter};
use crate::telemetry;
use crate::types::{
    MergeRow, MetricValue, TimeInterval, Timestamp, ValueType, INVALID_ROW, TIME_COLUMN,
};
use crate::util::{write_i64, write_string};
use crate::writeout::{make_medium, WriteOutType};
use crate::SEGMENT_FORMAT_VERSION;

/// `max_columns_to_merge` value disabling tiered merging.
pub const UNLIMITED_MAX_COLUMNS_TO_MERGE: i32 = -1;

const SECTION_DIM_CONVERSIONS: &str = "setup dimension conversions";
const SECTION_WALK_ROWS: &str = "walk through and merge rows";
const SECTION_BUILD_COLUMNS: &str = "build inverted index and columns";
const SECTION_INDEX_BLOB: &str = "make index.drd";
const SECTION_METADATA_BLOB: &str = "make metadata.drd";

/// Which merged-row iterator a build uses.
enum RowMergerKind {
    Merging,
    Combining(Vec<AggregatorSpec>),
}

/// Builds immutable columnar segments out of sorted row inputs.
///
/// One merger instance is reusable across invocations; each invocation owns a
/// scoped write-out medium and a container writer which are released on every
/// exit path. Distinct invocations on disjoint output directories may run in
/// parallel; two merges on the same output directory are undefined.
pub struct SegmentMerger {
    null_handling: NullHandling,
    store_empty_columns: bool,
    write_out: WriteOutType,
    complex_registry: Arc<ComplexSerdeRegistry>,
}

impl SegmentMerger {
    pub fn new(null_handling: NullHandling, store_empty_columns: bool) -> Self {
        Self {
            null_handling,
            store_empty_columns,
            write_out: WriteOutType::OnHeap,
            complex_registry: Arc::new(ComplexSerdeRegistry::new()),
        }
    }

    pub fn with_complex_registry(mut self, registry: Arc<ComplexSerdeRegistry>) -> Self {
        self.complex_registry = registry;
        self
    }

    pub fn with_write_out(mut self, write_out: WriteOutType) -> Self {
        self.write_out = write_out;
        self
    }

    /// Persists a single input as a segment. The given interval must
    /// encapsulate every timestamp in the input.
    pub fn persist(
        &self,
        input: &dyn IndexableAdapter,
        data_interval: TimeInterval,
        out_dir: &Path,
        index_spec: &IndexSpec,
        progress: &dyn ProgressIndicator,
    ) -> Result<PathBuf, MergeError> {
        if input.num_rows() == 0 {
            return Err(MergeError::InvalidInput(
                "Trying to persist an empty index".to_string(),
            ));
        }
        if let Some((min_ts, max_ts)) = input.time_bounds() {
            if !(data_interval.contains(min_ts) && data_interval.contains(max_ts)) {
                return Err(MergeError::InvalidInput(format!(
                    "Interval [{}, {}) does not encapsulate the full range of timestamps [{}, {}]",
                    data_interval.start, data_interval.end, min_ts, max_ts
                )));
            }
        }
        let aggregators = input
            .metadata()
            .and_then(|m| m.aggregators)
            .unwrap_or_default();
        let pinned = IntervalOverrideAdapter {
            inner: input,
            interval: data_interval,
        };
        let inputs: [&dyn IndexableAdapter; 1] = [&pinned];
        // A single input needs no reordering rollup; merging it under the
        // plain iterator keeps already-rolled-up data as-is.
        self.multiphase_merge(
            &inputs,
            false,
            &aggregators,
            None,
            out_dir,
            index_spec,
            index_spec,
            progress,
            UNLIMITED_MAX_COLUMNS_TO_MERGE,
        )
    }

    /// Merges inputs into `out_dir` with default progress reporting and the
    /// same spec for intermediate tiers.
    pub fn merge(
        &self,
        inputs: &[&dyn IndexableAdapter],
        rollup: bool,
        aggregators: &[AggregatorSpec],
        dimensions_spec: Option<&DimensionsSpec>,
        out_dir: &Path,
        index_spec: &IndexSpec,
        max_columns_to_merge: i32,
    ) -> Result<PathBuf, MergeError> {
        self.multiphase_merge(
            inputs,
            rollup,
            aggregators,
            dimensions_spec,
            out_dir,
            index_spec,
            index_spec,
            &NoopProgressIndicator,
            max_columns_to_merge,
        )
    }

    /// Full-control merge: distinct final/intermediate specs and a caller
    /// progress hook.
    #[allow(clippy::too_many_arguments)]
    pub fn merge_with(
        &self,
        inputs: &[&dyn IndexableAdapter],
        rollup: bool,
        aggregators: &[AggregatorSpec],
        dimensions_spec: Option<&DimensionsSpec>,
        out_dir: &Path,
        index_spec: &IndexSpec,
        intermediate_index_spec: &IndexSpec,
        progress: &dyn ProgressIndicator,
        max_columns_to_merge: i32,
    ) -> Result<PathBuf, MergeError> {
        self.multiphase_merge(
            inputs,
            rollup,
            aggregators,
            dimensions_spec,
            out_dir,
            index_spec,
            intermediate_index_spec,
            progress,
            max_columns_to_merge,
        )
    }

    /// Wipes the output directory, then merges in tiers whenever the unioned
    /// column count exceeds the cap. Intermediate tiers land in temp
    /// directories (removed as soon as each tier is reopened); the last tier
    /// is promoted into `out_dir` with the final spec.
    #[allow(clippy::too_many_arguments)]
    fn multiphase_merge(
        &self,
        inputs: &[&dyn IndexableAdapter],
        rollup: bool,
        aggregators: &[AggregatorSpec],
        dimensions_spec: Option<&DimensionsSpec>,
        out_dir: &Path,
        index_spec: &IndexSpec,
        intermediate_index_spec: &IndexSpec,
        progress: &dyn ProgressIndicator,
        max_columns_to_merge: i32,
    ) -> Result<PathBuf, MergeError> {
        if inputs.is_empty() {
            return Err(MergeError::InvalidInput(
                "No inputs to merge".to_string(),
            ));
        }
        if out_dir.exists() {
            std::fs::remove_dir_all(out_dir)?;
        }
        std::fs::create_dir_all(out_dir)?;

        if max_columns_to_merge == UNLIMITED_MAX_COLUMNS_TO_MERGE || max_columns_to_merge < 0 {
            telemetry::record_merge_phase();
            return self.merge_single_phase(
                inputs,
                rollup,
                aggregators,
                dimensions_spec,
                out_dir,
                index_spec,
                progress,
            );
        }

        let mut current: Vec<MergeInput<'_>> =
            inputs.iter().map(|a| MergeInput::Borrowed(*a)).collect();
        loop {
            let next = {
                let refs: Vec<&dyn IndexableAdapter> =
                    current.iter().map(|m| m.as_dyn()).collect();
                let phases = merge_phases(&refs, max_columns_to_merge);
                if phases.len() == 1 {
                    telemetry::record_merge_phase();
                    let phase_refs: Vec<&dyn IndexableAdapter> =
                        phases[0].iter().map(|&i| refs[i]).collect();
                    return self.merge_single_phase(
                        &phase_refs,
                        rollup,
                        aggregators,
                        dimensions_spec,
                        out_dir,
                        index_spec,
                        progress,
                    );
                }

                let mut tier_dirs: Vec<TempDir> = Vec::with_capacity(phases.len());
                for phase in &phases {
                    telemetry::record_merge_phase();
                    let phase_refs: Vec<&dyn IndexableAdapter> =
                        phase.iter().map(|&i| refs[i]).collect();
                    let tmp = TempDir::with_prefix("segment-merge-")?;
                    self.merge_single_phase(
                        &phase_refs,
                        rollup,
                        aggregators,
                        dimensions_spec,
                        tmp.path(),
                        intermediate_index_spec,
                        progress,
                    )?;
                    tier_dirs.push(tmp);
                }

                // Reopen this tier's outputs as inputs for the next one. The
                // adapters decode eagerly, so the temp directories can go
                // away right here (TempDir drop swallows removal failures).
                let mut next = Vec::with_capacity(tier_dirs.len());
                for dir in &tier_dirs {
                    next.push(MergeInput::Owned(Box::new(SegmentAdapter::open(
                        dir.path(),
                    )?)));
                }
                next
            };
            current = next;
        }
    }

    /// One complete segment build from a fixed set of inputs.
    #[allow(clippy::too_many_arguments)]
    fn merge_single_phase(
        &self,
        adapters: &[&dyn IndexableAdapter],
        rollup: bool,
        aggregators: &[AggregatorSpec],
        dimensions_spec: Option<&DimensionsSpec>,
        out_dir: &Path,
        index_spec: &IndexSpec,
        progress: &dyn ProgressIndicator,
    ) -> Result<PathBuf, MergeError> {
        let total_rows: usize = adapters.iter().map(|a| a.num_rows()).sum();
        if total_rows == 0 {
            return Err(MergeError::InvalidInput(
                "Trying to persist an empty index".to_string(),
            ));
        }

        let merged_dimensions = merged_dimension_names(adapters, dimensions_spec);
        let merged_metrics = merged_metric_names(adapters);

        let mut names: HashSet<&str> = HashSet::new();
        for name in merged_dimensions.iter().chain(merged_metrics.iter()) {
            if !names.insert(name.as_str()) {
                return Err(MergeError::InvalidInput(format!(
                    "Column names are not unique: [{}] appears in both dimensions and metrics",
                    name
                )));
            }
        }

        let positioned_aggregators =
            position_aggregators(&merged_metrics, aggregators, rollup)?;

        let row_merger = if rollup {
            RowMergerKind::Combining(positioned_aggregators.clone())
        } else {
            RowMergerKind::Merging
        };

        self.make_index_files(
            adapters,
            &positioned_aggregators,
            out_dir,
            progress,
            &merged_dimensions,
            &DimensionsSpecInspector::new(self.store_empty_columns, dimensions_spec),
            &merged_metrics,
            row_merger,
            true,
            index_spec,
        )
    }

    /// The canonical build sequence: capabilities, dictionaries, row walk,
    /// column flush, `index.drd`, `metadata.drd`, container commit.
    #[allow(clippy::too_many_arguments)]
    fn make_index_files(
        &self,
        adapters: &[&dyn IndexableAdapter],
        aggregators: &[AggregatorSpec],
        out_dir: &Path,
        progress: &dyn ProgressIndicator,
        merged_dimensions: &[String],
        inspector: &DimensionsSpecInspector,
        merged_metrics: &[String],
        row_merger: RowMergerKind,
        fill_row_num_conversions: bool,
        index_spec: &IndexSpec,
    ) -> Result<PathBuf, MergeError> {
        progress.start();
        progress.progress();

        let combining = if aggregators.is_empty() {
            None
        } else {
            Some(aggregators.iter().map(|a| a.combining()).collect())
        };
        let metadata_list: Vec<Option<Metadata>> =
            adapters.iter().map(|a| a.metadata()).collect();
        let segment_metadata = Metadata::merge(&metadata_list, combining);

        std::fs::create_dir_all(out_dir)?;
        let medium = make_medium(self.write_out, out_dir)?;
        let mut smoosher = Smoosher::new(out_dir)?;

        std::fs::write(
            out_dir.join("version.bin"),
            SEGMENT_FORMAT_VERSION.to_be_bytes(),
        )?;
        let loader = index_spec
            .segment_loader
            .clone()
            .unwrap_or(SegmentizerFactory::Mmap);
        std::fs::write(out_dir.join("factory.json"), serde_json::to_vec(&loader)?)?;

        progress.progress();
        let (dim_capabilities, metric_types, metric_type_names) =
            merge_input_capabilities(adapters, merged_dimensions, merged_metrics)?;

        let mut dim_mergers: Vec<StringDimensionMerger> =
            Vec::with_capacity(merged_dimensions.len());
        for (i, name) in merged_dimensions.iter().enumerate() {
            dim_mergers.push(make_dimension_merger(
                name,
                &dim_capabilities[i],
                index_spec,
                medium.as_ref(),
            )?);
        }

        progress.start_section(SECTION_DIM_CONVERSIONS);
        for merger in &mut dim_mergers {
            merger.write_merged_value_dictionary(adapters)?;
        }
        progress.stop_section(SECTION_DIM_CONVERSIONS);

        progress.progress();
        let mut time_writer =
            create_long_serializer(medium.as_ref(), index_spec, self.null_handling)?;
        time_writer.open()?;
        let mut metric_writers: Vec<Box<dyn ColumnSerializer>> =
            Vec::with_capacity(merged_metrics.len());
        for metric in merged_metrics {
            let mut writer: Box<dyn ColumnSerializer> = match metric_types[metric] {
                ValueType::Long => Box::new(create_long_serializer(
                    medium.as_ref(),
                    index_spec,
                    self.null_handling,
                )?),
                ValueType::Float => Box::new(create_float_serializer(
                    medium.as_ref(),
                    index_spec,
                    self.null_handling,
                )?),
                ValueType::Double => Box::new(create_double_serializer(
                    medium.as_ref(),
                    index_spec,
                    self.null_handling,
                )?),
                ValueType::Complex => {
                    let type_name = metric_type_names.get(metric).ok_or_else(|| {
                        MergeError::UnknownComplexType(format!(
                            "<missing type name for metric {}>",
                            metric
                        ))
                    })?;
                    let serde = self.complex_registry.require(type_name)?;
                    Box::new(ComplexColumnSerializer::new(serde, medium.as_ref())?)
                }
                ValueType::String => {
                    return Err(MergeError::InvalidInput(format!(
                        "Metric [{}] has a string type; strings are dimensions",
                        metric
                    )))
                }
            };
            writer.open()?;
            metric_writers.push(writer);
        }

        let projections: Vec<SchemaProjection> = adapters
            .iter()
            .map(|a| SchemaProjection::new(*a, merged_dimensions, merged_metrics))
            .collect();
        let sources: Vec<Box<dyn Iterator<Item = MergeRow> + '_>> = adapters
            .iter()
            .zip(projections)
            .map(|(adapter, projection)| {
                Box::new(adapter.rows().map(move |row| projection.project(row)))
                    as Box<dyn Iterator<Item = MergeRow> + '_>
            })
            .collect();
        let mut row_stream: Box<dyn MergedRowStream + '_> = match row_merger {
            RowMergerKind::Merging => Box::new(MergingRowIterator::new(sources)),
            RowMergerKind::Combining(aggs) => {
                Box::new(RowCombiningIterator::new(sources, aggs))
            }
        };

        progress.start_section(SECTION_WALK_ROWS);
        let mut conversions: Option<Vec<Vec<u32>>> = if fill_row_num_conversions {
            Some(
                adapters
                    .iter()
                    .map(|a| Vec::with_capacity(a.num_rows()))
                    .collect(),
            )
        } else {
            None
        };
        let mut row_count: u32 = 0;
        while row_stream.move_to_next() {
            progress.progress();
            let row = row_stream.current();
            time_writer.serialize(&MetricValue::Long(row.timestamp))?;
            for (i, writer) in metric_writers.iter_mut().enumerate() {
                writer.serialize(&row.metrics[i])?;
            }
            for (d, merger) in dim_mergers.iter_mut().enumerate() {
                if merger.has_only_nulls() {
                    continue;
                }
                merger.process_merged_row(&row.dims[d])?;
            }

            if let Some(conversions) = conversions.as_mut() {
                match row_stream.origin() {
                    RowOrigin::Single { input, row_num } => {
                        fold_into(&mut conversions[input], row_num, row_count);
                    }
                    RowOrigin::Combined(ranges) => {
                        for (input, range) in ranges.iter().enumerate() {
                            if let Some((min, max)) = range {
                                for row_num in *min..=*max {
                                    fold_into(&mut conversions[input], row_num, row_count);
                                }
                            }
                        }
                    }
                    RowOrigin::Unknown => {
                        return Err(MergeError::UnsupportedIteratorForConversion)
                    }
                }
            }
            row_count += 1;
        }
        if let Some(conversions) = conversions.as_mut() {
            for (input, adapter) in adapters.iter().enumerate() {
                conversions[input].resize(adapter.num_rows(), INVALID_ROW);
            }
        }
        telemetry::record_rows_merged(row_count as u64);
        progress.stop_section(SECTION_WALK_ROWS);

        progress.start_section(SECTION_BUILD_COLUMNS);
        let time_descriptor = ColumnDescriptor {
            value_type: ValueType::Long,
            has_multiple_values: false,
            parts: vec![numeric_part(ValueType::Long, index_spec, self.null_handling)?],
        };
        write_serializer_column(
            &mut smoosher,
            TIME_COLUMN,
            &time_descriptor,
            time_writer.serialized_size()?,
            &mut time_writer,
        )?;

        for (i, metric) in merged_metrics.iter().enumerate() {
            let descriptor = ColumnDescriptor {
                value_type: metric_types[metric],
                has_multiple_values: false,
                parts: vec![match metric_types[metric] {
                    ValueType::Complex => ColumnPart::Complex {
                        type_name: metric_type_names[metric].clone(),
                    },
                    numeric => numeric_part(numeric, index_spec, self.null_handling)?,
                }],
            };
            let size = metric_writers[i].serialized_size()?;
            write_serializer_column(
                &mut smoosher,
                metric,
                &descriptor,
                size,
                metric_writers[i].as_mut(),
            )?;
        }

        let conversion_slices: &[Vec<u32>] = conversions.as_deref().unwrap_or(&[]);
        for (i, merger) in dim_mergers.iter_mut().enumerate() {
            merger.write_indexes(adapters, conversion_slices)?;
            if !merger.has_only_nulls() {
                let descriptor = merger.make_column_descriptor()?;
                let size = merger.serialized_size()?;
                let json = serde_json::to_string(&descriptor)?;
                let mut head = Vec::with_capacity(4 + json.len());
                write_string(&mut head, &json);
                let mut writer =
                    smoosher.writer(&merged_dimensions[i], head.len() as u64 + size)?;
                writer.write_all(&head)?;
                merger.write_to(&mut writer)?;
                writer.finish()?;
            } else if inspector.should_store(&merged_dimensions[i]) {
                let descriptor = ColumnDescriptor {
                    value_type: dim_capabilities[i].value_type,
                    has_multiple_values: false,
                    parts: vec![ColumnPart::NullColumn { row_count }],
                };
                let json = serde_json::to_string(&descriptor)?;
                let mut head = Vec::with_capacity(4 + json.len());
                write_string(&mut head, &json);
                smoosher.add(&merged_dimensions[i], &head)?;
            }
        }
        progress.stop_section(SECTION_BUILD_COLUMNS);

        progress.start_section(SECTION_INDEX_BLOB);
        let index_blob = build_index_blob(
            adapters,
            merged_dimensions,
            merged_metrics,
            &dim_mergers,
            inspector,
            index_spec,
        )?;
        smoosher.add("index.drd", &index_blob)?;
        progress.stop_section(SECTION_INDEX_BLOB);

        if let Some(metadata) = &segment_metadata {
            progress.start_section(SECTION_METADATA_BLOB);
            smoosher.add("metadata.drd", &serde_json::to_vec(metadata)?)?;
            progress.stop_section(SECTION_METADATA_BLOB);
        }

        smoosher.close()?;
        telemetry::record_segment_built();
        progress.stop();
        Ok(out_dir.to_path_buf())
    }
}

impl Default for SegmentMerger {
    fn default() -> Self {
        Self::new(NullHandling::SqlCompatible, true)
    }
}

/// Pads the conversion buffer with the invalid sentinel up to `row_num`, then
/// records the output row it folded into.
fn fold_into(buffer: &mut Vec<u32>, row_num: u32, output_row: u32) {
    while (buffer.len() as u32) < row_num {
        buffer.push(INVALID_ROW);
    }
    buffer.push(output_row);
}

enum MergeInput<'a> {
    Borrowed(&'a dyn IndexableAdapter),
    Owned(Box<SegmentAdapter>),
}

impl MergeInput<'_> {
    fn as_dyn(&self) -> &dyn IndexableAdapter {
        match self {
            MergeInput::Borrowed(a) => *a,
            MergeInput::Owned(a) => a.as_ref(),
        }
    }
}

/// Forwarding adapter that pins the data interval reported to the build (the
/// persist entry point takes the segment interval from the caller).
struct IntervalOverrideAdapter<'a> {
    inner: &'a dyn IndexableAdapter,
    interval: TimeInterval,
}

impl IndexableAdapter for IntervalOverrideAdapter<'_> {
    fn data_interval(&self) -> TimeInterval {
        self.interval
    }

    fn dimension_names(&self) -> &[String] {
        self.inner.dimension_names()
    }

    fn metric_names(&self) -> &[String] {
        self.inner.metric_names()
    }

    fn capabilities(&self, column: &str) -> Option<ColumnCapabilities> {
        self.inner.capabilities(column)
    }

    fn metric_type_name(&self, metric: &str) -> Option<&str> {
        self.inner.metric_type_name(metric)
    }

    fn num_rows(&self) -> usize {
        self.inner.num_rows()
    }

    fn time_bounds(&self) -> Option<(Timestamp, Timestamp)> {
        self.inner.time_bounds()
    }

    fn dimension_dictionary(&self, dimension: &str) -> Vec<Option<String>> {
        self.inner.dimension_dictionary(dimension)
    }

    fn dimension_value_bitmap(&self, dimension: &str, value: Option<&str>) -> RoaringBitmap {
        self.inner.dimension_value_bitmap(dimension, value)
    }

    fn rows(&self) -> Box<dyn Iterator<Item = MergeRow> + '_> {
        self.inner.rows()
    }

    fn metadata(&self) -> Option<Metadata> {
        self.inner.metadata()
    }
}

/// Unified dimension list: the declared order when a spec provides one,
/// discovered dimensions appended in first-seen order.
fn merged_dimension_names(
    adapters: &[&dyn IndexableAdapter],
    dimensions_spec: Option<&DimensionsSpec>,
) -> Vec<String> {
    let mut out: Vec<String> = match dimensions_spec {
        Some(spec) if !spec.dimension_names.is_empty() => spec.dimension_names.clone(),
        _ => Vec::new(),
    };
    for adapter in adapters {
        for dim in adapter.dimension_names() {
            if !out.contains(dim) {
                out.push(dim.clone());
            }
        }
    }
    out
}

/// Unified metric list: order-preserving union across inputs.
fn merged_metric_names(adapters: &[&dyn IndexableAdapter]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for adapter in adapters {
        for metric in adapter.metric_names() {
            if !out.contains(metric) {
                out.push(metric.clone());
            }
        }
    }
    out
}

/// Positions aggregators by the merged metric list. Every aggregator must
/// name a metric in the union, and when any aggregators are supplied every
/// metric must have one.
fn position_aggregators(
    merged_metrics: &[String],
    aggregators: &[AggregatorSpec],
    rollup: bool,
) -> Result<Vec<AggregatorSpec>, MergeError> {
    if aggregators.is_empty() {
        if rollup && !merged_metrics.is_empty() {
            return Err(MergeError::InvalidInput(
                "Rollup requires an aggregator for every metric".to_string(),
            ));
        }
        return Ok(Vec::new());
    }
    let mut slots: Vec<Option<AggregatorSpec>> = vec![None; merged_metrics.len()];
    for aggregator in aggregators {
        match merged_metrics.iter().position(|m| m == aggregator.name()) {
            Some(i) => slots[i] = Some(aggregator.clone()),
            None => {
                return Err(MergeError::InvalidInput(format!(
                    "Requested metric [{}] not present in any input",
                    aggregator.name()
                )))
            }
        }
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            slot.ok_or_else(|| {
                MergeError::InvalidInput(format!(
                    "Inputs to merge contained metric [{}], but requested metrics did not",
                    merged_metrics[i]
                ))
            })
        })
        .collect()
}

type CapabilityMergeOutput = (
    Vec<ColumnCapabilities>,
    HashMap<String, ValueType>,
    HashMap<String, String>,
);

/// Folds per-column capabilities across inputs; fails on type disagreement.
fn merge_input_capabilities(
    adapters: &[&dyn IndexableAdapter],
    merged_dimensions: &[String],
    merged_metrics: &[String],
) -> Result<CapabilityMergeOutput, MergeError> {
    let mut merged: HashMap<String, ColumnCapabilities> = HashMap::new();
    let mut metric_types: HashMap<String, ValueType> = HashMap::new();
    let mut metric_type_names: HashMap<String, String> = HashMap::new();

    for adapter in adapters {
        for dimension in adapter.dimension_names() {
            let capabilities = adapter.capabilities(dimension).ok_or_else(|| {
                MergeError::InvalidInput(format!(
                    "Input declares dimension [{}] without capabilities",
                    dimension
                ))
            })?;
            let folded = merge_capabilities(
                Some(&capabilities),
                merged.get(dimension),
                &DIMENSION_COERCION,
            )?;
            if let Some(folded) = folded {
                merged.insert(dimension.clone(), folded);
            }
        }
        for metric in adapter.metric_names() {
            let capabilities = adapter.capabilities(metric).ok_or_else(|| {
                MergeError::InvalidInput(format!(
                    "Input declares metric [{}] without capabilities",
                    metric
                ))
            })?;
            let folded =
                merge_capabilities(Some(&capabilities), merged.get(metric), &METRIC_COERCION)?;
            if let Some(folded) = folded {
                metric_types.insert(metric.clone(), folded.value_type);
                merged.insert(metric.clone(), folded);
            }
            if let Some(type_name) = adapter.metric_type_name(metric) {
                metric_type_names.insert(metric.clone(), type_name.to_string());
            }
        }
    }

    let mut dim_capabilities = Vec::with_capacity(merged_dimensions.len());
    for dimension in merged_dimensions {
        let capabilities = merged.get(dimension).cloned().unwrap_or_else(|| {
            // Dimension declared by the dimensions spec but absent from every
            // input: a null-only string column.
            ColumnCapabilities::null_only(ValueType::String)
        });
        dim_capabilities.push(capabilities);
    }
    for metric in merged_metrics {
        if !metric_types.contains_key(metric) {
            return Err(MergeError::InvalidInput(format!(
                "Metric [{}] has no resolvable type",
                metric
            )));
        }
    }
    Ok((dim_capabilities, metric_types, metric_type_names))
}

fn make_dimension_merger(
    name: &str,
    capabilities: &ColumnCapabilities,
    index_spec: &IndexSpec,
    medium: &dyn crate::writeout::WriteOutMedium,
) -> Result<StringDimensionMerger, MergeError> {
    if capabilities.value_type != ValueType::String {
        return Err(MergeError::InvalidInput(format!(
            "Dimension [{}] has unsupported type [{}]",
            name, capabilities.value_type
        )));
    }
    StringDimensionMerger::new(name, capabilities, index_spec, medium)
}

/// Writes one column blob: length-prefixed descriptor JSON, then the
/// serializer payload.
fn write_serializer_column(
    smoosher: &mut Smoosher,
    name: &str,
    descriptor: &ColumnDescriptor,
    payload_size: u64,
    serializer: &mut dyn ColumnSerializer,
) -> Result<(), MergeError> {
    let json = serde_json::to_string(descriptor)?;
    let mut head = Vec::with_capacity(4 + json.len());
    write_string(&mut head, &json);
    let mut writer: SmooshWriter<'_> = smoosher.writer(name, head.len() as u64 + payload_size)?;
    writer.write_all(&head)?;
    serializer.write_to(&mut writer)?;
    writer.finish()
}

/// Assembles `index.drd`: non-null column/dimension vectors, the data
/// interval, the bitmap serde identifier, and the positional null-placeholder
/// vectors (null-only names last so older readers can truncate them away).
fn build_index_blob(
    adapters: &[&dyn IndexableAdapter],
    merged_dimensions: &[String],
    merged_metrics: &[String],
    dim_mergers: &[StringDimensionMerger],
    inspector: &DimensionsSpecInspector,
    index_spec: &IndexSpec,
) -> Result<Vec<u8>, MergeError> {
    let mut non_null_columns: Vec<Option<String>> =
        merged_metrics.iter().cloned().map(Some).collect();
    let mut non_null_dimensions: Vec<Option<String>> = Vec::new();
    let mut all_columns: Vec<Option<String>> = vec![None; merged_metrics.len()];
    let mut all_dimensions: Vec<Option<String>> = Vec::new();

    for (i, dimension) in merged_dimensions.iter().enumerate() {
        if !dim_mergers[i].has_only_nulls() {
            non_null_columns.push(Some(dimension.clone()));
            non_null_dimensions.push(Some(dimension.clone()));
            all_columns.push(None);
            all_dimensions.push(None);
        } else if inspector.should_store(dimension) {
            all_columns.push(Some(dimension.clone()));
            all_dimensions.push(Some(dimension.clone()));
        }
    }

    let interval = adapters
        .iter()
        .map(|a| a.data_interval())
        .reduce(|a, b| a.union(&b))
        .ok_or_else(|| MergeError::InvalidInput("No inputs to merge".to_string()))?;

    let mut blob = Vec::new();
    GenericIndexed::new(non_null_columns).write_to(&mut blob);
    GenericIndexed::new(non_null_dimensions).write_to(&mut blob);
    write_i64(&mut blob, interval.start);
    write_i64(&mut blob, interval.end);
    write_string(&mut blob, &serde_json::to_string(&index_spec.bitmap_serde)?);
    GenericIndexed::new(all_columns).write_to(&mut blob);
    GenericIndexed::new(all_dimensions).write_to(&mut blob);
    Ok(blob)
}

/// Greedy phase partition: accumulate inputs until the next one would push
/// the unioned column count (one extra per input for the time column) past
/// the cap, but never split below two inputs per phase.
fn merge_phases(adapters: &[&dyn IndexableAdapter], max_columns_to_merge: i32) -> Vec<Vec<usize>> {
    let max = max_columns_to_merge.max(0) as usize;
    if adapters.len() <= 2 {
        return vec![(0..adapters.len()).collect()];
    }
    let mut phases: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_columns = 0usize;
    for (i, adapter) in adapters.iter().enumerate() {
        let columns = adapter_column_count(*adapter);
        if current.len() > 1 && current_columns + columns > max {
            phases.push(std::mem::take(&mut current));
            current_columns = columns;
            current.push(i);
        } else {
            current.push(i);
            current_columns += columns;
        }
    }
    if !current.is_empty() {
        phases.push(current);
    }
    phases
}

fn adapter_column_count(adapter: &dyn IndexableAdapter) -> usize {
    // +1 for the time column.
    1 + adapter.dimension_names().len() + adapter.metric_names().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MetricSchema, RowBatchAdapter};

    fn adapter_with_columns(dims: usize, metrics: usize) -> RowBatchAdapter {
        let dim_names: Vec<String> = (0..dims).map(|i| format!("d{}", i)).collect();
        let metric_schemas: Vec<MetricSchema> = (0..metrics)
            .map(|i| MetricSchema::numeric(&format!("m{}", i), ValueType::Long))
            .collect();
        let row = MergeRow::new(
            1,
            vec![vec![Some("v".to_string())]; dims],
            vec![MetricValue::Long(1); metrics],
        );
        RowBatchAdapter::new(
            TimeInterval::new(0, 10),
            dim_names,
            metric_schemas,
            vec![row],
            None,
        )
        .unwrap()
    }

    #[test]
    fn phases_respect_column_cap_and_pair_minimum() {
        let adapters: Vec<RowBatchAdapter> =
            (0..10).map(|_| adapter_with_columns(2, 1)).collect();
        let refs: Vec<&dyn IndexableAdapter> =
            adapters.iter().map(|a| a as &dyn IndexableAdapter).collect();
        // Each input counts 4 columns (time + 2 dims + 1 metric).
        let phases = merge_phases(&refs, 8);
        assert_eq!(phases.len(), 5);
        for phase in &phases {
            assert_eq!(phase.len(), 2);
        }
    }

    #[test]
    fn two_inputs_always_merge_in_one_phase() {
        let adapters: Vec<RowBatchAdapter> =
            (0..2).map(|_| adapter_with_columns(20, 10)).collect();
        let refs: Vec<&dyn IndexableAdapter> =
            adapters.iter().map(|a| a as &dyn IndexableAdapter).collect();
        let phases = merge_phases(&refs, 4);
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].len(), 2);
    }

    #[test]
    fn aggregator_positioning_validates_both_directions() {
        let metrics = vec!["a".to_string(), "b".to_string()];
        let aggs = vec![AggregatorSpec::long_sum("a")];
        // Metric b has no aggregator.
        assert!(matches!(
            position_aggregators(&metrics, &aggs, true),
            Err(MergeError::InvalidInput(_))
        ));
        // Aggregator names a metric that no input carries.
        let aggs = vec![
            AggregatorSpec::long_sum("a"),
            AggregatorSpec::long_sum("b"),
            AggregatorSpec::long_sum("ghost"),
        ];
        assert!(matches!(
            position_aggregators(&metrics, &aggs, true),
            Err(MergeError::InvalidInput(_))
        ));
        // Correct set positions by merged order.
        let aggs = vec![AggregatorSpec::long_sum("b"), AggregatorSpec::long_sum("a")];
        let positioned = position_aggregators(&metrics, &aggs, true).unwrap();
        assert_eq!(positioned[0].name(), "a");
        assert_eq!(positioned[1].name(), "b");
    }

    #[test]
    fn fold_into_pads_with_invalid_rows() {
        let mut buffer = Vec::new();
        fold_into(&mut buffer, 2, 7);
        assert_eq!(buffer, vec![INVALID_ROW, INVALID_ROW, 7]);
        fold_into(&mut buffer, 3, 8);
        assert_eq!(buffer, vec![INVALID_ROW, INVALID_ROW, 7, 8]);
    }

    #[test]
    fn merged_dimension_order_prefers_declared_spec() {
        let a = adapter_with_columns(2, 1); // d0, d1
        let refs: Vec<&dyn IndexableAdapter> = vec![&a];
        let spec = DimensionsSpec::new(vec!["d1".to_string(), "z".to_string()]);
        let merged = merged_dimension_names(&refs, Some(&spec));
        assert_eq!(merged, vec!["d1", "z", "d0"]);
    }
}
