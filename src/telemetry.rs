//! Process-wide counters emitted through the `metrics` facade.
//!
//! Recording is effectively a no-op until the caller installs a recorder, so
//! the core stays silent in library use.

use metrics::{counter, describe_counter, Unit};

pub const ROWS_MERGED: &str = "lithos_rows_merged_total";
pub const SEGMENTS_BUILT: &str = "lithos_segments_built_total";
pub const MERGE_PHASES: &str = "lithos_merge_phases_total";

/// Registers metric descriptions with the installed recorder. Optional;
/// counters work without it.
pub fn describe_metrics() {
    describe_counter!(ROWS_MERGED, Unit::Count, "Rows written to merged segments");
    describe_counter!(SEGMENTS_BUILT, Unit::Count, "Segments fully built");
    describe_counter!(
        MERGE_PHASES,
        Unit::Count,
        "Merge phases executed by the multi-phase driver"
    );
}

pub(crate) fn record_rows_merged(rows: u64) {
    if rows > 0 {
        counter!(ROWS_MERGED).increment(rows);
    }
}

pub(crate) fn record_segment_built() {
    counter!(SEGMENTS_BUILT).increment(1);
}

pub(crate) fn record_merge_phase() {
    counter!(MERGE_PHASES).increment(1);
}
