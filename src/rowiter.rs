//! Merged row iteration: the k-way ordered merge and its rollup-combining
//! variant.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::aggregate::AggregatorSpec;
use crate::types::{compare_row_keys, row_keys_equal, MergeRow};

/// Source identity of the row an iterator is positioned on.
#[derive(Debug)]
pub enum RowOrigin<'a> {
    /// Exactly one input row produced the current output row.
    Single { input: usize, row_num: u32 },
    /// The current output row combined one `[min, max]` run of rows per
    /// touched input; untouched inputs are `None`.
    Combined(&'a [Option<(u32, u32)>]),
    /// The iterator does not track source rows.
    Unknown,
}

/// A positioned stream of merged rows in `(timestamp, dims...)` order.
pub trait MergedRowStream {
    /// Advances to the next output row. Returns false when exhausted.
    fn move_to_next(&mut self) -> bool;

    /// The row the stream is positioned on. Only valid after a successful
    /// `move_to_next`.
    fn current(&self) -> &MergeRow;

    fn origin(&self) -> RowOrigin<'_>;
}

struct HeapItem {
    row: MergeRow,
    input: usize,
    row_num: u32,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Composite key first; ties broken by input index for stability.
        compare_row_keys(&self.row, &other.row).then_with(|| self.input.cmp(&other.input))
    }
}

/// K-way merge over per-input row iterators. Every output row carries the
/// input index and input row number it came from.
pub struct MergingRowIterator<'a> {
    sources: Vec<Box<dyn Iterator<Item = MergeRow> + 'a>>,
    heap: BinaryHeap<std::cmp::Reverse<HeapItem>>,
    next_row_num: Vec<u32>,
    current: Option<MergeRow>,
    current_input: usize,
    current_row_num: u32,
}

impl<'a> MergingRowIterator<'a> {
    pub fn new(mut sources: Vec<Box<dyn Iterator<Item = MergeRow> + 'a>>) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        let mut next_row_num = vec![0u32; sources.len()];
        for (input, source) in sources.iter_mut().enumerate() {
            if let Some(row) = source.next() {
                heap.push(std::cmp::Reverse(HeapItem {
                    row,
                    input,
                    row_num: 0,
                }));
                next_row_num[input] = 1;
            }
        }
        Self {
            sources,
            heap,
            next_row_num,
            current: None,
            current_input: 0,
            current_row_num: 0,
        }
    }

    /// Pops the least row with its source identity, refilling the heap from
    /// that source.
    fn pop_next(&mut self) -> Option<(MergeRow, usize, u32)> {
        let std::cmp::Reverse(item) = self.heap.pop()?;
        if let Some(next) = self.sources[item.input].next() {
            let row_num = self.next_row_num[item.input];
            self.next_row_num[item.input] += 1;
            self.heap.push(std::cmp::Reverse(HeapItem {
                row: next,
                input: item.input,
                row_num,
            }));
        }
        Some((item.row, item.input, item.row_num))
    }
}

impl MergedRowStream for MergingRowIterator<'_> {
    fn move_to_next(&mut self) -> bool {
        match self.pop_next() {
            Some((row, input, row_num)) => {
                self.current = Some(row);
                self.current_input = input;
                self.current_row_num = row_num;
                true
            }
            None => {
                self.current = None;
                false
            }
        }
    }

    fn current(&self) -> &MergeRow {
        self.current.as_ref().expect("iterator is positioned")
    }

    fn origin(&self) -> RowOrigin<'_> {
        RowOrigin::Single {
            input: self.current_input,
            row_num: self.current_row_num,
        }
    }
}

/// Rollup variant: consecutive rows with equal `(timestamp, dims...)` keys
/// collapse into one output row whose metrics are the aggregator-combined
/// values of the run. Tracks, per input, the `[min, max]` input row range
/// folded into the current output row.
pub struct RowCombiningIterator<'a> {
    inner: MergingRowIterator<'a>,
    /// One aggregator per merged metric position.
    aggregators: Vec<AggregatorSpec>,
    pending: Option<(MergeRow, usize, u32)>,
    current: Option<MergeRow>,
    combined: Vec<Option<(u32, u32)>>,
}

impl<'a> RowCombiningIterator<'a> {
    pub fn new(
        sources: Vec<Box<dyn Iterator<Item = MergeRow> + 'a>>,
        aggregators: Vec<AggregatorSpec>,
    ) -> Self {
        let input_count = sources.len();
        Self {
            inner: MergingRowIterator::new(sources),
            aggregators,
            pending: None,
            current: None,
            combined: vec![None; input_count],
        }
    }

    fn note_combined(&mut self, input: usize, row_num: u32) {
        self.combined[input] = match self.combined[input] {
            None => Some((row_num, row_num)),
            Some((min, max)) => Some((min.min(row_num), max.max(row_num))),
        };
    }
}

impl MergedRowStream for RowCombiningIterator<'_> {
    fn move_to_next(&mut self) -> bool {
        for slot in &mut self.combined {
            *slot = None;
        }
        let (mut row, input, row_num) = match self.pending.take().or_else(|| self.inner.pop_next())
        {
            Some(head) => head,
            None => {
                self.current = None;
                return false;
            }
        };
        self.note_combined(input, row_num);

        while let Some((next, next_input, next_row_num)) = self.inner.pop_next() {
            if row_keys_equal(&row, &next) {
                for (i, agg) in self.aggregators.iter().enumerate() {
                    row.metrics[i] = agg.combine(&row.metrics[i], &next.metrics[i]);
                }
                self.note_combined(next_input, next_row_num);
            } else {
                self.pending = Some((next, next_input, next_row_num));
                break;
            }
        }
        self.current = Some(row);
        true
    }

    fn current(&self) -> &MergeRow {
        self.current.as_ref().expect("iterator is positioned")
    }

    fn origin(&self) -> RowOrigin<'_> {
        RowOrigin::Combined(&self.combined)
    }
}
