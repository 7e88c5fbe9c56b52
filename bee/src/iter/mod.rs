//! Ordered queries over a tree: key ranges, raw history and version diffs.
//!
//! Each iterator owns a read batch pinned to a log snapshot, so it sees one
//! consistent version no matter what writers do meanwhile. Iterators are
//! lazy, finite and single-pass; the batch (and its snapshot) is closed as
//! soon as the iterator is exhausted or explicitly closed.

mod diff;
mod history;
mod range;

pub use diff::{DiffEntry, DiffIterator};
pub use history::{HistoryEntry, HistoryIterator, HistoryKind, HistoryOptions};
pub use range::{RangeIterator, RangeOptions};

use std::ops::Bound;

use bytes::Bytes;

use crate::util::{concat, prefix_upper_bound};

/// Encoded key bounds, sub-tree prefix applied.
#[derive(Debug, Clone)]
pub(crate) struct Bounds {
    pub lower: Bound<Bytes>,
    pub upper: Bound<Bytes>,
}

impl Bounds {
    pub(crate) fn new(opts: &RangeOptions, prefix: &[u8]) -> Self {
        let lower = match (&opts.gt, &opts.gte) {
            (Some(k), _) => Bound::Excluded(concat(prefix, k)),
            (None, Some(k)) => Bound::Included(concat(prefix, k)),
            (None, None) if !prefix.is_empty() => Bound::Included(Bytes::copy_from_slice(prefix)),
            (None, None) => Bound::Unbounded,
        };
        let upper = match (&opts.lt, &opts.lte) {
            (Some(k), _) => Bound::Excluded(concat(prefix, k)),
            (None, Some(k)) => Bound::Included(concat(prefix, k)),
            (None, None) => match prefix_upper_bound(prefix) {
                Some(end) if !prefix.is_empty() => Bound::Excluded(end),
                _ => Bound::Unbounded,
            },
        };
        Self { lower, upper }
    }

    pub(crate) fn above_lower(&self, key: &[u8]) -> bool {
        match &self.lower {
            Bound::Included(b) => key >= b.as_ref(),
            Bound::Excluded(b) => key > b.as_ref(),
            Bound::Unbounded => true,
        }
    }

    pub(crate) fn below_upper(&self, key: &[u8]) -> bool {
        match &self.upper {
            Bound::Included(b) => key <= b.as_ref(),
            Bound::Excluded(b) => key < b.as_ref(),
            Bound::Unbounded => true,
        }
    }
}
