//! Ordered range scans.
//!
//! The cursor is a stack of `(node, item)` frames. Items interleave children
//! and keys: even item `2c` is child `c`, odd item `2k + 1` is key `k`. A
//! forward scan walks items upwards, a reverse scan downwards, so both
//! directions share one traversal. Opening a bounded scan seeks straight to
//! the start bound instead of walking in from the edge of the tree.

use std::ops::Bound;

use bytes::Bytes;
use futures::stream::{self, Stream};

use super::Bounds;
use crate::batch::Batch;
use crate::block::Entry;
use crate::error::Result;
use crate::tree::ops::{self, NodeStore, Search};
use crate::tree::NodeId;

/// Bounds and direction of a range scan. Keys are given without any
/// sub-tree prefix.
#[derive(Debug, Clone, Default)]
pub struct RangeOptions {
    pub gt: Option<Bytes>,
    pub gte: Option<Bytes>,
    pub lt: Option<Bytes>,
    pub lte: Option<Bytes>,
    pub reverse: bool,
    /// Maximum number of entries. `Some(0)` yields nothing.
    pub limit: Option<usize>,
}

impl RangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gt(mut self, key: impl AsRef<[u8]>) -> Self {
        self.gt = Some(Bytes::copy_from_slice(key.as_ref()));
        self
    }

    pub fn gte(mut self, key: impl AsRef<[u8]>) -> Self {
        self.gte = Some(Bytes::copy_from_slice(key.as_ref()));
        self
    }

    pub fn lt(mut self, key: impl AsRef<[u8]>) -> Self {
        self.lt = Some(Bytes::copy_from_slice(key.as_ref()));
        self
    }

    pub fn lte(mut self, key: impl AsRef<[u8]>) -> Self {
        self.lte = Some(Bytes::copy_from_slice(key.as_ref()));
        self
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

struct Frame {
    node: NodeId,
    item: isize,
}

pub struct RangeIterator {
    batch: Batch,
    bounds: Bounds,
    reverse: bool,
    remaining: Option<usize>,
    stack: Vec<Frame>,
    opened: bool,
    done: bool,
}

impl RangeIterator {
    pub(crate) fn new(batch: Batch, opts: RangeOptions) -> Self {
        let bounds = Bounds::new(&opts, batch.bee().prefix());
        Self {
            batch,
            bounds,
            reverse: opts.reverse,
            remaining: opts.limit,
            stack: Vec::new(),
            opened: false,
            done: false,
        }
    }

    fn first_item(&self, node: NodeId) -> isize {
        if self.reverse {
            2 * self.batch.arena().get(node).keys.len() as isize
        } else {
            0
        }
    }

    async fn open(&mut self) -> Result<()> {
        self.opened = true;
        let Some(root) = self.batch.get_root(false).await? else {
            self.done = true;
            return Ok(());
        };

        let seek = if self.reverse {
            self.bounds.upper.clone()
        } else {
            self.bounds.lower.clone()
        };
        let (target, inclusive) = match seek {
            Bound::Included(key) => (key, true),
            Bound::Excluded(key) => (key, false),
            Bound::Unbounded => {
                let item = self.first_item(root);
                self.stack.push(Frame { node: root, item });
                return Ok(());
            }
        };

        let mut node = root;
        loop {
            match ops::search(&mut self.batch, node, &target).await? {
                Search::Found(mid) => {
                    let mid = mid as isize;
                    let item = match (inclusive, self.reverse) {
                        (true, _) => 2 * mid + 1,
                        (false, false) => 2 * mid + 2,
                        (false, true) => 2 * mid,
                    };
                    self.stack.push(Frame { node, item });
                    return Ok(());
                }
                Search::Descend(c) => {
                    // The child at `c` is walked right here, so the frame
                    // resumes at the key on the far side of it.
                    let ci = c as isize;
                    let item = if self.reverse { 2 * ci - 1 } else { 2 * ci + 1 };
                    self.stack.push(Frame { node, item });
                    if self.batch.arena().get(node).is_leaf() {
                        return Ok(());
                    }
                    node = self.batch.child_node(node, c).await?;
                }
            }
        }
    }

    /// Next entry in range order, or `None` once the range is exhausted.
    pub async fn next(&mut self) -> Result<Option<Entry>> {
        if !self.opened && !self.done {
            self.open().await?;
        }
        if self.remaining == Some(0) {
            self.done = true;
        }

        while !self.done {
            let Some(top) = self.stack.last() else {
                break;
            };
            let (node, item) = (top.node, top.item);
            let (keys, leaf) = {
                let n = self.batch.arena().get(node);
                (n.keys.len() as isize, n.is_leaf())
            };

            if item < 0 || item > 2 * keys {
                self.stack.pop();
                continue;
            }
            if let Some(top) = self.stack.last_mut() {
                top.item += if self.reverse { -1 } else { 1 };
            }

            if item % 2 == 0 {
                if !leaf {
                    let child = self.batch.child_node(node, (item / 2) as usize).await?;
                    let item = self.first_item(child);
                    self.stack.push(Frame { node: child, item });
                }
                continue;
            }

            let k = (item / 2) as usize;
            let key = self.batch.node_key(node, k).await?;
            let past_end = if self.reverse {
                !self.bounds.above_lower(&key)
            } else {
                !self.bounds.below_upper(&key)
            };
            if past_end {
                break;
            }
            if !self.bounds.above_lower(&key) || !self.bounds.below_upper(&key) {
                continue;
            }

            let seq = self.batch.arena().get(node).keys[k].seq;
            let entry = self.batch.entry(seq).await?;
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
            }
            return Ok(Some(entry));
        }

        self.close().await?;
        Ok(None)
    }

    /// Stops the scan and releases its snapshot.
    pub async fn close(&mut self) -> Result<()> {
        self.done = true;
        self.stack.clear();
        self.batch.close().await
    }

    /// Drains the remaining entries.
    pub async fn collect(mut self) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Entry>> + Send {
        stream::unfold(self, |mut iter| async move {
            match iter.next().await {
                Ok(Some(entry)) => Some((Ok(entry), iter)),
                Ok(None) => None,
                Err(err) => {
                    iter.done = true;
                    Some((Err(err), iter))
                }
            }
        })
    }
}
