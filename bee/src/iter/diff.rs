//! Version diffs.
//!
//! Two cursors walk the left and right trees in key order, both inside one
//! read batch whose snapshot covers the newer version. Whenever both cursors
//! sit on the same child pointer the subtrees are byte-for-byte identical
//! (records are immutable) and are skipped without being fetched. Otherwise
//! the cursors descend and their keys are merged like two sorted lists.

use bytes::Bytes;
use futures::stream::{self, Stream};

use super::{Bounds, RangeOptions};
use crate::batch::Batch;
use crate::block::Entry;
use crate::error::Result;
use crate::tree::ops::NodeStore;
use crate::tree::{NodeArena, NodeId};

/// A key whose presence or record differs between the two versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub left: Option<Entry>,
    pub right: Option<Entry>,
}

#[derive(Debug, Clone, Copy)]
enum Item {
    Key { node: NodeId, index: usize, seq: u64 },
    Subtree { node: NodeId, index: usize, at: (u64, u64) },
    End,
}

/// In-order walk that reports subtrees before entering them.
#[derive(Default)]
struct Walker {
    stack: Vec<(NodeId, usize)>,
}

impl Walker {
    fn new(root: Option<NodeId>) -> Self {
        Self {
            stack: root.map(|r| vec![(r, 0)]).unwrap_or_default(),
        }
    }

    fn peek(&mut self, arena: &NodeArena) -> Item {
        while let Some(&(node, item)) = self.stack.last() {
            let n = arena.get(node);
            if item > 2 * n.keys.len() {
                self.stack.pop();
                continue;
            }
            if item % 2 == 1 {
                let index = item / 2;
                return Item::Key {
                    node,
                    index,
                    seq: n.keys[index].seq,
                };
            }
            match n.children.get(item / 2) {
                Some(child) => {
                    return Item::Subtree {
                        node,
                        index: item / 2,
                        at: arena.child_location(child),
                    }
                }
                None => self.advance(),
            }
        }
        Item::End
    }

    fn advance(&mut self) {
        if let Some(top) = self.stack.last_mut() {
            top.1 += 1;
        }
    }

    fn descend(&mut self, child: NodeId) {
        self.advance();
        self.stack.push((child, 0));
    }
}

enum Side {
    Left,
    Right,
    Both,
}

pub struct DiffIterator {
    batch: Batch,
    bounds: Bounds,
    left_version: u64,
    right_version: u64,
    remaining: Option<usize>,
    left: Walker,
    right: Walker,
    opened: bool,
    done: bool,
}

impl DiffIterator {
    pub(crate) fn new(
        batch: Batch,
        prefix: Bytes,
        left_version: u64,
        right_version: u64,
        opts: RangeOptions,
    ) -> Self {
        Self {
            batch,
            bounds: Bounds::new(&opts, &prefix),
            left_version,
            right_version,
            remaining: opts.limit,
            left: Walker::default(),
            right: Walker::default(),
            opened: false,
            done: false,
        }
    }

    async fn open(&mut self) -> Result<()> {
        self.opened = true;
        self.batch.bee().sync_events();
        self.batch.check_fork()?;
        let left = self.batch.root_at(self.left_version).await?;
        let right = self.batch.root_at(self.right_version).await?;
        self.left = Walker::new(left);
        self.right = Walker::new(right);
        Ok(())
    }

    async fn descend(&mut self, side: Side, a: Item, b: Item) -> Result<()> {
        if matches!(side, Side::Left | Side::Both) {
            if let Item::Subtree { node, index, .. } = a {
                let child = self.batch.child_node(node, index).await?;
                self.left.descend(child);
            }
        }
        if matches!(side, Side::Right | Side::Both) {
            if let Item::Subtree { node, index, .. } = b {
                let child = self.batch.child_node(node, index).await?;
                self.right.descend(child);
            }
        }
        Ok(())
    }

    pub async fn next(&mut self) -> Result<Option<DiffEntry>> {
        if !self.opened && !self.done {
            self.open().await?;
        }
        if self.remaining == Some(0) {
            self.done = true;
        }

        while !self.done {
            let a = self.left.peek(self.batch.arena());
            let b = self.right.peek(self.batch.arena());

            let (key, left_seq, right_seq) = match (a, b) {
                (Item::End, Item::End) => break,
                (Item::Subtree { at: x, .. }, Item::Subtree { at: y, .. }) if x == y => {
                    self.left.advance();
                    self.right.advance();
                    continue;
                }
                (Item::Subtree { .. }, Item::Subtree { .. }) => {
                    self.descend(Side::Both, a, b).await?;
                    continue;
                }
                (Item::Subtree { .. }, _) => {
                    self.descend(Side::Left, a, b).await?;
                    continue;
                }
                (_, Item::Subtree { .. }) => {
                    self.descend(Side::Right, a, b).await?;
                    continue;
                }
                (Item::Key { node, index, seq }, Item::End) => {
                    self.left.advance();
                    (self.batch.node_key(node, index).await?, Some(seq), None)
                }
                (Item::End, Item::Key { node, index, seq }) => {
                    self.right.advance();
                    (self.batch.node_key(node, index).await?, None, Some(seq))
                }
                (
                    Item::Key { node: ln, index: li, seq: ls },
                    Item::Key { node: rn, index: ri, seq: rs },
                ) => {
                    let lk = self.batch.node_key(ln, li).await?;
                    let rk = self.batch.node_key(rn, ri).await?;
                    match lk.cmp(&rk) {
                        std::cmp::Ordering::Less => {
                            self.left.advance();
                            (lk, Some(ls), None)
                        }
                        std::cmp::Ordering::Greater => {
                            self.right.advance();
                            (rk, None, Some(rs))
                        }
                        std::cmp::Ordering::Equal => {
                            self.left.advance();
                            self.right.advance();
                            if ls == rs {
                                continue;
                            }
                            (lk, Some(ls), Some(rs))
                        }
                    }
                }
            };

            if !self.bounds.below_upper(&key) {
                break;
            }
            if !self.bounds.above_lower(&key) {
                continue;
            }

            let left = match left_seq {
                Some(seq) => Some(self.batch.entry(seq).await?),
                None => None,
            };
            let right = match right_seq {
                Some(seq) => Some(self.batch.entry(seq).await?),
                None => None,
            };
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
            }
            return Ok(Some(DiffEntry { left, right }));
        }

        self.close().await?;
        Ok(None)
    }

    pub async fn close(&mut self) -> Result<()> {
        self.done = true;
        self.batch.close().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<DiffEntry>> + Send {
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

    pub async fn collect(mut self) -> Result<Vec<DiffEntry>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }
}
