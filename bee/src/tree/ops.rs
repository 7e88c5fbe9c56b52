//! # Tree Operations
//!
//! Search, insert-with-split and delete-with-rebalance over a [`NodeArena`].
//!
//! The algorithms never talk to the log directly. They see the tree through
//! [`NodeStore`], which resolves key bytes and child nodes on demand (possibly
//! awaiting a fetch) and hands back user-facing entries for CAS predicates.
//! The batch is the production store; the tests below use a store with every
//! node already resolved.
//!
//! ## Design Decisions
//!
//! - **Changed-marking happens last.** Nodes on the search path are only
//!   flagged `changed` once the mutation is known to go ahead. A rejected CAS
//!   or a suppressed duplicate leaves the working tree exactly as it was, so
//!   a later operation in the same batch never rewrites nodes for nothing.
//! - **Fetch before mutate.** A delete resolves its whole path, the nearest
//!   leaf and every sibling a rebalance could need before touching a node.
//!   A fetch that fails partway leaves the working tree untouched.
//! - **Explicit path stacks.** Each frame remembers which child slot it was
//!   reached through, so splits and rebalances never search a parent for its
//!   child.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use super::node::{Child, Key, NodeArena, NodeId, TreeNode};
use crate::batch::CasPredicate;
use crate::block::Entry;
use crate::config::{MAX_CHILDREN, MIN_KEYS};
use crate::error::{BeeError, Result};
use crate::util::same_value;

// ---------------------------------------------------------------------------
// NodeStore
// ---------------------------------------------------------------------------

/// Lazy access to the nodes and keys a tree walk needs.
#[async_trait]
pub trait NodeStore: Send {
    fn arena(&self) -> &NodeArena;

    fn arena_mut(&mut self) -> &mut NodeArena;

    /// Key bytes of the record at `seq`.
    async fn key_bytes(&mut self, seq: u64) -> Result<Bytes>;

    /// Resolves child slot `index` of `parent`, materializing it if needed.
    async fn child_node(&mut self, parent: NodeId, index: usize) -> Result<NodeId>;

    /// The caller-facing entry for the record at `seq`.
    async fn entry(&mut self, seq: u64) -> Result<Entry>;

    /// Key bytes for key slot `index` of `node`, cached on the slot.
    async fn node_key(&mut self, node: NodeId, index: usize) -> Result<Bytes> {
        let (seq, cached) = {
            let key = &self.arena().get(node).keys[index];
            (key.seq, key.value.clone())
        };
        if let Some(value) = cached {
            return Ok(value);
        }
        let value = self.key_bytes(seq).await?;
        self.arena_mut().get_mut(node).keys[index].value = Some(value.clone());
        Ok(value)
    }
}

fn corrupt(node: &TreeNode, reason: &str) -> BeeError {
    BeeError::MalformedRecord {
        seq: node.block,
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Search {
    /// Exact match at this key index.
    Found(usize),
    /// No match; the key belongs under this child index.
    Descend(usize),
}

/// Binary search of one node, resolving keys as it goes.
pub async fn search<S>(store: &mut S, node: NodeId, target: &[u8]) -> Result<Search>
where
    S: NodeStore + ?Sized,
{
    let mut s = 0;
    let mut e = store.arena().get(node).keys.len();

    while s < e {
        let mid = (s + e) >> 1;
        let key = store.node_key(node, mid).await?;
        match target.cmp(key.as_ref()) {
            std::cmp::Ordering::Equal => return Ok(Search::Found(mid)),
            std::cmp::Ordering::Less => e = mid,
            std::cmp::Ordering::Greater => s = mid + 1,
        }
    }

    Ok(Search::Descend(s))
}

// ---------------------------------------------------------------------------
// Insert
// ---------------------------------------------------------------------------

/// A put, as the tree algorithms see it.
pub struct PutOp<'a> {
    /// Seq the new record will occupy.
    pub seq: u64,
    /// Full key bytes, sub-tree prefix included.
    pub key: Bytes,
    pub proposed: &'a Entry,
    pub cas: Option<&'a dyn CasPredicate>,
    pub always_duplicate: bool,
}

/// A delete, as the tree algorithms see it.
pub struct DelOp<'a> {
    pub key: &'a [u8],
    pub proposed: &'a Entry,
    pub cas: Option<&'a dyn CasPredicate>,
}

async fn accepts_overwrite<S>(store: &mut S, prev_seq: u64, op: &PutOp<'_>) -> Result<bool>
where
    S: NodeStore + ?Sized,
{
    if op.cas.is_none() && op.always_duplicate {
        return Ok(true);
    }

    let prev = store.entry(prev_seq).await?;

    if let Some(cas) = op.cas {
        if !cas.check(&prev, op.proposed).await {
            trace!(seq = op.seq, prev = prev_seq, "cas rejected put");
            return Ok(false);
        }
    }

    if !op.always_duplicate && same_value(prev.value.as_deref(), op.proposed.value.as_deref()) {
        trace!(seq = op.seq, prev = prev_seq, "duplicate put suppressed");
        return Ok(false);
    }

    Ok(true)
}

fn mark_changed(arena: &mut NodeArena, path: &[(NodeId, usize)]) {
    for &(id, _) in path {
        arena.get_mut(id).changed = true;
    }
}

/// Inserts or overwrites `op.key`. Returns the new root, or `None` if the
/// write was rejected and nothing changed.
pub async fn insert<S>(store: &mut S, root: NodeId, op: PutOp<'_>) -> Result<Option<NodeId>>
where
    S: NodeStore + ?Sized,
{
    // (node, index of the child slot we descended through)
    let mut path: Vec<(NodeId, usize)> = Vec::new();
    let mut node = root;

    loop {
        match search(store, node, &op.key).await? {
            Search::Found(mid) => {
                let prev_seq = store.arena().get(node).keys[mid].seq;
                if !accepts_overwrite(store, prev_seq, &op).await? {
                    return Ok(None);
                }
                let arena = store.arena_mut();
                mark_changed(arena, &path);
                let target = arena.get_mut(node);
                target.keys[mid] = Key::resolved(op.seq, op.key.clone());
                target.changed = true;
                return Ok(Some(root));
            }
            Search::Descend(i) if store.arena().get(node).is_leaf() => {
                let arena = store.arena_mut();
                mark_changed(arena, &path);
                let leaf = arena.get_mut(node);
                leaf.keys.insert(i, Key::resolved(op.seq, op.key.clone()));
                leaf.changed = true;
                break;
            }
            Search::Descend(i) => {
                let child = store.child_node(node, i).await?;
                path.push((node, i));
                node = child;
            }
        }
    }

    let arena = store.arena_mut();
    while arena.get(node).keys.len() >= MAX_CHILDREN {
        let (median, right) = arena
            .split(node)
            .ok_or_else(|| corrupt(arena.get(node), "cannot split node"))?;

        match path.pop() {
            Some((parent, i)) => {
                let p = arena.get_mut(parent);
                p.keys.insert(i, median);
                p.children.insert(i + 1, Child::resolved(right));
                node = parent;
            }
            None => {
                let mut grown = TreeNode::create(arena.get(node).block);
                grown.keys.push(median);
                grown.children.push(Child::resolved(node));
                grown.children.push(Child::resolved(right));
                return Ok(Some(arena.alloc(grown)));
            }
        }
    }

    Ok(Some(root))
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

/// Removes `op.key`. Returns the new root, or `None` if the key was absent or
/// the CAS predicate declined.
///
/// Every node the removal can touch is resolved before the first change, so
/// a failed fetch leaves the working tree exactly as it was.
pub async fn remove<S>(store: &mut S, root: NodeId, op: DelOp<'_>) -> Result<Option<NodeId>>
where
    S: NodeStore + ?Sized,
{
    let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
    let mut node = root;

    loop {
        match search(store, node, op.key).await? {
            Search::Found(mid) => {
                if let Some(cas) = op.cas {
                    let prev_seq = store.arena().get(node).keys[mid].seq;
                    let prev = store.entry(prev_seq).await?;
                    if !cas.check(&prev, op.proposed).await {
                        trace!(seq = op.proposed.seq, prev = prev_seq, "cas rejected delete");
                        return Ok(None);
                    }
                }

                let from_right = if store.arena().get(node).is_leaf() {
                    None
                } else {
                    Some(nearest_leaf(store, node, mid, &mut stack).await?)
                };
                resolve_siblings(store, &stack).await?;

                let arena = store.arena_mut();
                match from_right {
                    None => arena.remove_key(node, mid),
                    Some(from_right) => {
                        let leaf = arena.get_mut(stack[stack.len() - 1].0);
                        let replacement = if from_right {
                            leaf.keys.remove(0)
                        } else {
                            match leaf.keys.pop() {
                                Some(key) => key,
                                None => return Err(corrupt(leaf, "empty leaf below internal node")),
                            }
                        };
                        arena.get_mut(node).keys[mid] = replacement;
                    }
                }

                mark_changed(store.arena_mut(), &stack);
                return rebalance(store, stack).await.map(Some);
            }
            Search::Descend(_) if store.arena().get(node).is_leaf() => return Ok(None),
            Search::Descend(i) => {
                let child = store.child_node(node, i).await?;
                stack.push((child, i));
                node = child;
            }
        }
    }
}

/// Number of keys in the leftmost (`go_left`) or rightmost leaf under `node`.
async fn leaf_size<S>(store: &mut S, mut node: NodeId, go_left: bool) -> Result<usize>
where
    S: NodeStore + ?Sized,
{
    loop {
        let n = store.arena().get(node);
        if n.is_leaf() {
            return Ok(n.keys.len());
        }
        let i = if go_left { 0 } else { n.children.len() - 1 };
        node = store.child_node(node, i).await?;
    }
}

/// Walks to the leaf holding the in-order neighbour of internal key `index`,
/// on whichever side has the fuller leaf, recording the walk on `stack`.
/// Returns true when the neighbour is the successor.
async fn nearest_leaf<S>(
    store: &mut S,
    node: NodeId,
    index: usize,
    stack: &mut Vec<(NodeId, usize)>,
) -> Result<bool>
where
    S: NodeStore + ?Sized,
{
    let left = store.child_node(node, index).await?;
    let right = store.child_node(node, index + 1).await?;
    let ls = leaf_size(store, left, false).await?;
    let rs = leaf_size(store, right, true).await?;
    let from_right = ls < rs;

    let (mut cur, slot) = if from_right {
        (right, index + 1)
    } else {
        (left, index)
    };
    stack.push((cur, slot));
    while !store.arena().get(cur).is_leaf() {
        let n = store.arena().get(cur);
        let next = if from_right { 0 } else { n.children.len() - 1 };
        cur = store.child_node(cur, next).await?;
        stack.push((cur, next));
    }

    let leaf = store.arena().get(cur);
    if leaf.keys.is_empty() {
        return Err(corrupt(leaf, "empty leaf below internal node"));
    }
    Ok(from_right)
}

/// Resolves the siblings `rebalance` may borrow from or merge with. Only
/// levels that can underflow need them: the walk stops at the first node
/// that can afford to lose a key.
async fn resolve_siblings<S>(store: &mut S, stack: &[(NodeId, usize)]) -> Result<()>
where
    S: NodeStore + ?Sized,
{
    for depth in (1..stack.len()).rev() {
        let (node, index) = stack[depth];
        if store.arena().get(node).keys.len() > MIN_KEYS {
            break;
        }
        let parent = stack[depth - 1].0;
        let siblings = store.arena().get(parent).children.len();
        if index > 0 {
            store.child_node(parent, index - 1).await?;
        }
        if index + 1 < siblings {
            store.child_node(parent, index + 1).await?;
        }
    }
    Ok(())
}

/// Restores the fill invariant bottom-up along `stack` and returns the root,
/// which changes if the old root ran out of keys.
async fn rebalance<S>(store: &mut S, mut stack: Vec<(NodeId, usize)>) -> Result<NodeId>
where
    S: NodeStore + ?Sized,
{
    let root = stack[0].0;

    while stack.len() > 1 {
        let Some((node, index)) = stack.pop() else {
            break;
        };
        let parent = stack[stack.len() - 1].0;

        if store.arena().get(node).keys.len() >= MIN_KEYS {
            return Ok(root);
        }

        let siblings = store.arena().get(parent).children.len();
        let left = match index {
            0 => None,
            _ => Some(store.child_node(parent, index - 1).await?),
        };
        let right = if index + 1 < siblings {
            Some(store.child_node(parent, index + 1).await?)
        } else {
            None
        };

        let arena = store.arena_mut();

        // Borrow from the left sibling.
        if let Some(left) = left.filter(|&l| arena.get(l).keys.len() > MIN_KEYS) {
            let (key, child) = {
                let l = arena.get_mut(left);
                l.changed = true;
                let child = if l.is_leaf() { None } else { l.children.pop() };
                (l.keys.pop(), child)
            };
            let key = key.ok_or_else(|| corrupt(arena.get(left), "sibling lost its keys"))?;
            let separator = std::mem::replace(&mut arena.get_mut(parent).keys[index - 1], key);
            let n = arena.get_mut(node);
            n.keys.insert(0, separator);
            if let Some(child) = child {
                n.children.insert(0, child);
            }
            return Ok(root);
        }

        // Borrow from the right sibling.
        if let Some(right) = right.filter(|&r| arena.get(r).keys.len() > MIN_KEYS) {
            let (key, child) = {
                let r = arena.get_mut(right);
                r.changed = true;
                let child = if r.is_leaf() {
                    None
                } else {
                    Some(r.children.remove(0))
                };
                (r.keys.remove(0), child)
            };
            let separator = std::mem::replace(&mut arena.get_mut(parent).keys[index], key);
            let n = arena.get_mut(node);
            n.keys.push(separator);
            if let Some(child) = child {
                n.children.push(child);
            }
            return Ok(root);
        }

        // Merge, folding into the left sibling when there is one.
        let (into, from, at) = match (left, right) {
            (Some(left), _) => (left, node, index - 1),
            (None, Some(right)) => (node, right, index),
            (None, None) => return Err(corrupt(arena.get(parent), "internal node with one child")),
        };
        let median = arena.get(parent).keys[at].clone();
        arena.merge(into, from, median);
        arena.remove_key(parent, at);
    }

    let r = store.arena().get(root);
    if r.keys.is_empty() && !r.children.is_empty() {
        return store.child_node(root, 0).await;
    }
    Ok(root)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
