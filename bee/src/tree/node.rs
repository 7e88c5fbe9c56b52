//! # Tree Nodes
//!
//! A [`TreeNode`] is a mutable, in-memory view of one level of some record's
//! pointer table. Nodes are created lazily while a batch walks the tree and
//! live in a per-batch [`NodeArena`]; child slots refer to resolved nodes by
//! [`NodeId`], so the whole working set of a batch is a plain `Vec` with no
//! reference counting or interior mutability.
//!
//! ## Location
//!
//! Every node knows where it will be (or already is) serialized: `block` is
//! the seq of the record that owns it and `offset` its level in that record's
//! pointer table. Nodes materialized from the log keep their original
//! location until a mutation marks them `changed`; [`NodeArena::index_changes`]
//! then moves every changed node to the record being written.

use bytes::Bytes;

use crate::messages::Level;

/// Handle to a node inside a [`NodeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// A key slot: the seq of the record holding the key, plus the key bytes
/// once somebody has needed them.
#[derive(Debug, Clone)]
pub struct Key {
    pub seq: u64,
    pub value: Option<Bytes>,
}

impl Key {
    pub fn unresolved(seq: u64) -> Self {
        Self { seq, value: None }
    }

    pub fn resolved(seq: u64, value: Bytes) -> Self {
        Self {
            seq,
            value: Some(value),
        }
    }
}

/// A child slot: the on-log pointer, plus the node once it is materialized.
#[derive(Debug, Clone)]
pub struct Child {
    pub seq: u64,
    pub offset: u64,
    pub node: Option<NodeId>,
}

impl Child {
    pub fn unresolved(seq: u64, offset: u64) -> Self {
        Self {
            seq,
            offset,
            node: None,
        }
    }

    pub fn resolved(node: NodeId) -> Self {
        Self {
            seq: 0,
            offset: 0,
            node: Some(node),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub block: u64,
    pub offset: u64,
    pub keys: Vec<Key>,
    pub children: Vec<Child>,
    pub changed: bool,
    /// Set once a merge has emptied this node out of the tree.
    pub freed: bool,
}

impl TreeNode {
    /// A brand-new node. It has no location until it is indexed.
    pub fn create(block: u64) -> Self {
        Self {
            block,
            offset: 0,
            keys: Vec::new(),
            children: Vec::new(),
            changed: true,
            freed: false,
        }
    }

    /// The node stored at `(seq, offset)`, described by `level`.
    pub fn from_level(seq: u64, offset: u64, level: &Level) -> Self {
        Self {
            block: seq,
            offset,
            keys: level.keys.iter().map(|&s| Key::unresolved(s)).collect(),
            children: level
                .children
                .iter()
                .map(|&(s, o)| Child::unresolved(s, o))
                .collect(),
            changed: false,
            freed: false,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Owns every node a batch has touched.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<TreeNode>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, node: TreeNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn get(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut TreeNode {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// `(seq, offset)` a child slot serializes to.
    pub fn child_location(&self, child: &Child) -> (u64, u64) {
        match child.node {
            Some(id) => {
                let node = self.get(id);
                (node.block, node.offset)
            }
            None => (child.seq, child.offset),
        }
    }

    /// Splits a full node in two. The left half stays in place, the right
    /// half (by count) moves to a new node, and the median key is returned
    /// for the parent. Returns `None` if the node is too small to split.
    pub fn split(&mut self, id: NodeId) -> Option<(Key, NodeId)> {
        let node = self.get_mut(id);
        let len = node.keys.len() >> 1;
        if len == 0 {
            return None;
        }

        let right_keys = node.keys.split_off(node.keys.len() - len);
        let median = node.keys.pop()?;
        let right_children = if node.children.is_empty() {
            Vec::new()
        } else {
            node.children.split_off(node.children.len() - (len + 1))
        };
        node.changed = true;
        let block = node.block;

        let mut right = TreeNode::create(block);
        right.keys = right_keys;
        right.children = right_children;
        Some((median, self.alloc(right)))
    }

    /// Appends `median` and all of `right` onto `left`. `right` is freed.
    pub fn merge(&mut self, left: NodeId, right: NodeId, median: Key) {
        let (keys, children) = {
            let r = self.get_mut(right);
            r.freed = true;
            (std::mem::take(&mut r.keys), std::mem::take(&mut r.children))
        };

        let l = self.get_mut(left);
        l.keys.push(median);
        l.keys.extend(keys);
        l.children.extend(children);
        l.changed = true;
    }

    /// Removes key `index` and, for internal nodes, the child to its right.
    pub fn remove_key(&mut self, id: NodeId, index: usize) {
        let node = self.get_mut(id);
        node.keys.remove(index);
        if !node.children.is_empty() {
            node.children.remove(index + 1);
        }
        node.changed = true;
    }

    /// Moves every changed node reachable from `root` to record `seq`.
    ///
    /// Returns the new pointer table layout in pre-order, root first. Only
    /// resolved children can have changed, so unresolved subtrees are
    /// skipped without being touched.
    pub fn index_changes(&mut self, root: NodeId, seq: u64) -> Vec<NodeId> {
        let mut index = Vec::new();
        let mut stack = vec![root];

        while let Some(id) = stack.pop() {
            {
                let node = self.get_mut(id);
                node.block = seq;
                node.offset = index.len() as u64;
                node.changed = false;
            }
            index.push(id);

            let changed: Vec<NodeId> = self
                .get(id)
                .children
                .iter()
                .filter_map(|c| c.node)
                .filter(|&child| self.get(child).changed)
                .collect();
            // Reverse so the leftmost child is indexed first.
            stack.extend(changed.into_iter().rev());
        }

        index
    }

    /// Serializable form of a node.
    pub fn to_level(&self, id: NodeId) -> Level {
        let node = self.get(id);
        Level {
            keys: node.keys.iter().map(|k| k.seq).collect(),
            children: node
                .children
                .iter()
                .map(|c| self.child_location(c))
                .collect(),
        }
    }
}
