//! The B-tree proper: node model and the algorithms that reshape it.

pub mod node;
pub mod ops;

pub use node::{Child, Key, NodeArena, NodeId, TreeNode};
pub use ops::{NodeStore, Search};
