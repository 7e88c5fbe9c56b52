//! # Tree Configuration & Constants
//!
//! Every tuning knob of the tree lives here. The structural constants are
//! part of the on-log format: a tree written with one order can be read by a
//! reader using another, but the fill invariants the writer maintains are
//! only guaranteed for the order below. Do not change them casually.

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Tree Shape
// ---------------------------------------------------------------------------

/// Minimum degree of the B-tree.
pub const ORDER: usize = 5;

/// Fewest keys a non-root node may hold once a delete has settled.
pub const MIN_KEYS: usize = ORDER - 1;

/// Upper bound on fan-out. A node holding this many keys is full and splits.
pub const MAX_CHILDREN: usize = MIN_KEYS * 2 + 1;

// ---------------------------------------------------------------------------
// Record Format
// ---------------------------------------------------------------------------

/// Protocol tag written into the header at seq 0.
pub const PROTOCOL_NAME: &str = "hyperbee";

/// Separator appended after a sub-tree prefix.
pub const DEFAULT_SEP: &[u8] = &[0x00];

// ---------------------------------------------------------------------------
// Caching
// ---------------------------------------------------------------------------

/// Entries kept per shared cache (keys and decoded records).
pub const CACHE_CAPACITY: usize = 65_536;

/// A truncation that rewinds the tracked length by more than this many
/// records throws the whole cache away instead of pruning the tail.
pub const CACHE_GC_THRESHOLD: u64 = 128;

/// Decoded records a single batch keeps for its own lifetime.
pub const SESSION_BLOCK_CACHE: usize = 128;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Options accepted when opening a tree.
///
/// Deserializable so the CLI (or an embedding application) can read them
/// from a config file; every field falls back to its default when absent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BeeOptions {
    /// Refuse all writes, even if the log is writable.
    pub readonly: bool,

    /// Append a new record even when the value being written equals the
    /// current one. When false, puts of an identical value are dropped.
    pub always_duplicate: bool,

    /// Opaque bytes stored in the header when the tree is created.
    pub metadata: Option<Vec<u8>>,

    /// Separator placed after sub-tree prefixes.
    pub sep: Vec<u8>,

    /// Open a dedicated log session per read batch instead of sharing the
    /// handle the tree was opened with.
    pub sessions: bool,

    /// Ask the log for its latest length before reading at the head.
    pub update: bool,
}

impl Default for BeeOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            always_duplicate: true,
            metadata: None,
            sep: DEFAULT_SEP.to_vec(),
            sessions: true,
            update: true,
        }
    }
}
