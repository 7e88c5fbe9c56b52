// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # logbee: Versioned B-Tree over an Append-Only Log
//!
//! `logbee` keeps a sorted key/value map inside an append-only log of
//! records. Every write appends one record holding the entry itself and the
//! copy-on-write path of tree nodes it changed, so each log length is a
//! complete, immutable version of the map.
//!
//! ## Architecture
//!
//! - **messages**: Wire codec for the header and node records.
//! - **block**: Decoded records and the entries they carry.
//! - **tree**: Node arena plus the insert/delete/rebalance algorithms.
//! - **batch**: Read sessions and write transactions over one version.
//! - **bee**: The user-facing handle: views, reads, writes, queries.
//! - **iter**: Range scans, raw history, and version diffs.
//! - **log**: The storage contract the tree runs on, and an in-memory log.
//! - **cache**: Seq-keyed caches shared by every view of a tree.
//! - **preload**: Background prefetch of child records.
//! - **config**: Tree order, protocol constants, and handle options.
//!
//! ## Versions
//!
//! Version `V` is the log length `V`. Record 0 is the header, so version 1
//! is the empty tree, and the root of version `V` lives in record `V - 1`.

pub mod batch;
pub mod bee;
pub mod block;
pub mod cache;
pub mod config;
pub mod error;
pub mod iter;
pub mod log;
pub mod messages;
pub mod preload;
pub mod tree;
pub mod util;

pub use crate::batch::{Batch, CasPredicate, WriteOptions};
pub use crate::bee::{Bee, CacheStats, TreeReport};
pub use crate::block::Entry;
pub use crate::config::BeeOptions;
pub use crate::error::{BeeError, Result};
pub use crate::iter::{
    DiffEntry, DiffIterator, HistoryEntry, HistoryIterator, HistoryKind, HistoryOptions,
    RangeIterator, RangeOptions,
};
pub use crate::log::{Log, LogEvent, MemoryLog};
pub use crate::messages::Header;
