//! # Log Contract
//!
//! The tree does not own its storage. Everything it persists goes through
//! the [`Log`] trait: an append-only sequence of opaque byte records
//! addressed by a dense `u64` seq, with cheap read-only snapshots and a fork
//! counter that bumps whenever history is rewritten.
//!
//! A production deployment would back this with a replicated log; the crate
//! ships [`MemoryLog`] as the reference implementation used by tests, benches
//! and the CLI.

mod memory;

pub use memory::MemoryLog;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::Result;

/// Changes a log announces to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    /// Records were appended; `length` is the new length.
    Append { length: u64 },
    /// History was cut back to `length` and the fork counter is now `fork`.
    Truncate { length: u64, fork: u64 },
}

/// An append-only record log.
///
/// Handles are shared as `Arc<dyn Log>`. `snapshot` pins a read-only view at
/// the current length, `session` opens an independent live handle on the same
/// log. Closing a handle never affects its siblings.
#[async_trait]
pub trait Log: Send + Sync {
    /// Record at `seq`, or `None` if it is neither local nor retrievable.
    async fn get(&self, seq: u64) -> Result<Option<Bytes>>;

    /// Appends `records` in order and returns the seq assigned to the first.
    async fn append(&self, records: Vec<Bytes>) -> Result<u64>;

    fn length(&self) -> u64;

    fn fork(&self) -> u64;

    fn writable(&self) -> bool;

    fn snapshot(&self) -> Arc<dyn Log>;

    fn session(&self) -> Arc<dyn Log>;

    /// Refreshes the known length from upstream. Returns whether it grew.
    async fn update(&self, wait: bool) -> Result<bool>;

    /// Whether `seq` can be read without a remote fetch.
    fn has_local(&self, seq: u64) -> bool;

    /// Length of the prefix every replica agrees on.
    fn indexed_length(&self) -> u64;

    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;

    async fn close(&self) -> Result<()>;
}
