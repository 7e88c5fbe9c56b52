//! # Batches
//!
//! A [`Batch`] is both a read session and a write transaction. Reads walk the
//! tree at the batch's version, materializing nodes from the log on demand.
//! Writes run the tree algorithms against the same working set and stage the
//! result as pending records; `flush` serializes them and appends them to the
//! log in one call.
//!
//! ## Design Decisions
//!
//! - **Writers hold the tree lock as an owned guard.** The first write in a
//!   batch takes the tree-wide `tokio::sync::Mutex` and keeps the guard until
//!   `flush`, `close` or drop. Every exit path releases it, including a failed
//!   append and a panic unwinding through the caller.
//! - **Later writes see earlier ones.** Pending records get the seqs they
//!   will occupy once flushed (`log length + pending index`), and lookups for
//!   those seqs are answered from the pending list.
//! - **Intermediate records are compacted.** When several writes are flushed
//!   together, each non-final record keeps only the nodes no later write
//!   replaced. The final record always carries the full path from the new
//!   root.
//! - **Working state is tied to one fork.** Materialized nodes and cached
//!   blocks are only valid for the history they were read from. When the log
//!   forks under an idle batch it starts over from the new history; a batch
//!   with staged writes fails with [`BeeError::Forked`] and drops them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, trace, warn};

use crate::bee::Bee;
use crate::block::{BlockEntry, Entry, Record};
use crate::config::SESSION_BLOCK_CACHE;
use crate::error::{BeeError, Result};
use crate::log::Log;
use crate::messages::{Header, NodeRecord, PointerTable};
use crate::preload;
use crate::tree::ops::{self, DelOp, NodeStore, PutOp, Search};
use crate::tree::{NodeArena, NodeId, TreeNode};

// ---------------------------------------------------------------------------
// Write Options
// ---------------------------------------------------------------------------

/// Decides whether a write may replace the entry currently stored under its
/// key. Only consulted when such an entry exists.
///
/// Plain closures `Fn(&Entry, &Entry) -> bool` implement this; implement it
/// by hand when the decision needs to await something.
#[async_trait]
pub trait CasPredicate: Send + Sync {
    async fn check(&self, previous: &Entry, proposed: &Entry) -> bool;
}

#[async_trait]
impl<F> CasPredicate for F
where
    F: Fn(&Entry, &Entry) -> bool + Send + Sync,
{
    async fn check(&self, previous: &Entry, proposed: &Entry) -> bool {
        self(previous, proposed)
    }
}

/// Per-write options.
#[derive(Clone, Default)]
pub struct WriteOptions {
    pub cas: Option<Arc<dyn CasPredicate>>,
}

impl WriteOptions {
    pub fn with_cas(cas: impl CasPredicate + 'static) -> Self {
        Self {
            cas: Some(Arc::new(cas)),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

struct PendingEntry {
    seq: u64,
    key: Bytes,
    value: Option<Bytes>,
    /// Pointer table layout, root first.
    index: Vec<NodeId>,
}

pub struct Batch {
    bee: Bee,
    log: Arc<dyn Log>,
    /// Whether `log` is a session opened for this batch alone.
    owns_log: bool,
    arena: NodeArena,
    blocks: HashMap<u64, BlockEntry>,
    pending: Vec<PendingEntry>,
    root: Option<NodeId>,
    /// Last root materialized from the log, by version.
    loaded_root: Option<(u64, NodeId)>,
    /// Log fork the working state was read from.
    fork: Option<u64>,
    guard: Option<OwnedMutexGuard<()>>,
    auto_flush: bool,
    updated: bool,
    closed: bool,
}

impl Batch {
    pub(crate) fn new(bee: Bee, log: Arc<dyn Log>, auto_flush: bool, owns_log: bool) -> Self {
        Self {
            bee,
            log,
            owns_log,
            arena: NodeArena::new(),
            blocks: HashMap::new(),
            pending: Vec::new(),
            root: None,
            loaded_root: None,
            fork: None,
            guard: None,
            auto_flush,
            updated: false,
            closed: false,
        }
    }

    /// The version a reader of this batch observes, pending writes included.
    pub fn version(&self) -> u64 {
        let version = match self.bee.checkout {
            0 => self.log.length() + self.pending.len() as u64,
            pinned => pinned,
        };
        version.max(1)
    }

    /// Number of staged, unflushed writes.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn bee(&self) -> &Bee {
        &self.bee
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(BeeError::SessionClosed);
        }
        Ok(())
    }

    async fn lock(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.bee.readonly || !self.log.writable() {
            return Err(BeeError::ReadOnly);
        }
        if self.guard.is_none() {
            let guard = Arc::clone(&self.bee.lock).lock_owned().await;
            trace!("tree lock acquired");
            self.guard = Some(guard);
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.guard.take().is_some() {
            trace!("tree lock released");
        }
    }

    fn release_if_auto(&mut self) {
        if self.auto_flush {
            self.release();
        }
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.arena.clear();
        self.blocks.clear();
        self.root = None;
        self.loaded_root = None;
        self.fork = None;
    }

    /// Ties the working state to the log's current fork, dropping it if it
    /// was read from an earlier one.
    pub(crate) fn check_fork(&mut self) -> Result<()> {
        let current = self.log.fork();
        match self.fork {
            Some(fork) if fork != current && !self.pending.is_empty() => {
                warn!(fork = current, pending = self.pending.len(), "log forked under staged writes");
                self.reset();
                self.release();
                return Err(BeeError::Forked { fork: current });
            }
            Some(fork) if fork != current => {
                debug!(from = fork, to = current, "log forked, dropping working tree");
                self.reset();
            }
            _ => {}
        }
        self.fork = Some(current);
        Ok(())
    }

    // -- Resolution --

    fn shares_caches(&self) -> bool {
        self.log.fork() == self.bee.cache_fork()
    }

    fn pending_entry(&self, seq: u64) -> Option<&PendingEntry> {
        self.pending.iter().find(|p| p.seq == seq)
    }

    pub(crate) async fn get_block(&mut self, seq: u64) -> Result<BlockEntry> {
        let current = self.log.fork();
        if self.fork.is_some_and(|fork| fork != current) {
            return Err(BeeError::Forked { fork: current });
        }
        if let Some(block) = self.blocks.get(&seq) {
            return Ok(block.clone());
        }

        let shared = self.shares_caches();
        let cached = if shared {
            self.bee.state.records.get(seq)
        } else {
            None
        };

        let record = match cached {
            Some(record) => record,
            None => {
                let raw = self
                    .log
                    .get(seq)
                    .await?
                    .ok_or(BeeError::NotAvailable { seq })?;
                let record = Arc::new(Record::decode(raw)?);
                if shared {
                    self.bee.state.records.set(seq, Arc::clone(&record));
                    self.bee.state.keys.set(seq, record.key.clone());
                }
                record
            }
        };

        let block = BlockEntry::new(seq, record);
        if self.blocks.len() < SESSION_BLOCK_CACHE {
            self.blocks.insert(seq, block.clone());
        }
        Ok(block)
    }

    async fn materialize(&mut self, seq: u64, offset: u64) -> Result<NodeId> {
        let block = self.get_block(seq).await?;
        let node = TreeNode::from_level(seq, offset, block.level(offset)?);
        preload::prefetch(&self.log, &node);
        Ok(self.arena.alloc(node))
    }

    /// Root node of `version`, or `None` for an empty tree.
    pub(crate) async fn root_at(&mut self, version: u64) -> Result<Option<NodeId>> {
        if version < 2 {
            return Ok(None);
        }
        if let Some((loaded, id)) = self.loaded_root {
            if loaded == version {
                return Ok(Some(id));
            }
        }
        let root = self.materialize(version - 1, 0).await?;
        self.loaded_root = Some((version, root));
        Ok(Some(root))
    }

    pub(crate) async fn get_root(&mut self, ensure_header: bool) -> Result<Option<NodeId>> {
        self.ensure_open()?;
        self.bee.sync_events();

        if ensure_header && self.log.length() == 0 && self.log.writable() && !self.bee.readonly {
            let metadata = self.bee.options.metadata.clone().map(Bytes::from);
            self.log.append(vec![Header::new(metadata).encode()]).await?;
            info!("tree header created");
        }

        if self.bee.checkout == 0 && self.bee.options.update && !self.updated {
            self.updated = true;
            self.log.update(false).await?;
        }
        self.check_fork()?;

        if !self.pending.is_empty() {
            return Ok(self.root);
        }
        self.root_at(self.version()).await
    }

    // -- Reads --

    /// Looks up `key` at this batch's version.
    pub async fn get(&mut self, key: &[u8]) -> Result<Option<Entry>> {
        let target = self.bee.encode_key(key);
        let Some(mut node) = self.get_root(false).await? else {
            return Ok(None);
        };
        let length = self.log.length();
        let strip = self.bee.prefix.len();

        loop {
            // A node owned by the record that last wrote `target` short-cuts
            // the search: no later write to that key can exist.
            let owner = self.arena.get(node).block;
            if owner < length && self.pending_entry(owner).is_none() {
                let block = self.get_block(owner).await?;
                if block.is_target(&target) {
                    return if block.is_deletion()? {
                        Ok(None)
                    } else {
                        Ok(Some(block.entry(strip)))
                    };
                }
            }

            match ops::search(self, node, &target).await? {
                Search::Found(mid) => {
                    let seq = self.arena.get(node).keys[mid].seq;
                    return self.entry(seq).await.map(Some);
                }
                Search::Descend(_) if self.arena.get(node).is_leaf() => return Ok(None),
                Search::Descend(i) => node = self.child_node(node, i).await?,
            }
        }
    }

    /// The raw entry stored at `seq`. Tombstones come back with no value.
    pub async fn get_by_seq(&mut self, seq: u64) -> Result<Entry> {
        self.ensure_open()?;
        if seq == 0 {
            return Err(BeeError::MalformedRecord {
                seq,
                reason: "seq 0 holds the tree header".into(),
            });
        }
        self.bee.sync_events();
        self.check_fork()?;
        self.entry(seq).await
    }

    // -- Writes --

    pub async fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(key, value, WriteOptions::default()).await
    }

    pub async fn put_with(&mut self, key: &[u8], value: &[u8], opts: WriteOptions) -> Result<()> {
        self.lock().await?;
        let result = self.stage_put(key, value, &opts).await;
        if result.is_err() {
            // Nodes materialized for a failed first write are not kept.
            if self.pending.is_empty() {
                self.reset();
            }
            self.release_if_auto();
        }
        result
    }

    async fn stage_put(&mut self, key: &[u8], value: &[u8], opts: &WriteOptions) -> Result<()> {
        let full = self.bee.encode_key(key);
        let root = self.get_root(true).await?;
        let seq = self.log.length() + self.pending.len() as u64;
        let root = match root {
            Some(root) => root,
            None => self.arena.alloc(TreeNode::create(seq)),
        };

        let proposed = Entry {
            seq,
            key: Bytes::copy_from_slice(key),
            value: Some(Bytes::copy_from_slice(value)),
        };
        let op = PutOp {
            seq,
            key: full.clone(),
            proposed: &proposed,
            cas: opts.cas.as_deref(),
            always_duplicate: self.bee.options.always_duplicate,
        };

        match ops::insert(self, root, op).await? {
            Some(root) => self.append(root, seq, full, proposed.value).await,
            None => {
                self.release_if_auto();
                Ok(())
            }
        }
    }

    pub async fn del(&mut self, key: &[u8]) -> Result<()> {
        self.del_with(key, WriteOptions::default()).await
    }

    pub async fn del_with(&mut self, key: &[u8], opts: WriteOptions) -> Result<()> {
        self.lock().await?;
        let result = self.stage_del(key, &opts).await;
        if result.is_err() {
            // Nodes materialized for a failed first write are not kept.
            if self.pending.is_empty() {
                self.reset();
            }
            self.release_if_auto();
        }
        result
    }

    async fn stage_del(&mut self, key: &[u8], opts: &WriteOptions) -> Result<()> {
        let full = self.bee.encode_key(key);
        let Some(root) = self.get_root(true).await? else {
            self.release_if_auto();
            return Ok(());
        };
        let seq = self.log.length() + self.pending.len() as u64;

        let proposed = Entry {
            seq,
            key: Bytes::copy_from_slice(key),
            value: None,
        };
        let op = DelOp {
            key: &full,
            proposed: &proposed,
            cas: opts.cas.as_deref(),
        };

        match ops::remove(self, root, op).await? {
            Some(root) => self.append(root, seq, full, None).await,
            None => {
                self.release_if_auto();
                Ok(())
            }
        }
    }

    async fn append(&mut self, root: NodeId, seq: u64, key: Bytes, value: Option<Bytes>) -> Result<()> {
        let index = self.arena.index_changes(root, seq);
        trace!(seq, nodes = index.len(), "write staged");
        self.pending.push(PendingEntry {
            seq,
            key,
            value,
            index,
        });
        self.root = Some(root);

        if self.auto_flush {
            self.flush().await
        } else {
            Ok(())
        }
    }

    fn to_blocks(&mut self) -> Vec<Bytes> {
        let last = self.pending.len().saturating_sub(1);
        let arena = &mut self.arena;

        self.pending
            .iter_mut()
            .enumerate()
            .map(|(i, entry)| {
                if i < last {
                    // The root is always rewritten by the next write.
                    let index = &mut entry.index;
                    if !index.is_empty() {
                        index.swap_remove(0);
                    }
                    let mut j = 0;
                    while j < index.len() {
                        let node = arena.get_mut(index[j]);
                        if node.block == entry.seq && !node.freed {
                            node.offset = j as u64;
                            j += 1;
                        } else {
                            index.swap_remove(j);
                        }
                    }
                }

                let levels = entry.index.iter().map(|&id| arena.to_level(id)).collect();
                NodeRecord {
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                    index: PointerTable { levels }.encode(),
                }
                .encode()
            })
            .collect()
    }

    /// Appends every staged write in one log append and releases the lock,
    /// whether or not the append succeeds.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return self.close().await;
        }

        self.check_fork()?;
        let records = self.to_blocks();
        let count = records.len();
        self.reset();

        let result = self.log.append(records).await;
        self.release();

        match result {
            Ok(first) => {
                debug!(first, count, "batch flushed");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, count, "batch append failed");
                Err(err)
            }
        }
    }

    /// Drops staged writes without appending and releases everything held.
    pub async fn close(&mut self) -> Result<()> {
        self.reset();
        self.release();
        if self.owns_log && !self.closed {
            self.closed = true;
            self.log.close().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl NodeStore for Batch {
    fn arena(&self) -> &NodeArena {
        &self.arena
    }

    fn arena_mut(&mut self) -> &mut NodeArena {
        &mut self.arena
    }

    async fn key_bytes(&mut self, seq: u64) -> Result<Bytes> {
        if let Some(pending) = self.pending_entry(seq) {
            return Ok(pending.key.clone());
        }
        if self.shares_caches() {
            if let Some(key) = self.bee.state.keys.get(seq) {
                return Ok(key);
            }
        }
        Ok(self.get_block(seq).await?.record.key.clone())
    }

    async fn child_node(&mut self, parent: NodeId, index: usize) -> Result<NodeId> {
        let node = self.arena.get(parent);
        let (seq, offset) = match node.children.get(index) {
            Some(child) => match child.node {
                Some(id) => return Ok(id),
                None => (child.seq, child.offset),
            },
            None => {
                return Err(BeeError::MalformedRecord {
                    seq: node.block,
                    reason: format!("child {index} out of range"),
                })
            }
        };

        let id = self.materialize(seq, offset).await?;
        self.arena.get_mut(parent).children[index].node = Some(id);
        Ok(id)
    }

    async fn entry(&mut self, seq: u64) -> Result<Entry> {
        let strip = self.bee.prefix.len();
        if let Some(pending) = self.pending_entry(seq) {
            return Ok(Entry {
                seq,
                key: pending.key.slice(strip.min(pending.key.len())..),
                value: pending.value.clone(),
            });
        }
        Ok(self.get_block(seq).await?.entry(strip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BeeOptions;
    use crate::log::MemoryLog;

    // -- Helpers --

    fn bee() -> (Arc<MemoryLog>, Bee) {
        let log = Arc::new(MemoryLog::new());
        let bee = Bee::new(log.clone(), BeeOptions::default());
        (log, bee)
    }

    #[tokio::test]
    async fn first_write_appends_the_header_once() {
        let (log, bee) = bee();
        bee.put(b"a", b"1").await.unwrap();
        bee.put(b"b", b"2").await.unwrap();

        assert_eq!(log.length(), 3);
        let header = bee.get_header().await.unwrap();
        assert_eq!(header.protocol, "hyperbee");
    }

    #[tokio::test]
    async fn batch_reads_its_own_writes() {
        let (log, bee) = bee();
        let mut batch = bee.batch();
        batch.put(b"a", b"1").await.unwrap();
        batch.put(b"b", b"2").await.unwrap();

        assert_eq!(batch.pending(), 2);
        assert_eq!(batch.version(), 3);
        let entry = batch.get(b"a").await.unwrap().unwrap();
        assert_eq!(entry.value.as_deref(), Some(&b"1"[..]));
        // Nothing but the header has reached the log yet.
        assert_eq!(log.length(), 1);

        batch.flush().await.unwrap();
        assert_eq!(log.length(), 3);
        assert_eq!(
            bee.get(b"b").await.unwrap().unwrap().value.as_deref(),
            Some(&b"2"[..])
        );
    }

    #[tokio::test]
    async fn closing_discards_staged_writes() {
        let (log, bee) = bee();
        let mut batch = bee.batch();
        batch.put(b"a", b"1").await.unwrap();
        batch.close().await.unwrap();

        assert_eq!(log.length(), 1);
        assert_eq!(bee.get(b"a").await.unwrap(), None);
        // The lock was released.
        bee.put(b"a", b"2").await.unwrap();
    }

    #[tokio::test]
    async fn intermediate_records_are_compacted() {
        let (log, bee) = bee();
        let mut batch = bee.batch();
        for key in [b"a", b"b", b"c"] {
            batch.put(key, b"v").await.unwrap();
        }
        batch.flush().await.unwrap();

        let records = log.records();
        // Single-leaf tree: every write rewrites the root, so only the last
        // record keeps a pointer table.
        for raw in &records[1..3] {
            let record = Record::decode(raw.clone()).unwrap();
            assert!(record.pointers().unwrap().levels.is_empty());
        }
        let last = Record::decode(records[3].clone()).unwrap();
        assert_eq!(last.pointers().unwrap().levels[0].keys, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn get_by_seq_returns_tombstones() {
        let (_log, bee) = bee();
        bee.put(b"a", b"1").await.unwrap();
        bee.del(b"a").await.unwrap();

        let put = bee.get_by_seq(1).await.unwrap();
        let del = bee.get_by_seq(2).await.unwrap();
        assert_eq!(put.value.as_deref(), Some(&b"1"[..]));
        assert_eq!(del.key.as_ref(), b"a");
        assert_eq!(del.value, None);
        assert!(matches!(
            bee.get_by_seq(0).await,
            Err(BeeError::MalformedRecord { seq: 0, .. })
        ));
    }

    #[tokio::test]
    async fn closed_batch_refuses_further_reads() {
        let (_log, bee) = bee();
        bee.put(b"a", b"1").await.unwrap();
        let mut batch = bee.snapshot().read_batch();
        batch.close().await.unwrap();
        assert!(matches!(batch.get(b"a").await, Err(BeeError::SessionClosed)));
    }
}
