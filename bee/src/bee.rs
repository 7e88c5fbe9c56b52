//! # The Tree Handle
//!
//! [`Bee`] is what applications hold. It is a cheap, cloneable view onto a
//! tree stored in a [`Log`]: the head of the tree, a historical checkout, a
//! prefix-scoped sub-tree, or any combination of those. Every view opened
//! from the same root handle shares the log, the writer lock and the record
//! caches.
//!
//! ## Versions
//!
//! Version `V` of the tree is the one whose root lives in record `V - 1`.
//! Record 0 is the header, so versions 0 and 1 are both the empty tree and
//! every accepted write bumps the version by one.
//!
//! ## Design Decisions
//!
//! - **Checkouts are read-only.** A view pinned at an old version cannot
//!   write; branching history is the log's business, not the tree's.
//! - **Truncation is pulled, not pushed.** Each handle subscribes to the
//!   log's events once and drains them at the start of every operation.
//!   Caches are rewound on truncation and re-tagged with the new fork; until
//!   that happens, a fork mismatch makes every session bypass them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, warn};

use crate::batch::{Batch, WriteOptions};
use crate::block::{Entry, Record};
use crate::cache::SeqCache;
use crate::config::{BeeOptions, CACHE_CAPACITY, MAX_CHILDREN, MIN_KEYS, PROTOCOL_NAME};
use crate::error::{BeeError, Result};
use crate::iter::{DiffIterator, HistoryIterator, HistoryOptions, RangeIterator, RangeOptions};
use crate::log::{Log, LogEvent};
use crate::messages::Header;
use crate::tree::NodeStore;
use crate::util::concat;

// ---------------------------------------------------------------------------
// Shared State
// ---------------------------------------------------------------------------

/// State shared by every view of one tree.
pub(crate) struct TreeState {
    pub(crate) keys: SeqCache<Bytes>,
    pub(crate) records: SeqCache<Arc<Record>>,
    /// Fork the cache contents belong to.
    fork: AtomicU64,
    events: Mutex<broadcast::Receiver<LogEvent>>,
    /// The handle the tree was opened with.
    origin: Arc<dyn Log>,
}

/// Hit/miss counters for the shared caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub key_hits: usize,
    pub key_misses: usize,
    pub record_hits: usize,
    pub record_misses: usize,
}

/// Result of a structural walk over one version of the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeReport {
    pub version: u64,
    pub keys: usize,
    pub nodes: usize,
    /// Number of levels, leaves included. Zero for an empty tree.
    pub depth: usize,
    pub violations: Vec<String>,
}

impl TreeReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Bee
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Bee {
    pub(crate) log: Arc<dyn Log>,
    pub(crate) state: Arc<TreeState>,
    pub(crate) lock: Arc<tokio::sync::Mutex<()>>,
    pub(crate) options: Arc<BeeOptions>,
    pub(crate) prefix: Bytes,
    /// Pinned version, or 0 for the live head.
    pub(crate) checkout: u64,
    pub(crate) readonly: bool,
}

impl Bee {
    /// Opens the tree stored in `log`. Nothing is read or written until the
    /// first operation; an empty writable log gets its header on first write.
    pub fn new(log: Arc<dyn Log>, options: BeeOptions) -> Self {
        let state = TreeState {
            keys: SeqCache::new(CACHE_CAPACITY),
            records: SeqCache::new(CACHE_CAPACITY),
            fork: AtomicU64::new(log.fork()),
            events: Mutex::new(log.subscribe()),
            origin: Arc::clone(&log),
        };

        Self {
            readonly: options.readonly,
            log,
            state: Arc::new(state),
            lock: Arc::new(tokio::sync::Mutex::new(())),
            options: Arc::new(options),
            prefix: Bytes::new(),
            checkout: 0,
        }
    }

    /// Checks whether `log` holds a tree by sniffing its header.
    pub async fn is_bee(log: &dyn Log) -> Result<bool> {
        let raw = log.get(0).await?.ok_or(BeeError::NotAvailable { seq: 0 })?;
        Ok(Header::decode(raw)
            .map(|header| header.protocol == PROTOCOL_NAME)
            .unwrap_or(false))
    }

    // -- Introspection --

    pub fn version(&self) -> u64 {
        match self.checkout {
            0 => self.log.length(),
            pinned => pinned,
        }
        .max(1)
    }

    pub fn writable(&self) -> bool {
        !self.readonly && self.log.writable()
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn log(&self) -> &Arc<dyn Log> {
        &self.log
    }

    pub fn cache_stats(&self) -> CacheStats {
        let (key_hits, key_misses) = self.state.keys.stats();
        let (record_hits, record_misses) = self.state.records.stats();
        CacheStats {
            key_hits,
            key_misses,
            record_hits,
            record_misses,
        }
    }

    pub(crate) fn cache_fork(&self) -> u64 {
        self.state.fork.load(Ordering::Acquire)
    }

    pub(crate) fn encode_key(&self, key: &[u8]) -> Bytes {
        concat(&self.prefix, key)
    }

    /// Applies pending truncation events to the shared caches.
    pub(crate) fn sync_events(&self) {
        let mut events = self.state.events.lock();
        loop {
            match events.try_recv() {
                Ok(LogEvent::Truncate { length, fork }) => {
                    self.state.keys.gc(length);
                    self.state.records.gc(length);
                    self.state.fork.store(fork, Ordering::Release);
                    debug!(length, fork, "caches rewound after truncation");
                }
                Ok(LogEvent::Append { .. }) => {}
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(missed, "log events lagged, dropping caches");
                    self.state.keys.clear();
                    self.state.records.clear();
                    self.state
                        .fork
                        .store(self.state.origin.fork(), Ordering::Release);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    /// A read handle fixed at this view's version.
    pub(crate) fn make_snapshot(&self) -> (Arc<dyn Log>, bool) {
        if !self.options.sessions {
            return (Arc::clone(&self.log), false);
        }
        if self.checkout <= self.log.length() || self.checkout <= 1 {
            (self.log.snapshot(), true)
        } else {
            (self.log.session(), true)
        }
    }

    pub(crate) fn read_batch(&self) -> Batch {
        let (log, owned) = self.make_snapshot();
        Batch::new(self.clone(), log, true, owned)
    }

    fn write_batch(&self, auto_flush: bool) -> Batch {
        Batch::new(self.clone(), Arc::clone(&self.log), auto_flush, false)
    }

    // -- Views --

    /// A read-only view pinned at `version` (at least 1).
    pub fn checkout(&self, version: u64) -> Bee {
        let version = version.max(1);
        let log = if !self.options.sessions {
            Arc::clone(&self.log)
        } else if version <= self.log.length() {
            self.log.snapshot()
        } else {
            self.log.session()
        };

        Bee {
            log,
            checkout: version,
            readonly: true,
            ..self.clone()
        }
    }

    /// A read-only view pinned at the current version.
    pub fn snapshot(&self) -> Bee {
        self.checkout(self.version())
    }

    /// A view scoped to keys under `prefix`, separated by the tree's
    /// configured separator.
    pub fn sub(&self, prefix: &[u8]) -> Bee {
        let sep = self.options.sep.clone();
        self.sub_with_sep(prefix, &sep)
    }

    pub fn sub_with_sep(&self, prefix: &[u8], sep: &[u8]) -> Bee {
        let mut full = BytesMut::with_capacity(self.prefix.len() + prefix.len() + sep.len());
        full.put_slice(&self.prefix);
        full.put_slice(prefix);
        full.put_slice(sep);

        Bee {
            prefix: full.freeze(),
            ..self.clone()
        }
    }

    // -- Reads --

    pub async fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        let mut batch = self.read_batch();
        let result = batch.get(key).await;
        let closed = batch.close().await;
        let entry = result?;
        closed?;
        Ok(entry)
    }

    pub async fn get_by_seq(&self, seq: u64) -> Result<Entry> {
        let mut batch = self.read_batch();
        let result = batch.get_by_seq(seq).await;
        let closed = batch.close().await;
        let entry = result?;
        closed?;
        Ok(entry)
    }

    pub async fn get_header(&self) -> Result<Header> {
        let raw = self
            .log
            .get(0)
            .await?
            .ok_or(BeeError::NotAvailable { seq: 0 })?;
        Ok(Header::decode(raw)?)
    }

    /// Ordered scan over this view.
    pub fn range(&self, opts: RangeOptions) -> RangeIterator {
        RangeIterator::new(self.read_batch(), opts)
    }

    /// First entry of a range, if any.
    pub async fn peek(&self, opts: RangeOptions) -> Result<Option<Entry>> {
        let mut iter = self.range(opts.limit(1));
        let result = iter.next().await;
        let closed = iter.close().await;
        let entry = result?;
        closed?;
        Ok(entry)
    }

    /// Every record written up to this view's version, in log order.
    pub fn history(&self, opts: HistoryOptions) -> HistoryIterator {
        HistoryIterator::new(self.read_batch(), opts)
    }

    /// Keys that differ between this view and version `other`.
    pub fn diff(&self, other: u64, opts: RangeOptions) -> DiffIterator {
        let left = self.version();
        let right = self.checkout(other);
        let source = if right.version() > left { &right } else { self };
        let (log, owned) = source.make_snapshot();
        let batch = Batch::new(source.clone(), log, true, owned);
        DiffIterator::new(batch, self.prefix.clone(), left, right.version(), opts)
    }

    // -- Writes --

    /// A batch for grouping writes into one append. Writes in it hold the
    /// tree lock until it is flushed, closed or dropped.
    pub fn batch(&self) -> Batch {
        self.write_batch(false)
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(key, value, WriteOptions::default()).await
    }

    pub async fn put_with(&self, key: &[u8], value: &[u8], opts: WriteOptions) -> Result<()> {
        self.write_batch(true).put_with(key, value, opts).await
    }

    pub async fn del(&self, key: &[u8]) -> Result<()> {
        self.del_with(key, WriteOptions::default()).await
    }

    pub async fn del_with(&self, key: &[u8], opts: WriteOptions) -> Result<()> {
        self.write_batch(true).del_with(key, opts).await
    }

    // -- Maintenance --

    /// Asks the log for newer records. Returns whether it grew.
    pub async fn update(&self, wait: bool) -> Result<bool> {
        self.log.update(wait).await
    }

    /// Walks the whole tree at this view's version and reports every shape
    /// violation found: key order, fill bounds, child counts, leaf depth.
    pub async fn check(&self) -> Result<TreeReport> {
        let mut batch = self.read_batch();
        let result = walk(&mut batch).await;
        let closed = batch.close().await;
        let report = result?;
        closed?;
        Ok(report)
    }

    pub async fn close(&self) -> Result<()> {
        self.log.close().await
    }
}

struct Frame {
    node: crate::tree::NodeId,
    depth: usize,
    lower: Option<Bytes>,
    upper: Option<Bytes>,
}

async fn walk(batch: &mut Batch) -> Result<TreeReport> {
    let mut report = TreeReport {
        version: batch.version(),
        ..TreeReport::default()
    };
    let Some(root) = batch.get_root(false).await? else {
        return Ok(report);
    };

    let mut leaf_depth = None;
    let mut stack = vec![Frame {
        node: root,
        depth: 1,
        lower: None,
        upper: None,
    }];

    while let Some(frame) = stack.pop() {
        let (count, children, block, offset) = {
            let node = batch.arena().get(frame.node);
            (node.keys.len(), node.children.len(), node.block, node.offset)
        };
        let at = format!("node {block}/{offset}");
        let is_root = frame.node == root;

        let mut keys = Vec::with_capacity(count);
        for i in 0..count {
            keys.push(batch.node_key(frame.node, i).await?);
        }
        report.nodes += 1;
        report.keys += count;

        if count >= MAX_CHILDREN {
            report.violations.push(format!("{at}: {count} keys overflows"));
        }
        if !is_root && count < MIN_KEYS {
            report.violations.push(format!("{at}: {count} keys underflows"));
        }
        if is_root && count == 0 && children > 0 {
            report.violations.push(format!("{at}: empty root with children"));
        }
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            report.violations.push(format!("{at}: keys out of order"));
        }
        if let (Some(lower), Some(first)) = (&frame.lower, keys.first()) {
            if first <= lower {
                report.violations.push(format!("{at}: key below separator"));
            }
        }
        if let (Some(upper), Some(last)) = (&frame.upper, keys.last()) {
            if last >= upper {
                report.violations.push(format!("{at}: key above separator"));
            }
        }

        if children == 0 {
            match leaf_depth {
                None => leaf_depth = Some(frame.depth),
                Some(depth) if depth != frame.depth => report
                    .violations
                    .push(format!("{at}: leaf at depth {} not {depth}", frame.depth)),
                Some(_) => {}
            }
            continue;
        }
        if children != count + 1 {
            report
                .violations
                .push(format!("{at}: {children} children for {count} keys"));
        }

        for i in (0..children).rev() {
            let child = batch.child_node(frame.node, i).await?;
            stack.push(Frame {
                node: child,
                depth: frame.depth + 1,
                lower: if i == 0 {
                    frame.lower.clone()
                } else {
                    keys.get(i - 1).cloned()
                },
                upper: keys.get(i).cloned().or_else(|| frame.upper.clone()),
            });
        }
    }

    report.depth = leaf_depth.unwrap_or(0);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;

    fn open() -> (Arc<MemoryLog>, Bee) {
        let log = Arc::new(MemoryLog::new());
        (log.clone(), Bee::new(log, BeeOptions::default()))
    }

    #[tokio::test]
    async fn versions_count_records() {
        let (_log, bee) = open();
        assert_eq!(bee.version(), 1);
        bee.put(b"a", b"1").await.unwrap();
        assert_eq!(bee.version(), 2);
        bee.put(b"b", b"1").await.unwrap();
        assert_eq!(bee.version(), 3);
    }

    #[tokio::test]
    async fn checkout_is_pinned_and_read_only() {
        let (_log, bee) = open();
        bee.put(b"a", b"1").await.unwrap();
        let old = bee.checkout(2);
        bee.put(b"a", b"2").await.unwrap();

        let entry = old.get(b"a").await.unwrap().unwrap();
        assert_eq!(entry.value.as_deref(), Some(&b"1"[..]));
        assert!(!old.writable());
        assert!(matches!(old.put(b"b", b"1").await, Err(BeeError::ReadOnly)));
        assert_eq!(bee.checkout(0).version(), 1);
    }

    #[tokio::test]
    async fn subs_prefix_their_keys() {
        let (log, bee) = open();
        let users = bee.sub(b"users");
        users.put(b"alice", b"1").await.unwrap();

        let raw = bee.get(b"users\0alice").await.unwrap().unwrap();
        assert_eq!(raw.value.as_deref(), Some(&b"1"[..]));
        let scoped = users.get(b"alice").await.unwrap().unwrap();
        assert_eq!(scoped.key.as_ref(), b"alice");
        assert_eq!(log.length(), 2);

        let nested = users.sub(b"admins");
        assert_eq!(nested.prefix(), b"users\0admins\0");
    }

    #[tokio::test]
    async fn header_carries_metadata() {
        let log = Arc::new(MemoryLog::new());
        let options = BeeOptions {
            metadata: Some(b"meta".to_vec()),
            ..BeeOptions::default()
        };
        let bee = Bee::new(log.clone(), options);
        bee.put(b"a", b"1").await.unwrap();

        let header = bee.get_header().await.unwrap();
        assert_eq!(header.metadata.as_deref(), Some(&b"meta"[..]));
        assert!(Bee::is_bee(log.as_ref()).await.unwrap());
    }

    #[tokio::test]
    async fn sniffing_rejects_foreign_logs() {
        let log = MemoryLog::new();
        assert!(matches!(
            Bee::is_bee(&log).await,
            Err(BeeError::NotAvailable { seq: 0 })
        ));
        log.append(vec![Bytes::from_static(b"\xff\xff\xff")]).await.unwrap();
        assert!(!Bee::is_bee(&log).await.unwrap());
    }

    #[tokio::test]
    async fn check_reports_a_healthy_tree() {
        let (_log, bee) = open();
        for i in 0..200u32 {
            bee.put(format!("{i:05}").as_bytes(), b"v").await.unwrap();
        }
        for i in (0..200u32).step_by(3) {
            bee.del(format!("{i:05}").as_bytes()).await.unwrap();
        }

        let report = bee.check().await.unwrap();
        assert!(report.is_ok(), "{:?}", report.violations);
        assert_eq!(report.keys, 200 - 67);
        assert!(report.depth >= 3);
    }

    #[tokio::test]
    async fn shared_caches_are_hit_on_repeat_reads() {
        let (_log, bee) = open();
        for i in 0..20u32 {
            bee.put(format!("{i:03}").as_bytes(), b"v").await.unwrap();
        }
        bee.get(b"007").await.unwrap();
        let before = bee.cache_stats();
        bee.get(b"007").await.unwrap();
        let after = bee.cache_stats();
        assert!(after.record_hits > before.record_hits);
    }
}
