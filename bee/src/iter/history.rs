//! Raw history: every record of the log in seq order, puts and deletes alike.

use bytes::Bytes;
use futures::stream::{self, Stream};

use crate::batch::Batch;
use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    /// First seq to yield. Values below 1 are clamped past the header.
    pub gte: Option<u64>,
    /// Seq to stop before. Defaults to (and is capped at) the version.
    pub lt: Option<u64>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl HistoryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gte(mut self, seq: u64) -> Self {
        self.gte = Some(seq);
        self
    }

    pub fn lt(mut self, seq: u64) -> Self {
        self.lt = Some(seq);
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Put,
    Del,
}

/// One record of history. Keys are exactly as stored, sub-tree prefix
/// included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub kind: HistoryKind,
    pub seq: u64,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

pub struct HistoryIterator {
    batch: Batch,
    opts: HistoryOptions,
    gte: u64,
    lt: u64,
    remaining: Option<usize>,
    opened: bool,
    done: bool,
}

impl HistoryIterator {
    pub(crate) fn new(batch: Batch, opts: HistoryOptions) -> Self {
        Self {
            batch,
            remaining: opts.limit,
            opts,
            gte: 1,
            lt: 1,
            opened: false,
            done: false,
        }
    }

    async fn open(&mut self) -> Result<()> {
        self.opened = true;
        // Refreshes the log and validates the session before reading.
        self.batch.get_root(false).await?;
        let version = self.batch.version();
        self.gte = self.opts.gte.unwrap_or(1).max(1);
        self.lt = self.opts.lt.unwrap_or(version).min(version);
        Ok(())
    }

    pub async fn next(&mut self) -> Result<Option<HistoryEntry>> {
        if !self.opened && !self.done {
            self.open().await?;
        }
        if self.done || self.remaining == Some(0) || self.gte >= self.lt {
            self.close().await?;
            return Ok(None);
        }

        let seq = if self.opts.reverse {
            self.lt -= 1;
            self.lt
        } else {
            self.gte += 1;
            self.gte - 1
        };

        let block = self.batch.get_block(seq).await?;
        let kind = if block.is_deletion()? {
            HistoryKind::Del
        } else {
            HistoryKind::Put
        };
        let entry = block.entry(0);
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }

        Ok(Some(HistoryEntry {
            kind,
            seq,
            key: entry.key,
            value: entry.value,
        }))
    }

    pub async fn close(&mut self) -> Result<()> {
        self.done = true;
        self.batch.close().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<HistoryEntry>> + Send {
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

    pub async fn collect(mut self) -> Result<Vec<HistoryEntry>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bee::Bee;
    use crate::config::BeeOptions;
    use crate::log::MemoryLog;

    async fn sample() -> Bee {
        let bee = Bee::new(Arc::new(MemoryLog::new()), BeeOptions::default());
        bee.put(b"a", b"1").await.unwrap();
        bee.put(b"b", b"2").await.unwrap();
        bee.del(b"a").await.unwrap();
        bee.put(b"c", b"3").await.unwrap();
        bee
    }

    #[tokio::test]
    async fn yields_every_record_with_its_kind() {
        let bee = sample().await;
        let all = bee.history(HistoryOptions::new()).collect().await.unwrap();

        let summary: Vec<(HistoryKind, u64, &[u8])> = all
            .iter()
            .map(|e| (e.kind, e.seq, e.key.as_ref()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (HistoryKind::Put, 1, &b"a"[..]),
                (HistoryKind::Put, 2, &b"b"[..]),
                (HistoryKind::Del, 3, &b"a"[..]),
                (HistoryKind::Put, 4, &b"c"[..]),
            ]
        );
        assert_eq!(all[2].value, None);
    }

    #[tokio::test]
    async fn reverse_window_and_limit() {
        let bee = sample().await;
        let window = bee
            .history(HistoryOptions::new().gte(2).lt(4).reverse())
            .collect()
            .await
            .unwrap();
        let seqs: Vec<u64> = window.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 2]);

        let first = bee
            .history(HistoryOptions::new().limit(1))
            .collect()
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].seq, 1);
    }

    #[tokio::test]
    async fn checkout_bounds_history() {
        let bee = sample().await;
        let old = bee.checkout(3);
        let seqs: Vec<u64> = old
            .history(HistoryOptions::new().lt(100))
            .collect()
            .await
            .unwrap()
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn streams_the_same_records() {
        use futures::StreamExt;

        let bee = sample().await;
        let seqs: Vec<u64> = bee
            .history(HistoryOptions::new().reverse())
            .into_stream()
            .map(|e| e.unwrap().seq)
            .collect()
            .await;
        assert_eq!(seqs, vec![4, 3, 2, 1]);
    }
}
