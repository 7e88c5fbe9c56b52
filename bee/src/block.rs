//! # Log Records
//!
//! A [`Record`] is the decoded form of one node record: its key, its value
//! and its pointer table. Records are immutable once appended, so a decoded
//! record is shared behind an `Arc` between the record cache, every batch
//! that touched it and every tree node materialized from it.
//!
//! The pointer table is the expensive part and most reads never need it (a
//! lookup that hits the target record stops before looking at children), so
//! it stays encoded until first use and is decoded exactly once.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::error::{BeeError, Result};
use crate::messages::{DecodeError, Level, NodeRecord, PointerTable};

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// A key/value pair as seen by callers. `value` is `None` for tombstones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub seq: u64,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Record {
    pub key: Bytes,
    pub value: Option<Bytes>,
    index: Bytes,
    table: OnceLock<PointerTable>,
}

impl Record {
    pub fn decode(raw: Bytes) -> std::result::Result<Self, DecodeError> {
        let NodeRecord { key, value, index } = NodeRecord::decode(raw)?;
        Ok(Self {
            key,
            value,
            index,
            table: OnceLock::new(),
        })
    }

    /// Builds a record whose table is already known, as the writer has it.
    pub fn with_table(key: Bytes, value: Option<Bytes>, table: PointerTable) -> Self {
        let index = table.encode();
        Self {
            key,
            value,
            index,
            table: OnceLock::from(table),
        }
    }

    /// The pointer table, decoded on first call.
    pub fn pointers(&self) -> std::result::Result<&PointerTable, DecodeError> {
        if let Some(table) = self.table.get() {
            return Ok(table);
        }
        let decoded = PointerTable::decode(self.index.clone())?;
        Ok(self.table.get_or_init(|| decoded))
    }

    pub fn encode(&self) -> Bytes {
        NodeRecord {
            key: self.key.clone(),
            value: self.value.clone(),
            index: self.index.clone(),
        }
        .encode()
    }
}

// ---------------------------------------------------------------------------
// BlockEntry
// ---------------------------------------------------------------------------

/// A record paired with its position in the log.
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub seq: u64,
    pub record: Arc<Record>,
}

impl BlockEntry {
    pub fn new(seq: u64, record: Arc<Record>) -> Self {
        Self { seq, record }
    }

    /// Exact byte match against this record's own key.
    pub fn is_target(&self, key: &[u8]) -> bool {
        self.record.key.as_ref() == key
    }

    /// A tombstone carries no value and its own key is absent from its own
    /// pointer table (the delete removed it from the tree it wrote).
    pub fn is_deletion(&self) -> Result<bool> {
        if self.record.value.is_some() {
            return Ok(false);
        }
        Ok(!self.record.pointers()?.has_key(self.seq))
    }

    /// The level describing the tree node stored at `offset`.
    pub fn level(&self, offset: u64) -> Result<&Level> {
        let table = self.record.pointers()?;
        usize::try_from(offset)
            .ok()
            .and_then(|i| table.levels.get(i))
            .ok_or_else(|| BeeError::MalformedRecord {
                seq: self.seq,
                reason: format!(
                    "no tree node at offset {offset} (table has {} levels)",
                    table.levels.len()
                ),
            })
    }

    /// The caller-facing entry, with the first `strip` key bytes (a sub-tree
    /// prefix) removed.
    pub fn entry(&self, strip: usize) -> Entry {
        let key = &self.record.key;
        Entry {
            seq: self.seq,
            key: key.slice(strip.min(key.len())..),
            value: self.record.value.clone(),
        }
    }
}
