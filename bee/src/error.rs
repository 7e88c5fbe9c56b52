//! # Error Types
//!
//! One error enum for the whole tree layer. Wire-level failures come from
//! [`crate::messages::DecodeError`] and are wrapped here; rejected CAS
//! predicates and suppressed duplicate writes are outcomes, not errors, and
//! never show up in this type.

use crate::messages::DecodeError;

/// Errors surfaced by tree reads and writes.
#[derive(Debug, thiserror::Error)]
pub enum BeeError {
    /// The record is neither stored locally nor retrievable from the log.
    #[error("record {seq} is not available")]
    NotAvailable { seq: u64 },

    /// A write was attempted on a tree or log that does not accept writes.
    #[error("tree is read-only")]
    ReadOnly,

    /// The snapshot being read has been invalidated by a truncation.
    #[error("snapshot invalidated: record {seq} was truncated away")]
    SnapshotInvalidated { seq: u64 },

    /// The log forked under a batch whose working tree was built on the
    /// old history. Any staged writes are discarded.
    #[error("log forked to fork {fork} under an open batch")]
    Forked { fork: u64 },

    /// A record decoded fine but its contents violate the tree format.
    #[error("malformed record {seq}: {reason}")]
    MalformedRecord { seq: u64, reason: String },

    /// The session or log handle has already been closed.
    #[error("session is closed")]
    SessionClosed,

    /// The log refused to append a batch.
    #[error("append failed: {0}")]
    AppendFailed(String),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BeeError>;
