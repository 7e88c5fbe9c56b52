//! In-process reference log.
//!
//! All handles opened from one `MemoryLog` share a single record vector.
//! Beyond the plain contract it can simulate the situations a replicated log
//! runs into: records that are known but not stored locally, a peer that
//! cannot serve them, history truncation with a fork bump, and appends that
//! fail outright.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Log, LogEvent};
use crate::error::{BeeError, Result};

const EVENT_CAPACITY: usize = 256;

struct State {
    records: Vec<Bytes>,
    /// Parallel to `records`: whether the record is stored locally.
    local: Vec<bool>,
    fork: u64,
    /// `(fork after the cut, length after the cut)` for every truncation.
    truncations: Vec<(u64, u64)>,
    /// Whether non-local records can be fetched on demand.
    reachable: bool,
    fail_appends: Option<String>,
}

struct Shared {
    state: RwLock<State>,
    events: broadcast::Sender<LogEvent>,
}

#[derive(Clone, Copy)]
struct Pin {
    length: u64,
    fork: u64,
}

/// A shared, in-memory [`Log`].
pub struct MemoryLog {
    shared: Arc<Shared>,
    pinned: Option<Pin>,
    writable: bool,
    closed: AtomicBool,
}

impl MemoryLog {
    /// An empty, writable log.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    records: Vec::new(),
                    local: Vec::new(),
                    fork: 0,
                    truncations: Vec::new(),
                    reachable: true,
                    fail_appends: None,
                }),
                events,
            }),
            pinned: None,
            writable: true,
            closed: AtomicBool::new(false),
        }
    }

    /// A log preloaded with `records`, for restoring persisted state.
    pub fn from_records(records: Vec<Bytes>) -> Self {
        let log = Self::new();
        {
            let mut state = log.shared.state.write();
            state.local = vec![true; records.len()];
            state.records = records;
        }
        log
    }

    /// A read-only handle on the same records, as a replica would see them.
    pub fn reader(&self) -> Self {
        self.handle(None, false)
    }

    fn handle(&self, pinned: Option<Pin>, writable: bool) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            pinned,
            writable,
            closed: AtomicBool::new(false),
        }
    }

    /// Cuts the log back to `length` and bumps the fork counter.
    pub fn truncate(&self, length: u64) {
        let mut state = self.shared.state.write();
        let keep = usize::try_from(length).unwrap_or(usize::MAX);
        state.records.truncate(keep);
        state.local.truncate(keep);
        state.fork += 1;
        let fork = state.fork;
        state.truncations.push((fork, length));
        drop(state);

        debug!(length, fork, "log truncated");
        let _ = self.shared.events.send(LogEvent::Truncate { length, fork });
    }

    /// Marks a record as present or absent from local storage.
    pub fn set_local(&self, seq: u64, local: bool) {
        let mut state = self.shared.state.write();
        if let Some(slot) = usize::try_from(seq).ok().and_then(|i| state.local.get_mut(i)) {
            *slot = local;
        }
    }

    /// Controls whether non-local records can still be fetched.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.state.write().reachable = reachable;
    }

    /// Makes every subsequent append fail with `reason`, or clears it.
    pub fn set_append_failure(&self, reason: Option<String>) {
        self.shared.state.write().fail_appends = reason;
    }

    /// Copies of every record currently in the log, in order.
    pub fn records(&self) -> Vec<Bytes> {
        let state = self.shared.state.read();
        let len = self.visible_length(&state) as usize;
        state.records[..len.min(state.records.len())].to_vec()
    }

    fn visible_length(&self, state: &State) -> u64 {
        match self.pinned {
            Some(pin) => pin.length,
            None => state.records.len() as u64,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BeeError::SessionClosed);
        }
        Ok(())
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Log for MemoryLog {
    async fn get(&self, seq: u64) -> Result<Option<Bytes>> {
        self.ensure_open()?;

        if let Some(pin) = self.pinned {
            let state = self.shared.state.read();
            let cut = state
                .truncations
                .iter()
                .filter(|(fork, _)| *fork > pin.fork)
                .map(|(_, length)| *length)
                .min();
            if matches!(cut, Some(length) if seq < pin.length && seq >= length) {
                return Err(BeeError::SnapshotInvalidated { seq });
            }
            if seq >= pin.length {
                return Ok(None);
            }
        }

        let idx = match usize::try_from(seq) {
            Ok(idx) => idx,
            Err(_) => return Ok(None),
        };

        {
            let state = self.shared.state.read();
            match state.records.get(idx) {
                None => return Ok(None),
                Some(record) if state.local[idx] => return Ok(Some(record.clone())),
                Some(_) if !state.reachable => return Ok(None),
                Some(_) => {}
            }
        }

        // Reachable but not local: "download" it.
        let mut state = self.shared.state.write();
        let record = state.records.get(idx).cloned();
        if record.is_some() {
            state.local[idx] = true;
        }
        Ok(record)
    }

    async fn append(&self, records: Vec<Bytes>) -> Result<u64> {
        self.ensure_open()?;
        if !self.writable {
            return Err(BeeError::ReadOnly);
        }

        let mut state = self.shared.state.write();
        if let Some(reason) = &state.fail_appends {
            return Err(BeeError::AppendFailed(reason.clone()));
        }

        let first = state.records.len() as u64;
        state.local.extend(std::iter::repeat(true).take(records.len()));
        state.records.extend(records);
        let length = state.records.len() as u64;
        drop(state);

        let _ = self.shared.events.send(LogEvent::Append { length });
        Ok(first)
    }

    fn length(&self) -> u64 {
        let state = self.shared.state.read();
        self.visible_length(&state)
    }

    fn fork(&self) -> u64 {
        match self.pinned {
            Some(pin) => pin.fork,
            None => self.shared.state.read().fork,
        }
    }

    fn writable(&self) -> bool {
        self.writable && self.pinned.is_none()
    }

    fn snapshot(&self) -> Arc<dyn Log> {
        let pin = match self.pinned {
            Some(pin) => pin,
            None => {
                let state = self.shared.state.read();
                Pin {
                    length: state.records.len() as u64,
                    fork: state.fork,
                }
            }
        };
        Arc::new(self.handle(Some(pin), false))
    }

    fn session(&self) -> Arc<dyn Log> {
        Arc::new(self.handle(self.pinned, self.writable))
    }

    async fn update(&self, _wait: bool) -> Result<bool> {
        self.ensure_open()?;
        Ok(false)
    }

    fn has_local(&self, seq: u64) -> bool {
        let state = self.shared.state.read();
        usize::try_from(seq)
            .ok()
            .and_then(|i| state.local.get(i).copied())
            .unwrap_or(false)
    }

    fn indexed_length(&self) -> u64 {
        self.length()
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.shared.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
