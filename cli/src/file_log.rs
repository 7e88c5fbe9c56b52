//! # File-Backed Log
//!
//! Persists a tree between CLI invocations. The file is a flat sequence of
//! frames, each a little-endian `u32` length followed by the record bytes.
//! The whole file is loaded into a [`MemoryLog`] on open and every append is
//! written through to disk before it becomes visible.
//!
//! A frame cut short by a crash mid-append is dropped on the next open and
//! the file is trimmed back to the last whole frame.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use logbee::{BeeError, Log, LogEvent, MemoryLog, Result};

const FRAME_HEADER: usize = 4;

pub struct FileLog {
    inner: Arc<dyn Log>,
    file: Arc<Mutex<File>>,
}

impl FileLog {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };
        let total = raw.len();
        let (records, valid) = decode_frames(Bytes::from(raw));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        if valid < total {
            warn!(
                path = %path.display(),
                dropped = total - valid,
                "discarding torn frame at end of file"
            );
            file.set_len(valid as u64).await?;
        }
        debug!(path = %path.display(), records = records.len(), "tree file loaded");

        Ok(Self {
            inner: Arc::new(MemoryLog::from_records(records)),
            file: Arc::new(Mutex::new(file)),
        })
    }
}

/// Splits `raw` into whole frames. Returns the records and the number of
/// bytes they cover.
fn decode_frames(mut raw: Bytes) -> (Vec<Bytes>, usize) {
    let total = raw.len();
    let mut records = Vec::new();

    while raw.len() >= FRAME_HEADER {
        let len = (&raw[..FRAME_HEADER]).get_u32_le() as usize;
        if raw.len() - FRAME_HEADER < len {
            break;
        }
        raw.advance(FRAME_HEADER);
        records.push(raw.split_to(len));
    }

    (records, total - raw.len())
}

fn encode_frames(records: &[Bytes]) -> Result<Bytes> {
    let size = records.iter().map(|r| FRAME_HEADER + r.len()).sum();
    let mut out = BytesMut::with_capacity(size);
    for record in records {
        let len = u32::try_from(record.len()).map_err(|_| {
            BeeError::AppendFailed(format!("record of {} bytes is too large", record.len()))
        })?;
        out.put_u32_le(len);
        out.put_slice(record);
    }
    Ok(out.freeze())
}

#[async_trait]
impl Log for FileLog {
    async fn get(&self, seq: u64) -> Result<Option<Bytes>> {
        self.inner.get(seq).await
    }

    async fn append(&self, records: Vec<Bytes>) -> Result<u64> {
        if !self.inner.writable() {
            return Err(BeeError::ReadOnly);
        }
        let frames = encode_frames(&records)?;

        let mut file = self.file.lock().await;
        file.write_all(&frames).await?;
        file.flush().await?;
        file.sync_data().await?;

        self.inner.append(records).await
    }

    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn fork(&self) -> u64 {
        self.inner.fork()
    }

    fn writable(&self) -> bool {
        self.inner.writable()
    }

    fn snapshot(&self) -> Arc<dyn Log> {
        self.inner.snapshot()
    }

    fn session(&self) -> Arc<dyn Log> {
        Arc::new(FileLog {
            inner: self.inner.session(),
            file: Arc::clone(&self.file),
        })
    }

    async fn update(&self, wait: bool) -> Result<bool> {
        self.inner.update(wait).await
    }

    fn has_local(&self, seq: u64) -> bool {
        self.inner.has_local(seq)
    }

    fn indexed_length(&self) -> u64 {
        self.inner.indexed_length()
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.inner.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logbee::{Bee, BeeOptions};

    #[tokio::test]
    async fn trees_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.bee");

        {
            let bee = Bee::new(Arc::new(FileLog::open(&path).await.unwrap()), BeeOptions::default());
            for i in 0..20 {
                bee.put(format!("k{i:02}").as_bytes(), b"v").await.unwrap();
            }
            bee.del(b"k05").await.unwrap();
        }

        let log = FileLog::open(&path).await.unwrap();
        assert_eq!(log.length(), 22);
        let bee = Bee::new(Arc::new(log), BeeOptions::default());
        assert!(Bee::is_bee(bee.log().as_ref()).await.unwrap());
        assert_eq!(bee.get(b"k05").await.unwrap(), None);
        assert!(bee.get(b"k19").await.unwrap().is_some());
        assert!(bee.check().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn torn_tail_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.bee");

        let log = FileLog::open(&path).await.unwrap();
        log.append(vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")])
            .await
            .unwrap();
        drop(log);

        let mut raw = std::fs::read(&path).unwrap();
        let whole = raw.len();
        raw.extend_from_slice(&[9, 0, 0, 0, b'x']);
        std::fs::write(&path, &raw).unwrap();

        let log = FileLog::open(&path).await.unwrap();
        assert_eq!(log.length(), 2);
        assert_eq!(log.get(1).await.unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), whole as u64);
    }

    #[test]
    fn frames_split_on_length_prefixes() {
        let frames = encode_frames(&[Bytes::from_static(b"ab"), Bytes::new()]).unwrap();
        assert_eq!(frames.as_ref(), &[2, 0, 0, 0, b'a', b'b', 0, 0, 0, 0]);

        let (records, valid) = decode_frames(frames);
        assert_eq!(records, vec![Bytes::from_static(b"ab"), Bytes::new()]);
        assert_eq!(valid, 10);
    }
}
