//! Small byte helpers shared across the crate.

use bytes::{BufMut, Bytes, BytesMut};

/// Value equality where two tombstones are equal.
pub fn same_value(a: Option<&[u8]>, b: Option<&[u8]>) -> bool {
    a == b
}

/// `prefix ++ key`.
pub fn concat(prefix: &[u8], key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(prefix.len() + key.len());
    buf.put_slice(prefix);
    buf.put_slice(key);
    buf.freeze()
}

/// The smallest byte string greater than every string starting with
/// `prefix`, or `None` if no such string exists (all bytes are `0xff`).
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Bytes> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < 0xff {
            bound.push(last + 1);
            return Some(Bytes::from(bound));
        }
    }
    None
}
