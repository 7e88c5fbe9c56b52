//! # Wire Messages
//!
//! Every record in the log is one of two protobuf messages: the header that
//! occupies seq 0, or a node record carrying a key, an optional value and the
//! flattened pointer table of every tree node the write touched.
//!
//! ```text
//! Header     { 1: string protocol, 2: optional bytes metadata }
//! Node       { 1: bytes key, 2: optional bytes value, 3: bytes index }
//! YoloIndex  { 1: repeated Level levels }
//! Level      { 1: repeated uint64 keys [packed],
//!              2: repeated uint64 children [packed] }   // seq, offset, seq, offset, ...
//! ```
//!
//! The layout is bit-compatible with existing hyperbee logs, so the codec is
//! written against the protobuf wire format directly instead of going through
//! a schema compiler. Decoders are tolerant in the usual protobuf way: unknown
//! fields are skipped and repeated scalars are accepted packed or unpacked.
//!
//! Presence matters for `value`: an absent field is a tombstone, a present
//! zero-length field is an empty value. The two must never be conflated.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::PROTOCOL_NAME;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Failures while decoding a record from its wire form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of input while reading {0}")]
    Truncated(&'static str),

    #[error("varint is longer than 10 bytes")]
    VarintOverflow,

    #[error("unsupported wire type {wire_type} on field {field}")]
    WireType { field: u64, wire_type: u8 },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("child pointer list has odd length {0}")]
    OddChildren(usize),
}

type DecodeResult<T> = Result<T, DecodeError>;

// ---------------------------------------------------------------------------
// Wire Primitives
// ---------------------------------------------------------------------------

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(buf: &mut Bytes) -> DecodeResult<u64> {
    let mut value = 0u64;
    for shift in (0..70).step_by(7) {
        if !buf.has_remaining() {
            return Err(DecodeError::Truncated("varint"));
        }
        let byte = buf.get_u8();
        if shift == 63 && byte > 1 {
            return Err(DecodeError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(DecodeError::VarintOverflow)
}

fn put_tag(buf: &mut BytesMut, field: u64, wire_type: u8) {
    put_varint(buf, (field << 3) | u64::from(wire_type));
}

fn put_len_field(buf: &mut BytesMut, field: u64, data: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

fn put_packed(buf: &mut BytesMut, field: u64, values: impl Iterator<Item = u64>) {
    let mut packed = BytesMut::new();
    for v in values {
        put_varint(&mut packed, v);
    }
    if !packed.is_empty() {
        put_len_field(buf, field, &packed);
    }
}

fn get_tag(buf: &mut Bytes) -> DecodeResult<(u64, u8)> {
    let tag = get_varint(buf)?;
    Ok((tag >> 3, (tag & 0x07) as u8))
}

fn get_len_delimited(buf: &mut Bytes, what: &'static str) -> DecodeResult<Bytes> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(DecodeError::Truncated(what));
    }
    Ok(buf.split_to(len))
}

fn skip_field(buf: &mut Bytes, field: u64, wire_type: u8) -> DecodeResult<()> {
    let width = match wire_type {
        WIRE_VARINT => return get_varint(buf).map(|_| ()),
        WIRE_LEN => return get_len_delimited(buf, "unknown field").map(|_| ()),
        WIRE_FIXED64 => 8,
        WIRE_FIXED32 => 4,
        other => {
            return Err(DecodeError::WireType {
                field,
                wire_type: other,
            })
        }
    };
    if buf.remaining() < width {
        return Err(DecodeError::Truncated("fixed-width field"));
    }
    buf.advance(width);
    Ok(())
}

/// Reads one occurrence of a repeated uint64 field, packed or not.
fn get_repeated_u64(
    buf: &mut Bytes,
    field: u64,
    wire_type: u8,
    out: &mut Vec<u64>,
) -> DecodeResult<()> {
    match wire_type {
        WIRE_VARINT => out.push(get_varint(buf)?),
        WIRE_LEN => {
            let mut packed = get_len_delimited(buf, "packed uint64")?;
            while packed.has_remaining() {
                out.push(get_varint(&mut packed)?);
            }
        }
        other => {
            return Err(DecodeError::WireType {
                field,
                wire_type: other,
            })
        }
    }
    Ok(())
}

fn expect_len(field: u64, wire_type: u8) -> DecodeResult<()> {
    if wire_type == WIRE_LEN {
        Ok(())
    } else {
        Err(DecodeError::WireType { field, wire_type })
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The record stored at seq 0. It identifies the log as a tree and never
/// participates in the tree itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub protocol: String,
    pub metadata: Option<Bytes>,
}

impl Header {
    /// Header for a fresh tree, with optional opaque user metadata.
    pub fn new(metadata: Option<Bytes>) -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            metadata,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_len_field(&mut buf, 1, self.protocol.as_bytes());
        if let Some(metadata) = &self.metadata {
            put_len_field(&mut buf, 2, metadata);
        }
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> DecodeResult<Self> {
        let mut protocol = None;
        let mut metadata = None;

        while raw.has_remaining() {
            let (field, wire_type) = get_tag(&mut raw)?;
            match field {
                1 => {
                    expect_len(field, wire_type)?;
                    let bytes = get_len_delimited(&mut raw, "header.protocol")?;
                    let text = std::str::from_utf8(&bytes)
                        .map_err(|_| DecodeError::InvalidUtf8("header.protocol"))?;
                    protocol = Some(text.to_string());
                }
                2 => {
                    expect_len(field, wire_type)?;
                    metadata = Some(get_len_delimited(&mut raw, "header.metadata")?);
                }
                _ => skip_field(&mut raw, field, wire_type)?,
            }
        }

        Ok(Self {
            protocol: protocol.ok_or(DecodeError::MissingField("header.protocol"))?,
            metadata,
        })
    }
}

// ---------------------------------------------------------------------------
// Node Record
// ---------------------------------------------------------------------------

/// A tree record as it sits in the log. `index` stays encoded until a reader
/// actually needs the pointer table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub index: Bytes,
}

impl NodeRecord {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.key.len() + self.index.len() + 16);
        put_len_field(&mut buf, 1, &self.key);
        if let Some(value) = &self.value {
            put_len_field(&mut buf, 2, value);
        }
        put_len_field(&mut buf, 3, &self.index);
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> DecodeResult<Self> {
        let mut key = None;
        let mut value = None;
        let mut index = Bytes::new();

        while raw.has_remaining() {
            let (field, wire_type) = get_tag(&mut raw)?;
            match field {
                1 => {
                    expect_len(field, wire_type)?;
                    key = Some(get_len_delimited(&mut raw, "node.key")?);
                }
                2 => {
                    expect_len(field, wire_type)?;
                    value = Some(get_len_delimited(&mut raw, "node.value")?);
                }
                3 => {
                    expect_len(field, wire_type)?;
                    index = get_len_delimited(&mut raw, "node.index")?;
                }
                _ => skip_field(&mut raw, field, wire_type)?,
            }
        }

        Ok(Self {
            key: key.ok_or(DecodeError::MissingField("node.key"))?,
            value,
            index,
        })
    }
}

// ---------------------------------------------------------------------------
// Pointer Table
// ---------------------------------------------------------------------------

/// One serialized tree node: key seqs and `(seq, offset)` child pointers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Level {
    pub keys: Vec<u64>,
    pub children: Vec<(u64, u64)>,
}

/// The decoded `index` field of a node record. Level 0 is the root of the
/// tree for the final record of a write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PointerTable {
    pub levels: Vec<Level>,
}

impl PointerTable {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for level in &self.levels {
            let mut inner = BytesMut::new();
            put_packed(&mut inner, 1, level.keys.iter().copied());
            put_packed(
                &mut inner,
                2,
                level
                    .children
                    .iter()
                    .flat_map(|&(seq, offset)| [seq, offset]),
            );
            put_len_field(&mut buf, 1, &inner);
        }
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> DecodeResult<Self> {
        let mut levels = Vec::new();

        while raw.has_remaining() {
            let (field, wire_type) = get_tag(&mut raw)?;
            if field != 1 {
                skip_field(&mut raw, field, wire_type)?;
                continue;
            }
            expect_len(field, wire_type)?;
            let level = get_len_delimited(&mut raw, "index.level")?;
            levels.push(decode_level(level)?);
        }

        Ok(Self { levels })
    }

    /// True if any level references `seq` as a key.
    pub fn has_key(&self, seq: u64) -> bool {
        self.levels.iter().any(|level| level.keys.contains(&seq))
    }
}

fn decode_level(mut raw: Bytes) -> DecodeResult<Level> {
    let mut keys = Vec::new();
    let mut flat = Vec::new();

    while raw.has_remaining() {
        let (field, wire_type) = get_tag(&mut raw)?;
        match field {
            1 => get_repeated_u64(&mut raw, field, wire_type, &mut keys)?,
            2 => get_repeated_u64(&mut raw, field, wire_type, &mut flat)?,
            _ => skip_field(&mut raw, field, wire_type)?,
        }
    }

    if flat.len() % 2 != 0 {
        return Err(DecodeError::OddChildren(flat.len()));
    }

    let children = flat.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect();
    Ok(Level { keys, children })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
