//! SSTable data block implementation
//!
//! A block is a run of records in `(key asc, seq desc)` order, compressed as
//! one unit and framed so it can be verified and decoded independently.

use crate::compression::Compression;
use crate::types::{InternalKey, Key, Record, RecordKind, SeqNum};
use crate::{Result, StrataError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encoded record header: key + seq + kind + value length
const RECORD_HEADER: usize = 8 + 8 + 1 + 4;

/// Block frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Codec used for the payload
    pub codec: Compression,
    /// Uncompressed size
    pub raw_len: u32,
    /// Compressed payload size
    pub payload_len: u32,
}

impl BlockHeader {
    /// Header size in bytes
    pub const SIZE: usize = 9;
    /// Trailing checksum size
    pub const TRAILER: usize = 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.codec.tag());
        buf.put_u32_le(self.raw_len);
        buf.put_u32_le(self.payload_len);
    }

    fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(StrataError::Corruption("Block header too short".into()));
        }
        Ok(Self {
            codec: Compression::from_tag(data.get_u8())?,
            raw_len: data.get_u32_le(),
            payload_len: data.get_u32_le(),
        })
    }
}

/// A decoded data block
#[derive(Debug)]
pub struct Block {
    records: Vec<Record>,
    raw_len: usize,
}

impl Block {
    /// Verify and decode a framed block
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let header = BlockHeader::decode(frame)?;
        let body_end = BlockHeader::SIZE + header.payload_len as usize;
        if frame.len() != body_end + BlockHeader::TRAILER {
            return Err(StrataError::Corruption(format!(
                "Block frame is {} bytes, header says {}",
                frame.len(),
                body_end + BlockHeader::TRAILER
            )));
        }

        let expected = (&frame[body_end..]).get_u32_le();
        let actual = crc32fast::hash(&frame[..body_end]);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }

        let raw = header
            .codec
            .decompress(&frame[BlockHeader::SIZE..body_end], header.raw_len as usize)?;
        Self::parse_records(Bytes::from(raw))
    }

    fn parse_records(raw: Bytes) -> Result<Self> {
        let raw_len = raw.len();
        let mut records = Vec::new();
        let mut cursor = raw.clone();

        while cursor.has_remaining() {
            if cursor.remaining() < RECORD_HEADER {
                return Err(StrataError::Corruption("Truncated block record".into()));
            }
            let key = cursor.get_i64_le();
            let seq = cursor.get_u64_le();
            let kind = RecordKind::from_u8(cursor.get_u8()).ok_or_else(|| {
                StrataError::Corruption("Invalid record kind in block".into())
            })?;
            let value_len = cursor.get_u32_le() as usize;
            if cursor.remaining() < value_len {
                return Err(StrataError::Corruption("Truncated block value".into()));
            }
            let value = cursor.split_to(value_len);

            records.push(match kind {
                RecordKind::Put => Record::put(key, seq, value),
                RecordKind::Tombstone => Record::tombstone(key, seq),
            });
        }

        Ok(Self { records, raw_len })
    }

    /// Newest record for `key` with `seq <= snapshot`
    pub fn get(&self, key: Key, snapshot: SeqNum) -> Option<&Record> {
        let target = InternalKey::new(key, snapshot);
        let idx = self
            .records
            .partition_point(|r| r.internal_key() < target);
        self.records.get(idx).filter(|r| r.key == key)
    }

    /// Position of the first record with key `>= key`
    pub fn seek(&self, key: Key) -> usize {
        self.records.partition_point(|r| r.key < key)
    }

    /// Records in order
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Decoded size, used as cache weight
    pub fn size(&self) -> usize {
        self.raw_len
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Block builder for writing data
pub struct BlockBuilder {
    buf: BytesMut,
    first_key: Option<Key>,
    last_key: Key,
    count: usize,
}

impl BlockBuilder {
    /// Create a new block builder
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            first_key: None,
            last_key: 0,
            count: 0,
        }
    }

    /// Append a record
    pub fn add(&mut self, record: &Record) {
        let value: &[u8] = record.value.as_deref().unwrap_or(&[]);
        self.buf.put_i64_le(record.key);
        self.buf.put_u64_le(record.seq);
        self.buf.put_u8(record.kind as u8);
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);

        self.first_key.get_or_insert(record.key);
        self.last_key = record.key;
        self.count += 1;
    }

    /// Uncompressed size so far
    pub fn estimated_size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn first_key(&self) -> Option<Key> {
        self.first_key
    }

    pub fn last_key(&self) -> Key {
        self.last_key
    }

    /// Compress and frame the block, resetting the builder
    pub fn finish(&mut self, codec: Compression) -> Result<Bytes> {
        let raw = self.buf.split();
        let payload = codec.compress(&raw)?;

        let mut frame =
            BytesMut::with_capacity(BlockHeader::SIZE + payload.len() + BlockHeader::TRAILER);
        BlockHeader {
            codec,
            raw_len: raw.len() as u32,
            payload_len: payload.len() as u32,
        }
        .encode(&mut frame);
        frame.put_slice(&payload);
        let checksum = crc32fast::hash(&frame);
        frame.put_u32_le(checksum);

        self.first_key = None;
        self.count = 0;
        Ok(frame.freeze())
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}
