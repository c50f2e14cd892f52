//! WAL entry types and serialization

use crate::types::{Key, Record, RecordKind, SeqNum};
use crate::{Result, StrataError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes before the checksummed body: length + crc
const FRAME_PREFIX: usize = 8;
/// Fixed part of the body: kind + seq + key + value length
const BODY_HEADER: usize = 1 + 8 + 8 + 4;

/// WAL entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalEntryType {
    /// Key now holds a value
    Put = 1,
    /// Key was removed
    Delete = 2,
}

impl TryFrom<u8> for WalEntryType {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalEntryType::Put),
            2 => Ok(WalEntryType::Delete),
            _ => Err(StrataError::Corruption(format!(
                "Invalid WAL entry type: {}",
                value
            ))),
        }
    }
}

/// A single logged mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub entry_type: WalEntryType,
    pub seq: SeqNum,
    pub key: Key,
    /// Empty for deletes
    pub value: Bytes,
}

impl WalEntry {
    /// Create a put entry
    pub fn put(seq: SeqNum, key: Key, value: Bytes) -> Self {
        Self {
            entry_type: WalEntryType::Put,
            seq,
            key,
            value,
        }
    }

    /// Create a delete entry
    pub fn delete(seq: SeqNum, key: Key) -> Self {
        Self {
            entry_type: WalEntryType::Delete,
            seq,
            key,
            value: Bytes::new(),
        }
    }

    /// Encoded size of this entry
    pub fn encoded_len(&self) -> usize {
        FRAME_PREFIX + BODY_HEADER + self.value.len()
    }

    /// Serialize the entry with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: body length
    /// - 4 bytes: CRC32 of the body
    /// - 1 byte: entry type
    /// - 8 bytes: sequence number
    /// - 8 bytes: key
    /// - 4 bytes: value length
    /// - N bytes: value
    pub fn serialize_with_checksum(&self) -> Bytes {
        let body_len = BODY_HEADER + self.value.len();
        let mut buf = BytesMut::with_capacity(FRAME_PREFIX + body_len);

        buf.put_u32_le(body_len as u32);
        // checksum is patched in once the body is written
        buf.put_u32_le(0);

        buf.put_u8(self.entry_type as u8);
        buf.put_u64_le(self.seq);
        buf.put_i64_le(self.key);
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(&self.value);

        let checksum = crc32fast::hash(&buf[FRAME_PREFIX..]);
        buf[4..8].copy_from_slice(&checksum.to_le_bytes());

        buf.freeze()
    }

    /// Length of the frame at the front of `data` according to its length
    /// prefix, or `None` if the prefix itself is cut short. Nothing is validated.
    pub fn framed_len(data: &[u8]) -> Option<usize> {
        let mut prefix = data.get(..FRAME_PREFIX)?;
        Some(FRAME_PREFIX + prefix.get_u32_le() as usize)
    }

    /// Deserialize one frame from the front of `data`, validating its checksum.
    ///
    /// Returns the entry and the number of bytes consumed. A frame cut short by
    /// the end of `data` is reported as `Corruption("Incomplete entry")`.
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < FRAME_PREFIX {
            return Err(StrataError::Corruption("Incomplete entry".into()));
        }

        let mut cursor = &data[..FRAME_PREFIX];
        let body_len = cursor.get_u32_le() as usize;
        let expected = cursor.get_u32_le();

        if body_len < BODY_HEADER {
            return Err(StrataError::Corruption(format!(
                "WAL frame body too short: {}",
                body_len
            )));
        }
        if data.len() - FRAME_PREFIX < body_len {
            return Err(StrataError::Corruption("Incomplete entry".into()));
        }

        let body = &data[FRAME_PREFIX..FRAME_PREFIX + body_len];
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let entry_type = WalEntryType::try_from(cursor.get_u8())?;
        let seq = cursor.get_u64_le();
        let key = cursor.get_i64_le();
        let value_len = cursor.get_u32_le() as usize;
        if value_len != cursor.remaining() {
            return Err(StrataError::Corruption(format!(
                "WAL value length {} does not match frame ({} bytes left)",
                value_len,
                cursor.remaining()
            )));
        }
        let value = Bytes::copy_from_slice(cursor);

        let entry = WalEntry {
            entry_type,
            seq,
            key,
            value,
        };
        Ok((entry, FRAME_PREFIX + body_len))
    }

    /// Convert into a memtable record
    pub fn into_record(self) -> Record {
        match self.entry_type {
            WalEntryType::Put => Record::put(self.key, self.seq, self.value),
            WalEntryType::Delete => Record::tombstone(self.key, self.seq),
        }
    }

    /// Build from a record
    pub fn from_record(record: &Record) -> Self {
        match record.kind {
            RecordKind::Put => WalEntry::put(
                record.seq,
                record.key,
                record.value.clone().unwrap_or_default(),
            ),
            RecordKind::Tombstone => WalEntry::delete(record.seq, record.key),
        }
    }
}
