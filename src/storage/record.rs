use bytes::{Buf, BufMut};

use crate::utils::checksum::adler32;

use super::NOT_FOUND;

/// ASCII "KNOW" magic value at byte 0 of every storage file.
pub const STORAGE_SIGNATURE: u32 = 0x574F_4E4B;
/// Current storage format version.
pub const STORAGE_VERSION: u32 = 1;

pub const STORAGE_HEADER_SIZE: usize = 64;
pub const RECORD_HEADER_SIZE: usize = 40;
/// Record header bytes covered by `head_checksum` (everything before it).
pub const RECORD_HEAD_CHECKED_SIZE: usize = RECORD_HEADER_SIZE - 4;

/// Highest bit of `bit_flags` marks a record sitting on the free list.
pub const RECORD_DELETED_FLAG: u64 = 1 << 63;

/// Storage header, 64 bytes at file offset 0.
///
/// All fields are encoded little-endian with no padding:
///
/// ```text
/// signature | version | endOfData | totalRecords | firstRecord
/// lastRecord | totalFreeRecords | firstFreeRecord | lastFreeRecord
///    u32    |   u32   |    u64    |      u64      |     u64
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageHeader {
    pub signature: u32,
    pub version: u32,
    /// Offset of the first byte past the last allocated record slot.
    pub end_of_data: u64,

    pub total_records: u64,
    pub first_record: u64,
    pub last_record: u64,

    pub total_free_records: u64,
    pub first_free_record: u64,
    pub last_free_record: u64,
}

impl StorageHeader {
    /// Header of a freshly initialized, empty storage file.
    pub fn new() -> Self {
        Self {
            signature: STORAGE_SIGNATURE,
            version: STORAGE_VERSION,
            end_of_data: STORAGE_HEADER_SIZE as u64,
            total_records: 0,
            first_record: NOT_FOUND,
            last_record: NOT_FOUND,
            total_free_records: 0,
            first_free_record: NOT_FOUND,
            last_free_record: NOT_FOUND,
        }
    }

    /// Checks the magic value and format version.
    pub fn is_valid(&self) -> bool {
        self.signature == STORAGE_SIGNATURE && self.version == STORAGE_VERSION
    }

    pub fn encode(&self) -> [u8; STORAGE_HEADER_SIZE] {
        let mut out = [0u8; STORAGE_HEADER_SIZE];
        let mut buf = &mut out[..];

        buf.put_u32_le(self.signature);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.end_of_data);
        buf.put_u64_le(self.total_records);
        buf.put_u64_le(self.first_record);
        buf.put_u64_le(self.last_record);
        buf.put_u64_le(self.total_free_records);
        buf.put_u64_le(self.first_free_record);
        buf.put_u64_le(self.last_free_record);

        out
    }

    pub fn decode(bytes: &[u8; STORAGE_HEADER_SIZE]) -> Self {
        let mut buf = &bytes[..];

        Self {
            signature: buf.get_u32_le(),
            version: buf.get_u32_le(),
            end_of_data: buf.get_u64_le(),
            total_records: buf.get_u64_le(),
            first_record: buf.get_u64_le(),
            last_record: buf.get_u64_le(),
            total_free_records: buf.get_u64_le(),
            first_free_record: buf.get_u64_le(),
            last_free_record: buf.get_u64_le(),
        }
    }
}

impl Default for StorageHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Record header, 40 bytes in front of every payload slot.
///
/// `next`/`previous` are file offsets chaining the record into its list,
/// live or free. `head_checksum` is Adler-32 over the 36 preceding encoded
/// bytes; `data_checksum` is Adler-32 over the `data_length` payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub next: u64,
    pub previous: u64,
    pub bit_flags: u64,
    /// Reserved payload bytes in this slot.
    pub record_capacity: u32,
    /// Payload bytes currently stored, at most `record_capacity`.
    pub data_length: u32,
    pub data_checksum: u32,
    pub head_checksum: u32,
}

impl RecordHeader {
    pub fn is_deleted(&self) -> bool {
        self.bit_flags & RECORD_DELETED_FLAG != 0
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut out = [0u8; RECORD_HEADER_SIZE];
        let mut buf = &mut out[..];

        buf.put_u64_le(self.next);
        buf.put_u64_le(self.previous);
        buf.put_u64_le(self.bit_flags);
        buf.put_u32_le(self.record_capacity);
        buf.put_u32_le(self.data_length);
        buf.put_u32_le(self.data_checksum);
        buf.put_u32_le(self.head_checksum);

        out
    }

    pub fn decode(bytes: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let mut buf = &bytes[..];

        Self {
            next: buf.get_u64_le(),
            previous: buf.get_u64_le(),
            bit_flags: buf.get_u64_le(),
            record_capacity: buf.get_u32_le(),
            data_length: buf.get_u32_le(),
            data_checksum: buf.get_u32_le(),
            head_checksum: buf.get_u32_le(),
        }
    }

    /// Adler-32 over the checked prefix of the encoded header.
    pub fn compute_head_checksum(&self) -> u32 {
        let bytes = self.encode();
        adler32(&bytes[..RECORD_HEAD_CHECKED_SIZE])
    }

    /// Recomputes and stores `head_checksum`. Call after any field change,
    /// right before the header goes to disk.
    pub fn seal(&mut self) {
        self.head_checksum = self.compute_head_checksum();
    }

    /// True when the stored `head_checksum` matches the header contents.
    pub fn verify(&self) -> bool {
        self.head_checksum == self.compute_head_checksum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_header_round_trip() {
        let mut header = StorageHeader::new();
        header.end_of_data = 4096;
        header.total_records = 7;
        header.first_record = 64;
        header.last_record = 1024;

        let decoded = StorageHeader::decode(&header.encode());
        assert_eq!(decoded, header);
        assert!(decoded.is_valid());
    }

    #[test]
    fn fresh_storage_header_is_empty() {
        let header = StorageHeader::new();
        assert_eq!(header.end_of_data, STORAGE_HEADER_SIZE as u64);
        assert_eq!(header.total_records, 0);
        assert_eq!(header.first_record, NOT_FOUND);
        assert_eq!(header.last_record, NOT_FOUND);
        assert_eq!(header.total_free_records, 0);
    }

    #[test]
    fn bad_signature_is_invalid() {
        let mut bytes = StorageHeader::new().encode();
        bytes[0] ^= 0xFF;
        assert!(!StorageHeader::decode(&bytes).is_valid());
    }

    #[test]
    fn record_header_round_trip_and_seal() {
        let mut header = RecordHeader {
            next: 512,
            previous: NOT_FOUND,
            bit_flags: 0,
            record_capacity: 128,
            data_length: 100,
            data_checksum: 0xDEAD_BEEF,
            head_checksum: 0,
        };
        header.seal();
        assert!(header.verify());

        let decoded = RecordHeader::decode(&header.encode());
        assert_eq!(decoded, header);
        assert!(decoded.verify());
    }

    #[test]
    fn corrupt_header_fails_verify() {
        let mut header = RecordHeader {
            next: NOT_FOUND,
            previous: NOT_FOUND,
            bit_flags: 0,
            record_capacity: 64,
            data_length: 10,
            data_checksum: 42,
            head_checksum: 0,
        };
        header.seal();

        let mut bytes = header.encode();
        bytes[3] ^= 0x10;
        assert!(!RecordHeader::decode(&bytes).verify());
    }

    #[test]
    fn deleted_flag() {
        let mut header = RecordHeader {
            next: NOT_FOUND,
            previous: NOT_FOUND,
            bit_flags: 0,
            record_capacity: 8,
            data_length: 0,
            data_checksum: 0,
            head_checksum: 0,
        };
        assert!(!header.is_deleted());
        header.bit_flags |= RECORD_DELETED_FLAG;
        assert!(header.is_deleted());
    }
}
