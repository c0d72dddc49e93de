//! Hash table file header and layout constants.
//!
//! ## File layout
//!
//! ```text
//! [HEADER]  64 bytes
//! [DATA]    records grouped by bucket, padded to a multiple of 64 bytes
//! [L1]      one 64-byte slot per bucket
//! [L2]      overflow fingerprints of buckets with more than 29 records
//! [TAIL]    magic (u32 LE)
//! ```
//!
//! ## Header (little-endian)
//!
//! ```text
//! off  len  field
//!   0    4  magic = 0x24112021
//!   4    1  codec = 1 (xxh3)
//!   5    1  encrypted (0)
//!   6    1  compression (0)
//!   7    1  shard bits
//!   8    4  record count
//!  12    4  bucket count
//!  16    8  data size (including padding)
//!  24    4  index size (L1 + L2)
//!  28    4  min expiry
//!  32    4  max expiry
//!  36    4  crc32 of the index segment
//!  40    4  crc32 of the data segment
//!  44   20  reserved, zero
//! ```
//!
//! ## L1 slot
//!
//! ```text
//! count <= 29:  [count: u8][data offset: 5 bytes BE][29 x fingerprint: u16 BE]
//! count  > 29:  [count: u8][data offset: 5 bytes BE][L2 offset: u32 LE][27 x fingerprint: u16 BE]
//! ```
//!
//! Fingerprints within a bucket are sorted ascending; the ones that do not
//! fit inline continue, still sorted, at the L2 offset.
use std::io::{self, Write};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Result, TableError};

/// Magic number at the start of every hash table file.
pub const MAGIC_HEADER: u32 = 0x2411_2021;

/// Magic number in the last four bytes of every hash table file.
pub const MAGIC_TAIL: u32 = 0x2021_1124;

/// Codec 1: xxh3 hashing, uvarint records.
pub const CODEC_XXH3: u8 = 1;

pub const HEADER_SIZE: usize = 64;
pub const TAIL_SIZE: usize = 4;
pub const SLOT_SIZE: usize = 64;

/// Bytes in front of the fingerprints of a slot without overflow.
pub const SLOT_PREFIX: usize = 6;
/// Bytes in front of the fingerprints of a slot with overflow.
pub const SLOT_PREFIX_OVERFLOW: usize = 10;
/// Fingerprints a slot holds when its bucket fits inline.
pub const INLINE_FINGERPRINTS: usize = (SLOT_SIZE - SLOT_PREFIX) / 2;
/// Fingerprints a slot holds when the rest spill into L2.
pub const INLINE_FINGERPRINTS_OVERFLOW: usize = (SLOT_SIZE - SLOT_PREFIX_OVERFLOW) / 2;
/// Records per bucket the builder aims for.
pub const TARGET_RECORDS_PER_BUCKET: usize = 8;
/// Hard limit imposed by the one-byte count in a slot.
pub const MAX_BUCKET_RECORDS: usize = u8::MAX as usize;
/// Largest data offset a slot can express.
pub const MAX_DATA_OFFSET: u64 = 1 << 40;

/// Parsed hash table header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub codec: u8,
    pub encrypted: bool,
    pub compression: u8,
    pub shard_bits: u8,
    pub num_records: u32,
    pub num_buckets: u32,
    pub data_size: u64,
    pub index_size: u32,
    pub min_expiry: u32,
    /// `u32::MAX` if any record never expires (tombstones included).
    pub max_expiry: u32,
    pub index_crc: u32,
    pub data_crc: u32,
}

impl Header {
    /// Total size of a file described by this header.
    pub fn file_size(&self) -> u64 {
        (HEADER_SIZE as u64 + TAIL_SIZE as u64 + self.index_size as u64)
            .saturating_add(self.data_size)
    }
}

/// Writes exactly [`HEADER_SIZE`] bytes.
pub fn write_header<W: Write>(w: &mut W, h: &Header) -> io::Result<()> {
    w.write_u32::<LittleEndian>(MAGIC_HEADER)?;
    w.write_u8(h.codec)?;
    w.write_u8(h.encrypted as u8)?;
    w.write_u8(h.compression)?;
    w.write_u8(h.shard_bits)?;
    w.write_u32::<LittleEndian>(h.num_records)?;
    w.write_u32::<LittleEndian>(h.num_buckets)?;
    w.write_u64::<LittleEndian>(h.data_size)?;
    w.write_u32::<LittleEndian>(h.index_size)?;
    w.write_u32::<LittleEndian>(h.min_expiry)?;
    w.write_u32::<LittleEndian>(h.max_expiry)?;
    w.write_u32::<LittleEndian>(h.index_crc)?;
    w.write_u32::<LittleEndian>(h.data_crc)?;
    w.write_all(&[0u8; 20])?;
    Ok(())
}

/// Parses and validates the first [`HEADER_SIZE`] bytes of `buf`.
///
/// # Errors
///
/// [`TableError::Corrupt`] if `buf` is too short or the magic or codec does
/// not match.
pub fn read_header(file: &str, buf: &[u8]) -> Result<Header> {
    if buf.len() < HEADER_SIZE {
        return Err(TableError::corrupt(file, "file shorter than header"));
    }
    let magic = LittleEndian::read_u32(&buf[0..4]);
    if magic != MAGIC_HEADER {
        return Err(TableError::corrupt(
            file,
            format!("header magic {:#010x} != {:#010x}", magic, MAGIC_HEADER),
        ));
    }
    let codec = buf[4];
    if codec != CODEC_XXH3 {
        return Err(TableError::corrupt(file, format!("unknown codec {}", codec)));
    }
    Ok(Header {
        codec,
        encrypted: buf[5] != 0,
        compression: buf[6],
        shard_bits: buf[7],
        num_records: LittleEndian::read_u32(&buf[8..12]),
        num_buckets: LittleEndian::read_u32(&buf[12..16]),
        data_size: LittleEndian::read_u64(&buf[16..24]),
        index_size: LittleEndian::read_u32(&buf[24..28]),
        min_expiry: LittleEndian::read_u32(&buf[28..32]),
        max_expiry: LittleEndian::read_u32(&buf[32..36]),
        index_crc: LittleEndian::read_u32(&buf[36..40]),
        data_crc: LittleEndian::read_u32(&buf[40..44]),
    })
}

/// Bucket index of `hash` in a table with `num_buckets` (a power of two).
#[inline]
pub fn bucket_of(hash: u64, shard_bits: u8, num_buckets: u32) -> u32 {
    ((hash >> shard_bits) & (num_buckets as u64 - 1)) as u32
}

/// 16-bit fingerprint: the top bits of the hash, which the bucket and
/// shard never consume.
#[inline]
pub fn fingerprint_of(hash: u64) -> u16 {
    (hash >> 48) as u16
}

/// Writes a 5-byte big-endian data offset.
pub fn put_offset40(slot: &mut [u8], offset: u64) {
    slot[1] = (offset >> 32) as u8;
    slot[2] = (offset >> 24) as u8;
    slot[3] = (offset >> 16) as u8;
    slot[4] = (offset >> 8) as u8;
    slot[5] = offset as u8;
}

/// Reads the 5-byte big-endian data offset of a slot.
pub fn get_offset40(slot: &[u8]) -> u64 {
    (slot[1] as u64) << 32
        | (slot[2] as u64) << 24
        | (slot[3] as u64) << 16
        | (slot[4] as u64) << 8
        | slot[5] as u64
}
