//! Byte-level encodings shared by the table formats.
//!
//! ```text
//! uvarint        LEB128, 7 bits per byte, low bits first, at most 10 bytes
//! encode(Value)  [flags: u8 (bit0 = deleted)][expires: u32 LE][data]
//! hash record    [uvarint klen][key][1]                                   tombstone
//!                [uvarint klen][key][0][uvarint delta_exp][uvarint vlen][value]
//! ```
//!
//! `delta_exp` is `0` for values that never expire and
//! `expires - min_expiry + 1` otherwise, so tables whose values expire
//! close together store small deltas.
use byteorder::{ByteOrder, LittleEndian};
use memtable::{Timestamp, Value};

/// Longest valid uvarint encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Size of the fixed prefix of [`encode_value`].
pub const VALUE_PREFIX_LEN: usize = 5;

const FLAG_DELETED: u8 = 1;

/// Appends the uvarint encoding of `x` to `buf`, returning the bytes written.
pub fn put_uvarint(buf: &mut Vec<u8>, mut x: u64) -> usize {
    let mut n = 1;
    while x >= 0x80 {
        buf.push((x as u8) | 0x80);
        x >>= 7;
        n += 1;
    }
    buf.push(x as u8);
    n
}

/// Decodes a uvarint from the front of `buf`, returning the value and the
/// number of bytes consumed, or `None` if `buf` is truncated or the encoding
/// overflows 64 bits.
pub fn get_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut x: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return None;
            }
            return Some((x | (b as u64) << shift, i + 1));
        }
        x |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    None
}

/// Number of bytes [`put_uvarint`] writes for `x`.
pub fn uvarint_len(mut x: u64) -> usize {
    let mut n = 1;
    while x >= 0x80 {
        x >>= 7;
        n += 1;
    }
    n
}

/// Self-describing encoding of a value, used by the B-tree and MPH tables.
pub fn encode_value(val: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(VALUE_PREFIX_LEN + val.data.len());
    if val.deleted {
        buf.push(FLAG_DELETED);
        buf.extend_from_slice(&[0u8; 4]);
        return buf;
    }
    buf.push(0);
    let mut exp = [0u8; 4];
    LittleEndian::write_u32(&mut exp, val.expires);
    buf.extend_from_slice(&exp);
    buf.extend_from_slice(&val.data);
    buf
}

/// Inverse of [`encode_value`]. Returns `None` if `buf` is shorter than the
/// fixed prefix.
pub fn decode_value(buf: &[u8]) -> Option<Value> {
    if buf.len() < VALUE_PREFIX_LEN {
        return None;
    }
    if buf[0] & FLAG_DELETED != 0 {
        return Some(Value::tombstone());
    }
    let expires = LittleEndian::read_u32(&buf[1..VALUE_PREFIX_LEN]);
    Some(Value::new(buf[VALUE_PREFIX_LEN..].to_vec(), expires))
}

/// Delta-encodes an expiry against the table's minimum expiry.
pub fn expiry_delta(expires: Timestamp, min_expiry: Timestamp) -> u64 {
    if expires == 0 {
        0
    } else {
        expires.saturating_sub(min_expiry) as u64 + 1
    }
}

/// Inverse of [`expiry_delta`]. `None` if the delta does not fit a timestamp.
pub fn expiry_from_delta(delta: u64, min_expiry: Timestamp) -> Option<Timestamp> {
    if delta == 0 {
        return Some(0);
    }
    let exp = (min_expiry as u64).checked_add(delta - 1)?;
    Timestamp::try_from(exp).ok()
}

/// Appends one hash-table data record to `buf`.
pub fn put_record(buf: &mut Vec<u8>, key: &[u8], val: &Value, min_expiry: Timestamp) {
    put_uvarint(buf, key.len() as u64);
    buf.extend_from_slice(key);
    if val.deleted {
        buf.push(1);
        return;
    }
    buf.push(0);
    put_uvarint(buf, expiry_delta(val.expires, min_expiry));
    put_uvarint(buf, val.data.len() as u64);
    buf.extend_from_slice(&val.data);
}

/// A hash-table record borrowed from the data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub key: &'a [u8],
    pub deleted: bool,
    pub delta_exp: u64,
    pub data: &'a [u8],
    /// Encoded length of the whole record.
    pub len: usize,
}

impl RawRecord<'_> {
    /// Materializes the record, or `None` if the expiry delta is out of range.
    pub fn to_value(&self, min_expiry: Timestamp) -> Option<Value> {
        if self.deleted {
            return Some(Value::tombstone());
        }
        let expires = expiry_from_delta(self.delta_exp, min_expiry)?;
        Some(Value::new(self.data.to_vec(), expires))
    }
}

/// Parses the record at the front of `buf`. `None` means the record runs
/// past the end of `buf`.
pub fn read_record(buf: &[u8]) -> Option<RawRecord<'_>> {
    let (klen, mut pos) = get_uvarint(buf)?;
    let key_end = pos.checked_add(usize::try_from(klen).ok()?)?;
    let key = buf.get(pos..key_end)?;
    pos = key_end;
    let flag = *buf.get(pos)?;
    pos += 1;
    if flag != 0 {
        return Some(RawRecord {
            key,
            deleted: true,
            delta_exp: 0,
            data: &[],
            len: pos,
        });
    }
    let (delta_exp, n) = get_uvarint(&buf[pos..])?;
    pos += n;
    let (vlen, n) = get_uvarint(&buf[pos..])?;
    pos += n;
    let data_end = pos.checked_add(usize::try_from(vlen).ok()?)?;
    let data = buf.get(pos..data_end)?;
    Some(RawRecord {
        key,
        deleted: false,
        delta_exp,
        data,
        len: data_end,
    })
}
