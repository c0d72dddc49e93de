//! Minimal-perfect-hash table.
//!
//! ## File layout (little-endian)
//!
//! ```text
//! [HEADER]   64 bytes
//!            0 magic u32 | 4 codec u8 | 8 records u32 | 12 buckets u32
//!            16 seed u64 | 24 bloom len u64 | 32 data size u64 | 40 max expiry u32
//! [BLOOM]    serialized bloom filter over every key
//! [PILOTS]   u32 per bucket
//! [OFFSETS]  u64 per slot, offset of the slot's record in DATA
//! [DATA]     [uvarint key len][key][uvarint value len][encode(Value)] per slot
//! [TAIL]     magic u32
//! ```
//!
//! Keys are spread over `ceil(n / 4)` buckets by their seeded hash. Buckets
//! are placed largest first: for each, the builder searches the smallest
//! pilot that sends every key of the bucket to a distinct free slot in
//! `[0, n)`. A lookup re-derives the slot from the bucket's pilot, so a key
//! that was never inserted still lands on *some* slot; the bloom filter
//! rejects most of those before the record is read.
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bloom::BloomFilter;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memmap2::{Mmap, MmapOptions};
use memtable::{Entry, Timestamp, Value};
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::codec::{decode_value, encode_value, get_uvarint, put_uvarint};
use crate::error::{Result, TableError};
use crate::reader::file_name;
use crate::TableReader;

pub const MPH_MAGIC_HEADER: u32 = 0x4d50_4831;
pub const MPH_MAGIC_TAIL: u32 = 0x3148_504d;
const CODEC: u8 = 1;
const HEADER_SIZE: usize = 64;
const TAIL_SIZE: usize = 4;
const KEYS_PER_BUCKET: usize = 4;
const MAX_SEED_ATTEMPTS: u64 = 16;
const SEED_BASE: u64 = 0x5851_f42d_4c95_7f2d;

/// Slot of a key with seeded hash `h` under `pilot`.
#[inline]
fn slot_of(h: u64, pilot: u32, n: u64) -> u64 {
    xxh3_64_with_seed(&h.to_le_bytes(), pilot as u64) % n
}

#[inline]
fn bucket_of(h: u64, num_buckets: u64) -> u64 {
    (h >> 32) % num_buckets
}

/// Pilots and slot assignment of a successful build.
struct Mph {
    seed: u64,
    pilots: Vec<u32>,
    /// `slots[i]` is the index (into the input) of the key placed at slot `i`.
    slots: Vec<usize>,
}

/// Searches a perfect hash over `keys`, retrying with fresh seeds.
fn build_mph(keys: &[&[u8]]) -> Result<Mph> {
    let n = keys.len();
    if n == 0 {
        return Ok(Mph {
            seed: SEED_BASE,
            pilots: Vec::new(),
            slots: Vec::new(),
        });
    }
    let num_buckets = n.div_ceil(KEYS_PER_BUCKET);
    let max_pilot = (n as u64).saturating_mul(16).clamp(1024, u32::MAX as u64) as u32;

    for attempt in 0..MAX_SEED_ATTEMPTS {
        let seed = SEED_BASE.wrapping_mul(attempt + 1);
        if let Some(mph) = try_seed(keys, seed, num_buckets, max_pilot) {
            debug!(keys = n, attempt, "perfect hash found");
            return Ok(mph);
        }
    }
    Err(TableError::PerfectHash(n))
}

fn try_seed(keys: &[&[u8]], seed: u64, num_buckets: usize, max_pilot: u32) -> Option<Mph> {
    let n = keys.len() as u64;
    let hashes: Vec<u64> = keys.iter().map(|k| xxh3_64_with_seed(k, seed)).collect();

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); num_buckets];
    for (i, &h) in hashes.iter().enumerate() {
        members[bucket_of(h, num_buckets as u64) as usize].push(i);
    }
    let mut order: Vec<usize> = (0..num_buckets).collect();
    order.sort_unstable_by(|a, b| members[*b].len().cmp(&members[*a].len()).then(a.cmp(b)));

    const FREE: usize = usize::MAX;
    let mut slots = vec![FREE; keys.len()];
    let mut pilots = vec![0u32; num_buckets];
    let mut candidate: Vec<u64> = Vec::with_capacity(KEYS_PER_BUCKET * 4);

    for b in order {
        let bucket = &members[b];
        if bucket.is_empty() {
            break;
        }
        let mut placed = false;
        for pilot in 0..max_pilot {
            candidate.clear();
            let mut ok = true;
            for &i in bucket {
                let s = slot_of(hashes[i], pilot, n);
                if slots[s as usize] != FREE || candidate.contains(&s) {
                    ok = false;
                    break;
                }
                candidate.push(s);
            }
            if ok {
                for (&i, &s) in bucket.iter().zip(&candidate) {
                    slots[s as usize] = i;
                }
                pilots[b] = pilot;
                placed = true;
                break;
            }
        }
        if !placed {
            return None;
        }
    }
    Some(Mph {
        seed,
        pilots,
        slots,
    })
}

/// Writes an MPH table for `records` (unique keys) to `path`.
pub fn build_mph_table(path: &Path, records: &[(&[u8], &Value)]) -> Result<()> {
    if records.len() > u32::MAX as usize {
        return Err(TableError::TooLarge(format!("{} records", records.len())));
    }
    let keys: Vec<&[u8]> = records.iter().map(|(k, _)| *k).collect();
    let mph = build_mph(&keys)?;

    let mut bloom = BloomFilter::with_default_rate(records.len());
    let mut max_expiry: Timestamp = 0;
    for (key, val) in records {
        bloom.add(key);
        if val.deleted || val.expires == 0 {
            max_expiry = Timestamp::MAX;
        } else {
            max_expiry = max_expiry.max(val.expires);
        }
    }
    let bloom_bytes = bloom.dump();

    // DATA, in slot order
    let mut data = Vec::new();
    let mut offsets = Vec::with_capacity(records.len());
    for &i in &mph.slots {
        let (key, val) = records[i];
        offsets.push(data.len() as u64);
        let enc = encode_value(val);
        put_uvarint(&mut data, key.len() as u64);
        data.extend_from_slice(key);
        put_uvarint(&mut data, enc.len() as u64);
        data.extend_from_slice(&enc);
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut w = BufWriter::new(file);

    w.write_u32::<LittleEndian>(MPH_MAGIC_HEADER)?;
    w.write_u8(CODEC)?;
    w.write_all(&[0u8; 3])?;
    w.write_u32::<LittleEndian>(records.len() as u32)?;
    w.write_u32::<LittleEndian>(mph.pilots.len() as u32)?;
    w.write_u64::<LittleEndian>(mph.seed)?;
    w.write_u64::<LittleEndian>(bloom_bytes.len() as u64)?;
    w.write_u64::<LittleEndian>(data.len() as u64)?;
    w.write_u32::<LittleEndian>(max_expiry)?;
    w.write_all(&[0u8; HEADER_SIZE - 44])?;

    w.write_all(&bloom_bytes)?;
    for p in &mph.pilots {
        w.write_u32::<LittleEndian>(*p)?;
    }
    for o in &offsets {
        w.write_u64::<LittleEndian>(*o)?;
    }
    w.write_all(&data)?;
    w.write_u32::<LittleEndian>(MPH_MAGIC_TAIL)?;
    w.flush()?;

    let file: File = w.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    debug!(path = %path.display(), records = records.len(), "built mph table");
    Ok(())
}

/// A read-only, memory-mapped MPH table.
pub struct MphTable {
    id: u64,
    name: String,
    path: PathBuf,
    mmap: Option<Mmap>,
    bloom: BloomFilter,
    num_records: u64,
    num_buckets: u64,
    seed: u64,
    max_expiry: Timestamp,
    pilots_start: usize,
    offsets_start: usize,
    data_start: usize,
    data_end: usize,
    size: u64,
    data_reads: AtomicU64,
}

impl MphTable {
    pub fn open(path: &Path, id: u64) -> Result<Self> {
        let name = file_name(path);
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if size < (HEADER_SIZE + TAIL_SIZE) as u64 {
            return Err(TableError::corrupt(&name, format!("file too small: {} bytes", size)));
        }
        // SAFETY: table files are immutable once renamed into place.
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let h = &mmap[..HEADER_SIZE];
        if LittleEndian::read_u32(&h[0..4]) != MPH_MAGIC_HEADER || h[4] != CODEC {
            return Err(TableError::corrupt(&name, "bad mph header"));
        }
        let num_records = LittleEndian::read_u32(&h[8..12]) as u64;
        let num_buckets = LittleEndian::read_u32(&h[12..16]) as u64;
        let seed = LittleEndian::read_u64(&h[16..24]);
        let bloom_len = LittleEndian::read_u64(&h[24..32]);
        let data_size = LittleEndian::read_u64(&h[32..40]);
        let max_expiry = LittleEndian::read_u32(&h[40..44]);
        if num_records > 0 && num_buckets == 0 {
            return Err(TableError::corrupt(&name, "records but no buckets"));
        }

        let expected = (HEADER_SIZE as u64 + TAIL_SIZE as u64)
            .saturating_add(bloom_len)
            .saturating_add(4 * num_buckets)
            .saturating_add(8 * num_records)
            .saturating_add(data_size);
        if expected != size {
            return Err(TableError::corrupt(
                &name,
                format!("size {} != expected {}", size, expected),
            ));
        }
        if LittleEndian::read_u32(&mmap[mmap.len() - TAIL_SIZE..]) != MPH_MAGIC_TAIL {
            return Err(TableError::corrupt(&name, "bad mph tail magic"));
        }

        let bloom_start = HEADER_SIZE;
        let pilots_start = bloom_start + bloom_len as usize;
        let offsets_start = pilots_start + 4 * num_buckets as usize;
        let data_start = offsets_start + 8 * num_records as usize;
        let data_end = data_start + data_size as usize;
        let bloom = BloomFilter::load(&mmap[bloom_start..pilots_start])
            .map_err(|e| TableError::corrupt(&name, format!("bloom filter: {}", e)))?;

        info!(file = %name, records = num_records, size, "opened mph table");
        Ok(Self {
            id,
            name,
            path: path.to_path_buf(),
            mmap: Some(mmap),
            bloom,
            num_records,
            num_buckets,
            seed,
            max_expiry,
            pilots_start,
            offsets_start,
            data_start,
            data_end,
            size,
            data_reads: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bytes(&self) -> Result<&[u8]> {
        self.mmap
            .as_deref()
            .ok_or_else(|| TableError::Closed(self.name.clone()))
    }

    /// Decodes the record at `offset` in the data segment.
    fn record_at<'a>(&self, data: &'a [u8], offset: usize) -> Result<(&'a [u8], Value, usize)> {
        let incomplete = || TableError::IncompleteFile(self.name.clone());
        let buf = data.get(offset..).ok_or_else(incomplete)?;
        let (klen, mut pos) = get_uvarint(buf).ok_or_else(incomplete)?;
        let key_end = pos.saturating_add(klen as usize);
        let key = buf.get(pos..key_end).ok_or_else(incomplete)?;
        pos = key_end;
        let (vlen, n) = get_uvarint(&buf[pos..]).ok_or_else(incomplete)?;
        pos += n;
        let enc_end = pos.saturating_add(vlen as usize);
        let enc = buf.get(pos..enc_end).ok_or_else(incomplete)?;
        pos = enc_end;
        let val = decode_value(enc).ok_or_else(|| TableError::corrupt(&self.name, "short value"))?;
        Ok((key, val, pos))
    }
}

impl TableReader for MphTable {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8], _hash: u64) -> Result<Option<Value>> {
        let bytes = self.bytes()?;
        if self.num_records == 0 || !self.bloom.has(key) {
            return Ok(None);
        }

        let h = xxh3_64_with_seed(key, self.seed);
        let b = bucket_of(h, self.num_buckets) as usize;
        let at = self.pilots_start + 4 * b;
        let pilot = LittleEndian::read_u32(&bytes[at..at + 4]);
        let slot = slot_of(h, pilot, self.num_records) as usize;
        let at = self.offsets_start + 8 * slot;
        let offset = LittleEndian::read_u64(&bytes[at..at + 8]) as usize;

        self.data_reads.fetch_add(1, Ordering::Relaxed);
        let (found, val, _) = self.record_at(&bytes[self.data_start..self.data_end], offset)?;
        if found == key {
            Ok(Some(val))
        } else {
            Ok(None)
        }
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        let bytes = self.bytes()?;
        let data = &bytes[self.data_start..self.data_end];
        let mut out = Vec::with_capacity(self.num_records as usize);
        let mut pos = 0;
        for _ in 0..self.num_records {
            let (key, val, len) = self.record_at(data, pos)?;
            out.push(Entry::new(key.to_vec(), val));
            pos += len;
        }
        Ok(out)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn num_records(&self) -> u64 {
        self.num_records
    }

    fn index_size(&self) -> u64 {
        (self.data_start - HEADER_SIZE) as u64
    }

    fn max_expiry(&self) -> Timestamp {
        self.max_expiry
    }

    fn data_reads(&self) -> u64 {
        self.data_reads.load(Ordering::Relaxed)
    }

    fn is_closed(&self) -> bool {
        self.mmap.is_none()
    }

    fn close(&mut self) -> Result<()> {
        if self.mmap.take().is_some() {
            info!(file = %self.name, "closed mph table");
        }
        Ok(())
    }
}

impl Drop for MphTable {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.mmap.is_none(), "mph table {} dropped without close", self.name);
        }
    }
}

impl std::fmt::Debug for MphTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MphTable")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("num_records", &self.num_records)
            .field("closed", &self.mmap.is_none())
            .finish()
    }
}
