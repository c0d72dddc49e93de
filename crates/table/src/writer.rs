use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use memtable::{Timestamp, Value};
use tracing::debug;

use crate::codec::put_record;
use crate::error::{Result, TableError};
use crate::format::{
    bucket_of, fingerprint_of, put_offset40, write_header, Header, CODEC_XXH3, HEADER_SIZE,
    INLINE_FINGERPRINTS, INLINE_FINGERPRINTS_OVERFLOW, MAGIC_TAIL, MAX_BUCKET_RECORDS,
    MAX_DATA_OFFSET, SLOT_PREFIX, SLOT_PREFIX_OVERFLOW, SLOT_SIZE, TARGET_RECORDS_PER_BUCKET,
};

/// Largest bucket count the builder will try before giving up.
const MAX_BUCKETS: usize = 1 << 28;

/// A record placed in its bucket, borrowed from the caller's data.
struct Placed<'a> {
    bucket: u32,
    fp: u16,
    key: &'a [u8],
    val: &'a Value,
}

/// Start and record count of one bucket in the data segment.
#[derive(Debug, Default, Clone, Copy)]
struct BucketSpan {
    data_start: u64,
    first: usize,
    count: usize,
}

/// Writes the custom hash table for `records` to `path`.
///
/// Records are sorted by `(bucket, fingerprint)` so each bucket's data is
/// contiguous and its fingerprints come out sorted. Keys must be unique.
/// The file is fsynced before returning.
///
/// # Errors
///
/// [`TableError::BucketOverflow`] if no bucket count keeps every bucket at
/// or below 255 records, [`TableError::TooLarge`] if an offset or size
/// exceeds its field, or any I/O error.
pub fn build_hash_table(path: &Path, shard_bits: u8, records: &[(&[u8], &Value)]) -> Result<Header> {
    if records.len() > u32::MAX as usize {
        return Err(TableError::TooLarge(format!("{} records", records.len())));
    }

    let (num_buckets, placed) = place_records(shard_bits, records)?;
    let (min_expiry, max_expiry) = expiry_range(records);

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut w = BufWriter::with_capacity(1 << 20, file);
    w.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

    // DATA
    let mut spans = vec![BucketSpan::default(); num_buckets];
    let mut data_crc = Crc32::new();
    let mut data_size: u64 = 0;
    let mut buf = Vec::with_capacity(4096);
    for (i, rec) in placed.iter().enumerate() {
        let span = &mut spans[rec.bucket as usize];
        if span.count == 0 {
            if data_size >= MAX_DATA_OFFSET {
                return Err(TableError::TooLarge(format!("data offset {}", data_size)));
            }
            span.data_start = data_size;
            span.first = i;
        }
        span.count += 1;

        buf.clear();
        put_record(&mut buf, rec.key, rec.val, min_expiry);
        data_crc.update(&buf);
        w.write_all(&buf)?;
        data_size += buf.len() as u64;
    }
    let pad = (SLOT_SIZE as u64 - data_size % SLOT_SIZE as u64) % SLOT_SIZE as u64;
    let padding = vec![0u8; pad as usize];
    data_crc.update(&padding);
    w.write_all(&padding)?;
    data_size += pad;

    // INDEX
    let index = encode_index(&spans, &placed)?;
    let index_size = u32::try_from(index.len())
        .map_err(|_| TableError::TooLarge(format!("index of {} bytes", index.len())))?;
    let mut index_crc = Crc32::new();
    index_crc.update(&index);
    w.write_all(&index)?;
    w.write_u32::<LittleEndian>(MAGIC_TAIL)?;

    let header = Header {
        codec: CODEC_XXH3,
        encrypted: false,
        compression: 0,
        shard_bits,
        num_records: records.len() as u32,
        num_buckets: num_buckets as u32,
        data_size,
        index_size,
        min_expiry,
        max_expiry,
        index_crc: index_crc.finalize(),
        data_crc: data_crc.finalize(),
    };
    w.seek(SeekFrom::Start(0))?;
    write_header(&mut w, &header)?;
    w.flush()?;

    let file: File = w.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    debug!(
        path = %path.display(),
        records = header.num_records,
        buckets = header.num_buckets,
        data_size = header.data_size,
        index_size = header.index_size,
        "built hash table"
    );
    Ok(header)
}

/// Picks a power-of-two bucket count near `n / 8` and sorts the records by
/// `(bucket, fingerprint, key)`. Doubles the bucket count while any bucket
/// holds more than [`MAX_BUCKET_RECORDS`].
fn place_records<'a>(
    shard_bits: u8,
    records: &[(&'a [u8], &'a Value)],
) -> Result<(usize, Vec<Placed<'a>>)> {
    let hashes: Vec<u64> = records.iter().map(|(k, _)| memtable::hash(k)).collect();
    let mut num_buckets = (records.len() / TARGET_RECORDS_PER_BUCKET)
        .max(1)
        .next_power_of_two();

    loop {
        let mut counts = vec![0usize; num_buckets];
        let mut worst = 0;
        for &h in &hashes {
            let b = bucket_of(h, shard_bits, num_buckets as u32) as usize;
            counts[b] += 1;
            worst = worst.max(counts[b]);
        }
        if worst <= MAX_BUCKET_RECORDS {
            break;
        }
        if num_buckets >= MAX_BUCKETS {
            return Err(TableError::BucketOverflow(worst));
        }
        debug!(num_buckets, worst, "bucket overflow, doubling bucket count");
        num_buckets *= 2;
    }

    let mut placed: Vec<Placed<'a>> = records
        .iter()
        .zip(&hashes)
        .map(|(&(key, val), &h)| Placed {
            bucket: bucket_of(h, shard_bits, num_buckets as u32),
            fp: fingerprint_of(h),
            key,
            val,
        })
        .collect();
    placed.sort_unstable_by(|a, b| (a.bucket, a.fp, a.key).cmp(&(b.bucket, b.fp, b.key)));
    Ok((num_buckets, placed))
}

/// `(min, max)` expiry for the header. `min` only looks at expiring values
/// and is 0 if there are none; `max` is `u32::MAX` as soon as one record
/// never expires.
fn expiry_range(records: &[(&[u8], &Value)]) -> (Timestamp, Timestamp) {
    let mut min = Timestamp::MAX;
    let mut max: Timestamp = 0;
    let mut has_expiring = false;
    for (_, v) in records {
        if v.deleted || v.expires == 0 {
            max = Timestamp::MAX;
            continue;
        }
        has_expiring = true;
        min = min.min(v.expires);
        max = max.max(v.expires);
    }
    if !has_expiring {
        min = 0;
    }
    (min, max)
}

/// Encodes the L1 slots followed by the L2 overflow area.
fn encode_index(spans: &[BucketSpan], placed: &[Placed<'_>]) -> Result<Vec<u8>> {
    let mut l1 = vec![0u8; spans.len() * SLOT_SIZE];
    let mut l2: Vec<u8> = Vec::new();

    for (b, span) in spans.iter().enumerate() {
        if span.count == 0 {
            continue;
        }
        let slot = &mut l1[b * SLOT_SIZE..(b + 1) * SLOT_SIZE];
        slot[0] = span.count as u8;
        put_offset40(slot, span.data_start);

        let fps = placed[span.first..span.first + span.count].iter().map(|r| r.fp);
        if span.count <= INLINE_FINGERPRINTS {
            for (i, fp) in fps.enumerate() {
                let at = SLOT_PREFIX + 2 * i;
                slot[at..at + 2].copy_from_slice(&fp.to_be_bytes());
            }
            continue;
        }

        let l2_offset = u32::try_from(l2.len())
            .map_err(|_| TableError::TooLarge("overflow index".to_string()))?;
        slot[SLOT_PREFIX..SLOT_PREFIX_OVERFLOW].copy_from_slice(&l2_offset.to_le_bytes());
        for (i, fp) in fps.enumerate() {
            if i < INLINE_FINGERPRINTS_OVERFLOW {
                let at = SLOT_PREFIX_OVERFLOW + 2 * i;
                slot[at..at + 2].copy_from_slice(&fp.to_be_bytes());
            } else {
                l2.extend_from_slice(&fp.to_be_bytes());
            }
        }
    }

    l1.extend_from_slice(&l2);
    Ok(l1)
}
