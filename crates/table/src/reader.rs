use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;
use memmap2::{Mmap, MmapOptions};
use memtable::{Entry, Timestamp, Value};
use tracing::{info, warn};

use crate::codec::read_record;
use crate::error::{Result, TableError};
use crate::format::{
    bucket_of, fingerprint_of, get_offset40, read_header, Header, HEADER_SIZE,
    INLINE_FINGERPRINTS, INLINE_FINGERPRINTS_OVERFLOW, MAGIC_TAIL, SLOT_PREFIX,
    SLOT_PREFIX_OVERFLOW, SLOT_SIZE, TAIL_SIZE,
};
use crate::TableReader;

/// A read-only, memory-mapped custom hash table.
///
/// Absent keys usually cost one 64-byte index read; present keys add one
/// sequential scan of the bucket's records. The index is checksummed and
/// warmed on open.
pub struct HashTable {
    id: u64,
    name: String,
    path: PathBuf,
    header: Header,
    mmap: Option<Mmap>,
    data: Range<usize>,
    l1: Range<usize>,
    l2: Range<usize>,
    size: u64,
    data_reads: AtomicU64,
}

impl HashTable {
    /// Maps `path` and validates its header, size, tail magic and index
    /// checksum.
    ///
    /// # Errors
    ///
    /// [`TableError::Corrupt`] on any validation failure, or an I/O error.
    pub fn open(path: &Path, id: u64) -> Result<Self> {
        let name = file_name(path);
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if size < (HEADER_SIZE + TAIL_SIZE) as u64 {
            return Err(TableError::corrupt(&name, format!("file too small: {} bytes", size)));
        }

        // SAFETY: table files are immutable once renamed into place, and the
        // map is dropped before the file is removed.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let header = read_header(&name, &mmap[..HEADER_SIZE])?;

        if header.file_size() != size {
            return Err(TableError::corrupt(
                &name,
                format!("size {} != expected {}", size, header.file_size()),
            ));
        }
        let tail = LittleEndian::read_u32(&mmap[mmap.len() - TAIL_SIZE..]);
        if tail != MAGIC_TAIL {
            return Err(TableError::corrupt(&name, format!("tail magic {:#010x}", tail)));
        }
        if header.num_buckets == 0 || !header.num_buckets.is_power_of_two() {
            return Err(TableError::corrupt(
                &name,
                format!("bucket count {}", header.num_buckets),
            ));
        }

        let data_end = HEADER_SIZE + header.data_size as usize;
        let index_end = data_end + header.index_size as usize;
        let l1_end = data_end + header.num_buckets as usize * SLOT_SIZE;
        if l1_end > index_end {
            return Err(TableError::corrupt(&name, "index smaller than its L1 slots"));
        }

        let mut crc = Crc32::new();
        crc.update(&mmap[data_end..index_end]);
        if crc.finalize() != header.index_crc {
            return Err(TableError::corrupt(&name, "index checksum mismatch"));
        }

        advise(&mmap, &name, data_end, index_end);

        info!(
            file = %name,
            records = header.num_records,
            size,
            index_size = header.index_size,
            min_expiry = header.min_expiry,
            max_expiry = header.max_expiry,
            "opened hash table"
        );

        Ok(Self {
            id,
            name,
            path: path.to_path_buf(),
            header,
            mmap: Some(mmap),
            data: HEADER_SIZE..data_end,
            l1: data_end..l1_end,
            l2: l1_end..index_end,
            size,
            data_reads: AtomicU64::new(0),
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bytes(&self) -> Result<&[u8]> {
        self.mmap
            .as_deref()
            .ok_or_else(|| TableError::Closed(self.name.clone()))
    }

    /// Finds the first position and number of fingerprints equal to `fp` in
    /// the bucket's sorted fingerprint list.
    fn match_fingerprints(&self, bytes: &[u8], slot: &[u8], fp: u16) -> Result<Option<(usize, usize)>> {
        let count = slot[0] as usize;
        let (inline, overflow): (&[u8], &[u8]) = if count <= INLINE_FINGERPRINTS {
            (&slot[SLOT_PREFIX..SLOT_PREFIX + 2 * count], &[])
        } else {
            let off = LittleEndian::read_u32(&slot[SLOT_PREFIX..SLOT_PREFIX_OVERFLOW]) as usize;
            let rest = 2 * (count - INLINE_FINGERPRINTS_OVERFLOW);
            let l2 = &bytes[self.l2.clone()];
            let spill = l2
                .get(off..off + rest)
                .ok_or_else(|| TableError::corrupt(&self.name, "overflow index out of bounds"))?;
            (&slot[SLOT_PREFIX_OVERFLOW..], spill)
        };

        let mut first = None;
        let mut matches = 0;
        for (i, pair) in inline.chunks_exact(2).chain(overflow.chunks_exact(2)).enumerate() {
            let cur = u16::from_be_bytes([pair[0], pair[1]]);
            if cur > fp {
                break;
            }
            if cur == fp {
                first.get_or_insert(i);
                matches += 1;
            }
        }
        Ok(first.map(|f| (f, matches)))
    }
}

impl TableReader for HashTable {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8], hash: u64) -> Result<Option<Value>> {
        let bytes = self.bytes()?;
        let bucket = bucket_of(hash, self.header.shard_bits, self.header.num_buckets) as usize;
        let start = self.l1.start + bucket * SLOT_SIZE;
        let slot = &bytes[start..start + SLOT_SIZE];
        if slot[0] == 0 {
            return Ok(None);
        }

        let Some((first, matches)) = self.match_fingerprints(bytes, slot, fingerprint_of(hash))? else {
            return Ok(None);
        };

        self.data_reads.fetch_add(1, Ordering::Relaxed);
        let data = &bytes[self.data.clone()];
        let mut pos = get_offset40(slot) as usize;
        for i in 0..first + matches {
            let rec = data
                .get(pos..)
                .and_then(read_record)
                .ok_or_else(|| TableError::IncompleteFile(self.name.clone()))?;
            if i >= first && rec.key == key {
                let val = rec
                    .to_value(self.header.min_expiry)
                    .ok_or_else(|| TableError::corrupt(&self.name, "expiry out of range"))?;
                return Ok(Some(val));
            }
            pos += rec.len;
        }
        Ok(None)
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        let bytes = self.bytes()?;
        let data = &bytes[self.data.clone()];

        let mut crc = Crc32::new();
        crc.update(data);
        if crc.finalize() != self.header.data_crc {
            return Err(TableError::corrupt(&self.name, "data checksum mismatch"));
        }

        let mut out = Vec::with_capacity(self.header.num_records as usize);
        let mut pos = 0;
        for _ in 0..self.header.num_records {
            let rec = read_record(&data[pos..])
                .ok_or_else(|| TableError::IncompleteFile(self.name.clone()))?;
            let val = rec
                .to_value(self.header.min_expiry)
                .ok_or_else(|| TableError::corrupt(&self.name, "expiry out of range"))?;
            out.push(Entry::new(rec.key.to_vec(), val));
            pos += rec.len;
        }
        Ok(out)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn num_records(&self) -> u64 {
        self.header.num_records as u64
    }

    fn index_size(&self) -> u64 {
        self.header.index_size as u64
    }

    fn max_expiry(&self) -> Timestamp {
        self.header.max_expiry
    }

    fn data_reads(&self) -> u64 {
        self.data_reads.load(Ordering::Relaxed)
    }

    fn is_closed(&self) -> bool {
        self.mmap.is_none()
    }

    fn close(&mut self) -> Result<()> {
        if self.mmap.take().is_some() {
            info!(file = %self.name, "closed hash table");
        }
        Ok(())
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.mmap.is_none(), "hash table {} dropped without close", self.name);
        }
    }
}

impl std::fmt::Debug for HashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("header", &self.header)
            .field("closed", &self.mmap.is_none())
            .finish()
    }
}

/// Index pages are read on nearly every lookup; data pages at random.
#[cfg(unix)]
fn advise(mmap: &Mmap, name: &str, data_end: usize, index_end: usize) {
    use memmap2::Advice;

    if let Err(e) = mmap.advise(Advice::Random) {
        warn!(file = %name, error = %e, "madvise(random) failed");
    }
    if index_end > data_end {
        if let Err(e) = mmap.advise_range(Advice::WillNeed, data_end, index_end - data_end) {
            warn!(file = %name, error = %e, "madvise(willneed) failed");
        }
    }
}

#[cfg(not(unix))]
fn advise(_mmap: &Mmap, _name: &str, _data_end: usize, _index_end: usize) {}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
