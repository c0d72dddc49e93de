//! # Bloom - key filter for the MPH table
//!
//! A perfect hash maps *every* key, present or not, to some slot, so an MPH
//! table without a filter would pay a data read on each negative lookup.
//! The table builder adds every key here, stores [`BloomFilter::dump`] in
//! the file, and the reader restores it with [`BloomFilter::load`] straight
//! from the mapped bytes.
//!
//! No false negatives; false positives at roughly the configured rate.
//!
//! ```rust,no_run
//! use bloom::BloomFilter;
//!
//! let mut bf = BloomFilter::with_default_rate(1000);
//! bf.add(b"hello");
//! assert!(bf.has(b"hello"));
//! ```
//!
//! ## Serialized form
//!
//! ```text
//! [num_bits u64][num_hashes u32][num_words u32][words: num_words x u64]   all LE
//! ```
use std::f64::consts::LN_2;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Target false positive rate of filters built by the tables.
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.001;

/// Largest filter [`BloomFilter::read_from`] accepts, in 64-bit words (128 MiB).
const MAX_WORDS: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 16;

const SEED_1: u64 = 0x9e37_79b9_7f4a_7c15;
const SEED_2: u64 = 0xc2b2_ae3d_27d4_eb4f;

/// Bit set probed at `num_hashes` positions per key, derived by double
/// hashing two seeded xxh3 values.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// A filter sized for `expected_items` at `false_positive_rate`.
    ///
    /// # Panics
    ///
    /// If `expected_items` is 0 or `false_positive_rate` is outside `(0, 1)`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        assert!(expected_items > 0, "expected_items must be > 0");
        assert!(
            false_positive_rate > 0.0 && false_positive_rate < 1.0,
            "false_positive_rate must be in (0, 1)"
        );

        let n = expected_items as f64;
        // m = -n ln(p) / ln(2)^2, k = (m / n) ln(2)
        let num_bits = ((-n * false_positive_rate.ln()) / (LN_2 * LN_2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * LN_2).ceil().max(1.0) as u32;

        Self {
            words: vec![0; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes,
        }
    }

    /// A filter for `expected_items` (at least one) at
    /// [`DEFAULT_FALSE_POSITIVE_RATE`].
    pub fn with_default_rate(expected_items: usize) -> Self {
        Self::new(expected_items.max(1), DEFAULT_FALSE_POSITIVE_RATE)
    }

    pub fn add(&mut self, key: &[u8]) {
        for bit in probes(key, self.num_hashes, self.num_bits) {
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// `false` means `key` was never added; `true` means it probably was.
    #[must_use]
    pub fn has(&self, key: &[u8]) -> bool {
        probes(key, self.num_hashes, self.num_bits)
            .all(|bit| self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Length of [`dump`](BloomFilter::dump)'s output.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        HEADER_LEN + 8 * self.words.len()
    }

    #[must_use]
    pub fn dump(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        // A Vec never refuses a write.
        let _ = self.write_to(&mut buf);
        buf
    }

    /// Restores a filter from the front of `buf`; anything after it is
    /// ignored, so callers can pass the rest of a mapped file.
    pub fn load(mut buf: &[u8]) -> io::Result<Self> {
        Self::read_from(&mut buf)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.num_bits)?;
        w.write_u32::<LittleEndian>(self.num_hashes)?;
        w.write_u32::<LittleEndian>(self.words.len() as u32)?;
        for word in &self.words {
            w.write_u64::<LittleEndian>(*word)?;
        }
        Ok(())
    }

    /// Reads one filter, consuming exactly its serialized bytes.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let num_bits = r.read_u64::<LittleEndian>()?;
        let num_hashes = r.read_u32::<LittleEndian>()?;
        let num_words = r.read_u32::<LittleEndian>()? as usize;

        if num_words > MAX_WORDS {
            return Err(invalid(format!("bloom filter too large: {} words", num_words)));
        }
        if num_bits == 0 || num_bits > num_words as u64 * 64 {
            return Err(invalid(format!(
                "bloom filter claims {} bits in {} words",
                num_bits, num_words
            )));
        }
        if num_hashes == 0 {
            return Err(invalid("bloom filter has no hash functions".to_string()));
        }

        let mut words = vec![0u64; num_words];
        r.read_u64_into::<LittleEndian>(&mut words)?;
        Ok(Self {
            words,
            num_bits,
            num_hashes,
        })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .field("bits_set", &set)
            .finish()
    }
}

/// Bit positions of `key`: `(h1 + i * h2) mod num_bits` for `i < k`.
fn probes(key: &[u8], k: u32, num_bits: u64) -> impl Iterator<Item = u64> {
    let h1 = xxh3_64_with_seed(key, SEED_1);
    // odd, so consecutive probes never collapse onto a short cycle
    let h2 = xxh3_64_with_seed(key, SEED_2) | 1;
    (0..k as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
