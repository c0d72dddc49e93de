//! # Memtable - Gravel's mutable write buffer
//!
//! The memtable is the only mutable structure in the engine. Committed
//! batches land here; once it would overflow, the engine persists it as one
//! immutable table per shard and clears it.
//!
//! This crate also owns the value model shared by every layer
//! ([`Value`], [`Entry`], [`Timestamp`]) and the key hashing that decides
//! which shard, bucket and fingerprint a key gets. Tables, the memtable and
//! the engine must all agree on [`hash`] and [`shard`], so both live here.
//!
//! ## Locking
//!
//! ```text
//! write_lock (RwLock<Counters>)   set_many / clear: write   flush: read
//!   shards[i] (RwLock<HashMap>)   get / flush: read         upsert / clear: write
//! ```
//!
//! Writers are serialized by the global lock; readers only ever touch the
//! lock of the shard owning their key.
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

/// Absolute Unix timestamp in seconds. `0` means "never expires".
pub type Timestamp = u32;

/// Current Unix time in seconds, saturating at `u32::MAX`.
pub fn now() -> Timestamp {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs.min(u32::MAX as u64) as Timestamp
}

/// A stored value, a tombstone, or a value with an expiry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Value {
    pub data: Vec<u8>,
    /// Absolute expiry in Unix seconds; `0` means never.
    pub expires: Timestamp,
    pub deleted: bool,
}

impl Value {
    /// A live value.
    pub fn new(data: Vec<u8>, expires: Timestamp) -> Self {
        Self {
            data,
            expires,
            deleted: false,
        }
    }

    /// A deletion marker. Carries neither data nor expiry.
    pub fn tombstone() -> Self {
        Self {
            data: Vec::new(),
            expires: 0,
            deleted: true,
        }
    }

    /// `true` once `now` has reached the expiry.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires > 0 && self.expires <= now
    }

    /// `true` if a reader should see this value at time `now`.
    pub fn is_live(&self, now: Timestamp) -> bool {
        !self.deleted && !self.is_expired(now)
    }
}

/// A single write: a key and the value (or tombstone) it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub val: Value,
}

impl Entry {
    pub fn new(key: Vec<u8>, val: Value) -> Self {
        Self { key, val }
    }
}

/// 64-bit xxh3 hash of `key`. Shard, bucket and fingerprint are all derived
/// from this one value.
#[inline]
pub fn hash(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// Shard owning `hash`. `num_shards` must be a power of two.
#[inline]
pub fn shard(hash: u64, num_shards: u64) -> u64 {
    hash & (num_shards - 1)
}

/// Number of low hash bits consumed by shard selection.
#[inline]
pub fn shard_bits(num_shards: u64) -> u8 {
    num_shards.trailing_zeros() as u8
}

/// Estimated serialized size of an entry, used for memtable and batch
/// accounting. It approximates, but does not equal, any table's footprint.
pub fn sizeof(key: &[u8], val: &Value) -> u64 {
    let mut sz = key.len() as u64 + 1;
    if !val.deleted {
        sz += val.data.len() as u64 + 4;
    }
    sz
}

/// Running totals guarded by the memtable's global write lock.
#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    size: u64,
    len: u64,
}

/// What a call to [`Memtable::set_many`] did, for the caller's metrics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SetManyOutcome {
    pub sets: u64,
    pub dels: u64,
    /// Memtable size after the call.
    pub size: u64,
    /// Memtable entry count after the call.
    pub len: u64,
}

/// Sharded in-memory map from key to [`Value`].
pub struct Memtable {
    num_shards: u64,
    write_lock: RwLock<Counters>,
    shards: Vec<RwLock<HashMap<Vec<u8>, Value>>>,
}

impl Memtable {
    /// Creates an empty memtable. `num_shards` must be a power of two.
    pub fn new(num_shards: u64) -> Self {
        debug_assert!(num_shards.is_power_of_two());
        let shards = (0..num_shards).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            num_shards,
            write_lock: RwLock::new(Counters::default()),
            shards,
        }
    }

    pub fn num_shards(&self) -> u64 {
        self.num_shards
    }

    /// Looks up `key`, whose [`hash`] the caller has already computed.
    /// Tombstones and expired values are returned as stored.
    pub fn get(&self, key: &[u8], hash: u64) -> Option<Value> {
        let shard = shard(hash, self.num_shards) as usize;
        self.shards[shard].read().get(key).cloned()
    }

    /// Upserts every entry, keeping `size`/`len` in step. Overwriting a key
    /// first subtracts the old entry's estimated size.
    pub fn set_many(&self, entries: Vec<Entry>) -> SetManyOutcome {
        let mut counters = self.write_lock.write();
        let mut outcome = SetManyOutcome::default();

        for Entry { key, val } in entries {
            let shard = shard(hash(&key), self.num_shards) as usize;
            let mut map = self.shards[shard].write();

            if val.deleted {
                outcome.dels += 1;
            } else {
                outcome.sets += 1;
            }

            let added = sizeof(&key, &val);
            let removed = map.get(&key).map(|old| sizeof(&key, old));
            map.insert(key, val);

            counters.size += added;
            match removed {
                Some(old_size) => counters.size = counters.size.saturating_sub(old_size),
                None => counters.len += 1,
            }
        }

        outcome.size = counters.size;
        outcome.len = counters.len;
        outcome
    }

    /// Estimated serialized size of everything in the memtable.
    pub fn size(&self) -> u64 {
        self.write_lock.read().size
    }

    /// Number of distinct keys (tombstones included).
    pub fn len(&self) -> u64 {
        self.write_lock.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands every shard's contents, in shard order, to `build` and collects
    /// what it returns.
    ///
    /// Runs under the global read lock: concurrent `get`s proceed, writers
    /// wait. The memtable is **not** cleared; call [`clear`](Memtable::clear)
    /// once the built tables are durably registered.
    pub fn flush<T, E, F>(&self, mut build: F) -> Result<Vec<T>, E>
    where
        F: FnMut(u64, &HashMap<Vec<u8>, Value>) -> Result<T, E>,
    {
        let _guard = self.write_lock.read();
        let mut out = Vec::with_capacity(self.shards.len());
        for (idx, shard) in self.shards.iter().enumerate() {
            let map = shard.read();
            out.push(build(idx as u64, &map)?);
        }
        Ok(out)
    }

    /// Removes every entry in place, keeping the maps' allocations.
    pub fn clear(&self) {
        let mut counters = self.write_lock.write();
        for shard in &self.shards {
            shard.write().clear();
        }
        *counters = Counters::default();
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counters = *self.write_lock.read();
        f.debug_struct("Memtable")
            .field("num_shards", &self.num_shards)
            .field("size", &counters.size)
            .field("len", &counters.len)
            .finish()
    }
}

#[cfg(test)]
mod tests;
