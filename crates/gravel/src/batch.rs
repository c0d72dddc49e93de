use memtable::{sizeof, Entry, Timestamp, Value};

use crate::error::{GravelError, Result};
use crate::Gravel;

/// A single-use group of writes that becomes visible all at once.
///
/// Build it with [`set`](Batch::set) and [`del`](Batch::del), then either
/// [`commit`](Batch::commit) or [`discard`](Batch::discard) it. After either
/// call the batch is sealed and every further call fails with
/// [`GravelError::SealedBatch`].
///
/// Within a batch, a later write to a key replaces an earlier one.
#[derive(Debug)]
pub struct Batch<'a> {
    db: &'a Gravel,
    entries: Vec<Entry>,
    size: u64,
    sealed: bool,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(db: &'a Gravel) -> Self {
        Self {
            db,
            entries: Vec::new(),
            size: 0,
            sealed: false,
        }
    }

    /// Stores `value` under `key`. `expires` is an absolute Unix time in
    /// seconds, `0` for never.
    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, expires: Timestamp) -> Result<()> {
        self.push(key.into(), Value::new(value.into(), expires))
    }

    /// Deletes `key`.
    pub fn del(&mut self, key: impl Into<Vec<u8>>) -> Result<()> {
        self.push(key.into(), Value::tombstone())
    }

    fn push(&mut self, key: Vec<u8>, val: Value) -> Result<()> {
        if self.sealed {
            return Err(GravelError::SealedBatch);
        }
        self.size += sizeof(&key, &val);
        self.entries.push(Entry::new(key, val));
        Ok(())
    }

    /// Number of writes queued.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Estimated size the batch adds to the memtable.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Applies every write atomically. The batch is sealed whether or not
    /// the commit succeeds.
    ///
    /// # Errors
    ///
    /// [`GravelError::SealedBatch`] if the batch was already committed or
    /// discarded, [`GravelError::BatchTooLarge`] if it exceeds the engine's
    /// max table size (nothing is applied), or an error from flushing the
    /// memtable to make room.
    pub fn commit(&mut self) -> Result<()> {
        if self.sealed {
            return Err(GravelError::SealedBatch);
        }
        self.sealed = true;
        let entries = std::mem::take(&mut self.entries);
        self.db.commit_entries(entries, self.size)
    }

    /// Drops the queued writes and seals the batch. Idempotent.
    pub fn discard(&mut self) {
        self.sealed = true;
        self.entries = Vec::new();
    }
}
