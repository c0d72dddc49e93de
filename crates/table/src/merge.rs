//! Compaction helpers: picking which tables to merge, and merging them.
//!
//! Tables of a shard are always handled oldest first, matching the order in
//! which they are kept in memory.
use std::collections::HashMap;
use std::path::Path;

use config::TableType;
use memtable::{Timestamp, Value};
use tracing::{debug, info};

use crate::error::Result;
use crate::naming::temp_file_name;
use crate::{build_table, Table, TableReader};

/// Most tables merged by one compaction.
pub const MAX_COMPACT_BATCH: usize = 4;

/// Total size above which a window of tables is not merged (2 GiB).
pub const TABLE_SIZE_LIMIT: u64 = 2 << 30;

/// A run of consecutive tables chosen for compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPick {
    /// Index of the oldest table in the run.
    pub start: usize,
    /// Number of tables in the run (at least 2).
    pub len: usize,
    pub total_size: u64,
}

impl CompactionPick {
    /// The run starts at the oldest table of the shard, so nothing older
    /// can be shadowed by its tombstones.
    pub fn is_final(&self) -> bool {
        self.start == 0
    }
}

/// Chooses a window of 2..=[`MAX_COMPACT_BATCH`] consecutive tables whose
/// total size stays under [`TABLE_SIZE_LIMIT`]. Longer windows win, ties go
/// to the smaller total size, then to the older window.
///
/// `sizes` are table sizes ordered oldest first.
pub fn pick_tables_to_compact(sizes: &[u64]) -> Option<CompactionPick> {
    let mut best: Option<CompactionPick> = None;
    for start in 0..sizes.len() {
        let mut total = sizes[start];
        for len in 2..=MAX_COMPACT_BATCH {
            let Some(next) = sizes.get(start + len - 1) else {
                break;
            };
            total = total.saturating_add(*next);
            if total >= TABLE_SIZE_LIMIT {
                break;
            }
            let cand = CompactionPick {
                start,
                len,
                total_size: total,
            };
            let better = match best {
                None => true,
                Some(b) => len > b.len || (len == b.len && total < b.total_size),
            };
            if better {
                best = Some(cand);
            }
        }
    }
    best
}

/// Merges the entries of `tables` (oldest first). A later table's value for
/// a key replaces an earlier one. With `gc_final`, tombstones and values
/// expired at `now` are dropped from the result.
pub fn merge_tables(tables: &[&Table], gc_final: bool, now: Timestamp) -> Result<HashMap<Vec<u8>, Value>> {
    let capacity: u64 = tables.iter().map(|t| t.num_records()).sum();
    let mut merged: HashMap<Vec<u8>, Value> = HashMap::with_capacity(capacity as usize);
    for table in tables {
        // A fully expired table with nothing older beneath it cannot shadow
        // anything, so it is dropped unread.
        if gc_final && merged.is_empty() && fully_expired(table, now) {
            debug!(table = table.name(), "dropping fully expired table");
            continue;
        }
        for entry in table.entries()? {
            merged.insert(entry.key, entry.val);
        }
    }
    if gc_final {
        merged.retain(|_, v| v.is_live(now));
    }
    Ok(merged)
}

fn fully_expired(table: &Table, now: Timestamp) -> bool {
    let max = table.max_expiry();
    max != Timestamp::MAX && max <= now
}

/// Writes `merged` as a new temp table of `shard` in `dir` and returns its
/// file name. Called outside any table-list lock; the inputs were merged by
/// [`merge_tables`] beforehand.
pub fn write_merged_table(
    dir: &Path,
    shard: u64,
    shard_bits: u8,
    table_type: TableType,
    merged: &HashMap<Vec<u8>, Value>,
) -> Result<String> {
    let records: Vec<(&[u8], &Value)> = merged.iter().map(|(k, v)| (k.as_slice(), v)).collect();

    let name = temp_file_name(shard);
    build_table(table_type, &dir.join(&name), shard_bits, &records)?;

    info!(shard, records = records.len(), output = %name, "wrote compacted table");
    Ok(name)
}
