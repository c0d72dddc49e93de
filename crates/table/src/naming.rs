//! Table file names.
//!
//! ```text
//! <shard>_<id>.grvl                  live table, listed in the manifest
//! <shard>_<micros>x<n>.grvl.temp     freshly built, not yet accepted
//! ```
//!
//! IDs grow with recency within a shard; a table's ID is only ever read
//! back from its name.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, TableError};

/// Extension of live table files.
pub const TABLE_EXT: &str = ".grvl";

/// Extension of table files that are built but not yet in the manifest.
pub const TEMP_EXT: &str = ".grvl.temp";

/// Distinguishes temp files built within the same microsecond.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Name of a live table file.
pub fn table_file_name(shard: u64, id: u64) -> String {
    format!("{}_{}{}", shard, id, TABLE_EXT)
}

/// A fresh, unique temp file name for a table of `shard`.
pub fn temp_file_name(shard: u64) -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}x{}{}", shard, micros, n, TEMP_EXT)
}

/// Parses `<shard>_<id>.grvl` into `(shard, id)`.
pub fn parse_table_file_name(name: &str) -> Result<(u64, u64)> {
    let invalid = || TableError::InvalidFileName(name.to_string());
    let stem = name.strip_suffix(TABLE_EXT).ok_or_else(invalid)?;
    let (shard, id) = stem.split_once('_').ok_or_else(invalid)?;
    let shard = shard.parse::<u64>().map_err(|_| invalid())?;
    let id = id.parse::<u64>().map_err(|_| invalid())?;
    Ok((shard, id))
}

/// Shard encoded in a temp file name.
pub fn parse_temp_file_name(name: &str) -> Result<u64> {
    let invalid = || TableError::InvalidFileName(name.to_string());
    let stem = name.strip_suffix(TEMP_EXT).ok_or_else(invalid)?;
    let (shard, rest) = stem.split_once('_').ok_or_else(invalid)?;
    if rest.is_empty() {
        return Err(invalid());
    }
    shard.parse::<u64>().map_err(|_| invalid())
}

pub fn is_table_file(name: &str) -> bool {
    name.ends_with(TABLE_EXT)
}

pub fn is_temp_file(name: &str) -> bool {
    name.ends_with(TEMP_EXT)
}
