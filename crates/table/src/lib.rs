//! # Table - Gravel's immutable on-disk tables
//!
//! A table is written once, from a memtable shard or by compaction, and is
//! then only ever read until compaction retires it. Three formats sit behind
//! one [`Table`] enum:
//!
//! | variant            | module    | lookup                                       |
//! |--------------------|-----------|----------------------------------------------|
//! | [`Table::Hash`]    | [`reader`]| 64-byte bucket slot, fingerprints, one scan |
//! | [`Table::BTree`]   | [`btree`] | embedded redb B-tree                         |
//! | [`Table::Mph`]     | [`mph`]   | bloom filter, perfect hash, one record read  |
//!
//! The hash table is the default and the one with a fixed binary contract;
//! see [`format`] for its layout.
//!
//! ## Lifecycle
//!
//! ```text
//! build_table(tmp path)  ->  manifest renames to <shard>_<id>.grvl  ->  open_table
//!     -> get / entries ... ->  close  ->  drop
//! ```
//!
//! Dropping a table that was not closed is a logic error and trips a debug
//! assertion.
pub mod btree;
pub mod codec;
mod error;
pub mod format;
pub mod merge;
pub mod mph;
pub mod naming;
pub mod reader;
mod writer;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use config::TableType;
use memtable::{Entry, Memtable, Timestamp, Value};
use tracing::info;

pub use btree::BTreeTable;
pub use error::{Result, TableError};
pub use merge::{merge_tables, pick_tables_to_compact, write_merged_table, CompactionPick};
pub use mph::MphTable;
pub use reader::HashTable;
pub use writer::build_hash_table;

/// Read side shared by every table format.
pub trait TableReader {
    /// Recency rank of the table within its shard, from the file name.
    fn id(&self) -> u64;

    /// File name, relative to the engine directory.
    fn name(&self) -> &str;

    /// Point lookup. `hash` is [`memtable::hash`] of `key`. Tombstones and
    /// expired values are returned as stored; `Ok(None)` means the key is not
    /// in this table.
    fn get(&self, key: &[u8], hash: u64) -> Result<Option<Value>>;

    /// Every record in the table, in storage order.
    fn entries(&self) -> Result<Vec<Entry>>;

    /// File size in bytes.
    fn size(&self) -> u64;

    fn num_records(&self) -> u64;

    fn index_size(&self) -> u64;

    /// Latest expiry of any record; `u32::MAX` if some record never expires.
    fn max_expiry(&self) -> Timestamp;

    /// Lookups that had to touch the data segment.
    fn data_reads(&self) -> u64;

    fn is_closed(&self) -> bool;

    /// Releases the mapping or database handle. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// An open table of any format.
#[derive(Debug)]
pub enum Table {
    Hash(HashTable),
    BTree(BTreeTable),
    Mph(MphTable),
}

impl Table {
    fn inner(&self) -> &dyn TableReader {
        match self {
            Table::Hash(t) => t,
            Table::BTree(t) => t,
            Table::Mph(t) => t,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn TableReader {
        match self {
            Table::Hash(t) => t,
            Table::BTree(t) => t,
            Table::Mph(t) => t,
        }
    }

    pub fn table_type(&self) -> TableType {
        match self {
            Table::Hash(_) => TableType::HashTable,
            Table::BTree(_) => TableType::BTree,
            Table::Mph(_) => TableType::MinPerfectHash,
        }
    }
}

impl TableReader for Table {
    fn id(&self) -> u64 {
        self.inner().id()
    }

    fn name(&self) -> &str {
        self.inner().name()
    }

    fn get(&self, key: &[u8], hash: u64) -> Result<Option<Value>> {
        self.inner().get(key, hash)
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        self.inner().entries()
    }

    fn size(&self) -> u64 {
        self.inner().size()
    }

    fn num_records(&self) -> u64 {
        self.inner().num_records()
    }

    fn index_size(&self) -> u64 {
        self.inner().index_size()
    }

    fn max_expiry(&self) -> Timestamp {
        self.inner().max_expiry()
    }

    fn data_reads(&self) -> u64 {
        self.inner().data_reads()
    }

    fn is_closed(&self) -> bool {
        self.inner().is_closed()
    }

    fn close(&mut self) -> Result<()> {
        self.inner_mut().close()
    }
}

/// Writes a table of `table_type` holding `records` (unique keys) to `path`.
pub fn build_table(
    table_type: TableType,
    path: &Path,
    shard_bits: u8,
    records: &[(&[u8], &Value)],
) -> Result<()> {
    match table_type {
        TableType::HashTable => build_hash_table(path, shard_bits, records).map(|_| ()),
        TableType::BTree => btree::build_btree_table(path, records),
        TableType::MinPerfectHash => mph::build_mph_table(path, records),
    }
}

/// Sniffs the format of an existing table file from its first bytes.
/// Anything that is neither a hash nor an MPH table is taken as a B-tree.
pub fn detect_table_type(path: &Path) -> Result<TableType> {
    let mut magic = [0u8; 4];
    let mut f = File::open(path)?;
    f.read_exact(&mut magic)?;
    Ok(match LittleEndian::read_u32(&magic) {
        format::MAGIC_HEADER => TableType::HashTable,
        mph::MPH_MAGIC_HEADER => TableType::MinPerfectHash,
        _ => TableType::BTree,
    })
}

/// Opens a live table file named `<shard>_<id>.grvl`, picking the reader
/// from the file's contents.
pub fn open_table(path: &Path) -> Result<Table> {
    let name = reader::file_name(path);
    let (_shard, id) = naming::parse_table_file_name(&name)?;
    Ok(match detect_table_type(path)? {
        TableType::HashTable => Table::Hash(HashTable::open(path, id)?),
        TableType::BTree => Table::BTree(BTreeTable::open(path, id)?),
        TableType::MinPerfectHash => Table::Mph(MphTable::open(path, id)?),
    })
}

/// Persists every non-empty shard of `mt` as a temp table in `dir`.
///
/// Returns one entry per shard, in shard order: the temp file name, or
/// `None` for a shard with no entries. The memtable is left untouched.
pub fn build_memtable_tables(dir: &Path, table_type: TableType, mt: &Memtable) -> Result<Vec<Option<String>>> {
    fs::create_dir_all(dir)?;
    let shard_bits = memtable::shard_bits(mt.num_shards());
    mt.flush(|shard, map: &HashMap<Vec<u8>, Value>| -> Result<Option<String>> {
        if map.is_empty() {
            return Ok(None);
        }
        let records: Vec<(&[u8], &Value)> = map.iter().map(|(k, v)| (k.as_slice(), v)).collect();
        let name = naming::temp_file_name(shard);
        build_table(table_type, &dir.join(&name), shard_bits, &records)?;
        info!(shard, records = records.len(), file = %name, "flushed memtable shard");
        Ok(Some(name))
    })
}

#[cfg(test)]
mod tests;
