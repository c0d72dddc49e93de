//! B-tree table backed by an embedded `redb` database.
//!
//! One database file per table. The `tree` table maps the raw key to
//! [`encode_value`]; the `meta` table records the record count and the
//! table's max expiry so opening does not need a scan.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memtable::{Entry, Timestamp, Value};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

use crate::codec::{decode_value, encode_value};
use crate::error::{redb_err, Result, TableError};
use crate::reader::file_name;
use crate::TableReader;

const TREE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("tree");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const META_RECORDS: &str = "records";
const META_MAX_EXPIRY: &str = "max_expiry";

/// Writes `records` into a fresh redb database at `path`.
pub fn build_btree_table(path: &Path, records: &[(&[u8], &Value)]) -> Result<()> {
    let db = Database::create(path).map_err(redb_err)?;
    let mut max_expiry: Timestamp = 0;

    let txn = db.begin_write().map_err(redb_err)?;
    {
        let mut tree = txn.open_table(TREE).map_err(redb_err)?;
        for (key, val) in records {
            if val.deleted || val.expires == 0 {
                max_expiry = Timestamp::MAX;
            } else {
                max_expiry = max_expiry.max(val.expires);
            }
            tree.insert(*key, encode_value(val).as_slice())
                .map_err(redb_err)?;
        }
        let mut meta = txn.open_table(META).map_err(redb_err)?;
        meta.insert(META_RECORDS, records.len() as u64)
            .map_err(redb_err)?;
        meta.insert(META_MAX_EXPIRY, max_expiry as u64)
            .map_err(redb_err)?;
    }
    txn.commit().map_err(redb_err)?;

    debug!(path = %path.display(), records = records.len(), "built btree table");
    Ok(())
}

/// A read-only B-tree table.
pub struct BTreeTable {
    id: u64,
    name: String,
    path: PathBuf,
    db: Option<Database>,
    num_records: u64,
    max_expiry: Timestamp,
    size: u64,
    data_reads: AtomicU64,
}

impl BTreeTable {
    pub fn open(path: &Path, id: u64) -> Result<Self> {
        let name = file_name(path);
        let size = std::fs::metadata(path)?.len();
        let db = Database::open(path).map_err(redb_err)?;

        let (num_records, max_expiry) = {
            let txn = db.begin_read().map_err(redb_err)?;
            let meta = txn.open_table(META).map_err(redb_err)?;
            let read = |k: &str| -> Result<u64> {
                meta.get(k)
                    .map_err(redb_err)?
                    .map(|g| g.value())
                    .ok_or_else(|| TableError::corrupt(&name, format!("missing meta key {}", k)))
            };
            (read(META_RECORDS)?, read(META_MAX_EXPIRY)? as Timestamp)
        };

        info!(file = %name, records = num_records, size, "opened btree table");
        Ok(Self {
            id,
            name,
            path: path.to_path_buf(),
            db: Some(db),
            num_records,
            max_expiry,
            size,
            data_reads: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn db(&self) -> Result<&Database> {
        self.db
            .as_ref()
            .ok_or_else(|| TableError::Closed(self.name.clone()))
    }
}

impl TableReader for BTreeTable {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8], _hash: u64) -> Result<Option<Value>> {
        let txn = self.db()?.begin_read().map_err(redb_err)?;
        let tree = txn.open_table(TREE).map_err(redb_err)?;
        self.data_reads.fetch_add(1, Ordering::Relaxed);
        match tree.get(key).map_err(redb_err)? {
            Some(guard) => decode_value(guard.value())
                .map(Some)
                .ok_or_else(|| TableError::corrupt(&self.name, "short value")),
            None => Ok(None),
        }
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        let txn = self.db()?.begin_read().map_err(redb_err)?;
        let tree = txn.open_table(TREE).map_err(redb_err)?;
        let mut out = Vec::with_capacity(self.num_records as usize);
        for item in tree.iter().map_err(redb_err)? {
            let (k, v) = item.map_err(redb_err)?;
            let val = decode_value(v.value())
                .ok_or_else(|| TableError::corrupt(&self.name, "short value"))?;
            out.push(Entry::new(k.value().to_vec(), val));
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
        0
    }

    fn max_expiry(&self) -> Timestamp {
        self.max_expiry
    }

    fn data_reads(&self) -> u64 {
        self.data_reads.load(Ordering::Relaxed)
    }

    fn is_closed(&self) -> bool {
        self.db.is_none()
    }

    fn close(&mut self) -> Result<()> {
        if self.db.take().is_some() {
            info!(file = %self.name, "closed btree table");
        }
        Ok(())
    }
}

impl Drop for BTreeTable {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.db.is_none(), "btree table {} dropped without close", self.name);
        }
    }
}

impl std::fmt::Debug for BTreeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeTable")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("num_records", &self.num_records)
            .field("closed", &self.db.is_none())
            .finish()
    }
}
