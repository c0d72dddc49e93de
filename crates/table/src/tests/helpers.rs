use std::fs;
use std::path::Path;

use anyhow::Result;
use config::TableType;
use memtable::Value;

use crate::naming::table_file_name;
use crate::*;

/// Builds a table named `<shard>_<id>.grvl` in `dir` and opens it.
pub fn build_and_open(
    dir: &Path,
    table_type: TableType,
    shard: u64,
    id: u64,
    records: &[(Vec<u8>, Value)],
) -> Result<Table> {
    let path = dir.join(table_file_name(shard, id));
    let refs: Vec<(&[u8], &Value)> = records.iter().map(|(k, v)| (k.as_slice(), v)).collect();
    build_table(table_type, &path, 0, &refs)?;
    Ok(open_table(&path)?)
}

/// `n` distinct keys `key-00000`, `key-00001`, ... each mapped to `val-<i>`.
pub fn sample_records(n: usize) -> Vec<(Vec<u8>, Value)> {
    (0..n)
        .map(|i| {
            (
                format!("key-{:05}", i).into_bytes(),
                Value::new(format!("val-{}", i).into_bytes(), 0),
            )
        })
        .collect()
}

pub fn lookup(table: &Table, key: &[u8]) -> crate::Result<Option<Value>> {
    table.get(key, memtable::hash(key))
}

pub fn count_files_with_ext(dir: &Path, ext: &str) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(ext))
        .count()
}
