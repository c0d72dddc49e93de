use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use memtable::Value;
use table::naming::temp_file_name;

use crate::*;

/// Options for a test engine in `dir`: one shard, no background
/// compaction, no periodic flush within a test's lifetime.
pub fn test_opts(dir: &Path) -> Options {
    Options::new(dir)
        .with_compaction_workers(0)
        .with_periodic_flush_interval(Duration::from_secs(3600))
}

pub fn manager_opts(dir: &Path, num_shards: u64) -> ManagerOptions {
    ManagerOptions {
        dir: dir.to_path_buf(),
        table_type: TableType::HashTable,
        num_shards,
        workers: 0,
        poll_interval: Duration::from_secs(3600),
    }
}

pub fn live(v: &str) -> Value {
    Value::new(v.as_bytes().to_vec(), 0)
}

/// Builds a hash table for `shard` under a fresh temp name in `dir`.
pub fn write_temp(dir: &Path, shard: u64, num_shards: u64, records: &[(&str, Value)]) -> Result<String> {
    let name = temp_file_name(shard);
    let refs: Vec<(&[u8], &Value)> = records.iter().map(|(k, v)| (k.as_bytes(), v)).collect();
    table::build_table(
        TableType::HashTable,
        &dir.join(&name),
        memtable::shard_bits(num_shards),
        &refs,
    )?;
    Ok(name)
}

/// An empty file under a fresh temp name; enough for manifest tests,
/// which only rename files.
pub fn touch_temp(dir: &Path, shard: u64) -> Result<String> {
    let name = temp_file_name(shard);
    fs::write(dir.join(&name), b"")?;
    Ok(name)
}

/// `n` keys that hash to `shard` of `num_shards`.
pub fn keys_for_shard(shard: u64, num_shards: u64, n: usize) -> Vec<String> {
    (0..)
        .map(|i| format!("key-{}", i))
        .filter(|k| memtable::shard(memtable::hash(k.as_bytes()), num_shards) == shard)
        .take(n)
        .collect()
}

pub fn files_with_ext(dir: &Path, ext: &str) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(ext))
        .collect();
    names.sort();
    names
}

pub fn get_str(db: &Gravel, key: &str) -> Result<Option<String>> {
    Ok(db
        .get(key.as_bytes())?
        .map(|v| String::from_utf8_lossy(&v).into_owned()))
}
