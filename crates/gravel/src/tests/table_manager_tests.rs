use std::fs;
use std::sync::Arc;

use anyhow::Result;
use memtable::Value;
use table::TableReader;
use tempfile::tempdir;

use super::helpers::*;
use crate::manifest::MANIFEST_FILENAME;
use crate::*;

fn open_manager(dir: &std::path::Path, num_shards: u64) -> Result<TableManager> {
    Ok(TableManager::open(manager_opts(dir, num_shards), Arc::new(Stats::default()))?)
}

fn get(mgr: &TableManager, key: &str) -> Result<Option<Value>> {
    Ok(mgr.get(key.as_bytes(), memtable::hash(key.as_bytes()))?)
}

/// Appends one single-shard table per item in `tables`.
fn append_tables(mgr: &TableManager, tables: &[Vec<(&str, Value)>]) -> Result<()> {
    for records in tables {
        let temp = write_temp(mgr.dir(), 0, 1, records)?;
        mgr.append(&[Some(temp)])?;
    }
    Ok(())
}

#[test]
fn open_empty_directory() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("db");
    let mgr = open_manager(&path, 4)?;

    assert_eq!(mgr.num_shards(), 4);
    assert_eq!(mgr.generation(), 0);
    assert!((0..4).all(|s| mgr.table_count(s) == 0));
    assert!(path.join(MANIFEST_FILENAME).exists());
    assert_eq!(get(&mgr, "missing")?, None);
    mgr.close()?;
    Ok(())
}

#[test]
fn newest_table_decides() -> Result<()> {
    let dir = tempdir()?;
    let mgr = open_manager(dir.path(), 1)?;
    append_tables(
        &mgr,
        &[
            vec![("a", live("1")), ("b", live("1")), ("c", live("1"))],
            vec![("a", live("2")), ("b", Value::tombstone())],
        ],
    )?;

    assert_eq!(mgr.table_count(0), 2);
    assert_eq!(mgr.generation(), 2);
    assert_eq!(get(&mgr, "a")?, Some(live("2")));
    assert_eq!(get(&mgr, "b")?, Some(Value::tombstone()));
    assert_eq!(get(&mgr, "c")?, Some(live("1")));
    assert_eq!(get(&mgr, "d")?, None);

    let ids: Vec<u64> = mgr.list(0).iter().map(|t| t.id()).collect();
    assert_eq!(ids, vec![100_000, 200_000]);
    mgr.close()?;
    Ok(())
}

#[test]
fn tables_route_by_shard() -> Result<()> {
    let dir = tempdir()?;
    let mgr = open_manager(dir.path(), 4)?;
    let k1 = keys_for_shard(1, 4, 1).remove(0);
    let k3 = keys_for_shard(3, 4, 1).remove(0);

    let t1 = write_temp(dir.path(), 1, 4, &[(k1.as_str(), live("one"))])?;
    let t3 = write_temp(dir.path(), 3, 4, &[(k3.as_str(), live("three"))])?;
    mgr.append(&[None, Some(t1), None, Some(t3)])?;

    assert_eq!(mgr.table_count(0), 0);
    assert_eq!(mgr.table_count(1), 1);
    assert_eq!(mgr.table_count(3), 1);
    assert_eq!(get(&mgr, &k1)?, Some(live("one")));
    assert_eq!(get(&mgr, &k3)?, Some(live("three")));
    assert_eq!(mgr.stats().tables, 2);
    assert_eq!(mgr.stats().records, 2);
    mgr.close()?;
    Ok(())
}

#[test]
fn reopen_loads_listed_tables_and_drops_orphans() -> Result<()> {
    let dir = tempdir()?;
    {
        let mgr = open_manager(dir.path(), 1)?;
        append_tables(&mgr, &[vec![("a", live("1"))], vec![("b", live("2"))]])?;
        mgr.close()?;
    }
    write_temp(dir.path(), 0, 1, &[("x", live("lost"))])?;
    fs::write(dir.path().join("0_900000.grvl"), b"garbage")?;

    let mgr = open_manager(dir.path(), 1)?;
    assert_eq!(mgr.table_count(0), 2);
    assert_eq!(get(&mgr, "a")?, Some(live("1")));
    assert_eq!(get(&mgr, "b")?, Some(live("2")));
    assert_eq!(get(&mgr, "x")?, None);
    assert_eq!(
        files_with_ext(dir.path(), ".grvl"),
        vec!["0_100000.grvl", "0_200000.grvl"]
    );
    assert!(files_with_ext(dir.path(), ".temp").is_empty());
    mgr.close()?;
    Ok(())
}

#[test]
fn missing_listed_table_fails_open() -> Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join(MANIFEST_FILENAME), "1\n1\n0_100000.grvl\n")?;
    assert!(open_manager(dir.path(), 1).is_err());
    Ok(())
}

#[test]
fn compaction_waits_for_enough_tables() -> Result<()> {
    let dir = tempdir()?;
    let mgr = open_manager(dir.path(), 1)?;
    for i in 0..MIN_FILES_TO_COMPACT - 1 {
        let key = format!("k{}", i);
        append_tables(&mgr, &[vec![(key.as_str(), live("v"))]])?;
    }
    assert!(!mgr.invoke_compaction(0)?);
    assert_eq!(mgr.table_count(0), MIN_FILES_TO_COMPACT - 1);

    append_tables(&mgr, &[vec![("last", live("v"))]])?;
    let generation = mgr.generation();
    assert!(mgr.invoke_compaction(0)?);
    assert_eq!(mgr.generation(), generation + 1);
    // one window of four tables became one
    assert_eq!(mgr.table_count(0), MIN_FILES_TO_COMPACT - 3);
    assert_eq!(files_with_ext(dir.path(), ".grvl").len(), MIN_FILES_TO_COMPACT - 3);

    for i in 0..MIN_FILES_TO_COMPACT - 1 {
        assert_eq!(get(&mgr, &format!("k{}", i))?, Some(live("v")));
    }
    assert_eq!(get(&mgr, "last")?, Some(live("v")));
    assert_eq!(mgr.stats().records, MIN_FILES_TO_COMPACT as u64);
    mgr.close()?;
    Ok(())
}

#[test]
fn compacted_ids_stay_in_recency_order() -> Result<()> {
    let dir = tempdir()?;
    let mgr = open_manager(dir.path(), 1)?;
    append_tables(
        &mgr,
        &[
            vec![("a", live("1"))],
            vec![("a", live("2"))],
            vec![("a", live("3"))],
        ],
    )?;
    assert!(mgr.compact_shard(0)?);

    let ids: Vec<u64> = mgr.list(0).iter().map(|t| t.id()).collect();
    assert_eq!(ids, vec![300_001]);
    assert_eq!(get(&mgr, "a")?, Some(live("3")));

    append_tables(&mgr, &[vec![("a", live("4"))]])?;
    let ids: Vec<u64> = mgr.list(0).iter().map(|t| t.id()).collect();
    assert_eq!(ids, vec![300_001, 400_000]);
    assert_eq!(get(&mgr, "a")?, Some(live("4")));
    mgr.close()?;
    Ok(())
}

#[test]
fn final_compaction_drops_tombstones() -> Result<()> {
    let dir = tempdir()?;
    let mgr = open_manager(dir.path(), 1)?;
    append_tables(
        &mgr,
        &[
            vec![("a", live("1")), ("b", live("2"))],
            vec![("a", Value::tombstone()), ("gone", Value::new(b"x".to_vec(), 1))],
        ],
    )?;

    assert!(mgr.compact_shard(0)?);
    assert_eq!(mgr.table_count(0), 1);
    assert_eq!(mgr.stats().records, 1);
    assert_eq!(get(&mgr, "a")?, None);
    assert_eq!(get(&mgr, "gone")?, None);
    assert_eq!(get(&mgr, "b")?, Some(live("2")));

    // a single table has nothing to merge with
    assert!(!mgr.compact_shard(0)?);
    mgr.close()?;
    Ok(())
}

#[test]
fn workers_only_touch_their_own_shards() -> Result<()> {
    let dir = tempdir()?;
    let mut opts = manager_opts(dir.path(), 2);
    opts.workers = 2;
    let mgr = TableManager::open(opts, Arc::new(Stats::default()))?;

    let keys = keys_for_shard(1, 2, MIN_FILES_TO_COMPACT);
    for key in &keys {
        let temp = write_temp(dir.path(), 1, 2, &[(key.as_str(), live("v"))])?;
        mgr.append(&[None, Some(temp)])?;
    }

    assert!(!mgr.invoke_compaction(0)?);
    // Worker 1 may have woken up late and beaten us to it; either way
    // shard 1 ends up compacted exactly once.
    let _ = mgr.invoke_compaction(1);
    assert_eq!(mgr.table_count(1), MIN_FILES_TO_COMPACT - 3);
    assert_eq!(mgr.table_count(0), 0);
    mgr.close()?;
    Ok(())
}

#[test]
fn compact_unknown_shard_fails() -> Result<()> {
    let dir = tempdir()?;
    let mgr = open_manager(dir.path(), 2)?;
    assert!(mgr.compact_shard(2).is_err());
    mgr.close()?;
    Ok(())
}

#[test]
fn closed_manager_refuses_appends() -> Result<()> {
    let dir = tempdir()?;
    let mgr = open_manager(dir.path(), 1)?;
    append_tables(&mgr, &[vec![("a", live("1"))]])?;

    mgr.close()?;
    mgr.close()?;
    assert!(mgr.is_closed());
    assert!(mgr.list(0).iter().all(|t| t.is_closed()));

    let temp = write_temp(dir.path(), 0, 1, &[("b", live("2"))])?;
    assert!(matches!(mgr.append(&[Some(temp)]), Err(GravelError::Closed)));
    assert!(!mgr.compact_shard(0)?);
    Ok(())
}

#[test]
fn unreadable_appended_table_still_opens_other_shards() -> Result<()> {
    let dir = tempdir()?;
    let mgr = open_manager(dir.path(), 2)?;

    let key = keys_for_shard(1, 2, 1).remove(0);
    let broken = touch_temp(dir.path(), 0)?;
    let good = write_temp(dir.path(), 1, 2, &[(key.as_str(), live("v"))])?;
    assert!(mgr.append(&[Some(broken), Some(good)]).is_err());

    // The manifest update is durable, so both shards moved on.
    assert_eq!(mgr.generation(), 1);
    assert_eq!(mgr.table_count(0), 0);
    assert_eq!(mgr.table_count(1), 1);
    assert_eq!(get(&mgr, &key)?, Some(live("v")));
    mgr.close()?;
    Ok(())
}
