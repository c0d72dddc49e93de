use anyhow::Result;
use tempfile::tempdir;

use super::helpers::*;
use crate::*;

#[test]
fn batch_tracks_len_and_size() -> Result<()> {
    let dir = tempdir()?;
    let db = Gravel::open(test_opts(dir.path()))?;
    let mut b = db.new_batch();
    assert!(b.is_empty());

    b.set("key", "value", 0)?;
    b.del("gone")?;
    assert_eq!(b.len(), 2);
    // key + 1 + value + 4, then key + 1 for the tombstone
    assert_eq!(b.size(), (3 + 1 + 5 + 4) + (4 + 1));
    assert!(!b.is_sealed());
    Ok(())
}

#[test]
fn nothing_is_visible_before_commit() -> Result<()> {
    let dir = tempdir()?;
    let db = Gravel::open(test_opts(dir.path()))?;
    let mut b = db.new_batch();
    b.set("a", "1", 0)?;
    b.set("b", "2", 0)?;
    assert_eq!(get_str(&db, "a")?, None);

    b.commit()?;
    assert_eq!(get_str(&db, "a")?.as_deref(), Some("1"));
    assert_eq!(get_str(&db, "b")?.as_deref(), Some("2"));
    Ok(())
}

#[test]
fn later_write_in_batch_wins() -> Result<()> {
    let dir = tempdir()?;
    let db = Gravel::open(test_opts(dir.path()))?;
    let mut b = db.new_batch();
    b.set("k", "first", 0)?;
    b.set("k", "second", 0)?;
    b.set("d", "x", 0)?;
    b.del("d")?;
    b.commit()?;

    assert_eq!(get_str(&db, "k")?.as_deref(), Some("second"));
    assert_eq!(get_str(&db, "d")?, None);
    Ok(())
}

#[test]
fn committed_batch_is_sealed() -> Result<()> {
    let dir = tempdir()?;
    let db = Gravel::open(test_opts(dir.path()))?;
    let mut b = db.new_batch();
    b.set("a", "1", 0)?;
    b.commit()?;

    assert!(b.is_sealed());
    assert!(matches!(b.set("b", "2", 0), Err(GravelError::SealedBatch)));
    assert!(matches!(b.del("a"), Err(GravelError::SealedBatch)));
    assert!(matches!(b.commit(), Err(GravelError::SealedBatch)));
    assert_eq!(db.stats().commits, 1);
    Ok(())
}

#[test]
fn discard_drops_writes_and_seals() -> Result<()> {
    let dir = tempdir()?;
    let db = Gravel::open(test_opts(dir.path()))?;
    let mut b = db.new_batch();
    b.set("a", "1", 0)?;
    b.discard();
    b.discard();

    assert!(b.is_sealed());
    assert!(b.is_empty());
    assert!(matches!(b.commit(), Err(GravelError::SealedBatch)));
    assert_eq!(get_str(&db, "a")?, None);
    Ok(())
}

#[test]
fn oversized_batch_is_rejected_whole() -> Result<()> {
    let dir = tempdir()?;
    let db = Gravel::open(test_opts(dir.path()).with_max_table_size(100))?;

    let mut b = db.new_batch();
    for i in 0..10 {
        b.set(format!("key-{}", i), vec![b'x'; 10], 0)?;
    }
    let err = b.commit().unwrap_err();
    assert!(matches!(err, GravelError::BatchTooLarge { limit: 100, .. }));
    assert!(b.is_sealed());

    for i in 0..10 {
        assert_eq!(get_str(&db, &format!("key-{}", i))?, None);
    }
    assert_eq!(db.stats().memtable_keys, 0);
    assert_eq!(db.stats().commits, 0);
    Ok(())
}

#[test]
fn empty_batch_commits() -> Result<()> {
    let dir = tempdir()?;
    let db = Gravel::open(test_opts(dir.path()))?;
    db.new_batch().commit()?;
    assert_eq!(db.stats().commits, 1);
    assert_eq!(db.stats().memtable_keys, 0);
    Ok(())
}
