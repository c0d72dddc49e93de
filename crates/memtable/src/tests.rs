use super::*;
use std::sync::Arc;
use std::thread;

fn set(key: &str, val: &str) -> Entry {
    Entry::new(key.as_bytes().to_vec(), Value::new(val.as_bytes().to_vec(), 0))
}

fn del(key: &str) -> Entry {
    Entry::new(key.as_bytes().to_vec(), Value::tombstone())
}

fn get(m: &Memtable, key: &str) -> Option<Value> {
    m.get(key.as_bytes(), hash(key.as_bytes()))
}

// -------------------- Value model --------------------

#[test]
fn sizeof_counts_key_flag_and_value() {
    let v = Value::new(b"abc".to_vec(), 0);
    assert_eq!(sizeof(b"key", &v), 3 + 1 + 3 + 4);
    assert_eq!(sizeof(b"key", &Value::tombstone()), 3 + 1);
}

#[test]
fn expiry_boundary() {
    let v = Value::new(b"x".to_vec(), 100);
    assert!(!v.is_expired(99));
    assert!(v.is_expired(100));
    assert!(v.is_expired(101));
    assert!(v.is_live(99));
    assert!(!v.is_live(100));

    let forever = Value::new(b"x".to_vec(), 0);
    assert!(!forever.is_expired(u32::MAX));
    assert!(!Value::tombstone().is_live(0));
}

#[test]
fn shard_uses_low_bits() {
    assert_eq!(shard(0b1011, 1), 0);
    assert_eq!(shard(0b1011, 4), 0b11);
    assert_eq!(shard(0b1011, 8), 0b011);
    assert_eq!(shard_bits(1), 0);
    assert_eq!(shard_bits(8), 3);
    assert_eq!(shard_bits(1024), 10);
}

#[test]
fn hash_is_stable() {
    assert_eq!(hash(b"hello"), hash(b"hello"));
    assert_ne!(hash(b"hello"), hash(b"hellp"));
}

// -------------------- set_many / get --------------------

#[test]
fn set_many_then_get() {
    let m = Memtable::new(4);
    let out = m.set_many(vec![set("a", "1"), set("b", "2"), del("c")]);
    assert_eq!(out.sets, 2);
    assert_eq!(out.dels, 1);
    assert_eq!(out.len, 3);
    assert_eq!(m.len(), 3);

    assert_eq!(get(&m, "a").unwrap().data, b"1");
    assert_eq!(get(&m, "b").unwrap().data, b"2");
    assert!(get(&m, "c").unwrap().deleted);
    assert!(get(&m, "d").is_none());
}

#[test]
fn overwrite_adjusts_size_not_len() {
    let m = Memtable::new(1);
    m.set_many(vec![set("k", "aaaa")]);
    assert_eq!(m.size(), 1 + 1 + 4 + 4);
    assert_eq!(m.len(), 1);

    m.set_many(vec![set("k", "b")]);
    assert_eq!(m.size(), 1 + 1 + 1 + 4);
    assert_eq!(m.len(), 1);

    m.set_many(vec![del("k")]);
    assert_eq!(m.size(), 1 + 1);
    assert_eq!(m.len(), 1);
    assert!(get(&m, "k").unwrap().deleted);
}

#[test]
fn later_entry_in_same_batch_wins() {
    let m = Memtable::new(2);
    let out = m.set_many(vec![set("k", "first"), set("k", "second")]);
    assert_eq!(out.len, 1);
    assert_eq!(get(&m, "k").unwrap().data, b"second");
    assert_eq!(m.size(), sizeof(b"k", &Value::new(b"second".to_vec(), 0)));
}

#[test]
fn size_matches_sum_of_sizeof() {
    let m = Memtable::new(8);
    let entries: Vec<Entry> = (0..200)
        .map(|i| set(&format!("key{}", i), &format!("value{}", i)))
        .collect();
    let expected: u64 = entries.iter().map(|e| sizeof(&e.key, &e.val)).sum();
    m.set_many(entries);
    assert_eq!(m.size(), expected);
    assert_eq!(m.len(), 200);
}

// -------------------- flush / clear --------------------

#[test]
fn flush_visits_every_shard_in_order() {
    let m = Memtable::new(4);
    let entries: Vec<Entry> = (0..100).map(|i| set(&format!("k{}", i), "v")).collect();
    m.set_many(entries);

    let seen = m
        .flush(|shard_idx, map| -> Result<(u64, usize), ()> {
            for key in map.keys() {
                assert_eq!(shard(hash(key), 4), shard_idx);
            }
            Ok((shard_idx, map.len()))
        })
        .unwrap();

    assert_eq!(seen.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert_eq!(seen.iter().map(|(_, n)| *n).sum::<usize>(), 100);
    // flush does not clear
    assert_eq!(m.len(), 100);
}

#[test]
fn flush_propagates_builder_error() {
    let m = Memtable::new(2);
    m.set_many(vec![set("a", "1")]);
    let res: Result<Vec<()>, &str> = m.flush(|_, _| Err("disk full"));
    assert_eq!(res, Err("disk full"));
}

#[test]
fn clear_resets_everything() {
    let m = Memtable::new(4);
    m.set_many(vec![set("a", "1"), set("b", "2")]);
    m.clear();
    assert_eq!(m.size(), 0);
    assert_eq!(m.len(), 0);
    assert!(m.is_empty());
    assert!(get(&m, "a").is_none());
}

// -------------------- Concurrency --------------------

#[test]
fn concurrent_readers_and_writer() {
    let m = Arc::new(Memtable::new(8));
    m.set_many(vec![set("stable", "yes")]);

    let writer = {
        let m = Arc::clone(&m);
        thread::spawn(move || {
            for i in 0..200 {
                m.set_many(vec![set(&format!("w{}", i), "v")]);
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                for _ in 0..500 {
                    assert_eq!(get(&m, "stable").unwrap().data, b"yes");
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(m.len(), 201);
}

#[test]
fn debug_impl_works() {
    let m = Memtable::new(2);
    let s = format!("{:?}", m);
    assert!(s.contains("Memtable"));
    assert!(s.contains("num_shards"));
}
