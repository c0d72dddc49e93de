use super::*;
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults() {
    let opts = Options::default();
    assert_eq!(opts.max_table_size, 64 << 20);
    assert_eq!(opts.table_type, TableType::HashTable);
    assert_eq!(opts.dirname, PathBuf::from("gravel"));
    assert_eq!(opts.name, "gravel");
    assert!(!opts.report_stats);
    assert_eq!(opts.num_shards, 1);
    assert_eq!(opts.compaction_workers, None);
    assert!(opts.validate().is_ok());
}

#[test]
fn builders_set_fields() {
    let opts = Options::new("/tmp/x")
        .with_max_table_size(1000)
        .with_table_type(TableType::BTree)
        .with_name("actions")
        .with_report_stats(true)
        .with_num_shards(16)
        .with_compaction_workers(0)
        .with_compaction_poll_interval(Duration::from_millis(5));

    assert_eq!(opts.dirname, PathBuf::from("/tmp/x"));
    assert_eq!(opts.max_table_size, 1000);
    assert_eq!(opts.table_type, TableType::BTree);
    assert_eq!(opts.name, "actions");
    assert!(opts.report_stats);
    assert_eq!(opts.num_shards, 16);
    assert_eq!(opts.compaction_workers, Some(0));
    assert_eq!(opts.compaction_poll_interval, Duration::from_millis(5));
}

#[test]
fn validate_rejects_bad_shard_counts() {
    for bad in [0, 3, 6, 1000, 2048] {
        let opts = Options::default().with_num_shards(bad);
        assert_eq!(opts.validate(), Err(ConfigError::InvalidShards(bad)));
    }
    for good in [1, 2, 64, 1024] {
        assert!(Options::default().with_num_shards(good).validate().is_ok());
    }
}

#[test]
fn validate_rejects_zero_table_size() {
    let opts = Options::default().with_max_table_size(0);
    assert_eq!(opts.validate(), Err(ConfigError::ZeroTableSize));
}

#[test]
fn compaction_workers_auto() {
    let opts = Options::default();
    assert_eq!(opts.effective_compaction_workers(1), 1);
    assert_eq!(opts.effective_compaction_workers(10), 2);
    assert_eq!(opts.effective_compaction_workers(128), 8);
    assert_eq!(
        opts.with_compaction_workers(3).effective_compaction_workers(128),
        3
    );
}

#[test]
fn table_type_parse_and_display() {
    assert_eq!("hash".parse::<TableType>(), Ok(TableType::HashTable));
    assert_eq!("BTree".parse::<TableType>(), Ok(TableType::BTree));
    assert_eq!(" mph ".parse::<TableType>(), Ok(TableType::MinPerfectHash));
    assert!(matches!(
        "lsm".parse::<TableType>(),
        Err(ConfigError::UnknownTableType(_))
    ));
    for ty in [TableType::HashTable, TableType::BTree, TableType::MinPerfectHash] {
        assert_eq!(ty.to_string().parse::<TableType>(), Ok(ty));
    }
}

#[test]
fn from_lookup_uses_defaults_when_unset() {
    let opts = Options::from_lookup(lookup_from(&[])).unwrap();
    assert_eq!(opts, Options::default());
}

#[test]
fn from_lookup_reads_every_variable() {
    let opts = Options::from_lookup(lookup_from(&[
        ("GRAVEL_DIR", "data/g"),
        ("GRAVEL_MAX_TABLE_KB", "4"),
        ("GRAVEL_SHARDS", "8"),
        ("GRAVEL_TABLE_TYPE", "mph"),
        ("GRAVEL_REPORT_STATS", "true"),
    ]))
    .unwrap();

    assert_eq!(opts.dirname, PathBuf::from("data/g"));
    assert_eq!(opts.max_table_size, 4096);
    assert_eq!(opts.num_shards, 8);
    assert_eq!(opts.table_type, TableType::MinPerfectHash);
    assert!(opts.report_stats);
}

#[test]
fn from_lookup_rejects_garbage() {
    let err = Options::from_lookup(lookup_from(&[("GRAVEL_SHARDS", "many")])).unwrap_err();
    assert_eq!(
        err,
        ConfigError::InvalidEnv {
            key: "GRAVEL_SHARDS".to_string(),
            value: "many".to_string()
        }
    );

    let err = Options::from_lookup(lookup_from(&[("GRAVEL_SHARDS", "3")])).unwrap_err();
    assert_eq!(err, ConfigError::InvalidShards(3));
}
