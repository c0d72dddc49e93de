//! # Config - Gravel Engine Options
//!
//! Every knob the engine, the table manager and the CLI read lives here, so
//! that the lower crates (`table`, `memtable`) and the facade agree on one
//! definition of what a table type or a shard count is.
//!
//! Options are built from [`Options::default`] with `with_*` methods, or
//! from `GRAVEL_*` environment variables with [`Options::from_env`]:
//!
//! ```text
//! GRAVEL_DIR           data directory               (default: "gravel")
//! GRAVEL_MAX_TABLE_KB  memtable / table size in KiB  (default: 65536 = 64 MiB)
//! GRAVEL_SHARDS        shard count, power of two     (default: 1)
//! GRAVEL_TABLE_TYPE    hash | btree | mph            (default: hash)
//! GRAVEL_REPORT_STATS  report stats periodically     (default: false)
//! ```
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default maximum size of a memtable generation and hence of a freshly
/// flushed table (64 MiB).
pub const DEFAULT_MAX_TABLE_SIZE: u64 = 64 << 20;

/// Largest supported shard count.
pub const MAX_SHARDS: u64 = 1024;

/// Default interval at which idle compaction workers look for work.
pub const DEFAULT_COMPACTION_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default interval after which a memtable is flushed even if it is not full.
pub const DEFAULT_PERIODIC_FLUSH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default interval between two stats reports.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Errors produced while building or validating [`Options`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Shard count is not a power of two in `[1, MAX_SHARDS]`.
    #[error("num_shards must be a power of two in [1, {MAX_SHARDS}], got {0}")]
    InvalidShards(u64),

    /// `max_table_size` of zero.
    #[error("max_table_size must be > 0")]
    ZeroTableSize,

    /// Unknown table type name.
    #[error("unknown table type: {0:?} (expected hash, btree or mph)")]
    UnknownTableType(String),

    /// An environment variable held a value that could not be parsed.
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: String, value: String },
}

/// On-disk format used for new tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TableType {
    /// Custom mmap'd hash table with a two-level fingerprint index.
    #[default]
    HashTable,
    /// Embedded B-tree database, one file per table.
    BTree,
    /// Minimal perfect hash with an embedded bloom filter.
    MinPerfectHash,
}

impl TableType {
    /// Short lowercase name, as accepted by [`FromStr`].
    pub fn as_str(&self) -> &'static str {
        match self {
            TableType::HashTable => "hash",
            TableType::BTree => "btree",
            TableType::MinPerfectHash => "mph",
        }
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hash" | "hashtable" => Ok(TableType::HashTable),
            "btree" => Ok(TableType::BTree),
            "mph" | "minperfecthash" => Ok(TableType::MinPerfectHash),
            other => Err(ConfigError::UnknownTableType(other.to_string())),
        }
    }
}

/// Engine open options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Maximum serialized size of one memtable generation. A batch larger
    /// than this is rejected at commit.
    pub max_table_size: u64,
    /// Format used for newly built tables.
    pub table_type: TableType,
    /// Directory holding the manifest and all table files.
    pub dirname: PathBuf,
    /// Instance name, used as the stats label.
    pub name: String,
    /// Periodically push a stats snapshot to the configured sink.
    pub report_stats: bool,
    /// Number of shards. Ignored if the directory already has a manifest.
    pub num_shards: u64,
    /// Number of compaction workers. `None` picks `min(8, max(1, cpus / 5))`,
    /// `Some(0)` disables background compaction.
    pub compaction_workers: Option<usize>,
    pub compaction_poll_interval: Duration,
    pub periodic_flush_interval: Duration,
    pub stats_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_table_size: DEFAULT_MAX_TABLE_SIZE,
            table_type: TableType::default(),
            dirname: PathBuf::from("gravel"),
            name: "gravel".to_string(),
            report_stats: false,
            num_shards: 1,
            compaction_workers: None,
            compaction_poll_interval: DEFAULT_COMPACTION_POLL_INTERVAL,
            periodic_flush_interval: DEFAULT_PERIODIC_FLUSH_INTERVAL,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

impl Options {
    /// Default options rooted at `dirname`.
    pub fn new(dirname: impl Into<PathBuf>) -> Self {
        Self {
            dirname: dirname.into(),
            ..Self::default()
        }
    }

    pub fn with_max_table_size(mut self, size: u64) -> Self {
        self.max_table_size = size;
        self
    }

    pub fn with_table_type(mut self, table_type: TableType) -> Self {
        self.table_type = table_type;
        self
    }

    pub fn with_dirname(mut self, dirname: impl Into<PathBuf>) -> Self {
        self.dirname = dirname.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_report_stats(mut self, report: bool) -> Self {
        self.report_stats = report;
        self
    }

    pub fn with_num_shards(mut self, num_shards: u64) -> Self {
        self.num_shards = num_shards;
        self
    }

    pub fn with_compaction_workers(mut self, workers: usize) -> Self {
        self.compaction_workers = Some(workers);
        self
    }

    pub fn with_compaction_poll_interval(mut self, interval: Duration) -> Self {
        self.compaction_poll_interval = interval;
        self
    }

    pub fn with_periodic_flush_interval(mut self, interval: Duration) -> Self {
        self.periodic_flush_interval = interval;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Checks the invariants the engine relies on.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidShards`] if `num_shards` is not a power of two in
    /// `[1, MAX_SHARDS]`, [`ConfigError::ZeroTableSize`] if `max_table_size` is 0.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_shards(self.num_shards)?;
        if self.max_table_size == 0 {
            return Err(ConfigError::ZeroTableSize);
        }
        Ok(())
    }

    /// Number of compaction workers to spawn for `cpus` available cores.
    pub fn effective_compaction_workers(&self, cpus: usize) -> usize {
        match self.compaction_workers {
            Some(n) => n,
            None => (cpus / 5).clamp(1, 8),
        }
    }

    /// Builds options from `GRAVEL_*` environment variables, falling back to
    /// the defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Options::from_env) but reads variables through
    /// `lookup`, so callers (and tests) can supply their own source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = Options::default();

        if let Some(dir) = lookup("GRAVEL_DIR") {
            opts.dirname = PathBuf::from(dir);
        }
        if let Some(kb) = lookup("GRAVEL_MAX_TABLE_KB") {
            let kb: u64 = parse_env("GRAVEL_MAX_TABLE_KB", &kb)?;
            opts.max_table_size = kb.saturating_mul(1024);
        }
        if let Some(shards) = lookup("GRAVEL_SHARDS") {
            opts.num_shards = parse_env("GRAVEL_SHARDS", &shards)?;
        }
        if let Some(ty) = lookup("GRAVEL_TABLE_TYPE") {
            opts.table_type = ty.parse()?;
        }
        if let Some(report) = lookup("GRAVEL_REPORT_STATS") {
            opts.report_stats = parse_env("GRAVEL_REPORT_STATS", &report)?;
        }

        opts.validate()?;
        Ok(opts)
    }
}

/// Checks that `num_shards` is a power of two in `[1, MAX_SHARDS]`.
pub fn validate_shards(num_shards: u64) -> Result<(), ConfigError> {
    if num_shards == 0 || num_shards > MAX_SHARDS || !num_shards.is_power_of_two() {
        return Err(ConfigError::InvalidShards(num_shards));
    }
    Ok(())
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests;
