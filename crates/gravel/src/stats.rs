//! Per-engine counters and the sink they are reported to.
//!
//! Counters are plain relaxed atomics bumped on the hot paths. A snapshot
//! combines them with the gauges that have to be read from the memtable and
//! the table manager at report time.
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Monotonic counters owned by one engine instance.
#[derive(Debug, Default)]
pub struct Stats {
    pub gets: AtomicU64,
    /// Gets that found nothing live: absent, deleted or expired.
    pub misses: AtomicU64,
    pub memtable_hits: AtomicU64,
    pub memtable_misses: AtomicU64,
    /// Tables consulted by gets that missed the memtable.
    pub table_lookups: AtomicU64,
    pub sets: AtomicU64,
    pub dels: AtomicU64,
    pub commits: AtomicU64,
    pub flushes: AtomicU64,
    pub table_builds: AtomicU64,
    pub compactions: AtomicU64,
    pub compaction_errors: AtomicU64,
}

impl Stats {
    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Aggregate of every open table, from [`TableManager::stats`](crate::TableManager::stats).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub tables: u64,
    pub size: u64,
    pub records: u64,
    pub index_size: u64,
    pub data_reads: u64,
}

/// Point-in-time view of an engine's counters and gauges.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub gets: u64,
    pub misses: u64,
    pub memtable_hits: u64,
    pub memtable_misses: u64,
    pub table_lookups: u64,
    pub sets: u64,
    pub dels: u64,
    pub commits: u64,
    pub flushes: u64,
    pub table_builds: u64,
    pub compactions: u64,
    pub compaction_errors: u64,
    pub memtable_size: u64,
    pub memtable_keys: u64,
    pub manifest_generation: u64,
    pub tables: TableStats,
}

impl StatsSnapshot {
    pub(crate) fn collect(
        stats: &Stats,
        memtable_size: u64,
        memtable_keys: u64,
        manifest_generation: u64,
        tables: TableStats,
    ) -> Self {
        Self {
            gets: Stats::load(&stats.gets),
            misses: Stats::load(&stats.misses),
            memtable_hits: Stats::load(&stats.memtable_hits),
            memtable_misses: Stats::load(&stats.memtable_misses),
            table_lookups: Stats::load(&stats.table_lookups),
            sets: Stats::load(&stats.sets),
            dels: Stats::load(&stats.dels),
            commits: Stats::load(&stats.commits),
            flushes: Stats::load(&stats.flushes),
            table_builds: Stats::load(&stats.table_builds),
            compactions: Stats::load(&stats.compactions),
            compaction_errors: Stats::load(&stats.compaction_errors),
            memtable_size,
            memtable_keys,
            manifest_generation,
            tables,
        }
    }
}

/// Destination of periodic stats reports.
pub trait StatsSink: Send + Sync {
    fn report(&self, name: &str, snapshot: &StatsSnapshot);
}

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl StatsSink for NoopSink {
    fn report(&self, _name: &str, _snapshot: &StatsSnapshot) {}
}

/// Emits each report as a `tracing` event at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl StatsSink for LogSink {
    fn report(&self, name: &str, s: &StatsSnapshot) {
        info!(
            target: "gravel::stats",
            name,
            gets = s.gets,
            misses = s.misses,
            memtable_hits = s.memtable_hits,
            sets = s.sets,
            dels = s.dels,
            commits = s.commits,
            flushes = s.flushes,
            compactions = s.compactions,
            memtable_size = s.memtable_size,
            memtable_keys = s.memtable_keys,
            tables = s.tables.tables,
            table_size = s.tables.size,
            table_records = s.tables.records,
            index_size = s.tables.index_size,
            data_reads = s.tables.data_reads,
            "stats"
        );
    }
}
