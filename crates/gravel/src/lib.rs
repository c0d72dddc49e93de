//! # Gravel - batch-atomic key-value storage engine
//!
//! Ties the [`memtable`] and [`table`] crates together. Writes go through a
//! [`Batch`]; a committed batch lands in the sharded memtable, and once the
//! memtable would overflow it is persisted as one immutable table per shard.
//! There is no write-ahead log: a crash can lose the batches committed since
//! the last flush, but never exposes part of a batch.
//!
//! ## Architecture
//!
//! ```text
//! Batch::commit
//!   |
//!   v  (commit lock)
//! memtable would overflow? --yes--> flush: build temp tables -> Manifest::append -> clear
//!   |
//!   v
//! Memtable::set_many
//!
//! Gravel::get -> Memtable -> shard's tables, newest first   (first hit decides)
//!
//! compaction workers: busiest shard with >= 8 tables -> merge a window -> Manifest::replace
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module            | Purpose                                                  |
//! |-------------------|----------------------------------------------------------|
//! | `lib.rs`          | `Gravel`: open, get, commit, flush, close, background threads |
//! | [`batch`]         | `Batch` builder, single use                              |
//! | [`manifest`]      | per-shard ledger of live tables, atomic rewrite          |
//! | [`table_manager`] | open tables in step with the manifest, compaction workers |
//! | [`stats`]         | counters, snapshots, `StatsSink`                         |
//!
//! ## Locks
//!
//! ```text
//! commit     Mutex      one commit (and any flush it triggers) at a time
//! tables     RwLock     gets read; append and compaction commit write
//! memtable   RwLocks    see the memtable crate
//! ```
pub mod batch;
mod error;
pub mod manifest;
pub mod stats;
pub mod table_manager;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use memtable::{Entry, Memtable};
use parking_lot::{Condvar, Mutex};
use table::build_memtable_tables;
use tracing::{debug, error, info, warn};

pub use batch::Batch;
pub use config::{Options, TableType};
pub use error::{GravelError, Result};
pub use manifest::Manifest;
pub use memtable::{Timestamp, Value};
pub use stats::{LogSink, NoopSink, Stats, StatsSink, StatsSnapshot, TableStats};
pub use table_manager::{ManagerOptions, TableManager, MIN_FILES_TO_COMPACT};

/// An open engine.
///
/// All methods take `&self`; share it between threads with an `Arc`.
/// Dropping it closes it.
pub struct Gravel {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    opts: Options,
    memtable: Memtable,
    manager: TableManager,
    commit: Mutex<CommitState>,
    closed: AtomicBool,
    stopped: Mutex<bool>,
    wake: Condvar,
    stats: Arc<Stats>,
    sink: Arc<dyn StatsSink>,
}

struct CommitState {
    last_flush: Instant,
}

impl Gravel {
    /// Opens (or creates) the engine in `opts.dirname`, reporting stats to
    /// the log when `opts.report_stats` is set.
    pub fn open(opts: Options) -> Result<Self> {
        Self::open_with_sink(opts, Arc::new(LogSink))
    }

    /// Like [`open`](Gravel::open) with a caller-supplied stats sink.
    ///
    /// # Errors
    ///
    /// Invalid options, an unreadable manifest, or a listed table that
    /// cannot be opened.
    pub fn open_with_sink(opts: Options, sink: Arc<dyn StatsSink>) -> Result<Self> {
        opts.validate()?;

        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let stats = Arc::new(Stats::default());
        let manager = TableManager::open(
            ManagerOptions {
                dir: opts.dirname.clone(),
                table_type: opts.table_type,
                num_shards: opts.num_shards,
                workers: opts.effective_compaction_workers(cpus),
                poll_interval: opts.compaction_poll_interval,
            },
            Arc::clone(&stats),
        )?;
        let memtable = Memtable::new(manager.num_shards());

        let inner = Arc::new(Inner {
            opts,
            memtable,
            manager,
            commit: Mutex::new(CommitState {
                last_flush: Instant::now(),
            }),
            closed: AtomicBool::new(false),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            stats,
            sink,
        });

        let db = Self {
            inner: Arc::clone(&inner),
            threads: Mutex::new(Vec::new()),
        };
        db.spawn("gravel-flush", Inner::run_periodic_flush)?;
        if inner.opts.report_stats {
            db.spawn("gravel-stats", Inner::run_stats_reporter)?;
        }

        info!(
            name = %inner.opts.name,
            dir = %inner.opts.dirname.display(),
            num_shards = inner.memtable.num_shards(),
            table_type = %inner.opts.table_type,
            max_table_size = inner.opts.max_table_size,
            "gravel opened"
        );
        Ok(db)
    }

    fn spawn(&self, name: &str, f: fn(&Inner)) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || f(&inner))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// A new, empty batch bound to this engine.
    pub fn new_batch(&self) -> Batch<'_> {
        Batch::new(self)
    }

    /// Returns the value stored under `key`, or `None` if the key is
    /// absent, deleted or expired.
    ///
    /// The memtable is consulted first, then the key's shard's tables from
    /// newest to oldest. The first layer that holds the key decides: a
    /// tombstone or expired value there hides any older value.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let inner = &self.inner;
        Stats::incr(&inner.stats.gets);

        let hash = memtable::hash(key);
        let found = match inner.memtable.get(key, hash) {
            Some(val) => {
                Stats::incr(&inner.stats.memtable_hits);
                Some(val)
            }
            None => {
                Stats::incr(&inner.stats.memtable_misses);
                inner.manager.get(key, hash)?
            }
        };

        match found {
            Some(val) if val.is_live(memtable::now()) => Ok(Some(val.data)),
            _ => {
                Stats::incr(&inner.stats.misses);
                Ok(None)
            }
        }
    }

    pub(crate) fn commit_entries(&self, entries: Vec<Entry>, size: u64) -> Result<()> {
        self.check_open()?;
        let inner = &self.inner;
        let limit = inner.opts.max_table_size;
        if size > limit {
            return Err(GravelError::BatchTooLarge { size, limit });
        }

        let mut commit = inner.commit.lock();
        self.check_open()?;
        if inner.memtable.size() + size > limit {
            inner.flush_locked(&mut commit)?;
        }
        let outcome = inner.memtable.set_many(entries);

        Stats::add(&inner.stats.sets, outcome.sets);
        Stats::add(&inner.stats.dels, outcome.dels);
        Stats::incr(&inner.stats.commits);
        Ok(())
    }

    /// Persists the memtable as new tables and clears it.
    pub fn flush(&self) -> Result<()> {
        self.check_open()?;
        let mut commit = self.inner.commit.lock();
        self.inner.flush_locked(&mut commit)
    }

    /// Compacts `shard` right away, regardless of how many tables it has.
    /// Returns whether anything was merged.
    pub fn compact(&self, shard: u64) -> Result<bool> {
        self.check_open()?;
        self.inner.manager.compact_shard(shard)
    }

    pub fn num_shards(&self) -> u64 {
        self.inner.memtable.num_shards()
    }

    pub fn dir(&self) -> &Path {
        &self.inner.opts.dirname
    }

    pub fn options(&self) -> &Options {
        &self.inner.opts
    }

    pub fn table_manager(&self) -> &TableManager {
        &self.inner.manager
    }

    /// Current counters and gauges.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(GravelError::Closed);
        }
        Ok(())
    }

    /// Stops the background threads, flushes the memtable and closes every
    /// table. Idempotent; only the first call does any work.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let mut stopped = inner.stopped.lock();
            *stopped = true;
            inner.wake.notify_all();
        }
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                error!("background thread panicked");
            }
        }

        let flushed = {
            let mut commit = inner.commit.lock();
            inner.flush_locked(&mut commit)
        };
        let closed = inner.manager.close();
        info!(name = %inner.opts.name, "gravel closed");
        flushed.and(closed)
    }

    /// Closes the engine and deletes its directory.
    pub fn teardown(self) -> Result<()> {
        self.close()?;
        std::fs::remove_dir_all(&self.inner.opts.dirname)?;
        info!(dir = %self.inner.opts.dirname.display(), "gravel torn down");
        Ok(())
    }
}

impl Drop for Gravel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "closing gravel on drop failed");
        }
    }
}

impl std::fmt::Debug for Gravel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = &self.inner;
        f.debug_struct("Gravel")
            .field("name", &inner.opts.name)
            .field("dir", &inner.opts.dirname)
            .field("table_type", &inner.opts.table_type)
            .field("num_shards", &inner.memtable.num_shards())
            .field("memtable_size", &inner.memtable.size())
            .field("memtable_keys", &inner.memtable.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inner {
    /// Persists the memtable. Caller holds the commit lock.
    fn flush_locked(&self, commit: &mut CommitState) -> Result<()> {
        commit.last_flush = Instant::now();
        if self.memtable.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let temps = build_memtable_tables(&self.opts.dirname, self.opts.table_type, &self.memtable)?;
        if let Err(e) = self.manager.append(&temps) {
            // Temps the manifest already renamed are gone; only leftovers remain.
            for temp in temps.iter().flatten() {
                match std::fs::remove_file(self.opts.dirname.join(temp)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(file = %temp, error = %e, "failed to remove temp table"),
                }
            }
            return Err(e);
        }

        let keys = self.memtable.len();
        let size = self.memtable.size();
        self.memtable.clear();
        Stats::incr(&self.stats.flushes);
        info!(
            keys,
            size,
            tables = temps.iter().flatten().count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "flushed memtable"
        );
        Ok(())
    }

    /// Sleeps up to `timeout` or until close; returns `true` once closing.
    fn wait_stopped(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, timeout);
        }
        *stopped
    }

    fn run_periodic_flush(&self) {
        let interval = self.opts.periodic_flush_interval;
        while !self.wait_stopped(interval) {
            let mut commit = self.commit.lock();
            if commit.last_flush.elapsed() < interval {
                continue;
            }
            debug!("periodic flush");
            if let Err(e) = self.flush_locked(&mut commit) {
                error!(error = %e, "periodic flush failed");
            }
        }
    }

    fn run_stats_reporter(&self) {
        while !self.wait_stopped(self.opts.stats_interval) {
            self.sink.report(&self.opts.name, &self.snapshot());
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot::collect(
            &self.stats,
            self.memtable.size(),
            self.memtable.len(),
            self.manager.generation(),
            self.manager.stats(),
        )
    }
}

#[cfg(test)]
mod tests;
