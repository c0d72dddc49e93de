//! Open table handles, kept in step with the manifest, plus the background
//! compaction workers.
//!
//! ## Locking
//!
//! One `RwLock<State>` guards the manifest and every open table. Gets hold
//! the read lock while they walk a shard's tables. Appends and the commit
//! step of a compaction take the write lock; the expensive part of a
//! compaction (writing the merged table) runs without any lock.
//!
//! ## Workers
//!
//! Worker `w` of `N` owns the shards with `shard % N == w`, so no two
//! workers ever compact the same shard. Each one repeatedly picks its shard
//! with the most tables and compacts it once that shard has at least
//! [`MIN_FILES_TO_COMPACT`] tables, sleeping `poll_interval` between idle
//! rounds.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use config::TableType;
use memtable::Value;
use parking_lot::{Condvar, MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use table::{merge_tables, open_table, pick_tables_to_compact, write_merged_table, Table, TableReader};
use tracing::{debug, error, info, warn};

use crate::error::{GravelError, Result};
use crate::manifest::Manifest;
use crate::stats::{Stats, TableStats};

/// Fewest tables a shard needs before a worker compacts it.
pub const MIN_FILES_TO_COMPACT: usize = 8;

/// Settings the manager is opened with.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub dir: PathBuf,
    pub table_type: TableType,
    /// Used only when the directory has no manifest yet.
    pub num_shards: u64,
    /// `0` disables background compaction.
    pub workers: usize,
    pub poll_interval: Duration,
}

struct State {
    manifest: Manifest,
    /// Open tables per shard, oldest first, matching the manifest.
    tables: Vec<Vec<Table>>,
}

struct Shared {
    dir: PathBuf,
    table_type: TableType,
    num_shards: u64,
    state: RwLock<State>,
    stopped: Mutex<bool>,
    wake: Condvar,
    poll_interval: Duration,
    num_workers: usize,
    stats: Arc<Stats>,
}

/// Owns the manifest, the open tables and the compaction workers.
pub struct TableManager {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TableManager {
    /// Loads (or creates) the manifest in `opts.dir`, removes orphaned
    /// files, opens every listed table and starts the workers.
    ///
    /// # Errors
    ///
    /// Fails if the manifest is invalid or a listed table cannot be opened.
    pub fn open(opts: ManagerOptions, stats: Arc<Stats>) -> Result<Self> {
        fs::create_dir_all(&opts.dir)?;
        let manifest = Manifest::load_or_create(&opts.dir, opts.num_shards)?;
        manifest.clean()?;

        let num_shards = manifest.num_shards();
        let mut state = State {
            manifest,
            tables: (0..num_shards).map(|_| Vec::new()).collect(),
        };
        for shard in 0..num_shards {
            if let Err(e) = reload_shard(&opts.dir, &mut state, shard) {
                close_all(&mut state);
                return Err(e);
            }
        }

        let shared = Arc::new(Shared {
            dir: opts.dir,
            table_type: opts.table_type,
            num_shards,
            state: RwLock::new(state),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            poll_interval: opts.poll_interval,
            num_workers: opts.workers,
            stats,
        });

        let workers = (0..opts.workers)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("gravel-compact-{}", worker))
                    .spawn(move || shared.run_worker(worker))
            })
            .collect::<std::io::Result<Vec<_>>>();
        let mgr = Self {
            shared,
            workers: Mutex::new(Vec::new()),
        };
        match workers {
            Ok(handles) => *mgr.workers.lock() = handles,
            Err(e) => {
                mgr.close()?;
                return Err(e.into());
            }
        }
        info!(num_shards, workers = opts.workers, "table manager started");
        Ok(mgr)
    }

    pub fn num_shards(&self) -> u64 {
        self.shared.num_shards
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn table_type(&self) -> TableType {
        self.shared.table_type
    }

    /// Manifest updates since open.
    pub fn generation(&self) -> u64 {
        self.shared.state.read().manifest.generation()
    }

    /// The open tables of `shard`, oldest first. Holds the read lock for
    /// as long as the guard lives.
    pub fn list(&self, shard: u64) -> MappedRwLockReadGuard<'_, [Table]> {
        RwLockReadGuard::map(self.shared.state.read(), |s| s.tables[shard as usize].as_slice())
    }

    /// Number of open tables in `shard`.
    pub fn table_count(&self, shard: u64) -> usize {
        self.list(shard).len()
    }

    /// Looks `key` up in its shard's tables, newest first. The first table
    /// holding the key decides, tombstones and expired values included.
    pub fn get(&self, key: &[u8], hash: u64) -> Result<Option<Value>> {
        let tables = self.list(memtable::shard(hash, self.shared.num_shards));
        for t in tables.iter().rev() {
            Stats::incr(&self.shared.stats.table_lookups);
            if let Some(val) = t.get(key, hash)? {
                return Ok(Some(val));
            }
        }
        Ok(None)
    }

    /// Registers one temp table per shard (see [`Manifest::append`]) and
    /// opens the new tables.
    ///
    /// Once the manifest is committed every touched shard is reloaded, even
    /// if an earlier one fails; the first reload error is returned after.
    pub fn append(&self, temps: &[Option<String>]) -> Result<()> {
        let mut state = self.shared.state.write();
        if self.is_closed() {
            return Err(GravelError::Closed);
        }
        state.manifest.append(temps)?;
        Stats::add(
            &self.shared.stats.table_builds,
            temps.iter().filter(|t| t.is_some()).count() as u64,
        );

        let mut first_err = None;
        for (shard, temp) in temps.iter().enumerate() {
            if temp.is_none() {
                continue;
            }
            if let Err(e) = reload_shard(&self.shared.dir, &mut state, shard as u64) {
                error!(shard, error = %e, "failed to open appended table");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs one round of worker `worker`'s loop right away: picks its
    /// busiest shard and compacts it if it has enough tables. Returns whether
    /// any tables were merged.
    pub fn invoke_compaction(&self, worker: usize) -> Result<bool> {
        self.shared.invoke_compaction(worker)
    }

    /// Compacts `shard` immediately if it has at least two tables, whatever
    /// the trigger threshold. Returns whether any tables were merged.
    pub fn compact_shard(&self, shard: u64) -> Result<bool> {
        if shard >= self.shared.num_shards {
            return Err(GravelError::manifest(format!("no shard {}", shard)));
        }
        self.shared.compact_shard(shard)
    }

    /// Totals over every open table.
    pub fn stats(&self) -> TableStats {
        let state = self.shared.state.read();
        let mut s = TableStats::default();
        for t in state.tables.iter().flatten() {
            s.tables += 1;
            s.size += t.size();
            s.records += t.num_records();
            s.index_size += t.index_size();
            s.data_reads += t.data_reads();
        }
        s
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.stopped.lock()
    }

    /// Stops and joins the workers, then closes every table. Idempotent.
    pub fn close(&self) -> Result<()> {
        {
            let mut stopped = self.shared.stopped.lock();
            *stopped = true;
            self.shared.wake.notify_all();
        }
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!("compaction worker panicked");
            }
        }
        let mut state = self.shared.state.write();
        close_all(&mut state);
        Ok(())
    }
}

impl Drop for TableManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "closing table manager on drop failed");
        }
    }
}

impl std::fmt::Debug for TableManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableManager")
            .field("dir", &self.shared.dir)
            .field("table_type", &self.shared.table_type)
            .field("num_shards", &self.shared.num_shards)
            .field("workers", &self.shared.num_workers)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Shared {
    fn run_worker(&self, worker: usize) {
        debug!(worker, "compaction worker started");
        loop {
            if *self.stopped.lock() {
                break;
            }
            match self.invoke_compaction(worker) {
                // More may be waiting; go again without sleeping.
                Ok(true) => continue,
                Ok(false) => debug!(worker, "nothing to compact"),
                Err(e) => {
                    Stats::incr(&self.stats.compaction_errors);
                    error!(worker, error = %e, "compaction failed");
                }
            }
            let mut stopped = self.stopped.lock();
            if !*stopped {
                self.wake.wait_for(&mut stopped, self.poll_interval);
            }
            if *stopped {
                break;
            }
        }
        debug!(worker, "compaction worker stopped");
    }

    fn invoke_compaction(&self, worker: usize) -> Result<bool> {
        let n = self.num_workers.max(1) as u64;
        let busiest = {
            let state = self.state.read();
            (0..self.num_shards)
                .filter(|s| s % n == worker as u64)
                .map(|s| (state.tables[s as usize].len(), s))
                .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        };
        match busiest {
            Some((count, shard)) if count >= MIN_FILES_TO_COMPACT => self.compact_shard(shard),
            _ => Ok(false),
        }
    }

    fn compact_shard(&self, shard: u64) -> Result<bool> {
        let shard_bits = memtable::shard_bits(self.num_shards);

        let (ids, merged, is_final) = {
            let state = self.state.read();
            if *self.stopped.lock() {
                return Ok(false);
            }
            let tables = &state.tables[shard as usize];
            let sizes: Vec<u64> = tables.iter().map(|t| t.size()).collect();
            let Some(pick) = pick_tables_to_compact(&sizes) else {
                return Ok(false);
            };
            let window: Vec<&Table> = tables[pick.start..pick.start + pick.len].iter().collect();
            let ids: Vec<u64> = window.iter().map(|t| t.id()).collect();
            let merged = merge_tables(&window, pick.is_final(), memtable::now())?;
            (ids, merged, pick.is_final())
        };

        let temp = write_merged_table(&self.dir, shard, shard_bits, self.table_type, &merged)?;

        let removed = {
            let mut state = self.state.write();
            let replaced = if *self.stopped.lock() {
                Err(GravelError::Closed)
            } else {
                state.manifest.replace(shard, &ids, &temp)
            };
            let (_, removed) = match replaced {
                Ok(r) => r,
                Err(e) => {
                    discard_temp(&self.dir, &temp);
                    return Err(e);
                }
            };
            reload_shard(&self.dir, &mut state, shard)?;
            removed
        };

        for name in &removed {
            if let Err(e) = fs::remove_file(self.dir.join(name)) {
                warn!(file = %name, error = %e, "failed to remove compacted table");
            }
        }
        Stats::incr(&self.stats.compactions);
        info!(shard, inputs = ids.len(), records = merged.len(), compact_to_final = is_final, "compacted shard");
        Ok(true)
    }
}

/// Brings the open tables of `shard` in line with the manifest: opens what
/// is newly listed, closes what is no longer listed, and leaves the rest
/// alone. On error the shard's tables are unchanged.
fn reload_shard(dir: &Path, state: &mut State, shard: u64) -> Result<()> {
    let wanted = state.manifest.table_ids(shard).to_vec();
    let current = &mut state.tables[shard as usize];

    let mut opened: HashMap<u64, Table> = HashMap::new();
    for &id in &wanted {
        if current.iter().any(|t| t.id() == id) {
            continue;
        }
        let name = table::naming::table_file_name(shard, id);
        match open_table(&dir.join(&name)) {
            Ok(t) => {
                opened.insert(id, t);
            }
            Err(e) => {
                for t in opened.values_mut() {
                    if let Err(e) = t.close() {
                        warn!(table = t.name(), error = %e, "failed to close table");
                    }
                }
                return Err(e.into());
            }
        }
    }

    let mut by_id: HashMap<u64, Table> = current.drain(..).map(|t| (t.id(), t)).collect();
    by_id.extend(opened);
    for &id in &wanted {
        if let Some(t) = by_id.remove(&id) {
            current.push(t);
        }
    }
    for (_, mut stale) in by_id {
        if let Err(e) = stale.close() {
            warn!(table = stale.name(), error = %e, "failed to close table");
        }
        debug!(table = stale.name(), "closed table no longer in manifest");
    }
    Ok(())
}

fn close_all(state: &mut State) {
    for t in state.tables.iter_mut().flatten() {
        if let Err(e) = t.close() {
            warn!(table = t.name(), error = %e, "failed to close table");
        }
    }
}

fn discard_temp(dir: &Path, temp: &str) {
    if let Err(e) = fs::remove_file(dir.join(temp)) {
        warn!(file = %temp, error = %e, "failed to remove temp table");
    }
}
