//! # Manifest - the ledger of live tables
//!
//! Records, per shard, which table files make up the live dataset. A `.grvl`
//! file that is not listed here is an orphan.
//!
//! ## File Format
//!
//! ```text
//! 1                                     codec
//! 4                                     shard count
//! 0_200000.grvl,0_100000.grvl           shard 0, most recent first
//!                                       shard 1, no tables
//! 2_100000.grvl                         shard 2
//!                                       shard 3
//! ```
//!
//! ## Crash Safety
//!
//! Every update writes the whole manifest to `gravel.manifest.tmp`, fsyncs
//! it, then renames it over `gravel.manifest`. A crash leaves either the old
//! or the new generation in place. New table files are renamed to their
//! final name *before* the manifest that lists them is committed; if the
//! commit never happens they are orphans and get removed by [`Manifest::clean`].
//!
//! ## Table IDs
//!
//! IDs grow with recency within a shard. A flushed table gets the next
//! multiple of [`ID_GAP`] above the shard's newest ID, which leaves room for
//! a compacted table to take `max(replaced) + 1` and still sort between its
//! inputs and anything newer.
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use table::naming::{
    is_table_file, is_temp_file, parse_table_file_name, parse_temp_file_name, table_file_name,
};
use tracing::{debug, info, warn};

use crate::error::{GravelError, Result};

/// Name of the manifest file within the engine directory.
pub const MANIFEST_FILENAME: &str = "gravel.manifest";

/// Temporary file used during atomic manifest writes.
pub(crate) const MANIFEST_TMP_FILENAME: &str = "gravel.manifest.tmp";

const MANIFEST_CODEC: &str = "1";

/// Distance between the IDs of consecutive flushed tables of a shard.
pub const ID_GAP: u64 = 100_000;

/// In-memory copy of the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    dir: PathBuf,
    num_shards: u64,
    /// Table IDs per shard, oldest first.
    shards: Vec<Vec<u64>>,
    /// Successful updates since this instance was loaded.
    generation: u64,
}

impl Manifest {
    /// Loads `dir/gravel.manifest`, or creates an empty manifest with
    /// `num_shards` shards if there is none.
    ///
    /// An existing manifest keeps the shard count it was written with.
    ///
    /// # Errors
    ///
    /// [`GravelError::InvalidShards`] for a bad shard count,
    /// [`GravelError::Manifest`] if the file cannot be parsed.
    pub fn load_or_create(dir: &Path, num_shards: u64) -> Result<Self> {
        let path = dir.join(MANIFEST_FILENAME);
        if !path.exists() {
            validate_shards(num_shards)?;
            let m = Self {
                dir: dir.to_path_buf(),
                num_shards,
                shards: vec![Vec::new(); num_shards as usize],
                generation: 0,
            };
            m.save()?;
            info!(dir = %dir.display(), num_shards, "created manifest");
            return Ok(m);
        }

        let text = fs::read_to_string(&path)?;
        let m = Self::parse(dir, &text)?;
        if m.num_shards != num_shards {
            warn!(
                requested = num_shards,
                manifest = m.num_shards,
                "shard count differs from existing manifest; keeping the manifest's"
            );
        }
        info!(
            dir = %dir.display(),
            num_shards = m.num_shards,
            tables = m.shards.iter().map(Vec::len).sum::<usize>(),
            "loaded manifest"
        );
        Ok(m)
    }

    /// Parses manifest text. Every listed name must be a table file of the
    /// shard it is listed under, and no name may appear twice.
    pub fn parse(dir: &Path, text: &str) -> Result<Self> {
        let mut lines = text.lines();

        let codec = lines.next().map(str::trim);
        if codec != Some(MANIFEST_CODEC) {
            return Err(GravelError::manifest(format!("unsupported codec line {:?}", codec)));
        }
        let num_shards: u64 = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| GravelError::manifest("missing or invalid shard count line"))?;
        validate_shards(num_shards)?;

        let mut seen = HashSet::new();
        let mut shards = Vec::with_capacity(num_shards as usize);
        for shard in 0..num_shards {
            let line = lines.next().unwrap_or("").trim();
            let mut ids = Vec::new();
            for name in line.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                let (file_shard, id) = parse_table_file_name(name)
                    .map_err(|e| GravelError::manifest(format!("shard {}: {}", shard, e)))?;
                if file_shard != shard {
                    return Err(GravelError::manifest(format!(
                        "{} listed under shard {}",
                        name, shard
                    )));
                }
                if !seen.insert(name.to_string()) {
                    return Err(GravelError::manifest(format!("{} listed twice", name)));
                }
                ids.push(id);
            }
            ids.sort_unstable();
            shards.push(ids);
        }
        if let Some(extra) = lines.find(|l| !l.trim().is_empty()) {
            return Err(GravelError::manifest(format!("unexpected line {:?}", extra)));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            num_shards,
            shards,
            generation: 0,
        })
    }

    /// Serialized form, most recent table first on each shard line.
    pub fn render(&self) -> String {
        let mut out = format!("{}\n{}\n", MANIFEST_CODEC, self.num_shards);
        for (shard, ids) in self.shards.iter().enumerate() {
            let names: Vec<String> = ids
                .iter()
                .rev()
                .map(|id| table_file_name(shard as u64, *id))
                .collect();
            out.push_str(&names.join(","));
            out.push('\n');
        }
        out
    }

    pub fn num_shards(&self) -> u64 {
        self.num_shards
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// IDs of the live tables of `shard`, oldest first.
    pub fn table_ids(&self, shard: u64) -> &[u64] {
        &self.shards[shard as usize]
    }

    /// File names of the live tables of `shard`, oldest first.
    pub fn table_files(&self, shard: u64) -> Vec<String> {
        self.table_ids(shard)
            .iter()
            .map(|id| table_file_name(shard, *id))
            .collect()
    }

    /// ID the next flushed table of `shard` gets.
    pub fn next_id(&self, shard: u64) -> u64 {
        let newest = self.table_ids(shard).last().copied().unwrap_or(0);
        (newest / ID_GAP + 1) * ID_GAP
    }

    /// Registers one freshly built temp table per shard (`None` for shards
    /// that got nothing), renaming each to its final name, and commits a new
    /// generation. Returns the final names of the added tables.
    ///
    /// # Errors
    ///
    /// [`GravelError::Manifest`] if `temps` does not have one slot per shard
    /// or a temp file belongs to another shard; any I/O error. On error the
    /// in-memory manifest is unchanged.
    pub fn append(&mut self, temps: &[Option<String>]) -> Result<Vec<String>> {
        let mut next = self.clone();
        let added = next.stage_append(temps)?;
        next.save()?;
        next.generation += 1;
        *self = next;
        debug!(generation = self.generation, added = ?added, "manifest append");
        Ok(added)
    }

    pub(crate) fn stage_append(&mut self, temps: &[Option<String>]) -> Result<Vec<String>> {
        if temps.len() as u64 != self.num_shards {
            return Err(GravelError::manifest(format!(
                "append of {} files to {} shards",
                temps.len(),
                self.num_shards
            )));
        }
        let mut added = Vec::new();
        for (shard, temp) in temps.iter().enumerate() {
            let Some(temp) = temp else { continue };
            let shard = shard as u64;
            self.check_temp(temp, shard)?;
            let id = self.next_id(shard);
            let name = table_file_name(shard, id);
            fs::rename(self.dir.join(temp), self.dir.join(&name))?;
            self.shards[shard as usize].push(id);
            added.push(name);
        }
        Ok(added)
    }

    /// Swaps the tables `old_ids` of `shard` for the compacted temp table
    /// `new_temp`, in one generation. The new table takes ID
    /// `max(old_ids) + 1`. Returns its name and the names of the files that
    /// left the manifest; deleting those is up to the caller.
    ///
    /// # Errors
    ///
    /// [`GravelError::Manifest`] if `old_ids` is empty, not a consecutive run
    /// of the shard's tables, or the new ID is taken. On error the in-memory
    /// manifest is unchanged and `new_temp` is left where it is.
    pub fn replace(&mut self, shard: u64, old_ids: &[u64], new_temp: &str) -> Result<(String, Vec<String>)> {
        if shard >= self.num_shards {
            return Err(GravelError::manifest(format!("no shard {}", shard)));
        }
        self.check_temp(new_temp, shard)?;

        let ids = &self.shards[shard as usize];
        let start = old_ids
            .first()
            .and_then(|first| ids.iter().position(|id| id == first))
            .ok_or_else(|| GravelError::manifest(format!("shard {}: replaced tables not found", shard)))?;
        if ids.get(start..start + old_ids.len()) != Some(old_ids) {
            return Err(GravelError::manifest(format!(
                "shard {}: replaced tables {:?} are not a consecutive run",
                shard, old_ids
            )));
        }
        let new_id = old_ids.iter().max().copied().unwrap_or(0) + 1;
        if ids.contains(&new_id) {
            return Err(GravelError::manifest(format!(
                "shard {}: compacted table id {} is taken",
                shard, new_id
            )));
        }

        let mut next = self.clone();
        let name = table_file_name(shard, new_id);
        let shard_ids = &mut next.shards[shard as usize];
        let newer = shard_ids.split_off(start + old_ids.len());
        shard_ids.truncate(start);
        shard_ids.push(new_id);
        shard_ids.extend(newer);
        fs::rename(self.dir.join(new_temp), self.dir.join(&name))?;
        next.save()?;
        next.generation += 1;
        *self = next;

        let removed: Vec<String> = old_ids.iter().map(|id| table_file_name(shard, *id)).collect();
        debug!(generation = self.generation, shard, added = %name, removed = ?removed, "manifest replace");
        Ok((name, removed))
    }

    fn check_temp(&self, temp: &str, shard: u64) -> Result<()> {
        let temp_shard =
            parse_temp_file_name(temp).map_err(|e| GravelError::manifest(e.to_string()))?;
        if temp_shard != shard {
            return Err(GravelError::manifest(format!(
                "{} does not belong to shard {}",
                temp, shard
            )));
        }
        Ok(())
    }

    /// Writes and fsyncs the temporary manifest without committing it.
    pub(crate) fn write_tmp(&self) -> Result<PathBuf> {
        let tmp_path = self.dir.join(MANIFEST_TMP_FILENAME);
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        f.write_all(self.render().as_bytes())?;
        f.flush()?;
        f.sync_all()?;
        Ok(tmp_path)
    }

    /// Atomically replaces the manifest with the temporary one.
    pub(crate) fn commit_tmp(&self, tmp_path: &Path) -> Result<()> {
        fs::rename(tmp_path, self.dir.join(MANIFEST_FILENAME))?;
        sync_dir(&self.dir);
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let tmp = self.write_tmp()?;
        self.commit_tmp(&tmp)
    }

    /// Removes what a crash can leave behind: the temporary manifest, temp
    /// tables, and table files the manifest does not list. Returns the
    /// number of files removed.
    pub fn clean(&self) -> Result<usize> {
        let live: HashSet<String> = (0..self.num_shards).flat_map(|s| self.table_files(s)).collect();
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let orphan = name == MANIFEST_TMP_FILENAME
                || is_temp_file(&name)
                || (is_table_file(&name) && !live.contains(&name));
            if !orphan {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    info!(file = %name, "removed orphaned file");
                    removed += 1;
                }
                Err(e) => warn!(file = %name, error = %e, "failed to remove orphaned file"),
            }
        }
        Ok(removed)
    }
}

fn validate_shards(num_shards: u64) -> Result<()> {
    config::validate_shards(num_shards).map_err(|_| GravelError::InvalidShards(num_shards))
}

/// Makes a rename durable. Best effort.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
