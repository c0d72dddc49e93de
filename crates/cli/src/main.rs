//! # CLI - Gravel Interactive Shell
//!
//! A REPL over one Gravel engine. Reads commands from stdin, runs each as
//! its own batch (or read), and prints results to stdout. Works both
//! interactively and with commands piped in.
//!
//! ## Commands
//!
//! ```text
//! SET key value [expires]  Store a value; expires is absolute Unix seconds
//! GET key                  Print the value or "(nil)"
//! DEL key                  Delete a key
//! BATCH                    Start collecting SET/DEL into one batch
//! COMMIT / DISCARD         Apply or drop the open batch
//! FLUSH                    Persist the memtable as tables
//! COMPACT [shard]          Compact one shard (default: all)
//! STATS                    Print engine counters
//! EXIT / QUIT              Close the engine and stop
//! ```
//!
//! ## Configuration
//!
//! ```text
//! GRAVEL_DIR           engine directory            (default: "gravel")
//! GRAVEL_MAX_TABLE_KB  max memtable size in KiB    (default: 65536)
//! GRAVEL_SHARDS        shard count, power of two   (default: 1)
//! GRAVEL_TABLE_TYPE    hash | btree | mph          (default: hash)
//! GRAVEL_REPORT_STATS  log stats periodically      (default: false)
//! RUST_LOG             log filter, logs go to stderr (default: info)
//! ```
//!
//! ## Example
//!
//! ```text
//! $ GRAVEL_DIR=/tmp/g cargo run -p cli
//! gravel started (dir=/tmp/g, shards=1, table_type=hash, max_table=65536KiB)
//! > SET name Alice
//! OK
//! > GET name
//! Alice
//! > EXIT
//! bye
//! ```
use std::io::{self, BufRead, Write};

use anyhow::Result;
use config::Options;
use gravel::{Batch, Gravel};
use tracing_subscriber::EnvFilter;

/// Writes queued by `BATCH` until `COMMIT` or `DISCARD`.
#[derive(Default)]
struct Pending {
    ops: Vec<Op>,
    open: bool,
}

enum Op {
    Set(String, String, u32),
    Del(String),
}

impl Op {
    fn apply(&self, batch: &mut Batch<'_>) -> gravel::Result<()> {
        match self {
            Op::Set(k, v, expires) => batch.set(k.as_str(), v.as_str(), *expires),
            Op::Del(k) => batch.del(k.as_str()),
        }
    }
}

fn commit(db: &Gravel, ops: &[Op]) -> gravel::Result<()> {
    let mut batch = db.new_batch();
    for op in ops {
        op.apply(&mut batch)?;
    }
    batch.commit()
}

/// Applies `op` now, or queues it if a batch is open.
fn run_op(db: &Gravel, pending: &mut Pending, op: Op) {
    if pending.open {
        pending.ops.push(op);
        println!("QUEUED");
        return;
    }
    match commit(db, &[op]) {
        Ok(()) => println!("OK"),
        Err(e) => println!("ERR {}", e),
    }
}

fn parse_set<'a>(mut parts: impl Iterator<Item = &'a str>) -> Option<Op> {
    let key = parts.next()?;
    let value = parts.next()?;
    let expires = match parts.next() {
        Some(t) => t.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(Op::Set(key.to_string(), value.to_string(), expires))
}

/// Compacts `arg` (a shard number) or every shard, and describes the outcome.
fn compact(db: &Gravel, arg: Option<&str>) -> String {
    let shards: Vec<u64> = match arg.map(str::parse::<u64>) {
        Some(Ok(s)) => vec![s],
        Some(Err(_)) => return "ERR usage: COMPACT [shard]".to_string(),
        None => (0..db.num_shards()).collect(),
    };
    let mut merged = 0;
    for shard in shards {
        match db.compact(shard) {
            Ok(true) => merged += 1,
            Ok(false) => {}
            Err(e) => return format!("ERR compact failed: {}", e),
        }
    }
    format!("OK ({} shards compacted, tables={})", merged, db.stats().tables.tables)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let opts = Options::from_env()?;
    let db = Gravel::open(opts)?;

    println!(
        "gravel started (dir={}, shards={}, table_type={}, max_table={}KiB)",
        db.dir().display(),
        db.num_shards(),
        db.options().table_type,
        db.options().max_table_size / 1024
    );
    println!("Commands: SET key value [expires] | GET key | DEL key");
    println!("          BATCH | COMMIT | DISCARD | FLUSH | COMPACT [shard] | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let mut pending = Pending::default();
    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        if let Some(cmd) = parts.next() {
            match cmd.to_uppercase().as_str() {
                "SET" => match parse_set(parts) {
                    Some(op) => run_op(&db, &mut pending, op),
                    None => println!("ERR usage: SET key value [expires]"),
                },
                "GET" => match parts.next() {
                    Some(k) => match db.get(k.as_bytes()) {
                        Ok(Some(v)) => println!("{}", String::from_utf8_lossy(&v)),
                        Ok(None) => println!("(nil)"),
                        Err(e) => println!("ERR read failed: {}", e),
                    },
                    None => println!("ERR usage: GET key"),
                },
                "DEL" => match parts.next() {
                    Some(k) => run_op(&db, &mut pending, Op::Del(k.to_string())),
                    None => println!("ERR usage: DEL key"),
                },
                "BATCH" => {
                    if pending.open {
                        println!("ERR batch already open");
                    } else {
                        pending.open = true;
                        println!("OK");
                    }
                }
                "COMMIT" => {
                    if !pending.open {
                        println!("ERR no open batch");
                    } else {
                        let ops = std::mem::take(&mut pending).ops;
                        match commit(&db, &ops) {
                            Ok(()) => println!("OK ({} writes)", ops.len()),
                            Err(e) => println!("ERR {}", e),
                        }
                    }
                }
                "DISCARD" => {
                    if !pending.open {
                        println!("ERR no open batch");
                    } else {
                        let dropped = std::mem::take(&mut pending).ops.len();
                        println!("OK ({} writes dropped)", dropped);
                    }
                }
                "FLUSH" => match db.flush() {
                    Ok(()) => println!("OK (tables={})", db.stats().tables.tables),
                    Err(e) => println!("ERR flush failed: {}", e),
                },
                "COMPACT" => println!("{}", compact(&db, parts.next())),
                "STATS" => {
                    let s = db.stats();
                    println!(
                        "gets={} misses={} sets={} dels={} commits={} flushes={} compactions={}",
                        s.gets, s.misses, s.sets, s.dels, s.commits, s.flushes, s.compactions
                    );
                    println!(
                        "memtable_keys={} memtable_size={} tables={} records={} table_size={} generation={}",
                        s.memtable_keys,
                        s.memtable_size,
                        s.tables.tables,
                        s.tables.records,
                        s.tables.size,
                        s.manifest_generation
                    );
                }
                "EXIT" | "QUIT" => {
                    println!("bye");
                    break;
                }
                other => {
                    println!("unknown command: {}", other);
                }
            }
        }

        print!("> ");
        io::stdout().flush().ok();
    }

    if pending.open && !pending.ops.is_empty() {
        println!("discarding {} uncommitted writes", pending.ops.len());
    }
    db.close()?;
    Ok(())
}
