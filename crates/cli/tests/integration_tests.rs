/// End-to-end tests for the gravel-cli REPL: basic ops, batches, flushes,
/// compaction, persistence across restarts, expiry and bad input.
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// Runs the CLI against `dir`, feeds it `commands` followed by EXIT, and
/// returns its stdout.
fn run_cli(dir: &Path, extra_env: &[(&str, &str)], commands: &str) -> String {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_gravel-cli"));
    cmd.env("GRAVEL_DIR", dir.to_str().unwrap())
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in extra_env {
        cmd.env(k, v);
    }
    let mut child = cmd.spawn().expect("failed to spawn gravel-cli");

    {
        let stdin = child.stdin.as_mut().expect("failed to open stdin");
        stdin.write_all(commands.as_bytes()).unwrap();
        stdin.write_all(b"EXIT\n").unwrap();
    }

    let output = child.wait_with_output().expect("failed to read output");
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Output lines with the prompt stripped.
fn responses(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|l| l.trim_start_matches("> ").to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

fn table_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".grvl"))
        .count()
}

#[test]
fn test_basic_set_get() {
    let dir = tempdir().unwrap();
    let out = run_cli(dir.path(), &[], "SET key1 value1\nGET key1\nGET missing\n");
    let lines = responses(&out);

    assert!(lines.contains(&"OK".to_string()));
    assert!(lines.contains(&"value1".to_string()));
    assert!(lines.contains(&"(nil)".to_string()));
    assert!(out.contains("bye"));
}

#[test]
fn test_overwrite_and_delete() {
    let dir = tempdir().unwrap();
    let commands = "SET k old\nSET k new\nGET k\nDEL k\nGET k\n";
    let lines = responses(&run_cli(dir.path(), &[], commands));

    assert!(lines.contains(&"new".to_string()));
    assert!(!lines.contains(&"old".to_string()));
    assert_eq!(lines.iter().filter(|l| *l == "(nil)").count(), 1);
}

#[test]
fn test_data_survives_restart() {
    let dir = tempdir().unwrap();
    run_cli(dir.path(), &[], "SET a 1\nSET b 2\nDEL b\n");
    assert!(dir.path().join("gravel.manifest").exists());
    assert!(table_files(dir.path()) >= 1);

    let lines = responses(&run_cli(dir.path(), &[], "GET a\nGET b\n"));
    assert!(lines.contains(&"1".to_string()));
    assert!(lines.contains(&"(nil)".to_string()));
}

#[test]
fn test_batch_commit_and_discard() {
    let dir = tempdir().unwrap();
    let commands = "BATCH\nSET x 1\nSET y 2\nGET x\nCOMMIT\nGET x\nGET y\n\
                    BATCH\nSET z 3\nDISCARD\nGET z\nCOMMIT\n";
    let lines = responses(&run_cli(dir.path(), &[], commands));

    assert_eq!(lines.iter().filter(|l| *l == "QUEUED").count(), 3);
    assert!(lines.contains(&"OK (2 writes)".to_string()));
    assert!(lines.contains(&"OK (1 writes dropped)".to_string()));
    assert!(lines.contains(&"ERR no open batch".to_string()));
    // x is (nil) before the commit, z never lands
    assert_eq!(lines.iter().filter(|l| *l == "(nil)").count(), 2);
    assert!(lines.contains(&"1".to_string()));
    assert!(lines.contains(&"2".to_string()));
}

#[test]
fn test_small_tables_force_flushes() {
    let dir = tempdir().unwrap();
    let mut commands = String::new();
    for i in 0..200 {
        commands.push_str(&format!("SET key{:03} value{:03}\n", i, i));
    }
    commands.push_str("GET key000\nGET key199\nSTATS\n");

    let out = run_cli(dir.path(), &[("GRAVEL_MAX_TABLE_KB", "1")], &commands);
    let lines = responses(&out);
    assert!(lines.contains(&"value000".to_string()));
    assert!(lines.contains(&"value199".to_string()));
    assert!(table_files(dir.path()) >= 2);

    let stats = lines.iter().find(|l| l.starts_with("gets=")).unwrap();
    assert!(!stats.contains("flushes=0"));
}

#[test]
fn test_flush_and_compact() {
    let dir = tempdir().unwrap();
    let mut commands = String::new();
    for i in 0..5 {
        commands.push_str(&format!("SET k{} v{}\nFLUSH\n", i, i));
    }
    commands.push_str("DEL k0\nFLUSH\nCOMPACT\nGET k0\nGET k4\nCOMPACT 7\nCOMPACT x\n");

    let lines = responses(&run_cli(dir.path(), &[("GRAVEL_SHARDS", "1")], &commands));
    assert!(lines.contains(&"OK (tables=6)".to_string()));
    assert!(lines.iter().any(|l| l.starts_with("OK (1 shards compacted")));
    assert!(lines.contains(&"(nil)".to_string()));
    assert!(lines.contains(&"v4".to_string()));
    assert!(lines.iter().any(|l| l.starts_with("ERR compact failed")));
    assert!(lines.contains(&"ERR usage: COMPACT [shard]".to_string()));
    assert!(table_files(dir.path()) < 6);
}

#[test]
fn test_every_table_type() {
    for table_type in ["hash", "btree", "mph"] {
        let dir = tempdir().unwrap();
        let out = run_cli(
            dir.path(),
            &[("GRAVEL_TABLE_TYPE", table_type), ("GRAVEL_SHARDS", "4")],
            "SET alpha 1\nSET beta 2\nFLUSH\nGET alpha\nGET beta\nGET gamma\n",
        );
        assert!(out.contains(&format!("table_type={}", table_type)));
        let lines = responses(&out);
        assert!(lines.contains(&"1".to_string()), "{}", table_type);
        assert!(lines.contains(&"2".to_string()), "{}", table_type);
        assert!(lines.contains(&"(nil)".to_string()), "{}", table_type);
    }
}

#[test]
fn test_expired_value_reads_nil() {
    let dir = tempdir().unwrap();
    let lines = responses(&run_cli(
        dir.path(),
        &[],
        "SET old v 1\nSET fresh v 4000000000\nGET old\nGET fresh\n",
    ));
    assert!(lines.contains(&"(nil)".to_string()));
    assert!(lines.contains(&"v".to_string()));
}

#[test]
fn test_usage_errors() {
    let dir = tempdir().unwrap();
    let commands = "SET onlykey\nSET k v notanumber\nGET\nDEL\nBATCH\nBATCH\nFROB\n";
    let lines = responses(&run_cli(dir.path(), &[], commands));

    assert_eq!(
        lines.iter().filter(|l| *l == "ERR usage: SET key value [expires]").count(),
        2
    );
    assert!(lines.contains(&"ERR usage: GET key".to_string()));
    assert!(lines.contains(&"ERR usage: DEL key".to_string()));
    assert!(lines.contains(&"ERR batch already open".to_string()));
    assert!(lines.contains(&"unknown command: FROB".to_string()));
}

#[test]
fn test_bad_config_exits_with_error() {
    use std::process::Command;

    let dir = tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_gravel-cli"))
        .env("GRAVEL_DIR", dir.path().to_str().unwrap())
        .env("GRAVEL_SHARDS", "3")
        .output()
        .unwrap();
    assert!(!output.status.success());
}
