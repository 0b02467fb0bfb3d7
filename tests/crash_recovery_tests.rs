// Crash Recovery Tests for TsunamiDB
// These tests verify the key index after simulated crashes

use std::collections::HashMap;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use tsunamidb::{IndexEntry, Options, DB};

fn options() -> Options {
    let _ = env_logger::builder().is_test(true).try_init();
    Options::default().snapshot_interval(Duration::from_secs(3600))
}

/// Simulates a crash by skipping Drop (no clean shutdown)
fn simulate_crash(db: DB) {
    std::mem::forget(db);
}

/// Test recovery of WAL-only state
#[test]
fn test_recovery_from_wal() {
    let dir = TempDir::new().unwrap();

    {
        let db = DB::open(dir.path(), options()).unwrap();
        for i in 0..100 {
            db.save("t", &format!("key_{}", i), format!("value_{}", i).as_bytes()).unwrap();
        }
        db.flush_wal().unwrap();
        simulate_crash(db);
    }

    let db = DB::open(dir.path(), options()).unwrap();
    for i in 0..100 {
        assert_eq!(
            db.read("t", &format!("key_{}", i)).unwrap(),
            format!("value_{}", i).as_bytes(),
            "key_{} should be recovered after crash",
            i
        );
    }
}

/// Interleaved saves and frees, a snapshot, more changes, then a crash
#[test]
fn test_recovery_snapshot_plus_wal() {
    let dir = TempDir::new().unwrap();
    let mut expected: HashMap<String, IndexEntry> = HashMap::new();

    {
        let db = DB::open(dir.path(), options()).unwrap();
        for i in 0..60 {
            let key = format!("k{}", i % 20);
            if i % 7 == 3 && expected.contains_key(&key) {
                db.free("t", &key).unwrap();
                expected.remove(&key);
            } else {
                db.save("t", &key, format!("payload-{}", i).as_bytes()).unwrap();
                expected.insert(key.clone(), db.locate("t", &key).unwrap());
            }
            if i == 30 {
                db.snapshot().unwrap();
            }
        }
        db.flush_wal().unwrap();
        simulate_crash(db);
    }

    let db = DB::open(dir.path(), options()).unwrap();
    for i in 0..20 {
        let key = format!("k{}", i);
        match expected.get(&key) {
            Some(entry) => assert_eq!(&db.locate("t", &key).unwrap(), entry, "{}", key),
            None => assert!(db.locate("t", &key).unwrap_err().is_not_found(), "{}", key),
        }
    }
    assert_eq!(db.stats().index.keys, expected.len());
}

/// A snapshot alone restores everything written before it
#[test]
fn test_recovery_after_snapshot() {
    let dir = TempDir::new().unwrap();

    {
        let db = DB::open(dir.path(), options()).unwrap();
        for i in 0..50 {
            db.save("t", &format!("s{}", i), b"stable").unwrap();
        }
        db.snapshot().unwrap();
        simulate_crash(db);
    }

    let snap = dir.path().join("maps").join("t").join("index.snap");
    assert!(snap.exists());
    assert!(!dir.path().join("maps").join("t").join("index.wal.old").exists());

    let db = DB::open(dir.path(), options()).unwrap();
    for i in 0..50 {
        assert_eq!(db.read("t", &format!("s{}", i)).unwrap(), b"stable");
    }
}

/// Garbage appended to the WAL is skipped, not fatal
#[test]
fn test_recovery_skips_malformed_wal_lines() {
    let dir = TempDir::new().unwrap();

    {
        let db = DB::open(dir.path(), options()).unwrap();
        db.save("t", "good", b"ok").unwrap();
        db.close().unwrap();
    }

    let wal = dir.path().join("maps").join("t").join("index.wal");
    let mut contents = fs::read_to_string(&wal).unwrap();
    contents.push_str("this is not a record\nS|half|t|1\n");
    fs::write(&wal, contents).unwrap();

    let db = DB::open(dir.path(), options()).unwrap();
    assert_eq!(db.read("t", "good").unwrap(), b"ok");
    assert!(db.locate("t", "half").is_err());
}

/// Multiple crash and recover cycles
#[test]
fn test_multiple_crash_cycles() {
    let dir = TempDir::new().unwrap();

    for cycle in 0..3 {
        let db = DB::open(dir.path(), options()).unwrap();
        for prev in 0..cycle {
            assert_eq!(
                db.read("t", &format!("cycle_{}", prev)).unwrap(),
                format!("data_{}", prev).as_bytes()
            );
        }
        db.save("t", &format!("cycle_{}", cycle), format!("data_{}", cycle).as_bytes()).unwrap();
        if cycle == 1 {
            db.snapshot().unwrap();
        }
        db.flush_wal().unwrap();
        simulate_crash(db);
    }
}

/// Incremental tables survive a crash: their descriptor lives in the key index
#[test]
fn test_incremental_table_after_crash() {
    use tsunamidb::{IncRead, IncSaveOptions};
    let dir = TempDir::new().unwrap();

    {
        let db = DB::open(dir.path(), options()).unwrap();
        for i in 0..5 {
            let opts = IncSaveOptions::default().max_entry_size(16);
            db.save_incremental("log", "events", format!("e{}", i).as_bytes(), opts).unwrap();
        }
        db.flush_wal().unwrap();
        simulate_crash(db);
    }

    let db = DB::open(dir.path(), options()).unwrap();
    let entries = db.read_incremental("log", "events", IncRead::First(10)).unwrap();
    let data: Vec<_> = entries.iter().map(|e| e.data.clone()).collect();
    assert_eq!(data, vec![b"e0".to_vec(), b"e1".to_vec(), b"e2".to_vec(), b"e3".to_vec(), b"e4".to_vec()]);
}
