// Stress Tests for TsunamiDB
// These tests are marked with #[ignore] and are intended to be run manually
// Run with: cargo test --release -- --ignored --nocapture

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tsunamidb::{IncSaveOptions, Options, DB};

/// High-frequency save stress test across several tables
#[test]
#[ignore]
fn stress_high_frequency_saves() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(DB::open(dir.path(), Options::default()).unwrap());

    let duration = Duration::from_secs(30);
    let start = Instant::now();
    let operations = Arc::new(AtomicUsize::new(0));
    let stop_flag = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..8)
        .map(|thread_id| {
            let db = Arc::clone(&db);
            let ops = Arc::clone(&operations);
            let stop = Arc::clone(&stop_flag);
            thread::spawn(move || {
                let table = format!("table_{}", thread_id % 4);
                let mut local_ops = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let key = format!("stress_key_{}_{}", thread_id, local_ops);
                    if db.save(&table, &key, format!("value_{}", local_ops).as_bytes()).is_ok() {
                        local_ops += 1;
                        ops.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    thread::sleep(duration);
    stop_flag.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }

    let elapsed = start.elapsed();
    let total_ops = operations.load(Ordering::Relaxed);
    println!("=== High-Frequency Save Stress Test ===");
    println!("Duration: {:.2}s", elapsed.as_secs_f64());
    println!("Total operations: {}", total_ops);
    println!("Throughput: {:.0} ops/s", total_ops as f64 / elapsed.as_secs_f64());
    println!("Stats: {:?}", db.stats());
}

/// Churn on a fixed key set: the block file must stop growing once space is recycled
#[test]
#[ignore]
fn stress_space_reuse() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), Options::default()).unwrap();
    let data = dir.path().join("data").join("churn");

    for i in 0..1000 {
        db.save("churn", &format!("k{}", i), &[0u8; 128]).unwrap();
    }
    let baseline = std::fs::metadata(&data).unwrap().len();

    for round in 0..50u8 {
        for i in 0..1000 {
            let key = format!("k{}", i);
            db.free("churn", &key).unwrap();
            db.save("churn", &key, &[round; 128]).unwrap();
        }
    }

    let size = std::fs::metadata(&data).unwrap().len();
    println!("Baseline {} bytes, after churn {} bytes", baseline, size);
    assert_eq!(size, baseline);
    assert_eq!(db.read("churn", "k0").unwrap(), vec![49u8; 128]);
}

/// Mixed plain and incremental workload with periodic snapshots
#[test]
#[ignore]
fn stress_mixed_workload() {
    let dir = TempDir::new().unwrap();
    let options = Options::default().snapshot_interval(Duration::from_secs(1));
    let db = Arc::new(DB::open(dir.path(), options).unwrap());
    db.save_incremental("feed", "events", b"seed", IncSaveOptions::default().max_entry_size(64))
        .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|thread_id| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..5_000 {
                    let key = format!("m{}_{}", thread_id, i % 100);
                    match i % 4 {
                        0 => db.save("mixed", &key, format!("v{}", i).as_bytes()).unwrap(),
                        1 => {
                            let _ = db.read("mixed", &key);
                        }
                        2 => {
                            let _ = db.free("mixed", &key);
                        }
                        _ => {
                            let body = format!("{}:{}", thread_id, i);
                            db.save_incremental("feed", "events", body.as_bytes(), IncSaveOptions::default())
                                .unwrap();
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    println!("Stats: {:?}", db.stats());
}
