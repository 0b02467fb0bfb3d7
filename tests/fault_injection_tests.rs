// Fault Injection Tests for TsunamiDB
// These tests damage on-disk state to check that the engine degrades safely

use std::fs;
use std::io::Write;
use std::time::Duration;
use tempfile::TempDir;
use tsunamidb::{Error, IncRead, IncSaveOptions, Options, DB};

fn options() -> Options {
    let _ = env_logger::builder().is_test(true).try_init();
    Options::default().snapshot_interval(Duration::from_secs(3600))
}

/// A WAL cut in the middle of its last line loses only that line
#[test]
fn test_truncated_wal_tail() {
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), options()).unwrap();
        db.save("t", "key1", b"value1").unwrap();
        db.save("t", "key2", b"value2").unwrap();
        db.close().unwrap();
    }

    let wal = dir.path().join("maps").join("t").join("index.wal");
    let len = fs::metadata(&wal).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&wal).unwrap();
    file.set_len(len - 4).unwrap();

    let db = DB::open(dir.path(), options()).unwrap();
    assert_eq!(db.read("t", "key1").unwrap(), b"value1");
    assert!(db.read("t", "key2").is_err());
}

/// A retired WAL left behind by an interrupted snapshot is replayed
#[test]
fn test_interrupted_rotation_replayed() {
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), options()).unwrap();
        db.save("t", "k", b"before-rotation").unwrap();
        db.close().unwrap();
    }

    let maps = dir.path().join("maps").join("t");
    fs::rename(maps.join("index.wal"), maps.join("index.wal.old")).unwrap();
    fs::write(maps.join("index.wal"), b"").unwrap();

    let db = DB::open(dir.path(), options()).unwrap();
    assert_eq!(db.read("t", "k").unwrap(), b"before-rotation");
    assert!(!maps.join("index.wal.old").exists());
}

/// A corrupted free list disables reuse but never blocks writes
#[test]
fn test_corrupted_free_list() {
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), options()).unwrap();
        db.save("t", "a", b"aaaa").unwrap();
        db.free("t", "a").unwrap();
        db.close().unwrap();
    }
    fs::write(dir.path().join("maps").join("t").join("free_blocks.json"), b"{not json").unwrap();

    let db = DB::open(dir.path(), options()).unwrap();
    db.save("t", "b", b"bbbb").unwrap();
    assert_eq!(db.read("t", "b").unwrap(), b"bbbb");
    // Appended, since the list could not be read.
    assert!(db.locate("t", "b").unwrap().start > 0);
    assert!(matches!(db.free("t", "b"), Err(Error::Serialization(_))));
}

/// A block file shorter than an indexed range yields an error, not garbage
#[test]
fn test_truncated_block_file() {
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), options()).unwrap();
        db.save("t", "k", &[9u8; 64]).unwrap();
        db.close().unwrap();
    }
    let data = dir.path().join("data").join("t");
    fs::OpenOptions::new().write(true).open(&data).unwrap().set_len(10).unwrap();

    let db = DB::open(dir.path(), options()).unwrap();
    assert!(matches!(db.read("t", "k"), Err(Error::Io(_))));
}

/// A misaligned incremental file is padded before the next append
#[test]
fn test_misaligned_incremental_file() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), options()).unwrap();
    let create = || IncSaveOptions::default().max_entry_size(13);
    db.save_incremental("t", "log", b"first", create()).unwrap();

    let path = dir.path().join("inc_tables").join("t__log.tbl");
    fs::OpenOptions::new().append(true).open(&path).unwrap().write_all(&[0, 0, 0]).unwrap();

    let id = db.save_incremental("t", "log", b"second", create()).unwrap().id;
    assert_eq!(id, 2);
    assert_eq!(fs::metadata(&path).unwrap().len(), 3 * 16);

    let last = db.read_incremental("t", "log", IncRead::ById(2)).unwrap();
    assert_eq!(last[0].data, b"second");
}

/// A corrupted entry-key index is reported on by-key reads
#[test]
fn test_corrupted_entry_key_index() {
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), options()).unwrap();
        let opts = IncSaveOptions::default().max_entry_size(8).entry_key("k");
        db.save_incremental("t", "log", b"x", opts).unwrap();
        db.close().unwrap();
    }
    fs::write(dir.path().join("inc_tables").join("t__log.tbl.idx"), b"[").unwrap();

    let db = DB::open(dir.path(), options()).unwrap();
    assert!(matches!(
        db.read_incremental("t", "log", IncRead::ByKey("k".into())),
        Err(Error::Serialization(_))
    ));
    // Row access does not depend on the index.
    assert_eq!(db.read_incremental("t", "log", IncRead::ById(0)).unwrap()[0].data, b"x");
}

/// Test handling of a read-only root (permission error simulation)
#[test]
#[cfg(unix)]
fn test_readonly_directory_handling() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let root = dir.path().join("ro");
    fs::create_dir(&root).unwrap();

    let mut perms = fs::metadata(&root).unwrap().permissions();
    perms.set_mode(0o555);
    fs::set_permissions(&root, perms.clone()).unwrap();

    let result = DB::open(&root, options());

    perms.set_mode(0o755);
    fs::set_permissions(&root, perms).unwrap();

    // Root may bypass permissions; otherwise creating the layout fails.
    if let Err(e) = result {
        assert!(matches!(e, Error::Io(_)));
    }
}

/// Rapid open/close cycles release workers and background threads
#[test]
fn test_rapid_open_close() {
    let dir = TempDir::new().unwrap();
    for i in 0..20 {
        let db = DB::open(dir.path(), options()).unwrap();
        db.save("t", &format!("k{}", i), b"v").unwrap();
        db.close().unwrap();
    }

    let db = DB::open(dir.path(), options()).unwrap();
    assert_eq!(db.keys_by_regex("t", "^k", 0).unwrap().len(), 20);
}
