//! # Crash Simulation Tests
//!
//! A commit writes data pages first and the master page last. These tests
//! reconstruct the on-disk state of a crash in between — data pages
//! written, master page still the old one — and verify that reopening
//! recovers the previous committed snapshot exactly.

use dungeondb::KvStore;

const PAGE_SIZE: usize = 4096;

fn temp_db(name: &str) -> std::path::PathBuf {
    let dir = tempfile::tempdir().unwrap();
    dir.keep().join(name)
}

/// Overwrites page 0 with `old_master` and truncates the file back to
/// `old_len`, emulating a crash after the data sync but before the
/// master-page write of the following commit.
fn rewind_master(path: &std::path::Path, old_master: &[u8], old_len: usize) {
    let mut bytes = std::fs::read(path).unwrap();
    bytes[..PAGE_SIZE].copy_from_slice(&old_master[..PAGE_SIZE]);
    bytes.truncate(old_len);
    std::fs::write(path, &bytes).unwrap();
}

#[test]
fn crash_before_master_write_keeps_previous_snapshot() {
    let path = temp_db("crash.db");
    {
        let mut kv = KvStore::open(&path).unwrap();
        for i in 0..30u32 {
            let key = format!("stable{:03}", i);
            kv.set(key.as_bytes(), b"committed").unwrap();
        }
        kv.close().unwrap();
    }
    let committed = std::fs::read(&path).unwrap();

    {
        let mut kv = KvStore::open(&path).unwrap();
        kv.set(b"late-key", b"lost").unwrap();
        kv.set(b"stable000", b"overwritten").unwrap();
        kv.close().unwrap();
    }
    rewind_master(&path, &committed, committed.len());

    let kv = KvStore::open(&path).unwrap();

    for i in 0..30u32 {
        let key = format!("stable{:03}", i);
        assert_eq!(
            kv.get(key.as_bytes()).unwrap(),
            Some(b"committed".to_vec()),
            "lost committed key {}",
            key
        );
    }
    assert_eq!(kv.get(b"late-key").unwrap(), None, "uncommitted key leaked in");
}

#[test]
fn crash_rollback_leaves_a_writable_database() {
    let path = temp_db("crash_write.db");
    {
        let mut kv = KvStore::open(&path).unwrap();
        kv.set(b"base", b"1").unwrap();
        kv.close().unwrap();
    }
    let committed = std::fs::read(&path).unwrap();

    {
        let mut kv = KvStore::open(&path).unwrap();
        for i in 0..20u32 {
            kv.set(format!("burst{}", i).as_bytes(), b"x").unwrap();
        }
        kv.close().unwrap();
    }
    rewind_master(&path, &committed, committed.len());

    // The rewound database must accept and persist new commits.
    {
        let mut kv = KvStore::open(&path).unwrap();
        assert_eq!(kv.get(b"base").unwrap(), Some(b"1".to_vec()));
        kv.set(b"after-crash", b"2").unwrap();
        kv.close().unwrap();
    }

    let kv = KvStore::open(&path).unwrap();
    assert_eq!(kv.get(b"base").unwrap(), Some(b"1".to_vec()));
    assert_eq!(kv.get(b"after-crash").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn repeated_crashes_never_corrupt_the_committed_state() {
    let path = temp_db("crash_loop.db");
    {
        let mut kv = KvStore::open(&path).unwrap();
        for i in 0..10u32 {
            kv.set(format!("k{}", i).as_bytes(), b"v0").unwrap();
        }
        kv.close().unwrap();
    }

    for round in 1..5u32 {
        let committed = std::fs::read(&path).unwrap();
        {
            let mut kv = KvStore::open(&path).unwrap();
            for i in 0..10u32 {
                let val = format!("v{}", round);
                kv.set(format!("k{}", i).as_bytes(), val.as_bytes()).unwrap();
            }
            kv.close().unwrap();
        }
        rewind_master(&path, &committed, committed.len());

        let kv = KvStore::open(&path).unwrap();
        for i in 0..10u32 {
            assert_eq!(
                kv.get(format!("k{}", i).as_bytes()).unwrap(),
                Some(b"v0".to_vec()),
                "round {} corrupted key k{}",
                round,
                i
            );
        }
    }
}
