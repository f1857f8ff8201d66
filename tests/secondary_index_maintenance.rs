//! # Secondary Index Maintenance Tests
//!
//! Index entries must track their rows through inserts, updates, and
//! deletes, and survive reopen. Scanning by an indexed column must never
//! surface a deleted row or a stale value.

use dungeondb::{Cmp, Database, Record, ScanRequest, TableDef, Value, ValueType};

fn temp_db(name: &str) -> std::path::PathBuf {
    let dir = tempfile::tempdir().unwrap();
    dir.keep().join(name)
}

fn users_def() -> TableDef {
    TableDef {
        name: "users".to_string(),
        types: vec![ValueType::Int64, ValueType::Bytes],
        cols: vec!["id".to_string(), "name".to_string()],
        pkeys: 1,
        indexes: vec![vec!["name".to_string()]],
        prefix: 0,
        index_prefixes: Vec::new(),
    }
}

fn scan_by_name(db: &mut Database, lo: &str, hi: &str) -> Vec<(i64, String)> {
    let req = ScanRequest {
        cmp1: Cmp::Ge,
        cmp2: Cmp::Le,
        key1: Record::new().add_bytes("name", lo),
        key2: Record::new().add_bytes("name", hi),
    };
    let rows = db.scan("users", req).unwrap().collect_rows().unwrap();
    rows.iter()
        .map(|r| {
            (
                r.get("id").and_then(Value::as_int64).unwrap(),
                String::from_utf8(r.get("name").and_then(Value::as_bytes).unwrap().to_vec())
                    .unwrap(),
            )
        })
        .collect()
}

#[test]
fn delete_removes_index_entries() {
    let mut db = Database::open(temp_db("del.db")).unwrap();
    db.table_new(users_def()).unwrap();
    db.insert(
        "users",
        &Record::new().add_int64("id", 1).add_bytes("name", "bob"),
    )
    .unwrap();
    db.insert(
        "users",
        &Record::new().add_int64("id", 2).add_bytes("name", "ann"),
    )
    .unwrap();

    assert!(db
        .delete("users", &Record::new().add_int64("id", 1))
        .unwrap());

    let found = scan_by_name(&mut db, "a", "z");
    assert_eq!(found, vec![(2, "ann".to_string())]);
}

#[test]
fn update_moves_the_index_entry() {
    let mut db = Database::open(temp_db("upd.db")).unwrap();
    db.table_new(users_def()).unwrap();
    db.insert(
        "users",
        &Record::new().add_int64("id", 1).add_bytes("name", "old-name"),
    )
    .unwrap();

    db.update(
        "users",
        &Record::new().add_int64("id", 1).add_bytes("name", "new-name"),
    )
    .unwrap();

    assert!(scan_by_name(&mut db, "old-", "old-zzz").is_empty());
    assert_eq!(
        scan_by_name(&mut db, "new-", "new-zzz"),
        vec![(1, "new-name".to_string())]
    );
}

#[test]
fn upsert_with_unchanged_value_keeps_one_entry() {
    let mut db = Database::open(temp_db("noop.db")).unwrap();
    db.table_new(users_def()).unwrap();
    let row = Record::new().add_int64("id", 1).add_bytes("name", "bob");
    db.insert("users", &row).unwrap();

    db.upsert("users", &row).unwrap();

    assert_eq!(scan_by_name(&mut db, "a", "z"), vec![(1, "bob".to_string())]);
}

#[test]
fn duplicate_indexed_values_coexist() {
    let mut db = Database::open(temp_db("dups.db")).unwrap();
    db.table_new(users_def()).unwrap();
    for id in 1..=3i64 {
        db.insert(
            "users",
            &Record::new().add_int64("id", id).add_bytes("name", "same"),
        )
        .unwrap();
    }

    assert!(db
        .delete("users", &Record::new().add_int64("id", 2))
        .unwrap());

    // The index key ends with the primary key, so equal names stay
    // distinct entries.
    let found = scan_by_name(&mut db, "same", "same");
    assert_eq!(
        found,
        vec![(1, "same".to_string()), (3, "same".to_string())]
    );
}

#[test]
fn index_entries_survive_reopen() {
    let path = temp_db("persist.db");
    {
        let mut db = Database::open(&path).unwrap();
        db.table_new(users_def()).unwrap();
        db.insert(
            "users",
            &Record::new().add_int64("id", 7).add_bytes("name", "zoe"),
        )
        .unwrap();
        db.close().unwrap();
    }

    let mut db = Database::open(&path).unwrap();

    assert_eq!(scan_by_name(&mut db, "a", "zz"), vec![(7, "zoe".to_string())]);
}

#[test]
fn multiple_indexes_are_all_maintained() {
    let mut db = Database::open(temp_db("multi.db")).unwrap();
    db.table_new(TableDef {
        name: "users".to_string(),
        types: vec![ValueType::Int64, ValueType::Bytes, ValueType::Int64],
        cols: vec!["id".to_string(), "name".to_string(), "age".to_string()],
        pkeys: 1,
        indexes: vec![vec!["name".to_string()], vec!["age".to_string()]],
        prefix: 0,
        index_prefixes: Vec::new(),
    })
    .unwrap();
    for (id, name, age) in [(1, "bob", 30i64), (2, "ann", 20), (3, "cid", 30)] {
        db.insert(
            "users",
            &Record::new()
                .add_int64("id", id)
                .add_bytes("name", name)
                .add_int64("age", age),
        )
        .unwrap();
    }

    db.delete("users", &Record::new().add_int64("id", 1)).unwrap();

    // Scan by age: only ann (20) and cid (30) remain.
    let req = ScanRequest {
        cmp1: Cmp::Ge,
        cmp2: Cmp::Le,
        key1: Record::new().add_int64("age", 0),
        key2: Record::new().add_int64("age", 100),
    };
    let rows = db.scan("users", req).unwrap().collect_rows().unwrap();
    let ids: Vec<i64> = rows
        .iter()
        .map(|r| r.get("id").and_then(Value::as_int64).unwrap())
        .collect();
    assert_eq!(ids, vec![2, 3]);
}
