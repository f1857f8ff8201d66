//! # Relational Table Layer
//!
//! [`Database`] composes the table abstraction on top of the key-value
//! store: typed rows keyed by their leading primary-key columns, secondary
//! indexes maintained alongside every write, and range scans over either.
//!
//! ## Key Mapping
//!
//! A row of table `T` is stored as
//!
//! ```text
//! key   = T.prefix || encode(pk columns)
//! value = encode(remaining columns)
//! ```
//!
//! and each secondary index entry as
//!
//! ```text
//! key   = index.prefix || encode(index columns .. pk columns)
//! value = (empty)
//! ```
//!
//! Index column lists always end with the primary key (completed at
//! definition time), so an index key alone identifies its row.
//!
//! ## Catalog Bootstrap
//!
//! Two built-in tables with fixed prefixes exist without being stored:
//! `@meta` (prefix 1) carries the `next_prefix` allocator, `@table`
//! (prefix 2) maps table names to their JSON-encoded definitions. User
//! definitions are loaded from `@table` on first use and cached.

mod scan;

pub use scan::{ScanRequest, Scanner};

use std::path::Path;
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;

use crate::btree::{DeleteRequest, InsertRequest, WriteMode};
use crate::encoding::{decode_values, encode_key, encode_values};
use crate::schema::{
    catalog_table_def, meta_table_def, TableDef, CATALOG_TABLE, META_TABLE, TABLE_PREFIX_MIN,
};
use crate::storage::KvStore;
use crate::types::{Record, Value};

/// Key under `@meta` holding the next unassigned table prefix.
const NEXT_PREFIX_KEY: &[u8] = b"next_prefix";

pub struct Database {
    kv: KvStore,
    tables: HashMap<String, Arc<TableDef>>,
}

impl Database {
    /// Opens or creates the database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let kv = KvStore::open(path)?;
        let mut tables = HashMap::new();
        tables.insert(META_TABLE.to_string(), Arc::new(meta_table_def()));
        tables.insert(CATALOG_TABLE.to_string(), Arc::new(catalog_table_def()));
        Ok(Self { kv, tables })
    }

    /// Flushes and closes the underlying store.
    pub fn close(self) -> Result<()> {
        self.kv.close()
    }

    /// The underlying key-value store.
    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// Creates a table: validates the definition, assigns prefixes, and
    /// persists it to the catalog.
    pub fn table_new(&mut self, mut def: TableDef) -> Result<()> {
        def.validate()?;
        ensure!(
            !def.name.starts_with('@'),
            "table name '{}' is reserved",
            def.name
        );
        ensure!(
            def.prefix == 0 && def.index_prefixes.is_empty(),
            "prefixes are assigned by the database"
        );

        let catalog = self.table_def(CATALOG_TABLE)?.expect("built-in catalog");
        let mut existing = Record::new().add_bytes("name", def.name.as_str());
        if table_get(&self.kv, &catalog, &mut existing)? {
            bail!("table '{}' already exists", def.name);
        }

        // Allocate consecutive prefixes: one for the row data, one per
        // secondary index.
        let meta = self.table_def(META_TABLE)?.expect("built-in meta");
        let mut next_prefix = Record::new().add_bytes("key", NEXT_PREFIX_KEY);
        def.prefix = if table_get(&self.kv, &meta, &mut next_prefix)? {
            let raw = next_prefix
                .get("val")
                .and_then(Value::as_bytes)
                .ok_or_else(|| eyre::eyre!("@meta next_prefix row has no value"))?;
            ensure!(raw.len() == 4, "@meta next_prefix is {} bytes", raw.len());
            let prefix = u32::from_le_bytes(raw.try_into().unwrap());
            ensure!(
                prefix >= TABLE_PREFIX_MIN,
                "@meta next_prefix {} below the user range",
                prefix
            );
            prefix
        } else {
            TABLE_PREFIX_MIN
        };
        def.index_prefixes = (0..def.indexes.len())
            .map(|i| def.prefix + 1 + i as u32)
            .collect();

        let next = def.prefix + 1 + def.indexes.len() as u32;
        let bump = Record::new()
            .add_bytes("key", NEXT_PREFIX_KEY)
            .add_bytes("val", next.to_le_bytes().to_vec());
        table_set(&mut self.kv, &meta, &bump, WriteMode::Upsert)?;

        let json = serde_json::to_vec(&def)
            .wrap_err_with(|| format!("failed to encode definition of '{}'", def.name))?;
        let row = Record::new()
            .add_bytes("name", def.name.as_str())
            .add_bytes("def", json);
        table_set(&mut self.kv, &catalog, &row, WriteMode::Upsert)?;

        self.tables.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    /// Fetches a row by primary key: `rec` supplies the key columns and
    /// receives the rest. Returns false when no such row exists.
    pub fn get(&mut self, table: &str, rec: &mut Record) -> Result<bool> {
        let tdef = self.require_table(table)?;
        table_get(&self.kv, &tdef, rec)
    }

    /// Writes a full row under the given mode; returns whether a new row
    /// was added.
    pub fn set(&mut self, table: &str, rec: &Record, mode: WriteMode) -> Result<bool> {
        let tdef = self.require_table(table)?;
        table_set(&mut self.kv, &tdef, rec, mode)
    }

    /// Adds a new row; fails if the primary key is already taken.
    pub fn insert(&mut self, table: &str, rec: &Record) -> Result<bool> {
        self.set(table, rec, WriteMode::InsertOnly)
    }

    /// Replaces an existing row; fails if the primary key is absent.
    pub fn update(&mut self, table: &str, rec: &Record) -> Result<bool> {
        self.set(table, rec, WriteMode::UpdateOnly)
    }

    /// Adds or replaces a row.
    pub fn upsert(&mut self, table: &str, rec: &Record) -> Result<bool> {
        self.set(table, rec, WriteMode::Upsert)
    }

    /// Deletes a row by primary key; returns false when absent.
    pub fn delete(&mut self, table: &str, rec: &Record) -> Result<bool> {
        let tdef = self.require_table(table)?;
        table_delete(&mut self.kv, &tdef, rec)
    }

    /// Looks a table definition up, loading and caching it from the
    /// catalog when needed.
    pub fn table_def(&mut self, name: &str) -> Result<Option<Arc<TableDef>>> {
        if let Some(def) = self.tables.get(name) {
            return Ok(Some(def.clone()));
        }

        let catalog = self
            .tables
            .get(CATALOG_TABLE)
            .expect("built-in catalog")
            .clone();
        let mut rec = Record::new().add_bytes("name", name);
        if !table_get(&self.kv, &catalog, &mut rec)? {
            return Ok(None);
        }
        let json = rec
            .get("def")
            .and_then(Value::as_bytes)
            .ok_or_else(|| eyre::eyre!("catalog row for '{}' has no definition", name))?;
        let def: TableDef = serde_json::from_slice(json)
            .wrap_err_with(|| format!("failed to decode definition of '{}'", name))?;
        let def = Arc::new(def);
        self.tables.insert(name.to_string(), def.clone());
        Ok(Some(def))
    }

    pub(crate) fn require_table(&mut self, name: &str) -> Result<Arc<TableDef>> {
        match self.table_def(name)? {
            Some(def) => Ok(def),
            None => bail!("table not found: {}", name),
        }
    }
}

/// Reorders the supplied columns into the definition's canonical order.
/// The first `n` canonical columns must all be present; `n` is either the
/// primary-key width (point lookups, deletes) or the full column count
/// (row writes).
fn check_record(tdef: &TableDef, rec: &Record, n: usize) -> Result<Vec<Option<Value>>> {
    let mut values: Vec<Option<Value>> = vec![None; tdef.cols.len()];
    for (col, val) in rec.cols().iter().zip(rec.vals()) {
        let Some(j) = tdef.col_index(col) else {
            bail!("column '{}' not found in table '{}'", col, tdef.name);
        };
        ensure!(
            val.value_type() == tdef.types[j],
            "column '{}' of table '{}' has the wrong type",
            col,
            tdef.name
        );
        ensure!(
            values[j].is_none(),
            "column '{}' supplied twice",
            col
        );
        values[j] = Some(val.clone());
    }
    for i in 0..n {
        ensure!(
            values[i].is_some(),
            "missing column '{}' of table '{}'",
            tdef.cols[i],
            tdef.name
        );
    }
    Ok(values)
}

fn primary_key(tdef: &TableDef, values: &[Option<Value>]) -> Vec<u8> {
    let pk: Vec<Value> = values[..tdef.pkeys]
        .iter()
        .map(|v| v.clone().expect("checked primary key column"))
        .collect();
    let mut key = Vec::new();
    encode_key(&mut key, tdef.prefix, &pk);
    key
}

/// Point lookup shared by [`Database::get`] and secondary-index scans.
pub(crate) fn table_get(kv: &KvStore, tdef: &TableDef, rec: &mut Record) -> Result<bool> {
    let values = check_record(tdef, rec, tdef.pkeys)?;
    let key = primary_key(tdef, &values);

    let Some(val) = kv.get(&key)? else {
        return Ok(false);
    };

    let rest = decode_values(&val, &tdef.types[tdef.pkeys..])?;
    for (col, v) in tdef.cols[tdef.pkeys..].iter().zip(rest) {
        rec.push(col, v);
    }
    Ok(true)
}

fn table_set(kv: &mut KvStore, tdef: &TableDef, rec: &Record, mode: WriteMode) -> Result<bool> {
    let values = check_record(tdef, rec, tdef.cols.len())?;
    let values: Vec<Value> = values
        .into_iter()
        .map(|v| v.expect("checked full record"))
        .collect();

    let mut key = Vec::new();
    encode_key(&mut key, tdef.prefix, &values[..tdef.pkeys]);
    let mut val = Vec::new();
    encode_values(&mut val, &values[tdef.pkeys..]);

    let mut req = InsertRequest::new(&key, &val, mode);
    let added = kv.update(&mut req)?;

    if req.updated && !tdef.indexes.is_empty() {
        // A replaced row first drops its old index entries.
        if !req.added {
            if let Some(old) = &req.old {
                let old_rest = decode_values(old, &tdef.types[tdef.pkeys..])?;
                let mut old_values = values.clone();
                old_values[tdef.pkeys..].clone_from_slice(&old_rest);
                index_op(kv, tdef, &old_values, IndexOp::Del)?;
            }
        }
        index_op(kv, tdef, &values, IndexOp::Add)?;
    }
    Ok(added)
}

fn table_delete(kv: &mut KvStore, tdef: &TableDef, rec: &Record) -> Result<bool> {
    let values = check_record(tdef, rec, tdef.pkeys)?;
    let key = primary_key(tdef, &values);

    let mut req = DeleteRequest::new(&key);
    if !kv.delete(&mut req)? {
        return Ok(false);
    }

    if !tdef.indexes.is_empty() {
        // Rebuild the deleted row from the old value to address its
        // index entries.
        let old = req
            .old
            .as_ref()
            .ok_or_else(|| eyre::eyre!("delete did not report the old value"))?;
        let old_rest = decode_values(old, &tdef.types[tdef.pkeys..])?;
        let mut full: Vec<Value> = values[..tdef.pkeys]
            .iter()
            .map(|v| v.clone().expect("checked primary key column"))
            .collect();
        full.extend(old_rest);
        index_op(kv, tdef, &full, IndexOp::Del)?;
    }
    Ok(true)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum IndexOp {
    Add,
    Del,
}

/// Adds or removes the secondary-index entries of one row. `values` holds
/// the full row in canonical column order.
fn index_op(kv: &mut KvStore, tdef: &TableDef, values: &[Value], op: IndexOp) -> Result<()> {
    for (i, index) in tdef.indexes.iter().enumerate() {
        let ivals: Vec<Value> = index
            .iter()
            .map(|col| values[tdef.col_index(col).expect("validated index column")].clone())
            .collect();
        let mut key = Vec::new();
        encode_key(&mut key, tdef.index_prefixes[i], &ivals);

        match op {
            IndexOp::Add => {
                let mut req = InsertRequest::new(&key, b"", WriteMode::Upsert);
                kv.update(&mut req)?;
            }
            IndexOp::Del => {
                let deleted = kv.del(&key)?;
                ensure!(
                    deleted,
                    "missing index entry for table '{}' index {}",
                    tdef.name,
                    i
                );
            }
        }
    }
    Ok(())
}
