//! # Range Scans
//!
//! A [`ScanRequest`] bounds a range with two typed endpoints and two
//! comparators, one from each side (`GE "b" .. LE "d"`, or reversed for
//! descending order). [`Database::scan`] picks the index to drive the
//! scan — the primary key when it prefixes the scanned columns, otherwise
//! the shortest covering secondary index — encodes both endpoints with
//! the partial-key padding rule, and hands back a [`Scanner`] positioned
//! at the first match.
//!
//! On a secondary index the stored entry has no value; the row's primary
//! key is decoded from the entry's tail and the row is re-fetched through
//! the primary table.

use std::sync::Arc;

use eyre::{ensure, Result};

use super::{table_get, Database};
use crate::btree::{BIter, Cmp};
use crate::encoding::{decode_values, encode_key_partial};
use crate::schema::TableDef;
use crate::storage::KvStore;
use crate::types::{Record, Value, ValueType};

/// A bounded range over a table's key space. `key1` is where the scan
/// starts, `key2` where it ends; both must name the same columns, in the
/// order of the index that will serve them.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub cmp1: Cmp,
    pub cmp2: Cmp,
    pub key1: Record,
    pub key2: Record,
}

pub struct Scanner<'a> {
    kv: &'a KvStore,
    tdef: Arc<TableDef>,
    /// `None`: scanning the primary key space; `Some(i)`: secondary index.
    index_no: Option<usize>,
    cmp1: Cmp,
    cmp2: Cmp,
    iter: BIter<'a, KvStore>,
    key_end: Vec<u8>,
}

impl Database {
    /// Starts a range scan; see [`ScanRequest`].
    pub fn scan(&mut self, table: &str, req: ScanRequest) -> Result<Scanner<'_>> {
        let tdef = self.require_table(table)?;
        scan_table(self.kv(), tdef, req)
    }
}

fn scan_table(kv: &KvStore, tdef: Arc<TableDef>, req: ScanRequest) -> Result<Scanner<'_>> {
    ensure!(
        req.cmp1.is_greater_side() != req.cmp2.is_greater_side(),
        "bad range: both comparators bound the same side"
    );
    ensure!(
        req.key1.cols() == req.key2.cols(),
        "range endpoints name different columns"
    );

    let vals1 = endpoint_values(&tdef, &req.key1)?;
    let vals2 = endpoint_values(&tdef, &req.key2)?;

    let index_no = find_index(&tdef, req.key1.cols())?;
    let (index_cols, prefix) = match index_no {
        None => (tdef.pk_cols(), tdef.prefix),
        Some(i) => (&tdef.indexes[i][..], tdef.index_prefixes[i]),
    };
    let missing: Vec<ValueType> = index_cols[vals1.len()..]
        .iter()
        .map(|col| tdef.col_type(col))
        .collect::<Result<_>>()?;

    let key_start = encode_key_partial(prefix, &vals1, &missing, req.cmp1);
    let key_end = encode_key_partial(prefix, &vals2, &missing, req.cmp2);
    let iter = kv.seek(&key_start, req.cmp1)?;

    Ok(Scanner {
        kv,
        tdef,
        index_no,
        cmp1: req.cmp1,
        cmp2: req.cmp2,
        iter,
        key_end,
    })
}

/// Typed values of one endpoint, in the record's column order.
fn endpoint_values(tdef: &TableDef, rec: &Record) -> Result<Vec<Value>> {
    for (col, val) in rec.cols().iter().zip(rec.vals()) {
        ensure!(
            val.value_type() == tdef.col_type(col)?,
            "scan column '{}' of table '{}' has the wrong type",
            col,
            tdef.name
        );
    }
    Ok(rec.vals().to_vec())
}

/// Picks the index serving a scan over `keys`: the primary key when it is
/// a prefix match, else the shortest covering secondary index.
fn find_index(tdef: &TableDef, keys: &[String]) -> Result<Option<usize>> {
    if is_prefix(tdef.pk_cols(), keys) {
        // Also covers the full-table scan with no key columns at all.
        return Ok(None);
    }

    let mut winner: Option<usize> = None;
    for (i, index) in tdef.indexes.iter().enumerate() {
        if !is_prefix(index, keys) {
            continue;
        }
        if winner.map_or(true, |w| index.len() < tdef.indexes[w].len()) {
            winner = Some(i);
        }
    }
    match winner {
        Some(i) => Ok(Some(i)),
        None => eyre::bail!(
            "no index of table '{}' covers the scanned columns",
            tdef.name
        ),
    }
}

fn is_prefix(long: &[String], short: &[String]) -> bool {
    long.len() >= short.len() && long.iter().zip(short).all(|(a, b)| a == b)
}

impl Scanner<'_> {
    /// True while the cursor is inside the requested range.
    pub fn valid(&self) -> bool {
        if !self.iter.valid() {
            return false;
        }
        let (key, _) = self.iter.deref();
        self.cmp2.ok(key, &self.key_end)
    }

    /// Moves one entry in scan direction.
    pub fn next(&mut self) -> Result<()> {
        ensure!(self.valid(), "scanner moved past its range");
        if self.cmp1.is_greater_side() {
            self.iter.next()
        } else {
            self.iter.prev()
        }
    }

    /// Decodes the current entry into `rec`.
    pub fn deref(&self, rec: &mut Record) -> Result<()> {
        ensure!(self.valid(), "scanner is not on a row");
        let (key, val) = self.iter.deref();
        ensure!(key.len() >= 4, "table key shorter than its prefix");
        rec.clear();

        match self.index_no {
            None => {
                let pk_vals = decode_values(&key[4..], &self.tdef.types[..self.tdef.pkeys])?;
                let rest = decode_values(val, &self.tdef.types[self.tdef.pkeys..])?;
                for (col, v) in self.tdef.cols.iter().zip(pk_vals.into_iter().chain(rest)) {
                    rec.push(col, v);
                }
            }
            Some(i) => {
                // Index entries store no value: decode the indexed columns
                // from the key and re-fetch the row by its primary key.
                let index_cols = &self.tdef.indexes[i];
                let types: Vec<ValueType> = index_cols
                    .iter()
                    .map(|col| self.tdef.col_type(col))
                    .collect::<Result<_>>()?;
                let ivals = decode_values(&key[4..], &types)?;

                let mut row = Record::new();
                for col in self.tdef.pk_cols() {
                    let pos = index_cols
                        .iter()
                        .position(|c| c == col)
                        .ok_or_else(|| eyre::eyre!("index is missing primary key column"))?;
                    row.push(col, ivals[pos].clone());
                }
                let found = table_get(self.kv, &self.tdef, &mut row)?;
                ensure!(found, "index entry points to a missing row");
                *rec = row;
            }
        }
        Ok(())
    }

    /// Drains the scanner, collecting every remaining row.
    pub fn collect_rows(&mut self) -> Result<Vec<Record>> {
        let mut rows = Vec::new();
        while self.valid() {
            let mut rec = Record::new();
            self.deref(&mut rec)?;
            rows.push(rec);
            self.next()?;
        }
        Ok(rows)
    }
}
