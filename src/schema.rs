//! # Table Definitions
//!
//! A [`TableDef`] describes one relational table: named, typed columns,
//! how many leading columns form the primary key, and any secondary
//! indexes. Definitions are persisted as JSON rows of the built-in
//! `@table` catalog; the `@meta` table holds the next free key-space
//! prefix.
//!
//! ## Prefixes
//!
//! Every table and every secondary index owns a 4-byte prefix that
//! namespaces its keys inside the single shared B+tree. The two built-in
//! tables use fixed prefixes 1 and 2; user tables are handed consecutive
//! prefixes starting at [`TABLE_PREFIX_MIN`], one for the primary data
//! plus one per index.
//!
//! ## Index Completion
//!
//! At definition time, every index column list is completed by appending
//! the primary-key columns it is missing. An index entry therefore always
//! carries the full primary key in its tail, which is what lets a scan
//! over the index recover the row.

use eyre::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::types::ValueType;

/// Lowest prefix available to user tables.
pub const TABLE_PREFIX_MIN: u32 = 3;

/// Name of the built-in metadata table.
pub const META_TABLE: &str = "@meta";
/// Name of the built-in schema catalog table.
pub const CATALOG_TABLE: &str = "@table";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub types: Vec<ValueType>,
    pub cols: Vec<String>,
    /// The first `pkeys` columns form the primary key.
    pub pkeys: usize,
    /// Secondary indexes as column-name lists; completed with the missing
    /// primary-key columns by [`TableDef::validate`].
    #[serde(default)]
    pub indexes: Vec<Vec<String>>,
    /// Key-space prefix of the primary data; assigned at creation.
    #[serde(default)]
    pub prefix: u32,
    /// Key-space prefixes of the secondary indexes, parallel to `indexes`.
    #[serde(default)]
    pub index_prefixes: Vec<u32>,
}

impl TableDef {
    /// Checks the definition and completes the index column lists.
    pub fn validate(&mut self) -> Result<()> {
        ensure!(!self.name.is_empty(), "table name is empty");
        ensure!(!self.cols.is_empty(), "table '{}' has no columns", self.name);
        ensure!(
            self.types.len() == self.cols.len(),
            "table '{}' has {} types for {} columns",
            self.name,
            self.types.len(),
            self.cols.len()
        );
        ensure!(
            self.pkeys >= 1 && self.pkeys <= self.cols.len(),
            "table '{}' has an invalid primary key width {}",
            self.name,
            self.pkeys
        );

        let indexes = std::mem::take(&mut self.indexes);
        for index in indexes {
            let completed = self.check_index_columns(index)?;
            self.indexes.push(completed);
        }
        Ok(())
    }

    /// Validates one index column list and appends the missing primary-key
    /// columns.
    fn check_index_columns(&self, mut index: Vec<String>) -> Result<Vec<String>> {
        ensure!(!index.is_empty(), "index on table '{}' is empty", self.name);
        for (i, col) in index.iter().enumerate() {
            ensure!(
                self.col_index(col).is_some(),
                "index column '{}' not found in table '{}'",
                col,
                self.name
            );
            ensure!(
                !index[..i].contains(col),
                "duplicate index column '{}' in table '{}'",
                col,
                self.name
            );
        }
        for col in &self.cols[..self.pkeys] {
            if !index.contains(col) {
                index.push(col.clone());
            }
        }
        Ok(index)
    }

    pub fn col_index(&self, col: &str) -> Option<usize> {
        self.cols.iter().position(|c| c == col)
    }

    pub fn col_type(&self, col: &str) -> Result<ValueType> {
        match self.col_index(col) {
            Some(i) => Ok(self.types[i]),
            None => bail!("column '{}' not found in table '{}'", col, self.name),
        }
    }

    pub fn pk_cols(&self) -> &[String] {
        &self.cols[..self.pkeys]
    }
}

/// Built-in table for database metadata (`next_prefix` and friends).
pub fn meta_table_def() -> TableDef {
    TableDef {
        name: META_TABLE.to_string(),
        types: vec![ValueType::Bytes, ValueType::Bytes],
        cols: vec!["key".to_string(), "val".to_string()],
        pkeys: 1,
        indexes: Vec::new(),
        prefix: 1,
        index_prefixes: Vec::new(),
    }
}

/// Built-in catalog table mapping table names to JSON definitions.
pub fn catalog_table_def() -> TableDef {
    TableDef {
        name: CATALOG_TABLE.to_string(),
        types: vec![ValueType::Bytes, ValueType::Bytes],
        cols: vec!["name".to_string(), "def".to_string()],
        pkeys: 1,
        indexes: Vec::new(),
        prefix: 2,
        index_prefixes: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn valid_definition_passes() {
        let mut def = users_def();

        def.validate().unwrap();
    }

    #[test]
    fn index_gains_missing_primary_key_columns() {
        let mut def = users_def();

        def.validate().unwrap();

        assert_eq!(def.indexes[0], vec!["name".to_string(), "id".to_string()]);
    }

    #[test]
    fn index_already_containing_pk_is_unchanged() {
        let mut def = users_def();
        def.indexes = vec![vec!["name".to_string(), "id".to_string()]];

        def.validate().unwrap();

        assert_eq!(def.indexes[0], vec!["name".to_string(), "id".to_string()]);
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut def = users_def();
        def.name = String::new();

        assert!(def.validate().is_err());
    }

    #[test]
    fn mismatched_types_are_rejected() {
        let mut def = users_def();
        def.types.pop();

        assert!(def.validate().is_err());
    }

    #[test]
    fn zero_pkeys_is_rejected() {
        let mut def = users_def();
        def.pkeys = 0;

        assert!(def.validate().is_err());
    }

    #[test]
    fn duplicate_index_column_is_rejected() {
        let mut def = users_def();
        def.indexes = vec![vec!["name".to_string(), "name".to_string()]];

        assert!(def.validate().is_err());
    }

    #[test]
    fn unknown_index_column_is_rejected() {
        let mut def = users_def();
        def.indexes = vec![vec!["nope".to_string()]];

        assert!(def.validate().is_err());
    }

    #[test]
    fn definition_round_trips_through_json() {
        let mut def = users_def();
        def.validate().unwrap();
        def.prefix = 3;
        def.index_prefixes = vec![4];

        let json = serde_json::to_vec(&def).unwrap();
        let back: TableDef = serde_json::from_slice(&json).unwrap();

        assert_eq!(back, def);
    }

    #[test]
    fn builtin_tables_use_reserved_prefixes() {
        assert_eq!(meta_table_def().prefix, 1);
        assert_eq!(catalog_table_def().prefix, 2);
        assert!(TABLE_PREFIX_MIN > catalog_table_def().prefix);
    }
}
