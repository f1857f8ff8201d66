//! # Typed Values and Records
//!
//! The table layer works with two column types: byte strings and signed
//! 64-bit integers. A [`Record`] is a partial or complete row: two
//! parallel ordered sequences of column names and values, built up with
//! the `add_*` methods and consumed by the table operations, which reorder
//! the columns into the table definition's canonical order.

use serde::{Deserialize, Serialize};

/// Column type tag; the numeric values are part of persisted schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    #[serde(rename = "bytes")]
    Bytes,
    #[serde(rename = "int64")]
    Int64,
}

/// A single typed column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int64(i64),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bytes(_) => ValueType::Bytes,
            Value::Int64(_) => ValueType::Int64,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Int64(_) => None,
        }
    }

    pub fn as_int64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::Bytes(_) => None,
        }
    }
}

/// A row under construction or a query result: parallel column names and
/// values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    cols: Vec<String>,
    vals: Vec<Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a byte-string column; chainable.
    pub fn add_bytes(mut self, col: &str, val: impl Into<Vec<u8>>) -> Self {
        self.push(col, Value::Bytes(val.into()));
        self
    }

    /// Adds an integer column; chainable.
    pub fn add_int64(mut self, col: &str, val: i64) -> Self {
        self.push(col, Value::Int64(val));
        self
    }

    pub fn get(&self, col: &str) -> Option<&Value> {
        self.cols
            .iter()
            .position(|c| c == col)
            .map(|i| &self.vals[i])
    }

    pub fn cols(&self) -> &[String] {
        &self.cols
    }

    pub fn vals(&self) -> &[Value] {
        &self.vals
    }

    pub fn len(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    pub(crate) fn push(&mut self, col: &str, val: Value) {
        self.cols.push(col.to_string());
        self.vals.push(val);
    }

    pub(crate) fn clear(&mut self) {
        self.cols.clear();
        self.vals.clear();
    }
}
