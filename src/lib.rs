//! # DungeonDB - Embedded Durable Key-Value Store
//!
//! DungeonDB is a single-file database built around a copy-on-write
//! B+tree over a memory-mapped paged file, with a relational table layer
//! composed on top.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │    Table Layer (Database/Scanner)    │
//! ├─────────────────────────────────────┤
//! │   Key Codec (order-preserving)       │
//! ├─────────────────────────────────────┤
//! │   Copy-on-Write B+Tree + Iterator    │
//! ├─────────────────────────────────────┤
//! │   KvStore (update buffer, commits)   │
//! ├─────────────────────────────────────┤
//! │   Paged Storage (mmap, free list,    │
//! │   master page)                       │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Durability Model
//!
//! Every logical update is staged copy-on-write in an in-memory buffer
//! and committed with two fsync barriers around a positional master-page
//! write. A crash at any point leaves the previously committed snapshot
//! intact; there is no write-ahead log to replay.
//!
//! ## Concurrency Model
//!
//! None, by design: one process, one actor, no locks. An update runs to
//! completion before the next begins.
//!
//! ## Quick Start
//!
//! ```ignore
//! use dungeondb::{Database, Record, TableDef, ValueType};
//!
//! let mut db = Database::open("./app.db")?;
//! db.table_new(TableDef {
//!     name: "users".into(),
//!     types: vec![ValueType::Int64, ValueType::Bytes],
//!     cols: vec!["id".into(), "name".into()],
//!     pkeys: 1,
//!     indexes: vec![vec!["name".into()]],
//!     prefix: 0,
//!     index_prefixes: vec![],
//! })?;
//!
//! db.insert("users", &Record::new().add_int64("id", 1).add_bytes("name", "ann"))?;
//!
//! let mut row = Record::new().add_int64("id", 1);
//! assert!(db.get("users", &mut row)?);
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: memory-mapped page store, free list, master page, and
//!   the durable [`KvStore`]
//! - [`btree`]: copy-on-write B+tree and its bidirectional iterator
//! - [`encoding`]: order-preserving key codec
//! - [`types`] / [`schema`]: typed values, records, table definitions
//! - [`database`]: the relational table layer and range scanner

pub mod btree;
pub mod database;
pub mod encoding;
pub mod schema;
pub mod storage;
pub mod types;

pub use btree::{Cmp, WriteMode};
pub use database::{Database, ScanRequest, Scanner};
pub use schema::{TableDef, TABLE_PREFIX_MIN};
pub use storage::KvStore;
pub use types::{Record, Value, ValueType};
