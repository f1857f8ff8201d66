//! # Storage Module
//!
//! The foundational storage layer for DungeonDB: a single database file
//! treated as a sequence of fixed-size pages, accessed through a growable
//! set of memory-mapped chunks.
//!
//! ## Architecture Overview
//!
//! The storage layer is built around memory-mapped I/O. Instead of copying
//! page data between kernel and user space, the database file is mapped
//! directly into the process address space:
//!
//! - **Zero-copy reads**: committed pages are borrowed as `&[u8]` slices
//!   pointing into the mapping
//! - **Minimal syscall overhead**: page faults are handled transparently
//!   by the OS
//! - **Append-friendly growth**: the file and the mapping grow
//!   independently, each on an exponential schedule
//!
//! ## File Layout
//!
//! ```text
//! Offset 0:       Page 0 (master page: signature, root, page count)
//! Offset 4096:    Page 1
//! Offset 8192:    Page 2
//! ...
//! ```
//!
//! Every page is either a B+tree node, a free-list trunk node, or unused.
//! The file size must always be a multiple of `PAGE_SIZE`.
//!
//! ## Durability
//!
//! All mutations are staged in an in-memory update buffer and written out
//! in a single commit with a strict ordering: extend file, extend mapping,
//! copy pending pages, sync the data, rewrite the master page with a
//! positional write, sync again. A crash at any point leaves the previous
//! committed snapshot reachable from the old master page.
//!
//! ## Module Organization
//!
//! - `mmap`: chunked memory-mapped file access (`PageStore`)
//! - `master`: the master page at file offset 0 (`MasterPage`)
//! - `freelist`: on-disk linked list of reusable pages (`FreeList`)
//! - `kv`: the durable key-value store tying it all together (`KvStore`)

mod freelist;
mod kv;
mod master;
mod mmap;

pub use freelist::{FreeList, TrunkStore, TRUNK_CAP, TRUNK_HEADER_SIZE};
pub use kv::KvStore;
pub use master::{MasterPage, DB_SIGNATURE, MASTER_PAGE_SIZE};
pub use mmap::PageStore;

/// Fixed size of every page in the database file.
pub const PAGE_SIZE: usize = 4096;
