//! # Durable Key-Value Store
//!
//! `KvStore` ties the pieces together: the chunked mmap ([`PageStore`]),
//! the master page, the free list, and the copy-on-write B+tree. It is the
//! [`PageSource`] the tree allocates through and the [`TrunkStore`] the
//! free list rewrites itself through.
//!
//! ## Update Buffer
//!
//! Within one logical update, new and deallocated pages accumulate in an
//! in-memory map keyed by page number — a write-set. Entries are either a
//! full page image or an explicit tombstone. `page_new` prefers recycling
//! a committed free-list pointer and falls back to appending past the end
//! of the flushed region, so a pending page never aliases a page the
//! committed root can still reach.
//!
//! ## Commit Protocol
//!
//! ```text
//! 1. fold tombstones + consumed pointers into the free list (buffer-only)
//! 2. extend the file, then the mapping, to cover appended pages
//! 3. memcpy pending pages into the mapping
//! 4. msync                      <- data durable
//! 5. pwrite the master page     <- commit point
//! 6. fsync
//! ```
//!
//! A crash before step 5 leaves the old master page and therefore the old
//! snapshot; the partially written pages are unreachable. If any step
//! fails, the in-memory state rolls back to the last committed snapshot
//! and the error surfaces to the caller.

use std::path::Path;

use eyre::{ensure, Result};
use hashbrown::HashMap;

use super::freelist::{FreeList, TrunkStore};
use super::master::{MasterPage, MASTER_PAGE_SIZE};
use super::mmap::PageStore;
use super::PAGE_SIZE;
use crate::btree::{
    BIter, BNode, BTree, Cmp, DeleteRequest, InsertRequest, PageSource, WriteMode,
};
use zerocopy::IntoBytes;

/// A pending page in the update buffer.
#[derive(Debug)]
enum PageUpdate {
    /// Page image to be written at commit.
    Put(Vec<u8>),
    /// Deallocated; becomes a free-list entry at commit.
    Tombstone,
}

#[derive(Debug)]
pub struct KvStore {
    store: PageStore,
    tree: BTree,
    free: FreeList,
    /// Pages on disk as of the last commit.
    flushed: u64,
    /// Free-list pointers consumed by this update.
    nfree: u64,
    /// Pages appended past `flushed` by this update.
    nappend: u64,
    updates: HashMap<u64, PageUpdate>,
}

/// Snapshot of the committed state, restored when an update fails.
#[derive(Clone, Copy)]
struct Checkpoint {
    tree: BTree,
    free: FreeList,
    flushed: u64,
}

impl KvStore {
    /// Opens or creates the database file and validates the master page.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = PageStore::open(path)?;

        let mut kv = Self {
            store,
            tree: BTree::default(),
            free: FreeList::default(),
            flushed: 1, // page 0 is reserved for the master page
            nfree: 0,
            nappend: 0,
            updates: HashMap::new(),
        };

        if kv.store.file_pages() > 0 {
            let page0 = kv.store.page_ref(0)?;
            let master = MasterPage::load(&page0[..MASTER_PAGE_SIZE], kv.store.file_pages())?;
            kv.tree = BTree::new(master.tree_root());
            kv.free = FreeList::new(master.free_head());
            kv.flushed = master.page_used();
        }
        Ok(kv)
    }

    /// Flushes mapped pages and drops the store.
    pub fn close(self) -> Result<()> {
        self.store.sync_pages()
    }

    pub fn tree_root(&self) -> u64 {
        self.tree.root
    }

    /// Total pages ever allocated, including the master page.
    pub fn pages_used(&self) -> u64 {
        self.flushed
    }

    /// Looks up a key in the committed tree.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree.get(self, key)
    }

    /// Positions a cursor relative to `key` for range scans.
    pub fn seek(&self, key: &[u8], cmp: Cmp) -> Result<BIter<'_, KvStore>> {
        self.tree.seek(self, key, cmp)
    }

    /// Runs an insert request to completion and commits; returns whether a
    /// new key was added.
    pub fn update(&mut self, req: &mut InsertRequest) -> Result<bool> {
        let checkpoint = self.checkpoint();
        match self.update_inner(req) {
            Ok(()) => Ok(req.added),
            Err(e) => {
                self.revert(checkpoint);
                Err(e)
            }
        }
    }

    /// Upsert convenience wrapper.
    pub fn set(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let mut req = InsertRequest::new(key, val, WriteMode::Upsert);
        self.update(&mut req).map(|_| ())
    }

    /// Deletes a key and commits; returns false when the key was absent.
    pub fn delete(&mut self, req: &mut DeleteRequest) -> Result<bool> {
        let checkpoint = self.checkpoint();
        match self.delete_inner(req) {
            Ok(deleted) => Ok(deleted),
            Err(e) => {
                self.revert(checkpoint);
                Err(e)
            }
        }
    }

    /// Convenience wrapper around [`KvStore::delete`].
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        let mut req = DeleteRequest::new(key);
        self.delete(&mut req)
    }

    fn update_inner(&mut self, req: &mut InsertRequest) -> Result<()> {
        let mut tree = self.tree;
        tree.update(&mut *self, req)?;
        self.tree = tree;
        self.flush()
    }

    fn delete_inner(&mut self, req: &mut DeleteRequest) -> Result<bool> {
        let mut tree = self.tree;
        let deleted = tree.delete(&mut *self, req)?;
        self.tree = tree;
        if !deleted {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            tree: self.tree,
            free: self.free,
            flushed: self.flushed,
        }
    }

    fn revert(&mut self, checkpoint: Checkpoint) {
        self.tree = checkpoint.tree;
        self.free = checkpoint.free;
        self.flushed = checkpoint.flushed;
        self.nfree = 0;
        self.nappend = 0;
        self.updates.clear();
    }

    /// Commits the update buffer; see the module docs for the ordering.
    fn flush(&mut self) -> Result<()> {
        // Fold this update's tombstones and consumed pointers into the
        // free list. This only mutates the buffer: replacement trunk
        // pages land there like any other pending page.
        let freed: Vec<u64> = self
            .updates
            .iter()
            .filter_map(|(ptr, update)| matches!(update, PageUpdate::Tombstone).then_some(*ptr))
            .collect();
        let popn = self.nfree;
        let mut free = self.free;
        free.update(&mut *self, popn, freed)?;
        self.free = free;

        // Make room for appended pages, then copy everything in.
        let npages = self.flushed + self.nappend;
        self.store.ensure_file(npages)?;
        self.store.ensure_mmap(npages)?;
        for (ptr, update) in &self.updates {
            if let PageUpdate::Put(data) = update {
                self.store.write_page(*ptr, data)?;
            }
        }
        self.store.sync_pages()?;

        // Data is durable; rewrite the master page to commit.
        self.flushed += self.nappend;
        self.nfree = 0;
        self.nappend = 0;
        self.updates.clear();

        let master = MasterPage::new(self.tree.root, self.flushed, self.free.head);
        self.store.write_master(master.as_bytes())?;
        self.store.sync_file()
    }

    /// Dereferences a page: pending pages from the buffer, committed pages
    /// from the mapping.
    fn page_get(&self, ptr: u64) -> Result<BNode> {
        if let Some(update) = self.updates.get(&ptr) {
            return match update {
                PageUpdate::Put(data) => Ok(BNode::from_bytes(data.clone())),
                PageUpdate::Tombstone => eyre::bail!("page {} was deallocated", ptr),
            };
        }
        ensure!(ptr != 0, "page 0 is the master page");
        ensure!(
            ptr < self.flushed,
            "page {} beyond the flushed region ({})",
            ptr,
            self.flushed
        );
        Ok(BNode::from_bytes(self.store.page_ref(ptr)?.to_vec()))
    }
}

impl PageSource for KvStore {
    fn fetch(&self, ptr: u64) -> Result<BNode> {
        self.page_get(ptr)
    }

    fn allocate(&mut self, mut node: BNode) -> Result<u64> {
        node.truncate_to_page();
        ensure!(node.nbytes() <= PAGE_SIZE, "node overflows a page");

        let free = self.free;
        let ptr = if self.nfree < free.total(&*self)? {
            // Reuse a page freed by an earlier commit.
            let ptr = free.get(&*self, self.nfree)?;
            self.nfree += 1;
            ptr
        } else {
            let ptr = self.flushed + self.nappend;
            self.nappend += 1;
            ptr
        };
        self.updates.insert(ptr, PageUpdate::Put(node.into_data()));
        Ok(ptr)
    }

    fn free(&mut self, ptr: u64) {
        debug_assert!(
            !matches!(self.updates.get(&ptr), Some(PageUpdate::Tombstone)),
            "double free of page {}",
            ptr
        );
        self.updates.insert(ptr, PageUpdate::Tombstone);
    }
}

impl TrunkStore for KvStore {
    fn fetch(&self, ptr: u64) -> Result<BNode> {
        self.page_get(ptr)
    }

    fn append(&mut self, node: BNode) -> Result<u64> {
        let ptr = self.flushed + self.nappend;
        self.nappend += 1;
        self.updates.insert(ptr, PageUpdate::Put(node.into_data()));
        Ok(ptr)
    }

    fn reuse(&mut self, ptr: u64, node: BNode) {
        self.updates.insert(ptr, PageUpdate::Put(node.into_data()));
    }
}
