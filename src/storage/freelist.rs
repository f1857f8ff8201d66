//! # Free List
//!
//! An on-disk linked list of reusable page numbers. Each node of the list
//! is itself one page (a "trunk" page) holding a packed array of free page
//! pointers. The head pointer lives in the master page.
//!
//! ## Trunk Page Layout
//!
//! ```text
//! Offset  Size      Description
//! ------  --------  ----------------------------------------
//! 0       2         node type (3 = free trunk)
//! 2       8         next trunk page (0 = last)
//! 10      8         total free pointers in the whole list
//!                   (meaningful in the head trunk only)
//! 18      8 * N     packed page pointers
//! ```
//!
//! A trunk holds up to `(4096 - 18) / 8 = 509` pointers.
//!
//! ## Derived Trunk Sizes
//!
//! The layout stores no per-trunk count. Instead the list maintains the
//! invariant that every trunk except the head is completely full; the head
//! holds `((total - 1) % 509) + 1` pointers. `update` preserves this: it
//! rebuilds the head chain from scratch each commit and only ever leaves
//! previously-full trunks below it.
//!
//! ## Self-Contained Updates
//!
//! `update(popn, freed)` consumes `popn` pointers and adds `freed` ones in
//! a single pass. Consumed trunk pages are themselves recycled into
//! `freed`, and replacement trunks are written into page numbers harvested
//! from the list itself (`reuse`), so a free-list update never steals
//! pages from the committed tree and stays inside one commit. Fresh pages
//! are appended only when the list is fully drained.

use eyre::{ensure, Result};

use super::PAGE_SIZE;
use crate::btree::{BNode, NodeType};

/// Trunk header: type (2) + next (8) + total (8).
pub const TRUNK_HEADER_SIZE: usize = 18;
/// Free pointers per trunk page.
pub const TRUNK_CAP: usize = (PAGE_SIZE - TRUNK_HEADER_SIZE) / 8;

/// Capability the free list needs from the page layer: dereference a
/// page, append a brand-new page, or rewrite a known page in place.
pub trait TrunkStore {
    fn fetch(&self, ptr: u64) -> Result<BNode>;
    fn append(&mut self, node: BNode) -> Result<u64>;
    fn reuse(&mut self, ptr: u64, node: BNode);
}

fn trunk_next(node: &BNode) -> u64 {
    u64::from_le_bytes(node.data()[2..10].try_into().unwrap())
}

fn trunk_total(node: &BNode) -> u64 {
    u64::from_le_bytes(node.data()[10..18].try_into().unwrap())
}

fn trunk_set_total(node: &mut BNode, total: u64) {
    node.data_mut()[10..18].copy_from_slice(&total.to_le_bytes());
}

fn trunk_ptr(node: &BNode, idx: usize) -> u64 {
    let pos = TRUNK_HEADER_SIZE + idx * 8;
    u64::from_le_bytes(node.data()[pos..pos + 8].try_into().unwrap())
}

fn trunk_set_ptr(node: &mut BNode, idx: usize, ptr: u64) {
    debug_assert!(idx < TRUNK_CAP);
    let pos = TRUNK_HEADER_SIZE + idx * 8;
    node.data_mut()[pos..pos + 8].copy_from_slice(&ptr.to_le_bytes());
}

fn trunk_new(next: u64) -> BNode {
    let mut node = BNode::new();
    node.data_mut()[0..2].copy_from_slice(&NodeType::FreeTrunk.as_raw().to_le_bytes());
    node.data_mut()[2..10].copy_from_slice(&next.to_le_bytes());
    node
}

/// Pointer count of the head trunk, given the list total.
fn head_size(total: u64) -> u64 {
    debug_assert!(total > 0);
    (total - 1) % TRUNK_CAP as u64 + 1
}

/// The list itself is just the head page number; totals and pointers live
/// on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeList {
    pub head: u64,
}

impl FreeList {
    pub fn new(head: u64) -> Self {
        Self { head }
    }

    /// Number of free pointers currently tracked.
    pub fn total<S: TrunkStore>(&self, src: &S) -> Result<u64> {
        if self.head == 0 {
            return Ok(0);
        }
        let head = src.fetch(self.head)?;
        Ok(trunk_total(&head))
    }

    /// Returns the `topn`-th free pointer (0-based, in consumption order).
    pub fn get<S: TrunkStore>(&self, src: &S, mut topn: u64) -> Result<u64> {
        let total = self.total(src)?;
        ensure!(
            topn < total,
            "free list index {} out of range (total {})",
            topn,
            total
        );

        let mut node = src.fetch(self.head)?;
        let mut size = head_size(total);
        while size <= topn {
            topn -= size;
            let next = trunk_next(&node);
            ensure!(next != 0, "free list chain shorter than its total");
            node = src.fetch(next)?;
            size = TRUNK_CAP as u64;
        }
        Ok(trunk_ptr(&node, (size - topn - 1) as usize))
    }

    /// Consumes the first `popn` pointers and adds the `freed` pages.
    pub fn update<S: TrunkStore>(
        &mut self,
        src: &mut S,
        mut popn: u64,
        mut freed: Vec<u64>,
    ) -> Result<()> {
        let total0 = self.total(src)?;
        ensure!(
            popn <= total0,
            "cannot pop {} pointers from a list of {}",
            popn,
            total0
        );
        if popn == 0 && freed.is_empty() {
            return Ok(());
        }

        // Walk the head chain, dropping consumed pointers and harvesting
        // page numbers to host the rebuilt head trunks. Consumed trunk
        // pages are recycled into `freed`.
        let mut total = total0;
        let mut reuse: Vec<u64> = Vec::new();
        let mut node_size = if total0 > 0 { head_size(total0) } else { 0 };
        while self.head != 0 && (reuse.len() * TRUNK_CAP < freed.len() || popn > 0) {
            let node = src.fetch(self.head)?;
            freed.push(self.head);
            let size = node_size;
            if popn >= size {
                // All pointers in this trunk are consumed.
                popn -= size;
            } else {
                // Some survive: host the new trunks in pages taken from
                // the list itself, spill the rest back into `freed`.
                let mut remain = size - popn;
                popn = 0;
                while remain > 0
                    && reuse.len() * TRUNK_CAP < freed.len() + remain as usize
                {
                    remain -= 1;
                    reuse.push(trunk_ptr(&node, remain as usize));
                }
                for i in 0..remain {
                    freed.push(trunk_ptr(&node, i as usize));
                }
            }
            total -= size;
            self.head = trunk_next(&node);
            node_size = TRUNK_CAP as u64;
        }
        debug_assert!(reuse.len() * TRUNK_CAP >= freed.len() || self.head == 0);

        let freed_count = freed.len() as u64;
        let extra = self.push(src, freed, reuse)?;

        let new_total = total + freed_count + extra;
        if self.head != 0 {
            let mut head = src.fetch(self.head)?;
            trunk_set_total(&mut head, new_total);
            src.reuse(self.head, head);
        }
        Ok(())
    }

    /// Prepends `freed` pointers as new trunk nodes, hosted in `reuse`
    /// pages while any remain. Returns the number of surplus host pages
    /// that were folded back into the list as ordinary pointers.
    fn push<S: TrunkStore>(
        &mut self,
        src: &mut S,
        mut freed: Vec<u64>,
        mut reuse: Vec<u64>,
    ) -> Result<u64> {
        while !freed.is_empty() {
            let size = freed.len().min(TRUNK_CAP);
            let mut node = trunk_new(self.head);
            for (i, ptr) in freed[..size].iter().enumerate() {
                trunk_set_ptr(&mut node, i, *ptr);
            }
            freed.drain(..size);

            if reuse.is_empty() {
                self.head = src.append(node)?;
            } else {
                self.head = reuse.remove(0);
                src.reuse(self.head, node);
            }
        }

        if reuse.is_empty() {
            return Ok(0);
        }
        // The harvest can overshoot by one host page at a trunk-capacity
        // boundary. Surplus hosts are still free pages: store them as
        // pointers in one more trunk rather than leaking them.
        let extra = reuse.len() as u64;
        self.push(src, reuse, Vec::new())?;
        Ok(extra)
    }
}
