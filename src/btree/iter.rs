//! # Bidirectional Tree Cursor
//!
//! `BIter` holds the path from the root to the current leaf position as
//! parallel stacks of owned node copies and in-node indexes. Crossing a
//! node boundary recurses one level up and descends into the sibling's
//! edge. The cursor works on page-number indirection only; it never holds
//! references into the backing store, so the mapping may grow freely while
//! a cursor is alive.
//!
//! Stepping past the last entry parks the cursor one position past the end
//! and `valid()` turns false. Stepping backwards stops at the sentinel
//! entry at index 0 of the leftmost leaf, whose empty key sorts below any
//! real key and therefore fails every range check.

use eyre::Result;

use super::node::{BNode, NodeType};
use super::tree::BTree;
use super::{Cmp, PageSource};

pub struct BIter<'a, S: PageSource> {
    src: &'a S,
    path: Vec<BNode>,
    pos: Vec<usize>,
}

impl BTree {
    /// Positions a cursor at the closest entry <= `key`.
    pub fn seek_le<'a, S: PageSource>(&self, src: &'a S, key: &[u8]) -> Result<BIter<'a, S>> {
        let mut iter = BIter {
            src,
            path: Vec::new(),
            pos: Vec::new(),
        };
        let mut ptr = self.root;
        while ptr != 0 {
            let node = src.fetch(ptr)?;
            let idx = node.lookup_le(key);
            ptr = if node.kind() == NodeType::Internal {
                node.ptr(idx)
            } else {
                0
            };
            iter.path.push(node);
            iter.pos.push(idx);
        }
        Ok(iter)
    }

    /// Positions a cursor at the closest entry satisfying `key <cmp> target`.
    pub fn seek<'a, S: PageSource>(
        &self,
        src: &'a S,
        key: &[u8],
        cmp: Cmp,
    ) -> Result<BIter<'a, S>> {
        let mut iter = self.seek_le(src, key)?;
        if cmp != Cmp::Le && iter.valid() {
            let (current, _) = iter.deref();
            if !cmp.ok(current, key) {
                // Off by one: move towards the satisfying side.
                if cmp.is_greater_side() {
                    iter.next()?;
                } else {
                    iter.prev()?;
                }
            }
        }
        Ok(iter)
    }
}

impl<'a, S: PageSource> BIter<'a, S> {
    /// The key and value at the current position. Caller must check
    /// `valid()` first.
    pub fn deref(&self) -> (&[u8], &[u8]) {
        let node = self.path.last().expect("deref on empty iterator");
        let idx = *self.pos.last().unwrap();
        (node.key(idx), node.val(idx))
    }

    pub fn valid(&self) -> bool {
        match (self.path.last(), self.pos.last()) {
            (Some(node), Some(&idx)) => idx < node.nkeys(),
            _ => false,
        }
    }

    pub fn next(&mut self) -> Result<()> {
        if self.path.is_empty() {
            return Ok(());
        }
        self.move_next(self.path.len() - 1).map(|_| ())
    }

    pub fn prev(&mut self) -> Result<()> {
        if self.path.is_empty() {
            return Ok(());
        }
        self.move_prev(self.path.len() - 1).map(|_| ())
    }

    /// Advances at `level`, descending into the sibling's left edge after a
    /// boundary crossing. Returns false when the whole tree is exhausted;
    /// the leaf position is then parked one past the end.
    fn move_next(&mut self, level: usize) -> Result<bool> {
        if self.pos[level] + 1 < self.path[level].nkeys() {
            self.pos[level] += 1;
        } else if level > 0 {
            if !self.move_next(level - 1)? {
                return Ok(false);
            }
        } else {
            *self.pos.last_mut().unwrap() += 1;
            return Ok(false);
        }
        if level + 1 < self.pos.len() {
            let kid = self.src.fetch(self.path[level].ptr(self.pos[level]))?;
            self.pos[level + 1] = 0;
            self.path[level + 1] = kid;
        }
        Ok(true)
    }

    /// Retreats at `level`, descending into the sibling's right edge after
    /// a boundary crossing. Returns false at the sentinel entry.
    fn move_prev(&mut self, level: usize) -> Result<bool> {
        if self.pos[level] > 0 {
            self.pos[level] -= 1;
        } else if level > 0 {
            if !self.move_prev(level - 1)? {
                return Ok(false);
            }
        } else {
            return Ok(false);
        }
        if level + 1 < self.pos.len() {
            let kid = self.src.fetch(self.path[level].ptr(self.pos[level]))?;
            self.pos[level + 1] = kid.nkeys() - 1;
            self.path[level + 1] = kid;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tree::{InsertRequest, WriteMode};
    use super::*;
    use eyre::ensure;
    use hashbrown::HashMap;

    #[derive(Default)]
    struct MemPages {
        pages: HashMap<u64, Vec<u8>>,
        next: u64,
    }

    impl PageSource for MemPages {
        fn fetch(&self, ptr: u64) -> Result<BNode> {
            let data = self
                .pages
                .get(&ptr)
                .ok_or_else(|| eyre::eyre!("page {} not found", ptr))?;
            Ok(BNode::from_bytes(data.clone()))
        }

        fn allocate(&mut self, node: BNode) -> Result<u64> {
            ensure!(
                node.nbytes() <= crate::storage::PAGE_SIZE,
                "node overflows a page"
            );
            self.next += 1;
            self.pages.insert(self.next, node.into_data());
            Ok(self.next)
        }

        fn free(&mut self, ptr: u64) {
            self.pages.remove(&ptr);
        }
    }

    fn tree_with(keys: &[&str]) -> (BTree, MemPages) {
        let mut src = MemPages::default();
        let mut tree = BTree::default();
        for key in keys {
            let mut req = InsertRequest::new(key.as_bytes(), key.as_bytes(), WriteMode::Upsert);
            tree.update(&mut src, &mut req).unwrap();
        }
        (tree, src)
    }

    fn multi_level_tree() -> (BTree, MemPages, Vec<String>) {
        let mut src = MemPages::default();
        let mut tree = BTree::default();
        let mut keys = Vec::new();
        for i in 0u32..20 {
            let key = format!("key{:04}", i);
            let value = [i as u8; 500];
            let mut req = InsertRequest::new(key.as_bytes(), &value, WriteMode::Upsert);
            tree.update(&mut src, &mut req).unwrap();
            keys.push(key);
        }
        (tree, src, keys)
    }

    #[test]
    fn seek_le_lands_on_exact_key() {
        let (tree, src) = tree_with(&["a", "b", "c"]);

        let iter = tree.seek_le(&src, b"b").unwrap();

        assert!(iter.valid());
        assert_eq!(iter.deref().0, b"b");
    }

    #[test]
    fn seek_le_lands_on_floor_of_missing_key() {
        let (tree, src) = tree_with(&["a", "c"]);

        let iter = tree.seek_le(&src, b"b").unwrap();

        assert_eq!(iter.deref().0, b"a");
    }

    #[test]
    fn seek_ge_steps_past_floor() {
        let (tree, src) = tree_with(&["a", "c"]);

        let iter = tree.seek(&src, b"b", Cmp::Ge).unwrap();

        assert_eq!(iter.deref().0, b"c");
    }

    #[test]
    fn seek_gt_skips_exact_match() {
        let (tree, src) = tree_with(&["a", "b", "c"]);

        let iter = tree.seek(&src, b"b", Cmp::Gt).unwrap();

        assert_eq!(iter.deref().0, b"c");
    }

    #[test]
    fn seek_lt_steps_before_exact_match() {
        let (tree, src) = tree_with(&["a", "b", "c"]);

        let iter = tree.seek(&src, b"b", Cmp::Lt).unwrap();

        assert_eq!(iter.deref().0, b"a");
    }

    #[test]
    fn next_walks_keys_in_order() {
        let (tree, src) = tree_with(&["a", "b", "c"]);
        let mut iter = tree.seek(&src, b"a", Cmp::Ge).unwrap();

        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.deref().0.to_vec());
            iter.next().unwrap();
        }

        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn next_crosses_leaf_boundaries() {
        let (tree, src, keys) = multi_level_tree();
        let mut iter = tree.seek(&src, keys[0].as_bytes(), Cmp::Ge).unwrap();

        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(String::from_utf8(iter.deref().0.to_vec()).unwrap());
            iter.next().unwrap();
        }

        assert_eq!(seen, keys);
    }

    #[test]
    fn prev_walks_keys_in_reverse() {
        let (tree, src, keys) = multi_level_tree();
        let last = keys.last().unwrap();
        let mut iter = tree.seek(&src, last.as_bytes(), Cmp::Le).unwrap();

        let mut seen = Vec::new();
        loop {
            let (key, _) = iter.deref();
            if key.is_empty() {
                break; // sentinel: start of the key space
            }
            seen.push(String::from_utf8(key.to_vec()).unwrap());
            iter.prev().unwrap();
        }

        let mut expected = keys.clone();
        expected.reverse();
        assert_eq!(seen, expected);
    }

    #[test]
    fn iterator_past_end_is_invalid() {
        let (tree, src) = tree_with(&["a"]);
        let mut iter = tree.seek(&src, b"a", Cmp::Ge).unwrap();

        iter.next().unwrap();

        assert!(!iter.valid());
    }

    #[test]
    fn seek_on_empty_tree_is_invalid() {
        let src = MemPages::default();
        let tree = BTree::default();

        let iter = tree.seek(&src, b"a", Cmp::Ge).unwrap();

        assert!(!iter.valid());
    }
}
