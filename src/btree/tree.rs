//! # Tree Operations
//!
//! Copy-on-write insert and delete. Every mutation rebuilds the affected
//! nodes bottom-up: the leaf is rewritten into a fresh (possibly
//! oversized) node, split into 1-3 page-sized pieces, and the parent is
//! rewritten to link the pieces, recursively up to the root.
//!
//! Pages visited along the path are deallocated only after the recursive
//! step below them succeeds, so a rejected precondition (insert-only on an
//! existing key, update-only on a missing key) propagates out with the
//! update buffer untouched.
//!
//! ## Sentinel Entry
//!
//! The very first insert creates a leaf with a zero-length sentinel key at
//! index 0 before the real key. The sentinel makes the tree cover the
//! whole key space, so descending by `lookup_le` always lands in a
//! containing node. Deleting the last real key removes the root entirely
//! (`root` returns to 0) rather than leaving a sentinel-only leaf behind.
//!
//! ## Merging
//!
//! After a delete, a child smaller than a quarter page is merged with a
//! neighbor sibling when their combined size (sharing one header) fits a
//! page. An internal root left with a single child is promoted, shrinking
//! the tree by one level.

use eyre::{bail, ensure, Result};
use smallvec::{smallvec, SmallVec};

use super::node::{BNode, NodeType};
use super::{PageSource, MAX_KEY_SIZE, MAX_VALUE_SIZE, NODE_HEADER_SIZE};
use crate::storage::PAGE_SIZE;

/// Behavior when the key does / does not already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Insert or replace.
    #[default]
    Upsert,
    /// Fail if the key already exists.
    InsertOnly,
    /// Fail if the key does not exist.
    UpdateOnly,
}

/// An insert request and its outcome.
#[derive(Debug)]
pub struct InsertRequest<'a> {
    pub key: &'a [u8],
    pub val: &'a [u8],
    pub mode: WriteMode,
    /// A new key was added.
    pub added: bool,
    /// The stored value changed (true for adds as well).
    pub updated: bool,
    /// Previous value, when an existing key was replaced.
    pub old: Option<Vec<u8>>,
}

impl<'a> InsertRequest<'a> {
    pub fn new(key: &'a [u8], val: &'a [u8], mode: WriteMode) -> Self {
        Self {
            key,
            val,
            mode,
            added: false,
            updated: false,
            old: None,
        }
    }
}

/// A delete request; `old` receives the removed value.
#[derive(Debug)]
pub struct DeleteRequest<'a> {
    pub key: &'a [u8],
    pub old: Option<Vec<u8>>,
}

impl<'a> DeleteRequest<'a> {
    pub fn new(key: &'a [u8]) -> Self {
        Self { key, old: None }
    }
}

/// The tree is just a root pointer; pages come from a [`PageSource`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BTree {
    pub root: u64,
}

impl BTree {
    pub fn new(root: u64) -> Self {
        Self { root }
    }

    /// Looks up the value stored under `key`.
    pub fn get<S: PageSource>(&self, src: &S, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root == 0 {
            return Ok(None);
        }
        let mut node = src.fetch(self.root)?;
        loop {
            let idx = node.lookup_le(key);
            match node.kind() {
                NodeType::Leaf => {
                    if node.key(idx) == key {
                        return Ok(Some(node.val(idx).to_vec()));
                    }
                    return Ok(None);
                }
                NodeType::Internal => {
                    node = src.fetch(node.ptr(idx))?;
                }
                other => bail!("unexpected node type {:?} during lookup", other),
            }
        }
    }

    /// Inserts or replaces a key according to the request mode.
    pub fn update<S: PageSource>(&mut self, src: &mut S, req: &mut InsertRequest) -> Result<()> {
        ensure!(!req.key.is_empty(), "empty keys are not allowed");
        ensure!(
            req.key.len() <= MAX_KEY_SIZE,
            "key of {} bytes exceeds the {} byte limit",
            req.key.len(),
            MAX_KEY_SIZE
        );
        ensure!(
            req.val.len() <= MAX_VALUE_SIZE,
            "value of {} bytes exceeds the {} byte limit",
            req.val.len(),
            MAX_VALUE_SIZE
        );

        if self.root == 0 {
            if req.mode == WriteMode::UpdateOnly {
                bail!("update-only: key not found");
            }
            // First insert: the sentinel entry at index 0 makes every
            // future lookup find a containing node.
            let mut root = BNode::new();
            root.set_header(NodeType::Leaf, 2);
            root.append_kv(0, 0, b"", b"");
            root.append_kv(1, 0, req.key, req.val);
            self.root = src.allocate(root)?;
            req.added = true;
            req.updated = true;
            return Ok(());
        }

        let root_node = src.fetch(self.root)?;
        let grown = tree_insert(src, root_node, req)?;
        src.free(self.root);

        let mut split = node_split3(grown);
        if split.len() > 1 {
            // The root itself split: add a level above the pieces.
            let mut root = BNode::new();
            root.set_header(NodeType::Internal, split.len());
            for (i, kid) in split.drain(..).enumerate() {
                let first_key = kid.key(0).to_vec();
                let ptr = src.allocate(kid)?;
                root.append_kv(i, ptr, &first_key, b"");
            }
            self.root = src.allocate(root)?;
        } else {
            self.root = src.allocate(split.remove(0))?;
        }
        Ok(())
    }

    /// Deletes a key; returns false (leaving the tree untouched) when the
    /// key is absent.
    pub fn delete<S: PageSource>(&mut self, src: &mut S, req: &mut DeleteRequest) -> Result<bool> {
        ensure!(!req.key.is_empty(), "empty keys are not allowed");
        ensure!(
            req.key.len() <= MAX_KEY_SIZE,
            "key of {} bytes exceeds the {} byte limit",
            req.key.len(),
            MAX_KEY_SIZE
        );
        if self.root == 0 {
            return Ok(false);
        }

        let root_node = src.fetch(self.root)?;
        let Some(updated) = tree_delete(src, root_node, req)? else {
            return Ok(false);
        };

        src.free(self.root);
        if updated.kind() == NodeType::Internal && updated.nkeys() == 1 {
            // Remove a level.
            self.root = updated.ptr(0);
        } else if updated.kind() == NodeType::Leaf && updated.nkeys() == 1 {
            // Only the sentinel remains: the tree is empty.
            self.root = 0;
        } else {
            self.root = src.allocate(updated)?;
        }
        Ok(true)
    }
}

/// Inserts into `node`, returning the rewritten (possibly oversized)
/// replacement. The caller deallocates `node`'s page and splits the result.
fn tree_insert<S: PageSource>(
    src: &mut S,
    node: BNode,
    req: &mut InsertRequest,
) -> Result<BNode> {
    let idx = node.lookup_le(req.key);
    match node.kind() {
        NodeType::Leaf => {
            let mut new = BNode::scratch();
            if node.key(idx) == req.key {
                if req.mode == WriteMode::InsertOnly {
                    bail!("insert-only: key already exists");
                }
                let old = node.val(idx).to_vec();
                req.updated = old != req.val;
                req.old = Some(old);
                leaf_update(&mut new, &node, idx, req.key, req.val);
            } else {
                if req.mode == WriteMode::UpdateOnly {
                    bail!("update-only: key not found");
                }
                req.added = true;
                req.updated = true;
                leaf_insert(&mut new, &node, idx + 1, req.key, req.val);
            }
            Ok(new)
        }
        NodeType::Internal => node_insert(src, node, idx, req),
        other => bail!("unexpected node type {:?} during insert", other),
    }
}

/// Recursive step for internal nodes: rewrite the child, split it, and
/// relink the parent to the split pieces.
fn node_insert<S: PageSource>(
    src: &mut S,
    node: BNode,
    idx: usize,
    req: &mut InsertRequest,
) -> Result<BNode> {
    let kptr = node.ptr(idx);
    let knode = src.fetch(kptr)?;
    let grown = tree_insert(src, knode, req)?;
    src.free(kptr);

    let split = node_split3(grown);
    node_replace_kid_n(src, &node, idx, split)
}

/// Replaces one child link with the links to `kids`, copying each kid's
/// first key up as its separator.
fn node_replace_kid_n<S: PageSource>(
    src: &mut S,
    old: &BNode,
    idx: usize,
    kids: SmallVec<[BNode; 3]>,
) -> Result<BNode> {
    let inc = kids.len();
    let mut new = BNode::scratch();
    new.set_header(NodeType::Internal, old.nkeys() + inc - 1);
    new.append_range(old, 0, 0, idx);
    for (i, kid) in kids.into_iter().enumerate() {
        let first_key = kid.key(0).to_vec();
        let ptr = src.allocate(kid)?;
        new.append_kv(idx + i, ptr, &first_key, b"");
    }
    new.append_range(old, idx + inc, idx + 1, old.nkeys() - (idx + 1));
    Ok(new)
}

fn leaf_insert(new: &mut BNode, old: &BNode, idx: usize, key: &[u8], val: &[u8]) {
    new.set_header(NodeType::Leaf, old.nkeys() + 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx, old.nkeys() - idx);
}

fn leaf_update(new: &mut BNode, old: &BNode, idx: usize, key: &[u8], val: &[u8]) {
    new.set_header(NodeType::Leaf, old.nkeys());
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx + 1, old.nkeys() - (idx + 1));
}

fn leaf_delete(new: &mut BNode, old: &BNode, idx: usize) {
    new.set_header(NodeType::Leaf, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_range(old, idx, idx + 1, old.nkeys() - (idx + 1));
}

/// Splits an in-order node in two so that the right half fits a page.
/// The left half may still be oversized when a near-page-sized pair sits
/// near the front; the caller splits it again.
fn node_split2(old: &BNode) -> (BNode, BNode) {
    assert!(old.nkeys() >= 2, "cannot split a node with fewer than 2 keys");

    // Start from an even key count and shrink the left half until its
    // serialized size fits, then grow it back while the right overflows.
    let mut nleft = old.nkeys() / 2;
    let left_bytes = |nleft: usize| NODE_HEADER_SIZE + 10 * nleft + old.offset(nleft);
    while left_bytes(nleft) > PAGE_SIZE {
        nleft -= 1;
    }
    assert!(nleft >= 1);
    let right_bytes = |nleft: usize| old.nbytes() - left_bytes(nleft) + NODE_HEADER_SIZE;
    while right_bytes(nleft) > PAGE_SIZE {
        nleft += 1;
    }
    assert!(nleft < old.nkeys());
    let nright = old.nkeys() - nleft;

    let mut left = BNode::scratch();
    let mut right = BNode::new();
    left.set_header(old.kind(), nleft);
    right.set_header(old.kind(), nright);
    left.append_range(old, 0, 0, nleft);
    right.append_range(old, 0, nleft, nright);

    assert!(right.nbytes() <= PAGE_SIZE);
    (left, right)
}

/// Splits an oversized node into 1-3 page-sized nodes, preserving order.
fn node_split3(mut old: BNode) -> SmallVec<[BNode; 3]> {
    if old.nbytes() <= PAGE_SIZE {
        old.truncate_to_page();
        return smallvec![old];
    }
    let (mut left, right) = node_split2(&old);
    if left.nbytes() <= PAGE_SIZE {
        left.truncate_to_page();
        return smallvec![left, right];
    }
    let (mut leftleft, middle) = node_split2(&left);
    leftleft.truncate_to_page();
    assert!(leftleft.nbytes() <= PAGE_SIZE);
    smallvec![leftleft, middle, right]
}

/// Deletes from `node`; `None` means the key was not found and nothing
/// was touched.
fn tree_delete<S: PageSource>(
    src: &mut S,
    node: BNode,
    req: &mut DeleteRequest,
) -> Result<Option<BNode>> {
    let idx = node.lookup_le(req.key);
    match node.kind() {
        NodeType::Leaf => {
            if node.key(idx) != req.key {
                return Ok(None);
            }
            req.old = Some(node.val(idx).to_vec());
            let mut new = BNode::new();
            leaf_delete(&mut new, &node, idx);
            Ok(Some(new))
        }
        NodeType::Internal => node_delete(src, node, idx, req),
        other => bail!("unexpected node type {:?} during delete", other),
    }
}

enum MergeDir {
    None,
    Left(BNode),
    Right(BNode),
}

fn node_delete<S: PageSource>(
    src: &mut S,
    node: BNode,
    idx: usize,
    req: &mut DeleteRequest,
) -> Result<Option<BNode>> {
    let kptr = node.ptr(idx);
    let knode = src.fetch(kptr)?;
    let Some(updated) = tree_delete(src, knode, req)? else {
        return Ok(None);
    };
    src.free(kptr);

    let new = match should_merge(src, &node, idx, &updated)? {
        MergeDir::Left(sibling) => {
            let merged = node_merge(&sibling, &updated);
            src.free(node.ptr(idx - 1));
            let first_key = merged.key(0).to_vec();
            let ptr = src.allocate(merged)?;
            node_replace_2kid(&node, idx - 1, ptr, &first_key)
        }
        MergeDir::Right(sibling) => {
            let merged = node_merge(&updated, &sibling);
            src.free(node.ptr(idx + 1));
            let first_key = merged.key(0).to_vec();
            let ptr = src.allocate(merged)?;
            node_replace_2kid(&node, idx, ptr, &first_key)
        }
        MergeDir::None => {
            assert!(updated.nkeys() > 0);
            node_replace_kid_n(src, &node, idx, smallvec![updated])?
        }
    };
    Ok(Some(new))
}

/// A shrunken child merges with a sibling when it is smaller than a
/// quarter page and the pair fits one page sharing a single header.
fn should_merge<S: PageSource>(
    src: &S,
    node: &BNode,
    idx: usize,
    updated: &BNode,
) -> Result<MergeDir> {
    if updated.nbytes() > PAGE_SIZE / 4 {
        return Ok(MergeDir::None);
    }
    if idx > 0 {
        let sibling = src.fetch(node.ptr(idx - 1))?;
        let merged = sibling.nbytes() + updated.nbytes() - NODE_HEADER_SIZE;
        if merged <= PAGE_SIZE {
            return Ok(MergeDir::Left(sibling));
        }
    }
    if idx + 1 < node.nkeys() {
        let sibling = src.fetch(node.ptr(idx + 1))?;
        let merged = sibling.nbytes() + updated.nbytes() - NODE_HEADER_SIZE;
        if merged <= PAGE_SIZE {
            return Ok(MergeDir::Right(sibling));
        }
    }
    Ok(MergeDir::None)
}

fn node_merge(left: &BNode, right: &BNode) -> BNode {
    let mut new = BNode::new();
    new.set_header(left.kind(), left.nkeys() + right.nkeys());
    new.append_range(left, 0, 0, left.nkeys());
    new.append_range(right, left.nkeys(), 0, right.nkeys());
    new
}

/// Replaces two adjacent child links with the single merged child.
fn node_replace_2kid(old: &BNode, idx: usize, ptr: u64, key: &[u8]) -> BNode {
    let mut new = BNode::new();
    new.set_header(NodeType::Internal, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, ptr, key, b"");
    new.append_range(old, idx + 1, idx + 2, old.nkeys() - (idx + 2));
    new
}
