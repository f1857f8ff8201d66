//! # Master Page
//!
//! Page 0 is the durable root of the store. Its first bytes identify the
//! file and locate everything else: the B+tree root, the number of pages
//! ever allocated, and the head of the free list.
//!
//! ## Layout (64 bytes at file offset 0)
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  ----------------------------------------
//! 0       16    signature   "DungeonDB01" zero-padded to 16 bytes
//! 16      8     tree_root   B+tree root page (0 = empty tree)
//! 24      8     page_used   Total pages ever allocated (>= 1)
//! 32      8     free_head   Free-list head trunk page (0 = empty list)
//! 40      24    reserved    Zero
//! ```
//!
//! All integers are little-endian. The struct is written with a positional
//! file write so the commit point is a single small aligned write, which
//! common filesystems perform atomically.
//!
//! An empty (0-byte) file is a fresh store: no master page exists yet and
//! page 0 is reserved for it on the first commit.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// File signature, zero-padded to 16 bytes.
pub const DB_SIGNATURE: &[u8; 16] = b"DungeonDB01\0\0\0\0\0";

pub const MASTER_PAGE_SIZE: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MasterPage {
    signature: [u8; 16],
    tree_root: U64,
    page_used: U64,
    free_head: U64,
    reserved: [u8; 24],
}

const _: () = assert!(std::mem::size_of::<MasterPage>() == MASTER_PAGE_SIZE);

impl MasterPage {
    pub fn new(tree_root: u64, page_used: u64, free_head: u64) -> Self {
        Self {
            signature: *DB_SIGNATURE,
            tree_root: U64::new(tree_root),
            page_used: U64::new(page_used),
            free_head: U64::new(free_head),
            reserved: [0u8; 24],
        }
    }

    /// Parses and validates the master page against the actual file size.
    pub fn load(bytes: &[u8], file_pages: u64) -> Result<Self> {
        ensure!(
            bytes.len() >= MASTER_PAGE_SIZE,
            "buffer too small for master page: {} < {}",
            bytes.len(),
            MASTER_PAGE_SIZE
        );

        let master = Self::read_from_bytes(&bytes[..MASTER_PAGE_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse master page: {:?}", e))?;

        ensure!(
            &master.signature == DB_SIGNATURE,
            "bad signature in master page"
        );

        let used = master.page_used.get();
        let root = master.tree_root.get();
        let free_head = master.free_head.get();
        ensure!(
            used >= 1 && used <= file_pages,
            "bad master page: page_used {} out of range (file has {} pages)",
            used,
            file_pages
        );
        ensure!(
            root < used,
            "bad master page: tree_root {} >= page_used {}",
            root,
            used
        );
        ensure!(
            free_head < used,
            "bad master page: free_head {} >= page_used {}",
            free_head,
            used
        );

        Ok(master)
    }

    pub fn tree_root(&self) -> u64 {
        self.tree_root.get()
    }

    pub fn page_used(&self) -> u64 {
        self.page_used.get()
    }

    pub fn free_head(&self) -> u64 {
        self.free_head.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn master_page_is_64_bytes() {
        assert_eq!(std::mem::size_of::<MasterPage>(), MASTER_PAGE_SIZE);
    }

    #[test]
    fn round_trips_through_bytes() {
        let master = MasterPage::new(7, 42, 9);

        let loaded = MasterPage::load(master.as_bytes(), 100).unwrap();

        assert_eq!(loaded.tree_root(), 7);
        assert_eq!(loaded.page_used(), 42);
        assert_eq!(loaded.free_head(), 9);
    }

    #[test]
    fn signature_matches_spec_literal() {
        let master = MasterPage::new(0, 1, 0);

        assert_eq!(&master.as_bytes()[..16], b"DungeonDB01\0\0\0\0\0");
    }

    #[test]
    fn rejects_bad_signature() {
        let master = MasterPage::new(0, 1, 0);
        let mut bytes = master.as_bytes().to_vec();
        bytes[0] = b'X';

        assert!(MasterPage::load(&bytes, 10).is_err());
    }

    #[test]
    fn rejects_page_used_beyond_file() {
        let master = MasterPage::new(0, 11, 0);

        assert!(MasterPage::load(master.as_bytes(), 10).is_err());
    }

    #[test]
    fn rejects_zero_page_used() {
        let master = MasterPage::new(0, 0, 0);

        assert!(MasterPage::load(master.as_bytes(), 10).is_err());
    }

    #[test]
    fn rejects_root_outside_used_range() {
        let master = MasterPage::new(5, 5, 0);

        assert!(MasterPage::load(master.as_bytes(), 10).is_err());
    }

    #[test]
    fn rejects_free_head_outside_used_range() {
        let master = MasterPage::new(0, 3, 3);

        assert!(MasterPage::load(master.as_bytes(), 10).is_err());
    }
}
