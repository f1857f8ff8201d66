//! # Chunked Memory-Mapped Page Access
//!
//! `PageStore` owns the database file and a list of memory-mapped chunks
//! covering it. Pages are addressed by a 64-bit page number; `page_ref`
//! walks the chunk list and hands back a borrowed slice into the mapping.
//!
//! ## Growth Strategy
//!
//! The file and the mapping grow independently:
//!
//! - `ensure_file` extends the on-disk size exponentially
//!   (`new = old + max(1, old / 8)`), so appends do not pay a truncate
//!   syscall per page.
//! - `ensure_mmap` appends a new chunk that doubles the mapped span.
//!   Existing chunks stay valid for the lifetime of the store; they are
//!   appended, never remapped or coalesced, so borrowed page references
//!   are never invalidated by growth.
//!
//! The initial mapping is 64 MiB (doubled until it covers the file), which
//! can exceed the file size. Pages past the end of the file are mapped but
//! must not be touched until `ensure_file` has extended the file over them.
//!
//! ## Master Page Writes
//!
//! The master page is written with a positional file write, never through
//! the mapping. A small aligned `pwrite` is atomic on common filesystems;
//! a memcpy into the mapping is not.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};

use super::PAGE_SIZE;

/// Initial mapped span; doubled until it covers the file.
const INITIAL_MMAP_BYTES: u64 = 64 << 20;

#[derive(Debug)]
pub struct PageStore {
    file: File,
    /// True on-disk size in pages.
    file_pages: u64,
    /// Total mapped span in bytes, across all chunks.
    mapped_bytes: u64,
    /// Offset-ordered mapping chunks; chunk `i` starts where `i-1` ends.
    chunks: Vec<MmapMut>,
}

impl PageStore {
    /// Opens the database file, creating it if absent, and maps it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "database file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let mut map_len = INITIAL_MMAP_BYTES;
        while map_len < file_size {
            map_len *= 2;
        }

        // SAFETY: mapping a file we opened read/write is unsafe because the
        // file could be modified externally. This is acceptable because:
        // 1. Database files are owned by a single process by contract.
        // 2. The mapping may extend past EOF; those pages are never touched
        //    before ensure_file() has grown the file over them.
        // 3. Chunk lifetimes are tied to PageStore, preventing use-after-unmap.
        let chunk = unsafe {
            MmapOptions::new()
                .len(map_len as usize)
                .map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            file_pages: file_size / PAGE_SIZE as u64,
            mapped_bytes: map_len,
            chunks: vec![chunk],
        })
    }

    pub fn file_pages(&self) -> u64 {
        self.file_pages
    }

    /// Borrows the page at `ptr` from the mapping.
    pub fn page_ref(&self, ptr: u64) -> Result<&[u8]> {
        ensure!(
            ptr < self.file_pages,
            "page {} out of bounds (file has {} pages)",
            ptr,
            self.file_pages
        );

        let mut start = 0u64;
        for chunk in &self.chunks {
            let end = start + chunk.len() as u64 / PAGE_SIZE as u64;
            if ptr < end {
                let offset = (ptr - start) as usize * PAGE_SIZE;
                return Ok(&chunk[offset..offset + PAGE_SIZE]);
            }
            start = end;
        }
        eyre::bail!("page {} not covered by any mapping chunk", ptr);
    }

    /// Copies `data` into the mapping at the target page offset.
    pub fn write_page(&mut self, ptr: u64, data: &[u8]) -> Result<()> {
        ensure!(
            ptr < self.file_pages,
            "page {} out of bounds (file has {} pages)",
            ptr,
            self.file_pages
        );
        ensure!(
            data.len() <= PAGE_SIZE,
            "page data of {} bytes exceeds page size",
            data.len()
        );

        let mut start = 0u64;
        for chunk in &mut self.chunks {
            let end = start + chunk.len() as u64 / PAGE_SIZE as u64;
            if ptr < end {
                let offset = (ptr - start) as usize * PAGE_SIZE;
                chunk[offset..offset + data.len()].copy_from_slice(data);
                return Ok(());
            }
            start = end;
        }
        eyre::bail!("page {} not covered by any mapping chunk", ptr);
    }

    /// Grows the file until it holds at least `npages` pages.
    pub fn ensure_file(&mut self, npages: u64) -> Result<()> {
        if self.file_pages >= npages {
            return Ok(());
        }

        let mut file_pages = self.file_pages;
        while file_pages < npages {
            // Exponential growth amortizes the truncate syscalls.
            file_pages += (file_pages / 8).max(1);
        }

        let file_size = file_pages * PAGE_SIZE as u64;
        self.file
            .set_len(file_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", file_size))?;
        self.file_pages = file_pages;
        Ok(())
    }

    /// Extends the mapped span until it covers at least `npages` pages.
    pub fn ensure_mmap(&mut self, npages: u64) -> Result<()> {
        while self.mapped_bytes < npages * PAGE_SIZE as u64 {
            // SAFETY: same contract as the initial mapping in open(). The new
            // chunk starts exactly where the previous chunks end, so page
            // numbers translate to a unique (chunk, offset) pair.
            let chunk = unsafe {
                MmapOptions::new()
                    .offset(self.mapped_bytes)
                    .len(self.mapped_bytes as usize)
                    .map_mut(&self.file)
                    .wrap_err("failed to extend memory mapping")?
            };
            self.chunks.push(chunk);
            self.mapped_bytes *= 2;
        }
        Ok(())
    }

    /// Syncs every mapping chunk to disk (msync).
    pub fn sync_pages(&self) -> Result<()> {
        for chunk in &self.chunks {
            chunk.flush().wrap_err("failed to sync mapped pages")?;
        }
        Ok(())
    }

    /// Writes the master page bytes at offset 0 with a positional write,
    /// bypassing the mapping.
    pub fn write_master(&self, data: &[u8]) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file
                .write_all_at(data, 0)
                .wrap_err("failed to write master page")?;
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut written = 0;
            while written < data.len() {
                let n = self
                    .file
                    .seek_write(&data[written..], written as u64)
                    .wrap_err("failed to write master page")?;
                written += n;
            }
        }
        Ok(())
    }

    /// Syncs the file itself (fsync), flushing the master page write.
    pub fn sync_file(&self) -> Result<()> {
        self.file.sync_all().wrap_err("failed to sync database file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let dir = tempfile::tempdir().unwrap();
        dir.keep().join(name)
    }

    #[test]
    fn open_creates_missing_file() {
        let path = temp_path("fresh.db");

        let store = PageStore::open(&path).unwrap();

        assert_eq!(store.file_pages(), 0);
        assert!(path.exists());
    }

    #[test]
    fn open_rejects_unaligned_file() {
        let path = temp_path("unaligned.db");
        std::fs::write(&path, vec![0u8; PAGE_SIZE + 7]).unwrap();

        let result = PageStore::open(&path);

        assert!(result.is_err());
    }

    #[test]
    fn page_ref_rejects_out_of_bounds() {
        let path = temp_path("oob.db");
        let store = PageStore::open(&path).unwrap();

        assert!(store.page_ref(0).is_err());
    }

    #[test]
    fn ensure_file_grows_exponentially() {
        let path = temp_path("grow.db");
        let mut store = PageStore::open(&path).unwrap();

        store.ensure_file(3).unwrap();

        // 0 -> 1 -> 2 -> 3: small sizes grow by one page at a time.
        assert_eq!(store.file_pages(), 3);
        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert_eq!(on_disk, 3 * PAGE_SIZE as u64);
    }

    #[test]
    fn ensure_file_overshoots_at_scale() {
        let path = temp_path("grow_big.db");
        let mut store = PageStore::open(&path).unwrap();
        store.ensure_file(64).unwrap();

        store.ensure_file(65).unwrap();

        // 64 + 64/8 = 72 pages after one growth step.
        assert_eq!(store.file_pages(), 72);
    }

    #[test]
    fn write_page_then_page_ref_round_trips() {
        let path = temp_path("rw.db");
        let mut store = PageStore::open(&path).unwrap();
        store.ensure_file(2).unwrap();
        store.ensure_mmap(2).unwrap();

        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = 0xab;
        page[PAGE_SIZE - 1] = 0xcd;
        store.write_page(1, &page).unwrap();

        let read = store.page_ref(1).unwrap();
        assert_eq!(read[0], 0xab);
        assert_eq!(read[PAGE_SIZE - 1], 0xcd);
    }

    #[test]
    fn pages_survive_sync_and_reopen() {
        let path = temp_path("reopen.db");
        {
            let mut store = PageStore::open(&path).unwrap();
            store.ensure_file(2).unwrap();
            store.ensure_mmap(2).unwrap();
            store.write_page(1, &[7u8; PAGE_SIZE]).unwrap();
            store.sync_pages().unwrap();
        }

        let store = PageStore::open(&path).unwrap();

        assert_eq!(store.file_pages(), 2);
        assert_eq!(store.page_ref(1).unwrap()[100], 7);
    }

    #[test]
    fn write_master_bypasses_mapping() {
        let path = temp_path("master.db");
        let mut store = PageStore::open(&path).unwrap();
        store.ensure_file(1).unwrap();
        store.ensure_mmap(1).unwrap();

        store.write_master(b"hello master").unwrap();
        store.sync_file().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..12], b"hello master");
    }
}
