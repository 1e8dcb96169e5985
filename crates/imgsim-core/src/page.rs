//! Paged storage for mutable-mode buckets.
//!
//! Bucket contents grow without paying resident memory for the whole
//! inverted index: each bucket keeps a small in-memory tail, and once the
//! tail reaches a threshold it is written out to a scratch file that grows
//! in host-page-sized chunks. Frozen pages are mapped back into memory on
//! demand during iteration. The scratch file is an unlinked temporary owned
//! by the database instance; it never shrinks during the instance's life.

use crate::errors::{DbError, Result};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::OnceLock;

/// Bytes per stored entry (image ids or catalog indices).
pub(crate) const ENTRY_BYTES: usize = 8;

/// Tail entries buffered in memory before a bucket pages out.
pub(crate) const TAIL_THRESHOLD: usize = 128;

/// Host page size, queried once at startup.
pub(crate) fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    })
}

/// Entries that fit in one page.
pub(crate) fn page_entries() -> usize {
    page_size() / ENTRY_BYTES
}

/// The scratch file backing paged buckets. Grows in page-sized chunks;
/// positions are handed out once and never reused.
pub(crate) struct ScratchFile {
    file: File,
    next_page: u64,
}

impl ScratchFile {
    /// Create an unlinked temporary scratch file; it vanishes when the
    /// owning database is dropped.
    pub fn new() -> Result<Self> {
        Ok(Self {
            file: tempfile::tempfile()?,
            next_page: 0,
        })
    }

    /// Reserve one page and return its file offset.
    pub fn alloc_page(&mut self) -> Result<u64> {
        let offset = self.next_page;
        self.next_page += page_size() as u64;
        self.file.set_len(self.next_page)?;
        Ok(offset)
    }

    /// Write entries at an absolute byte offset.
    pub fn write_entries(&self, offset: u64, entries: &[u64]) -> Result<()> {
        let mut bytes = Vec::with_capacity(entries.len() * ENTRY_BYTES);
        for &entry in entries {
            bytes.extend_from_slice(&entry.to_le_bytes());
        }
        self.file.write_all_at(&bytes, offset)?;
        Ok(())
    }

    /// Read one entry at an absolute byte offset.
    pub fn read_entry(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; ENTRY_BYTES];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Write one entry at an absolute byte offset.
    pub fn write_entry(&self, offset: u64, entry: u64) -> Result<()> {
        self.file.write_all_at(&entry.to_le_bytes(), offset)?;
        Ok(())
    }

    /// Map one page read-only. The mapping is released when the returned
    /// handle drops.
    pub fn map_page(&self, offset: u64) -> Result<Mmap> {
        unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(page_size())
                .map(&self.file)
        }
        .map_err(|e| DbError::Memory(format!("cannot map bucket page: {e}")))
    }
}

/// One bucket's contents in mutable mode: a frozen, paged base region plus
/// a small unpaged tail. Iteration yields the base first, then the tail.
#[derive(Default)]
pub(crate) struct PagedList {
    /// File offsets of the pages holding the base, in order.
    pages: Vec<u64>,
    /// Entries in the paged base.
    base_len: usize,
    /// Recently added entries not yet paged out.
    tail: Vec<u64>,
}

impl PagedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.base_len + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base_len == 0 && self.tail.is_empty()
    }

    fn capacity(&self) -> usize {
        self.pages.len() * page_entries()
    }

    /// Pre-allocate pages for the expected total size (a load-time hint).
    pub fn reserve(&mut self, scratch: &mut ScratchFile, total: usize) -> Result<()> {
        while self.capacity() < total {
            let page = scratch.alloc_page()?;
            self.pages.push(page);
        }
        Ok(())
    }

    /// Append an entry, paging the tail out once it hits the threshold.
    pub fn push(&mut self, scratch: &mut ScratchFile, entry: u64) -> Result<()> {
        self.tail.push(entry);
        if self.tail.len() >= TAIL_THRESHOLD {
            self.page_out(scratch)?;
        }
        Ok(())
    }

    /// Flush the tail into page storage.
    fn page_out(&mut self, scratch: &mut ScratchFile) -> Result<()> {
        let per_page = page_entries();
        let mut taken = 0;
        while taken < self.tail.len() {
            if self.base_len == self.capacity() {
                let page = scratch.alloc_page()?;
                self.pages.push(page);
            }
            let slot = self.base_len % per_page;
            let page = self.pages[self.base_len / per_page];
            let room = per_page - slot;
            let take = room.min(self.tail.len() - taken);
            scratch.write_entries(
                page + (slot * ENTRY_BYTES) as u64,
                &self.tail[taken..taken + take],
            )?;
            self.base_len += take;
            taken += take;
        }
        self.tail.clear();
        Ok(())
    }

    /// Visit every entry, base then tail.
    pub fn for_each(&self, scratch: &ScratchFile, f: &mut dyn FnMut(u64)) -> Result<()> {
        let per_page = page_entries();
        let mut remaining = self.base_len;
        for &page in &self.pages {
            if remaining == 0 {
                break;
            }
            let count = remaining.min(per_page);
            let map = scratch.map_page(page)?;
            for chunk in map[..count * ENTRY_BYTES].chunks_exact(ENTRY_BYTES) {
                f(u64::from_le_bytes(chunk.try_into().unwrap()));
            }
            remaining -= count;
        }
        for &entry in &self.tail {
            f(entry);
        }
        Ok(())
    }

    fn entry_offset(&self, position: usize) -> u64 {
        let per_page = page_entries();
        self.pages[position / per_page] + ((position % per_page) * ENTRY_BYTES) as u64
    }

    /// Remove one occurrence of `entry`, filling the hole with the most
    /// recently added value so the list stays dense. Unknown entries are
    /// ignored.
    pub fn remove(&mut self, scratch: &ScratchFile, entry: u64) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if let Some(at) = self.tail.iter().position(|&v| v == entry) {
            self.tail.swap_remove(at);
            return Ok(());
        }
        let per_page = page_entries();
        let mut position = None;
        let mut remaining = self.base_len;
        'pages: for (page_index, &page) in self.pages.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let count = remaining.min(per_page);
            let map = scratch.map_page(page)?;
            for (slot, chunk) in map[..count * ENTRY_BYTES].chunks_exact(ENTRY_BYTES).enumerate() {
                if u64::from_le_bytes(chunk.try_into().unwrap()) == entry {
                    position = Some(page_index * per_page + slot);
                    break 'pages;
                }
            }
            remaining -= count;
        }
        let Some(at) = position else {
            return Ok(());
        };
        if let Some(last) = self.tail.pop() {
            scratch.write_entry(self.entry_offset(at), last)?;
        } else if at + 1 == self.base_len {
            self.base_len -= 1;
        } else {
            let last = scratch.read_entry(self.entry_offset(self.base_len - 1))?;
            scratch.write_entry(self.entry_offset(at), last)?;
            self.base_len -= 1;
        }
        Ok(())
    }

    /// Drop all contents but keep the allocated pages for reuse (rehash).
    pub fn clear_keep_pages(&mut self) {
        self.base_len = 0;
        self.tail.clear();
    }
}
