use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager handles the actual page I/O against the database file.
///
/// Page 0 is the header page and exists implicitly from the start;
/// `allocate_page` hands out ids from 1 upward. Deallocated ids are
/// remembered but not reused in this tier.
pub struct DiskManager {
    db_file: Mutex<File>,
    next_page_id: AtomicI32,
    freed_pages: Mutex<HashSet<PageId>>,
}

impl DiskManager {
    /// Open (or create) the database file at the given path.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        // Resume allocation after the highest page the file contains.
        let file_pages = (file.metadata()?.len() as usize).div_ceil(PAGE_SIZE) as PageId;
        let next_page_id = file_pages.max(1);

        Ok(Self {
            db_file: Mutex::new(file),
            next_page_id: AtomicI32::new(next_page_id),
            freed_pages: Mutex::new(HashSet::new()),
        })
    }

    /// Hand out the next unused page id.
    pub fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Mark a page id as free. Ids are not recycled; the set exists so
    /// double-deallocation and use-after-free show up in debug runs.
    pub fn deallocate_page(&self, page_id: PageId) {
        let mut freed = self.freed_pages.lock();
        if !freed.insert(page_id) {
            log::warn!("page {} deallocated twice", page_id);
        }
    }

    /// Read a page from disk. Reading past the end of the file yields a
    /// zeroed page, so freshly allocated pages are readable before the
    /// first write.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        if page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();
        let file_size = file.metadata()?.len();

        page.data.fill(0);
        if offset < file_size {
            file.seek(SeekFrom::Start(offset))?;
            let readable = ((file_size - offset) as usize).min(PAGE_SIZE);
            file.read_exact(&mut page.data[..readable])?;
        }
        page.page_id = page_id;
        Ok(())
    }

    /// Write a page to disk at `page_id * PAGE_SIZE`.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<(), DiskManagerError> {
        if page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }
}
