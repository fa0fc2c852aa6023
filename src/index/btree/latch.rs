use std::collections::HashSet;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::common::types::{PageId, PageReadGuard, PageWriteGuard};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};

/// A held page latch, read or write, owning the guard so it can live in
/// the context across calls.
pub(crate) enum PageGuard {
    Read(PageReadGuard),
    Write(PageWriteGuard),
}

impl PageGuard {
    pub fn data(&self) -> &[u8] {
        match self {
            PageGuard::Read(guard) => &guard.data,
            PageGuard::Write(guard) => &guard.data,
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            PageGuard::Read(_) => None,
            PageGuard::Write(guard) => Some(&mut guard.data),
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, PageGuard::Write(_))
    }
}

/// Guard over the tree-level root latch (which doubles as the storage
/// of `root_page_id`).
pub(crate) enum RootLatch {
    Read(ArcRwLockReadGuard<RawRwLock, PageId>),
    Write(ArcRwLockWriteGuard<RawRwLock, PageId>),
}

/// Per-operation crabbing state: the root latch, the page latches still
/// held (in acquisition order), and the pages scheduled for deletion
/// once their latches drop.
///
/// This replaces the source design's transaction-attached page sets and
/// thread-local root-latch counter with an object scoped to one tree
/// operation.
pub(crate) struct LatchContext {
    root_latch: Option<RootLatch>,
    pages: Vec<(PageId, PageGuard)>,
    deleted: HashSet<PageId>,
}

impl LatchContext {
    pub fn new() -> Self {
        Self {
            root_latch: None,
            pages: Vec::new(),
            deleted: HashSet::new(),
        }
    }

    pub fn set_root_latch(&mut self, latch: RootLatch) {
        self.root_latch = Some(latch);
    }

    pub fn release_root_latch(&mut self) {
        self.root_latch = None;
    }

    /// Current `root_page_id` as seen through the held root latch.
    pub fn root_page_id(&self) -> PageId {
        match self.root_latch.as_ref().expect("root latch not held") {
            RootLatch::Read(guard) => **guard,
            RootLatch::Write(guard) => **guard,
        }
    }

    /// Publish a new `root_page_id`; requires the write root latch.
    pub fn set_root_page_id(&mut self, page_id: PageId) {
        match self.root_latch.as_mut().expect("root latch not held") {
            RootLatch::Write(guard) => **guard = page_id,
            RootLatch::Read(_) => unreachable!("root update under read latch"),
        }
    }

    pub fn push(&mut self, page_id: PageId, guard: PageGuard) {
        self.pages.push((page_id, guard));
    }

    /// Borrow the writable bytes of a page whose write latch this
    /// context holds.
    pub fn data_mut(&mut self, page_id: PageId) -> Option<&mut [u8]> {
        self.pages
            .iter_mut()
            .find(|(id, _)| *id == page_id)
            .and_then(|(_, guard)| guard.data_mut())
    }

    /// Borrow the bytes of a page this context holds a latch on.
    pub fn data(&self, page_id: PageId) -> Option<&[u8]> {
        self.pages
            .iter()
            .find(|(id, _)| *id == page_id)
            .map(|(_, guard)| guard.data())
    }

    /// Hand a held latch over to the caller (used when an iterator takes
    /// ownership of the leaf latch).
    pub fn take_page(&mut self, page_id: PageId) -> Option<PageGuard> {
        let index = self.pages.iter().position(|(id, _)| *id == page_id)?;
        Some(self.pages.remove(index).1)
    }

    pub fn mark_deleted(&mut self, page_id: PageId) {
        self.deleted.insert(page_id);
    }

    /// Unlatch and unpin every held page in acquisition order, dropping
    /// the root latch first, and delete the pages queued for deletion.
    /// Pages mutated under a write latch are unpinned dirty.
    pub fn release_all(&mut self, bpm: &BufferPoolManager) -> Result<(), BufferPoolError> {
        self.root_latch = None;
        for (page_id, guard) in self.pages.drain(..) {
            let dirty = guard.is_write();
            drop(guard);
            bpm.unpin_page(page_id, dirty)?;
            if self.deleted.remove(&page_id) {
                if let Err(err) = bpm.delete_page(page_id) {
                    // another thread may have re-pinned it between our
                    // unpin and the delete; the page leaks rather than
                    // failing the finished operation
                    log::warn!("could not delete page {}: {}", page_id, err);
                }
            }
        }
        Ok(())
    }
}
