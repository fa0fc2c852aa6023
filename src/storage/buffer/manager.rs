use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};

use crate::common::types::{FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;

/// Per-frame bookkeeping. Lives behind the pool mutex; the page's own
/// latch only guards the byte contents.
struct FrameMeta {
    page: PagePtr,
    pin_count: u32,
    is_dirty: bool,
}

struct PoolInner {
    frames: Vec<FrameMeta>,
    page_table: HashMap<PageId, FrameId>,
    // consumed LIFO
    free_list: Vec<FrameId>,
}

/// BufferPoolManager mediates all page access: it owns a fixed set of
/// frames, a page table, a free list and the replacer, all behind one
/// mutex. Disk I/O happens while holding it; the simple invariant is
/// worth more than the lost overlap at this tier.
///
/// Every frame is in exactly one state: free-listed, pinned, or tracked
/// by the replacer. A pin (fetch/new) removes a frame from the replacer
/// and an unpin that drops the count to zero re-enters it.
pub struct BufferPoolManager {
    pool_size: usize,
    inner: Mutex<PoolInner>,
    replacer: LruReplacer,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, disk_manager))
    }

    pub fn with_disk_manager(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = Vec::with_capacity(pool_size);
        for frame_id in 0..pool_size {
            frames.push(FrameMeta {
                page: Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))),
                pin_count: 0,
                is_dirty: false,
            });
            free_list.push(frame_id);
        }
        // LIFO consumption starts with frame 0 on top
        free_list.reverse();

        Self {
            pool_size,
            inner: Mutex::new(PoolInner {
                frames,
                page_table: HashMap::new(),
                free_list,
            }),
            replacer: LruReplacer::new(pool_size),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Fetch a page, pinning it. Reads it from disk if it is not
    /// resident, evicting a victim if no frame is free.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id < 0 {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut inner = self.inner.lock();
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &mut inner.frames[frame_id];
            if frame.pin_count == 0 {
                self.replacer.pin(frame_id);
            }
            frame.pin_count += 1;
            return Ok(frame.page.clone());
        }

        let frame_id = self.evict_to_frame(&mut inner)?;
        let frame = &mut inner.frames[frame_id];
        {
            let mut page = frame.page.write();
            page.reset();
            self.disk_manager.read_page(page_id, &mut page)?;
        }
        frame.pin_count = 1;
        frame.is_dirty = false;
        let page = frame.page.clone();
        inner.page_table.insert(page_id, frame_id);
        Ok(page)
    }

    /// Allocate a fresh page on disk and pin it in a frame, zeroed.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut inner = self.inner.lock();
        let page_id = self.disk_manager.allocate_page();

        let frame_id = self.evict_to_frame(&mut inner)?;
        let frame = &mut inner.frames[frame_id];
        {
            let mut page = frame.page.write();
            page.reset();
            page.page_id = page_id;
        }
        frame.pin_count = 1;
        frame.is_dirty = false;
        let page = frame.page.clone();
        inner.page_table.insert(page_id, frame_id);
        Ok((page, page_id))
    }

    /// Release one pin on a page, recording whether the caller dirtied
    /// it. When the count reaches zero the frame becomes an eviction
    /// candidate.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();
        let frame_id = *inner
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotResident(page_id))?;

        let frame = &mut inner.frames[frame_id];
        if is_dirty {
            frame.is_dirty = true;
        }
        if frame.pin_count > 0 {
            frame.pin_count -= 1;
            if frame.pin_count == 0 {
                self.replacer.unpin(frame_id);
            }
        }
        Ok(())
    }

    /// Write a page's bytes to disk and clear its dirty flag. Pinning is
    /// unaffected.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();
        let frame_id = *inner
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotResident(page_id))?;

        let frame = &mut inner.frames[frame_id];
        {
            let page = frame.page.read();
            self.disk_manager.write_page(page_id, &page.data)?;
        }
        frame.is_dirty = false;
        Ok(())
    }

    /// Flush every resident page.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();
        let resident: Vec<(PageId, FrameId)> = inner.page_table.iter().map(|(&p, &f)| (p, f)).collect();
        for (page_id, frame_id) in resident {
            let frame = &mut inner.frames[frame_id];
            {
                let page = frame.page.read();
                self.disk_manager.write_page(page_id, &page.data)?;
            }
            frame.is_dirty = false;
        }
        Ok(())
    }

    /// Drop a page from the pool and deallocate it on disk. A page that
    /// is not resident is a no-op; a pinned page cannot be deleted.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(());
        };

        let frame = &mut inner.frames[frame_id];
        if frame.pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        frame.page.write().reset();
        frame.is_dirty = false;
        inner.page_table.remove(&page_id);
        inner.free_list.push(frame_id);
        self.replacer.pin(frame_id);
        self.disk_manager.deallocate_page(page_id);
        Ok(())
    }

    /// Find a frame to (re)use: the free list first, otherwise poll the
    /// replacer, skipping any frame that got re-pinned since it was
    /// enqueued. Flushes the outgoing page if dirty and unmaps it.
    fn evict_to_frame(&self, inner: &mut PoolInner) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = inner.free_list.pop() {
            return Ok(frame_id);
        }

        let attempts = self.replacer.size();
        for _ in 0..attempts {
            let Some(frame_id) = self.replacer.victim() else {
                break;
            };
            if inner.frames[frame_id].pin_count > 0 {
                // stale entry, keep it a candidate
                self.replacer.unpin(frame_id);
                continue;
            }

            let frame = &mut inner.frames[frame_id];
            let old_page_id;
            {
                let page = frame.page.read();
                old_page_id = page.page_id;
                if frame.is_dirty {
                    self.disk_manager.write_page(old_page_id, &page.data)?;
                }
            }
            frame.is_dirty = false;
            if old_page_id != INVALID_PAGE_ID {
                inner.page_table.remove(&old_page_id);
            }
            log::trace!("evicted page {} from frame {}", old_page_id, frame_id);
            return Ok(frame_id);
        }

        log::warn!("buffer pool exhausted: all {} frames pinned", self.pool_size);
        Err(BufferPoolError::PoolExhausted)
    }
}
