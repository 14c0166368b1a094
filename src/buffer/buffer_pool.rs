use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::buffer::page::{Page, PageId, PageRef, ReadPageGuard, WritePageGuard, PAGE_SIZE};
use crate::config::BufferPoolConfig;
use crate::error::{VellumError, VellumResult};
use crate::storage::disk_scheduler::DiskScheduler;
use crate::utils::cache::lru_k::LruKReplacer;
use crate::utils::cache::Replacer;

pub type FrameId = usize;

/// Bookkeeping shared by the pool and every outstanding pin. Keeping the
/// page table, free list, replacer and pin counts under one latch makes
/// pin transitions atomic with respect to eviction decisions.
pub(crate) struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruKReplacer,
    pin_counts: Vec<u32>,
}

impl PoolInner {
    pub(crate) fn unpin(&mut self, frame_id: FrameId) -> VellumResult<()> {
        let count = &mut self.pin_counts[frame_id];
        if *count == 0 {
            return Err(VellumError::Internal(format!(
                "frame {} unpinned below zero",
                frame_id
            )));
        }
        *count -= 1;
        if *count == 0 {
            self.replacer.set_evictable(frame_id, true)?;
        }
        Ok(())
    }
}

/// Fixed-size pool of page frames backed by the disk scheduler. Pages are
/// pinned through `PageRef`s and latched through the page guards; a frame
/// is eligible for eviction only while its pin count is zero.
pub struct BufferPoolManager {
    pool: Vec<Arc<RwLock<Page>>>,
    inner: Arc<Mutex<PoolInner>>,
    disk_scheduler: Arc<DiskScheduler>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, k: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let mut free_list = VecDeque::with_capacity(pool_size);
        let mut pool = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            free_list.push_back(i);
            pool.push(Arc::new(RwLock::new(Page::empty())));
        }

        Self {
            pool,
            inner: Arc::new(Mutex::new(PoolInner {
                page_table: HashMap::with_capacity(pool_size),
                free_list,
                replacer: LruKReplacer::with_k(pool_size, k),
                pin_counts: vec![0; pool_size],
            })),
            disk_scheduler,
        }
    }

    pub fn new_with_config(config: BufferPoolConfig, disk_scheduler: Arc<DiskScheduler>) -> Self {
        Self::new(config.buffer_pool_size, config.lru_k_k, disk_scheduler)
    }

    /// Allocates a fresh page on disk and pins it, zero-filled and dirty.
    pub fn new_page(&self) -> VellumResult<PageRef> {
        let page_id = self
            .disk_scheduler
            .schedule_allocate()?
            .recv()
            .map_err(|e| VellumError::Internal(format!("allocate result lost: {}", e)))??;

        // A freshly allocated id is unknown to other threads, so the
        // install cannot race with a concurrent fetch of the same page.
        let (pin, guard) = self.install_page(page_id, None)?;
        if let Some(mut guard) = guard {
            guard.is_dirty = true;
        }
        debug!("created new page {}", page_id);
        Ok(pin)
    }

    /// Pins a page without latching it.
    pub fn fetch_page(&self, page_id: PageId) -> VellumResult<PageRef> {
        let (pin, _guard) = self.fetch_frame(page_id)?;
        Ok(pin)
    }

    /// Pins a page and takes a shared latch on it.
    pub fn fetch_page_read(&self, page_id: PageId) -> VellumResult<ReadPageGuard> {
        let (pin, guard) = self.fetch_frame(page_id)?;
        drop(guard);
        Ok(ReadPageGuard::new(pin))
    }

    /// Pins a page and takes an exclusive latch on it.
    pub fn fetch_page_write(&self, page_id: PageId) -> VellumResult<WritePageGuard> {
        let (pin, guard) = self.fetch_frame(page_id)?;
        match guard {
            Some(g) => Ok(WritePageGuard::from_parts(g, pin)),
            None => Ok(WritePageGuard::new(pin)),
        }
    }

    /// Removes a page from the pool and deallocates it on disk. Returns
    /// `false` if the page is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> VellumResult<bool> {
        {
            let mut inner = self.inner.lock();
            if let Some(&frame_id) = inner.page_table.get(&page_id) {
                if inner.pin_counts[frame_id] > 0 {
                    return Ok(false);
                }
                inner.page_table.remove(&page_id);
                inner.replacer.remove(frame_id);
                inner.free_list.push_back(frame_id);
                self.pool[frame_id].write().reset();
                debug!("deleted page {} from frame {}", page_id, frame_id);
            }
        }
        self.disk_scheduler
            .schedule_deallocate(page_id)?
            .recv()
            .map_err(|e| VellumError::Internal(format!("deallocate result lost: {}", e)))??;
        Ok(true)
    }

    /// Writes a page back to disk if it is resident, clearing its dirty bit.
    pub fn flush_page(&self, page_id: PageId) -> VellumResult<bool> {
        let page = {
            let inner = self.inner.lock();
            match inner.page_table.get(&page_id) {
                Some(&frame_id) => self.pool[frame_id].clone(),
                None => return Ok(false),
            }
        };

        let data = {
            let mut page = page.write();
            if !page.is_dirty {
                return Ok(true);
            }
            page.is_dirty = false;
            Bytes::copy_from_slice(page.data())
        };
        self.disk_scheduler
            .schedule_write(page_id, data)?
            .recv()
            .map_err(|e| VellumError::Internal(format!("flush result lost: {}", e)))??;
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> VellumResult<()> {
        let page_ids: Vec<PageId> = {
            let inner = self.inner.lock();
            inner.page_table.keys().copied().collect()
        };
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Current pin count of a resident page; `None` if not resident.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let inner = self.inner.lock();
        inner
            .page_table
            .get(&page_id)
            .map(|&frame_id| inner.pin_counts[frame_id])
    }

    /// Number of resident pages with a non-zero pin count.
    pub fn pinned_page_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .page_table
            .values()
            .filter(|&&frame_id| inner.pin_counts[frame_id] > 0)
            .count()
    }

    /// Number of frames currently eligible for eviction.
    pub fn evictable_count(&self) -> usize {
        self.inner.lock().replacer.size()
    }

    fn make_ref(&self, page_id: PageId, frame_id: FrameId) -> PageRef {
        PageRef {
            page_id,
            frame_id,
            page: self.pool[frame_id].clone(),
            pool: self.inner.clone(),
        }
    }

    /// Pins `page_id`, loading it from disk on a miss. On a miss the
    /// returned write guard already covers the freshly installed frame so
    /// that concurrent fetchers cannot observe a half-loaded page.
    #[allow(clippy::type_complexity)]
    fn fetch_frame(
        &self,
        page_id: PageId,
    ) -> VellumResult<(
        PageRef,
        Option<parking_lot::ArcRwLockWriteGuard<parking_lot::RawRwLock, Page>>,
    )> {
        if page_id == crate::buffer::INVALID_PAGE_ID {
            return Err(VellumError::Internal(
                "cannot fetch the invalid page id".to_string(),
            ));
        }

        {
            let mut inner = self.inner.lock();
            if let Some(&frame_id) = inner.page_table.get(&page_id) {
                inner.pin_counts[frame_id] += 1;
                inner.replacer.record_access(frame_id)?;
                inner.replacer.set_evictable(frame_id, false)?;
                return Ok((self.make_ref(page_id, frame_id), None));
            }
        }

        self.install_page(page_id, Some(page_id))
    }

    /// Claims a frame, registers `page_id` in it pinned once, and loads its
    /// content (from disk when `load_from` is set, zeroes otherwise) while
    /// holding the frame's write latch. Returns `None` for the guard when
    /// another thread won the install race (the page is then pinned but not
    /// latched, exactly like a table hit).
    #[allow(clippy::type_complexity)]
    fn install_page(
        &self,
        page_id: PageId,
        load_from: Option<PageId>,
    ) -> VellumResult<(
        PageRef,
        Option<parking_lot::ArcRwLockWriteGuard<parking_lot::RawRwLock, Page>>,
    )> {
        let (frame_id, mut guard) = {
            let mut inner = self.inner.lock();

            // Another thread may have installed the page while we were
            // outside the latch; fall back to a plain hit. Latching here is
            // not allowed: the frame may already be latched by a thread
            // that in turn is waiting for the pool latch.
            if let Some(&frame_id) = inner.page_table.get(&page_id) {
                inner.pin_counts[frame_id] += 1;
                inner.replacer.record_access(frame_id)?;
                inner.replacer.set_evictable(frame_id, false)?;
                return Ok((self.make_ref(page_id, frame_id), None));
            }

            let frame_id = self.allocate_frame(&mut inner)?;
            inner.page_table.insert(page_id, frame_id);
            inner.pin_counts[frame_id] = 1;
            inner.replacer.record_access(frame_id)?;
            inner.replacer.set_evictable(frame_id, false)?;
            // The claimed frame is unpinned and unmapped, so its latch is
            // free and this acquisition cannot block.
            (frame_id, self.pool[frame_id].write_arc())
        };

        match load_from {
            Some(disk_page_id) => {
                let data = self
                    .disk_scheduler
                    .schedule_read(disk_page_id)?
                    .recv()
                    .map_err(|e| VellumError::Internal(format!("read result lost: {}", e)))??;
                guard.load(page_id, &data);
            }
            None => {
                guard.reset();
                guard.page_id = page_id;
            }
        }

        Ok((self.make_ref(page_id, frame_id), Some(guard)))
    }

    /// Claims a free frame, evicting (and flushing) a victim if needed.
    /// Failure here is the buffer pool's out-of-memory fault.
    fn allocate_frame(&self, inner: &mut PoolInner) -> VellumResult<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = inner.replacer.evict() else {
            return Err(VellumError::Storage(
                "buffer pool is full and no page is evictable".to_string(),
            ));
        };

        // Evictable implies pin count zero, so the page latch is free.
        let (victim_page_id, flush_data) = {
            let mut page = self.pool[frame_id].write();
            let data = if page.is_dirty {
                Some(Bytes::copy_from_slice(page.data()))
            } else {
                None
            };
            let victim = page.page_id;
            page.is_dirty = false;
            (victim, data)
        };
        inner.page_table.remove(&victim_page_id);

        // Flush before the mapping can be re-established by a later fetch,
        // so the disk never serves a stale image of the victim.
        if let Some(data) = flush_data {
            debug!("evicting dirty page {} from frame {}", victim_page_id, frame_id);
            self.disk_scheduler
                .schedule_write(victim_page_id, data)?
                .recv()
                .map_err(|e| VellumError::Internal(format!("evict flush result lost: {}", e)))??;
        }

        Ok(frame_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk_manager::DiskManager;
    use tempfile::TempDir;

    fn setup(pool_size: usize) -> (TempDir, Arc<BufferPoolManager>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, 2, disk_scheduler));
        (temp_dir, buffer_pool)
    }

    #[test]
    fn new_page_until_pool_is_full() {
        let (_temp_dir, buffer_pool) = setup(3);

        let page1 = buffer_pool.new_page().unwrap();
        let _page2 = buffer_pool.new_page().unwrap();
        let _page3 = buffer_pool.new_page().unwrap();

        // All frames pinned: allocation must fail with the OOM fault.
        assert!(buffer_pool.new_page().is_err());

        drop(page1);
        assert_eq!(buffer_pool.evictable_count(), 1);
        assert!(buffer_pool.new_page().is_ok());
        assert_eq!(buffer_pool.evictable_count(), 0);
    }

    #[test]
    fn fetch_page_round_trips_through_disk() {
        let (_temp_dir, buffer_pool) = setup(3);

        let page1 = buffer_pool.new_page().unwrap();
        let page1_id = page1.page_id();
        let mut data = vec![0u8; PAGE_SIZE];
        data[100] = 7;
        page1.write().set_data(&data);
        drop(page1);

        // Evict page1 by churning through the other frames.
        for _ in 0..3 {
            drop(buffer_pool.new_page().unwrap());
        }

        let guard = buffer_pool.fetch_page_read(page1_id).unwrap();
        assert_eq!(guard.data()[100], 7);
    }

    #[test]
    fn fetch_page_pins_and_unpins() {
        let (_temp_dir, buffer_pool) = setup(3);

        let page1 = buffer_pool.new_page().unwrap();
        let page1_id = page1.page_id();
        assert_eq!(buffer_pool.pin_count(page1_id), Some(1));
        drop(page1);
        assert_eq!(buffer_pool.pin_count(page1_id), Some(0));

        let pin_a = buffer_pool.fetch_page(page1_id).unwrap();
        let pin_b = buffer_pool.fetch_page(page1_id).unwrap();
        assert_eq!(buffer_pool.pin_count(page1_id), Some(2));
        drop(pin_a);
        drop(pin_b);
        assert_eq!(buffer_pool.pin_count(page1_id), Some(0));
        assert_eq!(buffer_pool.pinned_page_count(), 0);
    }

    #[test]
    fn delete_page_refuses_pinned() {
        let (_temp_dir, buffer_pool) = setup(3);

        let page1 = buffer_pool.new_page().unwrap();
        let page1_id = page1.page_id();
        assert!(!buffer_pool.delete_page(page1_id).unwrap());

        drop(page1);
        assert!(buffer_pool.delete_page(page1_id).unwrap());
        assert_eq!(buffer_pool.evictable_count(), 0);

        // Deleting a non-resident page still succeeds.
        assert!(buffer_pool.delete_page(page1_id).unwrap());
    }

    #[test]
    fn latches_exclude_writers() {
        let (_temp_dir, buffer_pool) = setup(3);

        let page1 = buffer_pool.new_page().unwrap();
        let page1_id = page1.page_id();
        drop(page1);

        let read_a = buffer_pool.fetch_page_read(page1_id).unwrap();
        let read_b = buffer_pool.fetch_page_read(page1_id).unwrap();
        assert_eq!(read_a.page_id(), read_b.page_id());
        drop(read_a);
        drop(read_b);

        let mut write = buffer_pool.fetch_page_write(page1_id).unwrap();
        let mut data = vec![0u8; PAGE_SIZE];
        data[0] = 1;
        write.overwrite(&data);
        drop(write);

        let read = buffer_pool.fetch_page_read(page1_id).unwrap();
        assert_eq!(read.data()[0], 1);
    }
}
