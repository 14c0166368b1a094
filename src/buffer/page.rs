use std::ops::Deref;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use log::error;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};

use crate::buffer::buffer_pool::{FrameId, PoolInner};

pub type PageId = u32;
pub type AtomicPageId = AtomicU32;

pub const INVALID_PAGE_ID: PageId = 0;
/// Well-known page holding the `name -> root_page_id` records of every index.
pub const HEADER_PAGE_ID: PageId = 1;
pub const PAGE_SIZE: usize = 4096;

/// In-memory image of one disk page, held by a buffer pool frame.
#[derive(Debug)]
pub struct Page {
    pub page_id: PageId,
    data: Box<[u8; PAGE_SIZE]>,
    pub is_dirty: bool,
}

impl Page {
    pub fn empty() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            data: Box::new([0; PAGE_SIZE]),
            is_dirty: false,
        }
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Replaces the page image and marks the page dirty.
    pub fn set_data(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        self.data.copy_from_slice(data);
        self.is_dirty = true;
    }

    pub(crate) fn load(&mut self, page_id: PageId, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        self.page_id = page_id;
        self.data.copy_from_slice(data);
        self.is_dirty = false;
    }

    pub(crate) fn reset(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.data.fill(0);
        self.is_dirty = false;
    }
}

/// A pin on a buffered page. Dropping the reference unpins the page and,
/// at pin count zero, makes its frame evictable again.
pub struct PageRef {
    pub(crate) page_id: PageId,
    pub(crate) frame_id: FrameId,
    pub(crate) page: Arc<RwLock<Page>>,
    pub(crate) pool: Arc<Mutex<PoolInner>>,
}

impl PageRef {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageRef {
    type Target = Arc<RwLock<Page>>;

    fn deref(&self) -> &Self::Target {
        &self.page
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        let mut pool = self.pool.lock();
        if let Err(e) = pool.unpin(self.frame_id) {
            error!("failed to unpin page {}: {}", self.page_id, e);
        }
    }
}

/// Shared latch on a pinned page. The latch releases before the pin.
pub struct ReadPageGuard {
    guard: ArcRwLockReadGuard<RawRwLock, Page>,
    _pin: PageRef,
}

impl ReadPageGuard {
    pub(crate) fn new(pin: PageRef) -> Self {
        let guard = pin.page.read_arc();
        Self { guard, _pin: pin }
    }

    pub fn page_id(&self) -> PageId {
        self.guard.page_id
    }

    pub fn data(&self) -> &[u8] {
        self.guard.data()
    }
}

/// Exclusive latch on a pinned page. Overwriting the page image through the
/// guard marks it dirty; the latch releases before the pin.
pub struct WritePageGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, Page>,
    _pin: PageRef,
}

impl WritePageGuard {
    pub(crate) fn new(pin: PageRef) -> Self {
        let guard = pin.page.write_arc();
        Self { guard, _pin: pin }
    }

    pub(crate) fn from_parts(guard: ArcRwLockWriteGuard<RawRwLock, Page>, pin: PageRef) -> Self {
        Self { guard, _pin: pin }
    }

    pub fn page_id(&self) -> PageId {
        self.guard.page_id
    }

    pub fn data(&self) -> &[u8] {
        self.guard.data()
    }

    pub fn overwrite(&mut self, data: &[u8]) {
        self.guard.set_data(data);
    }
}
