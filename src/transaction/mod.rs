use std::collections::{HashSet, VecDeque};

use crate::buffer::{PageId, ReadPageGuard, WritePageGuard};

/// A latched page tracked by an in-flight tree operation. Dropping the
/// guard releases the latch and then the pin.
pub enum PageGuard {
    Read(ReadPageGuard),
    Write(WritePageGuard),
}

impl PageGuard {
    pub fn page_id(&self) -> PageId {
        match self {
            PageGuard::Read(guard) => guard.page_id(),
            PageGuard::Write(guard) => guard.page_id(),
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            PageGuard::Read(guard) => guard.data(),
            PageGuard::Write(guard) => guard.data(),
        }
    }
}

/// Work set owned by the caller of a tree operation: the pages latched
/// along the root-to-leaf descent, in descent order, plus the pages the
/// operation has scheduled for deletion. The tree pushes guards while
/// crabbing down, releases ancestors as soon as a child proves safe, and
/// drains the rest (applying deletions) when the operation finishes.
#[derive(Default)]
pub struct Transaction {
    page_set: VecDeque<PageGuard>,
    deleted_page_set: HashSet<PageId>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_into_page_set(&mut self, guard: PageGuard) {
        self.page_set.push_back(guard);
    }

    /// Most recently latched page, i.e. the parent of the node a
    /// structural operation is currently repairing.
    pub fn last_page(&self) -> Option<&PageGuard> {
        self.page_set.back()
    }

    pub fn pop_page_set(&mut self) -> Option<PageGuard> {
        self.page_set.pop_back()
    }

    /// Releases every held latch top-down (guards unlatch, then unpin).
    pub fn release_page_set(&mut self) {
        while self.page_set.pop_front().is_some() {}
    }

    pub fn page_set_is_empty(&self) -> bool {
        self.page_set.is_empty()
    }

    pub fn add_into_deleted_page_set(&mut self, page_id: PageId) {
        self.deleted_page_set.insert(page_id);
    }

    pub fn take_deleted_page_set(&mut self) -> HashSet<PageId> {
        std::mem::take(&mut self.deleted_page_set)
    }
}
