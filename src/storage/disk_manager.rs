use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use bytes::BytesMut;
use log::warn;

use crate::buffer::{PageId, HEADER_PAGE_ID, PAGE_SIZE};
use crate::error::VellumResult;

static EMPTY_PAGE: [u8; PAGE_SIZE] = [0; PAGE_SIZE];

/// Reads and writes fixed-size pages of the database file. Page id `N`
/// lives at byte offset `N * PAGE_SIZE`. Page id 0 is the invalid sentinel
/// and page id 1 is reserved for the header page, so allocation starts at 2.
#[derive(Debug)]
pub struct DiskManager {
    db_file: Mutex<File>,
    next_page_id: AtomicU32,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> VellumResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(db_path.as_ref())?;

        let file_size = file.metadata()?.len();
        if file_size % PAGE_SIZE as u64 != 0 {
            warn!(
                "database file size {} is not a multiple of page size {}",
                file_size, PAGE_SIZE
            );
        }
        let pages_on_disk = (file_size as usize).div_ceil(PAGE_SIZE) as PageId;
        let next_page_id = pages_on_disk.max(HEADER_PAGE_ID + 1);

        Ok(Self {
            db_file: Mutex::new(file),
            next_page_id: AtomicU32::new(next_page_id),
        })
    }

    /// Reads a page; a page at or beyond EOF reads back as zeroes.
    pub fn read_page(&self, page_id: PageId) -> VellumResult<BytesMut> {
        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut buf = BytesMut::zeroed(PAGE_SIZE);

        let mut file = self.db_file.lock().unwrap();
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            return Ok(buf);
        }
        file.seek(SeekFrom::Start(offset))?;
        match file.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(buf),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> VellumResult<()> {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Hands out a fresh page id. Ids are never reused.
    pub fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Zeroes the page region on disk. Ids are not recycled.
    pub fn deallocate_page(&self, page_id: PageId) -> VellumResult<()> {
        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock().unwrap();
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&EMPTY_PAGE)?;
        Ok(())
    }

    pub fn num_pages(&self) -> PageId {
        self.next_page_id.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn allocate_read_write_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let page_id = disk_manager.allocate_page();
        assert!(page_id > HEADER_PAGE_ID);

        let mut data = vec![0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xCD;
        disk_manager.write_page(page_id, &data).unwrap();

        let read = disk_manager.read_page(page_id).unwrap();
        assert_eq!(&read[..], &data[..]);
    }

    #[test]
    fn read_past_eof_is_zeroed() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let read = disk_manager.read_page(42).unwrap();
        assert!(read.iter().all(|&b| b == 0));
    }

    #[test]
    fn allocation_counter_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");

        let first_id = {
            let disk_manager = DiskManager::try_new(&path).unwrap();
            let id = disk_manager.allocate_page();
            disk_manager.write_page(id, &[1u8; PAGE_SIZE]).unwrap();
            id
        };

        let disk_manager = DiskManager::try_new(&path).unwrap();
        assert!(disk_manager.num_pages() > first_id);
        let next = disk_manager.allocate_page();
        assert!(next > first_id);
    }
}
