use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use bytes::{Bytes, BytesMut};
use log::{debug, error};

use crate::buffer::PageId;
use crate::config::IoSchedulerConfig;
use crate::error::{VellumError, VellumResult};
use crate::storage::disk_manager::DiskManager;

pub type DiskCommandResultSender<T> = Sender<VellumResult<T>>;
pub type DiskCommandResultReceiver<T> = Receiver<VellumResult<T>>;

/// Commands sent from the buffer pool to the I/O workers.
#[derive(Debug)]
pub enum DiskRequest {
    ReadPage {
        page_id: PageId,
        result_sender: DiskCommandResultSender<BytesMut>,
    },
    WritePage {
        page_id: PageId,
        data: Bytes,
        result_sender: DiskCommandResultSender<()>,
    },
    AllocatePage {
        result_sender: DiskCommandResultSender<PageId>,
    },
    DeallocatePage {
        page_id: PageId,
        result_sender: DiskCommandResultSender<()>,
    },
    Shutdown,
}

/// Dispatches page I/O onto a pool of background worker threads. A
/// dispatcher thread receives every request and forwards it round-robin to
/// per-worker channels; each request carries its own result channel.
#[derive(Debug)]
pub struct DiskScheduler {
    request_sender: Sender<DiskRequest>,
    dispatcher_thread: Option<thread::JoinHandle<()>>,
    worker_threads: Vec<thread::JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        Self::new_with_config(disk_manager, IoSchedulerConfig::default())
    }

    pub fn new_with_config(disk_manager: Arc<DiskManager>, config: IoSchedulerConfig) -> Self {
        let worker_count = config.workers.max(1);
        let (request_sender, request_receiver) = mpsc::channel::<DiskRequest>();

        let mut worker_senders = Vec::with_capacity(worker_count);
        let mut worker_threads = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let (tx, rx) = mpsc::channel::<DiskRequest>();
            worker_senders.push(tx);
            let dm = disk_manager.clone();
            let handle = thread::Builder::new()
                .name(format!("disk-worker-{}", i))
                .spawn(move || Self::worker_loop(rx, dm))
                .expect("failed to spawn disk worker thread");
            worker_threads.push(handle);
        }

        let dispatcher_thread = thread::Builder::new()
            .name("disk-dispatcher".to_string())
            .spawn(move || Self::dispatcher_loop(request_receiver, worker_senders))
            .expect("failed to spawn disk dispatcher thread");

        Self {
            request_sender,
            dispatcher_thread: Some(dispatcher_thread),
            worker_threads,
        }
    }

    fn dispatcher_loop(receiver: Receiver<DiskRequest>, worker_senders: Vec<Sender<DiskRequest>>) {
        debug!("disk scheduler dispatcher started");
        let mut rr_idx = 0usize;
        while let Ok(request) = receiver.recv() {
            match request {
                DiskRequest::Shutdown => {
                    for tx in &worker_senders {
                        let _ = tx.send(DiskRequest::Shutdown);
                    }
                    break;
                }
                other => {
                    let idx = rr_idx % worker_senders.len();
                    rr_idx = rr_idx.wrapping_add(1);
                    if worker_senders[idx].send(other).is_err() {
                        error!("disk worker {} hung up, dropping request", idx);
                    }
                }
            }
        }
        debug!("disk scheduler dispatcher exiting");
    }

    fn worker_loop(receiver: Receiver<DiskRequest>, disk_manager: Arc<DiskManager>) {
        while let Ok(request) = receiver.recv() {
            match request {
                DiskRequest::ReadPage {
                    page_id,
                    result_sender,
                } => {
                    let _ = result_sender.send(disk_manager.read_page(page_id));
                }
                DiskRequest::WritePage {
                    page_id,
                    data,
                    result_sender,
                } => {
                    let _ = result_sender.send(disk_manager.write_page(page_id, &data));
                }
                DiskRequest::AllocatePage { result_sender } => {
                    let _ = result_sender.send(Ok(disk_manager.allocate_page()));
                }
                DiskRequest::DeallocatePage {
                    page_id,
                    result_sender,
                } => {
                    let _ = result_sender.send(disk_manager.deallocate_page(page_id));
                }
                DiskRequest::Shutdown => break,
            }
        }
    }

    fn schedule(&self, request: DiskRequest) -> VellumResult<()> {
        self.request_sender
            .send(request)
            .map_err(|e| VellumError::Internal(format!("disk scheduler unavailable: {}", e)))
    }

    pub fn schedule_read(&self, page_id: PageId) -> VellumResult<DiskCommandResultReceiver<BytesMut>> {
        let (tx, rx) = mpsc::channel();
        self.schedule(DiskRequest::ReadPage {
            page_id,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    pub fn schedule_write(
        &self,
        page_id: PageId,
        data: Bytes,
    ) -> VellumResult<DiskCommandResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.schedule(DiskRequest::WritePage {
            page_id,
            data,
            result_sender: tx,
        })?;
        Ok(rx)
    }

    pub fn schedule_allocate(&self) -> VellumResult<DiskCommandResultReceiver<PageId>> {
        let (tx, rx) = mpsc::channel();
        self.schedule(DiskRequest::AllocatePage { result_sender: tx })?;
        Ok(rx)
    }

    pub fn schedule_deallocate(&self, page_id: PageId) -> VellumResult<DiskCommandResultReceiver<()>> {
        let (tx, rx) = mpsc::channel();
        self.schedule(DiskRequest::DeallocatePage {
            page_id,
            result_sender: tx,
        })?;
        Ok(rx)
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        let _ = self.request_sender.send(DiskRequest::Shutdown);
        if let Some(handle) = self.dispatcher_thread.take() {
            let _ = handle.join();
        }
        for handle in self.worker_threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PAGE_SIZE;
    use tempfile::TempDir;

    #[test]
    fn scheduled_write_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let scheduler = DiskScheduler::new(disk_manager);

        let page_id = scheduler.schedule_allocate().unwrap().recv().unwrap().unwrap();

        let mut data = vec![0u8; PAGE_SIZE];
        data[7] = 42;
        scheduler
            .schedule_write(page_id, Bytes::from(data.clone()))
            .unwrap()
            .recv()
            .unwrap()
            .unwrap();

        let read = scheduler
            .schedule_read(page_id)
            .unwrap()
            .recv()
            .unwrap()
            .unwrap();
        assert_eq!(&read[..], &data[..]);
    }
}
