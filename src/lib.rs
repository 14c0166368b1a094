//! A concurrent, disk-backed B+tree index over a pinned-page buffer pool.
//!
//! The tree maps ordered byte keys to fixed-size [`RecordId`]s. Writers
//! descend with latch crabbing, releasing ancestor latches as soon as a
//! child is safe for the operation; readers use plain latch coupling. The
//! root page id is persisted under the index name in a well-known header
//! page, so indexes can be reopened by name.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vellum::buffer::BufferPoolManager;
//! use vellum::config::BTreeConfig;
//! use vellum::index::{default_comparator, BPlusTreeIndex};
//! use vellum::storage::page::RecordId;
//! use vellum::storage::{DiskManager, DiskScheduler};
//!
//! # fn main() -> vellum::error::VellumResult<()> {
//! let disk_manager = Arc::new(DiskManager::try_new("index.db")?);
//! let scheduler = Arc::new(DiskScheduler::new(disk_manager));
//! let buffer_pool = Arc::new(BufferPoolManager::new(1000, 2, scheduler));
//! let index = BPlusTreeIndex::new(
//!     "orders_pk",
//!     default_comparator,
//!     buffer_pool,
//!     BTreeConfig::default(),
//! )?;
//!
//! index.insert(b"key", RecordId::new(1, 0))?;
//! assert_eq!(index.get(b"key")?, Some(RecordId::new(1, 0)));
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod index;
pub mod storage;
pub mod transaction;
pub mod utils;

pub use buffer::{BufferPoolManager, PageId, INVALID_PAGE_ID, PAGE_SIZE};
pub use error::{VellumError, VellumResult};
pub use index::{BPlusTreeIndex, IndexIterator};
pub use storage::page::RecordId;
pub use transaction::Transaction;
