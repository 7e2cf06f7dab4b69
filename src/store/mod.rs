//! Page-based persistent storage.
//!
//! Nodes are persisted through typed *stocks*: slabs of fixed-size records
//! packed onto 16 KiB pages. Pages travel through an LRU pool with dirty
//! write-back and are persisted by a pluggable page store (in-memory,
//! single file, or a shadow pair for stress testing).

mod metrics;
mod page;
mod page_pool;
mod page_store;
mod stock;

pub use metrics::{StoreMetrics, StoreMetricsSnapshot};
pub use page::{Page, PAGE_SIZE};
pub use page_pool::PagePool;
pub use page_store::{FilePageStore, MemoryPageStore, PageStore, ShadowPageStore};
pub use stock::{Record, Stock};

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupted store: {0}")]
    Corruption(String),
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Attaches the failing path to an I/O error.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
