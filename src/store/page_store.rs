//! Page store backends.
//!
//! A page store persists pages by id. Three backends are provided: a
//! hash-map store for tests and in-memory operation, a single-file store
//! using a memory-mapped file, and a shadow store pairing two backends for
//! stress testing.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use memmap2::MmapMut;
use rustc_hash::FxBuildHasher;

use crate::common::MemoryFootprint;

use super::{Page, Result, StoreError, PAGE_SIZE};

/// Persistence backend for fixed-size pages.
///
/// Loading a page that was never stored yields a zeroed page.
pub trait PageStore: Send {
    /// Reads the page with the given id into `page`.
    fn load(&mut self, page_id: u64, page: &mut Page) -> Result<()>;

    /// Persists the page under the given id.
    fn store(&mut self, page_id: u64, page: &Page) -> Result<()>;

    /// Makes all stored pages durable.
    fn flush(&mut self) -> Result<()>;

    /// Flushes and releases the backend.
    fn close(&mut self) -> Result<()>;

    /// Approximates the memory used by the backend.
    fn memory_footprint(&self) -> MemoryFootprint;
}

/// An in-memory page store backed by a hash map.
pub struct MemoryPageStore {
    pages: HashMap<u64, Page, FxBuildHasher>,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self {
            pages: HashMap::with_hasher(FxBuildHasher),
        }
    }
}

impl Default for MemoryPageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for MemoryPageStore {
    fn load(&mut self, page_id: u64, page: &mut Page) -> Result<()> {
        match self.pages.get(&page_id) {
            Some(stored) => page
                .as_bytes_mut()
                .copy_from_slice(stored.as_bytes().as_slice()),
            None => page.clear(),
        }
        Ok(())
    }

    fn store(&mut self, page_id: u64, page: &Page) -> Result<()> {
        self.pages.insert(page_id, page.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn memory_footprint(&self) -> MemoryFootprint {
        MemoryFootprint::new(std::mem::size_of::<Self>() + self.pages.len() * PAGE_SIZE)
    }
}

/// A page store persisting pages at fixed offsets of a single file.
///
/// The file is memory mapped and grown in chunks; `flush` pushes the map to
/// disk and fsyncs the file.
pub struct FilePageStore {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    /// Number of pages the current mapping covers.
    capacity: u64,
}

impl FilePageStore {
    /// File growth step, in pages.
    const GROWTH_STEP: u64 = 1024;

    /// Opens or creates the page file at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;

        let file_size = file.metadata().map_err(|e| StoreError::io(&path, e))?.len();
        let min_size = Self::GROWTH_STEP * PAGE_SIZE as u64;
        if file_size < min_size {
            file.set_len(min_size)
                .map_err(|e| StoreError::io(&path, e))?;
        }
        let size = file.metadata().map_err(|e| StoreError::io(&path, e))?.len();

        // Safety: the file is exclusively owned by this store; the state
        // directory lock keeps other processes out.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| StoreError::io(&path, e))?;

        Ok(Self {
            capacity: size / PAGE_SIZE as u64,
            path,
            file,
            mmap,
        })
    }

    /// Grows the file and remaps it so `page_id` becomes addressable.
    fn grow_to(&mut self, page_id: u64) -> Result<()> {
        let needed = page_id + 1;
        let mut capacity = self.capacity;
        while capacity < needed {
            capacity += Self::GROWTH_STEP;
        }
        self.mmap
            .flush()
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.file
            .set_len(capacity * PAGE_SIZE as u64)
            .map_err(|e| StoreError::io(&self.path, e))?;
        // Safety: see `open`.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file) }.map_err(|e| StoreError::io(&self.path, e))?;
        self.capacity = capacity;
        Ok(())
    }

    fn offset(page_id: u64) -> usize {
        page_id as usize * PAGE_SIZE
    }
}

impl PageStore for FilePageStore {
    fn load(&mut self, page_id: u64, page: &mut Page) -> Result<()> {
        if page_id >= self.capacity {
            // Beyond the file: never stored, so logically zero.
            page.clear();
            return Ok(());
        }
        let offset = Self::offset(page_id);
        page.as_bytes_mut()
            .copy_from_slice(&self.mmap[offset..offset + PAGE_SIZE]);
        Ok(())
    }

    fn store(&mut self, page_id: u64, page: &Page) -> Result<()> {
        if page_id >= self.capacity {
            self.grow_to(page_id)?;
        }
        let offset = Self::offset(page_id);
        self.mmap[offset..offset + PAGE_SIZE].copy_from_slice(page.as_bytes().as_slice());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.file
            .sync_all()
            .map_err(|e| StoreError::io(&self.path, e))
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }

    fn memory_footprint(&self) -> MemoryFootprint {
        // The mapping is file backed; only bookkeeping is owned memory.
        MemoryFootprint::new(std::mem::size_of::<Self>())
    }
}

/// A page store mirroring all writes into two backends.
///
/// Reads are served from both stores and compared; a divergence surfaces a
/// corruption error. Only used to stress-test a backend against a reference
/// implementation.
pub struct ShadowPageStore<P: PageStore, S: PageStore> {
    primary: P,
    shadow: S,
}

impl<P: PageStore, S: PageStore> ShadowPageStore<P, S> {
    pub fn new(primary: P, shadow: S) -> Self {
        Self { primary, shadow }
    }
}

impl<P: PageStore, S: PageStore> PageStore for ShadowPageStore<P, S> {
    fn load(&mut self, page_id: u64, page: &mut Page) -> Result<()> {
        self.primary.load(page_id, page)?;
        let mut check = Page::new();
        self.shadow.load(page_id, &mut check)?;
        if page.as_bytes() != check.as_bytes() {
            return Err(StoreError::Corruption(format!(
                "page {page_id} diverges between primary and shadow store"
            )));
        }
        Ok(())
    }

    fn store(&mut self, page_id: u64, page: &Page) -> Result<()> {
        self.primary.store(page_id, page)?;
        self.shadow.store(page_id, page)
    }

    fn flush(&mut self) -> Result<()> {
        self.primary.flush()?;
        self.shadow.flush()
    }

    fn close(&mut self) -> Result<()> {
        self.primary.close()?;
        self.shadow.close()
    }

    fn memory_footprint(&self) -> MemoryFootprint {
        let mut footprint = MemoryFootprint::new(std::mem::size_of::<Self>());
        footprint.add_child("primary", self.primary.memory_footprint());
        footprint.add_child("shadow", self.shadow.memory_footprint());
        footprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned_page(byte: u8) -> Page {
        let mut page = Page::new();
        page.as_bytes_mut().fill(byte);
        page
    }

    #[test]
    fn test_memory_store_round_trip() {
        let mut store = MemoryPageStore::new();
        store.store(3, &patterned_page(0xAB)).unwrap();

        let mut page = Page::new();
        store.load(3, &mut page).unwrap();
        assert_eq!(page.as_bytes()[0], 0xAB);

        // A page never stored reads back as zeroes.
        store.load(9, &mut page).unwrap();
        assert!(page.is_zero());
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages");

        let mut store = FilePageStore::open(&path).unwrap();
        store.store(0, &patterned_page(1)).unwrap();
        store.store(7, &patterned_page(2)).unwrap();
        store.flush().unwrap();

        let mut page = Page::new();
        store.load(7, &mut page).unwrap();
        assert_eq!(page.as_bytes()[100], 2);
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages");

        {
            let mut store = FilePageStore::open(&path).unwrap();
            store.store(5, &patterned_page(0x55)).unwrap();
            store.close().unwrap();
        }

        let mut store = FilePageStore::open(&path).unwrap();
        let mut page = Page::new();
        store.load(5, &mut page).unwrap();
        assert_eq!(page.as_bytes()[0], 0x55);
    }

    #[test]
    fn test_file_store_grows_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages");

        let mut store = FilePageStore::open(&path).unwrap();
        let far = FilePageStore::GROWTH_STEP * 2 + 3;
        store.store(far, &patterned_page(9)).unwrap();

        let mut page = Page::new();
        store.load(far, &mut page).unwrap();
        assert_eq!(page.as_bytes()[0], 9);
    }

    #[test]
    fn test_shadow_store_detects_divergence() {
        let mut store = ShadowPageStore::new(MemoryPageStore::new(), MemoryPageStore::new());
        store.store(1, &patterned_page(7)).unwrap();

        let mut page = Page::new();
        store.load(1, &mut page).unwrap();

        // Corrupt the shadow copy behind the store's back.
        store.shadow.store(1, &patterned_page(8)).unwrap();
        assert!(matches!(
            store.load(1, &mut page),
            Err(StoreError::Corruption(_))
        ));
    }
}
