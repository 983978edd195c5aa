//! Buffer manager: a fixed pool of page frames in front of the disk
//! manager, with an LRU chain, per-frame pinning and dirty write-back.
//!
//! One mutex serializes the frame table; a condition variable per frame
//! lets a loader wait for the pin of exactly that frame. When every frame
//! is pinned the pool degrades to direct I/O, which loses caching but
//! never blocks progress.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::debug;

use crate::error::Result;
use crate::storage::disk::DiskManager;
use crate::storage::page::{FreePage, HeaderPage, Page};
use crate::types::{PageLocation, PageNum, TableId, TrxId};

/// Default number of frames reserved at `init_db` time.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

const NIL: usize = usize::MAX;

struct Frame {
    page: Page,
    location: Option<PageLocation>,
    dirty: bool,
    /// Transaction currently owning the frame's pin. The owner is the
    /// only one allowed to write the frame back; eviction skips pinned
    /// frames.
    pin_owner: Option<TrxId>,
    /// Loaders blocked on this frame's pin or its in-flight load.
    waiters: u32,
    /// The frame is published in the index but its bytes are still on
    /// their way in from disk.
    loading: bool,
    prev: usize,
    next: usize,
}

struct PoolInner {
    frames: Vec<Frame>,
    index: HashMap<PageLocation, usize>,
    head: usize,
    tail: usize,
}

impl PoolInner {
    /// Splice a frame out of the recently-used chain and relink it at the
    /// head. The single place the chain is reordered.
    fn move_to_head(&mut self, idx: usize) {
        if idx == self.head {
            return;
        }

        let (prev, next) = (self.frames[idx].prev, self.frames[idx].next);
        if prev != NIL {
            self.frames[prev].next = next;
        }
        if next != NIL {
            self.frames[next].prev = prev;
        }
        if idx == self.tail {
            self.tail = prev;
        }

        self.frames[idx].prev = NIL;
        self.frames[idx].next = self.head;
        self.frames[self.head].prev = idx;
        self.head = idx;
    }

    /// Walk from the tail toward the head and claim the first frame that
    /// is neither pinned nor waited on. A dirty victim is flushed before
    /// its slot is reused.
    fn evict(&mut self, disk: &DiskManager) -> Result<Option<usize>> {
        let mut idx = self.tail;
        while idx != NIL {
            let frame = &self.frames[idx];
            if frame.pin_owner.is_none() && frame.waiters == 0 {
                break;
            }
            idx = frame.prev;
        }

        if idx == NIL {
            return Ok(None);
        }

        if let Some(location) = self.frames[idx].location.take() {
            self.index.remove(&location);
            if self.frames[idx].dirty {
                disk.write_page(location.0, location.1, &self.frames[idx].page)?;
                self.frames[idx].dirty = false;
            }
        }

        Ok(Some(idx))
    }
}

pub struct BufferPool {
    inner: Mutex<PoolInner>,
    /// One condition variable per frame, waited on with the pool mutex.
    conds: Vec<Condvar>,
    disk: Arc<DiskManager>,
}

impl BufferPool {
    pub fn new(disk: Arc<DiskManager>, num_frames: usize) -> BufferPool {
        let mut frames = Vec::with_capacity(num_frames);
        for i in 0..num_frames {
            frames.push(Frame {
                page: Page::new(),
                location: None,
                dirty: false,
                pin_owner: None,
                waiters: 0,
                loading: false,
                prev: if i > 0 { i - 1 } else { NIL },
                next: if i + 1 < num_frames { i + 1 } else { NIL },
            });
        }

        BufferPool {
            inner: Mutex::new(PoolInner {
                frames,
                index: HashMap::new(),
                head: 0,
                tail: num_frames - 1,
            }),
            conds: (0..num_frames).map(|_| Condvar::new()).collect(),
            disk,
        }
    }

    /// Wait until the frame's bytes are settled on disk's behalf. The
    /// waiter count keeps eviction away from the frame, so its identity
    /// cannot change underneath us.
    fn wait_while_loading<'a>(
        &'a self,
        mut inner: MutexGuard<'a, PoolInner>,
        idx: usize,
    ) -> MutexGuard<'a, PoolInner> {
        while inner.frames[idx].loading {
            inner.frames[idx].waiters += 1;
            inner = self.conds[idx].wait(inner).unwrap();
            inner.frames[idx].waiters -= 1;
        }
        inner
    }

    fn wait_for_pin<'a>(
        &'a self,
        mut inner: MutexGuard<'a, PoolInner>,
        idx: usize,
        trx_id: TrxId,
    ) -> MutexGuard<'a, PoolInner> {
        loop {
            match inner.frames[idx].pin_owner {
                Some(owner) if owner != trx_id => {
                    inner.frames[idx].waiters += 1;
                    inner = self.conds[idx].wait(inner).unwrap();
                    inner.frames[idx].waiters -= 1;
                }
                _ => return inner,
            }
        }
    }

    /// Read a page through the pool. With `pin` the calling transaction
    /// takes the frame's pin and must hand it back through
    /// [`Self::write_page`] or [`Self::release_page`]; without it the read
    /// is a plain snapshot.
    pub fn read_page(
        &self,
        location: PageLocation,
        trx_id: TrxId,
        pin: bool,
    ) -> Result<Page> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(&idx) = inner.index.get(&location) {
            inner = self.wait_while_loading(inner, idx);
            if inner.frames[idx].location != Some(location) {
                // the load we waited on failed and the frame was thrown
                // away; read around the pool
                drop(inner);
                return self.disk.read_page(location.0, location.1);
            }
            if pin {
                inner = self.wait_for_pin(inner, idx, trx_id);
                inner.frames[idx].pin_owner = Some(trx_id);
            }
            inner.move_to_head(idx);
            return Ok(inner.frames[idx].page.clone());
        }

        match inner.evict(&self.disk)? {
            Some(idx) => {
                // Publish the frame before dropping the mutex so a second
                // loader of the same page queues on this frame instead of
                // claiming another one.
                inner.frames[idx].location = Some(location);
                inner.frames[idx].dirty = false;
                inner.frames[idx].pin_owner = Some(trx_id);
                inner.frames[idx].loading = true;
                inner.index.insert(location, idx);
                inner.move_to_head(idx);
                drop(inner);

                let loaded = self.disk.read_page(location.0, location.1);

                let mut inner = self.inner.lock().unwrap();
                inner.frames[idx].loading = false;
                match loaded {
                    Ok(page) => {
                        inner.frames[idx].page = page.clone();
                        if !pin {
                            inner.frames[idx].pin_owner = None;
                        }
                        self.conds[idx].notify_all();
                        Ok(page)
                    }
                    Err(e) => {
                        inner.index.remove(&location);
                        inner.frames[idx].location = None;
                        inner.frames[idx].pin_owner = None;
                        self.conds[idx].notify_all();
                        Err(e)
                    }
                }
            }
            None => {
                // Every frame is pinned: keep going without the cache.
                drop(inner);
                debug!(
                    "buffer pool exhausted, direct read of page {} of table {}",
                    location.1, location.0
                );
                self.disk.read_page(location.0, location.1)
            }
        }
    }

    /// Write a page back through the pool: the frame takes the new bytes,
    /// turns dirty and gives up its pin. Pages absent from the pool are
    /// written through to disk.
    pub fn write_page(&self, location: PageLocation, page: &Page) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(&idx) = inner.index.get(&location) {
            inner = self.wait_while_loading(inner, idx);
            if inner.frames[idx].location != Some(location) {
                drop(inner);
                return self.disk.write_page(location.0, location.1, page);
            }
            inner.move_to_head(idx);
            inner.frames[idx].page = page.clone();
            inner.frames[idx].dirty = true;
            inner.frames[idx].pin_owner = None;
            self.conds[idx].notify_one();
            return Ok(());
        }

        drop(inner);
        self.disk.write_page(location.0, location.1, page)
    }

    /// Give up a pin taken by a speculative read without writing
    /// anything.
    pub fn release_page(&self, location: PageLocation) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&idx) = inner.index.get(&location) {
            inner.frames[idx].pin_owner = None;
            self.conds[idx].notify_one();
        }
    }

    /// Pop a page off the table's free list, doubling the file when the
    /// list is empty. Newly chained pages live beyond every cached page
    /// number, so the on-disk chain write cannot race the pool.
    pub fn alloc_page(&self, table_id: TableId, trx_id: TrxId) -> Result<PageNum> {
        let mut header = HeaderPage::from_page(self.read_page((table_id, 0), trx_id, true)?);

        if header.free_head() == 0 {
            let new_size = header.page_count() * 2;
            self.disk
                .write_free_chain(table_id, header.page_count(), new_size)?;
            header.set_free_head(header.page_count());
            header.set_page_count(new_size);
        }

        let popped = header.free_head();
        let free = FreePage::from_page(self.read_page((table_id, popped), trx_id, true)?);
        header.set_free_head(free.next_free());

        self.write_page((table_id, 0), header.page())?;
        self.release_page((table_id, popped));

        // the header flush after an allocation is a durability point:
        // push the new header to disk and fsync before handing the page
        // out
        self.disk.write_page(table_id, 0, header.page())?;
        self.disk.sync(table_id)?;

        Ok(popped)
    }

    /// Push a page back onto the table's free list.
    pub fn free_page(&self, table_id: TableId, page_num: PageNum, trx_id: TrxId) -> Result<()> {
        let mut header = HeaderPage::from_page(self.read_page((table_id, 0), trx_id, true)?);

        // own the frame before rewriting it as a free page
        self.read_page((table_id, page_num), trx_id, true)?;
        let freed = FreePage::init(header.free_head());
        self.write_page((table_id, page_num), freed.page())?;
        self.disk.write_page(table_id, page_num, freed.page())?;

        header.set_free_head(page_num);
        self.write_page((table_id, 0), header.page())?;

        // same durability point as allocation: the freed page and the
        // header naming it as the list head go to disk together
        self.disk.write_page(table_id, 0, header.page())?;
        self.disk.sync(table_id)
    }

    /// Flush every dirty frame. Called at shutdown, before the files are
    /// fsynced and closed.
    pub fn flush_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for idx in 0..inner.frames.len() {
            if !inner.frames[idx].dirty {
                continue;
            }
            if let Some(location) = inner.frames[idx].location {
                self.disk
                    .write_page(location.0, location.1, &inner.frames[idx].page)?;
                inner.frames[idx].dirty = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PAGE_SIZE;

    fn scratch_pool(num_frames: usize) -> (BufferPool, TableId, tempdir::Scratch) {
        let scratch = tempdir::Scratch::new();
        let disk = Arc::new(DiskManager::new());
        let table = disk.open_table(scratch.path("pool.db")).unwrap();
        (BufferPool::new(disk, num_frames), table, scratch)
    }

    // minimal self-cleaning temp dir, enough for unit tests
    mod tempdir {
        use std::path::PathBuf;

        pub struct Scratch {
            dir: PathBuf,
        }

        impl Scratch {
            pub fn new() -> Scratch {
                let dir = std::env::temp_dir().join(format!(
                    "acorn-buffer-test-{}-{:x}",
                    std::process::id(),
                    rand::random::<u64>()
                ));
                std::fs::create_dir_all(&dir).unwrap();
                Scratch { dir }
            }

            pub fn path(&self, name: &str) -> PathBuf {
                self.dir.join(name)
            }
        }

        impl Drop for Scratch {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.dir);
            }
        }
    }

    #[test]
    fn test_read_caches_page() {
        let (pool, table, _scratch) = scratch_pool(4);

        let mut page = Page::new();
        page.as_bytes_mut()[0..4].copy_from_slice(&[1, 2, 3, 4]);
        pool.write_page((table, 5), &page).unwrap();

        let reread = pool.read_page((table, 5), 0, false).unwrap();
        assert_eq!(&reread.as_bytes()[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_lru_evicts_coldest_frame() {
        let (pool, table, _scratch) = scratch_pool(2);

        // fill both frames, then touch page 1 so page 2 becomes coldest
        pool.read_page((table, 1), 0, false).unwrap();
        pool.read_page((table, 2), 0, false).unwrap();
        pool.read_page((table, 1), 0, false).unwrap();

        // loading page 3 must evict page 2
        pool.read_page((table, 3), 0, false).unwrap();

        let inner = pool.inner.lock().unwrap();
        assert!(inner.index.contains_key(&(table, 1)));
        assert!(inner.index.contains_key(&(table, 3)));
        assert!(!inner.index.contains_key(&(table, 2)));
    }

    #[test]
    fn test_dirty_page_survives_eviction() {
        let (pool, table, _scratch) = scratch_pool(1);

        let mut page = Page::new();
        page.as_bytes_mut()[PAGE_SIZE - 1] = 0xAB;
        pool.read_page((table, 7), 0, true).unwrap();
        pool.write_page((table, 7), &page).unwrap();

        // the single frame is repurposed, flushing page 7 on the way out
        pool.read_page((table, 8), 0, false).unwrap();

        let reread = pool.read_page((table, 7), 0, false).unwrap();
        assert_eq!(reread.as_bytes()[PAGE_SIZE - 1], 0xAB);
    }

    #[test]
    fn test_exhausted_pool_falls_back_to_direct_io() {
        let (pool, table, _scratch) = scratch_pool(1);

        // pin the only frame and leave it pinned
        pool.read_page((table, 1), 1, true).unwrap();

        // a different page is still readable and writable
        let mut page = Page::new();
        page.as_bytes_mut()[0] = 9;
        pool.write_page((table, 2), &page).unwrap();
        let reread = pool.read_page((table, 2), 2, true).unwrap();
        assert_eq!(reread.as_bytes()[0], 9);

        pool.release_page((table, 1));
    }

    #[test]
    fn test_alloc_pops_free_list_in_lifo_order() {
        let (pool, table, _scratch) = scratch_pool(8);

        let a = pool.alloc_page(table, 0).unwrap();
        let b = pool.alloc_page(table, 0).unwrap();
        assert_ne!(a, b);

        pool.free_page(table, a, 0).unwrap();
        pool.free_page(table, b, 0).unwrap();

        assert_eq!(pool.alloc_page(table, 0).unwrap(), b);
        assert_eq!(pool.alloc_page(table, 0).unwrap(), a);
    }
}
