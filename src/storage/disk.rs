//! Disk space manager: one file per table, page-aligned positional I/O,
//! a LIFO free-page list and lazy file doubling.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::storage::page::{FreePage, HeaderPage, Page, PAGE_SIZE};
use crate::types::{PageNum, TableId};

/// Maximum number of simultaneously open tables.
pub const MAX_TABLES: usize = 32;

/// Page count of a freshly created table file (10 MiB).
pub const INITIAL_TABLE_PAGES: u64 = 2560;

struct TableFile {
    file: File,
    /// Canonical (realpath-resolved) path, the dedup key for reopens.
    path: PathBuf,
}

/// Owns every open table file and hands out small integer table ids.
pub struct DiskManager {
    tables: RwLock<Vec<Arc<TableFile>>>,
}

impl DiskManager {
    pub fn new() -> DiskManager {
        DiskManager {
            tables: RwLock::new(Vec::new()),
        }
    }

    /// Open `path`, creating and pre-sizing the file when it does not
    /// exist yet. Reopening a path (under any spelling that resolves to
    /// the same file) returns the existing id.
    pub fn open_table<P: AsRef<Path>>(&self, path: P) -> Result<TableId> {
        let path = path.as_ref();
        let mut tables = self.tables.write().unwrap();

        if let Ok(canonical) = path.canonicalize() {
            if let Some(id) = tables.iter().position(|t| t.path == canonical) {
                return Ok(id as TableId);
            }
        }

        if tables.len() >= MAX_TABLES {
            return Err(Error::TableLimit);
        }

        let id = tables.len() as TableId;
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => {
                let canonical = path.canonicalize()?;
                tables.push(Arc::new(TableFile {
                    file,
                    path: canonical,
                }));
                info!("opened table {:?} as id {}", path, id);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .mode(0o644)
                    .open(path)?;

                let header = HeaderPage::init();
                file.write_all_at(header.page().as_bytes(), 0)?;
                file.sync_data()?;

                let canonical = path.canonicalize()?;
                tables.push(Arc::new(TableFile {
                    file,
                    path: canonical,
                }));
                drop(tables);

                self.extend_capacity(id, INITIAL_TABLE_PAGES)?;
                info!("created table {:?} as id {}", path, id);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(id)
    }

    fn table(&self, table_id: TableId) -> Result<Arc<TableFile>> {
        self.tables
            .read()
            .unwrap()
            .get(table_id as usize)
            .cloned()
            .ok_or(Error::UnknownTable(table_id))
    }

    pub fn read_page(&self, table_id: TableId, page_num: PageNum) -> Result<Page> {
        let table = self.table(table_id)?;
        let mut page = Page::new();
        table
            .file
            .read_exact_at(page.as_bytes_mut(), page_num * PAGE_SIZE as u64)?;
        Ok(page)
    }

    /// Positional page write. Durability is the caller's business: the
    /// header-flush points and `shutdown` fsync through [`Self::sync`].
    pub fn write_page(&self, table_id: TableId, page_num: PageNum, page: &Page) -> Result<()> {
        let table = self.table(table_id)?;
        table
            .file
            .write_all_at(page.as_bytes(), page_num * PAGE_SIZE as u64)?;
        Ok(())
    }

    pub fn sync(&self, table_id: TableId) -> Result<()> {
        self.table(table_id)?.file.sync_data()?;
        Ok(())
    }

    pub fn sync_all(&self) -> Result<()> {
        let tables: Vec<_> = self.tables.read().unwrap().iter().cloned().collect();
        for table in tables {
            table.file.sync_data()?;
        }
        Ok(())
    }

    /// Pop the head of the free list, doubling the file first when the
    /// list is empty. The new header is flushed before the page number is
    /// handed out.
    pub fn alloc_page(&self, table_id: TableId) -> Result<PageNum> {
        self.extend_capacity(table_id, 0)?;

        let mut header = HeaderPage::from_page(self.read_page(table_id, 0)?);
        let popped = header.free_head();
        let free = FreePage::from_page(self.read_page(table_id, popped)?);

        header.set_free_head(free.next_free());
        self.flush_header(table_id, &header)?;

        Ok(popped)
    }

    /// Push `page_num` back onto the free list.
    pub fn free_page(&self, table_id: TableId, page_num: PageNum) -> Result<()> {
        let mut header = HeaderPage::from_page(self.read_page(table_id, 0)?);

        let freed = FreePage::init(header.free_head());
        self.write_page(table_id, page_num, freed.page())?;
        self.sync(table_id)?;

        header.set_free_head(page_num);
        self.flush_header(table_id, &header)
    }

    /// Grow the file to `new_size` pages (or double it when `new_size` is
    /// 0 and the free list ran dry), chaining every new page into the
    /// free list. The chain is on disk before the header advertises it.
    pub fn extend_capacity(&self, table_id: TableId, new_size: u64) -> Result<()> {
        let mut header = HeaderPage::from_page(self.read_page(table_id, 0)?);
        let mut new_size = new_size;

        if new_size > header.page_count() || header.free_head() == 0 {
            if new_size == 0 {
                new_size = header.page_count() * 2;
            }
            debug!(
                "extending table {} from {} to {} pages",
                table_id,
                header.page_count(),
                new_size
            );

            self.write_free_chain(table_id, header.page_count(), new_size)?;

            header.set_free_head(header.page_count());
            header.set_page_count(new_size);
            self.flush_header(table_id, &header)?;
        }

        Ok(())
    }

    /// Write free pages `[start, end)`, each linking to the next and the
    /// last one terminating the list, then fsync.
    pub(crate) fn write_free_chain(&self, table_id: TableId, start: u64, end: u64) -> Result<()> {
        for page_num in start..end {
            let next = if page_num < end - 1 { page_num + 1 } else { 0 };
            let free = FreePage::init(next);
            self.write_page(table_id, page_num, free.page())?;
        }
        self.sync(table_id)
    }

    fn flush_header(&self, table_id: TableId, header: &HeaderPage) -> Result<()> {
        self.write_page(table_id, 0, header.page())?;
        self.sync(table_id)
    }

    /// Close every table file. Reopening after this hands out fresh ids.
    pub fn close_all(&self) {
        self.tables.write().unwrap().clear();
    }
}

impl Default for DiskManager {
    fn default() -> DiskManager {
        DiskManager::new()
    }
}
