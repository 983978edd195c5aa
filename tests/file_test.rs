//! Disk space manager tests: file creation, the free list and raw page
//! I/O, below the buffer pool and the tree.

mod test_utils;

use acorn_db::storage::disk::{DiskManager, INITIAL_TABLE_PAGES, MAX_TABLES};
use acorn_db::storage::page::{HeaderPage, Page, PAGE_SIZE};
use acorn_db::Error;
use rand::prelude::*;

use test_utils::{setup, TestDir};

#[test]
fn test_new_table_file_is_presized() {
    setup();
    let dir = TestDir::new("file");
    let disk = DiskManager::new();

    let path = dir.path("fresh.db");
    let table = disk.open_table(&path).unwrap();

    let size = std::fs::metadata(&path).unwrap().len();
    assert_eq!(size, INITIAL_TABLE_PAGES * PAGE_SIZE as u64);

    let header = HeaderPage::from_page(disk.read_page(table, 0).unwrap());
    assert_eq!(header.page_count(), INITIAL_TABLE_PAGES);
    assert!(header.free_head() > 0);
    assert_eq!(header.root_page(), 0);
}

#[test]
fn test_free_list_is_lifo() {
    setup();
    let dir = TestDir::new("file");
    let disk = DiskManager::new();
    let table = disk.open_table(dir.path("lifo.db")).unwrap();

    let pages: Vec<_> = (0..4).map(|_| disk.alloc_page(table).unwrap()).collect();
    assert!(pages.iter().all(|&p| p > 0));

    for &page in &pages {
        disk.free_page(table, page).unwrap();
    }

    // freed pages come back newest-first
    for &page in pages.iter().rev() {
        assert_eq!(disk.alloc_page(table).unwrap(), page);
    }
}

#[test]
fn test_page_round_trip() {
    setup();
    let dir = TestDir::new("file");
    let disk = DiskManager::new();
    let table = disk.open_table(dir.path("rw.db")).unwrap();

    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; PAGE_SIZE];
    rng.fill(&mut bytes[..]);

    let page_num = disk.alloc_page(table).unwrap();
    disk.write_page(table, page_num, &Page::from_bytes(bytes)).unwrap();

    let reread = disk.read_page(table, page_num).unwrap();
    assert_eq!(reread.as_bytes(), &bytes[..]);
}

#[test]
fn test_open_is_idempotent_per_canonical_path() {
    setup();
    let dir = TestDir::new("file");
    let disk = DiskManager::new();

    let path = dir.path("dedup.db");
    let first = disk.open_table(&path).unwrap();

    // a second spelling of the same file resolves to the same id
    let respelled = path.canonicalize().unwrap();
    assert_eq!(disk.open_table(&respelled).unwrap(), first);
    assert_eq!(disk.open_table(&path).unwrap(), first);

    let other = disk.open_table(dir.path("other.db")).unwrap();
    assert_ne!(other, first);
}

#[test]
fn test_table_limit() {
    setup();
    let dir = TestDir::new("file");
    let disk = DiskManager::new();

    for i in 0..MAX_TABLES {
        disk.open_table(dir.path(&format!("t{}.db", i))).unwrap();
    }

    match disk.open_table(dir.path("one-too-many.db")) {
        Err(Error::TableLimit) => {}
        other => panic!("expected TableLimit, got {:?}", other),
    }
}

#[test]
fn test_extension_links_new_pages() {
    setup();
    let dir = TestDir::new("file");
    let disk = DiskManager::new();
    let path = dir.path("grow.db");
    let table = disk.open_table(&path).unwrap();

    disk.extend_capacity(table, INITIAL_TABLE_PAGES * 2).unwrap();

    let header = HeaderPage::from_page(disk.read_page(table, 0).unwrap());
    assert_eq!(header.page_count(), INITIAL_TABLE_PAGES * 2);
    assert_eq!(header.free_head(), INITIAL_TABLE_PAGES);
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        INITIAL_TABLE_PAGES * 2 * PAGE_SIZE as u64
    );

    // the fresh chain starts at the old page count and walks forward
    let mut current = header.free_head();
    let mut steps = 0;
    while current != 0 && steps <= header.page_count() {
        assert!(current < header.page_count());
        current = acorn_db::storage::page::FreePage::from_page(
            disk.read_page(table, current).unwrap(),
        )
        .next_free();
        steps += 1;
    }
    assert_eq!(current, 0);
}

#[test]
fn test_reopen_preserves_header() {
    setup();
    let dir = TestDir::new("file");
    let path = dir.path("persist.db");

    let allocated;
    {
        let disk = DiskManager::new();
        let table = disk.open_table(&path).unwrap();
        allocated = disk.alloc_page(table).unwrap();
        disk.close_all();
    }

    let disk = DiskManager::new();
    let table = disk.open_table(&path).unwrap();
    let header = HeaderPage::from_page(disk.read_page(table, 0).unwrap());

    // the popped page must not reappear on the free list
    assert_ne!(header.free_head(), allocated);
    assert_eq!(header.page_count(), INITIAL_TABLE_PAGES);
}
