//! On-disk page layouts.
//!
//! Every page is a fixed 4096-byte block. Page 0 of a table file is the
//! header page; pages on the free list are free pages; everything else is
//! an allocated tree node (leaf or internal, discriminated by a header
//! flag). The typed views below own a raw [`Page`] and read/write their
//! fields in place, so the view's buffer is always the exact byte image
//! that goes to disk.

use crate::types::{PageNum, RecordKey};

/// Size of each page (in bytes).
pub const PAGE_SIZE: usize = 4096;

/// Size of the allocated-node header (in bytes).
pub const PAGE_HEADER_SIZE: usize = 128;

/// Usable body of an allocated node.
pub const PAGE_BODY: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Maximum number of branches in an internal node.
pub const MAX_PAGE_BRANCHES: usize = 248;

/// Byte stride of one branch entry: key (8) + child page number (8).
const BRANCH_STRIDE: usize = 16;

/// Byte size of one leaf slot-directory entry:
/// key (8) + value offset (2) + value size (2) + writer tag (2).
pub const SLOT_SIZE: usize = 14;

/// Maximum size of a leaf record value.
pub const MAX_VALUE_SIZE: usize = 112;

/// Maximum number of records a leaf may hold. Record locks address a slot
/// through a bit of a 64-bit mask, so a page can never carry more than 64
/// lockable records even though the body would physically fit more.
pub const MAX_SLOTS: usize = 64;

/// When a leaf's free space stays below this after a delete the page is
/// still considered well filled and no rebalancing happens.
pub const REDISTRIBUTE_THRESHOLD: usize = 2500;

// Allocated-node header field offsets.
const OFF_PARENT: usize = 0;
const OFF_IS_LEAF: usize = 8;
const OFF_KEY_COUNT: usize = 12;
const OFF_FOOTER_1: usize = 112; // leaf: free space
const OFF_FOOTER_2: usize = 120; // leaf: right sibling, internal: leftmost child

/// Raw 4096-byte page image.
#[derive(Clone)]
pub struct Page {
    data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new() -> Page {
        Page {
            data: [0; PAGE_SIZE],
        }
    }

    pub fn from_bytes(data: [u8; PAGE_SIZE]) -> Page {
        Page { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn read_u16(&self, at: usize) -> u16 {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(&self.data[at..at + 2]);
        u16::from_le_bytes(buf)
    }

    fn write_u16(&mut self, at: usize, v: u16) {
        self.data[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn read_u32(&self, at: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[at..at + 4]);
        u32::from_le_bytes(buf)
    }

    fn write_u32(&mut self, at: usize, v: u32) {
        self.data[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn read_u64(&self, at: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[at..at + 8]);
        u64::from_le_bytes(buf)
    }

    fn write_u64(&mut self, at: usize, v: u64) {
        self.data[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn read_i64(&self, at: usize) -> i64 {
        self.read_u64(at) as i64
    }

    fn write_i64(&mut self, at: usize, v: i64) {
        self.write_u64(at, v as u64);
    }
}

impl Default for Page {
    fn default() -> Page {
        Page::new()
    }
}

/// Whether an allocated page is a leaf. Meaningless for header/free pages.
pub fn is_leaf(page: &Page) -> bool {
    page.read_u32(OFF_IS_LEAF) == 1
}

/// Parent page number of an allocated page, without caring about its kind.
pub fn parent_of(page: &Page) -> PageNum {
    page.read_u64(OFF_PARENT)
}

/// Rewrite the parent pointer of an allocated page of either kind.
pub fn set_parent_of(page: &mut Page, parent: PageNum) {
    page.write_u64(OFF_PARENT, parent);
}

// ---------------------------------------------------------------------------
// Header page (page 0)
// ---------------------------------------------------------------------------

/// View of the table file's header page: free-list head, reserved page
/// count and the tree root.
pub struct HeaderPage {
    page: Page,
}

impl HeaderPage {
    pub fn init() -> HeaderPage {
        let mut header = HeaderPage { page: Page::new() };
        header.set_free_head(0);
        header.set_page_count(1);
        header.set_root_page(0);
        header
    }

    pub fn from_page(page: Page) -> HeaderPage {
        HeaderPage { page }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn free_head(&self) -> PageNum {
        self.page.read_u64(0)
    }

    pub fn set_free_head(&mut self, page_num: PageNum) {
        self.page.write_u64(0, page_num);
    }

    pub fn page_count(&self) -> u64 {
        self.page.read_u64(8)
    }

    pub fn set_page_count(&mut self, count: u64) {
        self.page.write_u64(8, count);
    }

    pub fn root_page(&self) -> PageNum {
        self.page.read_u64(16)
    }

    pub fn set_root_page(&mut self, page_num: PageNum) {
        self.page.write_u64(16, page_num);
    }
}

// ---------------------------------------------------------------------------
// Free page
// ---------------------------------------------------------------------------

/// View of a page sitting on the LIFO free list.
pub struct FreePage {
    page: Page,
}

impl FreePage {
    pub fn init(next_free: PageNum) -> FreePage {
        let mut free = FreePage { page: Page::new() };
        free.set_next_free(next_free);
        free
    }

    pub fn from_page(page: Page) -> FreePage {
        FreePage { page }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn next_free(&self) -> PageNum {
        self.page.read_u64(0)
    }

    pub fn set_next_free(&mut self, page_num: PageNum) {
        self.page.write_u64(0, page_num);
    }
}

// ---------------------------------------------------------------------------
// Leaf node
// ---------------------------------------------------------------------------

/// One slot-directory entry of a leaf node.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Slot {
    pub key: RecordKey,
    pub value_offset: u16,
    pub value_size: u16,
    /// Low 16 bits of the transaction that last wrote the record.
    /// Diagnostic only; lock ownership never consults it.
    pub trx_tag: u16,
}

/// View of a leaf node: slot directory growing forward from the header,
/// values growing backward from the page end.
pub struct LeafNode {
    page: Page,
}

impl LeafNode {
    pub fn init(parent: PageNum) -> LeafNode {
        let mut leaf = LeafNode { page: Page::new() };
        leaf.page.write_u64(OFF_PARENT, parent);
        leaf.page.write_u32(OFF_IS_LEAF, 1);
        leaf.page.write_u32(OFF_KEY_COUNT, 0);
        leaf.page.write_u64(OFF_FOOTER_1, PAGE_BODY as u64);
        leaf.page.write_u64(OFF_FOOTER_2, 0);
        leaf
    }

    pub fn from_page(page: Page) -> LeafNode {
        LeafNode { page }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn parent(&self) -> PageNum {
        self.page.read_u64(OFF_PARENT)
    }

    pub fn set_parent(&mut self, parent: PageNum) {
        self.page.write_u64(OFF_PARENT, parent);
    }

    pub fn key_count(&self) -> usize {
        self.page.read_u32(OFF_KEY_COUNT) as usize
    }

    fn set_key_count(&mut self, count: usize) {
        self.page.write_u32(OFF_KEY_COUNT, count as u32);
    }

    pub fn free_space(&self) -> usize {
        self.page.read_u64(OFF_FOOTER_1) as usize
    }

    fn set_free_space(&mut self, free: usize) {
        self.page.write_u64(OFF_FOOTER_1, free as u64);
    }

    /// Right sibling page number, 0 for the rightmost leaf.
    pub fn next_sibling(&self) -> PageNum {
        self.page.read_u64(OFF_FOOTER_2)
    }

    pub fn set_next_sibling(&mut self, page_num: PageNum) {
        self.page.write_u64(OFF_FOOTER_2, page_num);
    }

    pub fn slot(&self, idx: usize) -> Slot {
        let at = PAGE_HEADER_SIZE + idx * SLOT_SIZE;
        Slot {
            key: self.page.read_i64(at),
            value_offset: self.page.read_u16(at + 8),
            value_size: self.page.read_u16(at + 10),
            trx_tag: self.page.read_u16(at + 12),
        }
    }

    fn set_slot(&mut self, idx: usize, slot: Slot) {
        let at = PAGE_HEADER_SIZE + idx * SLOT_SIZE;
        self.page.write_i64(at, slot.key);
        self.page.write_u16(at + 8, slot.value_offset);
        self.page.write_u16(at + 10, slot.value_size);
        self.page.write_u16(at + 12, slot.trx_tag);
    }

    /// Slot index holding `key`, if present.
    pub fn record_index(&self, key: RecordKey) -> Option<usize> {
        (0..self.key_count()).find(|&i| self.slot(i).key == key)
    }

    pub fn value(&self, idx: usize) -> &[u8] {
        let slot = self.slot(idx);
        let start = slot.value_offset as usize;
        &self.page.as_bytes()[start..start + slot.value_size as usize]
    }

    /// A record fits when both the byte budget and the lockable-slot
    /// budget allow it.
    pub fn has_room(&self, value_size: usize) -> bool {
        self.free_space() >= value_size + SLOT_SIZE && self.key_count() < MAX_SLOTS
    }

    /// Append a record after the current last slot. The caller is in
    /// charge of overall key order (records are appended in sorted order
    /// or the directory is rebuilt afterwards).
    pub fn append(&mut self, key: RecordKey, value: &[u8], trx_tag: u16) -> bool {
        if !self.has_room(value.len()) {
            return false;
        }

        let n = self.key_count();
        let value_offset = if n == 0 {
            PAGE_SIZE - value.len()
        } else {
            self.slot(n - 1).value_offset as usize - value.len()
        };

        self.set_slot(
            n,
            Slot {
                key,
                value_offset: value_offset as u16,
                value_size: value.len() as u16,
                trx_tag,
            },
        );
        self.page.as_bytes_mut()[value_offset..value_offset + value.len()].copy_from_slice(value);

        self.set_key_count(n + 1);
        self.set_free_space(self.free_space() - value.len() - SLOT_SIZE);
        true
    }

    /// Remove the record holding `key` and compact the value area in
    /// place: every value stored below the removed one moves up by the
    /// removed size, and the corresponding slots shift down by one.
    pub fn remove(&mut self, key: RecordKey) -> bool {
        let n = self.key_count();
        let idx = match self.record_index(key) {
            Some(idx) => idx,
            None => return false,
        };

        let shift = self.slot(idx).value_size as usize;
        for j in idx + 1..n {
            let mut slot = self.slot(j);
            let start = slot.value_offset as usize;
            self.page
                .as_bytes_mut()
                .copy_within(start..start + slot.value_size as usize, start + shift);

            slot.value_offset += shift as u16;
            self.set_slot(j - 1, slot);
        }

        self.set_key_count(n - 1);
        self.set_free_space(self.free_space() + shift + SLOT_SIZE);
        true
    }

    /// Overwrite the value of slot `idx` with one of the same size.
    pub fn overwrite(&mut self, idx: usize, value: &[u8], trx_tag: u16) {
        let mut slot = self.slot(idx);
        debug_assert_eq!(slot.value_size as usize, value.len());

        let start = slot.value_offset as usize;
        self.page.as_bytes_mut()[start..start + value.len()].copy_from_slice(value);

        slot.trx_tag = trx_tag;
        self.set_slot(idx, slot);
    }

    /// Copy out every record, slot order preserved.
    pub fn records(&self) -> Vec<(RecordKey, Vec<u8>, u16)> {
        (0..self.key_count())
            .map(|i| {
                let slot = self.slot(i);
                (slot.key, self.value(i).to_vec(), slot.trx_tag)
            })
            .collect()
    }

    /// Drop every record, keeping parent and sibling links. Used before a
    /// sorted rebuild of the directory.
    pub fn reset(&mut self) {
        self.set_key_count(0);
        self.set_free_space(PAGE_BODY);
    }
}

// ---------------------------------------------------------------------------
// Internal node
// ---------------------------------------------------------------------------

/// One branch of an internal node: every key routes to the child holding
/// keys greater than or equal to it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Branch {
    pub key: RecordKey,
    pub child: PageNum,
}

/// View of an internal node: up to 248 sorted branches plus the leftmost
/// child stored in the header footer, so `k` keys route `k + 1` children.
pub struct InternalNode {
    page: Page,
}

impl InternalNode {
    pub fn init(parent: PageNum) -> InternalNode {
        let mut node = InternalNode { page: Page::new() };
        node.page.write_u64(OFF_PARENT, parent);
        node.page.write_u32(OFF_IS_LEAF, 0);
        node.page.write_u32(OFF_KEY_COUNT, 0);
        node.page.write_u64(OFF_FOOTER_2, 0);
        node
    }

    pub fn from_page(page: Page) -> InternalNode {
        InternalNode { page }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn parent(&self) -> PageNum {
        self.page.read_u64(OFF_PARENT)
    }

    pub fn set_parent(&mut self, parent: PageNum) {
        self.page.write_u64(OFF_PARENT, parent);
    }

    pub fn key_count(&self) -> usize {
        self.page.read_u32(OFF_KEY_COUNT) as usize
    }

    fn set_key_count(&mut self, count: usize) {
        self.page.write_u32(OFF_KEY_COUNT, count as u32);
    }

    /// Child routing keys smaller than every branch key.
    pub fn leftmost_child(&self) -> PageNum {
        self.page.read_u64(OFF_FOOTER_2)
    }

    pub fn set_leftmost_child(&mut self, page_num: PageNum) {
        self.page.write_u64(OFF_FOOTER_2, page_num);
    }

    pub fn branch(&self, idx: usize) -> Branch {
        let at = PAGE_HEADER_SIZE + idx * BRANCH_STRIDE;
        Branch {
            key: self.page.read_i64(at),
            child: self.page.read_u64(at + 8),
        }
    }

    pub fn set_branch(&mut self, idx: usize, branch: Branch) {
        let at = PAGE_HEADER_SIZE + idx * BRANCH_STRIDE;
        self.page.write_i64(at, branch.key);
        self.page.write_u64(at + 8, branch.child);
    }

    pub fn branches(&self) -> Vec<Branch> {
        (0..self.key_count()).map(|i| self.branch(i)).collect()
    }

    /// Append a branch after the current last one. Fails when the node is
    /// full; the caller splits in that case.
    pub fn append_branch(&mut self, key: RecordKey, child: PageNum) -> bool {
        let n = self.key_count();
        if n == MAX_PAGE_BRANCHES {
            return false;
        }

        self.set_branch(n, Branch { key, child });
        self.set_key_count(n + 1);
        true
    }

    /// Replace the whole branch array, e.g. with the left half after a
    /// split.
    pub fn rebuild_branches(&mut self, branches: &[Branch]) {
        for (i, b) in branches.iter().enumerate() {
            self.set_branch(i, *b);
        }
        self.set_key_count(branches.len());
    }

    /// Restore key order after an out-of-place append.
    pub fn sort_branches(&mut self) {
        let mut branches = self.branches();
        branches.sort_by_key(|b| b.key);
        for (i, b) in branches.into_iter().enumerate() {
            self.set_branch(i, b);
        }
    }

    /// Prepend a branch, shifting everything right. Used when rotating a
    /// branch in from the left sibling.
    pub fn insert_branch_front(&mut self, key: RecordKey, child: PageNum) -> bool {
        let n = self.key_count();
        if n == MAX_PAGE_BRANCHES {
            return false;
        }

        for i in (0..n).rev() {
            let b = self.branch(i);
            self.set_branch(i + 1, b);
        }
        self.set_branch(0, Branch { key, child });
        self.set_key_count(n + 1);
        true
    }

    /// Remove the branch carrying `key`, shifting the rest left.
    pub fn remove_branch(&mut self, key: RecordKey) -> bool {
        let n = self.key_count();
        let idx = match (0..n).find(|&i| self.branch(i).key == key) {
            Some(idx) => idx,
            None => return false,
        };

        for i in idx + 1..n {
            let b = self.branch(i);
            self.set_branch(i - 1, b);
        }
        self.set_key_count(n - 1);
        true
    }

    /// Branch index routing to `child`, if any.
    pub fn child_index(&self, child: PageNum) -> Option<usize> {
        (0..self.key_count()).find(|&i| self.branch(i).child == child)
    }

    /// Descend one level: the child of the last branch whose key is not
    /// greater than `key`, or the leftmost child when `key` sorts before
    /// every branch.
    pub fn route(&self, key: RecordKey) -> PageNum {
        let mut i = 0;
        while i < self.key_count() {
            if key < self.branch(i).key {
                break;
            }
            i += 1;
        }

        if i == 0 {
            self.leftmost_child()
        } else {
            self.branch(i - 1).child
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_append_and_lookup() {
        let mut leaf = LeafNode::init(0);

        assert!(leaf.append(10, b"ten", 0));
        assert!(leaf.append(20, b"twenty", 0));
        assert!(leaf.append(30, b"thirty", 7));

        assert_eq!(leaf.key_count(), 3);
        assert_eq!(leaf.record_index(20), Some(1));
        assert_eq!(leaf.value(1), b"twenty");
        assert_eq!(leaf.slot(2).trx_tag, 7);

        // values are packed back-to-front
        assert_eq!(leaf.slot(0).value_offset as usize, PAGE_SIZE - 3);
        assert_eq!(leaf.slot(1).value_offset as usize, PAGE_SIZE - 3 - 6);

        let used: usize = (0..3).map(|i| leaf.slot(i).value_size as usize + SLOT_SIZE).sum();
        assert_eq!(leaf.free_space(), PAGE_BODY - used);
    }

    #[test]
    fn test_leaf_remove_compacts_values() {
        let mut leaf = LeafNode::init(0);
        leaf.append(1, b"aaaa", 0);
        leaf.append(2, b"bb", 0);
        leaf.append(3, b"cccccc", 0);

        assert!(leaf.remove(2));
        assert!(!leaf.remove(2));

        assert_eq!(leaf.key_count(), 2);
        assert_eq!(leaf.record_index(1), Some(0));
        assert_eq!(leaf.record_index(3), Some(1));
        assert_eq!(leaf.value(0), b"aaaa");
        assert_eq!(leaf.value(1), b"cccccc");

        // slot 1 moved up by the removed 2 bytes
        assert_eq!(
            leaf.slot(1).value_offset as usize,
            PAGE_SIZE - 4 - 6
        );
        assert_eq!(leaf.free_space(), PAGE_BODY - 2 * SLOT_SIZE - 4 - 6);
    }

    #[test]
    fn test_leaf_slot_budget() {
        let mut leaf = LeafNode::init(0);
        for key in 0..MAX_SLOTS as i64 {
            assert!(leaf.append(key, b"x", 0));
        }

        // plenty of bytes left, but the lockable-slot budget is exhausted
        assert!(leaf.free_space() > MAX_VALUE_SIZE + SLOT_SIZE);
        assert!(!leaf.has_room(1));
        assert!(!leaf.append(1000, b"x", 0));
    }

    #[test]
    fn test_internal_route() {
        let mut node = InternalNode::init(0);
        node.set_leftmost_child(11);
        node.append_branch(10, 22);
        node.append_branch(20, 33);

        assert_eq!(node.route(5), 11);
        assert_eq!(node.route(10), 22);
        assert_eq!(node.route(15), 22);
        assert_eq!(node.route(20), 33);
        assert_eq!(node.route(100), 33);
    }

    #[test]
    fn test_internal_insert_remove() {
        let mut node = InternalNode::init(0);
        node.append_branch(30, 3);
        node.append_branch(10, 1);
        node.append_branch(20, 2);
        node.sort_branches();

        assert_eq!(node.branch(0), Branch { key: 10, child: 1 });
        assert_eq!(node.branch(2), Branch { key: 30, child: 3 });

        assert!(node.remove_branch(20));
        assert_eq!(node.key_count(), 2);
        assert_eq!(node.branch(1), Branch { key: 30, child: 3 });

        assert!(node.insert_branch_front(5, 9));
        assert_eq!(node.branch(0), Branch { key: 5, child: 9 });
        assert_eq!(node.child_index(3), Some(2));
    }

    #[test]
    fn test_branch_capacity_fills_body() {
        let mut node = InternalNode::init(0);
        for i in 0..MAX_PAGE_BRANCHES as i64 {
            assert!(node.append_branch(i, i as PageNum + 1));
        }
        assert!(!node.append_branch(999, 999));
        assert_eq!(PAGE_HEADER_SIZE + MAX_PAGE_BRANCHES * BRANCH_STRIDE, PAGE_SIZE);
    }
}
