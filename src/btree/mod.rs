//! The B+ tree index: one tree per table file, rooted at the header
//! page's `root_page` field.
//!
//! The tree reads and writes pages exclusively through the buffer pool.
//! Methods are grouped by concern: search, insert (with splits), delete
//! (with coalescing and redistribution), update (transactional), plus the
//! integrity walker in `check`.

mod check;
mod delete;
mod insert;
mod search;
mod update;

use crate::error::Result;
use crate::storage::page::{self, HeaderPage, InternalNode, LeafNode};
use crate::types::{PageNum, TableId, TrxId};
use crate::Database;

impl Database {
    /// Current root page number of the table's tree, 0 for an empty tree.
    pub(crate) fn root_page(&self, table_id: TableId, trx_id: TrxId) -> Result<PageNum> {
        let header = HeaderPage::from_page(self.pool.read_page((table_id, 0), trx_id, false)?);
        Ok(header.root_page())
    }

    /// Allocate and initialize an empty leaf.
    fn make_leaf(&self, table_id: TableId, parent: PageNum, trx_id: TrxId) -> Result<PageNum> {
        let page_num = self.pool.alloc_page(table_id, trx_id)?;
        let leaf = LeafNode::init(parent);
        self.pool.write_page((table_id, page_num), leaf.page())?;
        Ok(page_num)
    }

    /// Allocate and initialize an empty internal node.
    fn make_internal(&self, table_id: TableId, parent: PageNum, trx_id: TrxId) -> Result<PageNum> {
        let page_num = self.pool.alloc_page(table_id, trx_id)?;
        let node = InternalNode::init(parent);
        self.pool.write_page((table_id, page_num), node.page())?;
        Ok(page_num)
    }

    /// Rewrite the parent pointer of a child of either kind.
    fn set_parent(
        &self,
        table_id: TableId,
        child: PageNum,
        parent: PageNum,
        trx_id: TrxId,
    ) -> Result<()> {
        let mut page = self.pool.read_page((table_id, child), trx_id, true)?;
        page::set_parent_of(&mut page, parent);
        self.pool.write_page((table_id, child), &page)
    }

    /// Shrink the tree after a delete emptied the root.
    ///
    /// A root with keys left stays as it is. An emptied internal root
    /// promotes its leftmost child; an emptied leaf root leaves the tree
    /// empty. The old root goes back to the free list either way.
    fn adjust_root(&self, table_id: TableId, trx_id: TrxId) -> Result<PageNum> {
        let header = HeaderPage::from_page(self.pool.read_page((table_id, 0), trx_id, false)?);
        let root_num = header.root_page();
        let root = self.pool.read_page((table_id, root_num), trx_id, false)?;

        let key_count = if page::is_leaf(&root) {
            LeafNode::from_page(root.clone()).key_count()
        } else {
            InternalNode::from_page(root.clone()).key_count()
        };
        if key_count > 0 {
            return Ok(root_num);
        }

        self.pool.free_page(table_id, root_num, trx_id)?;

        let mut header = HeaderPage::from_page(self.pool.read_page((table_id, 0), trx_id, true)?);
        if page::is_leaf(&root) {
            header.set_root_page(0);
            self.pool.write_page((table_id, 0), header.page())?;
            return Ok(0);
        }

        let promoted = InternalNode::from_page(root).leftmost_child();
        header.set_root_page(promoted);
        self.pool.write_page((table_id, 0), header.page())?;

        let mut new_root = self.pool.read_page((table_id, promoted), trx_id, true)?;
        page::set_parent_of(&mut new_root, 0);
        self.pool.write_page((table_id, promoted), &new_root)?;

        Ok(promoted)
    }
}
