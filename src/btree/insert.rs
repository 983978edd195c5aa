//! Insert path: sorted insertion into a leaf, leaf and internal splits,
//! parent propagation up to a fresh root.

use log::debug;

use crate::error::{Error, Result};
use crate::storage::page::{
    parent_of, Branch, HeaderPage, InternalNode, LeafNode, MAX_PAGE_BRANCHES, PAGE_BODY, SLOT_SIZE,
};
use crate::types::{PageNum, RecordKey, TableId, TrxId};
use crate::Database;

impl Database {
    /// Insert `(key, value)` into the table's tree. A duplicate key is
    /// ignored and reported as page 0; otherwise the leaf that received
    /// the record is returned.
    pub(crate) fn insert_node(
        &self,
        table_id: TableId,
        key: RecordKey,
        value: &[u8],
        trx_id: TrxId,
    ) -> Result<PageNum> {
        match self.find_record(table_id, key, trx_id) {
            Ok(_) => {
                debug!("ignoring duplicate insert of key {}", key);
                return Ok(0);
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if self.root_page(table_id, trx_id)? == 0 {
            return self.create_tree(table_id, key, value, trx_id);
        }

        let leaf_num = self.find_leaf(table_id, key, trx_id)?;
        let mut leaf =
            LeafNode::from_page(self.pool.read_page((table_id, leaf_num), trx_id, true)?);

        if !leaf.has_room(value.len()) {
            self.pool.release_page((table_id, leaf_num));
            return self.split_leaf(table_id, leaf_num, key, value, trx_id);
        }

        // rebuild the slot directory in key order with the new record in
        let mut records = leaf.records();
        records.push((key, value.to_vec(), trx_id as u16));
        records.sort_by_key(|r| r.0);

        leaf.reset();
        for (key, value, trx_tag) in &records {
            leaf.append(*key, value, *trx_tag);
        }
        self.pool.write_page((table_id, leaf_num), leaf.page())?;

        Ok(leaf_num)
    }

    /// Start a new tree: a single leaf holding the first record.
    fn create_tree(
        &self,
        table_id: TableId,
        key: RecordKey,
        value: &[u8],
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let leaf_num = self.make_leaf(table_id, 0, trx_id)?;

        let mut leaf =
            LeafNode::from_page(self.pool.read_page((table_id, leaf_num), trx_id, true)?);
        leaf.append(key, value, trx_id as u16);
        self.pool.write_page((table_id, leaf_num), leaf.page())?;

        let mut header = HeaderPage::from_page(self.pool.read_page((table_id, 0), trx_id, true)?);
        header.set_root_page(leaf_num);
        self.pool.write_page((table_id, 0), header.page())?;

        debug!("created tree for table {} at leaf {}", table_id, leaf_num);
        Ok(leaf_num)
    }

    /// Split a full leaf around the half-body point and push the first
    /// right-hand key up to the parent.
    fn split_leaf(
        &self,
        table_id: TableId,
        leaf_num: PageNum,
        key: RecordKey,
        value: &[u8],
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let mut leaf =
            LeafNode::from_page(self.pool.read_page((table_id, leaf_num), trx_id, true)?);

        let new_leaf_num = self.make_leaf(table_id, leaf.parent(), trx_id)?;
        let mut new_leaf =
            LeafNode::from_page(self.pool.read_page((table_id, new_leaf_num), trx_id, true)?);

        let mut records = leaf.records();
        records.push((key, value.to_vec(), trx_id as u16));
        records.sort_by_key(|r| r.0);

        // smallest prefix whose bytes reach half of the page body stays
        // behind; everything from the reaching record on moves right
        let mut split_start = 0;
        let mut accumulated = 0;
        for (i, (_, value, _)) in records.iter().enumerate() {
            accumulated += value.len() + SLOT_SIZE;
            if accumulated >= PAGE_BODY / 2 {
                split_start = i;
                break;
            }
        }
        if accumulated < PAGE_BODY / 2 {
            // the slot budget filled up before the byte budget: fall back
            // to an even count split
            split_start = records.len() / 2;
        }

        leaf.reset();
        for (key, value, trx_tag) in &records[..split_start] {
            leaf.append(*key, value, *trx_tag);
        }
        for (key, value, trx_tag) in &records[split_start..] {
            new_leaf.append(*key, value, *trx_tag);
        }
        let separator = records[split_start].0;

        new_leaf.set_next_sibling(leaf.next_sibling());
        leaf.set_next_sibling(new_leaf_num);

        self.pool.write_page((table_id, leaf_num), leaf.page())?;
        self.pool
            .write_page((table_id, new_leaf_num), new_leaf.page())?;

        debug!(
            "split leaf {} of table {}, new sibling {} starts at key {}",
            leaf_num, table_id, new_leaf_num, separator
        );
        self.insert_into_parent(table_id, leaf_num, separator, new_leaf_num, trx_id)
    }

    /// Register a freshly split-off right page under the parent of its
    /// left sibling, growing a new root when the left page was the root.
    fn insert_into_parent(
        &self,
        table_id: TableId,
        left: PageNum,
        key: RecordKey,
        right: PageNum,
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let left_page = self.pool.read_page((table_id, left), trx_id, false)?;
        let parent_num = parent_of(&left_page);

        if parent_num == 0 {
            return self.insert_into_new_root(table_id, left, key, right, trx_id);
        }

        let parent =
            InternalNode::from_page(self.pool.read_page((table_id, parent_num), trx_id, false)?);
        if parent.key_count() < MAX_PAGE_BRANCHES {
            return self.insert_into_internal(table_id, parent_num, key, right, trx_id);
        }

        self.split_internal(table_id, parent_num, key, right, trx_id)
    }

    /// Plain sorted insert into an internal node with room to spare.
    fn insert_into_internal(
        &self,
        table_id: TableId,
        node_num: PageNum,
        key: RecordKey,
        right: PageNum,
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let mut node =
            InternalNode::from_page(self.pool.read_page((table_id, node_num), trx_id, true)?);
        node.append_branch(key, right);
        node.sort_branches();
        self.pool.write_page((table_id, node_num), node.page())?;
        Ok(node_num)
    }

    /// Split a full internal node: 248 branches plus the incoming one are
    /// dealt 124 left, promote one, 124 right. Children moving right get
    /// their parent pointers rewritten before the split propagates.
    fn split_internal(
        &self,
        table_id: TableId,
        node_num: PageNum,
        key: RecordKey,
        right: PageNum,
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let mut node =
            InternalNode::from_page(self.pool.read_page((table_id, node_num), trx_id, true)?);

        let new_num = self.make_internal(table_id, node.parent(), trx_id)?;
        let mut new_node =
            InternalNode::from_page(self.pool.read_page((table_id, new_num), trx_id, true)?);

        let mut branches = node.branches();
        branches.push(Branch { key, child: right });
        branches.sort_by_key(|b| b.key);

        let half = MAX_PAGE_BRANCHES / 2; // 124

        node.rebuild_branches(&branches[..half]);

        let separator = branches[half].key;
        new_node.set_leftmost_child(branches[half].child);
        self.set_parent(table_id, branches[half].child, new_num, trx_id)?;

        for branch in &branches[half + 1..] {
            new_node.append_branch(branch.key, branch.child);
            self.set_parent(table_id, branch.child, new_num, trx_id)?;
        }

        self.pool.write_page((table_id, node_num), node.page())?;
        self.pool.write_page((table_id, new_num), new_node.page())?;

        debug!(
            "split internal {} of table {}, promoting key {} to parent",
            node_num, table_id, separator
        );
        self.insert_into_parent(table_id, node_num, separator, new_num, trx_id)
    }

    /// The split reached the old root: put both halves under a brand new
    /// root and point the header at it.
    fn insert_into_new_root(
        &self,
        table_id: TableId,
        left: PageNum,
        key: RecordKey,
        right: PageNum,
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let root_num = self.make_internal(table_id, 0, trx_id)?;

        let mut root =
            InternalNode::from_page(self.pool.read_page((table_id, root_num), trx_id, true)?);
        root.set_leftmost_child(left);
        root.append_branch(key, right);
        self.pool.write_page((table_id, root_num), root.page())?;

        self.set_parent(table_id, left, root_num, trx_id)?;
        self.set_parent(table_id, right, root_num, trx_id)?;

        let mut header = HeaderPage::from_page(self.pool.read_page((table_id, 0), trx_id, true)?);
        header.set_root_page(root_num);
        self.pool.write_page((table_id, 0), header.page())?;

        debug!("tree of table {} grew a new root {}", table_id, root_num);
        Ok(root_num)
    }
}
