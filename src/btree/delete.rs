//! Delete path: slot removal with in-page compaction, then rebalancing.
//! An underfull leaf prefers its right sibling, coalesces when both fit
//! into one page and redistributes otherwise; internal nodes follow the
//! same policy at branch granularity.

use log::debug;

use crate::error::{Error, Result};
use crate::storage::page::{
    InternalNode, LeafNode, MAX_PAGE_BRANCHES, MAX_SLOTS, PAGE_BODY, REDISTRIBUTE_THRESHOLD,
    SLOT_SIZE,
};
use crate::types::{PageNum, RecordKey, TableId, TrxId};
use crate::Database;

impl Database {
    /// Remove `key` from the table's tree. Returns the root page after
    /// rebalancing.
    pub(crate) fn delete_node(
        &self,
        table_id: TableId,
        key: RecordKey,
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let leaf_num = self.find_leaf(table_id, key, trx_id)?;
        if leaf_num == 0 {
            return Err(Error::NotFound(key));
        }

        let leaf = LeafNode::from_page(self.pool.read_page((table_id, leaf_num), trx_id, false)?);
        if leaf.record_index(key).is_none() {
            return Err(Error::NotFound(key));
        }

        self.delete_leaf_key(table_id, leaf_num, key, trx_id)
    }

    /// Remove the record from its leaf and rebalance if the page fell
    /// below the fill threshold.
    fn delete_leaf_key(
        &self,
        table_id: TableId,
        leaf_num: PageNum,
        key: RecordKey,
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let root_num = self.root_page(table_id, trx_id)?;

        let mut leaf =
            LeafNode::from_page(self.pool.read_page((table_id, leaf_num), trx_id, true)?);
        leaf.remove(key);
        self.pool.write_page((table_id, leaf_num), leaf.page())?;

        if leaf_num == root_num {
            return self.adjust_root(table_id, trx_id);
        }

        // still well filled, nothing to rebalance
        if leaf.free_space() < REDISTRIBUTE_THRESHOLD {
            return Ok(root_num);
        }

        let parent_num = leaf.parent();
        let parent =
            InternalNode::from_page(self.pool.read_page((table_id, parent_num), trx_id, false)?);

        // prefer the right sibling; fall back to the left one when this
        // leaf is the rightmost child of its parent
        let mut sibling_num = leaf.next_sibling();
        let mut separator_idx = parent.child_index(sibling_num).unwrap_or(0);
        let mut left_sibling = false;

        if sibling_num == 0 {
            let picked = Self::pick_left_sibling(&parent, leaf_num);
            separator_idx = picked.0;
            sibling_num = picked.1;
            left_sibling = true;
        }

        let mut sibling =
            LeafNode::from_page(self.pool.read_page((table_id, sibling_num), trx_id, false)?);

        // a right sibling under a different parent cannot donate through
        // this parent's separator; use the left neighbor instead
        if !left_sibling && sibling.parent() != parent_num {
            let picked = Self::pick_left_sibling(&parent, leaf_num);
            separator_idx = picked.0;
            sibling_num = picked.1;
            left_sibling = true;
            sibling =
                LeafNode::from_page(self.pool.read_page((table_id, sibling_num), trx_id, false)?);
        }

        // merging must respect the byte budget and the lockable-slot
        // budget of the surviving page
        let merged_fits = leaf.free_space() + sibling.free_space() >= PAGE_BODY
            && leaf.key_count() + sibling.key_count() <= MAX_SLOTS;

        if merged_fits {
            if left_sibling {
                self.coalesce_leaves(table_id, sibling_num, leaf_num, trx_id)
            } else {
                self.coalesce_leaves(table_id, leaf_num, sibling_num, trx_id)
            }
        } else if left_sibling {
            self.redistribute_from_left_leaf(table_id, leaf_num, sibling_num, separator_idx, trx_id)
        } else {
            self.redistribute_from_right_leaf(
                table_id,
                leaf_num,
                sibling_num,
                separator_idx,
                trx_id,
            )
        }
    }

    /// Left neighbor of `child` as (separator index, page), read off the
    /// parent's branch array.
    fn pick_left_sibling(parent: &InternalNode, child: PageNum) -> (usize, PageNum) {
        if parent.key_count() < 2 {
            (0, parent.leftmost_child())
        } else if parent.leftmost_child() == child {
            (0, parent.leftmost_child())
        } else {
            match parent.child_index(child) {
                Some(0) => (0, parent.leftmost_child()),
                Some(i) => (i, parent.branch(i - 1).child),
                None => (
                    parent.key_count() - 1,
                    parent.branch(parent.key_count() - 2).child,
                ),
            }
        }
    }

    /// Fold `right` into `left`, splice the sibling chain and drop the
    /// parent's separator branch.
    fn coalesce_leaves(
        &self,
        table_id: TableId,
        left_num: PageNum,
        right_num: PageNum,
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let mut left =
            LeafNode::from_page(self.pool.read_page((table_id, left_num), trx_id, true)?);
        let right =
            LeafNode::from_page(self.pool.read_page((table_id, right_num), trx_id, false)?);

        for (key, value, trx_tag) in right.records() {
            left.append(key, &value, trx_tag);
        }
        left.set_next_sibling(right.next_sibling());
        self.pool.write_page((table_id, left_num), left.page())?;

        self.pool.free_page(table_id, right_num, trx_id)?;
        debug!(
            "coalesced leaf {} into {} on table {}",
            right_num, left_num, table_id
        );

        let parent_num = left.parent();
        let parent =
            InternalNode::from_page(self.pool.read_page((table_id, parent_num), trx_id, false)?);
        match parent.child_index(right_num) {
            Some(idx) => {
                let separator = parent.branch(idx).key;
                self.delete_internal_key(table_id, parent_num, separator, trx_id)
            }
            None => self.root_page(table_id, trx_id),
        }
    }

    /// Pull records off the right sibling's front until this leaf is
    /// comfortably filled, then refresh the parent separator.
    fn redistribute_from_right_leaf(
        &self,
        table_id: TableId,
        leaf_num: PageNum,
        sibling_num: PageNum,
        separator_idx: usize,
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let mut leaf =
            LeafNode::from_page(self.pool.read_page((table_id, leaf_num), trx_id, true)?);
        let mut sibling =
            LeafNode::from_page(self.pool.read_page((table_id, sibling_num), trx_id, true)?);
        let parent_num = leaf.parent();
        let mut parent =
            InternalNode::from_page(self.pool.read_page((table_id, parent_num), trx_id, true)?);

        while sibling.key_count() > 0 && leaf.free_space() >= REDISTRIBUTE_THRESHOLD {
            let slot = sibling.slot(0);
            let value = sibling.value(0).to_vec();
            if !leaf.append(slot.key, &value, slot.trx_tag) {
                break;
            }
            sibling.remove(slot.key);
        }

        if sibling.key_count() > 0 {
            let mut branch = parent.branch(separator_idx);
            branch.key = sibling.slot(0).key;
            parent.set_branch(separator_idx, branch);
        }

        self.pool.write_page((table_id, leaf_num), leaf.page())?;
        self.pool
            .write_page((table_id, sibling_num), sibling.page())?;
        self.pool.write_page((table_id, parent_num), parent.page())?;

        self.root_page(table_id, trx_id)
    }

    /// Take records off the left sibling's tail, rebuild this leaf with
    /// them in front and refresh the parent separator.
    fn redistribute_from_left_leaf(
        &self,
        table_id: TableId,
        leaf_num: PageNum,
        sibling_num: PageNum,
        separator_idx: usize,
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let mut leaf =
            LeafNode::from_page(self.pool.read_page((table_id, leaf_num), trx_id, true)?);
        let mut sibling =
            LeafNode::from_page(self.pool.read_page((table_id, sibling_num), trx_id, true)?);
        let parent_num = leaf.parent();
        let mut parent =
            InternalNode::from_page(self.pool.read_page((table_id, parent_num), trx_id, true)?);

        let mut moved = Vec::new();
        let mut budget = leaf.free_space();
        while sibling.key_count() > 0
            && budget >= REDISTRIBUTE_THRESHOLD
            && leaf.key_count() + moved.len() < MAX_SLOTS
        {
            let last = sibling.key_count() - 1;
            let slot = sibling.slot(last);
            moved.push((slot.key, sibling.value(last).to_vec(), slot.trx_tag));
            budget -= slot.value_size as usize + SLOT_SIZE;
            sibling.remove(slot.key);
        }
        moved.reverse();

        let mut records = moved;
        records.extend(leaf.records());
        leaf.reset();
        for (key, value, trx_tag) in &records {
            leaf.append(*key, value, *trx_tag);
        }

        let mut branch = parent.branch(separator_idx);
        branch.key = leaf.slot(0).key;
        parent.set_branch(separator_idx, branch);

        self.pool.write_page((table_id, leaf_num), leaf.page())?;
        self.pool
            .write_page((table_id, sibling_num), sibling.page())?;
        self.pool.write_page((table_id, parent_num), parent.page())?;

        self.root_page(table_id, trx_id)
    }

    /// Drop a branch from an internal node and rebalance the internal
    /// level: coalesce with a sibling when both fit, rotate one branch
    /// through the parent otherwise.
    fn delete_internal_key(
        &self,
        table_id: TableId,
        node_num: PageNum,
        key: RecordKey,
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let root_num = self.root_page(table_id, trx_id)?;

        let mut node =
            InternalNode::from_page(self.pool.read_page((table_id, node_num), trx_id, true)?);
        node.remove_branch(key);
        self.pool.write_page((table_id, node_num), node.page())?;

        if node_num == root_num {
            return self.adjust_root(table_id, trx_id);
        }
        if node.key_count() >= MAX_PAGE_BRANCHES / 2 {
            return Ok(root_num);
        }

        let parent_num = node.parent();
        let parent =
            InternalNode::from_page(self.pool.read_page((table_id, parent_num), trx_id, false)?);

        // right sibling through the parent, or the left one when this is
        // the parent's last child
        let mut separator_idx = 0;
        let mut separator = 0;
        let mut sibling_num = 0;
        let mut left_sibling = false;

        if parent.leftmost_child() == node_num && parent.key_count() > 0 {
            separator_idx = 0;
            separator = parent.branch(0).key;
            sibling_num = parent.branch(0).child;
        }
        for i in 0..parent.key_count().saturating_sub(1) {
            if parent.branch(i).child == node_num {
                separator_idx = i + 1;
                separator = parent.branch(i + 1).key;
                sibling_num = parent.branch(i + 1).child;
            }
        }

        if sibling_num == 0 {
            if parent.key_count() < 2 {
                separator_idx = 0;
                separator = parent.branch(0).key;
                sibling_num = parent.leftmost_child();
            } else {
                separator_idx = parent.key_count() - 1;
                separator = parent.branch(parent.key_count() - 1).key;
                sibling_num = parent.branch(parent.key_count() - 2).child;
            }
            left_sibling = true;
        }

        let sibling =
            InternalNode::from_page(self.pool.read_page((table_id, sibling_num), trx_id, false)?);

        if node.key_count() + sibling.key_count() < MAX_PAGE_BRANCHES {
            if left_sibling {
                self.coalesce_internals(table_id, sibling_num, separator, node_num, trx_id)
            } else {
                self.coalesce_internals(table_id, node_num, separator, sibling_num, trx_id)
            }
        } else {
            self.rotate_internal_branch(
                table_id,
                node_num,
                sibling_num,
                separator_idx,
                separator,
                left_sibling,
                trx_id,
            )
        }
    }

    /// Fold `right` into `left` with the parent separator keyed between
    /// them, reparent every moved child, then drop the separator from the
    /// parent.
    fn coalesce_internals(
        &self,
        table_id: TableId,
        left_num: PageNum,
        separator: RecordKey,
        right_num: PageNum,
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let mut left =
            InternalNode::from_page(self.pool.read_page((table_id, left_num), trx_id, true)?);
        let right =
            InternalNode::from_page(self.pool.read_page((table_id, right_num), trx_id, false)?);

        left.append_branch(separator, right.leftmost_child());
        self.set_parent(table_id, right.leftmost_child(), left_num, trx_id)?;

        for branch in right.branches() {
            left.append_branch(branch.key, branch.child);
            self.set_parent(table_id, branch.child, left_num, trx_id)?;
        }

        self.pool.write_page((table_id, left_num), left.page())?;
        self.pool.free_page(table_id, right_num, trx_id)?;
        debug!(
            "coalesced internal {} into {} on table {}",
            right_num, left_num, table_id
        );

        let parent_num = left.parent();
        let parent =
            InternalNode::from_page(self.pool.read_page((table_id, parent_num), trx_id, false)?);
        match parent.child_index(right_num) {
            Some(idx) => {
                let separator = parent.branch(idx).key;
                self.delete_internal_key(table_id, parent_num, separator, trx_id)
            }
            None => self.root_page(table_id, trx_id),
        }
    }

    /// Siblings together overflow one page: rotate a single branch
    /// through the parent instead of merging.
    fn rotate_internal_branch(
        &self,
        table_id: TableId,
        node_num: PageNum,
        sibling_num: PageNum,
        separator_idx: usize,
        separator: RecordKey,
        left_sibling: bool,
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let mut node =
            InternalNode::from_page(self.pool.read_page((table_id, node_num), trx_id, true)?);
        let mut sibling =
            InternalNode::from_page(self.pool.read_page((table_id, sibling_num), trx_id, true)?);
        let parent_num = node.parent();
        let mut parent =
            InternalNode::from_page(self.pool.read_page((table_id, parent_num), trx_id, true)?);

        if !left_sibling {
            // separator comes down on the right of this node, the
            // sibling's leftmost child comes with it, and the sibling's
            // first key moves up
            let first = sibling.branch(0);
            let mut branch = parent.branch(separator_idx);
            branch.key = first.key;
            parent.set_branch(separator_idx, branch);

            let donated = sibling.leftmost_child();
            node.append_branch(separator, donated);
            self.set_parent(table_id, donated, node_num, trx_id)?;

            sibling.set_leftmost_child(first.child);
            sibling.remove_branch(first.key);
        } else {
            // mirror image: separator comes down on the left, the
            // sibling's last child becomes this node's leftmost
            let old_leftmost = node.leftmost_child();
            node.insert_branch_front(separator, old_leftmost);

            let last = sibling.key_count() - 1;
            let donated = sibling.branch(last);

            let mut branch = parent.branch(separator_idx);
            branch.key = donated.key;
            parent.set_branch(separator_idx, branch);

            node.set_leftmost_child(donated.child);
            self.set_parent(table_id, donated.child, node_num, trx_id)?;

            sibling.remove_branch(donated.key);
        }

        self.pool.write_page((table_id, node_num), node.page())?;
        self.pool
            .write_page((table_id, sibling_num), sibling.page())?;
        self.pool.write_page((table_id, parent_num), parent.page())?;

        self.root_page(table_id, trx_id)
    }
}
