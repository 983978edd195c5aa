//! Point lookups: root-to-leaf descent and slot-directory search.

use crate::error::{Error, Result};
use crate::storage::page::{self, InternalNode, LeafNode};
use crate::transaction::lock_manager::LockMode;
use crate::types::{PageNum, RecordKey, TableId, TrxId};
use crate::Database;

impl Database {
    /// Descend from the root to the leaf whose key range covers `key`.
    /// Returns 0 when the tree is empty.
    pub(crate) fn find_leaf(
        &self,
        table_id: TableId,
        key: RecordKey,
        trx_id: TrxId,
    ) -> Result<PageNum> {
        let mut current = self.root_page(table_id, trx_id)?;
        if current == 0 {
            return Ok(0);
        }

        let mut page = self.pool.read_page((table_id, current), trx_id, false)?;
        while !page::is_leaf(&page) {
            current = InternalNode::from_page(page).route(key);
            page = self.pool.read_page((table_id, current), trx_id, false)?;
        }

        Ok(current)
    }

    /// Plain lookup without locking: the non-transactional read path,
    /// also the duplicate probe of `insert`.
    pub(crate) fn find_record(
        &self,
        table_id: TableId,
        key: RecordKey,
        trx_id: TrxId,
    ) -> Result<Vec<u8>> {
        let leaf_num = self.find_leaf(table_id, key, trx_id)?;
        if leaf_num == 0 {
            return Err(Error::NotFound(key));
        }

        let leaf = LeafNode::from_page(self.pool.read_page((table_id, leaf_num), trx_id, false)?);
        match leaf.record_index(key) {
            Some(idx) => Ok(leaf.value(idx).to_vec()),
            None => Err(Error::NotFound(key)),
        }
    }

    /// Transactional lookup: takes a shared lock on the record's slot
    /// before reading the value, blocking while a conflicting writer owns
    /// it. A deadlock aborts the calling transaction.
    pub(crate) fn find_record_locked(
        &self,
        table_id: TableId,
        key: RecordKey,
        trx_id: TrxId,
    ) -> Result<Vec<u8>> {
        let leaf_num = self.find_leaf(table_id, key, trx_id)?;
        if leaf_num == 0 {
            return Err(Error::NotFound(key));
        }

        let leaf = LeafNode::from_page(self.pool.read_page((table_id, leaf_num), trx_id, false)?);
        let slot_idx = leaf.record_index(key).ok_or(Error::NotFound(key))?;

        self.lock_record(table_id, leaf_num, slot_idx, trx_id, LockMode::Shared)?;

        // the page may have moved on while the lock request slept
        let leaf = LeafNode::from_page(self.pool.read_page((table_id, leaf_num), trx_id, false)?);
        match leaf.record_index(key) {
            Some(idx) => Ok(leaf.value(idx).to_vec()),
            None => Err(Error::NotFound(key)),
        }
    }
}
