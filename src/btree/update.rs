//! Update path: X-lock the record, remember its pre-image for rollback,
//! then overwrite in place or re-insert when the size changes.

use crate::error::{Error, Result};
use crate::storage::page::LeafNode;
use crate::transaction::lock_manager::LockMode;
use crate::transaction::trx::UndoRecord;
use crate::types::{RecordKey, TableId, TrxId};
use crate::Database;

impl Database {
    /// Replace the value of `key` under `trx_id`, returning the old
    /// size. With `log_undo` the pre-image is appended to the
    /// transaction's undo log; rollback re-enters here with it off.
    pub(crate) fn update_node(
        &self,
        table_id: TableId,
        key: RecordKey,
        value: &[u8],
        trx_id: TrxId,
        log_undo: bool,
    ) -> Result<u16> {
        let leaf_num = self.find_leaf(table_id, key, trx_id)?;
        if leaf_num == 0 {
            return Err(Error::NotFound(key));
        }

        let leaf = LeafNode::from_page(self.pool.read_page((table_id, leaf_num), trx_id, false)?);
        let slot_idx = leaf.record_index(key).ok_or(Error::NotFound(key))?;

        self.lock_record(table_id, leaf_num, slot_idx, trx_id, LockMode::Exclusive)?;

        // take the page again under the lock; the slot may have moved
        // while the lock request slept
        let mut leaf =
            LeafNode::from_page(self.pool.read_page((table_id, leaf_num), trx_id, true)?);
        let slot_idx = match leaf.record_index(key) {
            Some(idx) => idx,
            None => {
                self.pool.release_page((table_id, leaf_num));
                return Err(Error::NotFound(key));
            }
        };

        let old_value = leaf.value(slot_idx).to_vec();
        if log_undo {
            self.trxs.push_undo(
                trx_id,
                UndoRecord {
                    table_id,
                    key,
                    old_value: old_value.clone(),
                },
            )?;
        }

        if value.len() == old_value.len() {
            leaf.overwrite(slot_idx, value, trx_id as u16);
            self.pool.write_page((table_id, leaf_num), leaf.page())?;
        } else {
            // a different size moves neighbors around: take the record
            // out and run it through the ordinary insert path, which may
            // split the leaf
            leaf.remove(key);
            self.pool.write_page((table_id, leaf_num), leaf.page())?;
            self.insert_node(table_id, key, value, trx_id)?;
        }

        Ok(old_value.len() as u16)
    }
}
