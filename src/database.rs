//! The engine context and its public facade.
//!
//! One [`Database`] value owns the four managers (disk, buffer pool,
//! locks, transactions); the functions that look like process-wide APIs
//! are methods on it. Tests can therefore run any number of independent
//! engines side by side.

use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::error::{Error, Result};
use crate::storage::buffer::{BufferPool, DEFAULT_BUFFER_SIZE};
use crate::storage::disk::DiskManager;
use crate::storage::page::MAX_VALUE_SIZE;
use crate::transaction::lock_manager::LockManager;
use crate::transaction::trx::TransactionManager;
use crate::types::{RecordKey, TableId, TrxId};

/// Engine configuration consumed by [`Database::open_with`].
#[derive(Clone, Copy, Debug)]
pub struct DbOptions {
    /// Number of page frames in the buffer pool.
    pub num_buffers: usize,
}

impl Default for DbOptions {
    fn default() -> DbOptions {
        DbOptions {
            num_buffers: DEFAULT_BUFFER_SIZE,
        }
    }
}

pub struct Database {
    pub(crate) disk: Arc<DiskManager>,
    pub(crate) pool: BufferPool,
    pub(crate) locks: LockManager,
    pub(crate) trxs: TransactionManager,
}

impl Database {
    /// Bring the engine up with the default buffer pool size.
    pub fn open() -> Result<Database> {
        Database::open_with(DbOptions::default())
    }

    pub fn open_with(options: DbOptions) -> Result<Database> {
        let num_buffers = options.num_buffers.max(1);
        let disk = Arc::new(DiskManager::new());
        let pool = BufferPool::new(Arc::clone(&disk), num_buffers);

        info!("database up, {} buffer frames", num_buffers);
        Ok(Database {
            disk,
            pool,
            locks: LockManager::new(),
            trxs: TransactionManager::new(),
        })
    }

    /// Open (or create and pre-size) a table file.
    pub fn open_table<P: AsRef<Path>>(&self, path: P) -> Result<TableId> {
        self.disk.open_table(path)
    }

    /// Insert a record. Inserting a key that already exists is a no-op
    /// reported as success.
    pub fn insert(&self, table_id: TableId, key: RecordKey, value: &[u8]) -> Result<()> {
        check_value_size(value)?;
        self.insert_node(table_id, key, value, 0)?;
        Ok(())
    }

    /// Look a record up outside any transaction: no locks taken.
    pub fn find(&self, table_id: TableId, key: RecordKey) -> Result<Vec<u8>> {
        self.find_record(table_id, key, 0)
    }

    /// Look a record up under a transaction, shared-locking its slot
    /// first.
    pub fn find_in_trx(&self, table_id: TableId, key: RecordKey, trx_id: TrxId) -> Result<Vec<u8>> {
        if !self.trxs.is_running(trx_id) {
            return Err(Error::InactiveTransaction(trx_id));
        }
        self.find_record_locked(table_id, key, trx_id)
    }

    /// Replace a record's value under a transaction, returning the old
    /// size. Blocks while a conflicting lock is held; a deadlock aborts
    /// the calling transaction and surfaces as [`Error::Deadlock`].
    pub fn update(
        &self,
        table_id: TableId,
        key: RecordKey,
        value: &[u8],
        trx_id: TrxId,
    ) -> Result<u16> {
        check_value_size(value)?;
        if !self.trxs.is_running(trx_id) {
            return Err(Error::InactiveTransaction(trx_id));
        }
        self.update_node(table_id, key, value, trx_id, true)
    }

    /// Delete a record.
    pub fn delete(&self, table_id: TableId, key: RecordKey) -> Result<()> {
        self.delete_node(table_id, key, 0)?;
        Ok(())
    }

    /// Flush every dirty frame, fsync and close the table files. The
    /// checked counterpart of simply dropping the value.
    pub fn shutdown(self) -> Result<()> {
        self.pool.flush_all()?;
        self.disk.sync_all()?;
        self.disk.close_all();
        info!("database shut down");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // best-effort write-back for the unchecked exit path
        let _ = self.pool.flush_all();
    }
}

fn check_value_size(value: &[u8]) -> Result<()> {
    if value.is_empty() || value.len() > MAX_VALUE_SIZE {
        return Err(Error::InvalidValueSize(value.len()));
    }
    Ok(())
}
