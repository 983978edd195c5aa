//! Transaction manager: instance table, the per-transaction undo log and
//! the begin/commit/abort lifecycle, plus the lock wrapper the index
//! calls on every record access.

use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::transaction::lock_manager::{Acquired, LockId, LockManager, LockMode};
use crate::types::{PageNum, RecordKey, TableId, TrxId};
use crate::Database;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum TrxState {
    Running,
    Waiting,
    Committing,
    Aborting,
}

/// Pre-image of one update, replayed backwards on rollback.
pub(crate) struct UndoRecord {
    pub table_id: TableId,
    pub key: RecordKey,
    pub old_value: Vec<u8>,
}

struct TrxInstance {
    state: TrxState,
    lock_head: Option<LockId>,
    lock_tail: Option<LockId>,
    undo: Vec<UndoRecord>,
}

struct TrxTable {
    next_id: TrxId,
    instances: HashMap<TrxId, TrxInstance>,
}

pub struct TransactionManager {
    inner: Mutex<TrxTable>,
}

impl TransactionManager {
    pub fn new() -> TransactionManager {
        TransactionManager {
            inner: Mutex::new(TrxTable {
                next_id: 0,
                instances: HashMap::new(),
            }),
        }
    }

    pub(crate) fn begin(&self) -> TrxId {
        let mut table = self.inner.lock().unwrap();
        table.next_id += 1;
        let trx_id = table.next_id;
        table.instances.insert(
            trx_id,
            TrxInstance {
                state: TrxState::Running,
                lock_head: None,
                lock_tail: None,
                undo: Vec::new(),
            },
        );
        trx_id
    }

    pub(crate) fn state(&self, trx_id: TrxId) -> Option<TrxState> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .get(&trx_id)
            .map(|i| i.state)
    }

    pub(crate) fn is_running(&self, trx_id: TrxId) -> bool {
        self.state(trx_id) == Some(TrxState::Running)
    }

    pub(crate) fn set_state(&self, trx_id: TrxId, state: TrxState) {
        if let Some(instance) = self.inner.lock().unwrap().instances.get_mut(&trx_id) {
            instance.state = state;
        }
    }

    pub(crate) fn push_undo(&self, trx_id: TrxId, record: UndoRecord) -> Result<()> {
        let mut table = self.inner.lock().unwrap();
        match table.instances.get_mut(&trx_id) {
            Some(instance) => {
                instance.undo.push(record);
                Ok(())
            }
            None => Err(Error::InactiveTransaction(trx_id)),
        }
    }

    /// Detach the undo log for replay; rollback owns it from here.
    pub(crate) fn take_undo(&self, trx_id: TrxId) -> Vec<UndoRecord> {
        let mut table = self.inner.lock().unwrap();
        match table.instances.get_mut(&trx_id) {
            Some(instance) => std::mem::replace(&mut instance.undo, Vec::new()),
            None => Vec::new(),
        }
    }

    /// Hook a freshly granted lock onto the transaction's chain.
    pub(crate) fn adopt_lock(&self, trx_id: TrxId, lock_id: LockId, locks: &LockManager) {
        let mut table = self.inner.lock().unwrap();
        if let Some(instance) = table.instances.get_mut(&trx_id) {
            match instance.lock_tail {
                Some(tail) => locks.chain_after(tail, lock_id),
                None => instance.lock_head = Some(lock_id),
            }
            instance.lock_tail = Some(lock_id);
        }
    }

    /// Detach the lock chain head for release, dropping the instance's
    /// references to it.
    pub(crate) fn take_lock_chain(&self, trx_id: TrxId) -> Option<LockId> {
        let mut table = self.inner.lock().unwrap();
        match table.instances.get_mut(&trx_id) {
            Some(instance) => {
                instance.lock_tail = None;
                instance.lock_head.take()
            }
            None => None,
        }
    }

    pub(crate) fn remove(&self, trx_id: TrxId) {
        self.inner.lock().unwrap().instances.remove(&trx_id);
    }
}

impl Default for TransactionManager {
    fn default() -> TransactionManager {
        TransactionManager::new()
    }
}

impl Database {
    /// Start a transaction and hand out its positive id.
    pub fn begin(&self) -> TrxId {
        let trx_id = self.trxs.begin();
        debug!("transaction {} started", trx_id);
        trx_id
    }

    /// Commit: flush, release every lock, drop the instance. Only a
    /// running transaction commits; anything else is refused.
    pub fn commit(&self, trx_id: TrxId) -> Result<TrxId> {
        if !self.trxs.is_running(trx_id) {
            return Err(Error::InactiveTransaction(trx_id));
        }
        self.trxs.set_state(trx_id, TrxState::Committing);

        // step 1: make every touched table durable
        self.disk.sync_all()?;

        // step 2: strict 2PL shrink, all at once
        let chain = self.trxs.take_lock_chain(trx_id);
        self.locks.release_all(chain);

        // step 3: forget the instance
        self.trxs.remove(trx_id);
        debug!("transaction {} committed", trx_id);
        Ok(trx_id)
    }

    /// Roll a transaction back: undo every update in reverse, then
    /// release its locks and drop the instance.
    pub fn abort(&self, trx_id: TrxId) -> Result<()> {
        match self.trxs.state(trx_id) {
            Some(TrxState::Running) | Some(TrxState::Waiting) => {}
            _ => return Err(Error::InactiveTransaction(trx_id)),
        }
        self.trxs.set_state(trx_id, TrxState::Aborting);

        self.rollback(trx_id)?;
        self.disk.sync_all()?;

        let chain = self.trxs.take_lock_chain(trx_id);
        self.locks.release_all(chain);

        self.trxs.remove(trx_id);
        info!("transaction {} aborted", trx_id);
        Ok(())
    }

    /// Replay the undo log newest-first. The updates run through the
    /// ordinary update path without logging; they cannot block, because
    /// the aborting transaction already owns the exclusive locks on
    /// everything it touched.
    fn rollback(&self, trx_id: TrxId) -> Result<()> {
        let undo = self.trxs.take_undo(trx_id);
        for record in undo.into_iter().rev() {
            self.update_node(record.table_id, record.key, &record.old_value, trx_id, false)?;
        }
        Ok(())
    }

    /// Lock wrapper used by the index on every record access: parks the
    /// transaction in `Waiting`, acquires, and adopts a newly created
    /// lock into the transaction's chain. A refused (deadlocking)
    /// request aborts the requester on the spot.
    pub(crate) fn lock_record(
        &self,
        table_id: TableId,
        page_num: PageNum,
        slot: usize,
        trx_id: TrxId,
        mode: LockMode,
    ) -> Result<()> {
        let previous = self
            .trxs
            .state(trx_id)
            .ok_or(Error::InactiveTransaction(trx_id))?;
        if previous == TrxState::Running {
            self.trxs.set_state(trx_id, TrxState::Waiting);
        }

        match self.locks.acquire(table_id, page_num, slot, trx_id, mode)? {
            Some(Acquired {
                lock_id,
                newly_created: true,
            }) => {
                self.trxs.adopt_lock(trx_id, lock_id, &self.locks);
            }
            Some(_) => {}
            None => {
                // deadlock: this transaction is the victim
                if previous == TrxState::Running {
                    self.abort(trx_id)?;
                }
                return Err(Error::Deadlock(trx_id));
            }
        }

        if previous == TrxState::Running {
            self.trxs.set_state(trx_id, TrxState::Running);
        }
        Ok(())
    }
}
