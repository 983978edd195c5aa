use std::io;

use thiserror::Error;

use crate::types::{RecordKey, TrxId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The process-wide limit of 32 simultaneously open tables is reached.
    #[error("table instance limit reached")]
    TableLimit,

    #[error("unknown table id {0}")]
    UnknownTable(i64),

    /// Record slot outside the lockable range `[0, 64)`.
    #[error("record slot {0} outside the lockable range")]
    InvalidSlot(usize),

    /// Value length outside `1..=112`.
    #[error("value size {0} out of range")]
    InvalidValueSize(usize),

    #[error("key {0} not found")]
    NotFound(RecordKey),

    /// The requesting transaction was chosen as a deadlock victim and has
    /// been rolled back.
    #[error("deadlock detected, transaction {0} aborted")]
    Deadlock(TrxId),

    /// The transaction already committed or aborted (or never existed).
    #[error("transaction {0} is not running")]
    InactiveTransaction(TrxId),
}

pub type Result<T> = std::result::Result<T, Error>;
