//! Small id types shared by every layer.

/// Index of an open table, handed out by `open_table`.
pub type TableId = i64;

/// On-disk page number. Page 0 is always the header page.
pub type PageNum = u64;

/// Record key type of the single-column index.
pub type RecordKey = i64;

/// Transaction id. Assigned monotonically starting from 1; 0 marks an
/// operation running outside any transaction.
pub type TrxId = u32;

/// A page is uniquely named by its table and its page number.
pub type PageLocation = (TableId, PageNum);
