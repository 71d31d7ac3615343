use redb::{CommitError, DatabaseError, StorageError, TableError, TransactionError};

/// Errors from the durable store. I/O failures abort the enclosing
/// transaction and are propagated, never swallowed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store was closed by the shutdown controller; the operation was
    /// not applied.
    #[error("store is closed")]
    Closed,

    #[error("decode record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Db(#[from] redb::Error),
}

impl From<DatabaseError> for StoreError {
    fn from(e: DatabaseError) -> Self {
        Self::Db(e.into())
    }
}

impl From<TransactionError> for StoreError {
    fn from(e: TransactionError) -> Self {
        Self::Db(e.into())
    }
}

impl From<TableError> for StoreError {
    fn from(e: TableError) -> Self {
        Self::Db(e.into())
    }
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        Self::Db(e.into())
    }
}

impl From<CommitError> for StoreError {
    fn from(e: CommitError) -> Self {
        Self::Db(e.into())
    }
}
