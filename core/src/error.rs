//! Error types shared by every subsystem in this crate.
//!
//! All fallible operations return [`CoreError`] through the crate-wide
//! [`Result`] alias. The decoder treats [`CoreError::CapacityOverflow`] as a
//! soft failure: the single frequency update that would wrap is skipped and
//! the surrounding operation carries on.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Load/save of memory chunks, attach/load/save of bigram databases.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed phrase-index image or wrong magic on a bigram database.
    #[error("format error: {0}")]
    Format(String),

    /// Operation on a token that does not exist, or an out-of-range offset.
    #[error("range error: {0}")]
    Range(String),

    /// Violated precondition, e.g. inserting an already-present successor.
    #[error("logic error: {0}")]
    Logic(String),

    /// A u32 frequency update would wrap. Reported as a soft failure; the
    /// caller skips the one update and continues.
    #[error("frequency counter would overflow")]
    CapacityOverflow,

    #[error("database error: {0}")]
    Db(#[from] redb::Error),
}

impl From<redb::DatabaseError> for CoreError {
    fn from(e: redb::DatabaseError) -> Self {
        CoreError::Db(e.into())
    }
}

impl From<redb::TransactionError> for CoreError {
    fn from(e: redb::TransactionError) -> Self {
        CoreError::Db(e.into())
    }
}

impl From<redb::TableError> for CoreError {
    fn from(e: redb::TableError) -> Self {
        CoreError::Db(e.into())
    }
}

impl From<redb::StorageError> for CoreError {
    fn from(e: redb::StorageError) -> Self {
        CoreError::Db(e.into())
    }
}

impl From<redb::CommitError> for CoreError {
    fn from(e: redb::CommitError) -> Self {
        CoreError::Db(e.into())
    }
}
