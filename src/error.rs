use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error and status surface of the engine.
///
/// Cursor status codes (`CursorIsNil`, `LimitsReached`, `KeyErasedInTxn`,
/// `TxnConflict`) travel on the error channel like every other failure; the
/// hybrid cursor inspects them to drive its merge walk, callers outside the
/// engine usually only see the remaining variants.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("key not found")]
    KeyNotFound,
    #[error("duplicate key")]
    DuplicateKey,
    #[error("cursor is nil")]
    CursorIsNil,
    #[error("end of duplicate list")]
    LimitsReached,
    #[error("conflict with a concurrent transaction")]
    TxnConflict,
    #[error("key was erased in a pending transaction")]
    KeyErasedInTxn,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
}

impl Error {
    /// True for the informational cursor statuses that leave the cursor in a
    /// well-defined state rather than aborting the operation.
    pub fn is_cursor_status(&self) -> bool {
        matches!(
            self,
            Error::CursorIsNil
                | Error::LimitsReached
                | Error::TxnConflict
                | Error::KeyErasedInTxn
        )
    }
}
