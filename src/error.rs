use std::io;
use std::os::raw::c_int;
use std::path::PathBuf;
use std::result;

use thiserror::Error;

use crate::policy;

/// Custom result type for store operations
pub type Result<T> = result::Result<T, Error>;

/// Status codes reported by the storage engine.
///
/// Values match the numeric codes of the LMDB C API so that they can be
/// logged, compared and mapped the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MdbError {
    /// Key/data pair already exists
    #[error("key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("no matching key/data pair found")]
    NotFound,
    /// Requested page not found
    #[error("requested page not found")]
    PageNotFound,
    /// Database file is corrupted
    #[error("database file is corrupted")]
    Corrupted,
    /// Update of meta page failed
    #[error("update of meta page failed")]
    Panic,
    /// Database version mismatch
    #[error("database version mismatch")]
    VersionMismatch,
    /// File is not a valid data file
    #[error("file is not a valid data file")]
    Invalid,
    /// Environment mapsize limit reached
    #[error("environment mapsize limit reached")]
    MapFull,
    /// Environment maxdbs limit reached
    #[error("environment maxdbs limit reached")]
    DbsFull,
    /// Environment maxreaders limit reached
    #[error("environment maxreaders limit reached")]
    ReadersFull,
    /// Thread-local storage keys full
    #[error("thread-local storage keys full")]
    TlsFull,
    /// Transaction has too many dirty pages
    #[error("transaction has too many dirty pages")]
    TxnFull,
    /// Too many open cursors
    #[error("too many open cursors")]
    CursorFull,
    /// Page has not enough space
    #[error("page has not enough space")]
    PageFull,
    /// Database contents grew beyond environment mapsize
    #[error("database contents grew beyond environment mapsize")]
    MapResized,
    /// Operation and DB incompatible
    #[error("operation and DB incompatible")]
    Incompatible,
    /// Invalid reuse of reader locktable slot
    #[error("invalid reuse of reader locktable slot")]
    BadRslot,
    /// Transaction must abort, has a child, or is invalid
    #[error("transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Unsupported size of key/DB name/data, or wrong DUPFIXED size
    #[error("unsupported size of key/DB name/data, or wrong DUPFIXED size")]
    BadValSize,
    /// The specified DBI was changed unexpectedly
    #[error("the specified DBI was changed unexpectedly")]
    BadDbi,
    /// System error, carries the positive OS errno
    #[error("system error {0}")]
    Other(c_int),
}

impl MdbError {
    /// Numeric status code as used by the C API.
    pub fn code(&self) -> c_int {
        match self {
            MdbError::KeyExist => -30799,
            MdbError::NotFound => -30798,
            MdbError::PageNotFound => -30797,
            MdbError::Corrupted => -30796,
            MdbError::Panic => -30795,
            MdbError::VersionMismatch => -30794,
            MdbError::Invalid => -30793,
            MdbError::MapFull => -30792,
            MdbError::DbsFull => -30791,
            MdbError::ReadersFull => -30790,
            MdbError::TlsFull => -30789,
            MdbError::TxnFull => -30788,
            MdbError::CursorFull => -30787,
            MdbError::PageFull => -30786,
            MdbError::MapResized => -30785,
            MdbError::Incompatible => -30784,
            MdbError::BadRslot => -30783,
            MdbError::BadTxn => -30782,
            MdbError::BadValSize => -30781,
            MdbError::BadDbi => -30780,
            MdbError::Other(code) => *code,
        }
    }
}

impl From<c_int> for MdbError {
    fn from(err: c_int) -> MdbError {
        match err {
            -30799 => MdbError::KeyExist,
            -30798 => MdbError::NotFound,
            -30797 => MdbError::PageNotFound,
            -30796 => MdbError::Corrupted,
            -30795 => MdbError::Panic,
            -30794 => MdbError::VersionMismatch,
            -30793 => MdbError::Invalid,
            -30792 => MdbError::MapFull,
            -30791 => MdbError::DbsFull,
            -30790 => MdbError::ReadersFull,
            -30789 => MdbError::TlsFull,
            -30788 => MdbError::TxnFull,
            -30787 => MdbError::CursorFull,
            -30786 => MdbError::PageFull,
            -30785 => MdbError::MapResized,
            -30784 => MdbError::Incompatible,
            -30783 => MdbError::BadRslot,
            -30782 => MdbError::BadTxn,
            -30781 => MdbError::BadValSize,
            -30780 => MdbError::BadDbi,
            err => MdbError::Other(err),
        }
    }
}

impl From<io::Error> for MdbError {
    fn from(err: io::Error) -> MdbError {
        match err.raw_os_error() {
            Some(code) => MdbError::Other(code),
            None => MdbError::Other(libc::EIO),
        }
    }
}

/// Failure classes surfaced by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    AlreadyInitialized,
    NotInitialized,
    ResourceExhausted,
    NotFound,
    Conflict,
    /// A retryable engine condition that outlived its retry budget.
    Transient,
    Fatal,
}

/// Errors returned by every public entry point of the store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("destination buffer too small: {needed} bytes needed, {available} available")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("environment already open at {}", .0.display())]
    AlreadyInitialized(PathBuf),
    #[error("environment is not initialized")]
    NotInitialized,
    #[error("batch is full ({capacity} operations)")]
    BatchFull { capacity: usize },
    #[error("scratch buffer exhausted: {needed} bytes needed, {available} available")]
    ScratchExhausted { needed: usize, available: usize },
    #[error("key not found")]
    NotFound,
    #[error("key already exists")]
    Conflict,
    #[error("engine capacity exhausted: {0}")]
    Exhausted(MdbError),
    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: usize, last: MdbError },
    #[error("storage engine failure: {0}")]
    Engine(MdbError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::BufferTooSmall { .. } => ErrorKind::InvalidArgument,
            Error::AlreadyInitialized(_) => ErrorKind::AlreadyInitialized,
            Error::NotInitialized => ErrorKind::NotInitialized,
            Error::BatchFull { .. } | Error::ScratchExhausted { .. } | Error::Exhausted(_) => {
                ErrorKind::ResourceExhausted
            }
            Error::NotFound => ErrorKind::NotFound,
            Error::Conflict => ErrorKind::Conflict,
            Error::RetryExhausted { .. } => ErrorKind::Transient,
            Error::Engine(_) => ErrorKind::Fatal,
        }
    }

    /// Negative POSIX-style error code.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::BufferTooSmall { .. } => -libc::EINVAL,
            Error::AlreadyInitialized(_) => -libc::EALREADY,
            Error::NotInitialized => -libc::EINVAL,
            Error::BatchFull { .. } => -libc::ENOMEM,
            Error::ScratchExhausted { .. } => -libc::ENOBUFS,
            Error::NotFound => -libc::ENOENT,
            Error::Conflict => -libc::EEXIST,
            Error::RetryExhausted { .. } => -libc::EIO,
            Error::Exhausted(status) | Error::Engine(status) => policy::errno_for(*status),
        }
    }
}

impl From<MdbError> for Error {
    fn from(status: MdbError) -> Error {
        match status {
            MdbError::NotFound => Error::NotFound,
            MdbError::KeyExist => Error::Conflict,
            MdbError::MapFull
            | MdbError::DbsFull
            | MdbError::ReadersFull
            | MdbError::TxnFull
            | MdbError::CursorFull
            | MdbError::PageFull => Error::Exhausted(status),
            status => Error::Engine(status),
        }
    }
}
