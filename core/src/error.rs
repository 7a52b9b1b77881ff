use std::path::PathBuf;
use thiserror::Error;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache is full")]
    CacheFull,

    #[error("Load failure: {0}")]
    LoadFailure(String),

    #[error("Bad XID file: {0}")]
    BadXidFile(String),

    #[error("File already exists: {}", .0.display())]
    FileExists(PathBuf),

    #[error("File does not exist: {}", .0.display())]
    FileNotExists(PathBuf),

    #[error("File cannot be read or written: {}", .0.display())]
    FileCannotReadWrite(PathBuf),

    #[error("Insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes { expected: usize, actual: usize },

    #[error("Invalid xid: {0}")]
    InvalidXid(u64),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DbError {
    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::Io(_) => "io_error",
            DbError::CacheFull => "cache_full",
            DbError::LoadFailure(_) => "load_failure",
            DbError::BadXidFile(_) => "bad_xid_file",
            DbError::FileExists(_) => "file_exists",
            DbError::FileNotExists(_) => "file_not_exists",
            DbError::FileCannotReadWrite(_) => "file_cannot_read_write",
            DbError::InsufficientBytes { .. } => "insufficient_bytes",
            DbError::InvalidXid(_) => "invalid_xid",
            DbError::Transaction(_) => "transaction_error",
            DbError::InvalidOperation(_) => "invalid_operation",
            DbError::Config(_) => "config_error",
        }
    }

    /// Whether the error leaves the journal in a state that must not be used further.
    ///
    /// Fatal errors have no recovery path: the caller is expected to abort the
    /// operation (or the process) rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DbError::Io(_)
                | DbError::BadXidFile(_)
                | DbError::FileExists(_)
                | DbError::FileNotExists(_)
                | DbError::FileCannotReadWrite(_)
        )
    }

    /// Whether the caller may retry later without any cleanup.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DbError::CacheFull | DbError::LoadFailure(_))
    }
}
