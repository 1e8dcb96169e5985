//! Error taxonomy for the database engine.
//!
//! Errors split into two families. Fatal errors (I/O, corrupt data, failed
//! allocations or mappings, violated invariants) poison the database
//! instance that raised them and the caller should drop it. Recoverable
//! errors (wrong mode, bad argument, undecodable image) leave the instance
//! usable; the call may be retried after correcting the problem.

use crate::ImageId;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, DbError>;

/// All errors raised by the engine.
#[derive(Debug, Error)]
pub enum DbError {
    /// Low-level file or mapping failure while reading or writing the
    /// database, the signature cache, or the bucket scratch file. Fatal.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The database file is internally inconsistent, has an unsupported
    /// version, or was written with a different byte order. Fatal.
    #[error("bad database data: {0}")]
    Data(String),

    /// An allocation or memory mapping for a required region failed. Fatal.
    #[error("memory error: {0}")]
    Memory(String),

    /// An engine invariant failed; indicates a bug in the library. Fatal.
    #[error("internal error: {0}")]
    Internal(String),

    /// The operation is not available in the database's current mode.
    #[error("not supported in {mode} mode: {what}")]
    Usage {
        mode: &'static str,
        what: &'static str,
    },

    /// An argument was invalid.
    #[error("invalid argument: {0}")]
    Param(String),

    /// The image id is already present in the database.
    #[error("image {0:08x} already in database")]
    DuplicateId(ImageId),

    /// The image id was not found in the database.
    #[error("image {0:08x} not found")]
    InvalidId(ImageId),

    /// The input bytes could not be decoded as a supported image.
    #[error("cannot read image: {0}")]
    Image(String),
}

impl DbError {
    /// Fatal errors poison the instance that raised them; the caller
    /// should discard it and, for a command server, report the failure
    /// and drop the handle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DbError::Io(_) | DbError::Data(_) | DbError::Memory(_) | DbError::Internal(_)
        )
    }

    /// Stable kind name for each error, used by the command server's
    /// numeric status lines.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::Io(_) => "io_error",
            DbError::Data(_) => "data_error",
            DbError::Memory(_) => "memory_error",
            DbError::Internal(_) => "internal_error",
            DbError::Usage { .. } => "usage_error",
            DbError::Param(_) => "param_error",
            DbError::DuplicateId(_) => "duplicate_id",
            DbError::InvalidId(_) => "invalid_id",
            DbError::Image(_) => "image_error",
        }
    }

    pub(crate) fn data(msg: impl Into<String>) -> Self {
        DbError::Data(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        DbError::Internal(msg.into())
    }

    pub(crate) fn param(msg: impl Into<String>) -> Self {
        DbError::Param(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(DbError::data("truncated header").is_fatal());
        assert!(DbError::internal("bucket count mismatch").is_fatal());
        assert!(!DbError::InvalidId(7).is_fatal());
        assert!(!DbError::Usage {
            mode: "simple",
            what: "save"
        }
        .is_fatal());
        assert!(!DbError::Image("not a png".into()).is_fatal());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(DbError::DuplicateId(1).kind(), "duplicate_id");
        assert_eq!(DbError::param("bad mode").kind(), "param_error");
        assert_eq!(
            DbError::Io(std::io::Error::other("boom")).kind(),
            "io_error"
        );
    }
}
