//! Error types for the bank

use crate::types::{Amount, UserId};
use thiserror::Error;

/// Result type for bank operations
pub type Result<T> = std::result::Result<T, Error>;

/// Bank errors
#[derive(Error, Debug)]
pub enum Error {
    /// The change would drive a balance below zero. Nothing was written.
    #[error("you aint got that kind of scratch, kid (user {user} has {balance}, needs {requested})")]
    InsufficientFunds {
        /// User whose balance was too low
        user: UserId,
        /// Balance observed inside the transaction
        balance: Amount,
        /// Amount the operation tried to take
        requested: Amount,
    },

    /// A positive amount was required
    #[error("Invalid amount: {0}")]
    InvalidAmount(Amount),

    /// Balance arithmetic left the i64 range
    #[error("Balance overflow for user {0}")]
    Overflow(UserId),

    /// Storage error (RocksDB)
    #[error("Storage unavailable during {context}: {source}")]
    StorageUnavailable {
        /// Operation and arguments that failed
        context: String,
        /// Underlying RocksDB error
        #[source]
        source: rocksdb::Error,
    },

    /// JSON serialization error (export records)
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary serialization error (bookkeeping records)
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Export consumption was canceled by the caller
    #[error("Export consumption canceled")]
    Canceled,

    /// Concurrency error (output channel closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if the error is due to an account not having enough
    /// funds to perform some action.
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, Error::InsufficientFunds { .. })
    }

    /// Returns true if re-running the operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StorageUnavailable { .. }
                | Error::Concurrency(_)
                | Error::Json(_)
                | Error::Serialization(_)
                | Error::Io(_)
        )
    }

    /// Returns true for lock contention errors which a transaction can retry.
    pub(crate) fn is_lock_contention(&self) -> bool {
        match self {
            Error::StorageUnavailable { source, .. } => matches!(
                source.kind(),
                rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TimedOut | rocksdb::ErrorKind::TryAgain
            ),
            _ => false,
        }
    }

    /// Replace the context of a storage error, leaving other errors untouched.
    pub(crate) fn with_context(self, context: impl FnOnce() -> String) -> Self {
        match self {
            Error::StorageUnavailable { source, .. } => Error::StorageUnavailable {
                context: context(),
                source,
            },
            other => other,
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(source: rocksdb::Error) -> Self {
        Error::StorageUnavailable {
            context: "rocksdb".to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_funds_is_terminal() {
        let err = Error::InsufficientFunds {
            user: UserId::new("alice"),
            balance: 7,
            requested: 100,
        };
        assert!(err.is_insufficient_funds());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("alice"));
    }

    #[test]
    fn test_invalid_amount_is_not_retryable() {
        let err = Error::InvalidAmount(-3);
        assert!(!err.is_insufficient_funds());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_canceled_is_distinct() {
        assert!(matches!(Error::Canceled, Error::Canceled));
        assert!(!Error::Canceled.is_retryable());
        assert!(Error::Concurrency("closed".into()).is_retryable());
    }
}
