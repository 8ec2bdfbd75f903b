use crate::txid::TxnId;
use crate::version::Key;

/// The failure classes of store operations, for sentinel-style matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A visible or same-transaction live record already exists.
    RecordExists,
    /// No record is visible under this transaction's snapshot.
    RecordDoesNotExist,
    /// A concurrent or later committed writer precludes the operation under
    /// snapshot semantics.
    TransactionInConflict,
    /// The cancellation token fired before a shard lock was acquired.
    Cancelled,
    /// A pending head carried an impossible stamp combination; indicates a
    /// bug or memory corruption.
    CorruptedPendingVersion,
    /// A store construction option failed validation.
    InvalidOption,
}

/// An error from the store or one of its transactions.
///
/// Every operational variant carries the key that triggered it, so errors
/// compare equal only for the same kind and key; [`Error::kind`] supports
/// matching on the kind alone.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Insert found a record that is visible under the snapshot or still
    /// live in this same transaction.
    #[error("record with key \"{}\" already exists", .key.escape_ascii())]
    RecordExists {
        /// The key being inserted.
        key: Key,
    },

    /// No record for the key is visible under the snapshot.
    #[error("record with key \"{}\" does not exist", .key.escape_ascii())]
    RecordDoesNotExist {
        /// The key being addressed.
        key: Key,
    },

    /// Another transaction's pending or later-committed version precludes
    /// the operation.
    #[error("transaction in conflict over record with key \"{}\"", .key.escape_ascii())]
    TransactionInConflict {
        /// The contended key.
        key: Key,
    },

    /// The caller's cancellation token fired while waiting for a shard
    /// lock; no state was changed.
    #[error("cancelled while waiting for the shard holding key \"{}\"", .key.escape_ascii())]
    Cancelled {
        /// The key being addressed.
        key: Key,
    },

    /// A pending head carried a validity horizon it could not legally have.
    #[error(
        "transaction {txn} found pending version for key \"{}\" with unexpected validity horizon ending at {horizon}",
        .key.escape_ascii()
    )]
    CorruptedPendingVersion {
        /// The key whose chain is suspect.
        key: Key,
        /// The transaction that observed the state.
        txn: TxnId,
        /// The horizon the pending version carried.
        horizon: TxnId,
    },

    /// A store construction option failed validation.
    #[error("invalid store option: {reason}")]
    InvalidOption {
        /// What was wrong with the option.
        reason: String,
    },
}

impl Error {
    /// The failure class, for sentinel-style matching.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RecordExists { .. } => ErrorKind::RecordExists,
            Error::RecordDoesNotExist { .. } => ErrorKind::RecordDoesNotExist,
            Error::TransactionInConflict { .. } => ErrorKind::TransactionInConflict,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::CorruptedPendingVersion { .. } => ErrorKind::CorruptedPendingVersion,
            Error::InvalidOption { .. } => ErrorKind::InvalidOption,
        }
    }

    /// The key the failing operation was addressing, when there is one.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Error::RecordExists { key }
            | Error::RecordDoesNotExist { key }
            | Error::TransactionInConflict { key }
            | Error::Cancelled { key }
            | Error::CorruptedPendingVersion { key, .. } => Some(key),
            Error::InvalidOption { .. } => None,
        }
    }

    pub(crate) fn record_exists(key: &[u8]) -> Self {
        Error::RecordExists { key: key.into() }
    }

    pub(crate) fn record_does_not_exist(key: &[u8]) -> Self {
        Error::RecordDoesNotExist { key: key.into() }
    }

    pub(crate) fn transaction_in_conflict(key: &[u8]) -> Self {
        Error::TransactionInConflict { key: key.into() }
    }

    pub(crate) fn cancelled(key: &[u8]) -> Self {
        Error::Cancelled { key: key.into() }
    }

    pub(crate) fn corrupted_pending_version(key: &[u8], txn: TxnId, horizon: TxnId) -> Self {
        Error::CorruptedPendingVersion {
            key: key.into(),
            txn,
            horizon,
        }
    }

    pub(crate) fn invalid_option(reason: impl Into<String>) -> Self {
        Error::InvalidOption {
            reason: reason.into(),
        }
    }
}
