//! An implementation of the `Error` type.

use thiserror::Error;

use std::fmt;

use crate::schema::Version;

/// What kind of object a [`Error::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    /// An entity (record type) missing from the schema.
    Entity,
    /// An index missing from the manager or the schema.
    Index,
    /// A record missing from the store.
    Record,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity => f.write_str("entity"),
            Self::Index => f.write_str("index"),
            Self::Record => f.write_str("record"),
        }
    }
}

/// The error type for operations with the record store.
///
/// Transient backend errors ([`Error::Backend`] values for which
/// [`is_retriable`](Error::is_retriable) returns `true`) are retried
/// internally by the transaction retry loop; every other variant is surfaced
/// to the caller. [`Context::save`](crate::Context::save) restores its
/// staging area on any returned error, so the caller may safely retry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller supplied an ill-formed descriptor, path, id or argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An entity, index or record is missing where one is required.
    #[error("{kind} `{name}` not found")]
    NotFound {
        /// Kind of the missing object.
        kind: NotFoundKind,
        /// Name (or rendered id) of the missing object.
        name: String,
    },

    /// An illegal index state transition was attempted.
    #[error("index `{index}`: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Index whose state was being changed.
        index: String,
        /// State observed inside the transaction.
        from: crate::indexes::IndexState,
        /// Requested target state.
        to: crate::indexes::IndexState,
    },

    /// An index with the same name is already registered.
    #[error("index `{0}` is already registered")]
    DuplicateIndex(String),

    /// A unique index rejected a value already claimed by another record.
    #[error("unique index `{index}` already contains an entry for this value")]
    UniqueConstraint {
        /// The violated index.
        index: String,
    },

    /// The migration was given an empty list of schemas.
    #[error("migration requires at least one schema")]
    EmptySchemaList,

    /// Two schemas in the migration chain carry the same version.
    #[error("duplicate schema version {0}")]
    DuplicateVersion(Version),

    /// Schema versions in the migration chain are not strictly ascending.
    #[error("schema versions are not in ascending order")]
    VersionsNotOrdered,

    /// The number of stages does not match the number of schema links.
    #[error("expected {expected} migration stages, got {actual}")]
    StageCountMismatch {
        /// `schemas.len() - 1`.
        expected: usize,
        /// Number of stages supplied.
        actual: usize,
    },

    /// A stage's `from`/`to` versions do not match the adjacent schemas.
    #[error("stage {from} -> {to} does not match the adjacent schema versions")]
    StageMismatch {
        /// The stage's source version.
        from: Version,
        /// The stage's target version.
        to: Version,
    },

    /// No chain of stages connects the current version to the target.
    #[error("no migration path from {from} to {to}")]
    NoMigrationPath {
        /// Version currently stored in the database.
        from: Version,
        /// Requested target version.
        to: Version,
    },

    /// The requested target version precedes the stored version.
    #[error("downgrade from {current} to {target} is not supported")]
    DowngradeNotSupported {
        /// Version currently stored in the database.
        current: Version,
        /// Requested target version.
        target: Version,
    },

    /// Migration path resolution did not terminate.
    #[error("migration path starting at {0} does not terminate")]
    CyclicMigrationPath(Version),

    /// The record codec failed to encode or decode a payload.
    #[error("serialization failure: {0}")]
    Serialization(#[source] anyhow::Error),

    /// A retriable conflict was retried up to the budget and still failed.
    #[error("transaction conflict persisted after {attempts} attempts")]
    TransactionConflict {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// An error reported by the backing key-value store.
    ///
    /// `code` follows the FoundationDB error-code space; the retry loop uses
    /// it to separate transient conflicts from hard failures.
    #[error("backend error {code}: {message}")]
    Backend {
        /// Backend error code.
        code: i32,
        /// Human-readable backend message.
        message: String,
    },

    /// A broken internal invariant, e.g. a malformed persisted version tuple
    /// or an index name claimed by several entities.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Backend code for a read-write conflict (`not_committed`).
pub(crate) const CODE_NOT_COMMITTED: i32 = 1020;
/// Backend code for a commit whose outcome is unknown.
pub(crate) const CODE_COMMIT_UNKNOWN_RESULT: i32 = 1021;
/// Backend code for a transaction that outlived its read version.
pub(crate) const CODE_TRANSACTION_TOO_OLD: i32 = 1007;

impl Error {
    /// Returns `true` if the operation may succeed when run again in a fresh
    /// transaction. The transaction retry loop keys off this classification.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Backend {
                code: CODE_NOT_COMMITTED | CODE_COMMIT_UNKNOWN_RESULT | CODE_TRANSACTION_TOO_OLD,
                ..
            }
        )
    }

    /// Shorthand for a [`Error::NotFound`] about an index.
    pub(crate) fn index_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: NotFoundKind::Index,
            name: name.into(),
        }
    }

    /// Shorthand for a [`Error::NotFound`] about an entity.
    pub(crate) fn entity_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: NotFoundKind::Entity,
            name: name.into(),
        }
    }
}
