//! # Error Handling for revstore
//!
//! A single crate-wide error enum covers every failure mode the store can
//! surface. The variants are the stable taxonomy consumed by the REST layer;
//! nothing inside the store retries, all errors propagate to the caller
//! unchanged.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical response |
//! |----------|----------|------------------|
//! | Caller state stale | `Conflict`, `CompactionExpired` | re-read and retry |
//! | Caller input wrong | `NotFound`, `AlreadyExists`, `UidMismatch`, `InvalidArgument` | fix the request |
//! | Internal | `Sqlite`, `Encoding`, `Internal` | log and investigate |

use thiserror::Error;

/// Message attached to optimistic-concurrency conflicts.
pub const OPTIMISTIC_LOCK_MESSAGE: &str =
    "the object has been modified; please apply your changes to the latest version and try again";

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in revstore operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No live row exists for the requested `(namespace, name)`.
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Object kind the store holds.
        kind: String,
        /// Name that was requested.
        name: String,
    },

    /// A creation raced with an existing live object of the same name.
    ///
    /// Raised when the `(name, namespace, created)` uniqueness constraint
    /// rejects a creation row.
    #[error("{kind} {name:?} already exists")]
    AlreadyExists {
        /// Object kind the store holds.
        kind: String,
        /// Name that was submitted.
        name: String,
    },

    /// Optimistic concurrency failure.
    ///
    /// Either the submitted resource version no longer names the latest
    /// row, or a concurrent writer claimed the `previous_id` slot first.
    /// Re-read the object and re-apply the change.
    #[error("conflict on {kind} {name:?}: {message}")]
    Conflict {
        /// Object kind the store holds.
        kind: String,
        /// Name that was submitted.
        name: String,
        /// Human-readable cause.
        message: String,
    },

    /// Update carried a uid that does not match the stored object.
    #[error("uid mismatch on {name:?}: stored {stored:?}, submitted {submitted:?}")]
    UidMismatch {
        /// Name that was submitted.
        name: String,
        /// Uid of the stored object.
        stored: String,
        /// Uid carried by the update.
        submitted: String,
    },

    /// The requested revision has been pruned by compaction.
    #[error("resource version {requested} is older than the compaction watermark {compacted}")]
    CompactionExpired {
        /// Revision the caller asked for.
        requested: i64,
        /// Current compaction watermark.
        compacted: i64,
    },

    /// An option or argument the store does not support.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// SQLite operation failed for a reason the store does not classify.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Object (de)serialization failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Anything else: closed store, migration timeout, joined-task failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn not_found(kind: &str, name: &str) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn already_exists(kind: &str, name: &str) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    /// Conflict raised when the submitted resource version is stale.
    pub(crate) fn resource_version_mismatch(kind: &str, name: &str) -> Self {
        Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
            message: OPTIMISTIC_LOCK_MESSAGE.to_string(),
        }
    }

    /// Conflict raised when a concurrent update claimed the previous id first.
    pub(crate) fn lost_update_race(kind: &str, name: &str) -> Self {
        Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
            message: "a concurrent update won the race for this revision".to_string(),
        }
    }

    /// The record layer has been shut down.
    pub(crate) fn closed() -> Self {
        Error::Internal("store has been destroyed".to_string())
    }

    /// True if this is a [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True if this is a [`Error::AlreadyExists`].
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// True if this is a [`Error::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// True if this is a [`Error::CompactionExpired`].
    pub fn is_compaction_expired(&self) -> bool {
        matches!(self, Error::CompactionExpired { .. })
    }

    /// True if this is a [`Error::InvalidArgument`].
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }
}

// =============================================================================
// Dialect Error Translation
// =============================================================================

/// Translates a unique-constraint violation from the insert statement into
/// the store taxonomy.
///
/// The log table carries two uniqueness constraints and each one encodes a
/// different race:
///
/// - `(name, namespace, created)`: two creation rows for one live name,
///   so the object [`already exists`](Error::AlreadyExists);
/// - `previous_id`: two updates chained off the same revision, so the
///   caller [`lost the race`](Error::Conflict).
///
/// Any other error passes through as [`Error::Sqlite`].
pub(crate) fn translate_insert_error(err: rusqlite::Error, kind: &str, name: &str) -> Error {
    if let rusqlite::Error::SqliteFailure(code, Some(message)) = &err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation
            && message.contains("UNIQUE constraint failed")
        {
            if message.contains(".previous_id") {
                return Error::lost_update_race(kind, name);
            }
            return Error::already_exists(kind, name);
        }
    }
    Error::Sqlite(err)
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let not_found = Error::not_found("TestKind", "testname1");
        assert_eq!(not_found.to_string(), "TestKind \"testname1\" not found");

        let conflict = Error::resource_version_mismatch("TestKind", "testname1");
        assert!(conflict.to_string().contains("conflict on TestKind"));
        assert!(conflict.to_string().contains(OPTIMISTIC_LOCK_MESSAGE));

        let expired = Error::CompactionExpired {
            requested: 2,
            compacted: 3,
        };
        assert_eq!(
            expired.to_string(),
            "resource version 2 is older than the compaction watermark 3"
        );
    }

    #[test]
    fn test_classification_helpers() {
        assert!(Error::not_found("k", "n").is_not_found());
        assert!(Error::already_exists("k", "n").is_already_exists());
        assert!(Error::resource_version_mismatch("k", "n").is_conflict());
        assert!(Error::lost_update_race("k", "n").is_conflict());
        assert!(Error::CompactionExpired {
            requested: 1,
            compacted: 2
        }
        .is_compaction_expired());
        assert!(Error::InvalidArgument("nope".into()).is_invalid_argument());
        assert!(!Error::closed().is_conflict());
    }

    fn unique_violation(message: &str) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE),
            Some(message.to_string()),
        )
    }

    #[test]
    fn test_translate_previous_id_violation_to_conflict() {
        let err = translate_insert_error(
            unique_violation("UNIQUE constraint failed: widgets.previous_id"),
            "Widget",
            "w1",
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn test_translate_created_violation_to_already_exists() {
        let err = translate_insert_error(
            unique_violation(
                "UNIQUE constraint failed: widgets.name, widgets.namespace, widgets.created",
            ),
            "Widget",
            "w1",
        );
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_translate_passes_through_other_errors() {
        let err = translate_insert_error(
            rusqlite::Error::InvalidParameterName("x".to_string()),
            "Widget",
            "w1",
        );
        assert!(matches!(err, Error::Sqlite(_)));
    }
}
