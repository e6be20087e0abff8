//! Error types for the Haven messaging core.
//!
//! Every fallible operation in the crate returns [`HavenResult`]. Crypto
//! failures carry a human-readable cause; storage errors convert from the
//! underlying redb error types.

use thiserror::Error;

/// Main error type for messaging operations.
#[derive(Error, Debug)]
pub enum HavenError {
    /// Sealing a payload failed (key wrap or AEAD encryption).
    #[error("Encryption failed: {0}")]
    EncryptionFailure(String),

    /// Opening an envelope failed. Covers missing wrapped keys, key-unwrap
    /// mismatches and AEAD tag verification failures. No partial plaintext
    /// is ever returned alongside this error.
    #[error("Decryption failed: {0}")]
    DecryptionFailure(String),

    /// Producing a detached signature failed.
    #[error("Signing failed: {0}")]
    SigningFailure(String),

    /// A signature did not verify. Verification APIs return `bool` at the
    /// public boundary; this variant exists for internal plumbing that
    /// needs to carry the cause.
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// The external log store rejected or failed a publish/fetch.
    #[error("Log store unavailable: {0}")]
    LogStoreUnavailable(String),

    /// An invite ticket failed to decode, verify or was expired.
    #[error("Invalid invite: {0}")]
    InvalidInvite(String),

    /// Identity key material could not be loaded, decoded or generated.
    #[error("Identity error: {0}")]
    Identity(String),

    /// The operation is not valid in the current state, e.g. sending
    /// before an identity exists or to an unregistered channel.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Encoding or decoding a snapshot, bundle or ticket failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database error from redb.
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error from redb.
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error from redb.
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage error from redb.
    #[error("Storage error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error from redb.
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for messaging operations.
pub type HavenResult<T> = Result<T, HavenError>;
