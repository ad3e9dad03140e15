//! Error kinds for the chain-state persistence layer.

use thiserror::Error;

/// The error kinds a chain-state operation can fail with.
///
/// `NotFound` is deliberately absent: a missing record for a point lookup is
/// the normal case and is represented as `Option::None` at call sites, not
/// as an error variant.
#[derive(Error, Debug)]
pub enum Error {
    /// a record failed to deserialize or failed an integrity check on load
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// the underlying key-value store reported an I/O failure
    #[error("key-value store I/O error: {0}")]
    Io(#[from] rocksdb::Error),

    /// a long-running pass was aborted by a shutdown request
    #[error("operation interrupted by shutdown request")]
    Interrupted,

    /// a caller violated a documented precondition (e.g. a null tip hash on
    /// `BatchWrite`); this always indicates a bug in the caller, not a
    /// recoverable runtime condition
    #[error("invariant violated: {0}")]
    Invariant(&'static str),

    /// legacy per-transaction coin records are present and must be migrated
    /// with `coin_view::upgrade` before normal operation can proceed
    #[error("legacy coin records present; run the upgrade pass first")]
    UpgradeRequired,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<chain_types::SerializationError> for Error {
    fn from(e: chain_types::SerializationError) -> Self {
        Error::Corrupt(e.to_string())
    }
}
