//! Core error types.

use thiserror::Error;

/// Convenience alias used throughout the read path.
pub type Result<T> = std::result::Result<T, Error>;

/// Read-path errors.
///
/// Buffer capacity is never reported through this type: a query whose output
/// buffers fill up returns [`crate::QueryStatus::Incomplete`] instead.
#[derive(Debug, Error)]
pub enum Error {
    /// A tile, tile-offsets window or copy batch cannot fit the configured
    /// memory budget. Retrying without reconfiguration cannot succeed.
    #[error("memory budget exceeded: {0}")]
    MemoryBudget(String),

    /// The tile source failed to produce a tile.
    #[error("tile i/o error (fragment {fragment}, tile {tile}, field {field}): {message}")]
    Io {
        fragment: usize,
        tile: u64,
        field: String,
        message: String,
    },

    /// Query condition evaluation failed.
    #[error("condition error: {0}")]
    Condition(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// The requested combination of features is not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An output buffer was configured incorrectly.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// Field name is neither a dimension, an attribute nor a special field.
    #[error("unknown field: {0}")]
    UnknownField(String),

    /// Invalid reader configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The query was cancelled between processing rounds.
    #[error("query cancelled")]
    Cancelled,

    /// The query hit a fatal error on an earlier submit.
    #[error("query previously failed: {0}")]
    QueryFailed(String),
}

impl Error {
    /// Whether this error leaves the query unusable.
    ///
    /// Everything except cancellation is sticky.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Cancelled)
    }

    pub(crate) fn io(fragment: usize, tile: u64, field: &str, message: impl Into<String>) -> Self {
        Error::Io {
            fragment,
            tile,
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for Error {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        Error::Config(format!("cannot build worker pool: {err}"))
    }
}
