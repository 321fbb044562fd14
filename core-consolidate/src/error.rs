use bridge_traits::error::BridgeError;
use core_library::LibraryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsolidateError {
    #[error(transparent)]
    Store(#[from] LibraryError),

    /// Raised by the transfer collaborator, passed through unchanged.
    #[error(transparent)]
    Transfer(BridgeError),

    #[error("Filesystem error at {path}: {source}")]
    FileSystem {
        path: String,
        #[source]
        source: BridgeError,
    },

    #[error("Source file missing: {0}")]
    SourceMissing(String),

    #[error("Destination {path} failed verification: {reason}")]
    Verification { path: String, reason: String },

    #[error("Conflict {0} has no open locations")]
    NoOpenLocations(i64),

    #[error("Conflict {0} is already resolved")]
    AlreadyResolved(i64),
}

impl ConsolidateError {
    pub(crate) fn fs(path: &std::path::Path, source: BridgeError) -> Self {
        ConsolidateError::FileSystem {
            path: path.display().to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConsolidateError>;
