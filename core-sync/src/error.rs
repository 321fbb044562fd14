use core_library::LibraryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] LibraryError),

    #[error("{manager} API error: {message}")]
    ExternalApi { manager: String, message: String },

    #[error("No {0} client configured")]
    ManagerNotConfigured(String),

    #[error("Reconciliation engine already started")]
    AlreadyStarted,

    #[error("Reconciliation engine is shut down")]
    Cancelled,

    #[error("Sync run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Invalid sync run ID: {0}")]
    InvalidRunId(String),

    #[error("Invalid sync status: {0}")]
    InvalidStatus(String),

    #[error("Invalid sync trigger: {0}")]
    InvalidTrigger(String),

    #[error("Invalid resolution '{choice}': {reason}")]
    InvalidChoice { choice: String, reason: String },

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(String),
}

impl SyncError {
    pub(crate) fn external(manager: impl ToString, err: impl ToString) -> Self {
        SyncError::ExternalApi {
            manager: manager.to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
