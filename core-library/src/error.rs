use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LibraryError {
    /// Store I/O failure. The surrounding transaction was rolled back.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    /// Two sources of equal priority claim different paths for one asset.
    #[error(
        "Ambiguous claim for {key}: {stored_source} has {stored_path}, {claimed_source} claims {claimed_path}"
    )]
    ConflictAmbiguous {
        key: String,
        stored_source: String,
        stored_path: String,
        claimed_source: String,
        claimed_path: String,
    },

    #[error("Insufficient space: need {required} bytes, best root has {available}")]
    InsufficientSpace { required: u64, available: u64 },
}

impl LibraryError {
    pub(crate) fn not_found(entity_type: &str, id: impl ToString) -> Self {
        LibraryError::NotFound {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        LibraryError::InvalidInput {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LibraryError>;
