//! Error types for the Sonarr/Radarr provider

use bridge_traits::error::BridgeError;
use thiserror::Error;

/// Sonarr/Radarr provider errors
#[derive(Error, Debug)]
pub enum ArrError {
    /// API key rejected
    #[error("Authentication failed for {manager}: status {status_code}")]
    AuthenticationFailed { manager: String, status_code: u16 },

    /// API request returned an error
    #[error("{manager} API error (status {status_code}): {message}")]
    ApiError {
        manager: String,
        status_code: u16,
        message: String,
    },

    /// Resource does not exist on the manager
    #[error("{manager} has no {resource} with id {id}")]
    NotFound {
        manager: String,
        resource: String,
        id: String,
    },

    /// Failed to parse API response
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Bridge error
    #[error(transparent)]
    BridgeError(#[from] BridgeError),
}

/// Result type for Sonarr/Radarr operations
pub type Result<T> = std::result::Result<T, ArrError>;

impl From<ArrError> for BridgeError {
    fn from(error: ArrError) -> Self {
        match error {
            ArrError::NotFound { .. } => BridgeError::NotFound(error.to_string()),
            ArrError::AuthenticationFailed { .. } => BridgeError::NotAvailable(error.to_string()),
            ArrError::ApiError { .. } | ArrError::ParseError(_) => {
                BridgeError::OperationFailed(error.to_string())
            }
            ArrError::BridgeError(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ArrError::ApiError {
            manager: "sonarr".to_string(),
            status_code: 400,
            message: "Path is invalid".to_string(),
        };

        assert_eq!(
            error.to_string(),
            "sonarr API error (status 400): Path is invalid"
        );
    }

    #[test]
    fn test_error_conversion() {
        let not_found: BridgeError = ArrError::NotFound {
            manager: "radarr".to_string(),
            resource: "movie".to_string(),
            id: "9".to_string(),
        }
        .into();
        assert!(matches!(not_found, BridgeError::NotFound(_)));

        let api: BridgeError = ArrError::ParseError("bad json".to_string()).into();
        assert!(matches!(api, BridgeError::OperationFailed(_)));
    }
}
