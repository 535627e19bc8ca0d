//! Error types for the relay core.
//!
//! ```text
//! RelayError
//! ├── Admission (caller-visible, fix the input and retry)
//! │   ├── InvalidRecipient   - sender and receiver are the same principal
//! │   ├── ContentInvalid     - empty after trimming, or over the length limit
//! │   └── RecipientNotFound  - receiver does not resolve to a principal
//! ├── Session
//! │   ├── NotAuthenticated   - frame arrived on an unbound connection
//! │   └── AuthError          - credential rejected by the identity provider
//! └── Internal
//!     ├── Storage            - message store failure
//!     └── Internal           - anything else (task join failures, ...)
//! ```
//!
//! Notification dispatch has its own [`crate::notify::NotifyError`]; those
//! failures are logged by the router and never converted into a `RelayError`.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for the relay core.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A principal tried to message itself.
    #[error("Cannot send a message to yourself")]
    InvalidRecipient,

    /// Content was empty after trimming or longer than the configured maximum.
    #[error("Invalid message content: {0}")]
    ContentInvalid(String),

    /// The receiver id does not belong to any known principal.
    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),

    /// The connection has not authenticated (or was superseded).
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The identity provider rejected the credential.
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// The message store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Stable machine-readable code carried in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidRecipient => "invalid_recipient",
            RelayError::ContentInvalid(_) => "content_invalid",
            RelayError::RecipientNotFound(_) => "recipient_not_found",
            RelayError::NotAuthenticated => "not_authenticated",
            RelayError::AuthError(_) => "auth_error",
            RelayError::Storage(_) | RelayError::Internal(_) => "internal",
        }
    }

    /// Message safe to show to a client. Internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Storage(_) | RelayError::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        RelayError::Storage(e.to_string())
    }
}

impl From<tokio::task::JoinError> for RelayError {
    fn from(e: tokio::task::JoinError) -> Self {
        RelayError::Internal(format!("Blocking task failed: {}", e))
    }
}
