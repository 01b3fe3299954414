//! Typed error hierarchy for leadboard.
//!
//! Two top-level enums cover the two sides of the wire:
//! - `CrmError` — server-side store, auth, and assistant failures
//! - `ClientError` — failures seen by the HTTP client

use thiserror::Error;

use leadboard_common::ParseLabelError;

/// Errors from the CRM server subsystem.
#[derive(Debug, Error)]
pub enum CrmError {
    #[error("Lead not found")]
    LeadNotFound { id: i64 },

    #[error("Conversation not found")]
    ConversationNotFound { id: i64 },

    #[error("Task not found")]
    TaskNotFound { id: String },

    #[error("User not found")]
    UserNotFound { id: i64 },

    #[error("A user with email {email} already exists")]
    DuplicateUser { email: String },

    #[error(transparent)]
    InvalidLabel(#[from] ParseLabelError),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Chat queue is not accepting work")]
    QueueClosed,

    #[error("Assistant model error: {0}")]
    Model(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors seen by `CrmClient`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("A chat message is already being processed")]
    Busy,

    #[error("Message is required")]
    EmptyMessage,
}

impl ClientError {
    /// True for errors where the server answered with 401.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Status { status: 401, .. })
    }
}
