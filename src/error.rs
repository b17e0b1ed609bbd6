//! Crate-wide error taxonomy.
//!
//! Transport problems are absorbed where they happen (logged, membership
//! reverts to `Left`); request/response problems propagate to the caller as
//! rejected operations. Nothing here is fatal to the process.

use thiserror::Error;

/// Every failure the sync engine can report.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No auth credential is set, so no session or request is possible.
    #[error("not signed in: no credential available")]
    NoCredential,

    /// A join/leave/emit or connect against the transport failed.
    #[error("transport error on '{event}': {detail}")]
    Transport { event: String, detail: String },

    /// The GraphQL API answered with an `errors` list; carries the first message.
    #[error("{message}")]
    Mutation { message: String },

    /// The API server replied with a non-2xx HTTP status code.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// A TCP-level connection to the API could not be established.
    #[error("connection failed to {url}: {detail}")]
    Connect { url: String, detail: String },

    /// A body could not be decoded into the expected JSON structure.
    #[error("JSON parse error on field '{field}': {detail}")]
    Json { field: String, detail: String },

    /// A response arrived for a lead that is no longer the active one.
    #[error("stale response for lead '{received}' while '{expected}' is active")]
    StaleResponse { expected: String, received: String },

    /// An inbound payload broke the room protocol contract.
    #[error("protocol violation: {detail}")]
    Protocol { detail: String },

    /// Caller input rejected before any request was made.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded or failed validation.
    #[error("config error: {0}")]
    Config(String),
}

impl SyncError {
    pub(crate) fn transport(event: impl Into<String>, detail: impl ToString) -> Self {
        SyncError::Transport {
            event: event.into(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        SyncError::Protocol {
            detail: detail.into(),
        }
    }

    /// True for failures that come back from the request/response path and
    /// should be shown to the user.
    pub fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            SyncError::StaleResponse { .. } | SyncError::Protocol { .. }
        )
    }
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, SyncError>;
