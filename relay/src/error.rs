//! Error taxonomy shared by the receiver, the sender and their collaborators.

use thiserror::Error;

/// Failures that can occur while relaying a claim.
///
/// The receiver turns every variant into a fixed result string. The sender
/// propagates `Config`, `Auth`, `UpsertRejected`, `Transport` and
/// `MalformedDelivery` so the queue redelivers the message, and only
/// swallows failures of the final delete.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Inbound event is not JSON or lacks a usable `body` / `number`.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Collaborator settings could not be read or are malformed.
    #[error("config error: {0}")]
    Config(String),

    /// Network or broker failure while talking to a collaborator.
    #[error("transport error: {0}")]
    Transport(String),

    /// The CRM refused to issue an access token.
    #[error("token exchange rejected: {0}")]
    Auth(String),

    /// The CRM answered the upsert without `success: true`.
    #[error("upsert rejected for claim {claim_number}: {reason}")]
    UpsertRejected { claim_number: String, reason: String },

    /// A queue delivery without the fields the sender needs.
    #[error("malformed delivery: {0}")]
    MalformedDelivery(String),
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RelayError::Transport(format!("request timed out: {e}"))
        } else {
            RelayError::Transport(e.to_string())
        }
    }
}

impl From<lapin::Error> for RelayError {
    fn from(e: lapin::Error) -> Self {
        RelayError::Transport(e.to_string())
    }
}

/// Convenience alias used across the library.
pub type RelayResult<T> = Result<T, RelayError>;
