//! Typed errors for the brokered sign-in flow
//!
//! Lets the UI tell a routine "user walked away" apart from a broken broker or
//! a storage fault without string matching.

use crate::storage::{RecordId, StoreError};
use thiserror::Error;

/// Sign-in errors with typed variants
///
/// - `RecordNotFound` - no token cache entry for the account; first-time setup missing
/// - `BrokerUnavailable` - creating the broker resource failed; fatal for this attempt
/// - `UserDidNotComplete` - cancelled or timed out; ask the user to try again
/// - `MissingAuthorizationCode` - broker/provider contract violation
/// - `TokenExchange` - the provider rejected the authorization code
/// - `Storage` - the encrypted cache store failed
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No token cache entry found for account {0}")]
    RecordNotFound(RecordId),

    #[error("Cloud token broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Cancellation and timeout both land here
    #[error("Looks like you didn't sign in on your browser. Please try again.")]
    UserDidNotComplete,

    #[error("Broker resource was fulfilled without an authorization code")]
    MissingAuthorizationCode,

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Token cache storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AuthError {
    /// Whether simply calling `auth` again is the right response
    pub fn is_user_retryable(&self) -> bool {
        matches!(self, AuthError::UserDidNotComplete)
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => AuthError::RecordNotFound(id),
            StoreError::Backend(e) => AuthError::Storage(format!("{:#}", e)),
        }
    }
}
