use parley_protocol::{ErrorCode, Identity};
use thiserror::Error;

use crate::auth::AuthError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid credential: {0}")]
    Unauthenticated(#[from] AuthError),

    #[error("connection has not been admitted")]
    NotAdmitted,

    #[error("connection already admitted as {0}")]
    AlreadyAdmitted(Identity),

    #[error("relay at capacity")]
    AtCapacity,

    #[error("{0} not found")]
    NotFound(String),

    #[error("not permitted: {0}")]
    Forbidden(String),

    #[error("message content must not be empty")]
    EmptyContent,

    #[error("{0} is not reachable")]
    RecipientUnavailable(Identity),

    #[error("{0} is already in a call")]
    CalleeBusy(Identity),

    #[error("busy: {0}")]
    Busy(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RelayError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            RelayError::Unauthenticated(_) => (ErrorCode::Unauthenticated, self.to_string()),
            RelayError::NotAdmitted => (ErrorCode::NotAdmitted, self.to_string()),
            RelayError::AlreadyAdmitted(_) => (ErrorCode::AlreadyAdmitted, self.to_string()),
            RelayError::AtCapacity => (ErrorCode::AtCapacity, self.to_string()),
            RelayError::NotFound(_) => (ErrorCode::NotFound, self.to_string()),
            RelayError::Forbidden(_) => (ErrorCode::Forbidden, self.to_string()),
            RelayError::EmptyContent => (ErrorCode::EmptyContent, self.to_string()),
            RelayError::RecipientUnavailable(_) => {
                (ErrorCode::RecipientUnavailable, self.to_string())
            }
            RelayError::CalleeBusy(_) | RelayError::Busy(_) => (ErrorCode::Busy, self.to_string()),
            RelayError::RateLimited => (ErrorCode::RateLimited, self.to_string()),
            RelayError::InvalidRequest(_) => (ErrorCode::InvalidRequest, self.to_string()),
            RelayError::Store(StoreError::NotFound(what)) => {
                (ErrorCode::NotFound, format!("{what} not found"))
            }
            RelayError::Store(_) => (
                ErrorCode::StoreUnavailable,
                "data store unavailable, try again later".to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_internals_are_not_leaked() {
        let err = RelayError::Store(StoreError::Task("worker panicked at db.rs:42".to_string()));
        let (code, message) = err.to_error_code();
        assert_eq!(code, ErrorCode::StoreUnavailable);
        assert!(!message.contains("db.rs"));
    }

    #[test]
    fn busy_variants_share_a_code() {
        assert_eq!(
            RelayError::CalleeBusy("bob".to_string()).to_error_code().0,
            ErrorCode::Busy
        );
        assert_eq!(
            RelayError::Busy("already in a call".to_string())
                .to_error_code()
                .0,
            ErrorCode::Busy
        );
    }

    #[test]
    fn auth_errors_map_to_unauthenticated() {
        let err = RelayError::from(AuthError::Expired);
        assert_eq!(err.to_error_code().0, ErrorCode::Unauthenticated);
    }
}
