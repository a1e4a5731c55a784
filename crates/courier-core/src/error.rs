//! Error taxonomy surfaced to clients.

use courier_protocol::{codes, UserId};
use courier_store::StoreError;
use thiserror::Error;

/// Errors returned by the delivery router and sessions.
///
/// None of these close a connection. They are turned into an error ack on
/// the request that caused them.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Rejected before anything was persisted.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown user id.
    #[error("User not found: {0}")]
    NotFound(UserId),

    /// The connection's identity does not allow the request.
    #[error("Unauthorized")]
    Unauthorized,

    /// The request is not valid in the session's current state.
    #[error("Invalid session state: {0}")]
    InvalidState(&'static str),

    /// Persistence failed. Nothing was delivered or broadcast.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl DeliveryError {
    /// Wire error code.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            DeliveryError::Validation(_) => codes::VALIDATION,
            DeliveryError::NotFound(_) => codes::NOT_FOUND,
            DeliveryError::Unauthorized => codes::UNAUTHORIZED,
            DeliveryError::InvalidState(_) => codes::INVALID_STATE,
            DeliveryError::StoreUnavailable(_) => codes::STORE_UNAVAILABLE,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::Validation(_) => "validation",
            DeliveryError::NotFound(_) => "not_found",
            DeliveryError::Unauthorized => "unauthorized",
            DeliveryError::InvalidState(_) => "invalid_state",
            DeliveryError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl From<StoreError> for DeliveryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::EmptyContent => DeliveryError::Validation(err.to_string()),
            StoreError::UserNotFound(id) => DeliveryError::NotFound(id),
            StoreError::Conflict => DeliveryError::Validation(err.to_string()),
            StoreError::Unavailable(reason) => DeliveryError::StoreUnavailable(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_codes() {
        let cases = [
            (StoreError::EmptyContent, codes::VALIDATION),
            (StoreError::UserNotFound(UserId(9)), codes::NOT_FOUND),
            (StoreError::Unavailable("disk".into()), codes::STORE_UNAVAILABLE),
        ];

        for (store_err, code) in cases {
            assert_eq!(DeliveryError::from(store_err).code(), code);
        }
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(DeliveryError::Unauthorized.kind(), "unauthorized");
        assert_eq!(
            DeliveryError::from(StoreError::Unavailable("disk".into())).kind(),
            "store_unavailable"
        );
    }
}
