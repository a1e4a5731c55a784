use courier_protocol::UserId;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Message content is empty after trimming.
    #[error("Message content cannot be empty")]
    EmptyContent,

    /// The referenced user does not exist.
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// Username or email already registered.
    #[error("Username or email already taken")]
    Conflict,

    /// The persistence layer could not be reached or failed.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Unavailable(format!("store task failed: {err}"))
    }
}
