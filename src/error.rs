#![forbid(unsafe_code)]

// Error taxonomy shared by the registry, the membership model and the relay engine

use thiserror::Error;

/// Every failure a room operation can report back to the originating connection.
///
/// None of these are fatal: the relay engine turns them into an `error` event
/// for the sender and carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Room {0} already exists")]
    AlreadyExists(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Shorthand for the room-not-found case, which every handler hits.
    pub fn room_not_found(room_id: &str) -> Self {
        RelayError::NotFound(format!("Room {room_id}"))
    }

    /// Stable machine-readable code carried in the outbound `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::NotFound(_) => "not-found",
            RelayError::Forbidden(_) => "forbidden",
            RelayError::AlreadyExists(_) => "already-exists",
            RelayError::CapacityExceeded(_) => "capacity-exceeded",
            RelayError::Validation(_) => "validation",
            RelayError::Internal(_) => "internal",
        }
    }
}

/// Result type alias for room and relay operations
pub type RelayResult<T> = Result<T, RelayError>;
