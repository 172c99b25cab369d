//! # Error Types
//!
//! One error type for the whole core. Every failure carries a variant from a
//! closed set, and callers classify failures with [`EventflowError::kind`]
//! instead of probing concrete types.
//!
//! ## Classification
//!
//! | Kind          | Processing side                 | Query side              |
//! |---------------|---------------------------------|-------------------------|
//! | `NotFound`    | swallowed (redelivery vs delete) | returned to the caller |
//! | `Conflict`    | benign for unit creation        | real for primary entities |
//! | `BadRequest`  | n/a                             | unqualified bulk ops    |
//! | `Transient`   | retried by the task queue       | opaque internal error   |
//! | `Invariant`   | never swallowed                 | opaque internal error   |

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EventflowError {
    #[error("{entity_type} {id:?} not found")]
    NotFound { entity_type: String, id: String },

    #[error("Conflict on {entity_type} {id:?}: {reason}")]
    Conflict {
        entity_type: String,
        id: String,
        reason: String,
    },

    #[error("Bad request: {reason}")]
    BadRequest { reason: String },

    #[error("Database error: {operation} - {reason}")]
    Database { operation: String, reason: String },

    #[error("Queue error: {operation} - {reason}")]
    Queue { operation: String, reason: String },

    #[error("Substrate error: {operation} - {reason}")]
    Substrate { operation: String, reason: String },

    #[error("Heartbeat failed for consumer {consumer_id}: {reason}")]
    Heartbeat { consumer_id: String, reason: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by handlers, the task consumer and API-facing
/// callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    BadRequest,
    Transient,
    Invariant,
    Internal,
}

impl EventflowError {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn conflict(
        entity_type: impl Into<String>,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            entity_type: entity_type.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn database(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Database {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn queue(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Queue {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn substrate(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Substrate {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::BadRequest { .. } => ErrorKind::BadRequest,
            Self::Database { .. }
            | Self::Queue { .. }
            | Self::Substrate { .. }
            | Self::Heartbeat { .. } => ErrorKind::Transient,
            Self::InvariantViolation(_) => ErrorKind::Invariant,
            Self::Serialization(_) | Self::Configuration(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Only infrastructure failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Message suitable for callers outside the core.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::NotFound | ErrorKind::BadRequest | ErrorKind::Conflict => self.to_string(),
            _ => "internal error".to_string(),
        }
    }
}

impl From<sqlx::Error> for EventflowError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            // Callers that expect a row produce NotFound themselves.
            sqlx::Error::RowNotFound => EventflowError::Internal(err.to_string()),
            _ => EventflowError::Database {
                operation: "query".to_string(),
                reason: err.to_string(),
            },
        }
    }
}

impl From<sqlx::migrate::MigrateError> for EventflowError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EventflowError::Database {
            operation: "migrate".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for EventflowError {
    fn from(err: redis::RedisError) -> Self {
        EventflowError::Queue {
            operation: "redis".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EventflowError {
    fn from(err: serde_json::Error) -> Self {
        EventflowError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for EventflowError {
    fn from(err: config::ConfigError) -> Self {
        EventflowError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EventflowError>;
