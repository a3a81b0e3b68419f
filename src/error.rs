//! Error types for the Exasol provider.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Driver errors from every backend funnel through [`classify_database_error`], which is
//! the single place where the database's transaction-collision text is recognised.

use thiserror::Error;

/// Prefix of the message Exasol returns when it aborts a transaction because of a
/// concurrent conflicting mutation of a global object (users, roles, connections).
///
/// The driver exposes no structured code for this condition other than the generic
/// SQLSTATE `40001`, so the text is matched. Keep in sync with the database's message
/// catalog when upgrading the server version.
pub const ROLLBACK_MARKER: &str =
    "GlobalTransactionRollback msg: Transaction collision: automatic transaction rollback";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42000" for a syntax or access rule violation
        sql_state: Option<String>,
    },

    #[error("{message}")]
    TransactionCollision { message: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Cache error: {message}")]
    Cache { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Credential store error: {message}")]
    Credentials { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ProviderError> },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ProviderError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a not found error for a catalog object.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn credentials(message: impl Into<String>) -> Self {
        Self::Credentials {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::TransactionCollision { .. } => {
                Some("Another session changed a global object concurrently; retry the operation")
            }
            _ => None,
        }
    }

    /// True for the database-initiated rollback caused by a global transaction collision.
    pub fn is_transaction_collision(&self) -> bool {
        matches!(self, Self::TransactionCollision { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Short machine-readable code used by the stdio host.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Database { .. } => "database",
            Self::TransactionCollision { .. } => "transaction_collision",
            Self::NotFound { .. } => "not_found",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::PoolClosed => "pool_closed",
            Self::Cache { .. } => "cache",
            Self::Transport { .. } => "transport",
            Self::Credentials { .. } => "credentials",
            Self::Cancelled => "cancelled",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Map an error reported by the database into either a collision or a plain database error.
///
/// Every backend calls this for server-side errors so the marker match lives in one place.
pub fn classify_database_error(message: &str, sql_state: Option<String>) -> ProviderError {
    if message.starts_with(ROLLBACK_MARKER) {
        ProviderError::TransactionCollision {
            message: message.to_string(),
        }
    } else {
        ProviderError::database(message, sql_state)
    }
}

/// Convert sqlx errors to ProviderError.
impl From<sqlx::Error> for ProviderError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => ProviderError::connection(
                msg.to_string(),
                "Check the host, port and credentials of the provider configuration",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                classify_database_error(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => ProviderError::database("No rows returned", None),
            sqlx::Error::PoolClosed => ProviderError::PoolClosed,
            sqlx::Error::Io(io_err) => ProviderError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => ProviderError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => ProviderError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => ProviderError::internal(
                format!("Column index {} out of bounds (len: {})", index, len),
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                ProviderError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => {
                ProviderError::internal(format!("Decode error: {}", source))
            }
            _ => ProviderError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::internal(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        ProviderError::internal(format!("I/O error: {}", err))
    }
}

impl From<async_tungstenite::tungstenite::Error> for ProviderError {
    fn from(err: async_tungstenite::tungstenite::Error) -> Self {
        ProviderError::transport(err.to_string())
    }
}

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProviderError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_not_found_display() {
        let err = ProviderError::not_found("Schema", "SALES");
        assert_eq!(err.to_string(), "Schema 'SALES' not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_collision() {
        let msg = format!("{}. (Session: 1776)", ROLLBACK_MARKER);
        let err = classify_database_error(&msg, Some("40001".to_string()));
        assert!(err.is_transaction_collision());
        assert_eq!(err.to_string(), msg);
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_classify_marker_must_be_prefix() {
        let msg = format!("error: {}", ROLLBACK_MARKER);
        let err = classify_database_error(&msg, Some("40001".to_string()));
        assert!(!err.is_transaction_collision());
        assert!(matches!(err, ProviderError::Database { .. }));
    }

    #[test]
    fn test_codes() {
        assert_eq!(ProviderError::PoolClosed.code(), "pool_closed");
        assert_eq!(
            ProviderError::invalid_argument("name").code(),
            "invalid_argument"
        );
        assert_eq!(ProviderError::not_found("Role", "R").code(), "not_found");
    }
}
