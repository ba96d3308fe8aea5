//! Error types with connection-string sanitization.
//!
//! Every error raised by this crate keeps the failing SQL text for
//! diagnostics while guaranteeing that connection strings and passwords
//! never appear un-redacted in error messages or logs.

use std::sync::OnceLock;

use thiserror::Error;

/// Main error type for table-set synchronization operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid configuration (connection template, server
    /// mapping, empty connection string).
    #[error("configuration error: {message}")]
    Configuration {
        /// What was missing or invalid.
        message: String,
    },

    /// An operation required an open connection and none was available,
    /// or the connection could not be established.
    #[error("connection error: {context}")]
    Connection {
        /// The operation that required the connection.
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Driver-level failure during a scalar, fill, or update operation.
    /// Carries the offending SQL text for diagnostics.
    #[error("query execution failed for `{sql}`: {context}")]
    Execution {
        /// The SQL text that failed.
        sql: String,
        /// What the operation was doing.
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Key extraction found neither a unique-flagged column nor an `id`
    /// column on the table.
    #[error("table '{table}' has no primary key column and no 'id' column")]
    NoPrimaryKey {
        /// The table that was inspected.
        table: String,
    },

    /// Schema reconciliation met a semantic type with no SQL Server
    /// column-type mapping.
    #[error("no SQL Server column type mapping for {type_name}")]
    UnsupportedType {
        /// Human-readable name of the unmapped semantic type.
        type_name: String,
    },
}

/// Convenience type alias for Results with `SyncError`.
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a "no open connection" error for the named operation.
    pub fn not_connected(operation: &str) -> Self {
        Self::Connection {
            context: format!("{operation} requires an open connection"),
            source: None,
        }
    }

    /// Creates a connection-establishment error with the underlying cause.
    pub fn connect_failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            context: "failed to open connection".to_string(),
            source: Some(Box::new(error)),
        }
    }

    /// Creates an execution error with the offending SQL text.
    pub fn execution(sql: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Execution {
            sql: sql.into(),
            context: context.into(),
            source: None,
        }
    }

    /// Creates an execution error wrapping a driver-level cause.
    pub fn execution_source<E>(sql: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Execution {
            sql: sql.into(),
            context: "driver error".to_string(),
            source: Some(Box::new(error)),
        }
    }

    /// Creates a missing-primary-key error for the named table.
    pub fn no_primary_key(table: impl Into<String>) -> Self {
        Self::NoPrimaryKey {
            table: table.into(),
        }
    }

    /// Creates an unsupported-type error.
    pub fn unsupported_type(type_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            type_name: type_name.into(),
        }
    }
}

/// Masks password values in an ADO-style connection string.
///
/// `Password=` and `Pwd=` values are replaced with `****` so the string
/// is safe to log or embed in error context.
///
/// # Example
///
/// ```rust
/// use tablesync::error::redact_connection_string;
///
/// let sanitized = redact_connection_string("Server=db1;Database=app;Password=secret;");
/// assert_eq!(sanitized, "Server=db1;Database=app;Password=****;");
/// assert!(!sanitized.contains("secret"));
/// ```
#[allow(clippy::expect_used)]
pub fn redact_connection_string(connection_string: &str) -> String {
    static PASSWORD: OnceLock<regex::Regex> = OnceLock::new();
    let pattern = PASSWORD.get_or_init(|| {
        regex::Regex::new(r"(?i)(password|pwd)\s*=\s*[^;]*").expect("invalid password pattern")
    });
    pattern
        .replace_all(connection_string, "${1}=****")
        .into_owned()
}
