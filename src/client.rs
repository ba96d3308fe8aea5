//! Driver seam for SQL execution.
//!
//! The adapter talks to the database through the object-safe [`SqlClient`]
//! trait and obtains connections through [`SqlConnector`], so the live
//! TDS implementation (see [`tds`]) and test doubles are interchangeable.
//! One client wraps exactly one physical connection and is owned by one
//! adapter; nothing here is safe for concurrent use.

use async_trait::async_trait;

use crate::config::ConnectionProfile;
use crate::error::Result;
use crate::models::{Column, DataValue};

#[cfg(feature = "mssql")]
pub mod tds;

/// Columns and rows fetched by a single query.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Column descriptors in select order.
    pub columns: Vec<Column>,
    /// Row values aligned positionally with `columns`.
    pub rows: Vec<Vec<DataValue>>,
}

/// A live database connection.
///
/// All operations take `&mut self`: a connection carries session state
/// (date format, last-identity value) and serves one logical caller at a
/// time. Dropping the client closes the connection.
#[async_trait]
pub trait SqlClient: Send {
    /// Executes a query and fetches the first result set.
    ///
    /// # Errors
    ///
    /// Returns an [`crate::error::SyncError::Execution`] error wrapping
    /// the driver failure together with the SQL text.
    async fn query(&mut self, sql: &str) -> Result<QueryResult>;

    /// Executes a statement and returns the number of rows affected.
    ///
    /// # Errors
    ///
    /// Returns an execution error wrapping the driver failure.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Executes a query and returns the first column of the first row,
    /// or NULL when the result set is empty.
    ///
    /// # Errors
    ///
    /// Returns an execution error wrapping the driver failure.
    async fn query_scalar(&mut self, sql: &str) -> Result<DataValue> {
        let result = self.query(sql).await?;
        Ok(result
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or(DataValue::Null))
    }

    /// Lists the live column definitions of a table (name, type, length,
    /// nullability, key membership, identity) from the catalog views.
    /// Returns an empty list for an unknown table.
    ///
    /// # Errors
    ///
    /// Returns an execution error wrapping the driver failure.
    async fn table_schema(&mut self, database: Option<&str>, table: &str) -> Result<Vec<Column>>;
}

/// Establishes [`SqlClient`] connections for a profile.
#[async_trait]
pub trait SqlConnector: Send + Sync {
    /// Opens a new connection for the given profile.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::SyncError::Connection`] error when the
    /// connection cannot be established within the profile's timeout.
    async fn connect(&self, profile: &ConnectionProfile) -> Result<Box<dyn SqlClient>>;
}
