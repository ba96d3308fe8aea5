//! In-memory table-set synchronization for SQL Server.
//!
//! This crate is the data layer of an application that works on cached
//! tabular results: it resolves logical database names to connections,
//! fills named in-memory tables from queries, lets the caller mutate
//! rows and columns, and pushes the pending changes back, adding any
//! missing columns to the remote table first.
//!
//! # Architecture
//! - [`adapter::SqlAdapter`] is the façade: one connection, one table
//!   set, one logical caller.
//! - [`config::ConfigSource`] injects the externally owned configuration
//!   (server mappings, connection-string template, linked servers).
//! - [`translate::LinkedServerTranslator`] rewrites cross-database
//!   `database.dbo.table` references onto linked-server aliases.
//! - [`client::SqlClient`] / [`client::SqlConnector`] isolate the driver;
//!   the `mssql` feature provides the live TDS implementation.
//!
//! # Security
//! Connection strings are redacted before they reach logs or error
//! messages; passwords never appear in any output of this crate.

pub mod adapter;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod translate;
pub mod typemap;

// Re-export commonly used types
pub use adapter::{ConnectionState, SqlAdapter};
pub use client::{QueryResult, SqlClient, SqlConnector};
pub use config::{ConfigSource, ConnectionProfile, MapConfig};
pub use error::{Result, SyncError};
pub use models::{Column, DataType, DataValue, Row, RowState, Table, TableSet};
pub use translate::LinkedServerTranslator;
