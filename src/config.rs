//! Connection resolution and adapter configuration.
//!
//! A logical database name resolves to a [`ConnectionProfile`] through an
//! injected [`ConfigSource`] collaborator: the empty name uses the
//! pre-registered default local connection string, a named database is
//! built from a `{server}`/`{database}` template plus a per-database
//! server mapping. Configuration is always an explicit object, never
//! process-global state, so independent adapters can carry independent
//! configurations in one process.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError, redact_connection_string};

/// Placeholder for the server name in a connection-string template.
pub const SERVER_PLACEHOLDER: &str = "{server}";
/// Placeholder for the database name in a connection-string template.
pub const DATABASE_PLACEHOLDER: &str = "{database}";

/// Key-lookup collaborator supplying externally owned configuration.
///
/// The surrounding application owns where these values live (app config,
/// environment, a registry table); the adapter only reads them. All
/// database-name lookups are case-insensitive.
pub trait ConfigSource: Send + Sync {
    /// The server hosting the named database, if mapped.
    fn server_for_database(&self, database: &str) -> Option<String>;

    /// The connection-string template with `{server}` and `{database}`
    /// placeholders.
    fn connection_string_template(&self) -> Option<String>;

    /// The pre-registered connection string for the default local
    /// database.
    fn default_connection_string(&self) -> Option<String>;

    /// The full linked-server catalog: `(database, alias)` pairs.
    fn linked_servers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Databases that live on the local server and therefore never need
    /// linked-server qualification.
    fn local_databases(&self) -> Vec<String> {
        Vec::new()
    }
}

/// In-memory [`ConfigSource`] built with the builder methods below.
///
/// # Example
///
/// ```rust
/// use tablesync::config::MapConfig;
///
/// let config = MapConfig::new()
///     .with_default_connection_string("Server=local;Database=app;Integrated Security=SSPI;")
///     .with_template("Server={server};Database={database};Integrated Security=SSPI;")
///     .with_server("Reporting", "rpt-sql-01")
///     .with_linked_server("Archive", "ARCHIVE01")
///     .with_local_database("app");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    servers: HashMap<String, String>,
    linked_servers: HashMap<String, String>,
    local_databases: Vec<String>,
    template: Option<String>,
    default_connection_string: Option<String>,
}

impl MapConfig {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the server hosting a database.
    pub fn with_server(mut self, database: &str, server: &str) -> Self {
        self.servers
            .insert(database.to_lowercase(), server.to_string());
        self
    }

    /// Registers a linked-server alias for a catalog.
    pub fn with_linked_server(mut self, database: &str, alias: &str) -> Self {
        self.linked_servers
            .insert(database.to_lowercase(), alias.to_string());
        self
    }

    /// Registers a database as local to the connected server.
    pub fn with_local_database(mut self, database: &str) -> Self {
        self.local_databases.push(database.to_string());
        self
    }

    /// Sets the connection-string template.
    pub fn with_template(mut self, template: &str) -> Self {
        self.template = Some(template.to_string());
        self
    }

    /// Sets the default local connection string.
    pub fn with_default_connection_string(mut self, connection_string: &str) -> Self {
        self.default_connection_string = Some(connection_string.to_string());
        self
    }
}

impl ConfigSource for MapConfig {
    fn server_for_database(&self, database: &str) -> Option<String> {
        self.servers.get(&database.to_lowercase()).cloned()
    }

    fn connection_string_template(&self) -> Option<String> {
        self.template.clone()
    }

    fn default_connection_string(&self) -> Option<String> {
        self.default_connection_string.clone()
    }

    fn linked_servers(&self) -> Vec<(String, String)> {
        self.linked_servers
            .iter()
            .map(|(db, alias)| (db.clone(), alias.clone()))
            .collect()
    }

    fn local_databases(&self) -> Vec<String> {
        self.local_databases.clone()
    }
}

/// The resolved connection state an adapter binds to: one profile is
/// active at a time, and switching databases rebuilds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Logical database name; empty for the default local database.
    pub database: String,
    /// Resolved connection string (ADO key=value form).
    pub connection_string: String,
    /// Timeout for individual commands.
    pub command_timeout: Duration,
    /// Timeout for opening the connection.
    pub connect_timeout: Duration,
    /// Session date-format setting applied before fills (`SET DATEFORMAT`).
    pub date_format: String,
}

impl ConnectionProfile {
    /// Resolves a profile for a logical database name.
    ///
    /// The empty name means the default local database. A named database
    /// is resolved by substituting the configured server and the database
    /// name into the connection-string template.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError::Configuration`] error when the default
    /// connection string, the template, or the server mapping is missing,
    /// or when resolution yields an empty connection string.
    pub fn resolve(config: &dyn ConfigSource, database: &str) -> Result<Self> {
        let connection_string = if database.is_empty() {
            config.default_connection_string().ok_or_else(|| {
                SyncError::configuration("no default local connection string registered")
            })?
        } else {
            let template = config.connection_string_template().ok_or_else(|| {
                SyncError::configuration("no connection-string template configured")
            })?;
            let server = config.server_for_database(database).ok_or_else(|| {
                SyncError::configuration(format!("no server mapped for database '{database}'"))
            })?;
            template
                .replace(SERVER_PLACEHOLDER, &server)
                .replace(DATABASE_PLACEHOLDER, database)
        };

        let profile = Self {
            database: database.to_string(),
            connection_string,
            command_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            date_format: "ymd".to_string(),
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Validates the profile.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty connection string or zero timeouts.
    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(SyncError::configuration(
                "resolved connection string is empty",
            ));
        }
        if self.command_timeout.as_secs() == 0 {
            return Err(SyncError::configuration(
                "command_timeout must be greater than 0",
            ));
        }
        if self.connect_timeout.as_secs() == 0 {
            return Err(SyncError::configuration(
                "connect_timeout must be greater than 0",
            ));
        }
        if self.date_format.is_empty() {
            return Err(SyncError::configuration("date_format must not be empty"));
        }
        Ok(())
    }

    /// Builder method to set the command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Builder method to set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder method to set the session date format.
    pub fn with_date_format(mut self, date_format: &str) -> Self {
        self.date_format = date_format.to_string();
        self
    }
}

impl std::fmt::Display for ConnectionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Redacted form only; the raw string may carry a password.
        write!(
            f,
            "ConnectionProfile({}: {})",
            if self.database.is_empty() { "<default>" } else { &self.database },
            redact_connection_string(&self.connection_string)
        )
    }
}
