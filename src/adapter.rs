//! The synchronization adapter: one connection, one table set.
//!
//! [`SqlAdapter`] ties the pieces together: it resolves a logical
//! database name to a connection profile, opens a reference-counted
//! connection through a [`SqlConnector`], fills named in-memory tables
//! from queries (translating cross-database references on the way in),
//! and pushes pending row changes back, reconciling the remote schema
//! first when asked.
//!
//! An adapter serves one logical caller: every data operation takes
//! `&mut self` and blocks that caller until the round trip completes.
//! For concurrent work, [`SqlAdapter::clone_detached`] yields an
//! independent adapter with its own connection and table set.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::client::{SqlClient, SqlConnector};
use crate::config::{ConfigSource, ConnectionProfile};
use crate::error::{Result, SyncError};
use crate::models::{Column, DataValue, Row, RowState, Table, TableSet};
use crate::translate::LinkedServerTranslator;
use crate::typemap::sql_column_type;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No physical connection.
    Closed,
    /// A connection attempt is in flight.
    Connecting,
    /// A physical connection is held.
    Open,
}

/// Synchronizes an in-memory table set against a SQL Server database.
pub struct SqlAdapter {
    config: Arc<dyn ConfigSource>,
    connector: Arc<dyn SqlConnector>,
    profile: ConnectionProfile,
    translator: LinkedServerTranslator,
    client: Option<Box<dyn SqlClient>>,
    state: ConnectionState,
    open_count: u32,
    tables: TableSet,
    active_table: Option<String>,
}

impl SqlAdapter {
    /// Creates an adapter for a logical database name, resolving its
    /// connection profile immediately.
    ///
    /// # Errors
    ///
    /// Fails with a configuration error when the name cannot be resolved
    /// to a non-empty connection string.
    pub fn new(
        database: &str,
        config: Arc<dyn ConfigSource>,
        connector: Arc<dyn SqlConnector>,
    ) -> Result<Self> {
        let profile = ConnectionProfile::resolve(config.as_ref(), database)?;
        let translator = LinkedServerTranslator::from_config(config.as_ref());
        Ok(Self {
            config,
            connector,
            profile,
            translator,
            client: None,
            state: ConnectionState::Closed,
            open_count: 0,
            tables: TableSet::new(),
            active_table: None,
        })
    }

    /// Creates an adapter from an explicit profile, bypassing name
    /// resolution (custom timeouts, pre-built connection strings).
    ///
    /// # Errors
    ///
    /// Fails when the profile does not validate.
    pub fn with_profile(
        profile: ConnectionProfile,
        config: Arc<dyn ConfigSource>,
        connector: Arc<dyn SqlConnector>,
    ) -> Result<Self> {
        profile.validate()?;
        let translator = LinkedServerTranslator::from_config(config.as_ref());
        Ok(Self {
            config,
            connector,
            profile,
            translator,
            client: None,
            state: ConnectionState::Closed,
            open_count: 0,
            tables: TableSet::new(),
            active_table: None,
        })
    }

    /// Creates an adapter backed by the live TDS driver.
    ///
    /// # Errors
    ///
    /// Fails when the database name cannot be resolved.
    #[cfg(feature = "mssql")]
    pub fn for_database(database: &str, config: Arc<dyn ConfigSource>) -> Result<Self> {
        Self::new(database, config, Arc::new(crate::client::tds::TdsConnector))
    }

    /// The active connection profile.
    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    /// The current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// True when a physical connection is held.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Opens the connection, or joins an already open one.
    ///
    /// Calls are reference-counted: nested callers may pair
    /// `connect`/`disconnect` freely without dropping the connection out
    /// from under each other.
    ///
    /// # Errors
    ///
    /// Fails when the connection cannot be established; the reference
    /// count is left untouched in that case.
    pub async fn connect(&mut self) -> Result<()> {
        if self.client.is_none() {
            self.state = ConnectionState::Connecting;
            match self.connector.connect(&self.profile).await {
                Ok(client) => {
                    self.client = Some(client);
                    self.state = ConnectionState::Open;
                    info!(database = %self.profile.database, "connection opened");
                }
                Err(e) => {
                    self.state = ConnectionState::Closed;
                    return Err(e);
                }
            }
        }
        self.open_count += 1;
        Ok(())
    }

    /// Releases one `connect` hold; the physical connection closes when
    /// the last hold is released. A call without a matching `connect` is
    /// a no-op.
    pub fn disconnect(&mut self) {
        if self.open_count > 0 {
            self.open_count -= 1;
        }
        if self.open_count == 0 && self.client.is_some() {
            self.client = None;
            self.state = ConnectionState::Closed;
            info!(database = %self.profile.database, "connection closed");
        }
    }

    /// Closes the connection unconditionally and zeroes the reference
    /// count, regardless of outstanding holders.
    pub fn force_close(&mut self) {
        self.open_count = 0;
        if self.client.is_some() {
            self.client = None;
            info!(database = %self.profile.database, "connection force-closed");
        }
        self.state = ConnectionState::Closed;
    }

    /// Runs an operation inside a `connect`/`disconnect` pair, releasing
    /// the hold on every exit path.
    ///
    /// # Errors
    ///
    /// Propagates connection and operation errors.
    pub async fn with_connection<T, F>(&mut self, op: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut Self) -> Result<T>,
    {
        self.connect().await?;
        let outcome = op(self).await;
        self.disconnect();
        outcome
    }

    /// Switches the adapter to another logical database: tears down the
    /// live connection and all bound state and resolves a new profile.
    /// The in-memory table set is retained.
    ///
    /// # Errors
    ///
    /// Fails when the new name cannot be resolved; the adapter keeps its
    /// previous profile in that case.
    pub fn switch_database(&mut self, database: &str) -> Result<()> {
        let profile = ConnectionProfile::resolve(self.config.as_ref(), database)?;
        self.force_close();
        self.profile = profile;
        self.translator = LinkedServerTranslator::from_config(self.config.as_ref());
        Ok(())
    }

    /// An independent adapter sharing only this one's resolved profile
    /// and collaborators: fresh table set, closed connection, zero holds.
    pub fn clone_detached(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            connector: Arc::clone(&self.connector),
            profile: self.profile.clone(),
            translator: self.translator.clone(),
            client: None,
            state: ConnectionState::Closed,
            open_count: 0,
            tables: TableSet::new(),
            active_table: None,
        }
    }

    // ---- query execution ------------------------------------------------

    /// Fills a named table from a query.
    ///
    /// Applies the session date-format statement, executes the translated
    /// SQL, and stores the result under `target_table` (or `source_table`
    /// when no target is given), replacing any table already under that
    /// name and making it the active table. With `reset_all` the whole
    /// table set is cleared first. Returns the number of rows fetched.
    ///
    /// # Errors
    ///
    /// Fails with a connection error when no connection is open, and with
    /// an execution error (carrying the SQL text) on driver failure.
    pub async fn run_query(
        &mut self,
        sql: &str,
        reset_all: bool,
        source_table: &str,
        target_table: Option<&str>,
    ) -> Result<usize> {
        if self.client.is_none() {
            return Err(SyncError::not_connected("run_query"));
        }
        let translated = self.translator.translate(sql);
        let set_dateformat = format!("SET DATEFORMAT {}", self.profile.date_format);
        let reference = parse_table_reference(source_table);

        let (columns, rows) = {
            let client = self.client.as_mut().ok_or_else(|| SyncError::not_connected("run_query"))?;
            client.execute(&set_dateformat).await?;
            let result = client.query(&translated).await?;
            let mut columns = result.columns;
            // Wire metadata has no key/identity flags; pull them from the
            // catalog when the source names a real table.
            if let Some((database, table)) = &reference {
                let schema = client.table_schema(database.as_deref(), table).await?;
                merge_schema_flags(&mut columns, &schema);
            }
            (columns, result.rows)
        };

        if reset_all {
            self.tables.clear();
            self.active_table = None;
        }

        let name = match target_table {
            Some(target) if !target.is_empty() => target,
            _ => source_table,
        };
        let row_count = rows.len();
        let mut table = Table::with_columns(name, columns);
        for values in rows {
            table.add_row(Row::new(values, RowState::Unchanged))?;
        }
        self.tables.insert(table);
        self.active_table = Some(name.to_string());
        debug!(table = name, rows = row_count, "query filled table");
        Ok(row_count)
    }

    /// Executes a statement and returns the rows affected.
    ///
    /// With no open connection this returns 0 without touching the
    /// database, a deliberate leniency for optional background calls.
    ///
    /// # Errors
    ///
    /// Fails with an execution error on driver failure.
    pub async fn run_non_query(&mut self, sql: &str) -> Result<u64> {
        let translated = self.translator.translate(sql);
        let Some(client) = self.client.as_mut() else {
            debug!("run_non_query with closed connection, skipping");
            return Ok(0);
        };
        client.execute(&translated).await
    }

    /// Executes a query and returns the first column of the first row.
    ///
    /// With no open connection this returns [`DataValue::Null`] without
    /// touching the database.
    ///
    /// # Errors
    ///
    /// Fails with an execution error carrying the SQL text.
    pub async fn run_scalar(&mut self, sql: &str) -> Result<DataValue> {
        let translated = self.translator.translate(sql);
        let Some(client) = self.client.as_mut() else {
            debug!("run_scalar with closed connection, returning NULL");
            return Ok(DataValue::Null);
        };
        client.query_scalar(&translated).await
    }

    /// The connection-scoped last-identity value, or `None` when the
    /// session has not inserted into an identity column. Only meaningful
    /// immediately after a single insert on this adapter's connection.
    ///
    /// # Errors
    ///
    /// Fails with an execution error on driver failure.
    pub async fn last_insert_id(&mut self) -> Result<Option<i64>> {
        const IDENTITY_SQL: &str = "SELECT CONVERT(BIGINT, @@IDENTITY)";
        match self.run_scalar(IDENTITY_SQL).await? {
            DataValue::Null => Ok(None),
            DataValue::BigInt(v) => Ok(Some(v)),
            DataValue::Int(v) => Ok(Some(i64::from(v))),
            other => Err(SyncError::execution(
                IDENTITY_SQL,
                format!("unexpected identity value {other}"),
            )),
        }
    }

    // ---- schema reconciliation and write-back ---------------------------

    /// Adds every column present on the in-memory table but missing from
    /// the live one. Returns the number of columns added (zero on a
    /// second run against a synchronized table).
    ///
    /// `schema_query` supplies the schema-only query to read the live
    /// column set; when absent, `SELECT TOP 0 * FROM <table>` is
    /// synthesized through the translator, which doubles as an
    /// existence check for the remote table.
    ///
    /// # Errors
    ///
    /// Fails with a connection error when no connection is open, an
    /// execution error on driver failure, and an unsupported-type error
    /// when a local column's semantic type has no SQL Server mapping.
    pub async fn update_schema(
        &mut self,
        table_name: &str,
        schema_query: Option<&str>,
    ) -> Result<usize> {
        if self.client.is_none() {
            return Err(SyncError::not_connected("update_schema"));
        }
        let schema_sql = match schema_query {
            Some(q) => self.translator.translate(q),
            None => self
                .translator
                .translate(&format!("SELECT TOP 0 * FROM {table_name}")),
        };

        let remote = {
            let client = self
                .client
                .as_mut()
                .ok_or_else(|| SyncError::not_connected("update_schema"))?;
            client.query(&schema_sql).await?
        };
        let remote_names: HashSet<String> = remote
            .columns
            .iter()
            .map(|c| c.name.to_lowercase())
            .collect();

        let (_, bare_name) = split_qualified(table_name);
        let missing: Vec<Column> = {
            let Some(local) = self
                .tables
                .get(table_name)
                .or_else(|| self.tables.get(&bare_name))
            else {
                debug!(table = table_name, "no in-memory table to reconcile");
                return Ok(0);
            };
            local
                .columns()
                .iter()
                .filter(|c| !remote_names.contains(&c.name.to_lowercase()))
                .cloned()
                .collect()
        };

        let mut added = 0;
        for column in missing {
            let sql_type = sql_column_type(&column.data_type)?;
            let nullability = if column.is_nullable { "NULL" } else { "NOT NULL" };
            let statement = format!(
                "ALTER TABLE {table_name} ADD {} {} {}",
                quote_ident(&column.name),
                sql_type,
                nullability,
            );
            let translated = self.translator.translate(&statement);
            let client = self
                .client
                .as_mut()
                .ok_or_else(|| SyncError::not_connected("update_schema"))?;
            client.execute(&translated).await?;
            info!(table = table_name, column = %column.name, "added remote column");
            added += 1;
        }
        Ok(added)
    }

    /// Pushes pending row changes back to the database: inserts for added
    /// rows, updates for modified rows, deletes for deleted rows. With a
    /// table name the remote schema is reconciled first (the schema query
    /// doubling as the pre-flight existence check); without one, every
    /// table in the set is pushed as-is. Returns the number of statements
    /// executed.
    ///
    /// # Errors
    ///
    /// Fails with a connection error when no connection is open, a
    /// missing-primary-key error when modified or deleted rows cannot be
    /// keyed, and an execution error on driver failure.
    pub async fn update_db(
        &mut self,
        table_name: Option<&str>,
        schema_query: Option<&str>,
    ) -> Result<u64> {
        if self.client.is_none() {
            return Err(SyncError::not_connected("update_db"));
        }
        match table_name {
            Some(name) => {
                self.update_schema(name, schema_query).await?;
                self.push_table(name).await
            }
            None => {
                let mut pushed = 0;
                for name in self.tables.names() {
                    pushed += self.push_table(&name).await?;
                }
                Ok(pushed)
            }
        }
    }

    /// Writes one table's pending changes and marks it clean.
    async fn push_table(&mut self, name: &str) -> Result<u64> {
        let (_, bare_name) = split_qualified(name);
        let statements = {
            let Some(table) = self.tables.get(name).or_else(|| self.tables.get(&bare_name))
            else {
                return Ok(0);
            };
            build_write_back(table)?
        };
        if statements.is_empty() {
            return Ok(0);
        }

        let mut executed = 0;
        for statement in &statements {
            let translated = self.translator.translate(statement);
            let client = self
                .client
                .as_mut()
                .ok_or_else(|| SyncError::not_connected("update_db"))?;
            client.execute(&translated).await?;
            executed += 1;
        }

        let committed = if self.tables.contains(name) { name } else { &bare_name };
        if let Some(table) = self.tables.get_mut(committed) {
            table.commit_changes();
        }
        info!(table = name, statements = executed, "pushed pending changes");
        Ok(executed)
    }

    // ---- table-set accessors --------------------------------------------

    /// The whole table set.
    pub fn tables(&self) -> &TableSet {
        &self.tables
    }

    /// A table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// A table by name, mutably.
    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    /// Table names in set order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.names()
    }

    /// Makes an existing table the active one.
    ///
    /// # Errors
    ///
    /// Fails when no table of that name exists.
    pub fn select_table(&mut self, name: &str) -> Result<()> {
        if !self.tables.contains(name) {
            return Err(SyncError::configuration(format!("no table named '{name}'")));
        }
        self.active_table = Some(name.to_string());
        Ok(())
    }

    /// The active table, if any.
    pub fn active_table(&self) -> Option<&Table> {
        self.active_table.as_deref().and_then(|n| self.tables.get(n))
    }

    /// The active table, mutably.
    pub fn active_table_mut(&mut self) -> Option<&mut Table> {
        let name = self.active_table.clone()?;
        self.tables.get_mut(&name)
    }

    /// Row count of the active table; zero when none is selected.
    pub fn row_count(&self) -> usize {
        self.active_table().map_or(0, Table::row_count)
    }

    /// Ordered primary-key values of the active table.
    ///
    /// # Errors
    ///
    /// Fails when no table is active, or with a missing-primary-key error
    /// when the table has neither a unique column nor an `id` column.
    pub fn key_ids(&self) -> Result<Vec<DataValue>> {
        self.require_active()?.key_ids()
    }

    /// A detached NULL row shaped for the active table.
    ///
    /// # Errors
    ///
    /// Fails when no table is active.
    pub fn new_row(&self) -> Result<Row> {
        Ok(self.require_active()?.new_row())
    }

    /// Appends a row to the active table.
    ///
    /// # Errors
    ///
    /// Fails when no table is active or the row arity does not match.
    pub fn add_row(&mut self, row: Row) -> Result<()> {
        self.require_active_mut()?.add_row(row)
    }

    /// Appends a column to the active table, padding existing rows.
    ///
    /// # Errors
    ///
    /// Fails when no table is active.
    pub fn add_column(&mut self, column: Column) -> Result<()> {
        self.require_active_mut()?.add_column(column);
        Ok(())
    }

    /// Removes a column from the active table.
    ///
    /// # Errors
    ///
    /// Fails when no table is active or the column does not exist.
    pub fn remove_column(&mut self, name: &str) -> Result<()> {
        self.require_active_mut()?.remove_column(name)
    }

    /// Sets a cell on the active table, bumping the row's change state.
    ///
    /// # Errors
    ///
    /// Fails when no table is active or the row/column does not exist.
    pub fn set_value(&mut self, row: usize, column: &str, value: DataValue) -> Result<()> {
        self.require_active_mut()?.set_value(row, column, value)
    }

    /// Removes a table; clears the active pointer when it was the one
    /// removed. Returns whether a table existed.
    pub fn remove_table(&mut self, name: &str) -> bool {
        let removed = self.tables.remove(name);
        if removed
            && self
                .active_table
                .as_deref()
                .is_some_and(|active| active.eq_ignore_ascii_case(name))
        {
            self.active_table = None;
        }
        removed
    }

    /// Clears the whole table set and the active pointer.
    pub fn clear_tables(&mut self) {
        self.tables.clear();
        self.active_table = None;
    }

    fn require_active(&self) -> Result<&Table> {
        self.active_table()
            .ok_or_else(|| SyncError::configuration("no active table selected"))
    }

    fn require_active_mut(&mut self) -> Result<&mut Table> {
        let name = self
            .active_table
            .clone()
            .ok_or_else(|| SyncError::configuration("no active table selected"))?;
        self.tables
            .get_mut(&name)
            .ok_or_else(|| SyncError::configuration("no active table selected"))
    }
}

impl std::fmt::Debug for SqlAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlAdapter")
            .field("profile", &self.profile.to_string())
            .field("state", &self.state)
            .field("open_count", &self.open_count)
            .field("tables", &self.tables.names())
            .field("active_table", &self.active_table)
            .finish()
    }
}

/// Copies catalog-sourced flags onto fill columns, matching by name.
fn merge_schema_flags(columns: &mut [Column], schema: &[Column]) {
    for column in columns {
        if let Some(live) = schema
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(&column.name))
        {
            column.data_type = live.data_type.clone();
            column.is_nullable = live.is_nullable;
            column.is_unique = live.is_unique;
            column.is_auto_increment = live.is_auto_increment;
        }
    }
}

/// Splits an optionally qualified `database.dbo.table` name. Unparseable
/// input comes back as a bare table name.
fn split_qualified(name: &str) -> (Option<String>, String) {
    parse_table_reference(name).map_or((None, name.to_string()), |(db, table)| (db, table))
}

/// Parses `table`, `dbo.table`, or `database.dbo.table` (each segment
/// optionally `[bracketed]`). Returns `None` when the name is not a
/// plain table reference.
fn parse_table_reference(name: &str) -> Option<(Option<String>, String)> {
    let segments: Vec<&str> = name.split('.').collect();
    let strip = |s: &str| -> Option<String> {
        let s = s.trim();
        let s = s
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(s);
        if s.is_empty()
            || !s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'#' | b'$' | b'@'))
        {
            return None;
        }
        Some(s.to_string())
    };
    match segments.as_slice() {
        [table] => Some((None, strip(table)?)),
        [schema, table] if strip(schema)?.eq_ignore_ascii_case("dbo") => {
            Some((None, strip(table)?))
        }
        [database, schema, table] if strip(schema)?.eq_ignore_ascii_case("dbo") => {
            Some((Some(strip(database)?), strip(table)?))
        }
        _ => None,
    }
}

/// Quotes an identifier in brackets, doubling any closing bracket.
fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Renders a cell as a T-SQL literal.
fn sql_literal(value: &DataValue) -> String {
    match value {
        DataValue::Null => "NULL".to_string(),
        DataValue::Bool(true) => "1".to_string(),
        DataValue::Bool(false) => "0".to_string(),
        DataValue::TinyInt(v) => v.to_string(),
        DataValue::SmallInt(v) => v.to_string(),
        DataValue::Int(v) => v.to_string(),
        DataValue::BigInt(v) => v.to_string(),
        DataValue::Real(v) => v.to_string(),
        DataValue::Float(v) => v.to_string(),
        DataValue::String(v) => format!("N'{}'", v.replace('\'', "''")),
        DataValue::DateTime(v) => format!("'{}'", v.format("%Y-%m-%d %H:%M:%S%.3f")),
        DataValue::Duration(ms) => {
            let total_seconds = ms / 1000;
            format!(
                "'{:02}:{:02}:{:02}.{:03}'",
                total_seconds / 3600,
                (total_seconds / 60) % 60,
                total_seconds % 60,
                ms % 1000
            )
        }
        DataValue::Binary(bytes) => {
            let mut hex = String::with_capacity(2 + bytes.len() * 2);
            hex.push_str("0x");
            for byte in bytes {
                hex.push_str(&format!("{byte:02X}"));
            }
            hex
        }
        DataValue::Uuid(v) => format!("'{v}'"),
    }
}

/// Generates the insert/update/delete statements for a table's pending
/// rows, in row order.
fn build_write_back(table: &Table) -> Result<Vec<String>> {
    let needs_key = table
        .rows()
        .iter()
        .any(|r| matches!(r.state(), RowState::Modified | RowState::Deleted));
    let key = table.key_column().cloned();
    if needs_key && key.is_none() {
        return Err(SyncError::no_primary_key(table.name()));
    }

    let mut statements = Vec::new();
    for row in table.rows() {
        match row.state() {
            RowState::Unchanged => {}
            RowState::Added => {
                let mut names = Vec::new();
                let mut values = Vec::new();
                for column in table.columns() {
                    if column.is_auto_increment {
                        continue;
                    }
                    names.push(quote_ident(&column.name));
                    values.push(
                        row.value(column.ordinal_position as usize)
                            .map_or_else(|| "NULL".to_string(), sql_literal),
                    );
                }
                if names.is_empty() {
                    statements.push(format!("INSERT INTO {} DEFAULT VALUES", table.name()));
                } else {
                    statements.push(format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        table.name(),
                        names.join(", "),
                        values.join(", ")
                    ));
                }
            }
            RowState::Modified | RowState::Deleted => {
                let Some(key) = key.as_ref() else {
                    return Err(SyncError::no_primary_key(table.name()));
                };
                let key_value = row
                    .value(key.ordinal_position as usize)
                    .ok_or_else(|| SyncError::no_primary_key(table.name()))?;
                if key_value.is_null() {
                    return Err(SyncError::configuration(format!(
                        "row on table '{}' has a NULL key value",
                        table.name()
                    )));
                }
                if row.state() == RowState::Deleted {
                    statements.push(format!(
                        "DELETE FROM {} WHERE {} = {}",
                        table.name(),
                        quote_ident(&key.name),
                        sql_literal(key_value)
                    ));
                } else {
                    let assignments: Vec<String> = table
                        .columns()
                        .iter()
                        .filter(|c| !c.is_auto_increment && !c.name.eq_ignore_ascii_case(&key.name))
                        .map(|c| {
                            format!(
                                "{} = {}",
                                quote_ident(&c.name),
                                row.value(c.ordinal_position as usize)
                                    .map_or_else(|| "NULL".to_string(), sql_literal)
                            )
                        })
                        .collect();
                    statements.push(format!(
                        "UPDATE {} SET {} WHERE {} = {}",
                        table.name(),
                        assignments.join(", "),
                        quote_ident(&key.name),
                        sql_literal(key_value)
                    ));
                }
            }
        }
    }
    Ok(statements)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::client::QueryResult;
    use crate::config::MapConfig;
    use crate::models::DataType;

    /// Records every statement and answers queries with a canned result.
    struct StubClient {
        log: Arc<Mutex<Vec<String>>>,
        result: QueryResult,
    }

    #[async_trait]
    impl SqlClient for StubClient {
        async fn query(&mut self, sql: &str) -> Result<QueryResult> {
            self.log.lock().unwrap().push(format!("query: {sql}"));
            Ok(self.result.clone())
        }

        async fn execute(&mut self, sql: &str) -> Result<u64> {
            self.log.lock().unwrap().push(format!("execute: {sql}"));
            Ok(1)
        }

        async fn table_schema(&mut self, _db: Option<&str>, _table: &str) -> Result<Vec<Column>> {
            Ok(Vec::new())
        }
    }

    struct StubConnector {
        log: Arc<Mutex<Vec<String>>>,
        result: QueryResult,
        fail: bool,
    }

    #[async_trait]
    impl SqlConnector for StubConnector {
        async fn connect(&self, _profile: &ConnectionProfile) -> Result<Box<dyn SqlClient>> {
            if self.fail {
                return Err(SyncError::connect_failed(std::io::Error::other("refused")));
            }
            Ok(Box::new(StubClient {
                log: Arc::clone(&self.log),
                result: self.result.clone(),
            }))
        }
    }

    fn adapter_with(result: QueryResult, fail: bool) -> (SqlAdapter, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let config = MapConfig::new()
            .with_default_connection_string("Server=local;Database=app;Integrated Security=SSPI;")
            .with_local_database("app")
            .with_linked_server("Archive", "ARC01");
        let connector = StubConnector {
            log: Arc::clone(&log),
            result,
            fail,
        };
        let adapter = SqlAdapter::new("", Arc::new(config), Arc::new(connector)).unwrap();
        (adapter, log)
    }

    fn users_result() -> QueryResult {
        QueryResult {
            columns: vec![
                Column::new("id", DataType::Integer { bits: 32, signed: true }),
                Column::new("name", DataType::String { max_length: Some(50) }),
            ],
            rows: vec![
                vec![DataValue::Int(1), DataValue::String("ada".into())],
                vec![DataValue::Int(2), DataValue::String("grace".into())],
            ],
        }
    }

    #[tokio::test]
    async fn test_reference_counted_connect_disconnect() {
        let (mut adapter, _log) = adapter_with(QueryResult::default(), false);
        assert_eq!(adapter.connection_state(), ConnectionState::Closed);

        adapter.connect().await.unwrap();
        adapter.connect().await.unwrap();
        adapter.disconnect();
        assert!(adapter.is_connected());
        adapter.disconnect();
        assert_eq!(adapter.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_force_close_ignores_holders() {
        let (mut adapter, _log) = adapter_with(QueryResult::default(), false);
        adapter.connect().await.unwrap();
        adapter.connect().await.unwrap();
        adapter.force_close();
        assert!(!adapter.is_connected());
        // The counter was reset; one connect/disconnect pair now closes.
        adapter.connect().await.unwrap();
        adapter.disconnect();
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_closed_state() {
        let (mut adapter, _log) = adapter_with(QueryResult::default(), true);
        assert!(adapter.connect().await.is_err());
        assert_eq!(adapter.connection_state(), ConnectionState::Closed);
        // A later disconnect must not underflow or close anything.
        adapter.disconnect();
        assert_eq!(adapter.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_run_non_query_lenient_when_closed() {
        let (mut adapter, log) = adapter_with(QueryResult::default(), false);
        let affected = adapter.run_non_query("UPDATE Foo SET x = 1").await.unwrap();
        assert_eq!(affected, 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_scalar_lenient_when_closed() {
        let (mut adapter, _log) = adapter_with(QueryResult::default(), false);
        let value = adapter.run_scalar("SELECT COUNT(*) FROM Foo").await.unwrap();
        assert!(value.is_null());
    }

    #[tokio::test]
    async fn test_run_query_requires_connection() {
        let (mut adapter, _log) = adapter_with(QueryResult::default(), false);
        let result = adapter.run_query("SELECT 1", false, "T", None).await;
        assert!(matches!(result, Err(SyncError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_run_query_fills_and_activates() {
        let (mut adapter, log) = adapter_with(users_result(), false);
        adapter.connect().await.unwrap();
        let fetched = adapter
            .run_query("SELECT * FROM Users", false, "Users", None)
            .await
            .unwrap();
        assert_eq!(fetched, 2);
        assert_eq!(adapter.row_count(), 2);
        assert_eq!(adapter.active_table().unwrap().name(), "Users");
        // Date format precedes the query.
        let log = log.lock().unwrap();
        assert_eq!(log[0], "execute: SET DATEFORMAT ymd");
        assert_eq!(log[1], "query: SELECT * FROM Users");
    }

    #[tokio::test]
    async fn test_run_query_renames_to_target() {
        let (mut adapter, _log) = adapter_with(users_result(), false);
        adapter.connect().await.unwrap();
        adapter
            .run_query("SELECT * FROM Users", false, "Users", Some("Staff"))
            .await
            .unwrap();
        assert!(adapter.table("Staff").is_some());
        assert!(adapter.table("Users").is_none());
        assert_eq!(adapter.active_table().unwrap().name(), "Staff");
    }

    #[tokio::test]
    async fn test_run_query_reset_all_clears_set() {
        let (mut adapter, _log) = adapter_with(users_result(), false);
        adapter.connect().await.unwrap();
        adapter.run_query("SELECT 1", false, "A", None).await.unwrap();
        adapter.run_query("SELECT 2", true, "B", None).await.unwrap();
        assert_eq!(adapter.table_names(), vec!["B"]);
    }

    #[tokio::test]
    async fn test_queries_are_translated() {
        let (mut adapter, log) = adapter_with(users_result(), false);
        adapter.connect().await.unwrap();
        adapter
            .run_query("SELECT * FROM Archive.dbo.Logs", false, "Logs", None)
            .await
            .unwrap();
        assert!(
            log.lock()
                .unwrap()
                .iter()
                .any(|l| l == "query: SELECT * FROM ARC01.Archive.dbo.Logs")
        );
    }

    #[tokio::test]
    async fn test_active_table_mutation_helpers() {
        let (mut adapter, _log) = adapter_with(users_result(), false);
        adapter.connect().await.unwrap();
        adapter.run_query("SELECT * FROM Users", false, "Users", None).await.unwrap();

        let mut row = adapter.new_row().unwrap();
        row.set_value(0, DataValue::Int(3)).unwrap();
        adapter.add_row(row).unwrap();
        assert_eq!(adapter.row_count(), 3);

        adapter
            .add_column(Column::new("email", DataType::String { max_length: Some(255) }))
            .unwrap();
        assert_eq!(adapter.active_table().unwrap().columns().len(), 3);
        adapter.remove_column("email").unwrap();
        assert_eq!(adapter.active_table().unwrap().columns().len(), 2);

        assert!(adapter.remove_table("Users"));
        assert!(adapter.active_table().is_none());
        assert!(adapter.new_row().is_err());
    }

    #[tokio::test]
    async fn test_key_ids_falls_back_to_id_column() {
        let (mut adapter, _log) = adapter_with(users_result(), false);
        adapter.connect().await.unwrap();
        adapter.run_query("SELECT * FROM Users", false, "Users", None).await.unwrap();
        let ids = adapter.key_ids().unwrap();
        assert_eq!(ids, vec![DataValue::Int(1), DataValue::Int(2)]);
    }

    #[tokio::test]
    async fn test_clone_detached_shares_nothing_live() {
        let (mut adapter, _log) = adapter_with(users_result(), false);
        adapter.connect().await.unwrap();
        adapter.run_query("SELECT 1", false, "T", None).await.unwrap();

        let clone = adapter.clone_detached();
        assert_eq!(clone.connection_state(), ConnectionState::Closed);
        assert!(clone.tables().is_empty());
        assert_eq!(
            clone.profile().connection_string,
            adapter.profile().connection_string
        );
    }

    #[tokio::test]
    async fn test_with_connection_releases_on_error() {
        let (mut adapter, _log) = adapter_with(QueryResult::default(), false);
        let outcome: Result<()> = adapter
            .with_connection(async |a| {
                assert!(a.is_connected());
                Err(SyncError::configuration("boom"))
            })
            .await;
        assert!(outcome.is_err());
        assert!(!adapter.is_connected());
    }

    #[test]
    fn test_parse_table_reference() {
        assert_eq!(parse_table_reference("Users"), Some((None, "Users".into())));
        assert_eq!(parse_table_reference("dbo.Users"), Some((None, "Users".into())));
        assert_eq!(
            parse_table_reference("Archive.dbo.Logs"),
            Some((Some("Archive".into()), "Logs".into()))
        );
        assert_eq!(
            parse_table_reference("[Archive].dbo.[Logs]"),
            Some((Some("Archive".into()), "Logs".into()))
        );
        assert_eq!(parse_table_reference("a.b.c.d"), None);
        assert_eq!(parse_table_reference("Users; DROP TABLE x"), None);
    }

    #[test]
    fn test_sql_literal_rendering() {
        assert_eq!(sql_literal(&DataValue::Null), "NULL");
        assert_eq!(sql_literal(&DataValue::Bool(true)), "1");
        assert_eq!(sql_literal(&DataValue::Int(42)), "42");
        assert_eq!(
            sql_literal(&DataValue::String("it's".into())),
            "N'it''s'"
        );
        assert_eq!(
            sql_literal(&DataValue::Binary(vec![0xDE, 0xAD])),
            "0xDEAD"
        );
        let dt = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        assert_eq!(sql_literal(&DataValue::DateTime(dt)), "'2024-03-01 12:30:00.000'");
        assert_eq!(sql_literal(&DataValue::Duration(3_661_500)), "'01:01:01.500'");
    }

    #[test]
    fn test_build_write_back_requires_key_for_updates() {
        let mut table = Table::with_columns(
            "NoKey",
            vec![Column::new("name", DataType::String { max_length: None })],
        );
        table.add_row(table.new_row()).unwrap();
        table.commit_changes();
        table
            .set_value(0, "name", DataValue::String("x".into()))
            .unwrap();
        assert!(matches!(
            build_write_back(&table),
            Err(SyncError::NoPrimaryKey { .. })
        ));
    }

    #[test]
    fn test_build_write_back_statements() {
        let mut table = Table::with_columns(
            "Users",
            vec![
                Column::new("id", DataType::Integer { bits: 32, signed: true })
                    .unique()
                    .auto_increment(),
                Column::new("name", DataType::String { max_length: Some(50) }),
            ],
        );
        // One clean row to modify, one to delete, one fresh insert.
        for (id, name) in [(1, "ada"), (2, "grace")] {
            let mut row = table.new_row();
            row.set_value(0, DataValue::Int(id)).unwrap();
            row.set_value(1, DataValue::String(name.into())).unwrap();
            table.add_row(row).unwrap();
        }
        table.commit_changes();
        table.set_value(0, "name", DataValue::String("ada l".into())).unwrap();
        table.row_mut(1).unwrap().mark_deleted();
        let mut fresh = table.new_row();
        fresh.set_value(1, DataValue::String("mary".into())).unwrap();
        table.add_row(fresh).unwrap();

        let statements = build_write_back(&table).unwrap();
        assert_eq!(
            statements,
            vec![
                "UPDATE Users SET [name] = N'ada l' WHERE [id] = 1".to_string(),
                "DELETE FROM Users WHERE [id] = 2".to_string(),
                "INSERT INTO Users ([name]) VALUES (N'mary')".to_string(),
            ]
        );
    }
}
