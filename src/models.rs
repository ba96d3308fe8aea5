//! Core data models for the in-memory table set.
//!
//! This module defines the tabular structures an adapter fills from
//! queries and writes back to the database: typed cell values, column
//! descriptors, change-tracked rows, tables, and the named table set.
//! Every model keeps the structural invariant that a row's arity equals
//! its table's column count at all times.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Semantic data type of a column, unified across the wire types the
/// driver reports and the CLR-ish types the original callers supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// String/text types with optional maximum length
    String {
        /// Maximum character length; `None` for unbounded text
        max_length: Option<u32>,
    },
    /// Integer types with bit width
    Integer {
        /// Bit width (8, 16, 32, 64)
        bits: u8,
        /// Whether the type is signed
        signed: bool,
    },
    /// Floating point types
    Float {
        /// True for double precision, false for single
        double: bool,
    },
    /// Boolean type
    Boolean,
    /// Date and time (no timezone; SQL Server session-local)
    DateTime,
    /// Time span / time-of-day, millisecond resolution
    Duration,
    /// Binary data
    Binary {
        /// Maximum byte length; `None` for unbounded
        max_length: Option<u32>,
    },
    /// GUID / uniqueidentifier
    Uuid,
    /// Database-specific types with no unified representation
    Custom {
        /// The database's own name for the type
        type_name: String,
    },
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::String { max_length: Some(n) } => write!(f, "string({n})"),
            DataType::String { max_length: None } => write!(f, "string"),
            DataType::Integer { bits, signed: true } => write!(f, "integer({bits})"),
            DataType::Integer { bits, signed: false } => write!(f, "unsigned integer({bits})"),
            DataType::Float { double: true } => write!(f, "double float"),
            DataType::Float { double: false } => write!(f, "single float"),
            DataType::Boolean => write!(f, "boolean"),
            DataType::DateTime => write!(f, "date-time"),
            DataType::Duration => write!(f, "duration"),
            DataType::Binary { .. } => write!(f, "binary"),
            DataType::Uuid => write!(f, "uuid"),
            DataType::Custom { type_name } => write!(f, "custom({type_name})"),
        }
    }
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    /// SQL NULL
    Null,
    /// Boolean / bit
    Bool(bool),
    /// Unsigned 8-bit integer (SQL Server tinyint)
    TinyInt(u8),
    /// 16-bit integer
    SmallInt(i16),
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    BigInt(i64),
    /// Single-precision float
    Real(f32),
    /// Double-precision float
    Float(f64),
    /// String value
    String(String),
    /// Date and time without timezone
    DateTime(chrono::NaiveDateTime),
    /// Time span in milliseconds
    Duration(i64),
    /// Binary value
    Binary(Vec<u8>),
    /// GUID value
    Uuid(uuid::Uuid),
}

impl DataValue {
    /// Returns true for the SQL NULL value.
    pub fn is_null(&self) -> bool {
        matches!(self, DataValue::Null)
    }
}

impl std::fmt::Display for DataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataValue::Null => write!(f, "NULL"),
            DataValue::Bool(v) => write!(f, "{v}"),
            DataValue::TinyInt(v) => write!(f, "{v}"),
            DataValue::SmallInt(v) => write!(f, "{v}"),
            DataValue::Int(v) => write!(f, "{v}"),
            DataValue::BigInt(v) => write!(f, "{v}"),
            DataValue::Real(v) => write!(f, "{v}"),
            DataValue::Float(v) => write!(f, "{v}"),
            DataValue::String(v) => write!(f, "{v}"),
            DataValue::DateTime(v) => write!(f, "{v}"),
            DataValue::Duration(v) => write!(f, "{v}ms"),
            DataValue::Binary(v) => write!(f, "<{} bytes>", v.len()),
            DataValue::Uuid(v) => write!(f, "{v}"),
        }
    }
}

/// Column descriptor for an in-memory table.
///
/// Immutable once added to a table except through an explicit
/// schema-reconciliation add.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Semantic data type (string max length lives inside the type)
    pub data_type: DataType,
    /// Whether NULL values are allowed
    pub is_nullable: bool,
    /// Whether the column participates in the primary key / a unique
    /// constraint
    pub is_unique: bool,
    /// Whether the database assigns values on insert (identity)
    pub is_auto_increment: bool,
    /// Zero-based position within the table
    pub ordinal_position: u32,
}

impl Column {
    /// Creates a plain nullable column of the given type.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            is_nullable: true,
            is_unique: false,
            is_auto_increment: false,
            ordinal_position: 0,
        }
    }

    /// Builder method to mark the column unique (key candidate).
    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    /// Builder method to mark the column as identity-assigned.
    pub fn auto_increment(mut self) -> Self {
        self.is_auto_increment = true;
        self
    }

    /// Builder method to mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }
}

/// Change-tracking state of a row, consumed by write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowState {
    /// Row matches the database
    Unchanged,
    /// Row exists only in memory; write-back inserts it
    Added,
    /// Row was changed in memory; write-back updates it
    Modified,
    /// Row is marked for deletion; write-back deletes it
    Deleted,
}

/// A fixed-arity sequence of cells aligned positionally with the table's
/// columns, plus its change-tracking state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    values: Vec<DataValue>,
    state: RowState,
}

impl Row {
    pub(crate) fn new(values: Vec<DataValue>, state: RowState) -> Self {
        Self { values, state }
    }

    /// The row's cells in column order.
    pub fn values(&self) -> &[DataValue] {
        &self.values
    }

    /// The cell at the given column position.
    pub fn value(&self, index: usize) -> Option<&DataValue> {
        self.values.get(index)
    }

    /// Sets the cell at the given position, bumping the change state:
    /// an `Unchanged` row becomes `Modified`, `Added` stays `Added`.
    ///
    /// # Errors
    ///
    /// Fails if the position is out of range or the row is deleted.
    pub fn set_value(&mut self, index: usize, value: DataValue) -> Result<()> {
        if self.state == RowState::Deleted {
            return Err(SyncError::configuration("cannot modify a deleted row"));
        }
        let cell = self.values.get_mut(index).ok_or_else(|| {
            SyncError::configuration(format!("column index {index} out of range"))
        })?;
        *cell = value;
        if self.state == RowState::Unchanged {
            self.state = RowState::Modified;
        }
        Ok(())
    }

    /// The row's change-tracking state.
    pub fn state(&self) -> RowState {
        self.state
    }

    /// Marks the row for deletion on the next write-back.
    pub fn mark_deleted(&mut self) {
        self.state = RowState::Deleted;
    }

    pub(crate) fn set_state(&mut self, state: RowState) {
        self.state = state;
    }
}

/// An in-memory table: ordered columns plus change-tracked rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    rows: Vec<Row>,
}

impl Table {
    /// Creates an empty table with no columns.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Creates an empty table with the given columns, renumbering their
    /// ordinal positions.
    pub fn with_columns(name: impl Into<String>, mut columns: Vec<Column>) -> Self {
        for (i, column) in columns.iter_mut().enumerate() {
            column.ordinal_position = i as u32;
        }
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// The table's name within the set.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// The table's columns in ordinal order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Case-insensitive column lookup by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Number of rows, including rows marked for deletion.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// The rows in insertion order.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// A single row by index.
    pub fn row(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    /// A single row by index, mutably.
    pub fn row_mut(&mut self, index: usize) -> Option<&mut Row> {
        self.rows.get_mut(index)
    }

    /// Creates a detached row of NULLs matching the current column count.
    /// The row joins the table (and its change tracking) via [`Table::add_row`].
    pub fn new_row(&self) -> Row {
        Row::new(vec![DataValue::Null; self.columns.len()], RowState::Added)
    }

    /// Appends a row, enforcing the arity invariant.
    ///
    /// # Errors
    ///
    /// Fails if the row's cell count differs from the column count.
    pub fn add_row(&mut self, row: Row) -> Result<()> {
        if row.values.len() != self.columns.len() {
            return Err(SyncError::configuration(format!(
                "row arity {} does not match column count {} on table '{}'",
                row.values.len(),
                self.columns.len(),
                self.name
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Sets a cell by row index and column name.
    ///
    /// # Errors
    ///
    /// Fails if the row or column does not exist.
    pub fn set_value(&mut self, row: usize, column: &str, value: DataValue) -> Result<()> {
        let index = self.column_index(column).ok_or_else(|| {
            SyncError::configuration(format!("no column '{column}' on table '{}'", self.name))
        })?;
        let row = self.rows.get_mut(row).ok_or_else(|| {
            SyncError::configuration(format!("row index {row} out of range"))
        })?;
        row.set_value(index, value)
    }

    /// Appends a column, padding every existing row with NULL to keep
    /// the arity invariant.
    pub fn add_column(&mut self, mut column: Column) {
        column.ordinal_position = self.columns.len() as u32;
        self.columns.push(column);
        for row in &mut self.rows {
            row.values.push(DataValue::Null);
        }
    }

    /// Removes a column by name, dropping the corresponding cell from
    /// every row and renumbering ordinals.
    ///
    /// # Errors
    ///
    /// Fails if the column does not exist.
    pub fn remove_column(&mut self, name: &str) -> Result<()> {
        let index = self.column_index(name).ok_or_else(|| {
            SyncError::configuration(format!("no column '{name}' on table '{}'", self.name))
        })?;
        self.columns.remove(index);
        for (i, column) in self.columns.iter_mut().enumerate() {
            column.ordinal_position = i as u32;
        }
        for row in &mut self.rows {
            row.values.remove(index);
        }
        Ok(())
    }

    /// The key column used for write-back and ID extraction: the first
    /// column flagged unique, falling back to a column literally named
    /// `id` (case-insensitive).
    pub fn key_column(&self) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.is_unique)
            .or_else(|| self.columns.iter().find(|c| c.name.eq_ignore_ascii_case("id")))
    }

    /// The ordered primary-key values of all rows not marked deleted.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::NoPrimaryKey`] if the table has neither a
    /// unique-flagged column nor an `id` column.
    pub fn key_ids(&self) -> Result<Vec<DataValue>> {
        let key = self
            .key_column()
            .ok_or_else(|| SyncError::no_primary_key(&self.name))?;
        let index = key.ordinal_position as usize;
        Ok(self
            .rows
            .iter()
            .filter(|r| r.state != RowState::Deleted)
            .filter_map(|r| r.value(index).cloned())
            .collect())
    }

    /// True when any row carries a pending change.
    pub fn has_changes(&self) -> bool {
        self.rows.iter().any(|r| r.state != RowState::Unchanged)
    }

    /// Marks all surviving rows clean and drops rows that were deleted.
    /// Called after a successful write-back.
    pub(crate) fn commit_changes(&mut self) {
        self.rows.retain(|r| r.state != RowState::Deleted);
        for row in &mut self.rows {
            row.set_state(RowState::Unchanged);
        }
    }
}

/// An ordered, name-keyed collection of tables owned by one adapter.
///
/// Names are unique under SQL Server's case-insensitive comparison;
/// inserting under an existing name replaces that table in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSet {
    tables: Vec<Table>,
}

impl TableSet {
    /// Creates an empty table set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tables in the set.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// True when the set holds no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Case-insensitive mutable lookup.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables
            .iter_mut()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// True when a table with the given name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Inserts a table, replacing any existing table of the same name in
    /// place (preserving set order).
    pub fn insert(&mut self, table: Table) {
        if let Some(existing) = self.get_mut(table.name()) {
            *existing = table;
        } else {
            self.tables.push(table);
        }
    }

    /// Removes a table by name; returns whether one existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.tables.len();
        self.tables.retain(|t| !t.name.eq_ignore_ascii_case(name));
        self.tables.len() != before
    }

    /// Clears the whole set.
    pub fn clear(&mut self) {
        self.tables.clear();
    }

    /// Table names in set order.
    pub fn names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Iterates tables in set order.
    pub fn iter(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter()
    }
}
