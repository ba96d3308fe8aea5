//! Semantic type to SQL Server column type conversion.
//!
//! The forward mapping is the closed table schema reconciliation uses to
//! derive an `ALTER TABLE ... ADD` column type; anything outside it is an
//! [`SyncError::UnsupportedType`] error. The reverse mapping interprets
//! `INFORMATION_SCHEMA` type names when enriching filled tables.

use crate::error::{Result, SyncError};
use crate::models::DataType;

/// Derives the SQL Server column type for a semantic type.
///
/// The mapping is closed: boolean→`bit`, unsigned 8-bit→`tinyint`,
/// signed 8-bit→`smallint` (tinyint is unsigned 0-255), 16-bit→`smallint`,
/// 32-bit→`int`, 64-bit→`bigint`, double→`float`, single→`real`,
/// duration→`timestamp`, date-time→`datetime`, string of length ≤255→
/// `varchar(n)`, longer or unbounded strings→`text`.
///
/// # Errors
///
/// Returns [`SyncError::UnsupportedType`] for any semantic type outside
/// the mapping (binary, uuid, custom, odd integer widths).
pub fn sql_column_type(data_type: &DataType) -> Result<String> {
    let sql_type = match data_type {
        DataType::Boolean => "bit".to_string(),
        DataType::Integer { bits: 8, signed: false } => "tinyint".to_string(),
        // tinyint holds 0-255 only; a signed byte needs the next width up
        DataType::Integer { bits: 8, signed: true } => "smallint".to_string(),
        DataType::Integer { bits: 16, .. } => "smallint".to_string(),
        DataType::Integer { bits: 32, .. } => "int".to_string(),
        DataType::Integer { bits: 64, .. } => "bigint".to_string(),
        DataType::Float { double: true } => "float".to_string(),
        DataType::Float { double: false } => "real".to_string(),
        DataType::Duration => "timestamp".to_string(),
        DataType::DateTime => "datetime".to_string(),
        DataType::String { max_length: Some(n) } if *n <= 255 => format!("varchar({n})"),
        DataType::String { .. } => "text".to_string(),
        other => return Err(SyncError::unsupported_type(other.to_string())),
    };
    Ok(sql_type)
}

/// Maps an `INFORMATION_SCHEMA` / `sys.types` type name back to a
/// semantic type.
///
/// Unknown names map to [`DataType::Custom`] with a warning rather than
/// failing, so a fill against a table with an exotic column still
/// succeeds.
pub fn data_type_from_sql(type_name: &str, max_length: Option<u32>) -> DataType {
    match type_name.to_lowercase().as_str() {
        "bit" => DataType::Boolean,
        "tinyint" => DataType::Integer { bits: 8, signed: false },
        "smallint" => DataType::Integer { bits: 16, signed: true },
        "int" => DataType::Integer { bits: 32, signed: true },
        "bigint" => DataType::Integer { bits: 64, signed: true },
        "real" => DataType::Float { double: false },
        "float" => DataType::Float { double: true },
        // scale information is not carried through; treat exact numerics
        // as doubles the way the fill path does
        "decimal" | "numeric" | "money" | "smallmoney" => DataType::Float { double: true },
        "datetime" | "smalldatetime" | "datetime2" | "date" | "datetimeoffset" => {
            DataType::DateTime
        }
        "time" => DataType::Duration,
        "timestamp" | "rowversion" => DataType::Duration,
        "char" | "nchar" | "varchar" | "nvarchar" => DataType::String { max_length },
        "text" | "ntext" => DataType::String { max_length: None },
        "binary" | "varbinary" | "image" => DataType::Binary { max_length },
        "uniqueidentifier" => DataType::Uuid,
        other => {
            tracing::warn!("unknown SQL Server type '{other}', treating as custom");
            DataType::Custom {
                type_name: other.to_string(),
            }
        }
    }
}
