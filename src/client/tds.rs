//! TDS (SQL Server) client implementation on tiberius.
//!
//! Wraps a single `tiberius::Client` over a tokio `TcpStream`. Cell
//! values are converted from the wire representation into [`DataValue`]s;
//! date and time payloads are decoded from their raw TDS encodings.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use tiberius::{Client, ColumnData, ColumnType, Config};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::client::{QueryResult, SqlClient, SqlConnector};
use crate::config::ConnectionProfile;
use crate::error::{Result, SyncError};
use crate::models::{Column, DataType, DataValue};
use crate::typemap::data_type_from_sql;

/// Connector producing [`TdsClient`] connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TdsConnector;

#[async_trait]
impl SqlConnector for TdsConnector {
    async fn connect(&self, profile: &ConnectionProfile) -> Result<Box<dyn SqlClient>> {
        let config = Config::from_ado_string(&profile.connection_string)
            .map_err(|e| SyncError::configuration(format!("invalid connection string: {e}")))?;

        let tcp = tokio::time::timeout(
            profile.connect_timeout,
            TcpStream::connect(config.get_addr()),
        )
        .await
        .map_err(SyncError::connect_failed)?
        .map_err(SyncError::connect_failed)?;
        tcp.set_nodelay(true).map_err(SyncError::connect_failed)?;

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(SyncError::connect_failed)?;

        tracing::debug!(database = %profile.database, "opened TDS connection");
        Ok(Box::new(TdsClient {
            client,
            command_timeout: profile.command_timeout,
        }))
    }
}

/// A live SQL Server connection.
pub struct TdsClient {
    client: Client<Compat<TcpStream>>,
    command_timeout: std::time::Duration,
}

#[async_trait]
impl SqlClient for TdsClient {
    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let mut stream = tokio::time::timeout(self.command_timeout, self.client.simple_query(sql))
            .await
            .map_err(|e| SyncError::execution_source(sql, e))?
            .map_err(|e| SyncError::execution_source(sql, e))?;

        let columns = {
            let meta = stream
                .columns()
                .await
                .map_err(|e| SyncError::execution_source(sql, e))?;
            meta.map(|cols| {
                cols.iter()
                    .enumerate()
                    .map(|(i, c)| column_from_meta(i, c))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
        };

        let raw_rows = stream
            .into_first_result()
            .await
            .map_err(|e| SyncError::execution_source(sql, e))?;

        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            let mut values = Vec::with_capacity(columns.len());
            for data in raw {
                values.push(cell_value(data, sql)?);
            }
            rows.push(values);
        }

        Ok(QueryResult { columns, rows })
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let result = tokio::time::timeout(self.command_timeout, self.client.execute(sql, &[]))
            .await
            .map_err(|e| SyncError::execution_source(sql, e))?
            .map_err(|e| SyncError::execution_source(sql, e))?;
        Ok(result.total())
    }

    async fn table_schema(&mut self, database: Option<&str>, table: &str) -> Result<Vec<Column>> {
        let prefix = database.map_or_else(String::new, |db| format!("{db}."));
        let object = database.map_or_else(
            || format!("dbo.{table}"),
            |db| format!("{db}.dbo.{table}"),
        );
        let table_literal = table.replace('\'', "''");
        let object_literal = object.replace('\'', "''");

        let sql = format!(
            "SELECT c.COLUMN_NAME, c.DATA_TYPE, c.CHARACTER_MAXIMUM_LENGTH, c.IS_NULLABLE, \
                    COLUMNPROPERTY(OBJECT_ID('{object_literal}'), c.COLUMN_NAME, 'IsIdentity') AS IS_IDENTITY, \
                    CASE WHEN kcu.COLUMN_NAME IS NULL THEN 0 ELSE 1 END AS IS_KEY \
             FROM {prefix}INFORMATION_SCHEMA.COLUMNS c \
             LEFT JOIN {prefix}INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
                    ON tc.TABLE_SCHEMA = c.TABLE_SCHEMA \
                   AND tc.TABLE_NAME = c.TABLE_NAME \
                   AND tc.CONSTRAINT_TYPE = 'PRIMARY KEY' \
             LEFT JOIN {prefix}INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
                    ON kcu.CONSTRAINT_NAME = tc.CONSTRAINT_NAME \
                   AND kcu.TABLE_SCHEMA = c.TABLE_SCHEMA \
                   AND kcu.TABLE_NAME = c.TABLE_NAME \
                   AND kcu.COLUMN_NAME = c.COLUMN_NAME \
             WHERE c.TABLE_SCHEMA = 'dbo' AND c.TABLE_NAME = '{table_literal}' \
             ORDER BY c.ORDINAL_POSITION"
        );

        let result = self.query(&sql).await?;
        let mut columns = Vec::with_capacity(result.rows.len());
        for (ordinal, row) in result.rows.into_iter().enumerate() {
            columns.push(schema_column(ordinal, &row, &sql)?);
        }
        Ok(columns)
    }
}

/// Builds a column descriptor from one `INFORMATION_SCHEMA` row.
fn schema_column(ordinal: usize, row: &[DataValue], sql: &str) -> Result<Column> {
    let name = match row.first() {
        Some(DataValue::String(s)) => s.clone(),
        _ => return Err(SyncError::execution(sql, "malformed schema row: COLUMN_NAME")),
    };
    let type_name = match row.get(1) {
        Some(DataValue::String(s)) => s.clone(),
        _ => return Err(SyncError::execution(sql, "malformed schema row: DATA_TYPE")),
    };
    // CHARACTER_MAXIMUM_LENGTH is -1 for (max) types
    let max_length = match row.get(2) {
        Some(DataValue::Int(n)) if *n > 0 => Some(*n as u32),
        Some(DataValue::BigInt(n)) if *n > 0 => Some(*n as u32),
        _ => None,
    };
    let is_nullable = matches!(row.get(3), Some(DataValue::String(s)) if s == "YES");
    let is_identity = matches!(
        row.get(4),
        Some(DataValue::Int(1) | DataValue::BigInt(1) | DataValue::TinyInt(1))
    );
    let is_key = matches!(
        row.get(5),
        Some(DataValue::Int(1) | DataValue::BigInt(1) | DataValue::TinyInt(1))
    );

    Ok(Column {
        name,
        data_type: data_type_from_sql(&type_name, max_length),
        is_nullable,
        is_unique: is_key,
        is_auto_increment: is_identity,
        ordinal_position: ordinal as u32,
    })
}

/// Maps result-set metadata to a column descriptor. Key and identity
/// flags are not part of the wire metadata; the adapter enriches them
/// from [`SqlClient::table_schema`] when it can name the table.
fn column_from_meta(ordinal: usize, column: &tiberius::Column) -> Column {
    Column {
        name: column.name().to_string(),
        data_type: data_type_from_wire(column.column_type()),
        is_nullable: true,
        is_unique: false,
        is_auto_increment: false,
        ordinal_position: ordinal as u32,
    }
}

fn data_type_from_wire(column_type: ColumnType) -> DataType {
    use ColumnType as CT;
    match column_type {
        CT::Bit | CT::Bitn => DataType::Boolean,
        CT::Int1 => DataType::Integer { bits: 8, signed: false },
        CT::Int2 => DataType::Integer { bits: 16, signed: true },
        CT::Int4 => DataType::Integer { bits: 32, signed: true },
        // Intn collapses all widths; the payload still carries the width
        CT::Int8 | CT::Intn => DataType::Integer { bits: 64, signed: true },
        CT::Float4 => DataType::Float { double: false },
        CT::Float8 | CT::Floatn => DataType::Float { double: true },
        CT::Numericn | CT::Decimaln | CT::Money | CT::Money4 => DataType::Float { double: true },
        CT::Datetime | CT::Datetime4 | CT::Datetimen | CT::Daten | CT::Datetime2
        | CT::DatetimeOffsetn => DataType::DateTime,
        CT::Timen => DataType::Duration,
        CT::Guid => DataType::Uuid,
        CT::BigVarBin | CT::BigBinary | CT::Image => DataType::Binary { max_length: None },
        CT::BigVarChar | CT::BigChar | CT::NVarchar | CT::NChar | CT::Text | CT::NText => {
            DataType::String { max_length: None }
        }
        CT::Xml => DataType::Custom { type_name: "xml".to_string() },
        other => DataType::Custom { type_name: format!("{other:?}").to_lowercase() },
    }
}

/// Converts one wire cell into a [`DataValue`].
fn cell_value(data: ColumnData<'_>, sql: &str) -> Result<DataValue> {
    let value = match data {
        ColumnData::Bit(v) => v.map_or(DataValue::Null, DataValue::Bool),
        ColumnData::U8(v) => v.map_or(DataValue::Null, DataValue::TinyInt),
        ColumnData::I16(v) => v.map_or(DataValue::Null, DataValue::SmallInt),
        ColumnData::I32(v) => v.map_or(DataValue::Null, DataValue::Int),
        ColumnData::I64(v) => v.map_or(DataValue::Null, DataValue::BigInt),
        ColumnData::F32(v) => v.map_or(DataValue::Null, DataValue::Real),
        ColumnData::F64(v) => v.map_or(DataValue::Null, DataValue::Float),
        ColumnData::String(v) => {
            v.map_or(DataValue::Null, |s| DataValue::String(s.into_owned()))
        }
        ColumnData::Guid(v) => v.map_or(DataValue::Null, DataValue::Uuid),
        ColumnData::Binary(v) => {
            v.map_or(DataValue::Null, |b| DataValue::Binary(b.into_owned()))
        }
        ColumnData::Numeric(v) => v.map_or(DataValue::Null, |n| {
            DataValue::Float(n.value() as f64 / 10f64.powi(i32::from(n.scale())))
        }),
        ColumnData::Xml(v) => {
            v.map_or(DataValue::Null, |x| DataValue::String(x.as_ref().to_string()))
        }
        ColumnData::DateTime(v) => match v {
            None => DataValue::Null,
            Some(dt) => DataValue::DateTime(decode_datetime(
                i64::from(dt.days()),
                (i64::from(dt.seconds_fragments()) * 1000) / 300,
                sql,
            )?),
        },
        ColumnData::SmallDateTime(v) => match v {
            None => DataValue::Null,
            // the fragment count of a smalldatetime is minutes
            Some(dt) => DataValue::DateTime(decode_datetime(
                i64::from(dt.days()),
                i64::from(dt.seconds_fragments()) * 60 * 1000,
                sql,
            )?),
        },
        ColumnData::Date(v) => match v {
            None => DataValue::Null,
            Some(d) => DataValue::DateTime(decode_date(d.days(), sql)?),
        },
        ColumnData::Time(v) => match v {
            None => DataValue::Null,
            Some(t) => DataValue::Duration(time_to_millis(t.increments(), t.scale())),
        },
        ColumnData::DateTime2(v) => match v {
            None => DataValue::Null,
            Some(dt2) => {
                let date = decode_date(dt2.date().days(), sql)?;
                let millis = time_to_millis(dt2.time().increments(), dt2.time().scale());
                let value = date
                    .checked_add_signed(TimeDelta::try_milliseconds(millis).unwrap_or_default())
                    .ok_or_else(|| SyncError::execution(sql, "datetime2 out of range"))?;
                DataValue::DateTime(value)
            }
        },
        ColumnData::DateTimeOffset(v) => match v {
            None => DataValue::Null,
            // stored as UTC plus an offset; the UTC instant is kept
            Some(dto) => {
                let dt2 = dto.datetime2();
                let date = decode_date(dt2.date().days(), sql)?;
                let millis = time_to_millis(dt2.time().increments(), dt2.time().scale());
                let value = date
                    .checked_add_signed(TimeDelta::try_milliseconds(millis).unwrap_or_default())
                    .ok_or_else(|| SyncError::execution(sql, "datetimeoffset out of range"))?;
                DataValue::DateTime(value)
            }
        },
    };
    Ok(value)
}

/// 1900-01-01 00:00:00, the epoch of the datetime/smalldatetime wire
/// encodings.
fn tds_epoch(sql: &str) -> Result<NaiveDateTime> {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| SyncError::execution(sql, "invalid TDS epoch"))
}

fn decode_datetime(days: i64, millis: i64, sql: &str) -> Result<NaiveDateTime> {
    tds_epoch(sql)?
        .checked_add_signed(TimeDelta::try_days(days).unwrap_or_default())
        .and_then(|d| {
            d.checked_add_signed(TimeDelta::try_milliseconds(millis).unwrap_or_default())
        })
        .ok_or_else(|| SyncError::execution(sql, "datetime out of range"))
}

/// Days since 0001-01-01 (the date/datetime2 wire encoding).
fn decode_date(days: u32, sql: &str) -> Result<NaiveDateTime> {
    NaiveDate::from_num_days_from_ce_opt(days as i32 + 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| SyncError::execution(sql, "date out of range"))
}

fn time_to_millis(increments: u64, scale: u8) -> i64 {
    let divisor = 10u64.pow(u32::from(scale));
    if divisor == 0 {
        return 0;
    }
    ((increments * 1000) / divisor) as i64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_datetime_epoch() {
        let dt = decode_datetime(0, 0, "SELECT 1").unwrap();
        assert_eq!(dt.to_string(), "1900-01-01 00:00:00");
    }

    #[test]
    fn test_decode_datetime_with_fragments() {
        // 2 days and 1.5 seconds past the epoch
        let dt = decode_datetime(2, 1500, "SELECT 1").unwrap();
        assert_eq!(dt.to_string(), "1900-01-03 00:00:01.500");
    }

    #[test]
    fn test_decode_date_day_zero_is_year_one() {
        let dt = decode_date(0, "SELECT 1").unwrap();
        assert_eq!(dt.to_string(), "0001-01-01 00:00:00");
    }

    #[test]
    fn test_time_to_millis_scales() {
        // scale 7: 10_000_000 increments per second
        assert_eq!(time_to_millis(10_000_000, 7), 1000);
        // scale 0: whole seconds
        assert_eq!(time_to_millis(90, 0), 90_000);
    }

    #[test]
    fn test_wire_type_mapping() {
        assert_eq!(data_type_from_wire(ColumnType::Int4), DataType::Integer { bits: 32, signed: true });
        assert_eq!(data_type_from_wire(ColumnType::Bitn), DataType::Boolean);
        assert_eq!(
            data_type_from_wire(ColumnType::NVarchar),
            DataType::String { max_length: None }
        );
        assert_eq!(data_type_from_wire(ColumnType::Timen), DataType::Duration);
    }
}
