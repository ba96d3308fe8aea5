//! Shared test doubles: a scripted in-memory SQL client.
//!
//! The scripted client records every statement the adapter issues and
//! answers queries from a queue, so tests can drive the full fill /
//! mutate / write-back cycle without a live server.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tablesync::config::ConnectionProfile;
use tablesync::{Column, DataValue, QueryResult, Result, SqlClient, SqlConnector, SyncError};

/// Recorded statements and scripted answers, shared between the test and
/// the clients the connector hands out.
#[derive(Default)]
pub struct Script {
    /// Every statement issued, prefixed with `query:` or `execute:`.
    pub log: Vec<String>,
    /// Successive answers for `query` calls; empty result when drained.
    pub query_results: VecDeque<QueryResult>,
    /// Scalar answers for `query_scalar` calls.
    pub scalar_results: VecDeque<DataValue>,
    /// Catalog answers for `table_schema`, keyed by lowercase table name.
    pub schemas: HashMap<String, Vec<Column>>,
    /// Rows-affected answer for `execute` calls.
    pub rows_affected: u64,
    /// When set, every query/execute fails with this message.
    pub fail_with: Option<String>,
}

#[derive(Clone, Default)]
pub struct SharedScript(pub Arc<Mutex<Script>>);

#[allow(clippy::unwrap_used)]
impl SharedScript {
    pub fn push_query_result(&self, result: QueryResult) {
        self.0.lock().unwrap().query_results.push_back(result);
    }

    pub fn push_scalar(&self, value: DataValue) {
        self.0.lock().unwrap().scalar_results.push_back(value);
    }

    pub fn set_schema(&self, table: &str, columns: Vec<Column>) {
        self.0
            .lock()
            .unwrap()
            .schemas
            .insert(table.to_lowercase(), columns);
    }

    pub fn log(&self) -> Vec<String> {
        self.0.lock().unwrap().log.clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|l| l.strip_prefix("execute: ").map(str::to_string))
            .collect()
    }
}

pub struct ScriptedClient {
    script: Arc<Mutex<Script>>,
}

#[async_trait]
#[allow(clippy::unwrap_used)]
impl SqlClient for ScriptedClient {
    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let mut script = self.script.lock().unwrap();
        script.log.push(format!("query: {sql}"));
        if let Some(message) = &script.fail_with {
            return Err(SyncError::execution(sql, message.clone()));
        }
        Ok(script.query_results.pop_front().unwrap_or_default())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let mut script = self.script.lock().unwrap();
        script.log.push(format!("execute: {sql}"));
        if let Some(message) = &script.fail_with {
            return Err(SyncError::execution(sql, message.clone()));
        }
        Ok(script.rows_affected)
    }

    async fn query_scalar(&mut self, sql: &str) -> Result<DataValue> {
        let mut script = self.script.lock().unwrap();
        script.log.push(format!("query: {sql}"));
        if let Some(message) = &script.fail_with {
            return Err(SyncError::execution(sql, message.clone()));
        }
        Ok(script
            .scalar_results
            .pop_front()
            .unwrap_or(DataValue::Null))
    }

    async fn table_schema(&mut self, _database: Option<&str>, table: &str) -> Result<Vec<Column>> {
        let script = self.script.lock().unwrap();
        Ok(script
            .schemas
            .get(&table.to_lowercase())
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    pub script: SharedScript,
    pub fail_connect: bool,
}

#[async_trait]
impl SqlConnector for ScriptedConnector {
    async fn connect(&self, _profile: &ConnectionProfile) -> Result<Box<dyn SqlClient>> {
        if self.fail_connect {
            return Err(SyncError::connect_failed(std::io::Error::other(
                "connection refused",
            )))
        }
        Ok(Box::new(ScriptedClient {
            script: Arc::clone(&self.script.0),
        }))
    }
}
