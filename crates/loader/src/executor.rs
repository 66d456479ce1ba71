//! Statement execution boundary
//!
//! The loader renders statements and hands them to a [`StatementExecutor`];
//! connection handling and transactions stay on the other side.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{LoadError, LoadResult};
use crate::lock::LockMode;
use crate::value::DatabaseValue;

/// A rendered SELECT with its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<DatabaseValue>,
    /// Passed through to the executor; not enforced by the loader
    pub timeout: Option<Duration>,
    /// Lock the statement acquires, for executors that map lock errors
    pub lock_mode: LockMode,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<DatabaseValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
            timeout: None,
            lock_mode: LockMode::None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }
}

/// Executes statements issued by the loader
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    /// Execute a query and return the result rows
    async fn fetch_all(&self, statement: &Statement) -> LoadResult<Vec<Box<dyn DatabaseRow>>>;
}

/// Positional access to a result row
pub trait DatabaseRow: Send + Sync {
    /// Get a column value by index
    fn get_by_index(&self, index: usize) -> LoadResult<DatabaseValue>;

    /// Get column count
    fn column_count(&self) -> usize;

    /// Get column names
    fn column_names(&self) -> Vec<String>;

    /// Get a column value by name
    fn get_by_name(&self, name: &str) -> LoadResult<DatabaseValue> {
        let index = self
            .column_names()
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| LoadError::Column(format!("Column '{}' not found", name)))?;
        self.get_by_index(index)
    }

    /// Convert row to JSON object keyed by column name
    fn to_json(&self) -> LoadResult<JsonValue> {
        let mut map = serde_json::Map::new();
        for (index, name) in self.column_names().into_iter().enumerate() {
            map.insert(name, self.get_by_index(index)?.to_json());
        }
        Ok(JsonValue::Object(map))
    }
}

/// Owned row, used by backends that convert eagerly and by tests
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleRow {
    columns: Vec<String>,
    values: Vec<DatabaseValue>,
}

impl SimpleRow {
    pub fn new(columns: Vec<String>, values: Vec<DatabaseValue>) -> LoadResult<Self> {
        if columns.len() != values.len() {
            return Err(LoadError::Column(format!(
                "row has {} column name(s) but {} value(s)",
                columns.len(),
                values.len()
            )));
        }
        Ok(Self { columns, values })
    }

    /// Row built from `(name, value)` pairs in order
    pub fn from_pairs<I, S, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<DatabaseValue>,
    {
        let (columns, values) = pairs
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .unzip();
        Self { columns, values }
    }

    pub fn to_map(&self) -> HashMap<String, DatabaseValue> {
        self.columns
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

impl DatabaseRow for SimpleRow {
    fn get_by_index(&self, index: usize) -> LoadResult<DatabaseValue> {
        self.values.get(index).cloned().ok_or_else(|| {
            LoadError::Column(format!(
                "Column index {} out of range ({} columns)",
                index,
                self.values.len()
            ))
        })
    }

    fn column_count(&self) -> usize {
        self.values.len()
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.clone()
    }
}
