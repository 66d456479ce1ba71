//! PostgreSQL executor
//!
//! Runs loader statements on a sqlx pool. Rows are wrapped and converted
//! column by column on access, probing the column's type name.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row, TypeInfo, ValueRef};

use crate::error::{LoadError, LoadResult};
use crate::executor::{DatabaseRow, Statement, StatementExecutor};
use crate::value::DatabaseValue;

/// SQLSTATE codes surfaced as concurrency failures
const LOCK_NOT_AVAILABLE: &str = "55P03";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// Executes loader statements on a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgStatementExecutor {
    pool: Arc<PgPool>,
}

impl PgStatementExecutor {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Connect a pool of at most `max_connections`
    pub async fn connect(database_url: &str, max_connections: u32) -> LoadResult<Self> {
        if !database_url.starts_with("postgresql://") && !database_url.starts_with("postgres://") {
            return Err(LoadError::Configuration(
                "Invalid PostgreSQL URL scheme".to_string(),
            ));
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| LoadError::Database(format!("Failed to create PostgreSQL pool: {}", e)))?;
        Ok(Self::new(Arc::new(pool)))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StatementExecutor for PgStatementExecutor {
    async fn fetch_all(&self, statement: &Statement) -> LoadResult<Vec<Box<dyn DatabaseRow>>> {
        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = bind_database_value(query, param)?;
        }

        let fetch = query.fetch_all(&*self.pool);
        let rows = match statement.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fetch).await.map_err(|_| {
                LoadError::Database(format!("Statement timed out after {:?}", timeout))
            })?,
            None => fetch.await,
        }
        .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|row| Box::new(PgResultRow::new(row)) as Box<dyn DatabaseRow>)
            .collect())
    }
}

/// Lock and serialization failures become retryable concurrency failures
fn map_sqlx_error(err: sqlx::Error) -> LoadError {
    if let sqlx::Error::Database(db) = &err {
        if let Some(code) = db.code() {
            if matches!(
                code.as_ref(),
                LOCK_NOT_AVAILABLE | SERIALIZATION_FAILURE | DEADLOCK_DETECTED
            ) {
                tracing::warn!("Statement failed with SQLSTATE {}: {}", code, db.message());
                return LoadError::lock_unavailable(db.message().to_string());
            }
        }
    }
    LoadError::Database(format!("Query fetch failed: {}", err))
}

/// Result row of a PostgreSQL statement
pub struct PgResultRow {
    row: PgRow,
}

impl PgResultRow {
    pub fn new(row: PgRow) -> Self {
        Self { row }
    }
}

impl DatabaseRow for PgResultRow {
    fn get_by_index(&self, index: usize) -> LoadResult<DatabaseValue> {
        if index >= self.row.len() {
            return Err(LoadError::Column(format!(
                "Column index {} out of range ({} columns)",
                index,
                self.row.len()
            )));
        }
        postgres_value_to_database_value(&self.row, index)
    }

    fn column_count(&self) -> usize {
        self.row.len()
    }

    fn column_names(&self) -> Vec<String> {
        self.row
            .columns()
            .iter()
            .map(|col| col.name().to_string())
            .collect()
    }
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'a>(
    query: Query<'a, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> LoadResult<Query<'a, Postgres, PgArguments>> {
    match value {
        DatabaseValue::Null => Ok(query.bind(Option::<String>::None)),
        DatabaseValue::Bool(b) => Ok(query.bind(*b)),
        DatabaseValue::Int32(i) => Ok(query.bind(*i)),
        DatabaseValue::Int64(i) => Ok(query.bind(*i)),
        DatabaseValue::Float32(f) => Ok(query.bind(*f)),
        DatabaseValue::Float64(f) => Ok(query.bind(*f)),
        DatabaseValue::String(s) => Ok(query.bind(s.clone())),
        DatabaseValue::Bytes(b) => Ok(query.bind(b.clone())),
        DatabaseValue::Uuid(u) => Ok(query.bind(*u)),
        DatabaseValue::DateTime(dt) => Ok(query.bind(*dt)),
        DatabaseValue::Date(d) => Ok(query.bind(*d)),
        DatabaseValue::Time(t) => Ok(query.bind(*t)),
        DatabaseValue::Json(j) => Ok(query.bind(j.clone())),
        DatabaseValue::Array(_) => Err(LoadError::Configuration(
            "Array parameters cannot be bound to a loader statement".to_string(),
        )),
    }
}

fn column_error(kind: &str, index: usize, err: sqlx::Error) -> LoadError {
    LoadError::Column(format!("Failed to get {} value at {}: {}", kind, index, err))
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> LoadResult<DatabaseValue> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| column_error("raw", index, e))?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }
    let type_name = row.columns()[index].type_info().name().to_string();

    let value = match type_name.as_str() {
        "BOOL" => DatabaseValue::Bool(row.try_get(index).map_err(|e| column_error("bool", index, e))?),
        "INT2" => {
            let value: i16 = row.try_get(index).map_err(|e| column_error("int16", index, e))?;
            DatabaseValue::Int32(value as i32)
        }
        "INT4" => DatabaseValue::Int32(row.try_get(index).map_err(|e| column_error("int32", index, e))?),
        "INT8" => DatabaseValue::Int64(row.try_get(index).map_err(|e| column_error("int64", index, e))?),
        "FLOAT4" => {
            DatabaseValue::Float32(row.try_get(index).map_err(|e| column_error("float32", index, e))?)
        }
        "FLOAT8" => {
            DatabaseValue::Float64(row.try_get(index).map_err(|e| column_error("float64", index, e))?)
        }
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            DatabaseValue::String(row.try_get(index).map_err(|e| column_error("string", index, e))?)
        }
        "BYTEA" => DatabaseValue::Bytes(row.try_get(index).map_err(|e| column_error("bytes", index, e))?),
        "UUID" => DatabaseValue::Uuid(row.try_get(index).map_err(|e| column_error("UUID", index, e))?),
        "TIMESTAMPTZ" => {
            DatabaseValue::DateTime(row.try_get(index).map_err(|e| column_error("datetime", index, e))?)
        }
        "TIMESTAMP" => {
            let value: chrono::NaiveDateTime =
                row.try_get(index).map_err(|e| column_error("timestamp", index, e))?;
            DatabaseValue::DateTime(value.and_utc())
        }
        "DATE" => DatabaseValue::Date(row.try_get(index).map_err(|e| column_error("date", index, e))?),
        "TIME" => DatabaseValue::Time(row.try_get(index).map_err(|e| column_error("time", index, e))?),
        "JSON" | "JSONB" => {
            let value: JsonValue = row.try_get(index).map_err(|e| column_error("JSON", index, e))?;
            DatabaseValue::Json(value)
        }
        other => {
            // Unknown types are read as text
            let value: String = row.try_get(index).map_err(|e| {
                LoadError::Column(format!(
                    "Failed to get value as string for unknown type '{}': {}",
                    other, e
                ))
            })?;
            DatabaseValue::String(value)
        }
    };
    Ok(value)
}
