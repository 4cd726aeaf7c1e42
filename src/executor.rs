//! Query execution boundary
//!
//! The engine never executes SQL itself; it hands a parameterized
//! statement to a `QueryExecutor`. The Postgres implementation binds
//! positional parameters through sqlx and decodes rows into JSON maps.
//! `MockExecutor` serves tests and offline runs.

use crate::error::{EngineError, Result};
use crate::term_index::ScalarValue;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Column, PgPool, Row as SqlxRow};
use std::collections::HashMap;
use tracing::debug;

pub type Row = HashMap<String, serde_json::Value>;

/// Read-only execution capability provided by the storage engine.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str, parameters: &[ScalarValue]) -> Result<Vec<Row>>;
}

/// Postgres-backed executor.
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|e| EngineError::Execution(format!("connect failed: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    async fn execute(&self, sql: &str, parameters: &[ScalarValue]) -> Result<Vec<Row>> {
        let mut query = sqlx::query(sql);
        for param in parameters {
            query = match param {
                ScalarValue::Text(s) => query.bind(s.clone()),
                ScalarValue::Number(n) => query.bind(*n),
                ScalarValue::Integer(i) => query.bind(*i),
                ScalarValue::Date(d) => query.bind(*d),
            };
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::Execution(format!("query failed: {}", e)))?;

        debug!("Executed query, {} rows", rows.len());

        Ok(rows.iter().map(decode_row).collect())
    }
}

/// Decode a Postgres row into a JSON map, trying common column types in
/// order and falling back to null for anything undecodable.
fn decode_row(row: &sqlx::postgres::PgRow) -> Row {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            v.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<sqlx::types::BigDecimal>, _>(idx) {
            // NUMERIC columns and un-cast aggregates
            v.and_then(|d| d.to_string().parse::<f64>().ok())
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            v.map(|d| serde_json::Value::from(d.to_string()))
                .unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::Null
        };
        out.insert(column.name().to_string(), value);
    }
    out
}

/// Canned executor for tests and dry runs.
#[derive(Default)]
pub struct MockExecutor {
    rows: Vec<Row>,
    fail_with: Option<String>,
    delay_ms: u64,
}

impl MockExecutor {
    pub fn returning(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Default::default()
        }
    }

    /// Executor that stalls; used to exercise the timeout path.
    pub fn stalling(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Default::default()
        }
    }
}

#[async_trait]
impl QueryExecutor for MockExecutor {
    async fn execute(&self, _sql: &str, _parameters: &[ScalarValue]) -> Result<Vec<Row>> {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if let Some(message) = &self.fail_with {
            return Err(EngineError::Execution(message.clone()));
        }
        Ok(self.rows.clone())
    }
}
