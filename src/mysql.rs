use crate::backend::{ExecResult, Executor, QueryResult, QueryRow};
use crate::error::Result;
use serde_json::Value;
use sqlx::mysql::{MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlQueryResult, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, MySql, Row};
use tokio::runtime::Runtime;

/// Blocking executor over an sqlx MySQL pool.
///
/// The pool holds one connection so session settings such as
/// `FOREIGN_KEY_CHECKS` stay in effect for the statements that follow them.
pub struct MySqlBackend {
    runtime: Runtime,
    pool: MySqlPool,
}

impl MySqlBackend {
    pub fn connect(url: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let pool = runtime.block_on(MySqlPoolOptions::new().max_connections(1).connect(url))?;
        tracing::debug!("connected mysql backend");

        Ok(Self { runtime, pool })
    }

    pub fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    pub fn close(self) {
        self.runtime.block_on(self.pool.close());
    }

    fn bind<'q>(query: Query<'q, MySql, MySqlArguments>, value: &Value) -> Query<'q, MySql, MySqlArguments> {
        match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else if let Some(u) = n.as_u64() {
                    query.bind(u)
                } else {
                    query.bind(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        }
    }

    fn prepare<'q>(sql: &'q str, bindings: &[Value]) -> Query<'q, MySql, MySqlArguments> {
        bindings
            .iter()
            .fold(sqlx::query(sql), |query, value| Self::bind(query, value))
    }

    fn decode(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(value) = row.try_get::<Option<i64>, _>(idx) {
            return value.map(Value::from).unwrap_or(Value::Null);
        }
        if let Ok(value) = row.try_get::<Option<u64>, _>(idx) {
            return value.map(Value::from).unwrap_or(Value::Null);
        }
        if let Ok(value) = row.try_get::<Option<f64>, _>(idx) {
            return value
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null);
        }
        if let Ok(value) = row.try_get::<Option<String>, _>(idx) {
            return value.map(Value::String).unwrap_or(Value::Null);
        }
        if let Ok(value) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return value
                .map(|v| Value::String(v.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(value) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return value
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(value) = row.try_get::<Option<bool>, _>(idx) {
            return value.map(Value::Bool).unwrap_or(Value::Null);
        }
        // SHOW / DESCRIBE output arrives as binary strings on some servers
        if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return value
                .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
                .unwrap_or(Value::Null);
        }
        Value::Null
    }

    /// Convert MySQL row to QueryRow
    fn convert_row(row: &MySqlRow) -> QueryRow {
        row.columns()
            .iter()
            .map(|column| (column.name().to_string(), Self::decode(row, column.ordinal())))
            .collect()
    }

    fn exec_result(result: MySqlQueryResult) -> ExecResult {
        let id = result.last_insert_id();
        ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: (id > 0).then_some(id),
        }
    }
}

impl Executor for MySqlBackend {
    fn query(&mut self, sql: &str, bindings: &[Value]) -> Result<QueryResult> {
        // statements without bindings take the text protocol; SHOW and DESCRIBE need it
        let rows = if bindings.is_empty() {
            self.runtime.block_on(sqlx::raw_sql(sql).fetch_all(&self.pool))?
        } else {
            self.runtime
                .block_on(Self::prepare(sql, bindings).fetch_all(&self.pool))?
        };

        Ok(rows.iter().map(Self::convert_row).collect())
    }

    fn execute(&mut self, sql: &str, bindings: &[Value]) -> Result<ExecResult> {
        let result = if bindings.is_empty() {
            self.runtime.block_on(sqlx::raw_sql(sql).execute(&self.pool))?
        } else {
            self.runtime
                .block_on(Self::prepare(sql, bindings).execute(&self.pool))?
        };

        Ok(Self::exec_result(result))
    }
}
