use crate::error::{QueryError, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Row from a query result
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub columns: HashMap<String, Value>,
}

impl QueryRow {
    pub fn new() -> Self {
        Self {
            columns: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.columns.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.columns.remove(key)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.columns.get(key)
    }

    /// Look a column up ignoring ASCII case.
    pub fn value_ci(&self, key: &str) -> Option<&Value> {
        self.columns.get(key).or_else(|| {
            self.columns
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(key))
                .map(|(_, value)| value)
        })
    }

    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.columns
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.columns
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.columns.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.columns.get(key).and_then(|v| match v {
            Value::String(s) => s.parse().ok(),
            other => other.as_f64(),
        })
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.columns.get(key).and_then(|v| v.as_bool())
    }
}

impl Default for QueryRow {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for QueryRow {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Result of a query
pub type QueryResult = Vec<QueryRow>;

/// Outcome of a statement that returns no rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

/// One column of a live table as reported by `DESCRIBE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    /// Declared type string, e.g. `varchar(255)` or `int unsigned`.
    pub column_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    /// Extra flags, e.g. `auto_increment` or `on update CURRENT_TIMESTAMP`.
    pub extra: String,
}

impl LiveColumn {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            nullable,
            default: None,
            extra: String::new(),
        }
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = extra.into();
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Parse a `DESCRIBE <table>` row (`Field`, `Type`, `Null`, `Default`, `Extra`).
    pub fn from_describe_row(row: &QueryRow) -> Result<Self> {
        let text = |key: &str| -> Option<String> {
            row.value_ci(key).and_then(|v| match v {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
        };

        let name = text("Field")
            .ok_or_else(|| QueryError::Database("DESCRIBE row without Field".to_string()))?;
        let column_type = text("Type")
            .ok_or_else(|| QueryError::Database(format!("DESCRIBE row for {} without Type", name)))?;

        Ok(Self {
            name,
            column_type,
            nullable: text("Null").is_some_and(|n| n.eq_ignore_ascii_case("YES")),
            default: text("Default"),
            extra: text("Extra").unwrap_or_default(),
        })
    }

    pub fn is_auto_update_timestamp(&self) -> bool {
        self.extra
            .to_ascii_lowercase()
            .contains("on update current_timestamp")
    }
}

/// Synchronous SQL executor the engine runs every statement through.
///
/// Only `query` and `execute` are required. The introspection methods issue
/// MySQL-family `SHOW` / `DESCRIBE` statements through `query` by default.
pub trait Executor {
    /// Run a statement that returns rows
    fn query(&mut self, sql: &str, bindings: &[Value]) -> Result<QueryResult>;

    /// Run a statement that returns an affected-row count
    fn execute(&mut self, sql: &str, bindings: &[Value]) -> Result<ExecResult>;

    /// Columns of `table`, or `None` when the table does not exist.
    fn introspect_table(&mut self, table: &str) -> Result<Option<Vec<LiveColumn>>> {
        let tables = self.query("SHOW TABLES LIKE ?", &[Value::String(table.to_string())])?;
        if tables.is_empty() {
            return Ok(None);
        }

        let rows = self.query(&format!("DESCRIBE {}", table), &[])?;
        rows.iter()
            .map(LiveColumn::from_describe_row)
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Foreign-key constraint names declared on `table`.
    fn list_constraints(&mut self, table: &str) -> Result<Vec<String>> {
        let rows = self.query(
            "SELECT CONSTRAINT_NAME FROM information_schema.TABLE_CONSTRAINTS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND CONSTRAINT_TYPE = 'FOREIGN KEY'",
            &[Value::String(table.to_string())],
        )?;

        Ok(rows
            .iter()
            .filter_map(|row| row.value_ci("CONSTRAINT_NAME"))
            .filter_map(|v| v.as_str().map(String::from))
            .collect())
    }

    /// Index names declared on `table`.
    fn list_indexes(&mut self, table: &str) -> Result<Vec<String>> {
        let rows = self.query(&format!("SHOW INDEX FROM {}", table), &[])?;

        let mut names: Vec<String> = Vec::new();
        for name in rows
            .iter()
            .filter_map(|row| row.value_ci("Key_name"))
            .filter_map(|v| v.as_str())
        {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

/// Statements that suspend and restore referential-integrity checks.
pub const DISABLE_FOREIGN_KEYS: &str = "SET FOREIGN_KEY_CHECKS = 0";
pub const ENABLE_FOREIGN_KEYS: &str = "SET FOREIGN_KEY_CHECKS = 1";

/// Run `f` with foreign-key checks disabled.
///
/// Checks are re-enabled whether or not `f` succeeds; an error from `f` wins
/// over an error from the restore statement.
pub fn with_foreign_keys_disabled<T>(
    db: &mut dyn Executor,
    f: impl FnOnce(&mut dyn Executor) -> Result<T>,
) -> Result<T> {
    with_checks_toggled(db, DISABLE_FOREIGN_KEYS, ENABLE_FOREIGN_KEYS, f)
}

pub(crate) fn with_checks_toggled<T>(
    db: &mut dyn Executor,
    disable: &str,
    enable: &str,
    f: impl FnOnce(&mut dyn Executor) -> Result<T>,
) -> Result<T> {
    db.execute(disable, &[])?;

    let result = f(db);
    let restored = db.execute(enable, &[]);

    match result {
        Ok(value) => {
            restored?;
            Ok(value)
        }
        Err(e) => {
            if let Err(restore_err) = restored {
                tracing::error!(error = %restore_err, "failed to re-enable foreign key checks");
            }
            Err(e)
        }
    }
}

/// True for statements that are carried for humans and never executed.
pub fn is_comment(sql: &str) -> bool {
    sql.trim_start().starts_with("--")
}
