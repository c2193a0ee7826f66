//! In-memory executor for tests and demos.
//!
//! `MockExecutor` records every statement it is handed, replays scripted
//! result sets in FIFO order and serves a scripted live schema.

use crate::backend::{ExecResult, Executor, LiveColumn, QueryResult, QueryRow};
use crate::error::{QueryError, Result};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// A statement as the engine issued it
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub bindings: Vec<Value>,
}

impl Statement {
    pub fn is_select(&self) -> bool {
        self.sql.trim_start().to_ascii_uppercase().starts_with("SELECT")
    }
}

/// Failure to raise for statements containing a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    DuplicateKey,
    Database,
}

#[derive(Debug, Default)]
pub struct MockExecutor {
    statements: Vec<Statement>,
    responses: VecDeque<QueryResult>,
    tables: HashMap<String, Vec<LiveColumn>>,
    constraints: HashMap<String, Vec<String>>,
    indexes: HashMap<String, Vec<String>>,
    failures: Vec<(String, MockFailure)>,
    next_insert_id: u64,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            next_insert_id: 1,
            ..Default::default()
        }
    }

    /// Queue the result set for the next `query` call.
    pub fn push_rows(&mut self, rows: QueryResult) -> &mut Self {
        self.responses.push_back(rows);
        self
    }

    /// Queue a result set built from JSON objects.
    pub fn push_json(&mut self, rows: Vec<Value>) -> &mut Self {
        let rows = rows
            .into_iter()
            .map(|row| match row {
                Value::Object(map) => map.into_iter().collect::<QueryRow>(),
                _ => QueryRow::new(),
            })
            .collect();
        self.push_rows(rows)
    }

    pub fn set_table(&mut self, table: &str, columns: Vec<LiveColumn>) -> &mut Self {
        self.tables.insert(table.to_string(), columns);
        self
    }

    pub fn set_constraints(&mut self, table: &str, names: &[&str]) -> &mut Self {
        self.constraints
            .insert(table.to_string(), names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn set_indexes(&mut self, table: &str, names: &[&str]) -> &mut Self {
        self.indexes
            .insert(table.to_string(), names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Make every statement containing `pattern` fail.
    pub fn fail_on(&mut self, pattern: &str, failure: MockFailure) -> &mut Self {
        self.failures.push((pattern.to_string(), failure));
        self
    }

    pub fn set_next_insert_id(&mut self, id: u64) -> &mut Self {
        self.next_insert_id = id;
        self
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Statements that read rows
    pub fn selects(&self) -> Vec<&Statement> {
        self.statements.iter().filter(|s| s.is_select()).collect()
    }

    /// Statements that do not read rows
    pub fn writes(&self) -> Vec<&Statement> {
        self.statements.iter().filter(|s| !s.is_select()).collect()
    }

    pub fn clear_statements(&mut self) {
        self.statements.clear();
    }

    fn record(&mut self, sql: &str, bindings: &[Value]) -> Result<()> {
        self.statements.push(Statement {
            sql: sql.to_string(),
            bindings: bindings.to_vec(),
        });

        match self
            .failures
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
        {
            Some((_, MockFailure::DuplicateKey)) => Err(QueryError::DuplicateKey(format!(
                "duplicate entry for statement: {}",
                sql
            ))),
            Some((_, MockFailure::Database)) => {
                Err(QueryError::Database(format!("statement failed: {}", sql)))
            }
            None => Ok(()),
        }
    }
}

impl Executor for MockExecutor {
    fn query(&mut self, sql: &str, bindings: &[Value]) -> Result<QueryResult> {
        self.record(sql, bindings)?;
        Ok(self.responses.pop_front().unwrap_or_default())
    }

    fn execute(&mut self, sql: &str, bindings: &[Value]) -> Result<ExecResult> {
        self.record(sql, bindings)?;

        let last_insert_id = if sql.trim_start().to_ascii_uppercase().starts_with("INSERT") {
            let id = self.next_insert_id;
            self.next_insert_id += 1;
            Some(id)
        } else {
            None
        };

        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id,
        })
    }

    fn introspect_table(&mut self, table: &str) -> Result<Option<Vec<LiveColumn>>> {
        Ok(self.tables.get(table).cloned())
    }

    fn list_constraints(&mut self, table: &str) -> Result<Vec<String>> {
        Ok(self.constraints.get(table).cloned().unwrap_or_default())
    }

    fn list_indexes(&mut self, table: &str) -> Result<Vec<String>> {
        Ok(self.indexes.get(table).cloned().unwrap_or_default())
    }
}
