//! Migration artifacts.
//!
//! A migration is a JSON file `<YYYYMMDDHHMMSS>_<name>.json` holding ordered
//! `up` and `down` statement lists. `MigrationWriter` produces them, deriving
//! `down` through a `ReverseStrategy` when none is given. `Migrator` applies
//! pending artifacts in batches and records them in a ledger table.

use crate::backend::{
    is_comment, with_checks_toggled, Executor, QueryRow, DISABLE_FOREIGN_KEYS, ENABLE_FOREIGN_KEYS,
};
use crate::error::{QueryError, Result};
use crate::naming;
use crate::schema::{create_table_sql, ColumnDef, ColumnType};
use crate::sync::SyncPlan;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref CREATE_TABLE: Regex =
        Regex::new(r"(?i)^\s*CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?`?(\w+)`?").unwrap();
    static ref ADD_COLUMN: Regex =
        Regex::new(r"(?i)^\s*ALTER\s+TABLE\s+`?(\w+)`?\s+ADD\s+COLUMN\s+`?(\w+)`?").unwrap();
    static ref ADD_CONSTRAINT: Regex = Regex::new(
        r"(?i)^\s*ALTER\s+TABLE\s+`?(\w+)`?\s+ADD\s+CONSTRAINT\s+`?(\w+)`?\s+FOREIGN\s+KEY"
    )
    .unwrap();
    static ref ADD_UNIQUE_INDEX: Regex =
        Regex::new(r"(?i)^\s*ALTER\s+TABLE\s+`?(\w+)`?\s+ADD\s+UNIQUE\s+(?:INDEX|KEY)\s+`?(\w+)`?")
            .unwrap();
}

const PREFIX_LEN: usize = 14;

/// Where artifacts live and which table records them
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub directory: PathBuf,
    pub ledger_table: String,
    /// Statements bracketing every `up` / `down` run, as in `SyncConfig`
    pub disable_foreign_keys: String,
    pub enable_foreign_keys: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("migrations"),
            ledger_table: "migrations".to_string(),
            disable_foreign_keys: DISABLE_FOREIGN_KEYS.to_string(),
            enable_foreign_keys: ENABLE_FOREIGN_KEYS.to_string(),
        }
    }
}

impl MigrationConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// One persisted migration artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub name: String,
    pub up: Vec<String>,
    pub down: Vec<String>,
}

impl Migration {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            QueryError::Migration(format!("malformed artifact {}: {}", path.display(), e))
        })
    }

    pub fn up(&self, db: &mut dyn Executor) -> Result<usize> {
        run_statements(db, &self.up, DISABLE_FOREIGN_KEYS, ENABLE_FOREIGN_KEYS)
    }

    pub fn down(&self, db: &mut dyn Executor) -> Result<usize> {
        run_statements(db, &self.down, DISABLE_FOREIGN_KEYS, ENABLE_FOREIGN_KEYS)
    }

    /// `up` bracketed by the configured check toggles.
    pub fn up_with(&self, db: &mut dyn Executor, config: &MigrationConfig) -> Result<usize> {
        run_statements(db, &self.up, &config.disable_foreign_keys, &config.enable_foreign_keys)
    }

    pub fn down_with(&self, db: &mut dyn Executor, config: &MigrationConfig) -> Result<usize> {
        run_statements(db, &self.down, &config.disable_foreign_keys, &config.enable_foreign_keys)
    }
}

fn run_statements(db: &mut dyn Executor, statements: &[String], disable: &str, enable: &str) -> Result<usize> {
    with_checks_toggled(db, disable, enable, |db| {
        let mut executed = 0;
        for sql in statements.iter().filter(|s| !is_comment(s)) {
            db.execute(sql, &[])?;
            executed += 1;
        }
        Ok(executed)
    })
}

/// Derives the statement undoing one `up` statement.
pub trait ReverseStrategy {
    /// `None` when the statement needs no reversal.
    fn reverse(&self, statement: &str) -> Option<String>;

    /// Reversal of a whole `up` list, last statement first.
    fn reverse_all(&self, up: &[String]) -> Vec<String> {
        up.iter().rev().filter_map(|s| self.reverse(s)).collect()
    }
}

/// Regex classification of additive DDL.
///
/// Anything it does not recognize, `MODIFY COLUMN` and drops included,
/// reverses to a comment placeholder that is never executed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternReverser;

impl ReverseStrategy for PatternReverser {
    fn reverse(&self, statement: &str) -> Option<String> {
        if is_comment(statement) {
            return None;
        }

        if let Some(caps) = CREATE_TABLE.captures(statement) {
            return Some(format!("DROP TABLE IF EXISTS {}", &caps[1]));
        }
        if let Some(caps) = ADD_COLUMN.captures(statement) {
            return Some(format!("ALTER TABLE {} DROP COLUMN {}", &caps[1], &caps[2]));
        }
        if let Some(caps) = ADD_CONSTRAINT.captures(statement) {
            return Some(format!("ALTER TABLE {} DROP FOREIGN KEY {}", &caps[1], &caps[2]));
        }
        if let Some(caps) = ADD_UNIQUE_INDEX.captures(statement) {
            return Some(format!("ALTER TABLE {} DROP INDEX {}", &caps[1], &caps[2]));
        }

        let first_line = statement.lines().next().unwrap_or_default().trim();
        Some(format!("-- irreversible: {}", first_line))
    }
}

/// 14-digit timestamp prefix of an artifact file name
fn prefix_of(file_name: &str) -> Option<u64> {
    let prefix = file_name.get(..PREFIX_LEN)?;
    if file_name.as_bytes().get(PREFIX_LEN) != Some(&b'_') {
        return None;
    }
    prefix.parse().ok()
}

fn artifact_paths(directory: &Path) -> Result<Vec<PathBuf>> {
    if !directory.exists() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(directory)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "json")
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(prefix_of)
                    .is_some()
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Writes migration artifacts into one directory.
pub struct MigrationWriter {
    directory: PathBuf,
    strategy: Box<dyn ReverseStrategy>,
}

impl MigrationWriter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            strategy: Box::new(PatternReverser),
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.directory.clone())
    }

    /// Replace the reversal heuristic.
    pub fn with_strategy(mut self, strategy: impl ReverseStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Timestamp prefix strictly greater than every existing artifact's.
    fn next_prefix(&self) -> Result<u64> {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();
        let now: u64 = stamp
            .parse()
            .map_err(|_| QueryError::Migration(format!("bad timestamp {}", stamp)))?;

        let newest = artifact_paths(&self.directory)?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).and_then(prefix_of))
            .max();

        Ok(match newest {
            Some(newest) if newest >= now => newest + 1,
            _ => now,
        })
    }

    /// Persist `up` (and `down`, derived when absent) and return the artifact path.
    pub fn write(&self, name: &str, up: Vec<String>, down: Option<Vec<String>>) -> Result<PathBuf> {
        if up.is_empty() {
            return Err(QueryError::Migration(format!("migration {} has no statements", name)));
        }
        fs::create_dir_all(&self.directory)?;

        let stem = format!("{:0width$}_{}", self.next_prefix()?, naming::snake(name), width = PREFIX_LEN);
        let path = self.directory.join(format!("{}.json", stem));

        let down = down.unwrap_or_else(|| self.strategy.reverse_all(&up));
        let migration = Migration { name: stem, up, down };

        let mut file = tempfile::NamedTempFile::new_in(&self.directory)?;
        file.write_all(&serde_json::to_vec_pretty(&migration)?)?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|e| QueryError::Io(e.error))?;

        tracing::info!(
            migration = %migration.name,
            up = migration.up.len(),
            down = migration.down.len(),
            "wrote migration"
        );
        Ok(path)
    }

    /// Write a synchronizer plan; nothing is written for an empty plan.
    pub fn write_plan(&self, name: &str, plan: &SyncPlan) -> Result<Option<PathBuf>> {
        if plan.is_empty() {
            return Ok(None);
        }
        self.write(name, plan.statements(), None).map(Some)
    }
}

/// Ledger view of one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub name: String,
    /// Batch it was applied in; `None` when pending
    pub batch: Option<i64>,
}

/// Applies artifacts and keeps the ledger.
pub struct Migrator {
    config: MigrationConfig,
}

impl Migrator {
    pub fn new(config: MigrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Every artifact in the directory, oldest first.
    pub fn artifacts(&self) -> Result<Vec<Migration>> {
        artifact_paths(&self.config.directory)?
            .iter()
            .map(|path| Migration::load(path))
            .collect()
    }

    fn ledger_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", ColumnType::Int).unsigned().primary_key().auto_increment(),
            ColumnDef::new("migration", ColumnType::Varchar).length(255),
            ColumnDef::new("batch", ColumnType::Int),
            ColumnDef::new("applied_at", ColumnType::Timestamp).created_at(),
        ]
    }

    fn ledger_exists(&self, db: &mut dyn Executor) -> Result<bool> {
        Ok(db.introspect_table(&self.config.ledger_table)?.is_some())
    }

    fn require_ledger(&self, db: &mut dyn Executor) -> Result<()> {
        if self.ledger_exists(db)? {
            Ok(())
        } else {
            Err(QueryError::LedgerMissing(self.config.ledger_table.clone()))
        }
    }

    fn ensure_ledger(&self, db: &mut dyn Executor) -> Result<()> {
        if !self.ledger_exists(db)? {
            let ddl = create_table_sql(&self.config.ledger_table, &Self::ledger_columns(), 255);
            db.execute(&ddl, &[])?;
            tracing::info!(table = %self.config.ledger_table, "created migration ledger");
        }
        Ok(())
    }

    fn applied(&self, db: &mut dyn Executor) -> Result<Vec<(String, i64)>> {
        let sql = format!(
            "SELECT migration, batch FROM {} ORDER BY batch, id",
            self.config.ledger_table
        );
        Ok(db
            .query(&sql, &[])?
            .iter()
            .filter_map(|row| Some((row.get_string("migration")?, row_i64(row, "batch")?)))
            .collect())
    }

    fn last_batch(&self, db: &mut dyn Executor) -> Result<Option<i64>> {
        let sql = format!("SELECT MAX(batch) AS batch FROM {}", self.config.ledger_table);
        Ok(db.query(&sql, &[])?.first().and_then(|row| row_i64(row, "batch")))
    }

    /// Every artifact with the batch it was applied in.
    pub fn status(&self, db: &mut dyn Executor) -> Result<Vec<MigrationStatus>> {
        self.require_ledger(db)?;
        let applied = self.applied(db)?;

        Ok(self
            .artifacts()?
            .into_iter()
            .map(|m| MigrationStatus {
                batch: applied.iter().find(|(name, _)| *name == m.name).map(|(_, b)| *b),
                name: m.name,
            })
            .collect())
    }

    /// Apply every pending artifact under one new batch number.
    pub fn run(&self, db: &mut dyn Executor) -> Result<Vec<String>> {
        self.ensure_ledger(db)?;

        let applied: HashSet<String> = self.applied(db)?.into_iter().map(|(name, _)| name).collect();
        let pending: Vec<Migration> = self
            .artifacts()?
            .into_iter()
            .filter(|m| !applied.contains(&m.name))
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let batch = self.last_batch(db)?.map_or(1, |b| b + 1);
        let record = format!(
            "INSERT INTO {} (migration, batch) VALUES (?, ?)",
            self.config.ledger_table
        );

        let mut names = Vec::new();
        for migration in pending {
            migration.up_with(db, &self.config)?;
            db.execute(&record, &[Value::String(migration.name.clone()), Value::from(batch)])?;
            tracing::info!(migration = %migration.name, batch, "applied migration");
            names.push(migration.name);
        }
        Ok(names)
    }

    /// Revert the latest batch, newest artifact first.
    pub fn rollback(&self, db: &mut dyn Executor) -> Result<Vec<String>> {
        self.require_ledger(db)?;

        let Some(batch) = self.last_batch(db)? else {
            return Ok(Vec::new());
        };

        let sql = format!(
            "SELECT migration FROM {} WHERE batch = ? ORDER BY id DESC",
            self.config.ledger_table
        );
        let names: Vec<String> = db
            .query(&sql, &[Value::from(batch)])?
            .iter()
            .filter_map(|row| row.get_string("migration"))
            .collect();

        let artifacts = self.artifacts()?;
        let forget = format!("DELETE FROM {} WHERE migration = ?", self.config.ledger_table);

        for name in &names {
            let migration = artifacts
                .iter()
                .find(|m| &m.name == name)
                .ok_or_else(|| QueryError::Migration(format!("artifact {} is missing", name)))?;
            migration.down_with(db, &self.config)?;
            db.execute(&forget, &[Value::String(name.clone())])?;
            tracing::info!(migration = %name, batch, "rolled back migration");
        }
        Ok(names)
    }
}

fn row_i64(row: &QueryRow, column: &str) -> Option<i64> {
    match row.value_ci(column)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LiveColumn, DISABLE_FOREIGN_KEYS, ENABLE_FOREIGN_KEYS};
    use crate::mock::MockExecutor;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_pattern_reverser() {
        let r = PatternReverser;
        assert_eq!(
            r.reverse("CREATE TABLE IF NOT EXISTS users (\n    id INT NOT NULL\n)").unwrap(),
            "DROP TABLE IF EXISTS users"
        );
        assert_eq!(
            r.reverse("ALTER TABLE `users` ADD COLUMN `age` INT NOT NULL").unwrap(),
            "ALTER TABLE users DROP COLUMN age"
        );
        assert_eq!(
            r.reverse("alter table users add constraint fk_users_roleId foreign key (roleId) references roles (id)")
                .unwrap(),
            "ALTER TABLE users DROP FOREIGN KEY fk_users_roleId"
        );
        assert_eq!(
            r.reverse("ALTER TABLE users ADD UNIQUE INDEX users_email_unique (email)").unwrap(),
            "ALTER TABLE users DROP INDEX users_email_unique"
        );
        assert_eq!(
            r.reverse("ALTER TABLE users MODIFY COLUMN email VARCHAR(255) NOT NULL").unwrap(),
            "-- irreversible: ALTER TABLE users MODIFY COLUMN email VARCHAR(255) NOT NULL"
        );
        assert_eq!(r.reverse("-- ALTER TABLE users DROP COLUMN legacy"), None);
    }

    #[test]
    fn test_reverse_all_runs_backwards() {
        let up = vec![
            "CREATE TABLE IF NOT EXISTS tags (\n    id INT NOT NULL\n)".to_string(),
            "ALTER TABLE posts ADD COLUMN tag_id INT NOT NULL".to_string(),
        ];
        assert_eq!(
            PatternReverser.reverse_all(&up),
            vec!["ALTER TABLE posts DROP COLUMN tag_id", "DROP TABLE IF EXISTS tags"]
        );
    }

    #[test]
    fn test_write_derives_down_and_orders_names() {
        let dir = TempDir::new().unwrap();
        let writer = MigrationWriter::new(dir.path());

        let first = writer
            .write("Create Users", vec!["CREATE TABLE IF NOT EXISTS users (\n    id INT NOT NULL\n)".to_string()], None)
            .unwrap();
        let second = writer
            .write(
                "add age",
                vec!["ALTER TABLE users ADD COLUMN age INT NOT NULL".to_string()],
                Some(vec!["ALTER TABLE users DROP COLUMN age".to_string()]),
            )
            .unwrap();

        assert!(first < second);
        let first_name = first.file_name().unwrap().to_str().unwrap();
        assert!(first_name.ends_with("_create_users.json"));
        assert_eq!(first_name.len(), PREFIX_LEN + "_create_users.json".len());

        let loaded = Migration::load(&first).unwrap();
        assert_eq!(loaded.down, vec!["DROP TABLE IF EXISTS users"]);
        assert_eq!(loaded.name, first_name.trim_end_matches(".json"));

        let migrator = Migrator::new(MigrationConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        });
        let names: Vec<String> = migrator.artifacts().unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names.len(), 2);
        assert!(names[1].ends_with("_add_age"));
    }

    #[test]
    fn test_empty_plan_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let writer = MigrationWriter::new(dir.path().join("nested"));
        assert!(writer.write_plan("noop", &SyncPlan::default()).unwrap().is_none());
        assert!(writer.write("noop", Vec::new(), None).is_err());
    }

    #[test]
    fn test_up_skips_comments_inside_toggles() {
        let mut db = MockExecutor::new();
        let migration = Migration {
            name: "20240101000000_x".to_string(),
            up: vec![
                "ALTER TABLE users ADD COLUMN age INT NOT NULL".to_string(),
                "-- irreversible: ALTER TABLE users MODIFY COLUMN email TEXT".to_string(),
            ],
            down: Vec::new(),
        };

        assert_eq!(migration.up(&mut db).unwrap(), 1);
        let executed: Vec<&str> = db.statements().iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(
            executed,
            vec![
                DISABLE_FOREIGN_KEYS,
                "ALTER TABLE users ADD COLUMN age INT NOT NULL",
                ENABLE_FOREIGN_KEYS
            ]
        );
    }

    #[test]
    fn test_status_and_rollback_need_ledger() {
        let dir = TempDir::new().unwrap();
        let migrator = Migrator::new(MigrationConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        });
        let mut db = MockExecutor::new();

        assert!(matches!(migrator.status(&mut db), Err(QueryError::LedgerMissing(_))));
        assert!(matches!(migrator.rollback(&mut db), Err(QueryError::LedgerMissing(_))));
    }

    #[test]
    fn test_run_then_rollback() {
        let dir = TempDir::new().unwrap();
        let writer = MigrationWriter::new(dir.path());
        writer
            .write("add age", vec!["ALTER TABLE users ADD COLUMN age INT NOT NULL".to_string()], None)
            .unwrap();
        let migrator = Migrator::new(MigrationConfig {
            directory: dir.path().to_path_buf(),
            ledger_table: "schema_ledger".to_string(),
            ..Default::default()
        });
        let name = migrator.artifacts().unwrap()[0].name.clone();

        // ledger absent, nothing applied, no batches yet
        let mut db = MockExecutor::new();
        db.push_json(vec![]).push_json(vec![json!({ "batch": null })]);

        assert_eq!(migrator.run(&mut db).unwrap(), vec![name.clone()]);
        let sql: Vec<&str> = db.statements().iter().map(|s| s.sql.as_str()).collect();
        assert!(sql[0].starts_with("CREATE TABLE IF NOT EXISTS schema_ledger ("));
        assert!(sql.contains(&"ALTER TABLE users ADD COLUMN age INT NOT NULL"));
        let insert = db.statements().last().unwrap();
        assert_eq!(insert.sql, "INSERT INTO schema_ledger (migration, batch) VALUES (?, ?)");
        assert_eq!(insert.bindings, vec![json!(name), json!(1)]);

        // ledger present with the migration in batch 1
        let mut db = MockExecutor::new();
        db.set_table("schema_ledger", vec![LiveColumn::new("id", "int unsigned", false)]);
        db.push_json(vec![json!({ "batch": 1 })])
            .push_json(vec![json!({ "migration": name })]);

        assert_eq!(migrator.rollback(&mut db).unwrap(), vec![name.clone()]);
        let sql: Vec<&str> = db.statements().iter().map(|s| s.sql.as_str()).collect();
        assert!(sql.contains(&"ALTER TABLE users DROP COLUMN age"));
        assert_eq!(
            db.statements().last().unwrap().sql,
            "DELETE FROM schema_ledger WHERE migration = ?"
        );
    }

    #[test]
    fn test_migrator_uses_configured_check_toggles() {
        let dir = TempDir::new().unwrap();
        MigrationWriter::new(dir.path())
            .write("add age", vec!["ALTER TABLE users ADD COLUMN age INT NOT NULL".to_string()], None)
            .unwrap();
        let migrator = Migrator::new(MigrationConfig {
            directory: dir.path().to_path_buf(),
            disable_foreign_keys: "SET SESSION FOREIGN_KEY_CHECKS = 0".to_string(),
            enable_foreign_keys: "SET SESSION FOREIGN_KEY_CHECKS = 1".to_string(),
            ..Default::default()
        });

        let mut db = MockExecutor::new();
        db.set_table("migrations", vec![LiveColumn::new("id", "int unsigned", false)]);
        migrator.run(&mut db).unwrap();

        let sql: Vec<&str> = db.statements().iter().map(|s| s.sql.as_str()).collect();
        let up = sql
            .iter()
            .position(|s| *s == "ALTER TABLE users ADD COLUMN age INT NOT NULL")
            .unwrap();
        assert_eq!(sql[up - 1], "SET SESSION FOREIGN_KEY_CHECKS = 0");
        assert_eq!(sql[up + 1], "SET SESSION FOREIGN_KEY_CHECKS = 1");
        assert!(!sql.contains(&DISABLE_FOREIGN_KEYS));
    }

    #[test]
    fn test_config_from_json() {
        let config = MigrationConfig::from_json(r#"{"directory": "db/migrations"}"#).unwrap();
        assert_eq!(config.directory, PathBuf::from("db/migrations"));
        assert_eq!(config.ledger_table, "migrations");
        assert_eq!(config.disable_foreign_keys, DISABLE_FOREIGN_KEYS);
    }
}
