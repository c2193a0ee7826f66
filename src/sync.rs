use crate::backend::{is_comment, with_checks_toggled, Executor, LiveColumn, DISABLE_FOREIGN_KEYS, ENABLE_FOREIGN_KEYS};
use crate::error::{QueryError, Result};
use crate::naming;
use crate::registry::{describe, Entity, EntityMeta};
use crate::relation::Relation;
use crate::schema::{create_table_sql, ColumnDef, ReferentialAction};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;

lazy_static! {
    static ref INT_DISPLAY_WIDTH: Regex =
        Regex::new(r"\b(tinyint|smallint|mediumint|int|integer|bigint)\(\d+\)").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Configuration for schema synchronization
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Referential action for generated foreign keys without their own
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
    /// VARCHAR length when a column declares none
    pub default_string_length: u32,
    pub disable_foreign_keys: String,
    pub enable_foreign_keys: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            on_delete: ReferentialAction::Cascade,
            on_update: ReferentialAction::Cascade,
            default_string_length: 255,
            disable_foreign_keys: DISABLE_FOREIGN_KEYS.to_string(),
            enable_foreign_keys: ENABLE_FOREIGN_KEYS.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Ordered DDL produced by one synchronization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub constraint_drops: Vec<String>,
    /// Table creation, column changes and unique indexes
    pub table_changes: Vec<String>,
    pub constraint_adds: Vec<String>,
}

impl SyncPlan {
    /// Every statement in execution order, comments included.
    pub fn statements(&self) -> Vec<String> {
        self.constraint_drops
            .iter()
            .chain(&self.table_changes)
            .chain(&self.constraint_adds)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.constraint_drops.is_empty() && self.table_changes.is_empty() && self.constraint_adds.is_empty()
    }

    /// Statements that would actually run
    pub fn executable(&self) -> Vec<String> {
        self.statements().into_iter().filter(|s| !is_comment(s)).collect()
    }
}

/// Live state of one table, fetched once per pass
struct LiveTable {
    columns: Option<Vec<LiveColumn>>,
    constraints: Vec<String>,
    indexes: Vec<String>,
}

impl LiveTable {
    fn fetch(db: &mut dyn Executor, table: &str) -> Result<Self> {
        let columns = db.introspect_table(table)?;
        let (constraints, indexes) = if columns.is_some() {
            (db.list_constraints(table)?, db.list_indexes(table)?)
        } else {
            (Vec::new(), Vec::new())
        };
        Ok(Self {
            columns,
            constraints,
            indexes,
        })
    }

    fn has_constraint(&self, name: &str) -> bool {
        self.constraints.iter().any(|c| c.eq_ignore_ascii_case(name))
    }

    fn has_index(&self, name: &str) -> bool {
        self.indexes.iter().any(|i| i.eq_ignore_ascii_case(name))
    }
}

/// Lowercased type string without integer display widths; `tinyint(1)` keeps its width.
pub fn normalize_type(column_type: &str) -> String {
    let lowered = WHITESPACE
        .replace_all(column_type.trim(), " ")
        .to_ascii_lowercase();

    INT_DISPLAY_WIDTH
        .replace_all(&lowered, |caps: &regex::Captures| {
            if &caps[0] == "tinyint(1)" {
                caps[0].to_string()
            } else {
                caps[1].to_string()
            }
        })
        .into_owned()
}

/// Diffs registered entities against the live schema.
pub struct SchemaSync {
    config: SyncConfig,
    entities: Vec<&'static EntityMeta>,
}

impl SchemaSync {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self {
            config,
            entities: Vec::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn register<E: Entity>(&mut self) -> Result<&mut Self> {
        let meta = describe::<E>()?;
        if !self.entities.iter().any(|m| std::ptr::eq(*m, meta)) {
            self.entities.push(meta);
        }
        Ok(self)
    }

    /// Compare every registered entity with the live schema.
    pub fn generate(&self, db: &mut dyn Executor) -> Result<SyncPlan> {
        let mut plan = SyncPlan::default();
        let mut pivots = HashSet::new();
        let entity_tables: HashSet<&str> = self.entities.iter().filter_map(|m| m.table()).collect();

        for &meta in &self.entities {
            let Some(table) = meta.table() else {
                tracing::warn!(entity = %meta.name(), "entity has no table designation, skipping");
                continue;
            };

            let live = LiveTable::fetch(db, table)?;
            let mut dropped = HashSet::new();

            self.diff_table(meta, table, &live, &mut dropped, &mut plan);
            self.add_foreign_keys(meta, table, &live, &dropped, &mut plan)?;

            for (relation, resolved) in meta.relations().iter().zip(meta.resolved_relations()?) {
                let Relation::BelongsToMany(pivot) = resolved else {
                    continue;
                };
                if pivot.pivot_is_entity || entity_tables.contains(pivot.pivot_table.as_str()) {
                    continue;
                }
                if !pivots.insert(pivot.pivot_table.clone()) {
                    continue;
                }

                let parent_key = key_column(pivot.parent, &pivot.parent_key)?;
                let related_key = key_column(pivot.related, &pivot.related_key)?;
                let columns = [
                    parent_key.as_reference(&pivot.foreign_pivot_key),
                    related_key.as_reference(&pivot.related_pivot_key),
                ];
                let targets = [
                    (pivot.parent.require_table()?, pivot.parent_key.as_str()),
                    (pivot.related.require_table()?, pivot.related_key.as_str()),
                ];

                let live = LiveTable::fetch(db, &pivot.pivot_table)?;
                let mut dropped = HashSet::new();
                self.diff_pivot(&pivot.pivot_table, &columns, &live, &mut dropped, &mut plan);

                for (column, (target_table, target_key)) in columns.iter().zip(targets) {
                    let name = naming::foreign_key_constraint(&pivot.pivot_table, &column.db_name);
                    if live.has_constraint(&name) && !dropped.contains(&name) {
                        continue;
                    }
                    plan.constraint_adds.push(foreign_key_sql(
                        &pivot.pivot_table,
                        &name,
                        &column.db_name,
                        target_table,
                        target_key,
                        relation.on_delete_action().unwrap_or(self.config.on_delete),
                        relation.on_update_action().unwrap_or(self.config.on_update),
                    ));
                }
            }
        }

        tracing::debug!(
            drops = plan.constraint_drops.len(),
            changes = plan.table_changes.len(),
            adds = plan.constraint_adds.len(),
            "generated schema plan"
        );
        Ok(plan)
    }

    fn diff_table(
        &self,
        meta: &EntityMeta,
        table: &str,
        live: &LiveTable,
        dropped: &mut HashSet<String>,
        plan: &mut SyncPlan,
    ) {
        let length = self.config.default_string_length;

        let Some(live_columns) = &live.columns else {
            plan.table_changes.push(create_table_sql(table, meta.columns(), length));
            return;
        };

        self.diff_columns(table, meta.columns(), live_columns, live, dropped, plan);

        for live_column in live_columns {
            if meta.column(&live_column.name).is_none() {
                tracing::warn!(
                    table = %table,
                    column = %live_column.name,
                    "live column has no declaration, leaving it in place"
                );
                plan.table_changes.push(format!(
                    "-- ALTER TABLE {} DROP COLUMN {}",
                    table, live_column.name
                ));
            }
        }

        for column in meta.columns().iter().filter(|c| c.unique && !c.primary_key) {
            let index = naming::unique_index(table, &column.db_name);
            if !live.has_index(&index) {
                plan.table_changes.push(format!(
                    "ALTER TABLE {} ADD UNIQUE INDEX {} ({})",
                    table, index, column.db_name
                ));
            }
        }
    }

    fn diff_pivot(
        &self,
        table: &str,
        columns: &[ColumnDef],
        live: &LiveTable,
        dropped: &mut HashSet<String>,
        plan: &mut SyncPlan,
    ) {
        match &live.columns {
            None => {
                let keyed: Vec<ColumnDef> = columns
                    .iter()
                    .cloned()
                    .map(|mut c| {
                        c.primary_key = true;
                        c
                    })
                    .collect();
                plan.table_changes.push(create_table_sql(
                    table,
                    &keyed,
                    self.config.default_string_length,
                ));
            }
            Some(live_columns) => self.diff_columns(table, columns, live_columns, live, dropped, plan),
        }
    }

    /// ADD / MODIFY statements for declared columns; a modified column
    /// carrying a foreign key has the key dropped first and re-added later.
    fn diff_columns(
        &self,
        table: &str,
        columns: &[ColumnDef],
        live_columns: &[LiveColumn],
        live: &LiveTable,
        dropped: &mut HashSet<String>,
        plan: &mut SyncPlan,
    ) {
        let length = self.config.default_string_length;

        for column in columns {
            match live_columns
                .iter()
                .find(|l| l.name.eq_ignore_ascii_case(&column.db_name))
            {
                None => plan.table_changes.push(format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    table,
                    column.definition_sql(length)
                )),
                Some(live_column) if self.differs(column, live_column) => {
                    let constraint = naming::foreign_key_constraint(table, &column.db_name);
                    if live.has_constraint(&constraint) && dropped.insert(constraint.clone()) {
                        plan.constraint_drops
                            .push(format!("ALTER TABLE {} DROP FOREIGN KEY {}", table, constraint));
                    }
                    plan.table_changes.push(format!(
                        "ALTER TABLE {} MODIFY COLUMN {}",
                        table,
                        column.definition_sql(length)
                    ));
                }
                Some(_) => {}
            }
        }
    }

    fn differs(&self, column: &ColumnDef, live: &LiveColumn) -> bool {
        let declared = normalize_type(&column.type_sql(self.config.default_string_length));
        let nullable = column.nullable && !column.primary_key;

        declared != normalize_type(&live.column_type)
            || nullable != live.nullable
            || column.timestamp_update != live.is_auto_update_timestamp()
    }

    fn add_foreign_keys(
        &self,
        meta: &'static EntityMeta,
        table: &str,
        live: &LiveTable,
        dropped: &HashSet<String>,
        plan: &mut SyncPlan,
    ) -> Result<()> {
        for (relation, resolved) in meta.relations().iter().zip(meta.resolved_relations()?) {
            let Relation::BelongsTo(belongs_to) = resolved else {
                continue;
            };

            let name = naming::foreign_key_constraint(table, &belongs_to.foreign_key);
            if live.has_constraint(&name) && !dropped.contains(&name) {
                continue;
            }

            plan.constraint_adds.push(foreign_key_sql(
                table,
                &name,
                &belongs_to.foreign_key,
                belongs_to.related.require_table()?,
                &belongs_to.owner_key,
                relation.on_delete_action().unwrap_or(self.config.on_delete),
                relation.on_update_action().unwrap_or(self.config.on_update),
            ));
        }
        Ok(())
    }

    /// Execute `plan` with foreign-key checks suspended; comments are skipped.
    pub fn apply(&self, db: &mut dyn Executor, plan: &SyncPlan) -> Result<usize> {
        let statements = plan.executable();
        if statements.is_empty() {
            return Ok(0);
        }

        with_checks_toggled(
            db,
            &self.config.disable_foreign_keys,
            &self.config.enable_foreign_keys,
            |db| {
                for sql in &statements {
                    tracing::debug!(sql = %sql, "applying schema change");
                    db.execute(sql, &[])?;
                }
                Ok(statements.len())
            },
        )
    }

    /// Generate and apply in one step.
    pub fn sync(&self, db: &mut dyn Executor) -> Result<SyncPlan> {
        let plan = self.generate(db)?;
        let applied = self.apply(db, &plan)?;
        tracing::info!(statements = applied, "schema synchronized");
        Ok(plan)
    }
}

impl Default for SchemaSync {
    fn default() -> Self {
        Self::new()
    }
}

fn key_column<'a>(meta: &'a EntityMeta, name: &str) -> Result<&'a ColumnDef> {
    meta.column(name).ok_or_else(|| {
        QueryError::config(format!(
            "pivot key {} is not a column of {}",
            name,
            meta.name()
        ))
    })
}

fn foreign_key_sql(
    table: &str,
    name: &str,
    column: &str,
    target_table: &str,
    target_key: &str,
    on_delete: ReferentialAction,
    on_update: ReferentialAction,
) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
        table, name, column, target_table, target_key, on_delete, on_update
    )
}
