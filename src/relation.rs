//! Relation engine.
//!
//! A `RelationDef` is the declaration attached to an entity. When the entity
//! is described, each declaration is resolved once against the parent and
//! related descriptors into a `Relation`, one of four strategies sharing the
//! `RelationStrategy` interface: lazy single-parent resolution, one batched
//! query for many parents, and dictionary matching of the batch back onto
//! its parents.

use crate::backend::Executor;
use crate::builder::QueryBuilder;
use crate::error::{QueryError, Result};
use crate::model::{Loaded, Record};
use crate::naming;
use crate::registry::{describe, Entity, EntityMeta};
use crate::schema::ReferentialAction;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Column alias carrying the pivot's parent key on many-to-many results.
pub(crate) const PIVOT_ALIAS: &str = "__pivot_parent_key";

type MetaFn = fn() -> Result<&'static EntityMeta>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    BelongsTo,
    HasOne,
    HasMany,
    BelongsToMany,
}

#[derive(Debug, Clone)]
enum PivotSource {
    Table(String),
    Entity(MetaFn),
}

/// Relationship declared on an entity field
#[derive(Debug, Clone)]
pub struct RelationDef {
    name: String,
    kind: RelationKind,
    related: MetaFn,
    foreign_key: Option<String>,
    local_key: Option<String>,
    related_key: Option<String>,
    pivot: Option<PivotSource>,
    foreign_pivot_key: Option<String>,
    related_pivot_key: Option<String>,
    on_delete: Option<ReferentialAction>,
    on_update: Option<ReferentialAction>,
}

impl RelationDef {
    fn new(name: impl Into<String>, kind: RelationKind, related: MetaFn) -> Self {
        Self {
            name: name.into(),
            kind,
            related,
            foreign_key: None,
            local_key: None,
            related_key: None,
            pivot: None,
            foreign_pivot_key: None,
            related_pivot_key: None,
            on_delete: None,
            on_update: None,
        }
    }

    /// The entity holds a foreign key referencing `R`.
    pub fn belongs_to<R: Entity>(name: impl Into<String>) -> Self {
        Self::new(name, RelationKind::BelongsTo, describe::<R>)
    }

    /// `R` holds a foreign key referencing this entity; at most one row.
    pub fn has_one<R: Entity>(name: impl Into<String>) -> Self {
        Self::new(name, RelationKind::HasOne, describe::<R>)
    }

    pub fn has_many<R: Entity>(name: impl Into<String>) -> Self {
        Self::new(name, RelationKind::HasMany, describe::<R>)
    }

    /// Many-to-many through a pivot table.
    pub fn belongs_to_many<R: Entity>(name: impl Into<String>) -> Self {
        Self::new(name, RelationKind::BelongsToMany, describe::<R>)
    }

    pub fn foreign_key(mut self, column: impl Into<String>) -> Self {
        self.foreign_key = Some(column.into());
        self
    }

    /// Key on the related table a belongs-to foreign key points at.
    pub fn owner_key(mut self, column: impl Into<String>) -> Self {
        self.related_key = Some(column.into());
        self
    }

    /// Key on this entity that has-one/has-many foreign keys point at.
    pub fn local_key(mut self, column: impl Into<String>) -> Self {
        self.local_key = Some(column.into());
        self
    }

    /// Key on this entity the pivot's parent column references.
    pub fn parent_key(self, column: impl Into<String>) -> Self {
        self.local_key(column)
    }

    /// Key on the related entity the pivot's related column references.
    pub fn related_key(mut self, column: impl Into<String>) -> Self {
        self.related_key = Some(column.into());
        self
    }

    pub fn pivot_table(mut self, table: impl Into<String>) -> Self {
        self.pivot = Some(PivotSource::Table(table.into()));
        self
    }

    /// Use entity `P`'s table as the pivot; the synchronizer then leaves it to `P`.
    pub fn pivot<P: Entity>(mut self) -> Self {
        self.pivot = Some(PivotSource::Entity(describe::<P>));
        self
    }

    pub fn foreign_pivot_key(mut self, column: impl Into<String>) -> Self {
        self.foreign_pivot_key = Some(column.into());
        self
    }

    pub fn related_pivot_key(mut self, column: impl Into<String>) -> Self {
        self.related_pivot_key = Some(column.into());
        self
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = Some(action);
        self
    }

    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = Some(action);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    pub fn related(&self) -> Result<&'static EntityMeta> {
        (self.related)()
    }

    pub fn on_delete_action(&self) -> Option<ReferentialAction> {
        self.on_delete
    }

    pub fn on_update_action(&self) -> Option<ReferentialAction> {
        self.on_update
    }

    /// Foreign key column of a belongs-to: explicit, else `<field>_id`.
    pub fn belongs_to_foreign_key(&self) -> String {
        self.foreign_key
            .clone()
            .unwrap_or_else(|| naming::foreign_key_for_field(&self.name))
    }

    /// Resolve key names and related descriptors against `parent`.
    pub fn resolve(&self, parent: &'static EntityMeta) -> Result<Relation> {
        let related = self.related().map_err(|e| {
            QueryError::config(format!(
                "relation {}.{} has no usable related entity: {}",
                parent.name(),
                self.name,
                e
            ))
        })?;
        if related.table().is_none() {
            return Err(QueryError::config(format!(
                "relation {}.{} points at {} which has no table",
                parent.name(),
                self.name,
                related.name()
            )));
        }

        let relation = match self.kind {
            RelationKind::BelongsTo => Relation::BelongsTo(BelongsTo {
                name: self.name.clone(),
                parent,
                related,
                foreign_key: self.belongs_to_foreign_key(),
                owner_key: match &self.related_key {
                    Some(key) => key.clone(),
                    None => related.require_primary_key()?.db_name.clone(),
                },
            }),
            RelationKind::HasOne | RelationKind::HasMany => {
                let has = HasRelation {
                    name: self.name.clone(),
                    parent,
                    related,
                    foreign_key: self
                        .foreign_key
                        .clone()
                        .unwrap_or_else(|| naming::foreign_key_for_type(parent.name())),
                    local_key: match &self.local_key {
                        Some(key) => key.clone(),
                        None => parent.require_primary_key()?.db_name.clone(),
                    },
                    many: self.kind == RelationKind::HasMany,
                };
                if has.many {
                    Relation::HasMany(has)
                } else {
                    Relation::HasOne(has)
                }
            }
            RelationKind::BelongsToMany => {
                let (pivot_table, pivot_is_entity) = match &self.pivot {
                    Some(PivotSource::Table(table)) => (table.clone(), false),
                    Some(PivotSource::Entity(pivot)) => {
                        let pivot = pivot().map_err(|e| {
                            QueryError::config(format!(
                                "relation {}.{} has a malformed pivot entity: {}",
                                parent.name(),
                                self.name,
                                e
                            ))
                        })?;
                        (pivot.require_table()?.to_string(), true)
                    }
                    None => (
                        naming::pivot_table(parent.require_table()?, related.require_table()?),
                        false,
                    ),
                };

                Relation::BelongsToMany(BelongsToMany {
                    name: self.name.clone(),
                    parent,
                    related,
                    pivot_table,
                    pivot_is_entity,
                    foreign_pivot_key: self
                        .foreign_pivot_key
                        .clone()
                        .unwrap_or_else(|| naming::foreign_key_for_type(parent.name())),
                    related_pivot_key: self
                        .related_pivot_key
                        .clone()
                        .unwrap_or_else(|| naming::foreign_key_for_type(related.name())),
                    parent_key: match &self.local_key {
                        Some(key) => key.clone(),
                        None => parent.require_primary_key()?.db_name.clone(),
                    },
                    related_key: match &self.related_key {
                        Some(key) => key.clone(),
                        None => related.require_primary_key()?.db_name.clone(),
                    },
                })
            }
        };

        Ok(relation)
    }
}

/// Strategy interface shared by the four relation kinds
pub trait RelationStrategy {
    fn name(&self) -> &str;

    fn related(&self) -> &'static EntityMeta;

    /// Resolve the relation for one parent.
    fn get_results(&self, db: &mut dyn Executor, parent: &Record) -> Result<Loaded>;

    /// Query fetching related rows for every parent at once, or `None` when
    /// no parent carries a usable key.
    fn eager_query(&self, parents: &[Record]) -> Result<Option<QueryBuilder>>;

    /// Attach each fetched row to the parent(s) it belongs to.
    fn match_results(&self, parents: &mut [Record], results: Vec<Record>);
}

/// Resolved relation
#[derive(Debug, Clone)]
pub enum Relation {
    BelongsTo(BelongsTo),
    HasOne(HasRelation),
    HasMany(HasRelation),
    BelongsToMany(BelongsToMany),
}

impl Relation {
    pub fn strategy(&self) -> &dyn RelationStrategy {
        match self {
            Relation::BelongsTo(r) => r,
            Relation::HasOne(r) | Relation::HasMany(r) => r,
            Relation::BelongsToMany(r) => r,
        }
    }

    pub fn as_belongs_to_many(&self) -> Result<&BelongsToMany> {
        match self {
            Relation::BelongsToMany(r) => Ok(r),
            other => Err(QueryError::config(format!(
                "relation {} is not many-to-many",
                other.strategy().name()
            ))),
        }
    }
}

/// Dictionary key for a column value; NULL never matches.
pub(crate) fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        other => Some(other.to_string()),
    }
}

/// Distinct non-null values of `column` across `records`, first-seen order.
fn distinct_keys(records: &[Record], column: &str) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for value in records.iter().filter_map(|r| r.get(column)) {
        if let Some(key) = key_of(value) {
            if seen.insert(key) {
                keys.push(value.clone());
            }
        }
    }
    keys
}

fn record_key(record: &Record, column: &str) -> Option<String> {
    record.get(column).and_then(key_of)
}

#[derive(Debug, Clone)]
pub struct BelongsTo {
    pub name: String,
    pub parent: &'static EntityMeta,
    pub related: &'static EntityMeta,
    pub foreign_key: String,
    pub owner_key: String,
}

impl RelationStrategy for BelongsTo {
    fn name(&self) -> &str {
        &self.name
    }

    fn related(&self) -> &'static EntityMeta {
        self.related
    }

    fn get_results(&self, db: &mut dyn Executor, parent: &Record) -> Result<Loaded> {
        let value = match parent.get(&self.foreign_key) {
            Some(value) if !value.is_null() => value.clone(),
            _ => return Ok(Loaded::One(None)),
        };

        let found = QueryBuilder::<Record>::for_entity(self.related)?
            .where_eq(self.owner_key.clone(), value)
            .first(db)?;
        Ok(Loaded::One(found.map(Box::new)))
    }

    fn eager_query(&self, parents: &[Record]) -> Result<Option<QueryBuilder>> {
        let keys = distinct_keys(parents, &self.foreign_key);
        if keys.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            QueryBuilder::for_entity(self.related)?.where_in(self.owner_key.clone(), keys),
        ))
    }

    fn match_results(&self, parents: &mut [Record], results: Vec<Record>) {
        let dictionary: HashMap<String, Record> = results
            .into_iter()
            .filter_map(|r| record_key(&r, &self.owner_key).map(|k| (k, r)))
            .collect();

        for parent in parents.iter_mut() {
            let matched = record_key(parent, &self.foreign_key)
                .and_then(|k| dictionary.get(&k))
                .cloned()
                .map(Box::new);
            parent.set_relation(&self.name, Loaded::One(matched));
        }
    }
}

/// has-one / has-many: the related table holds the foreign key
#[derive(Debug, Clone)]
pub struct HasRelation {
    pub name: String,
    pub parent: &'static EntityMeta,
    pub related: &'static EntityMeta,
    pub foreign_key: String,
    pub local_key: String,
    pub many: bool,
}

impl HasRelation {
    fn empty(&self) -> Loaded {
        if self.many {
            Loaded::Many(Vec::new())
        } else {
            Loaded::One(None)
        }
    }
}

impl RelationStrategy for HasRelation {
    fn name(&self) -> &str {
        &self.name
    }

    fn related(&self) -> &'static EntityMeta {
        self.related
    }

    fn get_results(&self, db: &mut dyn Executor, parent: &Record) -> Result<Loaded> {
        let value = match parent.get(&self.local_key) {
            Some(value) if !value.is_null() => value.clone(),
            _ => return Ok(self.empty()),
        };

        let query = QueryBuilder::<Record>::for_entity(self.related)?
            .where_eq(self.foreign_key.clone(), value);

        if self.many {
            Ok(Loaded::Many(query.get(db)?))
        } else {
            Ok(Loaded::One(query.first(db)?.map(Box::new)))
        }
    }

    fn eager_query(&self, parents: &[Record]) -> Result<Option<QueryBuilder>> {
        let keys = distinct_keys(parents, &self.local_key);
        if keys.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            QueryBuilder::for_entity(self.related)?.where_in(self.foreign_key.clone(), keys),
        ))
    }

    fn match_results(&self, parents: &mut [Record], results: Vec<Record>) {
        let mut dictionary: HashMap<String, Vec<Record>> = HashMap::new();
        for record in results {
            if let Some(key) = record_key(&record, &self.foreign_key) {
                dictionary.entry(key).or_default().push(record);
            }
        }

        for parent in parents.iter_mut() {
            let matched = record_key(parent, &self.local_key)
                .and_then(|k| dictionary.get(&k))
                .cloned()
                .unwrap_or_default();

            let loaded = if self.many {
                Loaded::Many(matched)
            } else {
                Loaded::One(matched.into_iter().next().map(Box::new))
            };
            parent.set_relation(&self.name, loaded);
        }
    }
}

/// Outcome of a pivot `sync`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PivotChanges {
    pub attached: Vec<Value>,
    pub detached: Vec<Value>,
}

impl PivotChanges {
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.detached.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BelongsToMany {
    pub name: String,
    pub parent: &'static EntityMeta,
    pub related: &'static EntityMeta,
    pub pivot_table: String,
    /// The pivot is itself a declared entity
    pub pivot_is_entity: bool,
    /// Pivot column referencing the parent
    pub foreign_pivot_key: String,
    /// Pivot column referencing the related entity
    pub related_pivot_key: String,
    pub parent_key: String,
    pub related_key: String,
}

impl BelongsToMany {
    fn base_query(&self) -> Result<QueryBuilder> {
        let related_table = self.related.require_table()?;
        Ok(QueryBuilder::for_entity(self.related)?
            .select([format!("{}.*", related_table)])
            .add_column(format!(
                "{}.{} AS {}",
                self.pivot_table, self.foreign_pivot_key, PIVOT_ALIAS
            ))
            .join(
                self.pivot_table.clone(),
                format!("{}.{}", self.pivot_table, self.related_pivot_key),
                "=",
                format!("{}.{}", related_table, self.related_key),
            ))
    }

    fn pivot_column(&self) -> String {
        format!("{}.{}", self.pivot_table, self.foreign_pivot_key)
    }

    /// Related keys currently linked to `parent_key`.
    pub fn current_ids(&self, db: &mut dyn Executor, parent_key: &Value) -> Result<Vec<Value>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            self.related_pivot_key, self.pivot_table, self.foreign_pivot_key
        );
        let rows = db.query(&sql, std::slice::from_ref(parent_key))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.value_ci(&self.related_pivot_key).cloned())
            .collect())
    }

    /// Insert pivot rows; rows that already exist are skipped.
    pub fn attach(&self, db: &mut dyn Executor, parent_key: &Value, ids: &[Value]) -> Result<usize> {
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES (?, ?)",
            self.pivot_table, self.foreign_pivot_key, self.related_pivot_key
        );

        let mut attached = 0;
        for id in ids {
            match db.execute(&sql, &[parent_key.clone(), id.clone()]) {
                Ok(_) => attached += 1,
                Err(e) if e.is_duplicate_key() => {
                    tracing::debug!(pivot = %self.pivot_table, id = %id, "pivot row already present");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(attached)
    }

    /// Delete pivot rows for `ids`, or every row of the parent when `ids` is `None`.
    pub fn detach(&self, db: &mut dyn Executor, parent_key: &Value, ids: Option<&[Value]>) -> Result<u64> {
        let mut sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            self.pivot_table, self.foreign_pivot_key
        );
        let mut bindings = vec![parent_key.clone()];

        if let Some(ids) = ids {
            if ids.is_empty() {
                return Ok(0);
            }
            sql.push_str(&format!(
                " AND {} IN ({})",
                self.related_pivot_key,
                vec!["?"; ids.len()].join(", ")
            ));
            bindings.extend(ids.iter().cloned());
        }

        Ok(db.execute(&sql, &bindings)?.rows_affected)
    }

    /// Make the parent's pivot rows exactly `ids`.
    pub fn sync(&self, db: &mut dyn Executor, parent_key: &Value, ids: &[Value]) -> Result<PivotChanges> {
        let current = self.current_ids(db, parent_key)?;
        let current_keys: HashSet<String> = current.iter().filter_map(key_of).collect();
        let target_keys: HashSet<String> = ids.iter().filter_map(key_of).collect();

        let detached: Vec<Value> = current
            .into_iter()
            .filter(|v| key_of(v).is_some_and(|k| !target_keys.contains(&k)))
            .collect();

        let mut seen = HashSet::new();
        let attached: Vec<Value> = ids
            .iter()
            .filter(|v| {
                key_of(v).is_some_and(|k| !current_keys.contains(&k) && seen.insert(k))
            })
            .cloned()
            .collect();

        if !detached.is_empty() {
            self.detach(db, parent_key, Some(&detached))?;
        }
        if !attached.is_empty() {
            self.attach(db, parent_key, &attached)?;
        }

        Ok(PivotChanges { attached, detached })
    }
}

impl RelationStrategy for BelongsToMany {
    fn name(&self) -> &str {
        &self.name
    }

    fn related(&self) -> &'static EntityMeta {
        self.related
    }

    fn get_results(&self, db: &mut dyn Executor, parent: &Record) -> Result<Loaded> {
        let value = match parent.get(&self.parent_key) {
            Some(value) if !value.is_null() => value.clone(),
            _ => return Ok(Loaded::Many(Vec::new())),
        };

        let mut records = self
            .base_query()?
            .where_eq(self.pivot_column(), value)
            .get(db)?;
        for record in &mut records {
            record.take(PIVOT_ALIAS);
        }
        Ok(Loaded::Many(records))
    }

    fn eager_query(&self, parents: &[Record]) -> Result<Option<QueryBuilder>> {
        let keys = distinct_keys(parents, &self.parent_key);
        if keys.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.base_query()?.where_in(self.pivot_column(), keys)))
    }

    fn match_results(&self, parents: &mut [Record], results: Vec<Record>) {
        let mut dictionary: HashMap<String, Vec<Record>> = HashMap::new();
        for mut record in results {
            if let Some(key) = record.take(PIVOT_ALIAS).as_ref().and_then(key_of) {
                dictionary.entry(key).or_default().push(record);
            }
        }

        for parent in parents.iter_mut() {
            let matched = record_key(parent, &self.parent_key)
                .and_then(|k| dictionary.get(&k))
                .cloned()
                .unwrap_or_default();
            parent.set_relation(&self.name, Loaded::Many(matched));
        }
    }
}

/// Relation names parsed into a tree: `["roles.permissions", "team"]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EagerTree {
    children: Vec<(String, EagerTree)>,
}

impl EagerTree {
    pub fn parse<S: AsRef<str>>(paths: &[S]) -> Self {
        let mut tree = EagerTree::default();
        for path in paths {
            let mut node = &mut tree;
            for segment in path.as_ref().split('.').map(str::trim).filter(|s| !s.is_empty()) {
                let idx = match node.children.iter().position(|(name, _)| name == segment) {
                    Some(idx) => idx,
                    None => {
                        node.children.push((segment.to_string(), EagerTree::default()));
                        node.children.len() - 1
                    }
                };
                node = &mut node.children[idx].1;
            }
        }
        tree
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> &[(String, EagerTree)] {
        &self.children
    }
}

/// Resolve `paths` for `parents`: one query per relation per level.
pub fn eager_load<S: AsRef<str>>(db: &mut dyn Executor, parents: &mut [Record], paths: &[S]) -> Result<()> {
    load_level(db, parents, &EagerTree::parse(paths))
}

fn load_level(db: &mut dyn Executor, parents: &mut [Record], tree: &EagerTree) -> Result<()> {
    let meta = match parents.first() {
        Some(record) => record.meta(),
        None => return Ok(()),
    };

    for (name, nested) in tree.children() {
        let relation = meta.resolved_relation(name)?;
        let strategy = relation.strategy();

        let mut results = match strategy.eager_query(parents)? {
            Some(query) => query.get_records(db)?,
            None => Vec::new(),
        };
        tracing::debug!(
            relation = %name,
            parents = parents.len(),
            results = results.len(),
            "eager loaded relation"
        );

        if !nested.is_empty() {
            load_level(db, &mut results, nested)?;
        }

        strategy.match_results(parents, results);
    }

    Ok(())
}
