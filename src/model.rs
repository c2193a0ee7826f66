//! Hydrated rows.
//!
//! `Record` is the untyped form: database attributes keyed by column name
//! plus the relations resolved for it. `Model<E>` pairs a record with the
//! typed entity deserialized from it and carries the write operations.

use crate::backend::{Executor, QueryRow};
use crate::builder::QueryBuilder;
use crate::error::{QueryError, Result};
use crate::registry::{describe, Entity, EntityMeta};
use crate::relation::{BelongsToMany, PivotChanges, Relation};
use crate::schema::ColumnType;
use serde_json::{Map, Value};
use std::any::TypeId;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Row type a query can hydrate into
pub trait FromRecord: Sized {
    fn from_record(record: Record) -> Result<Self>;
}

/// Resolved relation value attached to a record
#[derive(Debug, Clone)]
pub enum Loaded {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
}

impl Loaded {
    fn to_json(&self) -> Value {
        match self {
            Loaded::One(Some(record)) => record.to_json(),
            Loaded::One(None) => Value::Null,
            Loaded::Many(records) => Value::Array(records.iter().map(Record::to_json).collect()),
        }
    }
}

/// One row of an entity's table
#[derive(Debug, Clone)]
pub struct Record {
    meta: &'static EntityMeta,
    attributes: QueryRow,
    relations: BTreeMap<String, Loaded>,
    exists: bool,
}

impl Record {
    /// Record for a row read from the database
    pub fn from_row(meta: &'static EntityMeta, row: QueryRow) -> Self {
        Self {
            meta,
            attributes: row,
            relations: BTreeMap::new(),
            exists: true,
        }
    }

    /// Record not yet persisted
    pub fn new(meta: &'static EntityMeta, attributes: QueryRow) -> Self {
        Self {
            meta,
            attributes,
            relations: BTreeMap::new(),
            exists: false,
        }
    }

    pub fn meta(&self) -> &'static EntityMeta {
        self.meta
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn attributes(&self) -> &QueryRow {
        &self.attributes
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.attributes.value_ci(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.attributes.insert(column, value);
    }

    pub(crate) fn take(&mut self, column: &str) -> Option<Value> {
        self.attributes.remove(column)
    }

    /// Primary key value, if set
    pub fn key(&self) -> Option<&Value> {
        let key = self.meta.primary_key()?;
        self.get(&key.db_name).filter(|v| !v.is_null())
    }

    pub fn relation(&self, name: &str) -> Option<&Loaded> {
        self.relations.get(name)
    }

    pub fn relation_loaded(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub fn set_relation(&mut self, name: &str, loaded: Loaded) {
        self.relations.insert(name.to_string(), loaded);
    }

    /// Related records under `name`, regardless of cardinality.
    pub fn related(&self, name: &str) -> Result<Vec<&Record>> {
        match self.relations.get(name) {
            Some(Loaded::One(one)) => Ok(one.iter().map(|r| r.as_ref()).collect()),
            Some(Loaded::Many(many)) => Ok(many.iter().collect()),
            None => Err(self.not_loaded(name)),
        }
    }

    fn not_loaded(&self, name: &str) -> QueryError {
        QueryError::RelationNotLoaded(format!("{}.{}", self.meta.name(), name))
    }

    /// Field-keyed JSON object: attributes under their field names plus
    /// loaded relations under their relation names.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();

        for (column, value) in &self.attributes.columns {
            match self.meta.column(column) {
                Some(def) => {
                    let value = if def.column_type == ColumnType::Boolean {
                        coerce_bool(value)
                    } else {
                        value.clone()
                    };
                    object.insert(def.field_name.clone(), value);
                }
                None => {
                    object.insert(column.clone(), value.clone());
                }
            }
        }

        for (name, loaded) in &self.relations {
            object.insert(name.clone(), loaded.to_json());
        }

        Value::Object(object)
    }
}

impl FromRecord for Record {
    fn from_record(record: Record) -> Result<Self> {
        Ok(record)
    }
}

/// TINYINT(1) comes back as a number.
fn coerce_bool(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::Bool(n.as_i64().is_some_and(|n| n != 0)),
        Value::String(s) if s == "0" || s == "1" => Value::Bool(s == "1"),
        other => other.clone(),
    }
}

fn is_unset_key(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Number(n) => n.as_i64() == Some(0),
        _ => false,
    }
}

fn now_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Column-keyed attributes of `entity`; fields without a column are skipped.
fn attributes_of<E: Entity>(meta: &EntityMeta, entity: &E) -> Result<QueryRow> {
    let value = serde_json::to_value(entity)?;
    let Value::Object(fields) = value else {
        return Err(QueryError::Hydration(format!(
            "{} does not serialize to an object",
            meta.name()
        )));
    };

    let mut attributes = QueryRow::new();
    for column in meta.columns() {
        if let Some(value) = fields.get(&column.field_name) {
            attributes.insert(column.db_name.clone(), value.clone());
        }
    }
    Ok(attributes)
}

fn hydrate<E: Entity>(record: &Record) -> Result<E> {
    serde_json::from_value(record.to_json())
        .map_err(|e| QueryError::Hydration(format!("{}: {}", record.meta.name(), e)))
}

/// Typed entity backed by a record
pub struct Model<E> {
    entity: E,
    record: Record,
}

impl<E: Entity> FromRecord for Model<E> {
    fn from_record(record: Record) -> Result<Self> {
        let entity = hydrate(&record)?;
        Ok(Self { entity, record })
    }
}

impl<E: Entity> Model<E> {
    /// Wrap an entity that has not been saved yet.
    pub fn new(entity: E) -> Result<Self> {
        let meta = describe::<E>()?;
        meta.require_table()?;
        let attributes = attributes_of(meta, &entity)?;
        Ok(Self {
            entity,
            record: Record::new(meta, attributes),
        })
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn into_inner(self) -> E {
        self.entity
    }

    pub fn exists(&self) -> bool {
        self.record.exists
    }

    pub fn key(&self) -> Option<&Value> {
        self.record.key()
    }

    fn meta(&self) -> &'static EntityMeta {
        self.record.meta
    }

    fn resolve(&self, name: &str) -> Result<&'static Relation> {
        self.meta().resolved_relation(name)
    }

    fn expect_related<R: Entity>(record: &Record) -> Result<()> {
        if record.meta.type_id() != TypeId::of::<R>() {
            return Err(QueryError::config(format!(
                "related record is a {}, not {}",
                record.meta.name(),
                std::any::type_name::<R>()
            )));
        }
        Ok(())
    }

    /// Loaded single-valued relation.
    pub fn one<R: Entity>(&self, name: &str) -> Result<Option<Model<R>>> {
        match self.record.relation(name) {
            Some(Loaded::One(Some(record))) => {
                Self::expect_related::<R>(record)?;
                Model::from_record(record.as_ref().clone()).map(Some)
            }
            Some(Loaded::One(None)) => Ok(None),
            Some(Loaded::Many(_)) => Err(QueryError::config(format!(
                "relation {}.{} holds many records",
                self.meta().name(),
                name
            ))),
            None => Err(self.record.not_loaded(name)),
        }
    }

    /// Loaded collection relation.
    pub fn many<R: Entity>(&self, name: &str) -> Result<Vec<Model<R>>> {
        match self.record.relation(name) {
            Some(Loaded::Many(records)) => records
                .iter()
                .map(|record| {
                    Self::expect_related::<R>(record)?;
                    Model::from_record(record.clone())
                })
                .collect(),
            Some(Loaded::One(_)) => Err(QueryError::config(format!(
                "relation {}.{} holds a single record",
                self.meta().name(),
                name
            ))),
            None => Err(self.record.not_loaded(name)),
        }
    }

    fn load_relation(&mut self, db: &mut dyn Executor, name: &str) -> Result<()> {
        let relation = self.resolve(name)?;
        let loaded = relation.strategy().get_results(db, &self.record)?;
        self.record.set_relation(name, loaded);
        self.entity = hydrate(&self.record)?;
        Ok(())
    }

    /// Resolve a collection relation lazily, replacing any loaded value.
    pub fn load<R: Entity>(&mut self, db: &mut dyn Executor, name: &str) -> Result<Vec<Model<R>>> {
        self.load_relation(db, name)?;
        self.many(name)
    }

    /// Resolve a single-valued relation lazily.
    pub fn load_one<R: Entity>(&mut self, db: &mut dyn Executor, name: &str) -> Result<Option<Model<R>>> {
        self.load_relation(db, name)?;
        self.one(name)
    }

    /// Persist the entity: INSERT when new, UPDATE by primary key otherwise.
    pub fn save(&mut self, db: &mut dyn Executor) -> Result<()> {
        let meta = self.meta();
        let mut attributes = attributes_of(meta, &self.entity)?;

        let now = Value::String(now_stamp());
        for column in meta.columns() {
            let unset = attributes.value(&column.db_name).is_none_or(Value::is_null);
            if column.timestamp_update || (column.timestamp_create && !self.record.exists && unset) {
                attributes.insert(column.db_name.clone(), now.clone());
            }
        }

        let query = QueryBuilder::<Record>::for_entity(meta)?;

        if self.record.exists {
            let key = meta.require_primary_key()?;
            let id = self.record.key().cloned().ok_or_else(|| {
                QueryError::Query(format!("{} has no primary key value to update by", meta.name()))
            })?;

            let values: Vec<(String, Value)> = meta
                .columns()
                .iter()
                .filter(|c| !c.primary_key)
                .filter_map(|c| attributes.value(&c.db_name).map(|v| (c.db_name.clone(), v.clone())))
                .collect();

            if !values.is_empty() {
                query.where_eq(key.db_name.clone(), id).update(db, values)?;
            }
        } else {
            let values: Vec<(String, Value)> = meta
                .columns()
                .iter()
                .filter_map(|c| {
                    let value = attributes.value(&c.db_name)?;
                    if c.auto_increment && is_unset_key(value) {
                        None
                    } else {
                        Some((c.db_name.clone(), value.clone()))
                    }
                })
                .collect();

            let result = query.insert(db, values)?;

            if let (Some(key), Some(id)) = (meta.primary_key(), result.last_insert_id) {
                if key.auto_increment && attributes.value(&key.db_name).is_none_or(is_unset_key) {
                    attributes.insert(key.db_name.clone(), Value::from(id));
                }
            }
            self.record.exists = true;
        }

        for (column, value) in attributes.columns {
            self.record.attributes.insert(column, value);
        }
        self.entity = hydrate(&self.record)?;
        tracing::debug!(entity = %meta.name(), key = ?self.record.key(), "saved model");
        Ok(())
    }

    /// Delete the row by primary key.
    pub fn delete(&mut self, db: &mut dyn Executor) -> Result<u64> {
        let meta = self.meta();
        let key = meta.require_primary_key()?;
        let id = match self.record.key() {
            Some(id) if self.record.exists => id.clone(),
            _ => {
                return Err(QueryError::Query(format!(
                    "{} has not been persisted",
                    meta.name()
                )))
            }
        };

        let deleted = QueryBuilder::<Record>::for_entity(meta)?
            .where_eq(key.db_name.clone(), id)
            .delete(db)?;
        self.record.exists = false;
        Ok(deleted)
    }

    fn pivot(&self, name: &str) -> Result<(BelongsToMany, Value)> {
        let relation = self.resolve(name)?;
        let pivot = relation.as_belongs_to_many()?.clone();
        let key = self
            .record
            .get(&pivot.parent_key)
            .filter(|v| self.record.exists && !v.is_null())
            .cloned()
            .ok_or_else(|| {
                QueryError::Query(format!(
                    "{} must be saved before changing relation {}",
                    self.meta().name(),
                    name
                ))
            })?;
        Ok((pivot, key))
    }

    /// Link related keys through the pivot; already linked keys are skipped.
    pub fn attach<I, V>(&self, db: &mut dyn Executor, name: &str, ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let (pivot, key) = self.pivot(name)?;
        let ids: Vec<Value> = ids.into_iter().map(Into::into).collect();
        pivot.attach(db, &key, &ids)
    }

    pub fn detach<I, V>(&self, db: &mut dyn Executor, name: &str, ids: I) -> Result<u64>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let (pivot, key) = self.pivot(name)?;
        let ids: Vec<Value> = ids.into_iter().map(Into::into).collect();
        pivot.detach(db, &key, Some(&ids))
    }

    /// Remove every pivot row of this model for `name`.
    pub fn detach_all(&self, db: &mut dyn Executor, name: &str) -> Result<u64> {
        let (pivot, key) = self.pivot(name)?;
        pivot.detach(db, &key, None)
    }

    /// Make the linked keys exactly `ids`.
    pub fn sync<I, V>(&self, db: &mut dyn Executor, name: &str, ids: I) -> Result<PivotChanges>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let (pivot, key) = self.pivot(name)?;
        let ids: Vec<Value> = ids.into_iter().map(Into::into).collect();
        pivot.sync(db, &key, &ids)
    }
}

impl<E> Deref for Model<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.entity
    }
}

impl<E> DerefMut for Model<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.entity
    }
}

impl<E: fmt::Debug> fmt::Debug for Model<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("entity", &self.entity)
            .field("exists", &self.record.exists)
            .finish()
    }
}

impl<E: Clone> Clone for Model<E> {
    fn clone(&self) -> Self {
        Self {
            entity: self.entity.clone(),
            record: self.record.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockExecutor;
    use crate::schema::{ColumnDef, EntityDef};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: Option<u64>,
        title: String,
        pinned: bool,
        #[serde(rename = "createdAt")]
        created_at: Option<String>,
    }

    impl Entity for Note {
        fn definition() -> EntityDef {
            EntityDef::table("notes")
                .column(ColumnDef::new("id", ColumnType::BigInt).unsigned().primary_key().auto_increment())
                .column(ColumnDef::new("title", ColumnType::Varchar))
                .column(ColumnDef::new("pinned", ColumnType::Boolean))
                .column(ColumnDef::new("createdAt", ColumnType::Timestamp).name("created_at").created_at())
        }
    }

    fn note(title: &str) -> Note {
        Note {
            id: None,
            title: title.to_string(),
            pinned: false,
            created_at: None,
        }
    }

    #[test]
    fn test_hydration_maps_columns_to_fields() {
        let meta = describe::<Note>().unwrap();
        let row: QueryRow = vec![
            ("id", json!(4)),
            ("title", json!("groceries")),
            ("pinned", json!(1)),
            ("created_at", json!("2024-05-01 10:00:00")),
        ]
        .into_iter()
        .collect();

        let model = Model::<Note>::from_record(Record::from_row(meta, row)).unwrap();
        assert_eq!(model.id, Some(4));
        assert!(model.pinned);
        assert_eq!(model.created_at.as_deref(), Some("2024-05-01 10:00:00"));
        assert!(model.exists());
    }

    #[test]
    fn test_hydration_failure_is_reported() {
        let meta = describe::<Note>().unwrap();
        let row: QueryRow = vec![("id", json!(4))].into_iter().collect();
        let err = Model::<Note>::from_record(Record::from_row(meta, row)).unwrap_err();
        assert!(matches!(err, QueryError::Hydration(_)));
    }

    #[test]
    fn test_save_inserts_then_updates() {
        let mut db = MockExecutor::new();
        db.set_next_insert_id(12);

        let mut model = Model::new(note("groceries")).unwrap();
        model.save(&mut db).unwrap();

        assert_eq!(model.id, Some(12));
        assert!(model.created_at.is_some());
        let insert = &db.statements()[0];
        assert_eq!(
            insert.sql,
            "INSERT INTO notes (title, pinned, created_at) VALUES (?, ?, ?)"
        );
        assert_eq!(insert.bindings[0], json!("groceries"));

        model.title = "chores".to_string();
        model.save(&mut db).unwrap();
        let update = &db.statements()[1];
        assert_eq!(
            update.sql,
            "UPDATE notes SET title = ?, pinned = ?, created_at = ? WHERE id = ?"
        );
        assert_eq!(update.bindings[0], json!("chores"));
        assert_eq!(update.bindings[3], json!(12));
    }

    #[test]
    fn test_delete_requires_persisted_model() {
        let mut db = MockExecutor::new();
        let mut model = Model::new(note("draft")).unwrap();
        assert!(model.delete(&mut db).is_err());

        model.save(&mut db).unwrap();
        db.clear_statements();
        assert_eq!(model.delete(&mut db).unwrap(), 1);
        assert_eq!(db.statements()[0].sql, "DELETE FROM notes WHERE id = ?");
        assert!(!model.exists());
    }

    #[test]
    fn test_unloaded_relation_is_an_error() {
        let model = Model::new(note("x")).unwrap();
        assert!(matches!(
            model.record().related("tags"),
            Err(QueryError::RelationNotLoaded(_))
        ));
    }
}
