//! Metadata registry.
//!
//! Each entity type is described once, on first use, and the descriptor is
//! kept for the life of the process. Descriptors are leaked into `'static`
//! storage so relation handles and query builders can hold plain references.

use crate::builder::Query;
use crate::error::{QueryError, Result};
use crate::naming;
use crate::relation::{Relation, RelationDef, RelationKind};
use crate::schema::{ColumnDef, EntityDef, TableName};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

/// A type persisted in one table.
pub trait Entity: Serialize + DeserializeOwned + 'static {
    /// Columns and relations of the entity.
    fn definition() -> EntityDef;

    /// Start a query against the entity's table.
    fn query() -> Result<Query<Self>>
    where
        Self: Sized,
    {
        Query::for_entity(describe::<Self>()?)
    }
}

/// Cached descriptor set for one entity type
pub struct EntityMeta {
    type_id: TypeId,
    name: String,
    table: Option<String>,
    columns: Vec<ColumnDef>,
    relations: Vec<RelationDef>,
    primary_key: Option<usize>,
    /// Declarations resolved against the registry, or the configuration error
    /// that stopped resolution. Set once, right after the meta is cached.
    resolved: OnceLock<std::result::Result<Vec<Relation>, String>>,
}

impl fmt::Debug for EntityMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // resolved relations point back at their parent meta
        f.debug_struct("EntityMeta")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("columns", &self.columns)
            .field("relations", &self.relations)
            .field("primary_key", &self.primary_key)
            .finish_non_exhaustive()
    }
}

impl EntityMeta {
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Unqualified type name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn require_table(&self) -> Result<&str> {
        self.table()
            .ok_or_else(|| QueryError::config(format!("entity {} has no table designation", self.name)))
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn relations(&self) -> &[RelationDef] {
        &self.relations
    }

    pub fn primary_key(&self) -> Option<&ColumnDef> {
        self.primary_key.map(|idx| &self.columns[idx])
    }

    pub fn require_primary_key(&self) -> Result<&ColumnDef> {
        self.primary_key()
            .ok_or_else(|| QueryError::config(format!("entity {} has no primary key", self.name)))
    }

    /// Column by database name, ignoring case.
    pub fn column(&self, db_name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.db_name.eq_ignore_ascii_case(db_name))
    }

    pub fn column_for_field(&self, field_name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.field_name == field_name)
    }

    pub fn relation(&self, name: &str) -> Result<&RelationDef> {
        self.relations
            .iter()
            .find(|r| r.name() == name)
            .ok_or_else(|| self.unknown_relation(name))
    }

    /// Every declaration resolved against the registry, in declaration order.
    ///
    /// Resolution happens once; a failure is kept and returned on every call.
    pub fn resolved_relations(&'static self) -> Result<&'static [Relation]> {
        let outcome = self.resolved.get_or_init(|| {
            self.relations
                .iter()
                .map(|def| def.resolve(self))
                .collect::<Result<Vec<_>>>()
                .map_err(|e| match e {
                    QueryError::Config(message) => message,
                    other => other.to_string(),
                })
        });

        match outcome {
            Ok(relations) => Ok(relations.as_slice()),
            Err(message) => Err(QueryError::Config(message.clone())),
        }
    }

    pub fn resolved_relation(&'static self, name: &str) -> Result<&'static Relation> {
        self.resolved_relations()?
            .iter()
            .find(|r| r.strategy().name() == name)
            .ok_or_else(|| self.unknown_relation(name))
    }

    fn unknown_relation(&self, name: &str) -> QueryError {
        QueryError::config(format!("entity {} has no relation named {}", self.name, name))
    }
}

type Registry = RwLock<HashMap<TypeId, &'static EntityMeta>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Describe `E`, computing its descriptor set on first call.
pub fn describe<E: Entity>() -> Result<&'static EntityMeta> {
    let type_id = TypeId::of::<E>();

    if let Some(&meta) = registry().read().get(&type_id) {
        return cached(meta);
    }

    let meta = {
        let mut cache = registry().write();
        if let Some(&meta) = cache.get(&type_id) {
            return cached(meta);
        }

        let meta = build(type_id, type_name::<E>(), E::definition())?;
        tracing::debug!(entity = %meta.name, table = ?meta.table, "described entity");

        let meta: &'static EntityMeta = Box::leak(Box::new(meta));
        cache.insert(type_id, meta);
        meta
    };

    // outside the lock: related entities may describe this one again
    meta.resolved_relations()?;
    Ok(meta)
}

/// A cached meta whose relations are still resolving (a relation cycle, or
/// another thread) is returned as is.
fn cached(meta: &'static EntityMeta) -> Result<&'static EntityMeta> {
    match meta.resolved.get() {
        Some(Err(message)) => Err(QueryError::Config(message.clone())),
        _ => Ok(meta),
    }
}

fn build(type_id: TypeId, full_name: &str, def: EntityDef) -> Result<EntityMeta> {
    let name = naming::short_type_name(full_name).to_string();

    let table = match def.table {
        TableName::Explicit(table) => table,
        TableName::Derived => naming::table_for_type(full_name),
        TableName::None => {
            return Ok(EntityMeta {
                type_id,
                name,
                table: None,
                columns: Vec::new(),
                relations: Vec::new(),
                primary_key: None,
                resolved: OnceLock::new(),
            });
        }
    };

    let mut seen = HashSet::new();
    for column in &def.columns {
        if !seen.insert(column.db_name.to_ascii_lowercase()) {
            return Err(QueryError::config(format!(
                "entity {} declares column {} twice",
                name, column.db_name
            )));
        }
    }

    let keys: Vec<usize> = def
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.primary_key)
        .map(|(idx, _)| idx)
        .collect();
    if keys.len() > 1 {
        return Err(QueryError::config(format!(
            "entity {} declares {} primary keys",
            name,
            keys.len()
        )));
    }

    let mut relation_names = HashSet::new();
    for relation in &def.relations {
        if !relation_names.insert(relation.name()) {
            return Err(QueryError::config(format!(
                "entity {} declares relation {} twice",
                name,
                relation.name()
            )));
        }

        if relation.kind() == RelationKind::BelongsTo {
            let foreign_key = relation.belongs_to_foreign_key();
            if !def
                .columns
                .iter()
                .any(|c| c.db_name.eq_ignore_ascii_case(&foreign_key))
            {
                return Err(QueryError::config(format!(
                    "relation {}.{} uses foreign key {} which is not a declared column",
                    name,
                    relation.name(),
                    foreign_key
                )));
            }
        }
    }

    Ok(EntityMeta {
        type_id,
        name,
        table: Some(table),
        primary_key: keys.first().copied(),
        columns: def.columns,
        relations: def.relations,
        resolved: OnceLock::new(),
    })
}
