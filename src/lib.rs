//! quarry - attribute-driven persistence for MySQL-family databases
//!
//! Entity types describe their columns and relationships once. From that
//! description quarry builds queries with positional bindings, resolves
//! relationships lazily or in batches, diffs the declared schema against a
//! live database and writes replayable migrations.
//!
//! # Architecture
//!
//! - **Metadata Registry**: each entity is described on first use and cached
//!   for the life of the process
//! - **Query Builder**: chainable SELECT accumulator compiled to SQL text plus
//!   bindings, hydrating rows into typed models
//! - **Relation Engine**: belongs-to, has-one, has-many and many-to-many
//!   through a pivot, with nested eager loading at one query per level
//! - **Schema Synchronizer**: additive, non-destructive DDL from a live-schema
//!   diff
//! - **Migrations**: timestamped artifacts with derived reversals and a
//!   ledger of applied batches
//!
//! # Example
//!
//! ```rust
//! use quarry::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Role {
//!     id: u32,
//!     name: String,
//! }
//!
//! impl Entity for Role {
//!     fn definition() -> EntityDef {
//!         EntityDef::derived()
//!             .column(ColumnDef::new("id", ColumnType::Int).unsigned().primary_key().auto_increment())
//!             .column(ColumnDef::new("name", ColumnType::Varchar).length(64))
//!     }
//! }
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct User {
//!     id: u32,
//!     email: String,
//!     #[serde(rename = "roleId")]
//!     role_id: u32,
//! }
//!
//! impl Entity for User {
//!     fn definition() -> EntityDef {
//!         EntityDef::derived()
//!             .column(ColumnDef::new("id", ColumnType::Int).unsigned().primary_key().auto_increment())
//!             .column(ColumnDef::new("email", ColumnType::Varchar).unique())
//!             .column(ColumnDef::new("roleId", ColumnType::Int).unsigned())
//!             .relation(RelationDef::belongs_to::<Role>("role").foreign_key("roleId"))
//!     }
//! }
//!
//! fn main() -> quarry::Result<()> {
//!     let (sql, bindings) = User::query()?
//!         .where_eq("active", 1)
//!         .where_in("roleId", [1, 2])
//!         .order_by("id", "DESC")
//!         .limit(10)
//!         .to_sql()?;
//!
//!     assert_eq!(
//!         sql,
//!         "SELECT * FROM users WHERE active = ? AND roleId IN (?, ?) ORDER BY id DESC LIMIT 10"
//!     );
//!     assert_eq!(bindings.len(), 3);
//!
//!     // an empty database gets CREATE TABLE users plus the role foreign key
//!     let mut db = MockExecutor::new();
//!     let mut sync = SchemaSync::new();
//!     sync.register::<User>()?;
//!     assert_eq!(sync.generate(&mut db)?.executable().len(), 2);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Backend Support
//!
//! The engine talks to any `Executor`. A blocking sqlx-backed MySQL executor
//! ships behind a feature:
//!
//! ```toml
//! [dependencies]
//! quarry = { version = "0.1", features = ["mysql"] }
//! ```

pub mod backend;
pub mod builder;
pub mod error;
pub mod migration;
pub mod mock;
pub mod model;
pub mod naming;
pub mod registry;
pub mod relation;
pub mod schema;
pub mod sync;

#[cfg(feature = "mysql")]
pub mod mysql;

pub use backend::{
    with_foreign_keys_disabled, ExecResult, Executor, LiveColumn, QueryResult, QueryRow,
};
pub use builder::{
    AggregateFunc, ComparisonOp, JoinType, LogicalOp, Page, Query, QueryBuilder, SortDirection,
};
pub use error::{QueryError, Result};
pub use migration::{
    Migration, MigrationConfig, MigrationStatus, MigrationWriter, Migrator, PatternReverser,
    ReverseStrategy,
};
pub use model::{FromRecord, Loaded, Model, Record};
pub use registry::{describe, Entity, EntityMeta};
pub use relation::{PivotChanges, Relation, RelationDef, RelationKind, RelationStrategy};
pub use schema::{ColumnDef, ColumnType, EntityDef, ReferentialAction};
pub use sync::{SchemaSync, SyncConfig, SyncPlan};

#[cfg(feature = "mysql")]
pub use mysql::MySqlBackend;

/// Prelude for common imports
pub mod prelude {
    pub use crate::backend::{Executor, QueryRow};
    pub use crate::builder::{Page, Query, QueryBuilder};
    pub use crate::error::{QueryError, Result};
    pub use crate::migration::{MigrationConfig, MigrationWriter, Migrator};
    pub use crate::mock::MockExecutor;
    pub use crate::model::{Model, Record};
    pub use crate::registry::Entity;
    pub use crate::relation::RelationDef;
    pub use crate::schema::{ColumnDef, ColumnType, EntityDef, ReferentialAction};
    pub use crate::sync::{SchemaSync, SyncConfig};

    #[cfg(feature = "mysql")]
    pub use crate::mysql::MySqlBackend;
}
