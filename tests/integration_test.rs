use quarry::backend::{LiveColumn, DISABLE_FOREIGN_KEYS, ENABLE_FOREIGN_KEYS};
use quarry::mock::MockFailure;
use quarry::prelude::*;
use quarry::Migration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Permission {
    id: u32,
    name: String,
}

impl Entity for Permission {
    fn definition() -> EntityDef {
        EntityDef::derived()
            .column(ColumnDef::new("id", ColumnType::Int).unsigned().primary_key().auto_increment())
            .column(ColumnDef::new("name", ColumnType::Varchar).length(64))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Role {
    id: u32,
    name: String,
    #[serde(default, skip_serializing)]
    permissions: Vec<Permission>,
}

impl Entity for Role {
    fn definition() -> EntityDef {
        EntityDef::derived()
            .column(ColumnDef::new("id", ColumnType::Int).unsigned().primary_key().auto_increment())
            .column(ColumnDef::new("name", ColumnType::Varchar).length(64))
            .relation(RelationDef::has_many::<User>("users").foreign_key("roleId"))
            .relation(RelationDef::belongs_to_many::<Permission>("permissions"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: u32,
    email: String,
    active: bool,
    #[serde(rename = "roleId")]
    role_id: u32,
    #[serde(default, skip_serializing)]
    role: Option<Role>,
}

impl Entity for User {
    fn definition() -> EntityDef {
        EntityDef::derived()
            .column(ColumnDef::new("id", ColumnType::Int).unsigned().primary_key().auto_increment())
            .column(ColumnDef::new("email", ColumnType::Varchar).unique())
            .column(ColumnDef::new("active", ColumnType::Boolean))
            .column(ColumnDef::new("roleId", ColumnType::Int).unsigned())
            .relation(RelationDef::belongs_to::<Role>("role").foreign_key("roleId"))
            .relation(RelationDef::has_one::<Profile>("profile"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    id: u32,
    user_id: u32,
    bio: String,
}

impl Entity for Profile {
    fn definition() -> EntityDef {
        EntityDef::table("profiles")
            .column(ColumnDef::new("id", ColumnType::Int).unsigned().primary_key().auto_increment())
            .column(ColumnDef::new("user_id", ColumnType::Int).unsigned())
            .column(ColumnDef::new("bio", ColumnType::Text))
    }
}

fn user_row(id: u32, role: u32) -> serde_json::Value {
    json!({ "id": id, "email": format!("user{}@example.com", id), "active": 1, "roleId": role })
}

fn synced_users() -> Vec<LiveColumn> {
    vec![
        LiveColumn::new("id", "int(10) unsigned", false).with_extra("auto_increment"),
        LiveColumn::new("email", "varchar(255)", false),
        LiveColumn::new("active", "tinyint(1)", false),
        LiveColumn::new("roleId", "int(10) unsigned", false),
    ]
}

#[test]
fn test_compiles_user_query_with_aligned_bindings() {
    let (sql, bindings) = User::query()
        .unwrap()
        .where_eq("active", 1)
        .where_in("roleId", [1, 2])
        .order_by("id", "DESC")
        .limit(10)
        .to_sql()
        .unwrap();

    assert_eq!(
        sql,
        "SELECT * FROM users WHERE active = ? AND roleId IN (?, ?) ORDER BY id DESC LIMIT 10"
    );
    assert_eq!(bindings, vec![json!(1), json!(1), json!(2)]);
    assert_eq!(sql.matches('?').count(), bindings.len());
}

#[test]
fn test_synchronize_users_then_rerun() {
    let mut db = MockExecutor::new();
    let mut sync = SchemaSync::new();
    sync.register::<User>().unwrap();

    let plan = sync.sync(&mut db).unwrap();
    let statements = plan.statements();
    assert_eq!(statements.len(), 2);
    assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS users ("));
    assert!(statements[1].starts_with("ALTER TABLE users ADD CONSTRAINT fk_users_roleId FOREIGN KEY (roleId)"));

    let executed: Vec<&str> = db.statements().iter().map(|s| s.sql.as_str()).collect();
    assert_eq!(executed.first(), Some(&DISABLE_FOREIGN_KEYS));
    assert_eq!(executed.last(), Some(&ENABLE_FOREIGN_KEYS));

    let mut live = MockExecutor::new();
    live.set_table("users", synced_users())
        .set_constraints("users", &["fk_users_roleId"])
        .set_indexes("users", &["PRIMARY", "users_email_unique", "fk_users_roleId"]);
    assert_eq!(sync.generate(&mut live).unwrap().statements(), Vec::<String>::new());
}

#[test]
fn test_creates_precede_constraints_across_entities() {
    let mut db = MockExecutor::new();
    let mut sync = SchemaSync::new();
    sync.register::<User>()
        .unwrap()
        .register::<Role>()
        .unwrap()
        .register::<Permission>()
        .unwrap();

    let statements = sync.generate(&mut db).unwrap().statements();
    let last_create = statements
        .iter()
        .rposition(|s| s.starts_with("CREATE TABLE"))
        .unwrap();
    let first_constraint = statements
        .iter()
        .position(|s| s.contains("ADD CONSTRAINT"))
        .unwrap();
    assert!(last_create < first_constraint);
    assert!(statements
        .iter()
        .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS permissions_roles (")));
    assert_eq!(statements.iter().filter(|s| s.contains("ADD CONSTRAINT")).count(), 3);
}

#[test]
fn test_nested_eager_load_issues_one_query_per_level() {
    let mut db = MockExecutor::new();
    db.push_json(vec![user_row(1, 1), user_row(2, 2), user_row(3, 1)])
        .push_json(vec![json!({ "id": 1, "name": "admin" }), json!({ "id": 2, "name": "editor" })])
        .push_json(vec![
            json!({ "id": 10, "name": "write", "__pivot_parent_key": 1 }),
            json!({ "id": 11, "name": "read", "__pivot_parent_key": 1 }),
            json!({ "id": 11, "name": "read", "__pivot_parent_key": 2 }),
        ]);

    let users = User::query()
        .unwrap()
        .with(["role.permissions"])
        .get(&mut db)
        .unwrap();

    let selects = db.selects();
    assert_eq!(selects.len(), 3);
    assert_eq!(selects[1].sql, "SELECT * FROM roles WHERE id IN (?, ?)");
    assert_eq!(selects[1].bindings, vec![json!(1), json!(2)]);
    assert_eq!(
        selects[2].sql,
        "SELECT permissions.*, permissions_roles.role_id AS __pivot_parent_key FROM permissions \
         INNER JOIN permissions_roles ON permissions_roles.permission_id = permissions.id \
         WHERE permissions_roles.role_id IN (?, ?)"
    );

    // relation fields on the entity are hydrated from the loaded records
    let admin = users[0].role.as_ref().unwrap();
    assert_eq!(admin.name, "admin");
    assert_eq!(admin.permissions.len(), 2);
    assert_eq!(users[2].role.as_ref().unwrap().id, 1);

    let editor = users[1].one::<Role>("role").unwrap().unwrap();
    let permissions = editor.many::<Permission>("permissions").unwrap();
    assert_eq!(permissions.len(), 1);
    assert_eq!(permissions[0].name, "read");
    assert!(permissions[0].record().get("__pivot_parent_key").is_none());
}

#[test]
fn test_eager_and_lazy_belongs_to_agree() {
    let mut db = MockExecutor::new();
    db.push_json(vec![user_row(1, 2)])
        .push_json(vec![json!({ "id": 2, "name": "editor" })]);

    let mut lazy_user = User::query().unwrap().find(&mut db, 1).unwrap().unwrap();
    let lazy_role = lazy_user.load_one::<Role>(&mut db, "role").unwrap().unwrap();
    assert_eq!(
        db.statements()[1].sql,
        "SELECT * FROM roles WHERE id = ? LIMIT 1"
    );

    let mut db = MockExecutor::new();
    db.push_json(vec![user_row(1, 2), user_row(4, 1)])
        .push_json(vec![json!({ "id": 1, "name": "admin" }), json!({ "id": 2, "name": "editor" })]);
    let users = User::query().unwrap().with(["role"]).get(&mut db).unwrap();
    let eager_role = users[0].one::<Role>("role").unwrap().unwrap();

    assert_eq!(eager_role.key(), lazy_role.key());
    assert_eq!(eager_role.name, lazy_role.name);
    assert_eq!(lazy_user.role.as_ref().map(|r| r.id), Some(2));
}

#[test]
fn test_lazy_collection_relations() {
    let mut db = MockExecutor::new();
    db.push_json(vec![json!({ "id": 1, "name": "admin" })])
        .push_json(vec![user_row(5, 1), user_row(6, 1)])
        .push_json(vec![
            json!({ "id": 10, "name": "write", "__pivot_parent_key": 1 }),
            json!({ "id": 11, "name": "read", "__pivot_parent_key": 1 }),
        ]);

    let mut role = Role::query().unwrap().find(&mut db, 1).unwrap().unwrap();

    let users = role.load::<User>(&mut db, "users").unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(users[1].id, 6);
    assert_eq!(db.statements()[1].sql, "SELECT * FROM users WHERE roleId = ?");
    assert_eq!(db.statements()[1].bindings, vec![json!(1)]);

    let permissions = role.load::<Permission>(&mut db, "permissions").unwrap();
    assert_eq!(
        db.statements()[2].sql,
        "SELECT permissions.*, permissions_roles.role_id AS __pivot_parent_key FROM permissions \
         INNER JOIN permissions_roles ON permissions_roles.permission_id = permissions.id \
         WHERE permissions_roles.role_id = ?"
    );
    assert_eq!(db.statements()[2].bindings, vec![json!(1)]);
    assert_eq!(permissions.len(), 2);
    assert!(permissions
        .iter()
        .all(|p| p.record().get("__pivot_parent_key").is_none()));

    // lazily loaded relations land on the entity and stay readable
    assert_eq!(role.permissions.len(), 2);
    assert_eq!(role.many::<User>("users").unwrap().len(), 2);
    assert_eq!(db.selects().len(), 3);
}

#[test]
fn test_lazy_has_one() {
    let mut db = MockExecutor::new();
    db.push_json(vec![user_row(6, 1)])
        .push_json(vec![json!({ "id": 9, "user_id": 6, "bio": "hello" })]);

    let mut user = User::query().unwrap().find(&mut db, 6).unwrap().unwrap();
    let profile = user.load_one::<Profile>(&mut db, "profile").unwrap().unwrap();

    assert_eq!(profile.bio, "hello");
    assert_eq!(
        db.statements()[1].sql,
        "SELECT * FROM profiles WHERE user_id = ? LIMIT 1"
    );
    assert_eq!(db.statements()[1].bindings, vec![json!(6)]);

    // no matching row
    db.clear_statements();
    assert!(user.load_one::<Profile>(&mut db, "profile").unwrap().is_none());
    assert_eq!(db.selects().len(), 1);
}

#[test]
fn test_has_many_and_has_one_matching() {
    let mut db = MockExecutor::new();
    db.push_json(vec![json!({ "id": 1, "name": "admin" }), json!({ "id": 2, "name": "editor" })])
        .push_json(vec![user_row(5, 1), user_row(6, 1)]);

    let roles = Role::query().unwrap().with(["users"]).get(&mut db).unwrap();
    assert_eq!(db.selects()[1].sql, "SELECT * FROM users WHERE roleId IN (?, ?)");
    assert_eq!(roles[0].many::<User>("users").unwrap().len(), 2);
    assert!(roles[1].many::<User>("users").unwrap().is_empty());

    let mut db = MockExecutor::new();
    db.push_json(vec![user_row(5, 1), user_row(6, 1)])
        .push_json(vec![json!({ "id": 9, "user_id": 6, "bio": "hello" })]);

    let users = User::query().unwrap().with(["profile"]).get(&mut db).unwrap();
    assert_eq!(db.selects()[1].sql, "SELECT * FROM profiles WHERE user_id IN (?, ?)");
    assert!(users[0].one::<Profile>("profile").unwrap().is_none());
    assert_eq!(users[1].one::<Profile>("profile").unwrap().unwrap().bio, "hello");
    assert!(matches!(
        users[0].many::<Role>("role"),
        Err(QueryError::RelationNotLoaded(_))
    ));
}

#[test]
fn test_eager_load_of_empty_batch_and_unknown_relation() {
    let mut db = MockExecutor::new();
    let users = User::query().unwrap().with(["role"]).get(&mut db).unwrap();
    assert!(users.is_empty());
    assert_eq!(db.selects().len(), 1);

    let mut db = MockExecutor::new();
    db.push_json(vec![user_row(1, 1)]);
    let result = User::query().unwrap().with(["manager"]).get(&mut db);
    assert!(matches!(result, Err(QueryError::Config(_))));
}

#[test]
fn test_pivot_sync_is_idempotent() {
    let mut db = MockExecutor::new();
    db.push_json(vec![json!({ "id": 1, "name": "admin" })]);
    let role = Role::query().unwrap().find(&mut db, 1).unwrap().unwrap();
    db.clear_statements();

    db.push_json(vec![json!({ "permission_id": 1 }), json!({ "permission_id": 2 })]);
    let changes = role.sync(&mut db, "permissions", [2, 3]).unwrap();
    assert_eq!(changes.attached, vec![json!(3)]);
    assert_eq!(changes.detached, vec![json!(1)]);

    let writes = db.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(
        writes[0].sql,
        "DELETE FROM permissions_roles WHERE role_id = ? AND permission_id IN (?)"
    );
    assert_eq!(writes[0].bindings, vec![json!(1), json!(1)]);
    assert_eq!(
        writes[1].sql,
        "INSERT INTO permissions_roles (role_id, permission_id) VALUES (?, ?)"
    );
    assert_eq!(writes[1].bindings, vec![json!(1), json!(3)]);

    db.clear_statements();
    db.push_json(vec![json!({ "permission_id": 2 }), json!({ "permission_id": 3 })]);
    let changes = role.sync(&mut db, "permissions", [2, 3]).unwrap();
    assert!(changes.is_empty());
    assert!(db.writes().is_empty());
    assert_eq!(db.selects().len(), 1);
}

#[test]
fn test_attach_tolerates_duplicates_and_detach_all() {
    let mut db = MockExecutor::new();
    db.push_json(vec![json!({ "id": 1, "name": "admin" })]);
    let role = Role::query().unwrap().find(&mut db, 1).unwrap().unwrap();

    db.fail_on("INSERT INTO permissions_roles", MockFailure::DuplicateKey);
    assert_eq!(role.attach(&mut db, "permissions", [4]).unwrap(), 0);

    db.clear_statements();
    role.detach_all(&mut db, "permissions").unwrap();
    assert_eq!(db.statements()[0].sql, "DELETE FROM permissions_roles WHERE role_id = ?");

    // only many-to-many relations take pivot changes
    assert!(role.attach(&mut db, "users", [1]).is_err());

    let unsaved = Model::new(Role {
        id: 0,
        name: "guest".to_string(),
        permissions: Vec::new(),
    })
    .unwrap();
    assert!(unsaved.attach(&mut db, "permissions", [1]).is_err());
}

#[test]
fn test_save_maps_fields_to_columns() {
    let mut db = MockExecutor::new();
    db.set_next_insert_id(42);

    let mut user = Model::new(User {
        id: 0,
        email: "new@example.com".to_string(),
        active: true,
        role_id: 3,
        role: None,
    })
    .unwrap();
    user.save(&mut db).unwrap();

    assert_eq!(user.id, 42);
    assert_eq!(
        db.statements()[0].sql,
        "INSERT INTO users (email, active, roleId) VALUES (?, ?, ?)"
    );
    assert_eq!(
        db.statements()[0].bindings,
        vec![json!("new@example.com"), json!(true), json!(3)]
    );
}

#[test]
fn test_generated_migration_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut db = MockExecutor::new();
    let mut sync = SchemaSync::new();
    sync.register::<User>().unwrap();
    let plan = sync.generate(&mut db).unwrap();

    let writer = MigrationWriter::new(dir.path());
    let path = writer.write_plan("create users", &plan).unwrap().unwrap();
    let migration = Migration::load(&path).unwrap();

    assert_eq!(migration.up, plan.statements());
    assert_eq!(
        migration.down,
        vec![
            "ALTER TABLE users DROP FOREIGN KEY fk_users_roleId".to_string(),
            "DROP TABLE IF EXISTS users".to_string(),
        ]
    );

    let migrator = Migrator::new(MigrationConfig {
        directory: dir.path().to_path_buf(),
        ..Default::default()
    });

    let mut db = MockExecutor::new();
    db.push_json(vec![]).push_json(vec![json!({ "batch": 3 })]);
    let applied = migrator.run(&mut db).unwrap();
    assert_eq!(applied, vec![migration.name.clone()]);

    let ledger = db.statements().last().unwrap();
    assert_eq!(ledger.bindings, vec![json!(migration.name), json!(4)]);
    assert!(db
        .statements()
        .iter()
        .any(|s| s.sql.starts_with("CREATE TABLE IF NOT EXISTS users (")));

    // a second run finds nothing pending
    let mut db = MockExecutor::new();
    db.set_table("migrations", vec![LiveColumn::new("id", "int unsigned", false)]);
    db.push_json(vec![json!({ "migration": migration.name, "batch": 4 })]);
    assert!(migrator.run(&mut db).unwrap().is_empty());
}
