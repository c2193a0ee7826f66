use crate::relation::RelationDef;
use std::fmt;

/// SQL type mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Boolean,
    Float,
    Double,
    Decimal(u8, u8),
    Char,
    Varchar,
    Text,
    LongText,
    Date,
    DateTime,
    Timestamp,
    Time,
    Json,
    Blob,
}

impl ColumnType {
    /// Declared type, with `length` applied where the type takes one.
    pub fn to_sql(&self, length: Option<u32>, default_length: u32) -> String {
        match self {
            ColumnType::TinyInt => "TINYINT".to_string(),
            ColumnType::SmallInt => "SMALLINT".to_string(),
            ColumnType::Int => "INT".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Boolean => "TINYINT(1)".to_string(),
            ColumnType::Float => "FLOAT".to_string(),
            ColumnType::Double => "DOUBLE".to_string(),
            ColumnType::Decimal(precision, scale) => format!("DECIMAL({},{})", precision, scale),
            ColumnType::Char => format!("CHAR({})", length.unwrap_or(1)),
            ColumnType::Varchar => format!("VARCHAR({})", length.unwrap_or(default_length)),
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::LongText => "LONGTEXT".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::DateTime => "DATETIME".to_string(),
            ColumnType::Timestamp => "TIMESTAMP".to_string(),
            ColumnType::Time => "TIME".to_string(),
            ColumnType::Json => "JSON".to_string(),
            ColumnType::Blob => "BLOB".to_string(),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ColumnType::TinyInt | ColumnType::SmallInt | ColumnType::Int | ColumnType::BigInt
        )
    }
}

/// Referential action for foreign keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferentialAction {
    Cascade,
    SetNull,
    Restrict,
    NoAction,
}

impl fmt::Display for ReferentialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferentialAction::Cascade => write!(f, "CASCADE"),
            ReferentialAction::SetNull => write!(f, "SET NULL"),
            ReferentialAction::Restrict => write!(f, "RESTRICT"),
            ReferentialAction::NoAction => write!(f, "NO ACTION"),
        }
    }
}

/// Column descriptor derived from one entity field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub field_name: String,
    pub db_name: String,
    pub column_type: ColumnType,
    pub length: Option<u32>,
    pub nullable: bool,
    pub unsigned: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    /// SQL literal used as the column default
    pub default: Option<String>,
    pub timestamp_create: bool,
    pub timestamp_update: bool,
}

impl ColumnDef {
    pub fn new(field_name: impl Into<String>, column_type: ColumnType) -> Self {
        let field_name = field_name.into();
        Self {
            db_name: field_name.clone(),
            field_name,
            column_type,
            length: None,
            nullable: false,
            unsigned: false,
            unique: false,
            primary_key: false,
            auto_increment: false,
            default: None,
            timestamp_create: false,
            timestamp_update: false,
        }
    }

    /// Override the database column name.
    pub fn name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = db_name.into();
        self
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn default_value(mut self, literal: impl Into<String>) -> Self {
        self.default = Some(literal.into());
        self
    }

    /// Stamped once when the row is inserted.
    pub fn created_at(mut self) -> Self {
        self.timestamp_create = true;
        self
    }

    /// Stamped on every write; the database refreshes it on update too.
    pub fn updated_at(mut self) -> Self {
        self.timestamp_update = true;
        self
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some() || self.timestamp_create || self.timestamp_update
    }

    /// Type portion of the definition, e.g. `INT UNSIGNED`.
    pub fn type_sql(&self, default_length: u32) -> String {
        let mut sql = self.column_type.to_sql(self.length, default_length);
        if self.unsigned {
            sql.push_str(" UNSIGNED");
        }
        sql
    }

    /// Full column definition as used by `CREATE TABLE` and `ALTER TABLE`.
    pub fn definition_sql(&self, default_length: u32) -> String {
        let mut def = format!("{} {}", self.db_name, self.type_sql(default_length));

        if self.nullable && !self.primary_key {
            def.push_str(" NULL");
        } else {
            def.push_str(" NOT NULL");
        }

        if self.auto_increment {
            def.push_str(" AUTO_INCREMENT");
        }

        if let Some(default) = &self.default {
            def.push_str(&format!(" DEFAULT {}", default));
        } else if self.timestamp_create || self.timestamp_update {
            def.push_str(" DEFAULT CURRENT_TIMESTAMP");
        }

        if self.timestamp_update {
            def.push_str(" ON UPDATE CURRENT_TIMESTAMP");
        }

        def
    }

    /// Copy of this key column shaped for use as a pivot column.
    pub(crate) fn as_reference(&self, db_name: &str) -> ColumnDef {
        ColumnDef {
            field_name: db_name.to_string(),
            db_name: db_name.to_string(),
            column_type: self.column_type,
            length: self.length,
            nullable: false,
            unsigned: self.unsigned,
            unique: false,
            primary_key: false,
            auto_increment: false,
            default: None,
            timestamp_create: false,
            timestamp_update: false,
        }
    }
}

/// Table designation of an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableName {
    Explicit(String),
    /// Derived from the type name by pluralization
    Derived,
    None,
}

/// Declarative description of an entity type
#[derive(Debug, Clone)]
pub struct EntityDef {
    pub(crate) table: TableName,
    pub(crate) columns: Vec<ColumnDef>,
    pub(crate) relations: Vec<RelationDef>,
}

impl EntityDef {
    pub fn table(name: impl Into<String>) -> Self {
        Self::with_table(TableName::Explicit(name.into()))
    }

    pub fn derived() -> Self {
        Self::with_table(TableName::Derived)
    }

    /// An entity without a table; it describes to an empty descriptor set.
    pub fn unmapped() -> Self {
        Self::with_table(TableName::None)
    }

    fn with_table(table: TableName) -> Self {
        Self {
            table,
            columns: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }
}

/// Compile a `CREATE TABLE` statement; unique keys precede the primary key clause.
pub fn create_table_sql(table: &str, columns: &[ColumnDef], default_length: u32) -> String {
    let mut parts: Vec<String> = columns
        .iter()
        .map(|col| format!("    {}", col.definition_sql(default_length)))
        .collect();

    for col in columns.iter().filter(|c| c.unique && !c.primary_key) {
        parts.push(format!(
            "    UNIQUE KEY {} ({})",
            crate::naming::unique_index(table, &col.db_name),
            col.db_name
        ));
    }

    let keys: Vec<&str> = columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.db_name.as_str())
        .collect();
    if !keys.is_empty() {
        parts.push(format!("    PRIMARY KEY ({})", keys.join(", ")));
    }

    format!("CREATE TABLE IF NOT EXISTS {} (\n{}\n)", table, parts.join(",\n"))
}
