use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No {table} row found for key {key}")]
    NotFound { table: String, key: String },

    #[error("Query error: {0}")]
    Query(String),

    #[error("Hydration error: {0}")]
    Hydration(String),

    #[error("Relation not loaded: {0}")]
    RelationNotLoaded(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Migration ledger table {0} does not exist")]
    LedgerMissing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueryError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        QueryError::Config(message.into())
    }

    /// True for insert conflicts on a unique or primary key.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, QueryError::DuplicateKey(_))
    }
}

#[cfg(feature = "mysql")]
impl From<sqlx::Error> for QueryError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                QueryError::DuplicateKey(db.message().to_string())
            }
            _ => QueryError::Database(err.to_string()),
        }
    }
}
