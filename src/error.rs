use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("full-text index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid {field}: {reason}")]
    InvalidKey { field: &'static str, reason: String },

    /// A write would give one identifier two meanings, or change content
    /// that the active policy says must not change.
    #[error("conflict on {key}: {reason}")]
    Conflict { key: String, reason: String },

    #[error(
        "absolute index {position} in translation {translation} already \
         belongs to {holder}"
    )]
    ConstraintViolation {
        translation: String,
        position: u64,
        holder: String,
    },

    #[error(
        "embedding dimension mismatch for {table}: expected {expected}, \
         got {actual}"
    )]
    DimensionMismatch {
        table: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid input at line {line}: {reason}")]
    InvalidInput { line: usize, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}
