use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GriddleError {
    #[error("Database is not syncable: {0}")]
    NotSyncable(String),

    #[error("Primary store error: {0}")]
    Store(String),

    #[error("Search index error: {0}")]
    Search(String),

    #[error("Bulk write failed ({attempted} operations): {reason}")]
    BulkFailed { attempted: usize, reason: String },

    #[error("Migration failed for {database}: {reason}")]
    Migration { database: String, reason: String },

    #[error("Invalid index metadata on {0}")]
    InvalidMetadata(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, GriddleError>;

impl From<serde_json::Error> for GriddleError {
    fn from(e: serde_json::Error) -> Self {
        GriddleError::Json(e.to_string())
    }
}

impl GriddleError {
    pub fn migration(database: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        GriddleError::Migration {
            database: database.into(),
            reason: reason.to_string(),
        }
    }
}
