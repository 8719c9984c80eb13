#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("parameter {index} cannot be bound: {reason}")]
    UnsupportedParam { index: usize, reason: String },
    #[error("invalid page state '{0}'")]
    InvalidPageState(String),
    #[error("database task failed: {0}")]
    Task(String),
    #[error("database is closed")]
    Closed,
}

impl From<tokio::task::JoinError> for DbError {
    fn from(err: tokio::task::JoinError) -> Self {
        DbError::Task(err.to_string())
    }
}
