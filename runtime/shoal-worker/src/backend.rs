//! Backend selected by configuration.

use anyhow::{Context, Result};
use serde_json::Value;
use shoal_db::{BatchQuery, Database, DbError, Page, QueryOptions, ResultSet};

use crate::config::{DbBackend, WorkerConfig};

pub enum AnyDatabase {
    #[cfg(feature = "sqlite")]
    Sqlite(shoal_db::SqliteDatabase),
    #[cfg(feature = "postgres")]
    Postgres(shoal_db::PostgresDatabase),
}

pub async fn open_database(config: &WorkerConfig) -> Result<AnyDatabase> {
    match config.backend {
        #[cfg(feature = "sqlite")]
        DbBackend::Sqlite => {
            let db = shoal_db::SqliteDatabase::open(&config.keyspace, config.db_connections)
                .await
                .with_context(|| format!("open sqlite database {}", config.keyspace))?;
            Ok(AnyDatabase::Sqlite(db))
        }
        #[cfg(feature = "postgres")]
        DbBackend::Postgres => {
            let mut pg = shoal_db::PostgresConfig::new(config.db_host.clone(), config.keyspace.clone());
            pg.port = config.db_port;
            pg.user = config.db_user.clone();
            pg.password = config.db_password.clone();
            pg.max_connections = config.db_connections;
            let db = shoal_db::PostgresDatabase::connect(pg)
                .await
                .with_context(|| format!("connect to postgres at {}:{}", config.db_host, config.db_port))?;
            Ok(AnyDatabase::Postgres(db))
        }
        #[allow(unreachable_patterns)]
        other => anyhow::bail!("backend '{}' is not compiled into this worker", other.as_str()),
    }
}

impl Database for AnyDatabase {
    async fn execute(
        &self,
        query: String,
        params: Vec<Value>,
        options: QueryOptions,
    ) -> Result<ResultSet, DbError> {
        match self {
            #[cfg(feature = "sqlite")]
            AnyDatabase::Sqlite(db) => db.execute(query, params, options).await,
            #[cfg(feature = "postgres")]
            AnyDatabase::Postgres(db) => db.execute(query, params, options).await,
        }
    }

    async fn batch(
        &self,
        queries: Vec<BatchQuery>,
        options: QueryOptions,
    ) -> Result<ResultSet, DbError> {
        match self {
            #[cfg(feature = "sqlite")]
            AnyDatabase::Sqlite(db) => db.batch(queries, options).await,
            #[cfg(feature = "postgres")]
            AnyDatabase::Postgres(db) => db.batch(queries, options).await,
        }
    }

    async fn page(
        &self,
        query: String,
        params: Vec<Value>,
        options: QueryOptions,
    ) -> Result<Page, DbError> {
        match self {
            #[cfg(feature = "sqlite")]
            AnyDatabase::Sqlite(db) => db.page(query, params, options).await,
            #[cfg(feature = "postgres")]
            AnyDatabase::Postgres(db) => db.page(query, params, options).await,
        }
    }
}
