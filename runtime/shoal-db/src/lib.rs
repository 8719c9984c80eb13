//! Database access for shoal workers: a backend-neutral [`Database`] trait,
//! the sqlite and Postgres backends, and the admission-controlled
//! [`QueryExecutor`] that fronts them.

mod admission;
mod database;
mod error;
mod executor;
mod paging;
mod pool;
mod stats;

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use admission::{AdmissionQueue, DRAIN_ORDER, OperationKind};
pub use database::{BatchQuery, DEFAULT_FETCH_SIZE, Database, Page, QueryOptions, ResultSet, Row};
pub use error::DbError;
pub use executor::{DEFAULT_MAX_IN_FLIGHT, QueryExecutor};
pub use pool::{ConnectFuture, ConnectionPool, Pooled};
pub use stats::{
    LATENCY_WINDOW, LatencyReport, LatencyWindow, RATE_WINDOW, RequestRate, SLOW_QUERY_MS,
};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresDatabase};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDatabase;
