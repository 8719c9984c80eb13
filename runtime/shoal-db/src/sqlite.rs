//! SQLite backend. Statements run on the blocking pool.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags, Statement, params_from_iter};
use serde_json::{Number, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::database::{BatchQuery, Database, Page, QueryOptions, ResultSet, Row};
use crate::error::DbError;
use crate::paging::{decode_offset, encode_offset, paged_query};
use crate::pool::{ConnectionPool, Pooled};

const BUSY_TIMEOUT_MS: u64 = 100;

pub struct SqliteDatabase {
    path: PathBuf,
    pool: Arc<ConnectionPool<Connection>>,
}

impl SqliteDatabase {
    /// Opens (creating if needed) the database file and checks that one
    /// connection can be made.
    pub async fn open(path: impl Into<PathBuf>, max_connections: usize) -> Result<Self, DbError> {
        let path = path.into();
        let connect_path = path.clone();
        let pool = ConnectionPool::new(max_connections, move || {
            let path = connect_path.clone();
            async move { tokio::task::spawn_blocking(move || open_connection(&path)).await? }
        });
        drop(pool.acquire().await?);
        debug!(path = %path.display(), max_connections, "sqlite database opened");
        Ok(Self { path, pool })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_connection<R, F>(&self, work: F) -> Result<R, DbError>
    where
        F: FnOnce(&mut Connection) -> Result<R, DbError> + Send + 'static,
        R: Send + 'static,
    {
        let mut conn: Pooled<Connection> = self.pool.acquire().await?;
        tokio::task::spawn_blocking(move || work(&mut *conn)).await?
    }
}

fn open_connection(path: &Path) -> Result<Connection, DbError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(conn)
}

impl Database for SqliteDatabase {
    async fn execute(
        &self,
        query: String,
        params: Vec<Value>,
        options: QueryOptions,
    ) -> Result<ResultSet, DbError> {
        self.with_connection(move |conn| {
            let params = bind_params(params)?;
            run(conn, &query, &params, options.prepare)
        })
        .await
    }

    async fn batch(
        &self,
        queries: Vec<BatchQuery>,
        options: QueryOptions,
    ) -> Result<ResultSet, DbError> {
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            let mut rows_affected = 0;
            for entry in queries {
                let params = bind_params(entry.params)?;
                rows_affected += run(&tx, &entry.query, &params, options.prepare)?.rows_affected;
            }
            tx.commit()?;
            Ok(ResultSet {
                rows: Vec::new(),
                rows_affected,
            })
        })
        .await
    }

    async fn page(
        &self,
        query: String,
        params: Vec<Value>,
        options: QueryOptions,
    ) -> Result<Page, DbError> {
        let offset = decode_offset(options.page_state.as_deref())?;
        let fetch = options.fetch_size.max(1) as u64;
        self.with_connection(move |conn| {
            let mut params = bind_params(params)?;
            params.push(SqlValue::Integer(to_i64(fetch + 1)));
            params.push(SqlValue::Integer(to_i64(offset)));
            let wrapped = paged_query(&query, "?", "?");
            let mut rows = run(conn, &wrapped, &params, options.prepare)?.rows;
            let has_next = rows.len() as u64 > fetch;
            rows.truncate(fetch as usize);
            Ok(Page {
                rows,
                page_state: has_next.then(|| encode_offset(offset + fetch)),
                has_next,
            })
        })
        .await
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn run(conn: &Connection, query: &str, params: &[SqlValue], prepare: bool) -> Result<ResultSet, DbError> {
    if prepare {
        let mut stmt = conn.prepare_cached(query)?;
        collect(&mut stmt, params)
    } else {
        let mut stmt = conn.prepare(query)?;
        collect(&mut stmt, params)
    }
}

fn collect(stmt: &mut Statement<'_>, params: &[SqlValue]) -> Result<ResultSet, DbError> {
    if stmt.column_count() == 0 {
        let affected = stmt.execute(params_from_iter(params.iter()))?;
        return Ok(ResultSet {
            rows: Vec::new(),
            rows_affected: affected as u64,
        });
    }
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (index, name) in names.iter().enumerate() {
            record.insert(name.clone(), to_json(row.get_ref(index)?));
        }
        out.push(record);
    }
    Ok(ResultSet {
        rows: out,
        rows_affected: 0,
    })
}

fn bind_params(params: Vec<Value>) -> Result<Vec<SqlValue>, DbError> {
    params
        .into_iter()
        .enumerate()
        .map(|(index, value)| bind(index, value))
        .collect()
}

fn bind(index: usize, value: Value) -> Result<SqlValue, DbError> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(flag)),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                SqlValue::Integer(int)
            } else if let Some(float) = number.as_f64() {
                SqlValue::Real(float)
            } else {
                return Err(DbError::UnsupportedParam {
                    index,
                    reason: format!("{number} does not fit a sqlite number"),
                });
            }
        }
        Value::String(text) => SqlValue::Text(text),
        // Structured values are stored as JSON text.
        other @ (Value::Array(_) | Value::Object(_)) => SqlValue::Text(other.to_string()),
    })
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => Value::from(int),
        ValueRef::Real(float) => Number::from_f64(float).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(STANDARD.encode(bytes)),
    }
}
