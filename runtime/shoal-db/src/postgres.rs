//! Postgres backend on tokio-postgres.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::BytesMut;
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, Config, NoTls, Row as PgRow, Statement};
use tracing::{debug, error};

use crate::database::{BatchQuery, Database, Page, QueryOptions, ResultSet, Row};
use crate::error::DbError;
use crate::paging::{decode_offset, encode_offset, paged_query};
use crate::pool::{ConnectionPool, Pooled};

const STATEMENT_CACHE_SIZE: usize = 128;

#[derive(Clone, Debug)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    pub max_connections: usize,
    pub connect_timeout: Duration,
}

impl PostgresConfig {
    pub fn new(host: impl Into<String>, dbname: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            dbname: dbname.into(),
            max_connections: 16,
            connect_timeout: Duration::from_secs(5),
        }
    }

    fn driver_config(&self) -> Config {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname)
            .connect_timeout(self.connect_timeout);
        if let Some(password) = &self.password {
            config.password(password);
        }
        config
    }
}

struct PgConn {
    client: Client,
    statements: HashMap<String, Statement>,
}

impl PgConn {
    async fn connect(config: Arc<Config>) -> Result<Self, DbError> {
        let (client, connection) = config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection failed");
            }
        });
        Ok(Self {
            client,
            statements: HashMap::new(),
        })
    }

    async fn statement(&mut self, query: &str, cache: bool) -> Result<Statement, DbError> {
        if !cache {
            return Ok(self.client.prepare(query).await?);
        }
        if let Some(stmt) = self.statements.get(query) {
            return Ok(stmt.clone());
        }
        let stmt = self.client.prepare(query).await?;
        if self.statements.len() >= STATEMENT_CACHE_SIZE {
            self.statements.clear();
        }
        self.statements.insert(query.to_string(), stmt.clone());
        Ok(stmt)
    }

    async fn run(&mut self, query: &str, params: Vec<Value>, cache: bool) -> Result<ResultSet, DbError> {
        let stmt = self.statement(query, cache).await?;
        let bound = bind_params(stmt.params(), params)?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        if stmt.columns().is_empty() {
            let rows_affected = self.client.execute(&stmt, &refs).await?;
            return Ok(ResultSet {
                rows: Vec::new(),
                rows_affected,
            });
        }
        let rows = self.client.query(&stmt, &refs).await?;
        Ok(ResultSet {
            rows: rows.iter().map(row_to_json).collect(),
            rows_affected: 0,
        })
    }
}

pub struct PostgresDatabase {
    pool: Arc<ConnectionPool<PgConn>>,
}

impl PostgresDatabase {
    pub async fn connect(config: PostgresConfig) -> Result<Self, DbError> {
        let driver = Arc::new(config.driver_config());
        let pool = ConnectionPool::new(config.max_connections, move || PgConn::connect(Arc::clone(&driver)));
        drop(pool.acquire().await?);
        debug!(host = %config.host, dbname = %config.dbname, "postgres database connected");
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Pooled<PgConn>, DbError> {
        loop {
            let conn = self.pool.acquire().await?;
            if conn.client.is_closed() {
                conn.discard();
                continue;
            }
            return Ok(conn);
        }
    }
}

impl Database for PostgresDatabase {
    async fn execute(
        &self,
        query: String,
        params: Vec<Value>,
        options: QueryOptions,
    ) -> Result<ResultSet, DbError> {
        let mut conn = self.conn().await?;
        conn.run(&query, params, options.prepare).await
    }

    async fn batch(
        &self,
        queries: Vec<BatchQuery>,
        options: QueryOptions,
    ) -> Result<ResultSet, DbError> {
        let mut conn = self.conn().await?;
        conn.client.batch_execute("BEGIN").await?;
        let mut rows_affected = 0;
        for entry in queries {
            match conn.run(&entry.query, entry.params, options.prepare).await {
                Ok(result) => rows_affected += result.rows_affected,
                Err(err) => {
                    if let Err(rollback) = conn.client.batch_execute("ROLLBACK").await {
                        debug!(error = %rollback, "rollback after failed batch failed");
                    }
                    return Err(err);
                }
            }
        }
        conn.client.batch_execute("COMMIT").await?;
        Ok(ResultSet {
            rows: Vec::new(),
            rows_affected,
        })
    }

    async fn page(
        &self,
        query: String,
        mut params: Vec<Value>,
        options: QueryOptions,
    ) -> Result<Page, DbError> {
        let offset = decode_offset(options.page_state.as_deref())?;
        let fetch = options.fetch_size.max(1) as u64;
        let limit_at = format!("${}", params.len() + 1);
        let offset_at = format!("${}", params.len() + 2);
        params.push(Value::from(fetch + 1));
        params.push(Value::from(offset));
        let wrapped = paged_query(&query, &limit_at, &offset_at);

        let mut conn = self.conn().await?;
        let mut rows = conn.run(&wrapped, params, options.prepare).await?.rows;
        let has_next = rows.len() as u64 > fetch;
        rows.truncate(fetch as usize);
        Ok(Page {
            rows,
            page_state: has_next.then(|| encode_offset(offset + fetch)),
            has_next,
        })
    }
}

/// A JSON parameter converted to the type the server expects for its slot.
#[derive(Debug)]
enum PgParam {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl ToSql for PgParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            PgParam::Null => Ok(IsNull::Yes),
            PgParam::Bool(v) => v.to_sql(ty, out),
            PgParam::I16(v) => v.to_sql(ty, out),
            PgParam::I32(v) => v.to_sql(ty, out),
            PgParam::I64(v) => v.to_sql(ty, out),
            PgParam::F32(v) => v.to_sql(ty, out),
            PgParam::F64(v) => v.to_sql(ty, out),
            PgParam::Text(v) => v.to_sql(ty, out),
            PgParam::Bytes(v) => v.to_sql(ty, out),
            PgParam::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind_params(types: &[Type], params: Vec<Value>) -> Result<Vec<PgParam>, DbError> {
    if types.len() != params.len() {
        return Err(DbError::UnsupportedParam {
            index: params.len(),
            reason: format!("statement expects {} parameters, got {}", types.len(), params.len()),
        });
    }
    params
        .into_iter()
        .zip(types)
        .enumerate()
        .map(|(index, (value, ty))| bind(index, value, ty))
        .collect()
}

fn bind(index: usize, value: Value, ty: &Type) -> Result<PgParam, DbError> {
    let unsupported = |value: &Value| DbError::UnsupportedParam {
        index,
        reason: format!("cannot bind {value} as {ty}"),
    };
    if value.is_null() {
        return Ok(PgParam::Null);
    }
    if *ty == Type::JSON || *ty == Type::JSONB {
        return Ok(PgParam::Json(value));
    }
    let param = if *ty == Type::BOOL {
        value.as_bool().map(PgParam::Bool)
    } else if *ty == Type::INT2 {
        value.as_i64().and_then(|v| i16::try_from(v).ok()).map(PgParam::I16)
    } else if *ty == Type::INT4 {
        value.as_i64().and_then(|v| i32::try_from(v).ok()).map(PgParam::I32)
    } else if *ty == Type::INT8 {
        value.as_i64().map(PgParam::I64)
    } else if *ty == Type::FLOAT4 {
        value.as_f64().map(|v| PgParam::F32(v as f32))
    } else if *ty == Type::FLOAT8 {
        value.as_f64().map(PgParam::F64)
    } else if *ty == Type::BYTEA {
        value.as_str().and_then(|v| STANDARD.decode(v).ok()).map(PgParam::Bytes)
    } else {
        match &value {
            Value::String(text) => Some(PgParam::Text(text.clone())),
            Value::Number(_) | Value::Bool(_) => Some(PgParam::Text(value.to_string())),
            _ => None,
        }
    };
    param.ok_or_else(|| unsupported(&value))
}

fn row_to_json(row: &PgRow) -> Row {
    let mut record = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        record.insert(column.name().to_string(), column_value(row, index, column.type_()));
    }
    record
}

fn column_value(row: &PgRow, index: usize, ty: &Type) -> Value {
    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(index).map(|v| v.map(Value::Bool))
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(index).map(|v| v.map(Value::from))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(index).map(|v| v.map(Value::from))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(index).map(|v| v.map(Value::from))
    } else if *ty == Type::OID {
        row.try_get::<_, Option<u32>>(index).map(|v| v.map(Value::from))
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(index)
            .map(|v| v.and_then(|f| Number::from_f64(f64::from(f))).map(Value::Number))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(index)
            .map(|v| v.and_then(Number::from_f64).map(Value::Number))
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        row.try_get::<_, Option<Value>>(index)
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(index)
            .map(|v| v.map(|bytes| Value::String(STANDARD.encode(bytes))))
    } else {
        row.try_get::<_, Option<String>>(index).map(|v| v.map(Value::String))
    };
    match value {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        Err(err) => {
            debug!(column = index, %ty, error = %err, "column type has no JSON mapping");
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_follow_the_statement_types() {
        let bound = bind_params(
            &[Type::INT4, Type::TEXT, Type::BYTEA, Type::JSONB, Type::INT8],
            vec![json!(7), json!("a"), json!("aGk="), json!({"k": 1}), json!(null)],
        )
        .expect("bind");
        assert!(matches!(bound[0], PgParam::I32(7)));
        assert!(matches!(&bound[1], PgParam::Text(text) if text == "a"));
        assert!(matches!(&bound[2], PgParam::Bytes(bytes) if bytes == b"hi"));
        assert!(matches!(bound[3], PgParam::Json(_)));
        assert!(matches!(bound[4], PgParam::Null));
    }

    #[test]
    fn mismatched_params_are_rejected() {
        let err = bind_params(&[Type::INT2], vec![json!(70000)]).expect_err("overflow");
        assert!(matches!(err, DbError::UnsupportedParam { index: 0, .. }));
        assert!(bind_params(&[Type::INT4], vec![]).is_err());
        assert!(bind_params(&[Type::BOOL], vec![json!("yes")]).is_err());
    }
}
