//! Channel methods a worker serves.

use serde::Serialize;
use serde_json::{Value, json};
use shoal_db::{BatchQuery, Database, DbError, QueryExecutor, QueryOptions};
use shoal_ipc::{HandlerFuture, MethodRegistry, RegistryError, RemoteError, Reply};
use std::fmt;
use std::future::{Future, ready};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerMethod {
    Execute,
    Batch,
    GetPage,
    GetConcurrent,
    CountRequest,
}

impl WorkerMethod {
    pub const ALL: [WorkerMethod; 5] = [
        WorkerMethod::Execute,
        WorkerMethod::Batch,
        WorkerMethod::GetPage,
        WorkerMethod::GetConcurrent,
        WorkerMethod::CountRequest,
    ];

    /// Name on the wire.
    pub fn name(self) -> &'static str {
        match self {
            WorkerMethod::Execute => "execute",
            WorkerMethod::Batch => "batch",
            WorkerMethod::GetPage => "getPage",
            WorkerMethod::GetConcurrent => "getConcurrent",
            WorkerMethod::CountRequest => "countRequest",
        }
    }
}

impl fmt::Display for WorkerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WorkerMethod {
    type Err = RemoteError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        WorkerMethod::ALL
            .into_iter()
            .find(|method| method.name() == name)
            .ok_or_else(|| RemoteError::method_not_found(name))
    }
}

/// Registers every [`WorkerMethod`] against `executor`.
pub fn register_methods<D: Database>(
    registry: &mut MethodRegistry,
    executor: QueryExecutor<D>,
) -> Result<(), RegistryError> {
    for method in WorkerMethod::ALL {
        let executor = executor.clone();
        registry.register(method.name(), move |params| handle(method, &executor, params))?;
    }
    Ok(())
}

/// Decodes the params and submits the operation before returning, so calls
/// reach the executor in arrival order.
fn handle<D: Database>(method: WorkerMethod, executor: &QueryExecutor<D>, params: Vec<Value>) -> HandlerFuture {
    match method {
        WorkerMethod::Execute => match QueryArgs::decode(params) {
            Ok(args) => {
                executor.record_request();
                reply_with(executor.execute(args.query, args.params, args.options))
            }
            Err(err) => Box::pin(ready(Err(err))),
        },
        WorkerMethod::Batch => match BatchArgs::decode(params) {
            Ok(args) => {
                executor.record_request();
                reply_with(executor.batch(args.queries, args.options))
            }
            Err(err) => Box::pin(ready(Err(err))),
        },
        WorkerMethod::GetPage => match QueryArgs::decode(params) {
            Ok(args) => {
                executor.record_request();
                reply_with(executor.get_page(args.query, args.params, args.options))
            }
            Err(err) => Box::pin(ready(Err(err))),
        },
        WorkerMethod::GetConcurrent => Box::pin(ready(Ok(Reply::ok(json!(executor.concurrent()))))),
        WorkerMethod::CountRequest => Box::pin(ready(Ok(Reply::ok(json!(executor.request_rate()))))),
    }
}

fn reply_with<T, F>(operation: F) -> HandlerFuture
where
    T: Serialize,
    F: Future<Output = Result<T, DbError>> + Send + 'static,
{
    Box::pin(async move {
        let outcome = operation
            .await
            .map_err(|err| RemoteError::database(err.to_string()))?;
        let value = serde_json::to_value(&outcome)
            .map_err(|err| RemoteError::new(shoal_ipc::ErrorCode::Internal, err.to_string()))?;
        Ok(Reply::ok(value))
    })
}

/// `[query, params?, options?]`
#[derive(Debug, PartialEq)]
pub struct QueryArgs {
    pub query: String,
    pub params: Vec<Value>,
    pub options: QueryOptions,
}

impl QueryArgs {
    pub fn decode(params: Vec<Value>) -> Result<Self, RemoteError> {
        let mut args = params.into_iter();
        let query = match args.next() {
            Some(Value::String(query)) => query,
            _ => return Err(RemoteError::invalid_params("first parameter must be the query string")),
        };
        let params = match args.next() {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(values)) => values,
            Some(_) => return Err(RemoteError::invalid_params("query parameters must be an array")),
        };
        let options = decode_options(args.next())?;
        Ok(Self {
            query,
            params,
            options,
        })
    }
}

/// `[queries, options?]` where each query is `{query, params?}`.
#[derive(Debug, PartialEq)]
pub struct BatchArgs {
    pub queries: Vec<BatchQuery>,
    pub options: QueryOptions,
}

impl BatchArgs {
    pub fn decode(params: Vec<Value>) -> Result<Self, RemoteError> {
        let mut args = params.into_iter();
        let queries = match args.next() {
            Some(value @ Value::Array(_)) => serde_json::from_value::<Vec<BatchQuery>>(value)
                .map_err(|err| RemoteError::invalid_params(format!("invalid batch entry: {err}")))?,
            _ => return Err(RemoteError::invalid_params("first parameter must be an array of queries")),
        };
        let options = decode_options(args.next())?;
        Ok(Self { queries, options })
    }
}

fn decode_options(value: Option<Value>) -> Result<QueryOptions, RemoteError> {
    match value {
        None | Some(Value::Null) => Ok(QueryOptions::default()),
        Some(value) => serde_json::from_value(value)
            .map_err(|err| RemoteError::invalid_params(format!("invalid query options: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_ipc::ErrorCode;

    #[test]
    fn method_names_round_trip() {
        for method in WorkerMethod::ALL {
            assert_eq!(method.name().parse::<WorkerMethod>().expect("known"), method);
        }
        let err = "drop".parse::<WorkerMethod>().expect_err("unknown");
        assert_eq!(err.code, ErrorCode::MethodNotFound);
    }

    #[test]
    fn query_args_fill_in_defaults() {
        let args = QueryArgs::decode(vec![json!("SELECT 1")]).expect("decode");
        assert!(args.params.is_empty());
        assert_eq!(args.options, QueryOptions::default());

        let args = QueryArgs::decode(vec![json!("SELECT ?"), json!([4]), json!({"fetchSize": 10})])
            .expect("decode");
        assert_eq!(args.params, vec![json!(4)]);
        assert_eq!(args.options.fetch_size, 10);
    }

    #[test]
    fn malformed_params_are_invalid() {
        for bad in [
            vec![],
            vec![json!(1)],
            vec![json!("SELECT 1"), json!("not an array")],
            vec![json!("SELECT 1"), json!([]), json!({"fetchSize": "lots"})],
        ] {
            let err = QueryArgs::decode(bad).expect_err("invalid");
            assert_eq!(err.code, ErrorCode::InvalidParams);
        }
        let err = BatchArgs::decode(vec![json!([{"params": []}])]).expect_err("missing query");
        assert_eq!(err.code, ErrorCode::InvalidParams);
    }

    #[test]
    fn batch_args_decode_entries() {
        let args = BatchArgs::decode(vec![json!([
            {"query": "INSERT INTO t VALUES (?)", "params": [1]},
            {"query": "DELETE FROM t"}
        ])])
        .expect("decode");
        assert_eq!(args.queries.len(), 2);
        assert!(args.queries[1].params.is_empty());
    }
}
