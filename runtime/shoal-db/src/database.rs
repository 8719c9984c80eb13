use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;

use crate::error::DbError;

pub const DEFAULT_FETCH_SIZE: usize = 5000;

/// One result row, keyed by column name.
pub type Row = Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryOptions {
    /// Reuse a cached prepared statement for this query text.
    pub prepare: bool,
    pub fetch_size: usize,
    /// Opaque cursor returned with the previous page.
    pub page_state: Option<String>,
    /// Keep fetching while more pages remain.
    pub auto_page: bool,
    /// Accepted for wire compatibility; neither backend has tunable consistency.
    pub consistency: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            prepare: true,
            fetch_size: DEFAULT_FETCH_SIZE,
            page_state: None,
            auto_page: false,
            consistency: None,
        }
    }
}

impl QueryOptions {
    pub fn with_page_state(mut self, page_state: Option<String>) -> Self {
        self.page_state = page_state;
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSet {
    pub rows: Vec<Row>,
    /// Zero for statements that return rows.
    pub rows_affected: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchQuery {
    pub query: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl BatchQuery {
    pub fn new(query: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            query: query.into(),
            params,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub rows: Vec<Row>,
    pub page_state: Option<String>,
    pub has_next: bool,
}

/// A database backend. Implementations must be shareable across tasks; every
/// operation takes owned arguments so it can run on its own task.
pub trait Database: Send + Sync + 'static {
    fn execute(
        &self,
        query: String,
        params: Vec<Value>,
        options: QueryOptions,
    ) -> impl Future<Output = Result<ResultSet, DbError>> + Send;

    /// Runs every query in one transaction; `rows_affected` is the total.
    fn batch(
        &self,
        queries: Vec<BatchQuery>,
        options: QueryOptions,
    ) -> impl Future<Output = Result<ResultSet, DbError>> + Send;

    /// Fetches at most `options.fetch_size` rows starting at `options.page_state`.
    fn page(
        &self,
        query: String,
        params: Vec<Value>,
        options: QueryOptions,
    ) -> impl Future<Output = Result<Page, DbError>> + Send;
}
