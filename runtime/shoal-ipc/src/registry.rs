use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::envelope::Reply;
use crate::error::{ErrorCode, RemoteError};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Reply, RemoteError>> + Send>>;

/// A registered method.
///
/// The closure itself is invoked on the connection's read loop, in arrival
/// order; only the future it returns runs concurrently with later calls.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("method '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl From<RegistryError> for RemoteError {
    fn from(err: RegistryError) -> Self {
        RemoteError::new(ErrorCode::MethodAlreadyRegistered, err.to_string())
    }
}

#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Handler>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, RemoteError>> + Send + 'static,
    {
        let name = name.into();
        if self.methods.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        let handler: Handler = Arc::new(move |params| Box::pin(handler(params)) as HandlerFuture);
        self.methods.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("MethodRegistry").field("methods", &names).finish()
    }
}
