//! Bounded async pool of database connections.

use parking_lot::Mutex;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

use crate::error::DbError;

pub type ConnectFuture<T> = Pin<Box<dyn Future<Output = Result<T, DbError>> + Send>>;

pub struct ConnectionPool<T> {
    max: usize,
    connect: Box<dyn Fn() -> ConnectFuture<T> + Send + Sync>,
    idle: Mutex<Vec<T>>,
    available: Notify,
    open: AtomicUsize,
}

/// A checked-out connection; goes back to the pool on drop.
pub struct Pooled<T> {
    pool: Arc<ConnectionPool<T>>,
    value: Option<T>,
}

impl<T> ConnectionPool<T> {
    pub fn new<F, Fut>(max: usize, connect: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, DbError>> + Send + 'static,
    {
        Arc::new(Self {
            max: max.max(1),
            connect: Box::new(move || Box::pin(connect()) as ConnectFuture<T>),
            idle: Mutex::new(Vec::new()),
            available: Notify::new(),
            open: AtomicUsize::new(0),
        })
    }

    /// Reuses an idle connection, opens a new one under the cap, or waits.
    pub async fn acquire(self: &Arc<Self>) -> Result<Pooled<T>, DbError> {
        loop {
            if let Some(item) = self.idle.lock().pop() {
                return Ok(self.wrap(item));
            }
            let reserved = self
                .open
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                    (open < self.max).then_some(open + 1)
                })
                .is_ok();
            if reserved {
                return match (self.connect)().await {
                    Ok(item) => Ok(self.wrap(item)),
                    Err(err) => {
                        self.open.fetch_sub(1, Ordering::SeqCst);
                        self.available.notify_one();
                        Err(err)
                    }
                };
            }
            self.available.notified().await;
        }
    }

    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn wrap(self: &Arc<Self>, item: T) -> Pooled<T> {
        Pooled {
            pool: Arc::clone(self),
            value: Some(item),
        }
    }

    fn release(&self, item: T) {
        self.idle.lock().push(item);
        self.available.notify_one();
    }

    fn forget(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }
}

impl<T> Pooled<T> {
    /// Closes the connection instead of returning it, freeing its slot.
    pub fn discard(mut self) {
        if self.value.take().is_some() {
            self.pool.forget();
        }
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled connection already released")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled connection already released")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.value.take() {
            self.pool.release(item);
        }
    }
}
