//! Admission-controlled front for a [`Database`].

use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::admission::{AdmissionQueue, OperationKind};
use crate::database::{BatchQuery, Database, Page, QueryOptions, ResultSet};
use crate::error::DbError;
use crate::stats::{LatencyWindow, RequestRate};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 32768;

type Reply<T> = oneshot::Sender<Result<T, DbError>>;

enum Job {
    Execute {
        query: String,
        params: Vec<Value>,
        options: QueryOptions,
        reply: Reply<ResultSet>,
    },
    Batch {
        queries: Vec<BatchQuery>,
        options: QueryOptions,
        reply: Reply<ResultSet>,
    },
    Page {
        query: String,
        params: Vec<Value>,
        options: QueryOptions,
        reply: Reply<Page>,
    },
}

impl Job {
    fn kind(&self) -> OperationKind {
        match self {
            Job::Execute { .. } => OperationKind::Execute,
            Job::Batch { .. } => OperationKind::Batch,
            Job::Page { .. } => OperationKind::GetPage,
        }
    }
}

struct Inner<D> {
    db: Arc<D>,
    admission: Mutex<AdmissionQueue<Job>>,
    next_slot: AtomicUsize,
    latency: Mutex<LatencyWindow>,
    requests: Mutex<RequestRate>,
}

/// Slot held by one admitted operation. Dropping it records the latency and
/// admits whatever was waiting, even if the operation's task was torn down.
struct InFlight<D: Database> {
    inner: Arc<Inner<D>>,
    slot: usize,
    started: Instant,
}

impl<D: Database> Drop for InFlight<D> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        self.inner.latency.lock().record(elapsed);
        trace!(slot = self.slot, elapsed_ms = elapsed.as_millis() as u64, "query slot released");
        let admitted = self.inner.admission.lock().complete();
        for job in admitted {
            launch(&self.inner, job);
        }
    }
}

fn launch<D: Database>(inner: &Arc<Inner<D>>, job: Job) {
    let max = inner.admission.lock().max_in_flight();
    let ticket = InFlight {
        inner: Arc::clone(inner),
        slot: inner.next_slot.fetch_add(1, Ordering::Relaxed) % max,
        started: Instant::now(),
    };
    let db = Arc::clone(&inner.db);
    tokio::spawn(async move {
        let kind = job.kind();
        let failure = match job {
            Job::Execute {
                query,
                params,
                options,
                reply,
            } => settle(reply, db.execute(query, params, options).await),
            Job::Batch {
                queries,
                options,
                reply,
            } => settle(reply, db.batch(queries, options).await),
            Job::Page {
                query,
                params,
                options,
                reply,
            } => settle(reply, db.page(query, params, options).await),
        };
        if let Some(err) = failure {
            warn!(slot = ticket.slot, kind = kind.as_str(), error = %err, "query failed");
        }
        drop(ticket);
    });
}

/// Hands the outcome to the caller, returning the error text for logging.
fn settle<T>(reply: Reply<T>, outcome: Result<T, DbError>) -> Option<String> {
    let failure = outcome.as_ref().err().map(ToString::to_string);
    let _ = reply.send(outcome);
    failure
}

pub struct QueryExecutor<D> {
    inner: Arc<Inner<D>>,
}

impl<D> Clone for QueryExecutor<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Database> QueryExecutor<D> {
    pub fn new(db: D, max_in_flight: usize) -> Self {
        Self::from_shared(Arc::new(db), max_in_flight)
    }

    pub fn from_shared(db: Arc<D>, max_in_flight: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                admission: Mutex::new(AdmissionQueue::new(max_in_flight)),
                next_slot: AtomicUsize::new(0),
                latency: Mutex::new(LatencyWindow::new()),
                requests: Mutex::new(RequestRate::new()),
            }),
        }
    }

    pub fn database(&self) -> &Arc<D> {
        &self.inner.db
    }

    // Each operation is queued when called, not when the returned future is
    // first polled, so submission order is call order.

    pub fn execute(
        &self,
        query: String,
        params: Vec<Value>,
        options: QueryOptions,
    ) -> impl Future<Output = Result<ResultSet, DbError>> + Send + use<D> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Execute {
            query,
            params,
            options,
            reply,
        });
        outcome(rx)
    }

    pub fn batch(
        &self,
        queries: Vec<BatchQuery>,
        options: QueryOptions,
    ) -> impl Future<Output = Result<ResultSet, DbError>> + Send + use<D> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Batch {
            queries,
            options,
            reply,
        });
        outcome(rx)
    }

    pub fn get_page(
        &self,
        query: String,
        params: Vec<Value>,
        options: QueryOptions,
    ) -> impl Future<Output = Result<Page, DbError>> + Send + use<D> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Page {
            query,
            params,
            options,
            reply,
        });
        outcome(rx)
    }

    /// Operations currently running against the database.
    pub fn concurrent(&self) -> usize {
        self.inner.admission.lock().in_flight()
    }

    pub fn queued(&self) -> usize {
        self.inner.admission.lock().queued()
    }

    pub fn record_request(&self) {
        self.inner.requests.lock().record(Instant::now());
    }

    pub fn request_rate(&self) -> f64 {
        self.inner.requests.lock().per_second(Instant::now())
    }

    pub fn average_query_time(&self) -> f64 {
        self.inner.latency.lock().average_ms()
    }

    fn submit(&self, job: Job) {
        let kind = job.kind();
        let admitted = self.inner.admission.lock().submit(kind, job);
        if let Some(job) = admitted {
            launch(&self.inner, job);
        }
    }
}

async fn outcome<T>(rx: oneshot::Receiver<Result<T, DbError>>) -> Result<T, DbError> {
    rx.await.map_err(|_| DbError::Closed)?
}
