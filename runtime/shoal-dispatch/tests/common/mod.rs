#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{Value, json};
use shoal_db::{BatchQuery, Database, DbError, Page, QueryOptions, ResultSet, Row};
use shoal_dispatch::{Dispatcher, DispatcherConfig, LaunchError, LaunchedWorker, WorkerLauncher, WorkerStats};
use shoal_ipc::Endpoint;
use shoal_worker::{WorkerConfig, run_worker};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{oneshot, watch};

pub const PAGES: usize = 3;

/// Every query a worker database saw, tagged with the worker index.
#[derive(Clone, Default)]
pub struct QueryLog(Arc<Mutex<Vec<(usize, String)>>>);

impl QueryLog {
    fn push(&self, worker: usize, query: &str) {
        self.0.lock().push((worker, query.to_string()));
    }

    pub fn queries(&self) -> Vec<String> {
        self.0.lock().iter().map(|(_, query)| query.clone()).collect()
    }

    pub fn served_by(&self, worker: usize) -> usize {
        self.0.lock().iter().filter(|(index, _)| *index == worker).count()
    }
}

/// Answers from canned data. Queries starting with `FAIL` are rejected, and
/// pages count up to [`PAGES`] through the page state.
#[derive(Clone)]
pub struct RecordingDb {
    worker: usize,
    log: QueryLog,
}

impl Database for RecordingDb {
    async fn execute(&self, query: String, params: Vec<Value>, _: QueryOptions) -> Result<ResultSet, DbError> {
        self.log.push(self.worker, &query);
        if query.starts_with("FAIL") {
            return Err(DbError::Task(format!("rejected {query}")));
        }
        let mut row = Row::new();
        row.insert("worker".into(), json!(self.worker));
        row.insert("params".into(), Value::Array(params));
        Ok(ResultSet {
            rows: vec![row],
            rows_affected: 0,
        })
    }

    async fn batch(&self, queries: Vec<BatchQuery>, _: QueryOptions) -> Result<ResultSet, DbError> {
        if let Some(first) = queries.first() {
            self.log.push(self.worker, &first.query);
        }
        Ok(ResultSet {
            rows: Vec::new(),
            rows_affected: queries.len() as u64,
        })
    }

    async fn page(&self, query: String, _: Vec<Value>, options: QueryOptions) -> Result<Page, DbError> {
        self.log.push(self.worker, &query);
        let index = options
            .page_state
            .as_deref()
            .and_then(|state| state.parse::<usize>().ok())
            .unwrap_or(0);
        let mut row = Row::new();
        row.insert("page".into(), json!(index));
        let has_next = index + 1 < PAGES;
        Ok(Page {
            rows: vec![row],
            page_state: has_next.then(|| (index + 1).to_string()),
            has_next,
        })
    }
}

/// Runs workers as tasks in this process, each serving a [`RecordingDb`]
/// on a Unix socket under the test's temp dir.
pub struct TaskLauncher {
    socket_dir: PathBuf,
    log: QueryLog,
    gate: watch::Receiver<bool>,
    kills: Arc<Mutex<HashMap<usize, oneshot::Sender<()>>>>,
    launches: Arc<Mutex<Vec<(usize, u64)>>>,
}

/// Test-side controls for a [`TaskLauncher`].
pub struct LaunchControl {
    gate: watch::Sender<bool>,
    kills: Arc<Mutex<HashMap<usize, oneshot::Sender<()>>>>,
    launches: Arc<Mutex<Vec<(usize, u64)>>>,
    pub log: QueryLog,
}

impl LaunchControl {
    /// Lets held launches proceed.
    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    /// Stops the current incarnation of worker `index`.
    pub fn kill(&self, index: usize) -> bool {
        match self.kills.lock().remove(&index) {
            Some(kill) => kill.send(()).is_ok(),
            None => false,
        }
    }

    pub fn launches(&self, index: usize) -> usize {
        self.launches.lock().iter().filter(|(i, _)| *i == index).count()
    }
}

/// `gated` launchers hold every launch until [`LaunchControl::open_gate`].
pub fn launcher(dir: &TempDir, gated: bool) -> (TaskLauncher, LaunchControl) {
    let (gate_tx, gate_rx) = watch::channel(!gated);
    let log = QueryLog::default();
    let kills = Arc::new(Mutex::new(HashMap::new()));
    let launches = Arc::new(Mutex::new(Vec::new()));
    let launcher = TaskLauncher {
        socket_dir: dir.path().to_path_buf(),
        log: log.clone(),
        gate: gate_rx,
        kills: Arc::clone(&kills),
        launches: Arc::clone(&launches),
    };
    let control = LaunchControl {
        gate: gate_tx,
        kills,
        launches,
        log,
    };
    (launcher, control)
}

impl WorkerLauncher for TaskLauncher {
    async fn launch(&self, index: usize, generation: u64) -> Result<LaunchedWorker, LaunchError> {
        let mut gate = self.gate.clone();
        gate.wait_for(|open| *open).await.map_err(|_| LaunchError::Other {
            index,
            message: "launch gate dropped".into(),
        })?;
        self.launches.lock().push((index, generation));

        let config = WorkerConfig {
            server_id: index.to_string(),
            socket_dir: self.socket_dir.clone(),
            report_interval: Duration::from_secs(60),
            ..WorkerConfig::default()
        };
        let endpoint = Endpoint::local(&config.socket_dir, &config.server_id);
        let db = RecordingDb {
            worker: index,
            log: self.log.clone(),
        };
        let (parent_out, worker_in) = tokio::io::duplex(64 * 1024);
        let (worker_out, parent_in) = tokio::io::duplex(64 * 1024);
        let (kill_tx, kill_rx) = oneshot::channel();
        self.kills.lock().insert(index, kill_tx);

        let mut task = tokio::spawn(async move { run_worker(&config, db, worker_in, worker_out).await });
        let exited = Box::pin(async move {
            tokio::select! {
                _ = &mut task => {}
                _ = kill_rx => {}
            }
            task.abort();
        });
        Ok(LaunchedWorker {
            endpoint,
            fallback: None,
            control_in: Box::new(parent_in),
            control_out: Box::new(parent_out),
            exited,
        })
    }
}

pub fn config(workers: usize) -> DispatcherConfig {
    DispatcherConfig {
        num_workers: workers,
        poll_interval: Duration::from_millis(50),
        respawn_delay: Duration::from_millis(50),
        call_timeout: Some(Duration::from_secs(5)),
        retry_interval: Duration::from_millis(10),
        ..DispatcherConfig::default()
    }
}

/// Polls [`Dispatcher::stats`] until `check` holds, failing after five seconds.
pub async fn wait_for_stats<F>(dispatcher: &Dispatcher, check: F) -> Vec<WorkerStats>
where
    F: Fn(&[WorkerStats]) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = dispatcher.stats().await.expect("stats");
            if check(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stats condition within deadline")
}
